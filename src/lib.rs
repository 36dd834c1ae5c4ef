//! Stream multiplexing over a pool of physical connections
//!
//! This crate takes any number of independently established connections to
//! the same peer and presents them as one [`Session`]. Callers open and accept
//! ordered, bidirectional [`Stream`]s; outbound data is load-balanced across
//! whichever connections are currently alive, and inbound frames are routed
//! back to their streams. Connections can be added at any time and are
//! dropped from the pool as soon as they fail.
//!
//! What goes on the wire is decided by an [`Obfuscator`]: the session hands
//! it [`Frame`]s to serialize and asks it to find unit boundaries in received
//! bytes, never looking inside the units itself.
//!
//! # Architecture
//!
//! ```text
//! Application
//!     ↓
//! Session / Stream (stream multiplexing)
//!     ↓
//! Switchboard (least-loaded dispatch, frame routing)
//!     ↓
//! Obfuscator (encryption / record framing)
//!     ↓
//! physical connections (TCP, TLS, ...)
//! ```
//!
//! # Example Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use pool_mux::{Config, PlainObfuscator, Session};
//! use tokio::net::TcpStream;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let first = TcpStream::connect("10.0.0.1:7000").await?;
//!     let session = Session::new(1, first, Arc::new(PlainObfuscator), Config::client())?;
//!
//!     // More connections to the same peer widen the pool
//!     session.add_connection(TcpStream::connect("10.0.0.1:7000").await?)?;
//!
//!     let stream = session.open_stream().await?;
//!     stream.write(b"hello").await?;
//!
//!     let mut buf = vec![0u8; 1024];
//!     let n = stream.read(&mut buf).await?;
//!     println!("{}", String::from_utf8_lossy(&buf[..n]));
//!
//!     stream.close().await?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod frame;
pub mod obfs;
pub mod session;
pub mod stream;
pub mod switchboard;

// Re-export main types
pub use config::{Config, Role};
pub use error::{Error, Result};
pub use frame::{Frame, CONTROL_STREAM_ID, MAX_PAYLOAD_SIZE};
pub use obfs::{Obfuscator, PlainObfuscator};
pub use session::Session;
pub use stream::{Stream, StreamState};
pub use switchboard::Transport;
