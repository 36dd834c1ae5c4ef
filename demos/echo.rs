//! Echo over a connection pool
//!
//! Starts an echo server on localhost, then dials several TCP connections to
//! it and joins them into one client session. The server groups every
//! incoming connection into a single session as well, so streams are spread
//! over all of them.

use pool_mux::{Config, PlainObfuscator, Session, Stream};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tracing::{error, info};

/// Physical connections the client dials
const CONNECTIONS: usize = 3;

/// Concurrent streams the client opens
const STREAMS: usize = 8;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter("info,pool_mux=debug")
        .init();

    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    info!("Echo server listening on {}", addr);

    tokio::spawn(async move {
        if let Err(e) = serve(listener).await {
            error!("Echo server stopped: {}", e);
        }
    });

    let client = Session::new(
        1,
        TcpStream::connect(addr).await?,
        Arc::new(PlainObfuscator),
        Config::client(),
    )?;
    for _ in 1..CONNECTIONS {
        client.add_connection(TcpStream::connect(addr).await?)?;
    }
    info!("Client session dialed {} connections", CONNECTIONS);

    let mut tasks = Vec::new();
    for i in 0..STREAMS {
        let client = client.clone();
        tasks.push(tokio::spawn(async move { round_trip(&client, i).await }));
    }
    for task in tasks {
        task.await??;
    }

    info!("Connection loads at exit: {:?}", client.connection_loads().await?);
    client.close().await;
    Ok(())
}

/// Send one message on a fresh stream and wait for the echo
async fn round_trip(client: &Session, i: usize) -> pool_mux::Result<()> {
    let stream = client.open_stream().await?;
    let message = format!("Hello #{} over stream {}", i, stream.id());
    stream.write(message.as_bytes()).await?;

    let mut echoed = Vec::with_capacity(message.len());
    let mut buf = vec![0u8; 1024];
    while echoed.len() < message.len() {
        let n = stream.read(&mut buf).await?;
        echoed.extend_from_slice(&buf[..n]);
    }
    info!("Stream {} echoed: {}", stream.id(), String::from_utf8_lossy(&echoed));

    stream.close().await
}

/// Accept connections into one session and echo every stream on it
async fn serve(listener: TcpListener) -> pool_mux::Result<()> {
    let (first, peer) = listener.accept().await?;
    info!("First connection from {}", peer);
    let session = Session::new(2, first, Arc::new(PlainObfuscator), Config::server())?;

    let pool = session.clone();
    tokio::spawn(async move {
        while let Ok((conn, peer)) = listener.accept().await {
            info!("Adding connection from {}", peer);
            if pool.add_connection(conn).is_err() {
                break;
            }
        }
    });

    loop {
        let stream = session.accept_stream().await?;
        info!("Accepted stream {}", stream.id());
        tokio::spawn(echo(stream));
    }
}

async fn echo(stream: Stream) {
    let mut buf = vec![0u8; 4096];
    while let Ok(n) = stream.read(&mut buf).await {
        if let Err(e) = stream.write(&buf[..n]).await {
            error!("Stream {}: echo failed: {}", stream.id(), e);
            break;
        }
    }
    info!("Stream {} finished", stream.id());
}
