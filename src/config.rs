//! Session configuration.
//!
//! All knobs have defaults tuned for a handful of physical connections
//! carrying a few thousand streams. Both peers must agree on [`Role`]s
//! (one `Client`, one `Server`) so their stream IDs never collide.

use crate::error::{Error, Result};
use crate::frame::MAX_PAYLOAD_SIZE;
use std::time::Duration;

/// Pending remote-opened streams waiting for `accept_stream`.
pub const DEFAULT_ACCEPT_BACKLOG: usize = 1024;

/// Serialized writes waiting for the switchboard.
pub const DEFAULT_DISPATCH_BACKLOG: usize = 102_400;

/// Largest payload put into a single outbound frame.
pub const DEFAULT_MAX_FRAME_PAYLOAD: usize = 16 * 1024;

/// Upper bound on concurrently open streams in one session.
pub const DEFAULT_MAX_STREAMS: usize = 65_536;

/// How many closed remote stream IDs are remembered to drop late frames.
pub const DEFAULT_RETIRED_IDS: usize = 1024;

/// Initial capacity of each connection's receive buffer.
pub const DEFAULT_READ_BUFFER_SIZE: usize = 20_480;

/// Close notices that may wait to ride on outgoing data frames.
pub const DEFAULT_CLOSE_BACKLOG: usize = 512;

/// How long a queued close notice waits for a data frame before it is sent alone.
pub const DEFAULT_CLOSE_LINGER: Duration = Duration::from_millis(10);

/// Which half of the stream-ID space this side allocates from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Opens odd stream IDs (1, 3, 5, ...)
    Client,
    /// Opens even stream IDs (2, 4, 6, ...)
    Server,
}

impl Role {
    /// First stream ID this side hands out. ID 0 is reserved for control frames.
    pub fn first_stream_id(self) -> u32 {
        match self {
            Role::Client => 1,
            Role::Server => 2,
        }
    }

    /// Whether `id` belongs to the half of the ID space this side allocates.
    pub fn owns(self, id: u32) -> bool {
        match self {
            Role::Client => id % 2 == 1,
            Role::Server => id != 0 && id % 2 == 0,
        }
    }
}

/// Tunables for a [`Session`](crate::Session)
#[derive(Debug, Clone)]
pub struct Config {
    /// Stream-ID partition for locally opened streams
    pub role: Role,

    /// Capacity of the accept queue
    pub accept_backlog: usize,

    /// Capacity of the session-wide outbound queue; writers wait when it is full
    pub dispatch_backlog: usize,

    /// Writes are fragmented into frames of at most this many payload bytes
    pub max_frame_payload: usize,

    /// Maximum number of live streams in the stream table
    pub max_streams: usize,

    /// Size of the closed-stream memory used to drop late frames
    pub retired_ids: usize,

    /// Initial receive buffer capacity per physical connection
    pub read_buffer_size: usize,

    /// Capacity of the queue of close notices waiting for a data frame;
    /// zero sends every notice as its own control frame
    pub close_backlog: usize,

    /// Wait before a queued close notice goes out on its own
    pub close_linger: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            role: Role::Client,
            accept_backlog: DEFAULT_ACCEPT_BACKLOG,
            dispatch_backlog: DEFAULT_DISPATCH_BACKLOG,
            max_frame_payload: DEFAULT_MAX_FRAME_PAYLOAD,
            max_streams: DEFAULT_MAX_STREAMS,
            retired_ids: DEFAULT_RETIRED_IDS,
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
            close_backlog: DEFAULT_CLOSE_BACKLOG,
            close_linger: DEFAULT_CLOSE_LINGER,
        }
    }
}

impl Config {
    /// Defaults for the side that dials the physical connections
    pub fn client() -> Self {
        Self::default()
    }

    /// Defaults for the side that accepts the physical connections
    pub fn server() -> Self {
        Self {
            role: Role::Server,
            ..Self::default()
        }
    }

    pub fn with_accept_backlog(mut self, backlog: usize) -> Self {
        self.accept_backlog = backlog;
        self
    }

    pub fn with_dispatch_backlog(mut self, backlog: usize) -> Self {
        self.dispatch_backlog = backlog;
        self
    }

    pub fn with_max_frame_payload(mut self, size: usize) -> Self {
        self.max_frame_payload = size;
        self
    }

    pub fn with_max_streams(mut self, max: usize) -> Self {
        self.max_streams = max;
        self
    }

    pub fn with_retired_ids(mut self, count: usize) -> Self {
        self.retired_ids = count;
        self
    }

    pub fn with_read_buffer_size(mut self, size: usize) -> Self {
        self.read_buffer_size = size;
        self
    }

    pub fn with_close_backlog(mut self, backlog: usize) -> Self {
        self.close_backlog = backlog;
        self
    }

    pub fn with_close_linger(mut self, linger: Duration) -> Self {
        self.close_linger = linger;
        self
    }

    /// Check that every value is usable
    pub fn validate(&self) -> Result<()> {
        if self.accept_backlog == 0 {
            return Err(Error::InvalidConfig("accept_backlog must be non-zero".into()));
        }
        if self.dispatch_backlog == 0 {
            return Err(Error::InvalidConfig("dispatch_backlog must be non-zero".into()));
        }
        if self.max_frame_payload == 0 || self.max_frame_payload > MAX_PAYLOAD_SIZE {
            return Err(Error::InvalidConfig(format!(
                "max_frame_payload must be within 1..={}, got {}",
                MAX_PAYLOAD_SIZE, self.max_frame_payload
            )));
        }
        if self.max_streams == 0 {
            return Err(Error::InvalidConfig("max_streams must be non-zero".into()));
        }
        if self.read_buffer_size == 0 {
            return Err(Error::InvalidConfig("read_buffer_size must be non-zero".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_partition() {
        assert_eq!(Role::Client.first_stream_id(), 1);
        assert_eq!(Role::Server.first_stream_id(), 2);

        assert!(Role::Client.owns(1));
        assert!(Role::Client.owns(7));
        assert!(!Role::Client.owns(4));
        assert!(Role::Server.owns(4));
        assert!(!Role::Server.owns(5));

        // Control ID belongs to nobody
        assert!(!Role::Client.owns(0));
        assert!(!Role::Server.owns(0));
    }

    #[test]
    fn test_defaults_validate() {
        assert!(Config::client().validate().is_ok());
        assert_eq!(Config::server().role, Role::Server);
        assert!(Config::server().validate().is_ok());
        assert_eq!(Config::default().close_backlog, DEFAULT_CLOSE_BACKLOG);

        // Zero close backlog only disables piggybacking
        assert!(Config::default().with_close_backlog(0).validate().is_ok());
    }

    #[test]
    fn test_rejects_bad_values() {
        let oversized = Config::default().with_max_frame_payload(MAX_PAYLOAD_SIZE + 1);
        assert!(matches!(oversized.validate(), Err(Error::InvalidConfig(_))));

        let no_backlog = Config::default().with_accept_backlog(0);
        assert!(matches!(no_backlog.validate(), Err(Error::InvalidConfig(_))));

        let no_dispatch = Config::default().with_dispatch_backlog(0);
        assert!(matches!(no_dispatch.validate(), Err(Error::InvalidConfig(_))));
    }
}
