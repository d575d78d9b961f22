//! Tunables for sessions and servers.

use std::time::Duration;

use mpwire::codec::DEFAULT_MESSAGE_LIMIT;

/// Per-connection settings, shared by client and server sessions.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Size of the buffer each socket read fills.
    pub read_buffer_size: usize,
    /// Largest message the stream decoder will buffer before giving up.
    pub max_message_size: usize,
    /// Sets `TCP_NODELAY` on client and accepted sockets.
    pub nodelay: bool,
}

impl SessionConfig {
    pub fn with_read_buffer_size(mut self, size: usize) -> Self {
        self.read_buffer_size = size.max(1);
        self
    }

    pub fn with_max_message_size(mut self, size: usize) -> Self {
        self.max_message_size = size;
        self
    }

    pub fn with_nodelay(mut self, nodelay: bool) -> Self {
        self.nodelay = nodelay;
        self
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            read_buffer_size: 64 * 1024,
            max_message_size: DEFAULT_MESSAGE_LIMIT,
            nodelay: true,
        }
    }
}

/// Settings for the accept loop.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Applied to every accepted session.
    pub session: SessionConfig,
    /// Pause after a failed accept before re-arming.
    pub accept_backoff: Duration,
}

impl ServerConfig {
    pub fn with_session(mut self, session: SessionConfig) -> Self {
        self.session = session;
        self
    }

    pub fn with_accept_backoff(mut self, backoff: Duration) -> Self {
        self.accept_backoff = backoff;
        self
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            session: SessionConfig::default(),
            accept_backoff: Duration::from_millis(100),
        }
    }
}
