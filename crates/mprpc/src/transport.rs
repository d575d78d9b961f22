//! # Transport
//!
//! The byte-stream layer underneath a `Connection`.
//!
//! ## Philosophy
//!
//! - **Byte-Oriented**: A transport stream knows nothing about envelopes. It moves
//!   opaque bytes in both directions.
//! - **Stream-Generic**: Anything that is `AsyncRead + AsyncWrite` can carry a
//!   session. TCP is the production transport; in-memory pipes serve the tests.

use std::net::SocketAddr;

use tokio::io::AsyncRead;
use tokio::io::AsyncWrite;
use tokio::net::TcpStream;

/// Errors that occur at the network/transport layer.
///
/// Every variant is terminal for the connection that produced it.
#[derive(Debug, Clone, PartialEq)]
pub enum Error {
    /// The connect attempt failed (refused, unreachable, ...).
    Connect(String),
    /// The peer closed the stream or the connection was dropped.
    ConnectionLost(String),
    /// A read or write on the socket failed.
    Io(String),
    /// The inbound byte stream could not be decoded into envelopes.
    Decode(mpwire::Error),
    /// The connection was closed locally.
    Closed,
    /// The session replaced this connection with a new one.
    Replaced,
    /// The operation is not valid in the connection's current state.
    InvalidState(&'static str),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Connect(msg) => write!(f, "Connect failed: {}", msg),
            Self::ConnectionLost(msg) => write!(f, "Connection lost: {}", msg),
            Self::Io(msg) => write!(f, "I/O error: {}", msg),
            Self::Decode(e) => write!(f, "Stream decode failed: {}", e),
            Self::Closed => write!(f, "Connection closed"),
            Self::Replaced => write!(f, "Connection replaced by a newer one"),
            Self::InvalidState(msg) => write!(f, "Invalid connection state: {}", msg),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Decode(e) => Some(e),
            _ => None,
        }
    }
}

impl From<mpwire::Error> for Error {
    fn from(e: mpwire::Error) -> Self {
        Self::Decode(e)
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// A bidirectional byte stream a connection can own.
pub trait Stream: AsyncRead + AsyncWrite + Send + 'static {}

impl<T> Stream for T where T: AsyncRead + AsyncWrite + Send + 'static {}

/// Opens a TCP stream to `addr`.
pub async fn connect_tcp(addr: SocketAddr, nodelay: bool) -> Result<TcpStream> {
    let stream = TcpStream::connect(addr)
        .await
        .map_err(|e| Error::Connect(format!("{}: {}", addr, e)))?;
    stream
        .set_nodelay(nodelay)
        .map_err(|e| Error::Io(e.to_string()))?;
    Ok(stream)
}
