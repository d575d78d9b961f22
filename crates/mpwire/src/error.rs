//! # Error Definitions
//!
//! Wire-level failures, and the application-level `Failure` payload a
//! serving peer sends back when a call does not succeed.

/// Failures while encoding or decoding envelopes.
#[derive(Debug, Clone, PartialEq)]
pub enum Error {
    /// The msgpack encoder refused the value.
    Encode(String),
    /// The byte stream is not valid msgpack.
    Decode(String),
    /// The first field of an envelope is not a known message type.
    UnknownTag(u64),
    /// The envelope decoded as msgpack but does not have the expected shape.
    ProtocolViolation(String),
    /// An incomplete message grew past the decoder's buffer limit.
    MessageTooLarge { buffered: usize, limit: usize },
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Encode(msg) => write!(f, "Encode error: {}", msg),
            Self::Decode(msg) => write!(f, "Decode error: {}", msg),
            Self::UnknownTag(tag) => write!(f, "Unknown message type tag: {}", tag),
            Self::ProtocolViolation(msg) => write!(f, "Protocol violation: {}", msg),
            Self::MessageTooLarge { buffered, limit } => {
                write!(f, "Message too large: {} bytes buffered, limit is {}", buffered, limit)
            }
        }
    }
}

impl std::error::Error for Error {}

/// A specialized Result type for wire operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Reserved failure codes synthesized by the RPC layer itself.
///
/// Handlers are free to use any other code for their own failures.
pub mod codes {
    /// No handler is registered for the requested method.
    pub const METHOD_NOT_FOUND: i64 = -32601;
    /// The handler could not decode its parameters.
    pub const INVALID_PARAMS: i64 = -32602;
    /// The serving side failed for a reason unrelated to the handler.
    pub const INTERNAL_ERROR: i64 = -32603;
    /// The handler panicked instead of returning.
    pub const HANDLER_PANICKED: i64 = -32000;
}

/// An application-level failure reported by the serving peer.
///
/// On the wire this travels as `result = [code, message]` with the error
/// field set to `true`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Failure {
    pub code: i64,
    pub message: String,
}

impl Failure {
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self { code, message: message.into() }
    }

    /// The method was not found; the message carries the method name.
    pub fn method_not_found(method: &str) -> Self {
        Self::new(codes::METHOD_NOT_FOUND, method)
    }

    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self::new(codes::INVALID_PARAMS, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(codes::INTERNAL_ERROR, message)
    }
}

impl std::fmt::Display for Failure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "remote failure {}: {}", self.code, self.message)
    }
}

impl std::error::Error for Failure {}

/// The interpreted outcome carried by a Response.
#[derive(Debug, Clone, PartialEq)]
pub enum ErrorPayload {
    /// The call succeeded; the Response result holds the return value.
    None,
    /// The call failed; the Response result is ignored.
    Failure(Failure),
}
