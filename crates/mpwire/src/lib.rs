//! # mpwire
//!
//! The msgpack-rpc wire format: envelopes, their msgpack mapping, and an
//! incremental decoder for unframed byte streams.
//!
//! ## Architecture
//!
//! - [`frame`]: `Request`, `Response`, `Notify` and the tagged `Envelope`.
//! - [`codec`]: bytes in, envelopes out (and back).
//! - [`error`]: decode failures and the remote `Failure` payload.
//!
//! Values are `rmpv::Value`, re-exported as [`Value`].

pub mod codec;
pub mod error;
pub mod frame;

#[cfg(test)]
mod tests;

pub use codec::decode;
pub use codec::encode;
pub use codec::StreamDecoder;
pub use error::codes;
pub use error::Error;
pub use error::ErrorPayload;
pub use error::Failure;
pub use error::Result;
pub use frame::Envelope;
pub use frame::ErrorField;
pub use frame::Notify;
pub use frame::Request;
pub use frame::Response;

pub use rmpv::Value;
