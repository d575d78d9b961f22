//! # mprpc
//!
//! msgpack-RPC sessions over TCP. A `Connection` moves envelopes over one
//! socket, a `Session` correlates calls with their Responses, a `Dispatcher`
//! serves inbound Requests, and a `Server` accepts sessions into a
//! `SessionManager`.

pub mod config;
pub mod connection;
pub mod dispatcher;
pub mod registry;
pub mod server;
pub mod session;
pub mod transport;

#[cfg(test)]
mod mock_transport;

pub use config::ServerConfig;
pub use config::SessionConfig;
pub use dispatcher::Dispatcher;
pub use dispatcher::Handler;
pub use dispatcher::Params;
pub use registry::SessionManager;
pub use server::Server;
pub use session::CallError;
pub use session::CallHandle;
pub use session::CallResult;
pub use session::Session;
pub use session::SessionBuilder;
pub use session::SessionId;
