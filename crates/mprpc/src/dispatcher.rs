//! # Dispatcher
//!
//! Maps method names to handlers and turns inbound Requests into Responses.
//!
//! ## Philosophy
//!
//! - **Type Erasure at the Edge**: Every handler sees the same shape: a list of
//!   msgpack values in, a value or a `Failure` out. Each handler decodes its
//!   own parameters, usually through [`Params`].
//! - **Always Answer**: A Request produces exactly one Response. Unknown
//!   methods, parameter errors and panics all become `Failure` Responses; none
//!   of them reach the connection's read loop.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use dashmap::DashMap;
use futures::FutureExt;
use mpwire::Failure;
use mpwire::Request;
use mpwire::Response;
use mpwire::Value;
use mpwire::codes;
use tracing::debug;
use tracing::error;

use crate::connection::Connection;

/// Method implementation.
///
/// Handlers run on the async runtime, off the connection's read task.
#[async_trait::async_trait]
pub trait Handler: Send + Sync + 'static {
    async fn call(&self, params: Params) -> Result<Value, Failure>;
}

/// Adapts a synchronous closure into a `Handler`.
struct FnHandler<F>(F);

#[async_trait::async_trait]
impl<F> Handler for FnHandler<F>
where
    F: Fn(Params) -> Result<Value, Failure> + Send + Sync + 'static,
{
    async fn call(&self, params: Params) -> Result<Value, Failure> {
        (self.0)(params)
    }
}

/// A registry of handlers, shared by every session it is attached to.
#[derive(Default)]
pub struct Dispatcher {
    handlers: DashMap<String, Arc<dyn Handler>>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `handler` under `name`, replacing any previous one.
    pub fn add_handler(&self, name: impl Into<String>, handler: impl Handler) {
        self.handlers.insert(name.into(), Arc::new(handler));
    }

    /// Registers a synchronous closure under `name`.
    pub fn add_fn<F>(&self, name: impl Into<String>, f: F)
    where
        F: Fn(Params) -> Result<Value, Failure> + Send + Sync + 'static,
    {
        self.add_handler(name, FnHandler(f));
    }

    pub fn has_handler(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Runs the handler for `request` and builds its Response.
    pub async fn handle(&self, request: Request) -> Response {
        let Request { msgid, method, params } = request;

        // Clone out of the map so no shard lock is held across the call.
        let handler = self.handlers.get(&method).map(|entry| Arc::clone(entry.value()));
        let Some(handler) = handler else {
            debug!(msgid, method = %method, "method not found");
            return Response::failure(msgid, Failure::method_not_found(&method));
        };

        match AssertUnwindSafe(handler.call(Params::new(params))).catch_unwind().await {
            Ok(Ok(value)) => Response::success(msgid, value),
            Ok(Err(failure)) => Response::failure(msgid, failure),
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                error!(msgid, method = %method, panic = %message, "handler panicked");
                Response::failure(msgid, Failure::new(codes::HANDLER_PANICKED, message))
            }
        }
    }

    /// Handles `request` on a new task and writes the Response to `connection`.
    pub fn dispatch(self: &Arc<Self>, request: Request, connection: Arc<Connection>) {
        let dispatcher = Arc::clone(self);
        tokio::spawn(async move {
            let response = dispatcher.handle(request).await;
            reply(&connection, response);
        });
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut methods: Vec<String> = self.handlers.iter().map(|e| e.key().clone()).collect();
        methods.sort();
        f.debug_struct("Dispatcher").field("methods", &methods).finish()
    }
}

/// Encodes and queues a Response. A vanished connection drops it silently.
pub(crate) fn reply(connection: &Connection, response: Response) {
    let msgid = response.msgid;
    let bytes = match mpwire::encode(&response.into()) {
        Ok(bytes) => bytes,
        Err(e) => {
            error!(msgid, error = %e, "failed to encode response");
            return;
        }
    };

    if let Err(e) = connection.async_write(bytes) {
        debug!(msgid, error = %e, "dropping response, connection is gone");
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "handler panicked".to_string()
    }
}

/// Positional request parameters with typed accessors.
///
/// Accessors fail with an `INVALID_PARAMS` failure, so handlers can use `?`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Params(Vec<Value>);

impl Params {
    pub fn new(values: Vec<Value>) -> Self {
        Self(values)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_slice(&self) -> &[Value] {
        &self.0
    }

    pub fn into_vec(self) -> Vec<Value> {
        self.0
    }

    /// Fails unless exactly `n` parameters were supplied.
    pub fn expect_len(&self, n: usize) -> Result<(), Failure> {
        if self.0.len() == n {
            Ok(())
        } else {
            Err(Failure::invalid_params(format!("expected {} params, got {}", n, self.0.len())))
        }
    }

    pub fn value(&self, index: usize) -> Result<&Value, Failure> {
        self.0
            .get(index)
            .ok_or_else(|| Failure::invalid_params(format!("missing param {}", index)))
    }

    pub fn i64(&self, index: usize) -> Result<i64, Failure> {
        let value = self.value(index)?;
        value.as_i64().ok_or_else(|| mismatch(index, "integer", value))
    }

    pub fn u64(&self, index: usize) -> Result<u64, Failure> {
        let value = self.value(index)?;
        value.as_u64().ok_or_else(|| mismatch(index, "unsigned integer", value))
    }

    /// Accepts floats and integers.
    pub fn f64(&self, index: usize) -> Result<f64, Failure> {
        let value = self.value(index)?;
        value
            .as_f64()
            .or_else(|| value.as_i64().map(|n| n as f64))
            .or_else(|| value.as_u64().map(|n| n as f64))
            .ok_or_else(|| mismatch(index, "number", value))
    }

    pub fn bool(&self, index: usize) -> Result<bool, Failure> {
        let value = self.value(index)?;
        value.as_bool().ok_or_else(|| mismatch(index, "bool", value))
    }

    pub fn str(&self, index: usize) -> Result<&str, Failure> {
        let value = self.value(index)?;
        value.as_str().ok_or_else(|| mismatch(index, "string", value))
    }
}

impl From<Vec<Value>> for Params {
    fn from(values: Vec<Value>) -> Self {
        Self(values)
    }
}

fn mismatch(index: usize, expected: &str, found: &Value) -> Failure {
    Failure::invalid_params(format!("param {}: expected {}, found {:?}", index, expected, found))
}
