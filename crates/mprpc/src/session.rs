//! # RPC Session
//!
//! A `Session` is one RPC endpoint bound to one `Connection` at a time. It
//! issues Requests, correlates Responses with the calls waiting on them,
//! routes inbound Requests to its `Dispatcher`, and fails every outstanding
//! call when the connection goes away.
//!
//! ## Ownership
//!
//! The application (and the `SessionManager`) hold the session through an
//! `Arc`. The session owns its connection. The connection reaches back through
//! a `SessionLink`, which holds only a `Weak` reference, so I/O tasks never keep
//! a released session alive.
//!
//! ## Generations
//!
//! Every `begin`/`async_connect` installs a fresh connection and bumps the
//! generation. Calls still pending on the previous connection are failed with
//! `Replaced`, and events from a stale connection are ignored.
//!
//! ## Invariants
//!
//! - A msgid is unique among the calls currently pending on this session.
//! - Each pending call is resolved exactly once: by its Response, by the
//!   drain that follows a connection failure or `close()`, or with
//!   `SessionDropped` when the last handle to the session goes away.
//! - The pending-table lock is never held across I/O, a handler invocation,
//!   or a completion callback.

use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;
use std::sync::RwLock;
use std::sync::Weak;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::task::Context;
use std::task::Poll;
use std::time::Duration;

use mpwire::Envelope;
use mpwire::Failure;
use mpwire::Notify;
use mpwire::Request;
use mpwire::Response;
use mpwire::Value;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::debug;
use tracing::info;
use tracing::trace;
use tracing::warn;

use crate::config::SessionConfig;
use crate::connection;
use crate::connection::Connection;
use crate::dispatcher;
use crate::dispatcher::Dispatcher;
use crate::registry::SessionManager;
use crate::transport;
use crate::transport::Stream;

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// Strong type for session identifiers.
#[derive(Copy, Clone, Debug, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct SessionId(pub u64);

impl SessionId {
    fn next() -> Self {
        Self(NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "session-{}", self.0)
    }
}

/// Conditions the session reports about the peer's behaviour.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// A Response named a msgid with no pending call (duplicate or unknown).
    RequestNotFound(u32),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::RequestNotFound(msgid) => write!(f, "No pending request for msgid {}", msgid),
        }
    }
}

impl std::error::Error for Error {}

/// Why a call did not produce a value.
#[derive(Debug, Clone, PartialEq)]
pub enum CallError {
    /// The session had no usable connection when the call was made.
    NotConnected,
    /// The connection failed, closed, or was replaced while the call was pending.
    Connection(transport::Error),
    /// The Response could not be interpreted.
    Protocol(mpwire::Error),
    /// The serving peer reported a failure.
    Remote(Failure),
    /// The Request could not be encoded.
    Encode(mpwire::Error),
    /// The session was dropped before the call resolved.
    SessionDropped,
}

impl std::fmt::Display for CallError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotConnected => write!(f, "Session is not connected"),
            Self::Connection(e) => write!(f, "Connection error: {}", e),
            Self::Protocol(e) => write!(f, "Protocol error: {}", e),
            Self::Remote(failure) => write!(f, "Remote failure {}: {}", failure.code, failure.message),
            Self::Encode(e) => write!(f, "Failed to encode request: {}", e),
            Self::SessionDropped => write!(f, "Session dropped before the call resolved"),
        }
    }
}

impl std::error::Error for CallError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Connection(e) => Some(e),
            Self::Protocol(e) | Self::Encode(e) => Some(e),
            Self::Remote(failure) => Some(failure),
            _ => None,
        }
    }
}

pub type CallResult = std::result::Result<Value, CallError>;

/// Invoked with the outcome of a call, on whichever task resolves it.
pub type ResultCallback = Box<dyn FnOnce(&CallResult) + Send + 'static>;

/// Receives inbound Notify envelopes. Runs on the read task; must not block.
pub type NotifyHandler = Arc<dyn Fn(Notify) + Send + Sync + 'static>;

/// Resolves to the outcome of one call.
#[derive(Debug)]
pub struct CallHandle {
    msgid: Option<u32>,
    rx: oneshot::Receiver<CallResult>,
}

impl CallHandle {
    /// The msgid the Request was sent with, if it was sent at all.
    pub fn msgid(&self) -> Option<u32> {
        self.msgid
    }
}

impl Future for CallHandle {
    type Output = CallResult;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|received| received.unwrap_or(Err(CallError::SessionDropped)))
    }
}

/// A call waiting for its Response.
struct PendingRequest {
    completion: oneshot::Sender<CallResult>,
    callback: Option<ResultCallback>,
}

impl PendingRequest {
    fn resolve(self, result: CallResult) {
        if let Some(callback) = self.callback {
            callback(&result);
        }
        // The caller may have stopped waiting.
        let _ = self.completion.send(result);
    }
}

/// Everything guarded by the pending-table lock.
struct PendingTable {
    generation: u64,
    connection: Option<Arc<Connection>>,
    /// False once the current connection started draining.
    accepting: bool,
    next_msgid: u32,
    entries: HashMap<u32, PendingRequest>,
}

impl PendingTable {
    fn allocate_msgid(&mut self) -> u32 {
        loop {
            let msgid = self.next_msgid;
            self.next_msgid = self.next_msgid.wrapping_add(1);
            if !self.entries.contains_key(&msgid) {
                return msgid;
            }
        }
    }
}

/// Fluent builder for sessions.
pub struct SessionBuilder {
    config: SessionConfig,
    dispatcher: Option<Arc<Dispatcher>>,
    registry: Weak<SessionManager>,
    notify_handler: Option<NotifyHandler>,
}

impl SessionBuilder {
    pub fn new() -> Self {
        Self {
            config: SessionConfig::default(),
            dispatcher: None,
            registry: Weak::new(),
            notify_handler: None,
        }
    }

    pub fn config(mut self, config: SessionConfig) -> Self {
        self.config = config;
        self
    }

    /// Serves inbound Requests with `dispatcher`.
    pub fn dispatcher(mut self, dispatcher: Arc<Dispatcher>) -> Self {
        self.dispatcher = Some(dispatcher);
        self
    }

    /// The registry to leave when the connection fails. Not registered here.
    pub fn registry(mut self, registry: &Arc<SessionManager>) -> Self {
        self.registry = Arc::downgrade(registry);
        self
    }

    pub fn on_notify(mut self, handler: impl Fn(Notify) + Send + Sync + 'static) -> Self {
        self.notify_handler = Some(Arc::new(handler));
        self
    }

    pub fn build(self) -> Arc<Session> {
        Arc::new_cyclic(|weak_self| Session {
            id: SessionId::next(),
            config: self.config,
            weak_self: weak_self.clone(),
            table: Mutex::new(PendingTable {
                generation: 0,
                connection: None,
                accepting: false,
                next_msgid: 1,
                entries: HashMap::new(),
            }),
            dispatcher: RwLock::new(self.dispatcher),
            notify_handler: RwLock::new(self.notify_handler),
            registry: self.registry,
            settled: tokio::sync::Notify::new(),
            unmatched: AtomicU64::new(0),
        })
    }
}

impl Default for SessionBuilder {
    fn default() -> Self {
        Self::new()
    }
}

pub struct Session {
    id: SessionId,
    config: SessionConfig,
    weak_self: Weak<Session>,
    table: Mutex<PendingTable>,
    dispatcher: RwLock<Option<Arc<Dispatcher>>>,
    notify_handler: RwLock<Option<NotifyHandler>>,
    registry: Weak<SessionManager>,
    /// Signalled whenever pending entries are resolved.
    settled: tokio::sync::Notify,
    unmatched: AtomicU64,
}

impl Session {
    /// A session with default configuration and no dispatcher.
    pub fn new() -> Arc<Self> {
        SessionBuilder::new().build()
    }

    pub fn builder() -> SessionBuilder {
        SessionBuilder::new()
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn set_dispatcher(&self, dispatcher: Arc<Dispatcher>) {
        *self.dispatcher.write().unwrap_or_else(PoisonError::into_inner) = Some(dispatcher);
    }

    pub fn set_notify_handler(&self, handler: impl Fn(Notify) + Send + Sync + 'static) {
        *self.notify_handler.write().unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(handler));
    }

    // ------------------------------------------------------------------
    //  Connection lifecycle
    // ------------------------------------------------------------------

    /// Connects to `addr` in the background, replacing any current connection.
    ///
    /// Calls made before the connect completes are queued and sent once it does.
    pub fn async_connect(&self, addr: SocketAddr) -> JoinHandle<transport::Result<()>> {
        let connection = self.install_connection();
        debug!(session = %self.id, %addr, "connecting");
        connection.async_connect(addr)
    }

    /// Connects to `addr`, waiting at most `timeout`.
    ///
    /// A timeout only stops the wait: the attempt keeps running and, if it
    /// succeeds later, the session becomes connected.
    pub async fn connect(&self, addr: SocketAddr, timeout: Duration) -> bool {
        let attempt = self.async_connect(addr);
        match tokio::time::timeout(timeout, attempt).await {
            Ok(Ok(Ok(()))) => true,
            Ok(Ok(Err(e))) => {
                warn!(session = %self.id, %addr, error = %e, "connect failed");
                false
            }
            Ok(Err(e)) => {
                warn!(session = %self.id, %addr, error = %e, "connect task aborted");
                false
            }
            Err(_) => {
                warn!(session = %self.id, %addr, ?timeout, "connect timed out");
                false
            }
        }
    }

    /// Serves an accepted stream, replacing any current connection.
    pub fn begin<S: Stream>(&self, stream: S) -> transport::Result<()> {
        let connection = self.install_connection();
        connection.accept(stream)?;
        debug!(session = %self.id, "session started");
        Ok(())
    }

    pub fn is_connected(&self) -> bool {
        self.lock_table()
            .connection
            .as_ref()
            .is_some_and(|connection| connection.is_connected())
    }

    /// Returns the state of the current connection, if any.
    pub fn connection_state(&self) -> Option<connection::State> {
        self.lock_table().connection.as_ref().map(|c| c.state())
    }

    /// Closes the connection and fails every pending call. Idempotent.
    pub fn close(&self) {
        let (connection, drained) = {
            let mut table = self.lock_table();
            table.accepting = false;
            (table.connection.clone(), std::mem::take(&mut table.entries))
        };

        if let Some(connection) = connection {
            connection.close();
        }
        self.fail_all(drained, transport::Error::Closed);
        self.deregister();
    }

    /// Closes the session and releases its connection.
    pub fn stop(&self) {
        self.close();
        self.lock_table().connection = None;
    }

    /// Waits until no calls are pending and all writes have left, then closes.
    ///
    /// Writes queued while a connect is still in flight are waited for until
    /// the attempt either connects and sends them or fails.
    pub async fn wait_for_finish(&self) {
        loop {
            let settled = self.settled.notified();
            let (idle, connection) = {
                let table = self.lock_table();
                (table.entries.is_empty(), table.connection.clone())
            };

            if !idle {
                settled.await;
                continue;
            }

            if let Some(connection) = connection {
                connection.flush().await;
            }

            if self.pending_count() == 0 {
                break;
            }
        }
        self.close();
    }

    // ------------------------------------------------------------------
    //  Outbound
    // ------------------------------------------------------------------

    /// Sends a Request and returns a handle resolving to its outcome.
    pub fn call(&self, method: &str, params: Vec<Value>) -> CallHandle {
        self.submit(method, params, None)
    }

    /// Like `call`, additionally invoking `callback` with the outcome.
    pub fn call_with(
        &self,
        method: &str,
        params: Vec<Value>,
        callback: impl FnOnce(&CallResult) + Send + 'static,
    ) -> CallHandle {
        self.submit(method, params, Some(Box::new(callback)))
    }

    /// Sends a Notify. No Response is expected.
    pub fn notify(&self, method: &str, params: Vec<Value>) -> Result<(), CallError> {
        let connection = {
            let table = self.lock_table();
            match &table.connection {
                Some(connection) if table.accepting => Arc::clone(connection),
                _ => return Err(CallError::NotConnected),
            }
        };

        let bytes = mpwire::encode(&Notify::new(method, params).into()).map_err(CallError::Encode)?;
        connection.async_write(bytes).map_err(CallError::Connection)
    }

    fn submit(&self, method: &str, params: Vec<Value>, callback: Option<ResultCallback>) -> CallHandle {
        let (completion, rx) = oneshot::channel();
        let pending = PendingRequest { completion, callback };

        let admitted = {
            let mut table = self.lock_table();
            match table.connection.clone() {
                Some(connection) if table.accepting => {
                    let msgid = table.allocate_msgid();
                    table.entries.insert(msgid, pending);
                    Ok((msgid, connection))
                }
                _ => Err(pending),
            }
        };

        let (msgid, connection) = match admitted {
            Ok(admitted) => admitted,
            Err(pending) => {
                pending.resolve(Err(CallError::NotConnected));
                return CallHandle { msgid: None, rx };
            }
        };

        let sent = mpwire::encode(&Request::new(msgid, method, params).into())
            .map_err(CallError::Encode)
            .and_then(|bytes| connection.async_write(bytes).map_err(CallError::Connection));

        match sent {
            Ok(()) => trace!(session = %self.id, msgid, method, "request queued"),
            Err(e) => {
                // A concurrent drain may already have taken the entry.
                let pending = self.lock_table().entries.remove(&msgid);
                if let Some(pending) = pending {
                    pending.resolve(Err(e));
                    self.settled.notify_waiters();
                }
            }
        }

        CallHandle { msgid: Some(msgid), rx }
    }

    // ------------------------------------------------------------------
    //  Inbound
    // ------------------------------------------------------------------

    fn handle_message(&self, generation: u64, envelope: Envelope, connection: &Arc<Connection>) {
        match envelope {
            Envelope::Request(request) => self.handle_request(request, connection),
            Envelope::Response(response) => {
                if let Err(e) = self.complete(generation, response) {
                    self.unmatched.fetch_add(1, Ordering::Relaxed);
                    warn!(session = %self.id, error = %e, "unmatched response");
                }
            }
            Envelope::Notify(notify) => self.handle_notify(notify),
        }
    }

    fn handle_request(&self, request: Request, connection: &Arc<Connection>) {
        let dispatcher = self.dispatcher.read().unwrap_or_else(PoisonError::into_inner).clone();
        match dispatcher {
            Some(dispatcher) => dispatcher.dispatch(request, Arc::clone(connection)),
            None => {
                debug!(session = %self.id, method = %request.method, "no dispatcher attached");
                let failure = Failure::method_not_found(&request.method);
                dispatcher::reply(connection, Response::failure(request.msgid, failure));
            }
        }
    }

    /// Resolves the pending call a Response answers.
    fn complete(&self, generation: u64, response: Response) -> Result<(), Error> {
        let msgid = response.msgid;
        let pending = {
            let mut table = self.lock_table();
            if table.generation == generation {
                table.entries.remove(&msgid)
            } else {
                None
            }
        };
        let pending = pending.ok_or(Error::RequestNotFound(msgid))?;

        let result = match response.into_result() {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(failure)) => Err(CallError::Remote(failure)),
            Err(e) => Err(CallError::Protocol(e)),
        };
        trace!(session = %self.id, msgid, ok = result.is_ok(), "response matched");

        pending.resolve(result);
        self.settled.notify_waiters();
        Ok(())
    }

    fn handle_notify(&self, notify: Notify) {
        let handler = self.notify_handler.read().unwrap_or_else(PoisonError::into_inner).clone();
        match handler {
            Some(handler) => handler(notify),
            None => info!(session = %self.id, method = %notify.method, params = notify.params.len(), "notify"),
        }
    }

    fn handle_network_error(&self, generation: u64, error: transport::Error) {
        let drained = {
            let mut table = self.lock_table();
            if table.generation != generation {
                return;
            }
            table.accepting = false;
            std::mem::take(&mut table.entries)
        };

        warn!(session = %self.id, error = %error, pending = drained.len(), "connection lost");
        self.fail_all(drained, error);
        self.deregister();
    }

    // ------------------------------------------------------------------
    //  Introspection
    // ------------------------------------------------------------------

    /// Number of calls waiting for a Response.
    pub fn pending_count(&self) -> usize {
        self.lock_table().entries.len()
    }

    /// Responses that matched no pending call.
    pub fn unmatched_responses(&self) -> u64 {
        self.unmatched.load(Ordering::Relaxed)
    }

    /// Queued writes on the current connection.
    pub fn pending_writes(&self) -> usize {
        self.lock_table().connection.as_ref().map_or(0, |c| c.pending_writes())
    }

    // ------------------------------------------------------------------
    //  Internals
    // ------------------------------------------------------------------

    /// Swaps in a fresh connection and starts a new generation.
    fn install_connection(&self) -> Arc<Connection> {
        let (connection, previous, orphaned) = {
            let mut table = self.lock_table();
            table.generation += 1;

            let link = Arc::new(SessionLink {
                session: self.weak_self.clone(),
                generation: table.generation,
            });
            let connection = Connection::new(link, self.config.clone());

            let previous = table.connection.replace(Arc::clone(&connection));
            table.accepting = true;
            (connection, previous, std::mem::take(&mut table.entries))
        };

        if let Some(previous) = previous {
            previous.close();
        }
        self.fail_all(orphaned, transport::Error::Replaced);
        connection
    }

    fn fail_all(&self, drained: HashMap<u32, PendingRequest>, error: transport::Error) {
        if drained.is_empty() {
            return;
        }
        for (_, pending) in drained {
            pending.resolve(Err(CallError::Connection(error.clone())));
        }
        self.settled.notify_waiters();
    }

    fn deregister(&self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.deregister(self.id);
        }
    }

    #[cfg(test)]
    pub(crate) fn current_connection(&self) -> Option<Arc<Connection>> {
        self.lock_table().connection.clone()
    }

    fn lock_table(&self) -> MutexGuard<'_, PendingTable> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        let table = self.table.get_mut().unwrap_or_else(PoisonError::into_inner);
        table.accepting = false;
        let connection = table.connection.take();
        let orphaned = std::mem::take(&mut table.entries);

        if let Some(connection) = connection {
            connection.close();
        }
        for (_, pending) in orphaned {
            pending.resolve(Err(CallError::SessionDropped));
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("pending", &self.pending_count())
            .finish()
    }
}

/// The connection's non-owning route back to its session.
struct SessionLink {
    session: Weak<Session>,
    generation: u64,
}

impl connection::Events for SessionLink {
    fn on_message(&self, envelope: Envelope, connection: &Arc<Connection>) {
        if let Some(session) = self.session.upgrade() {
            session.handle_message(self.generation, envelope, connection);
        }
    }

    fn on_error(&self, error: transport::Error) {
        if let Some(session) = self.session.upgrade() {
            session.handle_network_error(self.generation, error);
        }
    }
}
