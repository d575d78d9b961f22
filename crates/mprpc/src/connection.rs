//! # Connection
//!
//! Owns one socket. A read task decodes the inbound byte stream into
//! envelopes; a write task drains an ordered outbound queue.
//!
//! ## State Machine
//!
//! `Disconnected → Connecting → Connected → Closing → Closed`
//!
//! Transitions only move forward, with one exception: a failed connect
//! attempt returns `Connecting → Disconnected`. `Closed` is terminal; both
//! I/O tasks are cancelled on entry, which releases the socket.
//!
//! ## Invariants
//!
//! - Writes leave in submission order, one at a time.
//! - Envelopes are handed to `Events::on_message` in arrival order, from the
//!   read task itself. Handlers must not block.
//! - `Events::on_error` fires at most once per connection.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU8;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;

use mpwire::Envelope;
use mpwire::StreamDecoder;
use tokio::io::AsyncReadExt;
use tokio::io::AsyncWriteExt;
use tokio::io::ReadHalf;
use tokio::io::WriteHalf;
use tokio::sync::Notify;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;
use tracing::trace;

use crate::config::SessionConfig;
use crate::transport;
use crate::transport::Error;
use crate::transport::Result;
use crate::transport::Stream;

/// Lifecycle of a connection.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum State {
    Disconnected = 0,
    Connecting = 1,
    Connected = 2,
    Closing = 3,
    Closed = 4,
}

impl State {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::Disconnected,
            1 => Self::Connecting,
            2 => Self::Connected,
            3 => Self::Closing,
            _ => Self::Closed,
        }
    }
}

/// Receives what a connection observes. Implemented by the owning session.
pub trait Events: Send + Sync + 'static {
    /// A complete envelope arrived.
    fn on_message(&self, envelope: Envelope, connection: &Arc<Connection>);

    /// The connection failed and is shutting down.
    fn on_error(&self, error: Error);
}

pub struct Connection {
    events: Arc<dyn Events>,
    config: SessionConfig,
    state: AtomicU8,
    reported: AtomicBool,
    outbound: mpsc::UnboundedSender<Vec<u8>>,
    /// Parked here until the write task starts.
    queue: Mutex<Option<mpsc::UnboundedReceiver<Vec<u8>>>>,
    pending_writes: AtomicUsize,
    drained: Notify,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Connection {
    pub fn new(events: Arc<dyn Events>, config: SessionConfig) -> Arc<Self> {
        let (outbound, queue) = mpsc::unbounded_channel();
        Arc::new(Self {
            events,
            config,
            state: AtomicU8::new(State::Disconnected as u8),
            reported: AtomicBool::new(false),
            outbound,
            queue: Mutex::new(Some(queue)),
            pending_writes: AtomicUsize::new(0),
            drained: Notify::new(),
            tasks: Mutex::new(Vec::new()),
        })
    }

    pub fn state(&self) -> State {
        State::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub fn is_connected(&self) -> bool {
        self.state() == State::Connected
    }

    /// Starts connecting to `addr`.
    ///
    /// The returned handle resolves once the attempt finishes. Dropping it
    /// does not cancel the attempt. On failure the connection returns to
    /// `Disconnected` and the error is also reported through `Events`.
    pub fn async_connect(self: &Arc<Self>, addr: SocketAddr) -> JoinHandle<Result<()>> {
        if !self.transition(State::Disconnected, State::Connecting) {
            return tokio::spawn(async {
                Err(Error::InvalidState("connect requires a disconnected connection"))
            });
        }

        let this = Arc::clone(self);
        tokio::spawn(async move {
            match transport::connect_tcp(addr, this.config.nodelay).await {
                Ok(stream) => {
                    this.start(stream, State::Connecting)?;
                    debug!(%addr, "connected");
                    Ok(())
                }
                Err(e) => {
                    debug!(%addr, error = %e, "connect failed");
                    // Closed meanwhile: the owner already settled everything.
                    if this.transition(State::Connecting, State::Disconnected) {
                        this.drained.notify_waiters();
                        this.report(e.clone());
                    }
                    Err(e)
                }
            }
        })
    }

    /// Adopts an already connected stream and starts reading.
    pub fn accept<S: Stream>(self: &Arc<Self>, stream: S) -> Result<()> {
        self.start(stream, State::Disconnected)
    }

    /// Queues `bytes` for writing. Never waits for the socket.
    pub fn async_write(&self, bytes: Vec<u8>) -> Result<()> {
        if matches!(self.state(), State::Closing | State::Closed) {
            return Err(Error::Closed);
        }

        self.pending_writes.fetch_add(1, Ordering::SeqCst);
        if self.outbound.send(bytes).is_err() {
            self.finish_write();
            return Err(Error::Closed);
        }
        Ok(())
    }

    /// Number of queued writes not yet handed to the socket.
    pub fn pending_writes(&self) -> usize {
        self.pending_writes.load(Ordering::SeqCst)
    }

    /// Waits until the write queue is empty or can no longer drain.
    ///
    /// While a connect is in flight this waits for its outcome. A
    /// connection that is `Disconnected` or `Closed` returns at once.
    pub async fn flush(&self) {
        loop {
            let drained = self.drained.notified();
            let stuck = matches!(self.state(), State::Disconnected | State::Closed);
            if self.pending_writes() == 0 || stuck {
                return;
            }
            drained.await;
        }
    }

    /// Cancels both I/O tasks and releases the socket. Idempotent.
    pub fn close(&self) {
        let mut current = self.state();
        loop {
            if current == State::Closed {
                return;
            }
            match self.state.compare_exchange(
                current as u8,
                State::Closing as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => break,
                Err(actual) => current = State::from_u8(actual),
            }
        }

        for task in self.lock_tasks().drain(..) {
            task.abort();
        }
        self.queue.lock().unwrap_or_else(PoisonError::into_inner).take();
        self.pending_writes.store(0, Ordering::SeqCst);
        self.state.store(State::Closed as u8, Ordering::SeqCst);
        self.drained.notify_waiters();
        trace!("connection closed");
    }

    fn start<S: Stream>(self: &Arc<Self>, stream: S, from: State) -> Result<()> {
        // Holding the task list orders this against a concurrent close().
        let mut tasks = self.lock_tasks();
        if !self.transition(from, State::Connected) {
            return Err(Error::InvalidState("connection cannot start from its current state"));
        }

        let queue = self
            .queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or(Error::InvalidState("connection was already started"))?;

        let (reader, writer) = tokio::io::split(stream);
        tasks.push(tokio::spawn(Arc::clone(self).read_loop(reader)));
        tasks.push(tokio::spawn(Arc::clone(self).write_loop(writer, queue)));
        Ok(())
    }

    async fn read_loop<S: Stream>(self: Arc<Self>, mut reader: ReadHalf<S>) {
        let mut decoder = StreamDecoder::with_limit(self.config.max_message_size);
        let mut buf = vec![0u8; self.config.read_buffer_size];

        let error = 'read: loop {
            let n = match reader.read(&mut buf).await {
                Ok(0) => break Error::ConnectionLost("peer closed the connection".into()),
                Ok(n) => n,
                Err(e) => break Error::Io(e.to_string()),
            };

            decoder.feed(&buf[..n]);
            loop {
                match decoder.try_next() {
                    Ok(Some(envelope)) => {
                        trace!(tag = envelope.tag(), "envelope received");
                        self.events.on_message(envelope, &self);
                    }
                    Ok(None) => break,
                    Err(e) => break 'read Error::Decode(e),
                }
            }
        };

        self.fail(error);
    }

    async fn write_loop<S: Stream>(
        self: Arc<Self>,
        mut writer: WriteHalf<S>,
        mut queue: mpsc::UnboundedReceiver<Vec<u8>>,
    ) {
        while let Some(bytes) = queue.recv().await {
            let written = writer.write_all(&bytes).await;
            self.finish_write();
            if let Err(e) = written {
                self.fail(Error::Io(e.to_string()));
                return;
            }
        }
    }

    /// Moves a live connection into shutdown and tells the owner why.
    fn fail(&self, error: Error) {
        if !self.transition(State::Connected, State::Closing) {
            return;
        }
        debug!(error = %error, "connection failed");
        self.report(error);
        self.close();
    }

    fn report(&self, error: Error) {
        if self.reported.swap(true, Ordering::SeqCst) {
            return;
        }
        self.events.on_error(error);
    }

    fn finish_write(&self) {
        // close() may have reset the counter underneath an in-flight write.
        let _ = self
            .pending_writes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        self.drained.notify_waiters();
    }

    fn transition(&self, from: State, to: State) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    fn lock_tasks(&self) -> MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("state", &self.state())
            .field("pending_writes", &self.pending_writes())
            .finish()
    }
}
