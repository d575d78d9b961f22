//! # Server
//!
//! Listens on a TCP address and turns every accepted socket into a
//! registered `Session` served by a shared `Dispatcher`.
//!
//! ## Invariants
//!
//! - At most one accept loop runs per server.
//! - An accept error never ends the loop: it is logged and, after
//!   `ServerConfig::accept_backoff`, the next accept is armed.
//! - Stopping the server ends the accept loop and closes the listener.
//!   Sessions already accepted keep running until they fail or are closed.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;

use tokio::net::TcpListener;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::config::ServerConfig;
use crate::dispatcher::Dispatcher;
use crate::registry::SessionManager;
use crate::session::Session;

#[derive(Debug)]
pub enum Error {
    Bind(String),
    AlreadyStarted,
    Stopped,
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Bind(msg) => write!(f, "Bind failed: {}", msg),
            Self::AlreadyStarted => write!(f, "Server already started"),
            Self::Stopped => write!(f, "Server was stopped and its listener closed"),
        }
    }
}

impl std::error::Error for Error {}

pub type Result<T> = std::result::Result<T, Error>;

/// Where the listening socket currently lives.
enum Lifecycle {
    /// Bound, not yet accepting.
    Bound(TcpListener),
    /// Owned by the accept task.
    Running(JoinHandle<()>),
    /// Listener closed.
    Stopped,
}

pub struct Server {
    local_addr: SocketAddr,
    dispatcher: Arc<Dispatcher>,
    sessions: Arc<SessionManager>,
    config: ServerConfig,
    lifecycle: Mutex<Lifecycle>,
}

impl Server {
    /// Binds `addr`. Port 0 picks a free port; see `local_addr`.
    pub async fn bind(
        addr: SocketAddr,
        dispatcher: Arc<Dispatcher>,
        sessions: Arc<SessionManager>,
    ) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| Error::Bind(format!("{}: {}", addr, e)))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| Error::Bind(e.to_string()))?;

        Ok(Self {
            local_addr,
            dispatcher,
            sessions,
            config: ServerConfig::default(),
            lifecycle: Mutex::new(Lifecycle::Bound(listener)),
        })
    }

    pub fn with_config(mut self, config: ServerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    /// Starts accepting connections in the background.
    pub fn start(&self) -> Result<()> {
        let mut lifecycle = self.lock_lifecycle();
        let listener = match std::mem::replace(&mut *lifecycle, Lifecycle::Stopped) {
            Lifecycle::Bound(listener) => listener,
            running @ Lifecycle::Running(_) => {
                *lifecycle = running;
                return Err(Error::AlreadyStarted);
            }
            Lifecycle::Stopped => return Err(Error::Stopped),
        };

        *lifecycle = Lifecycle::Running(tokio::spawn(accept_loop(
            listener,
            Arc::clone(&self.dispatcher),
            Arc::clone(&self.sessions),
            self.config.clone(),
        )));
        info!(addr = %self.local_addr, "server listening");
        Ok(())
    }

    /// Stops accepting and closes the listening socket. Live sessions are
    /// left alone. A stopped server cannot be started again.
    ///
    /// The socket is released when the runtime tears down the accept task,
    /// which happens asynchronously right after this returns.
    pub fn stop(&self) {
        let previous = std::mem::replace(&mut *self.lock_lifecycle(), Lifecycle::Stopped);
        match previous {
            Lifecycle::Running(task) => {
                task.abort();
                info!(addr = %self.local_addr, "server stopped");
            }
            Lifecycle::Bound(listener) => drop(listener),
            Lifecycle::Stopped => {}
        }
    }

    pub fn is_running(&self) -> bool {
        matches!(&*self.lock_lifecycle(), Lifecycle::Running(task) if !task.is_finished())
    }

    fn lock_lifecycle(&self) -> MutexGuard<'_, Lifecycle> {
        self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("local_addr", &self.local_addr)
            .field("sessions", &self.sessions.len())
            .finish()
    }
}

async fn accept_loop(
    listener: TcpListener,
    dispatcher: Arc<Dispatcher>,
    sessions: Arc<SessionManager>,
    config: ServerConfig,
) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => serve(stream, peer, &dispatcher, &sessions, &config),
            Err(e) => {
                warn!(error = %e, backoff = ?config.accept_backoff, "accept failed");
                tokio::time::sleep(config.accept_backoff).await;
            }
        }
    }
}

fn serve(
    stream: TcpStream,
    peer: SocketAddr,
    dispatcher: &Arc<Dispatcher>,
    sessions: &Arc<SessionManager>,
    config: &ServerConfig,
) {
    if let Err(e) = stream.set_nodelay(config.session.nodelay) {
        debug!(%peer, error = %e, "failed to set TCP_NODELAY");
    }

    let session = Session::builder()
        .config(config.session.clone())
        .dispatcher(Arc::clone(dispatcher))
        .registry(sessions)
        .build();

    // Registered first: a connection that dies at once deregisters cleanly.
    sessions.register(Arc::clone(&session));
    match session.begin(stream) {
        Ok(()) => info!(session = %session.id(), %peer, "session accepted"),
        Err(e) => {
            warn!(session = %session.id(), %peer, error = %e, "failed to start session");
            sessions.deregister(session.id());
        }
    }
}
