//! mprun: serve a small arithmetic dispatcher, or call a method on one.
//!
//! ```text
//! mprun serve --listen 127.0.0.1:8070
//! mprun call --connect 127.0.0.1:8070 add 2 3
//! ```

mod handlers;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use anyhow::Result;
use clap::Parser;
use clap::Subcommand;
use mprpc::CallError;
use mprpc::Server;
use mprpc::ServerConfig;
use mprpc::Session;
use mprpc::SessionConfig;
use mprpc::SessionManager;
use mpwire::Value;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "mprun")]
#[command(about = "msgpack-RPC over TCP")]
struct Cli {
    /// Largest inbound message accepted, in bytes
    #[arg(long, global = true)]
    max_message_size: Option<usize>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Serve `add`, `mul` and `echo` until interrupted
    Serve {
        #[arg(long, default_value = "127.0.0.1:8070")]
        listen: SocketAddr,

        /// Pause after a failed accept, in milliseconds
        #[arg(long, default_value_t = 100)]
        accept_backoff_ms: u64,
    },
    /// Call one method and print its result
    Call {
        #[arg(long, default_value = "127.0.0.1:8070")]
        connect: SocketAddr,

        #[arg(long, default_value_t = 5)]
        timeout_secs: u64,

        method: String,

        /// Integers, then floats, then strings
        args: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .compact()
        .init();

    let cli = Cli::parse();
    let mut session_config = SessionConfig::default();
    if let Some(size) = cli.max_message_size {
        session_config = session_config.with_max_message_size(size);
    }

    match cli.command {
        Command::Serve { listen, accept_backoff_ms } => {
            let config = ServerConfig::default()
                .with_session(session_config)
                .with_accept_backoff(Duration::from_millis(accept_backoff_ms));
            serve(listen, config).await
        }
        Command::Call { connect, timeout_secs, method, args } => {
            let params = args.iter().map(String::as_str).map(parse_arg).collect();
            call(connect, session_config, Duration::from_secs(timeout_secs), &method, params).await
        }
    }
}

async fn serve(listen: SocketAddr, config: ServerConfig) -> Result<()> {
    let sessions = SessionManager::new();
    let server = Server::bind(listen, Arc::new(handlers::arithmetic()), Arc::clone(&sessions))
        .await?
        .with_config(config);
    server.start()?;

    tokio::signal::ctrl_c().await.context("failed to wait for ctrl-c")?;
    info!(live = sessions.len(), "shutting down");
    server.stop();
    sessions.shutdown();
    Ok(())
}

async fn call(
    addr: SocketAddr,
    config: SessionConfig,
    timeout: Duration,
    method: &str,
    params: Vec<Value>,
) -> Result<()> {
    let session = Session::builder().config(config).build();
    anyhow::ensure!(session.connect(addr, timeout).await, "could not connect to {}", addr);

    let outcome = tokio::time::timeout(timeout, session.call(method, params))
        .await
        .context("call timed out")?;
    session.close();

    match outcome {
        Ok(value) => {
            println!("{}", value);
            Ok(())
        }
        Err(CallError::Remote(failure)) => {
            anyhow::bail!("{} failed with code {}: {}", method, failure.code, failure.message)
        }
        Err(e) => Err(e.into()),
    }
}

fn parse_arg(arg: &str) -> Value {
    if let Ok(n) = arg.parse::<i64>() {
        Value::from(n)
    } else if let Ok(x) = arg.parse::<f64>() {
        Value::from(x)
    } else {
        Value::from(arg)
    }
}
