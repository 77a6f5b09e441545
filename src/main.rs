//! Binary entry point: parses [`ServerConfig`], wires up logging, and drives
//! one [`Server`] on a single-threaded runtime (spec §5 "no worker threads
//! or tasks outside the one loop").

use std::process::ExitCode;

use clap::Parser;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::EnvFilter;

use purcmc_server::backend::{NullBackend, NullRenderChannel};
use purcmc_server::config::ServerConfig;
use purcmc_server::server::Server;
use purcmc_server::transport::Listener;

fn init_tracing(verbose: bool, accesslog: bool) {
    let default_level = if verbose { LevelFilter::DEBUG } else { LevelFilter::INFO };
    let filter = EnvFilter::builder()
        .with_default_directive(default_level.into())
        .from_env_lossy();
    tracing_subscriber::fmt().with_env_filter(filter).init();
    if accesslog {
        tracing::info!("access logging enabled; request/response pairs are logged at debug level");
    }
}

fn main() -> ExitCode {
    let config = ServerConfig::parse();
    init_tracing(config.verbose, config.accesslog);

    if config.tls_partially_configured() {
        tracing::error!("--tls-cert and --tls-key must both be set, or neither");
        return ExitCode::FAILURE;
    }
    if config.tls_configured() {
        tracing::warn!("TLS material supplied but termination is not wired up; serving plain TCP");
    }
    if config.unix_socket.is_none() && config.socket_addr().is_none() {
        tracing::error!("at least one of --unix-socket or --addr/--port must be set");
        return ExitCode::FAILURE;
    }

    let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
        Ok(rt) => rt,
        Err(e) => {
            tracing::error!(error = %e, "failed to build the tokio runtime");
            return ExitCode::FAILURE;
        }
    };

    runtime.block_on(run(config))
}

async fn run(config: ServerConfig) -> ExitCode {
    let listener = match Listener::bind(config.unix_socket.as_deref(), config.socket_addr(), config.backlog).await {
        Ok(l) => l,
        Err(e) => {
            tracing::error!(error = %e, "failed to bind listeners");
            return ExitCode::FAILURE;
        }
    };

    let mut server = Server::new(
        Box::new(NullBackend),
        Box::new(NullRenderChannel),
        config.product_name.clone(),
    );

    tracing::info!(
        unix_socket = ?config.unix_socket,
        addr = ?config.socket_addr(),
        "purcmc-server starting"
    );

    match server.run(listener).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "event loop terminated");
            ExitCode::FAILURE
        }
    }
}
