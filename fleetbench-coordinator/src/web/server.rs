use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use fleetbench_worker::{DEFAULT_CONTAINER, InMemoryStore, StageExecutor};
use tokio::net::{TcpListener, TcpSocket};
use tokio::signal::unix::SignalKind;

use super::App;
use crate::config::Config;

/// The maximum backlog for TCP listen sockets before refusing connections.
const TCP_LISTEN_BACKLOG: u32 = 1024;

/// Runs a worker serving an in-memory store over HTTP.
///
/// Binds the configured address and runs until termination is requested.
pub async fn server(config: Config) -> Result<()> {
    let settings = &config.worker;
    tracing::info!(worker = settings.index, "Starting worker");

    let listener = listen(config.http_addr).context("failed to start TCP listener")?;

    let store = InMemoryStore::new();
    if settings.entries > 0 {
        store.populate(DEFAULT_CONTAINER, settings.entries, settings.entry_size);
        tracing::info!(entries = settings.entries, "populated store");
    }
    let executor =
        StageExecutor::with_grace_period(settings.index, Arc::new(store), settings.grace_period);

    let server_handle = tokio::spawn(async move {
        App::new(executor)
            .graceful_shutdown(true)
            .serve(listener)
            .await
    });

    tokio::spawn(async move {
        elegant_departure::get_shutdown_guard().wait().await;
        tracing::info!("Shutting down ...");
    });

    elegant_departure::tokio::depart()
        .on_termination()
        .on_sigint()
        .on_signal(SignalKind::hangup())
        .on_signal(SignalKind::quit())
        .await;

    let server_result = server_handle.await.map_err(From::from).flatten();
    tracing::info!("Shutdown complete");
    server_result
}

fn listen(addr: SocketAddr) -> Result<TcpListener> {
    let socket = match addr {
        SocketAddr::V4(_) => TcpSocket::new_v4(),
        SocketAddr::V6(_) => TcpSocket::new_v6(),
    }?;

    #[cfg(all(unix, not(target_os = "solaris"), not(target_os = "illumos")))]
    socket.set_reuseport(true)?;
    socket.bind(addr)?;

    let listener = socket.listen(TCP_LISTEN_BACKLOG)?;
    tracing::info!("HTTP server listening on {addr}");

    Ok(listener)
}
