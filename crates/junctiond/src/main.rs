//! junctiond: the Junction message bus daemon.

use std::time::Duration;

use anyhow::{Context, Result};
use tokio::net::TcpListener;

use junction_core::config::JunctionConfig;
use junction_core::Guid128;
use junction_router::{DaemonRouter, EndpointTimeouts};

mod expiry;
mod transport;

use transport::{PeerConnector, TcpAcceptor};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    // Load config
    if let Err(e) = JunctionConfig::write_default_if_missing() {
        tracing::warn!(error = %e, "failed to write default config");
    }
    let config = JunctionConfig::load().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "failed to load config, using defaults");
        JunctionConfig::default()
    });

    let guid = Guid128::generate();
    let router = DaemonRouter::new(guid, config.router.clone());
    let bus = router.bus().clone();
    tracing::info!(guid = %guid, controller = router.core().controller_name(), "junctiond starting");

    if config.bluetooth.enabled {
        tracing::warn!("bluetooth enabled in config but no radio backend is available; skipping");
    }

    let timeouts = EndpointTimeouts::from_config(&config.endpoint, &config.router);
    let hello_timeout = Duration::from_millis(config.listen.hello_timeout_ms);

    // ── Shutdown channel ─────────────────────────────────────────────────────
    let (shutdown_tx, _) = tokio::sync::broadcast::channel::<()>(1);

    {
        let shutdown = shutdown_tx.clone();
        tokio::spawn(async move {
            tokio::signal::ctrl_c().await.ok();
            tracing::info!("shutdown signal received");
            let _ = shutdown.send(());
        });
    }

    // ── Spawn tasks ──────────────────────────────────────────────────────────

    let expiry_task = tokio::spawn(expiry::expiry_loop(
        bus.clone(),
        Duration::from_secs(config.router.name_expiry_interval_secs.max(1)),
    ));

    let acceptor_task = if config.listen.tcp_addr.is_empty() {
        tracing::info!("no tcp listen address configured");
        None
    } else {
        let listener = TcpListener::bind(&config.listen.tcp_addr)
            .await
            .with_context(|| format!("failed to bind {}", config.listen.tcp_addr))?;
        tracing::info!(addr = %listener.local_addr()?, "listening for connections");
        Some(tokio::spawn(
            TcpAcceptor::new(
                listener,
                router.clone(),
                timeouts.clone(),
                hello_timeout,
                shutdown_tx.subscribe(),
            )
            .run(),
        ))
    };

    let connector_tasks: Vec<_> = config
        .listen
        .peers
        .iter()
        .map(|peer| {
            tracing::info!(%peer, "dialling peer daemon");
            tokio::spawn(
                PeerConnector::new(
                    peer.clone(),
                    router.clone(),
                    timeouts.clone(),
                    hello_timeout,
                    shutdown_tx.subscribe(),
                )
                .run(),
            )
        })
        .collect();

    // ── Wait for exit ────────────────────────────────────────────────────────

    let mut shutdown_rx = shutdown_tx.subscribe();
    let acceptor = async {
        match acceptor_task {
            Some(task) => task.await,
            None => std::future::pending().await,
        }
    };

    tokio::select! {
        _ = shutdown_rx.recv() => tracing::info!("shutting down"),
        r = expiry_task        => tracing::error!("expiry task exited: {:?}", r),
        r = acceptor           => tracing::error!("tcp acceptor exited: {:?}", r),
    }
    let _ = shutdown_tx.send(());

    bus.shutdown().await;

    let flush = Duration::from_millis(config.router.stop_flush_ms);
    let endpoints = router.core().all_endpoints();
    for ep in &endpoints {
        ep.stop_after_tx_empty(flush);
    }
    futures::future::join_all(endpoints.iter().map(|ep| ep.join(flush * 2))).await;
    for task in connector_tasks {
        if let Err(e) = task.await {
            tracing::debug!(error = %e, "peer connector task failed");
        }
    }
    tracing::info!(endpoints = endpoints.len(), "junctiond stopped");

    Ok(())
}
