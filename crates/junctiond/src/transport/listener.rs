//! Inbound TCP connections.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::net::TcpListener;
use tokio::sync::broadcast;

use junction_router::{DaemonRouter, EndpointTimeouts};

use super::hello;

pub struct TcpAcceptor {
    listener: TcpListener,
    router: Arc<DaemonRouter>,
    timeouts: EndpointTimeouts,
    hello_timeout: Duration,
    shutdown: broadcast::Receiver<()>,
}

impl TcpAcceptor {
    pub fn new(
        listener: TcpListener,
        router: Arc<DaemonRouter>,
        timeouts: EndpointTimeouts,
        hello_timeout: Duration,
        shutdown: broadcast::Receiver<()>,
    ) -> Self {
        Self {
            listener,
            router,
            timeouts,
            hello_timeout,
            shutdown,
        }
    }

    pub async fn run(mut self) -> Result<()> {
        loop {
            tokio::select! {
                _ = self.shutdown.recv() => {
                    tracing::info!("tcp acceptor shutting down");
                    return Ok(());
                }

                accepted = self.listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(a) => a,
                        Err(e) => {
                            tracing::warn!(error = %e, "accept failed");
                            continue;
                        }
                    };
                    if let Err(e) = stream.set_nodelay(true) {
                        tracing::debug!(%peer, error = %e, "set_nodelay failed");
                    }
                    let router = self.router.clone();
                    let timeouts = self.timeouts.clone();
                    let hello_timeout = self.hello_timeout;
                    // One task per handshake.
                    tokio::spawn(async move {
                        if let Err(e) = hello::accept(stream, &router, timeouts, hello_timeout).await {
                            tracing::warn!(%peer, error = %e, "connection rejected");
                        }
                    });
                }
            }
        }
    }
}
