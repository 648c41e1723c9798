//! Outbound bus-to-bus links to configured peers, redialled when they drop.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::net::TcpStream;
use tokio::sync::broadcast;

use junction_router::{DaemonRouter, EndpointTimeouts, RemoteEndpoint};

use super::hello;

const REDIAL_DELAY: Duration = Duration::from_secs(5);

pub struct PeerConnector {
    peer: String,
    router: Arc<DaemonRouter>,
    timeouts: EndpointTimeouts,
    hello_timeout: Duration,
    shutdown: broadcast::Receiver<()>,
}

impl PeerConnector {
    pub fn new(
        peer: String,
        router: Arc<DaemonRouter>,
        timeouts: EndpointTimeouts,
        hello_timeout: Duration,
        shutdown: broadcast::Receiver<()>,
    ) -> Self {
        Self {
            peer,
            router,
            timeouts,
            hello_timeout,
            shutdown,
        }
    }

    pub async fn run(mut self) -> Result<()> {
        loop {
            let link = tokio::select! {
                _ = self.shutdown.recv() => {
                    tracing::info!(peer = %self.peer, "peer connector shutting down");
                    return Ok(());
                }
                link = dial(&self.peer, &self.router, self.timeouts.clone(), self.hello_timeout) => link,
            };

            match link {
                Ok(ep) => {
                    let mut lifecycle = ep.subscribe_lifecycle();
                    tokio::select! {
                        _ = self.shutdown.recv() => return Ok(()),
                        _ = lifecycle.wait_for(|l| l.is_terminal()) => {
                            tracing::info!(peer = %self.peer, status = ?ep.disconnect_status(), "peer link lost");
                        }
                    }
                }
                Err(e) => tracing::warn!(peer = %self.peer, error = %e, "dial failed"),
            }

            tokio::select! {
                _ = self.shutdown.recv() => return Ok(()),
                _ = tokio::time::sleep(REDIAL_DELAY) => {}
            }
        }
    }
}

async fn dial(
    peer: &str,
    router: &Arc<DaemonRouter>,
    timeouts: EndpointTimeouts,
    hello_timeout: Duration,
) -> Result<RemoteEndpoint> {
    let stream = TcpStream::connect(peer)
        .await
        .with_context(|| format!("connect to {peer}"))?;
    stream.set_nodelay(true).ok();
    hello::connect(stream, router, timeouts, hello_timeout).await
}
