//! Remote endpoint engine.
//!
//! A `RemoteEndpoint` is one logical connection to a peer: a client
//! application, or another daemon on a bus-to-bus link. It owns a read
//! pump that decodes frames and hands messages to the router, and a write
//! pump that drains a bounded transmit queue onto the stream.
//!
//! Pushers suspend when the queue is full and are admitted strictly in
//! arrival order. The first disconnect cause is recorded once and every
//! observer sees the same status.

mod pump;
pub mod state;
pub mod tx_queue;

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{watch, Notify};

use junction_core::config::{EndpointConfig, RouterConfig};
use junction_core::{BusError, Guid128, Message, WireCodec};

use crate::router::EndpointRouter;
use state::Lifecycle;
use tx_queue::{Admit, TxQueue};

/// Which side of the bus this endpoint sits on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Daemon side. Control messages get a separate allowance.
    Router,
    /// Application side.
    Leaf,
}

/// Anything a pump can run over.
pub trait BusStream: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin + 'static> BusStream for T {}

/// Connection metadata settled by the establish step.
#[derive(Debug, Clone)]
pub struct EndpointOptions {
    pub role: Role,
    pub bus_to_bus: bool,
    pub allow_remote: bool,
    pub handle_passing: bool,
    pub protocol_version: u32,
    /// Name the peer announced itself with.
    pub remote_name: String,
    pub remote_guid: Option<Guid128>,
    /// Sender stamped on probes this endpoint originates.
    pub local_sender: String,
}

impl Default for EndpointOptions {
    fn default() -> Self {
        Self {
            role: Role::Router,
            bus_to_bus: false,
            allow_remote: false,
            handle_passing: false,
            protocol_version: junction_core::session::PROTOCOL_VERSION,
            remote_name: String::new(),
            remote_guid: None,
            local_sender: String::new(),
        }
    }
}

/// Timers and limits applied at `start`.
#[derive(Debug, Clone)]
pub struct EndpointTimeouts {
    /// Zero disables idle probing.
    pub idle: Duration,
    pub probe: Duration,
    pub max_idle_probes: u32,
    /// Zero means writes never time out.
    pub send: Duration,
    pub max_control: usize,
    pub no_route_retries: u32,
    pub no_route_retry: Duration,
}

impl Default for EndpointTimeouts {
    fn default() -> Self {
        Self::from_config(&EndpointConfig::default(), &RouterConfig::default())
    }
}

impl EndpointTimeouts {
    pub fn from_config(endpoint: &EndpointConfig, router: &RouterConfig) -> Self {
        Self {
            idle: endpoint.idle_timeout(),
            probe: endpoint.probe_timeout(),
            max_idle_probes: endpoint.max_idle_probes,
            send: endpoint.send_timeout(),
            max_control: max_control_messages(endpoint),
            no_route_retries: router.no_route_retries,
            no_route_retry: Duration::from_millis(router.no_route_retry_ms),
        }
    }
}

/// Control messages a daemon-side endpoint may queue before it is judged
/// unresponsive.
pub fn max_control_messages(cfg: &EndpointConfig) -> usize {
    if cfg.send_timeout_secs == 0 {
        30
    } else {
        (cfg.send_timeout_secs as usize) * (cfg.max_control_msgs_per_sec as usize)
    }
}

pub(crate) struct EndpointInner {
    unique_name: OnceLock<String>,
    opts: EndpointOptions,
    tx: Mutex<TxQueue>,
    /// Wakes pushers waiting for room.
    tx_space: Notify,
    /// Wakes the write pump.
    tx_ready: Notify,
    lifecycle: watch::Sender<Lifecycle>,
    abort: watch::Sender<bool>,
    disconnect: OnceLock<BusError>,
    start_claimed: AtomicBool,
    router: Weak<dyn EndpointRouter>,
    codec: Arc<dyn WireCodec>,
    serial: AtomicU32,
}

/// Shared handle to one connection.
#[derive(Clone)]
pub struct RemoteEndpoint(pub(crate) Arc<EndpointInner>);

impl std::fmt::Debug for RemoteEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteEndpoint")
            .field("name", &self.unique_name())
            .field("bus_to_bus", &self.0.opts.bus_to_bus)
            .field("state", &self.lifecycle().state())
            .finish()
    }
}

impl RemoteEndpoint {
    pub fn new(router: Weak<dyn EndpointRouter>, codec: Arc<dyn WireCodec>, opts: EndpointOptions) -> Self {
        let max_control = max_control_messages(&EndpointConfig::default());
        let (lifecycle, _) = watch::channel(Lifecycle::default());
        let (abort, _) = watch::channel(false);
        Self(Arc::new(EndpointInner {
            unique_name: OnceLock::new(),
            tx: Mutex::new(TxQueue::new(opts.role, max_control)),
            opts,
            tx_space: Notify::new(),
            tx_ready: Notify::new(),
            lifecycle,
            abort,
            disconnect: OnceLock::new(),
            start_claimed: AtomicBool::new(false),
            router,
            codec,
            serial: AtomicU32::new(1),
        }))
    }

    // ── Identity ─────────────────────────────────────────────────────────────

    pub fn unique_name(&self) -> &str {
        self.0.unique_name.get().map(String::as_str).unwrap_or("")
    }

    /// Assign the bus name. Only the first call succeeds.
    pub fn set_unique_name(&self, name: impl Into<String>) -> Result<(), BusError> {
        self.0.unique_name.set(name.into()).map_err(|_| BusError::NameAlreadySet)
    }

    pub fn ptr_eq(&self, other: &RemoteEndpoint) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    pub fn options(&self) -> &EndpointOptions {
        &self.0.opts
    }

    pub fn is_bus_to_bus(&self) -> bool {
        self.0.opts.bus_to_bus
    }

    pub fn allows_remote(&self) -> bool {
        self.0.opts.allow_remote
    }

    pub fn protocol_version(&self) -> u32 {
        self.0.opts.protocol_version
    }

    pub fn remote_name(&self) -> &str {
        &self.0.opts.remote_name
    }

    pub fn remote_guid(&self) -> Option<Guid128> {
        self.0.opts.remote_guid
    }

    pub fn role(&self) -> Role {
        self.0.opts.role
    }

    pub fn next_serial(&self) -> u32 {
        loop {
            let s = self.0.serial.fetch_add(1, Ordering::Relaxed);
            if s != 0 {
                return s;
            }
        }
    }

    // ── State ────────────────────────────────────────────────────────────────

    pub fn lifecycle(&self) -> Lifecycle {
        *self.0.lifecycle.borrow()
    }

    pub fn subscribe_lifecycle(&self) -> watch::Receiver<Lifecycle> {
        self.0.lifecycle.subscribe()
    }

    pub fn is_accepting(&self) -> bool {
        self.lifecycle().is_accepting()
    }

    /// First recorded disconnect cause. `None` after an orderly close.
    pub fn disconnect_status(&self) -> Option<BusError> {
        self.0.disconnect.get().cloned()
    }

    pub(crate) fn record_disconnect(&self, err: BusError) {
        if self.0.disconnect.set(err.clone()).is_ok() {
            tracing::debug!(endpoint = %self.unique_name(), error = %err, "disconnect status recorded");
        }
    }

    pub fn tx_queue_len(&self) -> usize {
        self.0.tx.lock().len()
    }

    pub fn tx_is_empty(&self) -> bool {
        self.0.tx.lock().is_empty()
    }

    // ── Lifecycle ────────────────────────────────────────────────────────────

    /// Register with the router and spawn the pumps.
    pub fn start<S: BusStream>(&self, stream: S, timeouts: EndpointTimeouts) -> Result<(), BusError> {
        if self.0.start_claimed.swap(true, Ordering::AcqRel) || self.lifecycle().was_started() {
            return Err(BusError::AlreadyStarted);
        }

        self.0.tx.lock().set_max_control(timeouts.max_control);

        let registered = match self.0.router.upgrade() {
            Some(router) => router.register_endpoint(self),
            None => Err(BusError::NoRoute),
        };
        if let Err(e) = registered {
            tracing::warn!(endpoint = %self.unique_name(), error = %e, "router refused endpoint");
            self.0.start_claimed.store(false, Ordering::Release);
            return Err(BusError::NoRoute);
        }

        self.0.lifecycle.send_modify(|l| {
            l.start();
        });
        tracing::info!(
            endpoint = %self.unique_name(),
            bus_to_bus = self.is_bus_to_bus(),
            protocol = self.protocol_version(),
            "endpoint started"
        );

        let ep = self.clone();
        tokio::spawn(async move {
            let (reader, writer) = tokio::io::split(stream);
            tokio::join!(pump::read_pump(&ep, reader, &timeouts), pump::write_pump(&ep, writer, &timeouts));
            ep.cleanup();
        });
        Ok(())
    }

    /// Resolves once `start` has moved the endpoint to `Started` or beyond.
    pub async fn started(&self) {
        let mut rx = self.subscribe_lifecycle();
        let _ = rx.wait_for(|l| l.was_started()).await;
    }

    /// Stop accepting pushes and let the write pump drain. Idempotent.
    pub fn stop(&self) {
        let changed = self.0.lifecycle.send_if_modified(|l| l.local_stop());
        self.0.tx.lock().close();
        self.0.tx_space.notify_waiters();
        self.0.tx_ready.notify_one();
        if changed {
            tracing::debug!(endpoint = %self.unique_name(), "endpoint stopping");
        }
    }

    /// Stop once the transmit queue has drained, or after `max_wait`.
    pub fn stop_after_tx_empty(&self, max_wait: Duration) {
        let ep = self.clone();
        tokio::spawn(async move {
            let drained = async {
                loop {
                    let notified = ep.0.tx_space.notified();
                    tokio::pin!(notified);
                    notified.as_mut().enable();
                    if ep.tx_is_empty() || ep.0.tx.lock().is_closed() {
                        return;
                    }
                    notified.await;
                }
            };
            if tokio::time::timeout(max_wait, drained).await.is_err() {
                tracing::debug!(endpoint = %ep.unique_name(), queued = ep.tx_queue_len(), "stopping with messages still queued");
            }
            ep.stop();
        });
    }

    /// Abandon the stream immediately.
    pub fn abort(&self) {
        self.0.abort.send_replace(true);
        self.0.tx.lock().close();
        self.0.tx_space.notify_waiters();
        self.0.tx_ready.notify_one();
    }

    pub(crate) fn abort_with(&self, err: BusError) {
        tracing::warn!(endpoint = %self.unique_name(), error = %err, "endpoint aborting");
        self.record_disconnect(err);
        self.abort();
    }

    pub(crate) fn abort_rx(&self) -> watch::Receiver<bool> {
        self.0.abort.subscribe()
    }

    /// Wait for the endpoint to reach its terminal state. After `max_wait`
    /// the stream is aborted and the wait continues until cleanup is done.
    pub async fn join(&self, max_wait: Duration) {
        if !self.0.start_claimed.load(Ordering::Acquire) {
            return;
        }
        let mut rx = self.subscribe_lifecycle();
        let timed_out = tokio::time::timeout(max_wait, rx.wait_for(|l| l.is_terminal()))
            .await
            .is_err();
        if timed_out {
            tracing::debug!(endpoint = %self.unique_name(), "join timed out, aborting");
            self.abort();
            let _ = rx.wait_for(|l| l.is_terminal()).await;
        }
    }

    fn cleanup(&self) {
        self.0.lifecycle.send_if_modified(|l| l.halt());
        self.0.tx.lock().close();
        self.0.tx_space.notify_waiters();

        if let Some(router) = self.0.router.upgrade() {
            router.unregister_endpoint(self);
        }
        self.0.lifecycle.send_if_modified(|l| l.exited());
        tracing::info!(
            endpoint = %self.unique_name(),
            status = ?self.disconnect_status(),
            "endpoint stopped"
        );
    }

    // ── Transmit ─────────────────────────────────────────────────────────────

    /// Queue a message for the peer, waiting for room when the queue is
    /// full. Messages from concurrent callers go out in admission order.
    pub async fn push_message(&self, msg: Message) -> Result<(), BusError> {
        if !self.is_accepting() {
            return Err(BusError::EndpointClosing);
        }
        let inner = &self.0;

        let ticket = {
            let mut tx = inner.tx.lock();
            if tx.is_closed() {
                return Err(BusError::EndpointClosing);
            }
            if tx.bypasses_waiters(&msg) || !tx.has_waiters() {
                match tx.admit(&msg) {
                    Admit::Queued => {
                        drop(tx);
                        inner.tx_ready.notify_one();
                        return Ok(());
                    }
                    Admit::Overflow => {
                        drop(tx);
                        tracing::warn!(
                            endpoint = %self.unique_name(),
                            "control message allowance exhausted, stopping endpoint"
                        );
                        self.stop();
                        return Err(BusError::EndpointClosing);
                    }
                    Admit::Full => {}
                }
            }
            tx.enqueue_waiter()
        };

        let mut guard = WaiterGuard {
            ep: self,
            ticket,
            armed: true,
        };

        loop {
            let notified = inner.tx_space.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let wait = {
                let mut tx = inner.tx.lock();
                if tx.is_closed() {
                    return Err(BusError::EndpointClosing);
                }
                if tx.is_head_waiter(ticket) {
                    let purged = tx.purge_expired();
                    if purged > 0 {
                        tracing::debug!(endpoint = %self.unique_name(), purged, "dropped expired messages");
                    }
                    if tx.admit(&msg) == Admit::Queued {
                        tx.remove_waiter(ticket);
                        guard.armed = false;
                        drop(tx);
                        inner.tx_ready.notify_one();
                        inner.tx_space.notify_waiters();
                        return Ok(());
                    }
                }
                tx.nearest_expiry()
            };

            match wait {
                Some(d) => {
                    let _ = tokio::time::timeout(d, notified).await;
                }
                None => notified.await,
            }
        }
    }
}

/// Removes a pusher's ticket when its future is dropped or fails, and
/// wakes the next waiter if it was at the head.
struct WaiterGuard<'a> {
    ep: &'a RemoteEndpoint,
    ticket: u64,
    armed: bool,
}

impl Drop for WaiterGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let was_head = self.ep.0.tx.lock().remove_waiter(self.ticket);
        if was_head {
            self.ep.0.tx_space.notify_waiters();
        }
    }
}
