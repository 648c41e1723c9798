//! Message routing.
//!
//! `RouterCore` owns the shared tables: local endpoints, bus names,
//! sessions and virtual endpoints. `DaemonRouter` is what endpoints talk
//! to; it routes every inbound message to the bus controller, a local
//! endpoint, or a bus-to-bus link.
//!
//! Lock order: names → sessions → virtuals. Never hold one across an
//! `.await`.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;

use junction_core::config::RouterConfig;
use junction_core::message::flags;
use junction_core::session::SessionId;
use junction_core::{BusError, Guid128, Message};

use crate::bus::BusController;
use crate::endpoint::RemoteEndpoint;
use crate::ifaces::is_bus_controller_destination;
use crate::name_table::{NameChange, NameListener, NameTable};
use crate::session_map::SessionMap;

/// What an endpoint needs from whoever routes its traffic.
#[async_trait]
pub trait EndpointRouter: Send + Sync {
    /// Called from `start`. An error leaves the endpoint unstarted.
    fn register_endpoint(&self, ep: &RemoteEndpoint) -> Result<(), BusError>;

    /// Called once from the endpoint's cleanup.
    fn unregister_endpoint(&self, ep: &RemoteEndpoint);

    async fn push_message(&self, msg: Message, sender: &RemoteEndpoint) -> Result<(), BusError>;
}

// ── Virtual endpoints ─────────────────────────────────────────────────────────

/// A unique name on another daemon, reachable over one or more
/// bus-to-bus links.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VirtualEndpoint {
    pub unique_name: String,
    /// `(session id, b2b endpoint name)`. Id 0 is the default route.
    routes: Vec<(SessionId, String)>,
}

impl VirtualEndpoint {
    pub fn new(unique_name: &str) -> Self {
        Self {
            unique_name: unique_name.to_string(),
            routes: Vec::new(),
        }
    }

    pub fn add_route(&mut self, id: SessionId, b2b: &str) -> bool {
        if self.routes.iter().any(|(sid, name)| *sid == id && name == b2b) {
            return false;
        }
        self.routes.push((id, b2b.to_string()));
        true
    }

    /// Session-specific route first, then the default one.
    pub fn route_for(&self, id: SessionId) -> Option<&str> {
        self.routes
            .iter()
            .find(|(sid, _)| *sid == id && id != 0)
            .or_else(|| self.routes.iter().find(|(sid, _)| *sid == 0))
            .or_else(|| self.routes.first())
            .map(|(_, name)| name.as_str())
    }

    pub fn has_session_route(&self, id: SessionId) -> bool {
        self.routes.iter().any(|(sid, _)| *sid == id)
    }

    /// Drop every route through `b2b`. Returns the session ids it carried.
    pub fn remove_routes_via(&mut self, b2b: &str) -> Vec<SessionId> {
        let mut removed = Vec::new();
        self.routes.retain(|(sid, name)| {
            if name == b2b {
                removed.push(*sid);
                false
            } else {
                true
            }
        });
        removed
    }

    pub fn remove_session_routes(&mut self, id: SessionId) {
        self.routes.retain(|(sid, _)| *sid != id);
    }

    pub fn routes_via(&self, b2b: &str) -> bool {
        self.routes.iter().any(|(_, name)| name == b2b)
    }

    /// Reachable only through `b2b`.
    pub fn only_via(&self, b2b: &str) -> bool {
        !self.routes.is_empty() && self.routes.iter().all(|(_, name)| name == b2b)
    }

    pub fn is_orphaned(&self) -> bool {
        self.routes.is_empty()
    }
}

pub type VirtualEndpoints = BTreeMap<String, VirtualEndpoint>;

// ── Core ──────────────────────────────────────────────────────────────────────

pub struct RouterCore {
    guid: Guid128,
    controller_name: String,
    local_prefix: String,
    next_unique: AtomicU32,
    serial: AtomicU32,
    config: RouterConfig,
    endpoints: DashMap<String, RemoteEndpoint>,
    pub(crate) names: Mutex<NameTable>,
    pub(crate) sessions: Mutex<SessionMap>,
    pub(crate) virtuals: Mutex<VirtualEndpoints>,
    listeners: Mutex<Vec<Arc<dyn NameListener>>>,
}

impl RouterCore {
    pub fn new(guid: Guid128, config: RouterConfig) -> Self {
        let local_prefix = guid.unique_prefix();
        Self {
            guid,
            controller_name: format!("{local_prefix}1"),
            local_prefix,
            next_unique: AtomicU32::new(2),
            serial: AtomicU32::new(1),
            config,
            endpoints: DashMap::new(),
            names: Mutex::new(NameTable::new()),
            sessions: Mutex::new(SessionMap::new()),
            virtuals: Mutex::new(VirtualEndpoints::new()),
            listeners: Mutex::new(Vec::new()),
        }
    }

    pub fn guid(&self) -> Guid128 {
        self.guid
    }

    /// `:<short>.1`, the name the bus controller sends from.
    pub fn controller_name(&self) -> &str {
        &self.controller_name
    }

    pub fn config(&self) -> &RouterConfig {
        &self.config
    }

    pub fn is_local_name(&self, name: &str) -> bool {
        name.starts_with(&self.local_prefix)
    }

    /// Hand out the next `:<short>.<n>` name.
    pub fn new_unique_name(&self) -> String {
        let n = self.next_unique.fetch_add(1, Ordering::Relaxed);
        format!("{}{n}", self.local_prefix)
    }

    pub fn next_serial(&self) -> u32 {
        loop {
            let s = self.serial.fetch_add(1, Ordering::Relaxed);
            if s != 0 {
                return s;
            }
        }
    }

    pub fn endpoint(&self, name: &str) -> Option<RemoteEndpoint> {
        self.endpoints.get(name).map(|e| e.value().clone())
    }

    pub fn leaf_endpoints(&self) -> Vec<RemoteEndpoint> {
        self.endpoints
            .iter()
            .filter(|e| !e.value().is_bus_to_bus())
            .map(|e| e.value().clone())
            .collect()
    }

    pub fn b2b_endpoints(&self) -> Vec<RemoteEndpoint> {
        self.endpoints
            .iter()
            .filter(|e| e.value().is_bus_to_bus())
            .map(|e| e.value().clone())
            .collect()
    }

    pub fn all_endpoints(&self) -> Vec<RemoteEndpoint> {
        self.endpoints.iter().map(|e| e.value().clone()).collect()
    }

    pub(crate) fn insert_endpoint(&self, ep: &RemoteEndpoint) -> Result<(), BusError> {
        let name = ep.unique_name();
        if name.is_empty() {
            return Err(BusError::NoEndpoint);
        }
        match self.endpoints.entry(name.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(BusError::NameAlreadySet),
            dashmap::mapref::entry::Entry::Vacant(v) => {
                v.insert(ep.clone());
                Ok(())
            }
        }
    }

    pub(crate) fn remove_endpoint(&self, ep: &RemoteEndpoint) -> bool {
        self.endpoints
            .remove_if(ep.unique_name(), |_, existing| existing.ptr_eq(ep))
            .is_some()
    }

    pub fn add_name_listener(&self, listener: Arc<dyn NameListener>) {
        self.listeners.lock().push(listener);
    }

    /// Fan owner changes out to listeners. Call with no table lock held.
    pub fn notify_name_changes(&self, changes: &[NameChange]) {
        if changes.is_empty() {
            return;
        }
        let listeners = self.listeners.lock().clone();
        for change in changes {
            for l in &listeners {
                l.name_owner_changed(change);
            }
        }
    }

    /// Unique name that currently answers for `dest`.
    pub fn resolve(&self, dest: &str) -> Option<String> {
        if dest.starts_with(':') {
            return Some(dest.to_string());
        }
        self.names.lock().owner(dest).map(String::from)
    }

    /// Endpoint a message for unique name `name` must be pushed to.
    pub fn route_target(&self, name: &str, session_id: SessionId) -> Option<RemoteEndpoint> {
        if let Some(ep) = self.endpoint(name) {
            return Some(ep);
        }
        let via = self
            .virtuals
            .lock()
            .get(name)
            .and_then(|v| v.route_for(session_id))
            .map(String::from);
        if let Some(b2b) = via {
            return self.endpoint(&b2b);
        }
        self.remote_controller_link(name)
    }

    /// Bus-to-bus link to the daemon whose controller is `name`.
    pub fn remote_controller_link(&self, name: &str) -> Option<RemoteEndpoint> {
        let short = name.strip_prefix(':')?.strip_suffix(".1")?;
        self.endpoints
            .iter()
            .find(|e| {
                e.value().is_bus_to_bus() && e.value().remote_guid().is_some_and(|g| g.short() == short)
            })
            .map(|e| e.value().clone())
    }

    /// Unicast delivery by destination.
    pub async fn deliver(&self, msg: Message) -> Result<(), BusError> {
        let owner = self.resolve(msg.destination()).ok_or(BusError::NoRoute)?;
        let target = self.route_target(&owner, msg.session_id()).ok_or(BusError::NoRoute)?;
        target.push_message(msg).await
    }
}

// ── Daemon router ─────────────────────────────────────────────────────────────

/// Routes messages for one daemon.
pub struct DaemonRouter {
    core: Arc<RouterCore>,
    bus: Arc<BusController>,
}

impl DaemonRouter {
    /// Must be called from within a tokio runtime.
    pub fn new(guid: Guid128, config: RouterConfig) -> Arc<Self> {
        let core = Arc::new(RouterCore::new(guid, config));
        let bus = BusController::new(core.clone());
        Arc::new(Self { core, bus })
    }

    pub fn core(&self) -> &Arc<RouterCore> {
        &self.core
    }

    pub fn bus(&self) -> &Arc<BusController> {
        &self.bus
    }

    async fn route(&self, msg: Message, sender: &RemoteEndpoint) -> Result<(), BusError> {
        let dest = msg.destination();

        if is_bus_controller_destination(dest, self.core.controller_name()) {
            return self.bus.handle_message(msg, sender).await;
        }

        if msg.is_broadcast_signal() {
            if msg.session_id() != 0 {
                return self.session_broadcast(msg, sender).await;
            }
            self.broadcast(msg, sender).await;
            return Ok(());
        }

        let owner = self.core.resolve(dest).ok_or(BusError::NoRoute)?;
        let target = self
            .core
            .route_target(&owner, msg.session_id())
            .ok_or(BusError::NoRoute)?;
        if target.ptr_eq(sender) && sender.is_bus_to_bus() {
            return Err(BusError::NoRoute);
        }
        target.push_message(msg).await
    }

    /// Non-session broadcast: every other local endpoint, plus peer
    /// daemons when the sender asked for a global broadcast.
    async fn broadcast(&self, msg: Message, sender: &RemoteEndpoint) {
        for ep in self.core.leaf_endpoints() {
            if ep.ptr_eq(sender) {
                continue;
            }
            if sender.is_bus_to_bus() && !ep.allows_remote() {
                continue;
            }
            if let Err(e) = ep.push_message(msg.clone()).await {
                tracing::debug!(endpoint = %ep.unique_name(), error = %e, "broadcast not delivered");
            }
        }
        if msg.flags() & flags::GLOBAL_BROADCAST != 0 {
            let from_guid = sender.remote_guid();
            for b2b in self.core.b2b_endpoints() {
                if b2b.ptr_eq(sender) || (from_guid.is_some() && b2b.remote_guid() == from_guid) {
                    continue;
                }
                if let Err(e) = b2b.push_message(msg.clone()).await {
                    tracing::debug!(endpoint = %b2b.unique_name(), error = %e, "global broadcast not forwarded");
                }
            }
        }
    }

    /// Broadcast signal scoped to one session: every other participant.
    async fn session_broadcast(&self, msg: Message, sender: &RemoteEndpoint) -> Result<(), BusError> {
        let id = msg.session_id();
        let from = msg.sender().to_string();

        let targets: Vec<RemoteEndpoint> = if sender.is_bus_to_bus() {
            let locals: Vec<String> = self
                .core
                .sessions
                .lock()
                .entries_for_id(id)
                .into_iter()
                .map(|e| e.endpoint_name.clone())
                .filter(|name| *name != from)
                .collect();
            locals.iter().filter_map(|n| self.core.endpoint(n)).collect()
        } else {
            let participants = {
                let sessions = self.core.sessions.lock();
                let entry = sessions.get(&from, id).ok_or(BusError::NoRoute)?;
                entry.participants()
            };
            let mut targets: Vec<RemoteEndpoint> = Vec::new();
            for p in participants.iter().filter(|p| **p != from) {
                if let Some(ep) = self.core.route_target(p, id) {
                    // One copy per link; the far daemon fans out to its members.
                    if !targets.iter().any(|t| t.ptr_eq(&ep)) {
                        targets.push(ep);
                    }
                }
            }
            targets
        };

        for ep in targets {
            if let Err(e) = ep.push_message(msg.clone()).await {
                tracing::debug!(endpoint = %ep.unique_name(), session = id, error = %e, "session signal not delivered");
            }
        }
        Ok(())
    }
}

#[async_trait]
impl EndpointRouter for DaemonRouter {
    fn register_endpoint(&self, ep: &RemoteEndpoint) -> Result<(), BusError> {
        self.core.insert_endpoint(ep)?;
        self.bus.endpoint_registered(ep);
        Ok(())
    }

    fn unregister_endpoint(&self, ep: &RemoteEndpoint) {
        if self.core.remove_endpoint(ep) {
            self.bus.endpoint_unregistered(ep);
        }
    }

    async fn push_message(&self, msg: Message, sender: &RemoteEndpoint) -> Result<(), BusError> {
        let msg = if !sender.is_bus_to_bus() && msg.sender() != sender.unique_name() {
            msg.restamp(sender.unique_name(), msg.serial())
        } else {
            msg
        };
        self.route(msg, sender).await
    }
}
