//! Bus controller.
//!
//! The daemon's own endpoint (`:<short>.1`): DBus name ownership, session
//! management, advertisement/discovery and the daemon-to-daemon protocol.
//!
//! Everything the controller originates goes through a single outbox task
//! so notifications reach each endpoint in the order the tables changed.
//! Method calls the controller makes (AcceptSession, AttachSession) are
//! pushed directly and matched against a pending-reply table.

mod bind;
pub mod discovery;
mod exchange;
mod join;
mod leave;
mod names;

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use rand::Rng;
use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot};

use junction_core::session::SessionId;
use junction_core::{BusError, Header, Message, MessageType};

use crate::endpoint::RemoteEndpoint;
use crate::ifaces::{errors, BUS_IFACE, BUS_PATH, DAEMON_IFACE, DAEMON_PATH, DBUS_IFACE, DBUS_PATH, DBUS_PEER_IFACE};
use crate::router::RouterCore;

pub use discovery::{NameMapEntry, NameService};
pub use join::JoinOutcome;
pub use leave::LeaveKind;

/// Handler for an interface the controller does not implement itself.
#[async_trait]
pub trait BusObject: Send + Sync {
    async fn handle(&self, msg: Message, sender: &RemoteEndpoint) -> Result<(), BusError>;
}

/// Result of a method handler.
enum Reply {
    /// Reply now, then post the follow-up messages.
    Args(Vec<Value>, Vec<Message>),
    /// A worker replies later.
    Deferred,
}

impl Reply {
    fn args(args: Vec<Value>) -> Self {
        Reply::Args(args, Vec::new())
    }
}

pub struct BusController {
    me: Weak<BusController>,
    core: Arc<RouterCore>,
    outbox: mpsc::UnboundedSender<Message>,
    pending: DashMap<u32, oneshot::Sender<Message>>,
    joins: join::JoinRegistry,
    discovery: Mutex<discovery::Discovery>,
    name_services: Mutex<Vec<Arc<dyn NameService>>>,
    objects: RwLock<HashMap<String, Arc<dyn BusObject>>>,
}

impl BusController {
    pub(crate) fn new(core: Arc<RouterCore>) -> Arc<Self> {
        let (outbox, rx) = mpsc::unbounded_channel();
        let bus = Arc::new_cyclic(|me| Self {
            me: me.clone(),
            core: core.clone(),
            outbox,
            pending: DashMap::new(),
            joins: join::JoinRegistry::new(),
            discovery: Mutex::new(discovery::Discovery::default()),
            name_services: Mutex::new(Vec::new()),
            objects: RwLock::new(HashMap::new()),
        });
        core.add_name_listener(Arc::new(names::OwnerChangeRelay::new(Arc::downgrade(&bus))));
        tokio::spawn(outbox_loop(core, rx));
        bus
    }

    pub fn core(&self) -> &Arc<RouterCore> {
        &self.core
    }

    /// Route an interface's calls and signals to `obj`.
    pub fn register_object(&self, interface: &str, obj: Arc<dyn BusObject>) {
        self.objects.write().insert(interface.to_string(), obj);
    }

    /// Alert every join worker and wait for them to finish.
    pub async fn shutdown(&self) {
        tracing::info!("bus controller shutting down");
        self.joins.shutdown().await;
    }

    // ── Outbound ─────────────────────────────────────────────────────────────

    /// Queue a message for ordered delivery.
    pub(crate) fn post(&self, msg: Message) {
        if self.outbox.send(msg).is_err() {
            tracing::debug!("outbox closed, dropping message");
        }
    }

    pub(crate) fn post_all(&self, msgs: Vec<Message>) {
        for m in msgs {
            self.post(m);
        }
    }

    /// Signal on the bus interface from the controller.
    pub(crate) fn signal(&self, dest: &str, member: &str, session: SessionId, args: Vec<Value>) -> Message {
        Message::new(
            Header::signal(dest, BUS_PATH, BUS_IFACE, member)
                .sender(self.core.controller_name())
                .serial(self.core.next_serial())
                .session(session),
            args,
        )
    }

    /// Signal on the daemon-to-daemon interface.
    pub(crate) fn daemon_signal(&self, dest: &str, member: &str, args: Vec<Value>) -> Message {
        Message::new(
            Header::signal(dest, DAEMON_PATH, DAEMON_IFACE, member)
                .sender(self.core.controller_name())
                .serial(self.core.next_serial()),
            args,
        )
    }

    pub(crate) fn dbus_signal(&self, member: &str, args: Vec<Value>) -> Message {
        Message::new(
            Header::signal("", DBUS_PATH, DBUS_IFACE, member)
                .sender(self.core.controller_name())
                .serial(self.core.next_serial()),
            args,
        )
    }

    /// Controller name of the daemon on the far side of `b2b`.
    pub(crate) fn remote_controller(b2b: &RemoteEndpoint) -> Option<String> {
        b2b.remote_guid().map(|g| format!("{}1", g.unique_prefix()))
    }

    /// Make a method call and wait for the reply. Error replies become
    /// `BusError::Failed` carrying the error name.
    pub async fn call_method(
        &self,
        via: &RemoteEndpoint,
        header: Header,
        args: Vec<Value>,
        timeout: Duration,
    ) -> Result<Message, BusError> {
        let serial = self.core.next_serial();
        let msg = Message::new(header.sender(self.core.controller_name()).serial(serial), args);
        let (tx, rx) = oneshot::channel();
        self.pending.insert(serial, tx);
        let _pending = PendingGuard {
            pending: &self.pending,
            serial,
        };

        via.push_message(msg).await?;
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(reply)) if reply.msg_type() == MessageType::Error => {
                Err(BusError::Failed(reply.error_name().to_string()))
            }
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(BusError::Stopping),
            Err(_) => Err(BusError::Timeout),
        }
    }

    fn complete_call(&self, reply: Message) -> Result<(), BusError> {
        match self.pending.remove(&reply.reply_serial()) {
            Some((_, tx)) => {
                let _ = tx.send(reply);
                Ok(())
            }
            None => Err(BusError::UnmatchedReplySerial),
        }
    }

    pub(crate) fn new_session_id(&self) -> SessionId {
        let mut rng = rand::thread_rng();
        let sessions = self.core.sessions.lock();
        loop {
            let id: SessionId = rng.gen();
            if id != 0 && !sessions.is_id_in_use(id) {
                return id;
            }
        }
    }

    // ── Inbound ──────────────────────────────────────────────────────────────

    pub(crate) async fn handle_message(&self, msg: Message, sender: &RemoteEndpoint) -> Result<(), BusError> {
        match msg.msg_type() {
            MessageType::MethodReturn | MessageType::Error => return self.complete_call(msg),
            _ => {}
        }

        let object = self.objects.read().get(msg.interface()).cloned();
        if let Some(obj) = object {
            return obj.handle(msg, sender).await;
        }

        if msg.msg_type() == MessageType::Signal {
            return self.handle_signal(msg, sender);
        }

        match self.handle_call(&msg, sender) {
            Ok(Reply::Args(args, then)) => {
                self.reply(&msg, args);
                self.post_all(then);
            }
            Ok(Reply::Deferred) => {}
            Err(e) => {
                tracing::debug!(member = msg.member(), sender = msg.sender(), error = %e, "controller call failed");
                self.reply_error(&msg, &e);
            }
        }
        Ok(())
    }

    fn handle_call(&self, msg: &Message, sender: &RemoteEndpoint) -> Result<Reply, BusError> {
        let from = msg.sender();
        match (msg.interface(), msg.member()) {
            (DBUS_PEER_IFACE, "Ping") => Ok(Reply::args(vec![])),

            (DBUS_IFACE, "RequestName") => {
                let reply = self.request_name(from, msg.str_arg(0)?, msg.u64_arg(1)? as u32)?;
                Ok(Reply::args(vec![json!(reply as u32)]))
            }
            (DBUS_IFACE, "ReleaseName") => {
                let reply = self.release_name(from, msg.str_arg(0)?);
                Ok(Reply::args(vec![json!(reply as u32)]))
            }
            (DBUS_IFACE, "GetNameOwner") => {
                let owner = self.get_name_owner(msg.str_arg(0)?).ok_or(BusError::NoEndpoint)?;
                Ok(Reply::args(vec![json!(owner)]))
            }
            (DBUS_IFACE, "NameHasOwner") => Ok(Reply::args(vec![json!(self.name_has_owner(msg.str_arg(0)?))])),
            (DBUS_IFACE, "ListNames") => Ok(Reply::args(vec![json!(self.list_names())])),

            (BUS_IFACE, "BindSessionPort") => {
                let (reply, port) = self.bind_session_port(from, msg.u64_arg(0)? as u16, msg.typed_arg(1)?);
                Ok(Reply::args(vec![json!(reply.code()), json!(port)]))
            }
            (BUS_IFACE, "UnbindSessionPort") => {
                let reply = self.unbind_session_port(from, msg.u64_arg(0)? as u16);
                Ok(Reply::args(vec![json!(reply.code())]))
            }
            (BUS_IFACE, "JoinSession") => {
                self.spawn_join(msg.clone())?;
                Ok(Reply::Deferred)
            }
            (BUS_IFACE, "LeaveSession") => self.handle_leave(msg, LeaveKind::Any),
            (BUS_IFACE, "LeaveHostedSession") => self.handle_leave(msg, LeaveKind::Hosted),
            (BUS_IFACE, "LeaveJoinedSession") => self.handle_leave(msg, LeaveKind::Joined),
            (BUS_IFACE, "RemoveSessionMember") => {
                let (reply, then) = self.remove_session_member_inner(from, msg.u64_arg(0)? as u32, msg.str_arg(1)?);
                Ok(Reply::Args(vec![json!(reply.code())], then))
            }
            (BUS_IFACE, "AdvertiseName") => {
                let reply = self.advertise_name(from, msg.str_arg(0)?, msg.u64_arg(1)? as u16);
                Ok(Reply::args(vec![json!(reply.code())]))
            }
            (BUS_IFACE, "CancelAdvertiseName") => {
                let reply = self.cancel_advertise_name(from, msg.str_arg(0)?);
                Ok(Reply::args(vec![json!(reply.code())]))
            }
            (BUS_IFACE, "FindAdvertisedName") => {
                let reply = self.find_advertised_name(from, msg.str_arg(0)?, junction_core::session::transport::ANY);
                Ok(Reply::args(vec![json!(reply.code())]))
            }
            (BUS_IFACE, "FindAdvertisedNameByTransport") => {
                let reply = self.find_advertised_name(from, msg.str_arg(0)?, msg.u64_arg(1)? as u16);
                Ok(Reply::args(vec![json!(reply.code())]))
            }
            (BUS_IFACE, "CancelFindAdvertisedName") => {
                let reply = self.cancel_find_advertised_name(from, msg.str_arg(0)?);
                Ok(Reply::args(vec![json!(reply.code())]))
            }

            (DAEMON_IFACE, "AttachSession") if sender.is_bus_to_bus() => {
                self.spawn_attach(msg.clone(), sender.clone())?;
                Ok(Reply::Deferred)
            }

            _ => Err(BusError::NotAllowed(format!("{}.{}", msg.interface(), msg.member()))),
        }
    }

    fn handle_signal(&self, msg: Message, sender: &RemoteEndpoint) -> Result<(), BusError> {
        if !sender.is_bus_to_bus() || msg.interface() != DAEMON_IFACE {
            tracing::trace!(member = msg.member(), "ignoring signal to controller");
            return Ok(());
        }
        match msg.member() {
            "ExchangeNames" => {
                let names: Vec<(String, Vec<String>)> = msg.typed_arg(0)?;
                self.exchange_names(sender, names);
            }
            "NameChanged" => {
                self.name_changed(sender, msg.str_arg(0)?, msg.str_arg(1)?, msg.str_arg(2)?);
            }
            "DetachSession" => {
                self.detach_session(sender, msg.u64_arg(0)? as u32, msg.str_arg(1)?);
            }
            "SessionMemberAdded" => {
                self.session_member_added(sender, msg.u64_arg(0)? as u32, msg.str_arg(1)?);
            }
            "SessionMemberRemoved" => {
                let reason = msg.u64_arg(2)? as u32;
                self.session_member_removed(msg.u64_arg(0)? as u32, msg.str_arg(1)?, reason);
            }
            other => tracing::trace!(member = other, "ignoring daemon signal"),
        }
        Ok(())
    }

    pub(crate) fn reply(&self, call: &Message, args: Vec<Value>) {
        if call.flags() & junction_core::message::flags::NO_REPLY_EXPECTED != 0 {
            return;
        }
        let reply = Message::new(
            Header::reply_to(call)
                .sender(self.core.controller_name())
                .serial(self.core.next_serial()),
            args,
        );
        self.post(reply);
    }

    pub(crate) fn reply_error(&self, call: &Message, err: &BusError) {
        let name = match err {
            BusError::Malformed(_) => errors::INVALID_ARGS,
            BusError::NotAllowed(_) => errors::UNKNOWN_METHOD,
            BusError::NoEndpoint => errors::NAME_HAS_NO_OWNER,
            _ => errors::FAILED,
        };
        let reply = Message::new(
            Header::error_to(call, name)
                .sender(self.core.controller_name())
                .serial(self.core.next_serial()),
            vec![json!(err.to_string())],
        );
        self.post(reply);
    }

    // ── Endpoint lifecycle ───────────────────────────────────────────────────

    pub(crate) fn endpoint_registered(&self, ep: &RemoteEndpoint) {
        let change = self.core.names.lock().add_unique(ep.unique_name());
        if let Some(change) = change {
            self.core.notify_name_changes(&[change]);
        }
        if ep.is_bus_to_bus() {
            let Some(bus) = self.me.upgrade() else {
                return;
            };
            let ep = ep.clone();
            tokio::spawn(async move {
                ep.started().await;
                bus.send_exchange_names(&ep);
            });
        }
    }

    pub(crate) fn endpoint_unregistered(&self, ep: &RemoteEndpoint) {
        let name = ep.unique_name().to_string();
        tracing::debug!(endpoint = %name, "cleaning up after endpoint");

        let changes = self.core.names.lock().remove_unique(&name);
        self.core.notify_name_changes(&changes);

        let status = ep.disconnect_status();
        self.remove_session_refs_for_endpoint(&name, status.as_ref());
        self.remove_discovery_for(&name);

        if ep.is_bus_to_bus() {
            self.b2b_disconnected(ep, status.as_ref());
        }
    }
}

struct PendingGuard<'a> {
    pending: &'a DashMap<u32, oneshot::Sender<Message>>,
    serial: u32,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.pending.remove(&self.serial);
    }
}

async fn outbox_loop(core: Arc<RouterCore>, mut rx: mpsc::UnboundedReceiver<Message>) {
    while let Some(msg) = rx.recv().await {
        if msg.is_broadcast_signal() {
            for ep in core.leaf_endpoints() {
                if let Err(e) = ep.push_message(msg.clone()).await {
                    tracing::debug!(endpoint = %ep.unique_name(), error = %e, "broadcast not delivered");
                }
            }
            continue;
        }
        if let Err(e) = core.deliver(msg.clone()).await {
            tracing::debug!(
                destination = msg.destination(),
                member = msg.member(),
                error = %e,
                "controller message not delivered"
            );
        }
    }
}
