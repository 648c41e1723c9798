//! Joining sessions.
//!
//! A join runs on a tracked worker. Joins to the same `(host, port)` are
//! serialized, and the session map is only touched once the host accepted,
//! so a failed join leaves no trace.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde_json::{json, Value};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use junction_core::session::{
    JoinReply, MpSessionChangeReason, SessionId, SessionOpts, SessionPort, SELF_JOIN_MIN_PROTOCOL,
};
use junction_core::{BusError, Header, Message};

use super::BusController;
use crate::endpoint::RemoteEndpoint;
use crate::ifaces::{DAEMON_IFACE, DAEMON_PATH, PEER_SESSION_IFACE, PEER_SESSION_PATH};
use crate::router::VirtualEndpoint;
use crate::session_map::SessionMapEntry;

/// Result of a join as reported to the joiner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JoinOutcome {
    pub reply: JoinReply,
    pub id: SessionId,
    pub opts: SessionOpts,
}

impl JoinOutcome {
    fn refused(reply: JoinReply) -> Self {
        Self {
            reply,
            id: 0,
            opts: SessionOpts::default(),
        }
    }

    fn reply_args(&self) -> Vec<Value> {
        vec![json!(self.reply.code()), json!(self.id), json!(self.opts)]
    }
}

// ── Worker registry ───────────────────────────────────────────────────────────

pub(super) struct JoinRegistry {
    alert: watch::Sender<bool>,
    next_worker: AtomicU64,
    workers: DashMap<u64, JoinHandle<()>>,
    binding_locks: DashMap<(String, SessionPort), Arc<tokio::sync::Mutex<()>>>,
}

impl JoinRegistry {
    pub(super) fn new() -> Self {
        let (alert, _) = watch::channel(false);
        Self {
            alert,
            next_worker: AtomicU64::new(1),
            workers: DashMap::new(),
            binding_locks: DashMap::new(),
        }
    }

    fn is_alerted(&self) -> bool {
        *self.alert.borrow()
    }

    fn track(&self, handle: JoinHandle<()>) {
        self.workers.retain(|_, h| !h.is_finished());
        let id = self.next_worker.fetch_add(1, Ordering::Relaxed);
        self.workers.insert(id, handle);
    }

    fn binding_lock(&self, host: &str, port: SessionPort) -> Arc<tokio::sync::Mutex<()>> {
        self.binding_locks
            .entry((host.to_string(), port))
            .or_default()
            .clone()
    }

    pub(super) fn forget_binding(&self, host: &str, port: SessionPort) {
        self.binding_locks.remove(&(host.to_string(), port));
    }

    pub(super) fn active(&self) -> usize {
        self.workers.iter().filter(|h| !h.value().is_finished()).count()
    }

    pub(super) async fn shutdown(&self) {
        self.alert.send_replace(true);
        let ids: Vec<u64> = self.workers.iter().map(|e| *e.key()).collect();
        for id in ids {
            if let Some((_, handle)) = self.workers.remove(&id) {
                let _ = handle.await;
            }
        }
    }
}

async fn alerted(rx: &mut watch::Receiver<bool>) {
    let _ = rx.wait_for(|a| *a).await;
}

struct JoinPlan {
    id: SessionId,
    opts: SessionOpts,
    self_join: bool,
}

impl BusController {
    /// Join `joiner` to the session `host` offers on `port`.
    pub async fn join_session(&self, joiner: &str, host: &str, port: SessionPort, opts: SessionOpts) -> JoinOutcome {
        let (outcome, then) = self.join_inner(joiner, host, port, opts).await;
        self.post_all(then);
        outcome
    }

    /// Join workers still running.
    pub fn active_joins(&self) -> usize {
        self.joins.active()
    }

    pub(super) fn spawn_join(&self, msg: Message) -> Result<(), BusError> {
        let host = msg.str_arg(0)?.to_string();
        let port = msg.u64_arg(1)? as SessionPort;
        let opts: SessionOpts = msg.typed_arg(2)?;
        if self.joins.is_alerted() {
            return Err(BusError::Stopping);
        }
        let bus = self.me.upgrade().ok_or(BusError::Stopping)?;
        let mut alert = self.joins.alert.subscribe();

        let handle = tokio::spawn(async move {
            let joiner = msg.sender().to_string();
            let (outcome, then) = tokio::select! {
                r = bus.join_inner(&joiner, &host, port, opts) => r,
                _ = alerted(&mut alert) => (JoinOutcome::refused(JoinReply::Failed), Vec::new()),
            };
            tracing::info!(joiner = %joiner, host = %host, port, reply = ?outcome.reply, session = outcome.id, "join session");
            bus.reply(&msg, outcome.reply_args());
            bus.post_all(then);
        });
        self.joins.track(handle);
        Ok(())
    }

    /// Remote half of a join: `b2b` carries a joiner that lives on another
    /// daemon.
    pub(super) fn spawn_attach(&self, msg: Message, b2b: RemoteEndpoint) -> Result<(), BusError> {
        let port = msg.u64_arg(0)? as SessionPort;
        let joiner = msg.str_arg(1)?.to_string();
        let host = msg.str_arg(2)?.to_string();
        let opts: SessionOpts = msg.typed_arg(3)?;
        if self.joins.is_alerted() {
            return Err(BusError::Stopping);
        }
        let bus = self.me.upgrade().ok_or(BusError::Stopping)?;
        let mut alert = self.joins.alert.subscribe();

        let handle = tokio::spawn(async move {
            let (outcome, members, then) = tokio::select! {
                r = bus.attach_local(&joiner, &host, port, opts, Some(&b2b)) => r,
                _ = alerted(&mut alert) => (JoinOutcome::refused(JoinReply::Failed), Vec::new(), Vec::new()),
            };
            tracing::info!(joiner = %joiner, host = %host, port, reply = ?outcome.reply, session = outcome.id, "attach session");
            let mut args = outcome.reply_args();
            args.push(json!(members));
            bus.reply(&msg, args);
            bus.post_all(then);
        });
        self.joins.track(handle);
        Ok(())
    }

    async fn join_inner(
        &self,
        joiner: &str,
        host: &str,
        port: SessionPort,
        opts: SessionOpts,
    ) -> (JoinOutcome, Vec<Message>) {
        let Some(host) = self.core.resolve(host) else {
            return (JoinOutcome::refused(JoinReply::Unreachable), Vec::new());
        };
        if self.core.is_local_name(&host) {
            let (outcome, _, then) = self.attach_local(joiner, &host, port, opts, None).await;
            (outcome, then)
        } else {
            self.join_remote(joiner, &host, port, opts).await
        }
    }

    // ── Host on this daemon ──────────────────────────────────────────────────

    async fn attach_local(
        &self,
        joiner: &str,
        host: &str,
        port: SessionPort,
        opts: SessionOpts,
        via: Option<&RemoteEndpoint>,
    ) -> (JoinOutcome, Vec<String>, Vec<Message>) {
        let lock = self.joins.binding_lock(host, port);
        let _serial = lock.lock().await;

        let plan = match self.plan_join(joiner, host, port, &opts) {
            Ok(plan) => plan,
            Err(reply) => return (JoinOutcome::refused(reply), Vec::new(), Vec::new()),
        };
        let Some(host_ep) = self.core.endpoint(host) else {
            return (JoinOutcome::refused(JoinReply::Unreachable), Vec::new(), Vec::new());
        };
        if let Err(reply) = self.accept_session(&host_ep, port, plan.id, joiner, plan.opts).await {
            return (JoinOutcome::refused(reply), Vec::new(), Vec::new());
        }
        self.commit_join(joiner, host, port, &plan, via)
    }

    fn plan_join(&self, joiner: &str, host: &str, port: SessionPort, opts: &SessionOpts) -> Result<JoinPlan, JoinReply> {
        let self_join = joiner == host;
        if self_join {
            let proto = self
                .core
                .endpoint(joiner)
                .map(|ep| ep.protocol_version())
                .unwrap_or(SELF_JOIN_MIN_PROTOCOL);
            if proto < SELF_JOIN_MIN_PROTOCOL {
                return Err(JoinReply::Failed);
            }
        }

        let (negotiated, existing) = {
            let sessions = self.core.sessions.lock();
            let binding = sessions.binding(host, port).ok_or(JoinReply::NoSession)?;
            if !binding.opts.is_compatible(opts) {
                return Err(JoinReply::BadSessionOpts);
            }
            let existing = if binding.opts.is_multipoint {
                sessions.hosted_session(host, port)
            } else {
                None
            };
            if existing.is_some_and(|e| e.member_names.iter().any(|m| m == joiner)) {
                return Err(JoinReply::AlreadyJoined);
            }
            (binding.opts.negotiate(opts), existing.map(|e| e.id))
        };

        let id = existing.unwrap_or_else(|| self.new_session_id());
        Ok(JoinPlan {
            id,
            opts: negotiated,
            self_join,
        })
    }

    async fn accept_session(
        &self,
        host_ep: &RemoteEndpoint,
        port: SessionPort,
        id: SessionId,
        joiner: &str,
        opts: SessionOpts,
    ) -> Result<(), JoinReply> {
        let header = Header::method_call(host_ep.unique_name(), PEER_SESSION_PATH, PEER_SESSION_IFACE, "AcceptSession");
        let args = vec![json!(port), json!(id), json!(joiner), json!(opts)];
        let timeout = Duration::from_millis(self.core.config().accept_timeout_ms);
        match self.call_method(host_ep, header, args, timeout).await {
            Ok(reply) if reply.arg(0).and_then(Value::as_bool) == Some(true) => Ok(()),
            Ok(_) | Err(BusError::Failed(_)) => Err(JoinReply::Rejected),
            Err(BusError::Timeout) | Err(BusError::Stopping) => Err(JoinReply::Failed),
            Err(e) => {
                tracing::debug!(host = %host_ep.unique_name(), error = %e, "AcceptSession not delivered");
                Err(JoinReply::Unreachable)
            }
        }
    }

    fn commit_join(
        &self,
        joiner: &str,
        host: &str,
        port: SessionPort,
        plan: &JoinPlan,
        via: Option<&RemoteEndpoint>,
    ) -> (JoinOutcome, Vec<String>, Vec<Message>) {
        let id = plan.id;
        let (members, participants) = {
            let mut sessions = self.core.sessions.lock();
            if sessions.binding(host, port).is_none() {
                return (JoinOutcome::refused(JoinReply::NoSession), Vec::new(), Vec::new());
            }
            // Endpoints are dropped from the registry before their session
            // refs are purged, so a joiner gone here would never be cleaned.
            if !self.joiner_still_present(joiner, via) {
                tracing::debug!(session = id, host, joiner, "joiner disappeared while joining");
                return (JoinOutcome::refused(JoinReply::Failed), Vec::new(), Vec::new());
            }
            let mut host_entry = sessions.get(host, id).cloned().unwrap_or_else(|| SessionMapEntry {
                endpoint_name: host.to_string(),
                id,
                session_host: host.to_string(),
                session_port: port,
                opts: plan.opts,
                member_names: Vec::new(),
                is_initializing: false,
            });
            if !host_entry.add_member(joiner) {
                return (JoinOutcome::refused(JoinReply::AlreadyJoined), Vec::new(), Vec::new());
            }
            let members = host_entry.member_names.clone();
            let participants = host_entry.participants();

            for entry in sessions.entries_for_id_mut(id) {
                if entry.endpoint_name != host && entry.endpoint_name != joiner {
                    entry.add_member(joiner);
                }
            }
            sessions.insert(host_entry);
            if !plan.self_join && via.is_none() {
                sessions.insert(SessionMapEntry {
                    endpoint_name: joiner.to_string(),
                    id,
                    session_host: host.to_string(),
                    session_port: port,
                    opts: plan.opts,
                    member_names: members.clone(),
                    is_initializing: false,
                });
            }
            if let Some(b2b) = via {
                self.core
                    .virtuals
                    .lock()
                    .entry(joiner.to_string())
                    .or_insert_with(|| VirtualEndpoint::new(joiner))
                    .add_route(id, b2b.unique_name());
            }
            (members, participants)
        };

        let mut then = vec![self.signal(host, "SessionJoined", id, vec![json!(port), json!(id), json!(joiner)])];
        if plan.opts.is_multipoint {
            then.extend(self.member_added_notices(id, joiner, &participants, via.is_none()));
            then.extend(self.announce_member(id, joiner, &participants, via));
        }
        tracing::debug!(session = id, host, joiner, members = members.len(), "session joined");
        (
            JoinOutcome {
                reply: JoinReply::Success,
                id,
                opts: plan.opts,
            },
            members,
            then,
        )
    }

    fn joiner_still_present(&self, joiner: &str, via: Option<&RemoteEndpoint>) -> bool {
        match via {
            Some(b2b) => b2b.is_accepting() && self.core.endpoint(b2b.unique_name()).is_some(),
            None => self.core.endpoint(joiner).is_some_and(|ep| ep.is_accepting()),
        }
    }

    // ── Host on another daemon ───────────────────────────────────────────────

    async fn join_remote(
        &self,
        joiner: &str,
        host: &str,
        port: SessionPort,
        opts: SessionOpts,
    ) -> (JoinOutcome, Vec<Message>) {
        let lock = self.joins.binding_lock(host, port);
        let _serial = lock.lock().await;

        let Some(b2b) = self.core.route_target(host, 0).filter(RemoteEndpoint::is_bus_to_bus) else {
            return (JoinOutcome::refused(JoinReply::Unreachable), Vec::new());
        };
        let Some(dest) = Self::remote_controller(&b2b) else {
            return (JoinOutcome::refused(JoinReply::Unreachable), Vec::new());
        };
        if self.already_member_of(joiner, host, port) {
            return (JoinOutcome::refused(JoinReply::AlreadyJoined), Vec::new());
        }

        let header = Header::method_call(&dest, DAEMON_PATH, DAEMON_IFACE, "AttachSession");
        let args = vec![json!(port), json!(joiner), json!(host), json!(opts)];
        let timeout = Duration::from_millis(self.core.config().attach_timeout_ms);
        let reply = match self.call_method(&b2b, header, args, timeout).await {
            Ok(reply) => reply,
            Err(BusError::Timeout) | Err(BusError::Stopping) | Err(BusError::Failed(_)) => {
                return (JoinOutcome::refused(JoinReply::Failed), Vec::new());
            }
            Err(e) => {
                tracing::debug!(host, link = %b2b.unique_name(), error = %e, "AttachSession not delivered");
                return (JoinOutcome::refused(JoinReply::Unreachable), Vec::new());
            }
        };
        let (outcome, members) = match parse_attach_reply(&reply) {
            Ok(parsed) => parsed,
            Err(e) => {
                tracing::warn!(host, error = %e, "malformed AttachSession reply");
                return (JoinOutcome::refused(JoinReply::Failed), Vec::new());
            }
        };
        if outcome.reply != JoinReply::Success {
            return (outcome, Vec::new());
        }

        let id = outcome.id;
        {
            let mut sessions = self.core.sessions.lock();
            for entry in sessions.entries_for_id_mut(id) {
                if entry.endpoint_name != joiner {
                    entry.add_member(joiner);
                }
            }
            sessions.insert(SessionMapEntry {
                endpoint_name: joiner.to_string(),
                id,
                session_host: host.to_string(),
                session_port: port,
                opts: outcome.opts,
                member_names: members.clone(),
                is_initializing: false,
            });
            let mut virtuals = self.core.virtuals.lock();
            for name in std::iter::once(host).chain(members.iter().map(String::as_str)) {
                if self.core.is_local_name(name) {
                    continue;
                }
                virtuals
                    .entry(name.to_string())
                    .or_insert_with(|| VirtualEndpoint::new(name))
                    .add_route(id, b2b.unique_name());
            }
        }

        let mut then = Vec::new();
        if outcome.opts.is_multipoint {
            let mut participants = vec![host.to_string()];
            participants.extend(members.iter().filter(|m| *m != host).cloned());
            for p in participants.iter().filter(|p| *p != joiner) {
                then.push(self.mp_session_changed(joiner, id, p, true));
            }
        }
        (outcome, then)
    }

    fn already_member_of(&self, joiner: &str, host: &str, port: SessionPort) -> bool {
        let sessions = self.core.sessions.lock();
        sessions.ids_for(joiner).into_iter().any(|id| {
            id != 0
                && sessions
                    .get(joiner, id)
                    .is_some_and(|e| e.session_host == host && e.session_port == port && e.opts.is_multipoint)
        })
    }

    // ── Notifications ────────────────────────────────────────────────────────

    /// `MPSessionChanged` for every other participant, plus catch-up for
    /// the joiner when it is ours to notify.
    fn member_added_notices(&self, id: SessionId, joiner: &str, participants: &[String], catch_up: bool) -> Vec<Message> {
        let mut out = Vec::new();
        for p in participants.iter().filter(|p| *p != joiner) {
            out.push(self.mp_session_changed(p, id, joiner, true));
        }
        if catch_up {
            for p in participants.iter().filter(|p| *p != joiner) {
                out.push(self.mp_session_changed(joiner, id, p, true));
            }
        }
        out
    }

    pub(super) fn mp_session_changed(&self, dest: &str, id: SessionId, member: &str, added: bool) -> Message {
        let local = same_daemon(dest, member);
        let reason = match (added, local) {
            (true, true) => MpSessionChangeReason::LocalMemberAdded,
            (true, false) => MpSessionChangeReason::RemoteMemberAdded,
            (false, true) => MpSessionChangeReason::LocalMemberRemoved,
            (false, false) => MpSessionChangeReason::RemoteMemberRemoved,
        };
        self.signal(
            dest,
            "MPSessionChanged",
            id,
            vec![json!(id), json!(member), json!(added), json!(reason.code())],
        )
    }
}

/// Whether two unique names were handed out by the same daemon.
fn same_daemon(a: &str, b: &str) -> bool {
    match (a.rfind('.'), b.rfind('.')) {
        (Some(i), Some(j)) => a[..i] == b[..j],
        _ => false,
    }
}

fn parse_attach_reply(reply: &Message) -> Result<(JoinOutcome, Vec<String>), BusError> {
    let code = reply.u64_arg(0)? as u32;
    let reply_code = JoinReply::from_code(code).ok_or_else(|| BusError::Malformed(format!("join reply {code}")))?;
    if reply_code != JoinReply::Success {
        return Ok((JoinOutcome::refused(reply_code), Vec::new()));
    }
    let outcome = JoinOutcome {
        reply: reply_code,
        id: reply.u64_arg(1)? as SessionId,
        opts: reply.typed_arg(2)?,
    };
    let members: Vec<String> = reply.typed_arg(3)?;
    Ok((outcome, members))
}
