//! Leaving sessions, removing members, and purging a departed
//! participant from everyone else's view.

use serde_json::json;

use junction_core::session::{
    LeaveReply, RemoveMemberReply, SessionId, SessionLostDisposition, SessionLostReason, SELF_JOIN_MIN_PROTOCOL,
};
use junction_core::{BusError, Message};

use super::{BusController, Reply};
use crate::endpoint::RemoteEndpoint;

/// Which side of a session a leave applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaveKind {
    Hosted,
    Joined,
    /// Whichever role the sender has. Refused for a self-joined host.
    Any,
}

/// Roles of a departing participant to purge from other entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum Departure {
    Host,
    Member,
    Both,
}

impl Departure {
    fn clears_host(self) -> bool {
        matches!(self, Departure::Host | Departure::Both)
    }

    fn removes_member(self) -> bool {
        matches!(self, Departure::Member | Departure::Both)
    }
}

impl BusController {
    pub fn leave_session(&self, sender: &str, id: SessionId, kind: LeaveKind) -> LeaveReply {
        let (reply, then) = self.leave_inner(sender, id, kind);
        self.post_all(then);
        reply
    }

    pub(super) fn handle_leave(&self, msg: &Message, kind: LeaveKind) -> Result<Reply, BusError> {
        let id = msg.u64_arg(0)? as SessionId;
        let (reply, then) = self.leave_inner(msg.sender(), id, kind);
        tracing::debug!(sender = msg.sender(), session = id, ?kind, ?reply, "leave session");
        Ok(Reply::Args(vec![json!(reply.code())], then))
    }

    fn leave_inner(&self, sender: &str, id: SessionId, kind: LeaveKind) -> (LeaveReply, Vec<Message>) {
        if id == 0 {
            return (LeaveReply::NoSession, Vec::new());
        }
        let (role, participants) = {
            let mut sessions = self.core.sessions.lock();
            let Some(entry) = sessions.get_mut(sender, id) else {
                return (LeaveReply::NoSession, Vec::new());
            };
            let is_host = entry.session_host == sender;
            let is_member = entry.member_names.iter().any(|m| m == sender);
            let role = match kind {
                LeaveKind::Hosted if is_host => Departure::Host,
                LeaveKind::Joined if is_member => Departure::Member,
                LeaveKind::Any if is_host && is_member => return (LeaveReply::NoSession, Vec::new()),
                LeaveKind::Any if is_host => Departure::Host,
                LeaveKind::Any if is_member => Departure::Member,
                _ => return (LeaveReply::NoSession, Vec::new()),
            };
            let participants = entry.participants();

            // A self-joined endpoint keeps its entry for the role it still has.
            let keep = match role {
                Departure::Host if is_member => {
                    entry.session_host.clear();
                    !entry.is_lost()
                }
                Departure::Member if is_host => {
                    entry.remove_member(sender);
                    !entry.member_names.is_empty()
                }
                _ => false,
            };
            if !keep {
                sessions.remove(sender, id);
            }
            (role, participants)
        };

        let mut then = self.detach_remote(sender, id, &participants, None);
        then.extend(self.remove_refs(sender, id, SessionLostReason::RemoteEndLeft, role));
        self.prune_session_routes(id);
        (LeaveReply::Success, then)
    }

    /// Tell each daemon carrying a remote participant that `name` left.
    fn detach_remote(
        &self,
        name: &str,
        id: SessionId,
        participants: &[String],
        skip: Option<&RemoteEndpoint>,
    ) -> Vec<Message> {
        let mut links: Vec<RemoteEndpoint> = Vec::new();
        for p in participants.iter().filter(|p| *p != name && !self.core.is_local_name(p)) {
            let Some(link) = self.core.route_target(p, id).filter(RemoteEndpoint::is_bus_to_bus) else {
                continue;
            };
            if skip.is_some_and(|s| s.ptr_eq(&link)) || links.iter().any(|l| l.ptr_eq(&link)) {
                continue;
            }
            links.push(link);
        }
        links
            .iter()
            .filter_map(Self::remote_controller)
            .map(|dest| self.daemon_signal(&dest, "DetachSession", vec![json!(id), json!(name)]))
            .collect()
    }

    // ── Member removal ───────────────────────────────────────────────────────

    pub fn remove_session_member(&self, binder: &str, id: SessionId, member: &str) -> RemoveMemberReply {
        let (reply, then) = self.remove_session_member_inner(binder, id, member);
        self.post_all(then);
        reply
    }

    pub(super) fn remove_session_member_inner(
        &self,
        binder: &str,
        id: SessionId,
        member: &str,
    ) -> (RemoveMemberReply, Vec<Message>) {
        let reason = if member == binder {
            SessionLostReason::RemovedByBinderSelf
        } else {
            SessionLostReason::RemovedByBinder
        };
        {
            let sessions = self.core.sessions.lock();
            let Some(entry) = sessions.get(binder, id) else {
                return (RemoveMemberReply::NoSession, Vec::new());
            };
            if entry.session_host != binder {
                return (RemoveMemberReply::NotBinder, Vec::new());
            }
            if !entry.opts.is_multipoint {
                return (RemoveMemberReply::NotMultipoint, Vec::new());
            }
            if !entry.member_names.iter().any(|m| m == member) {
                return (RemoveMemberReply::NotFound, Vec::new());
            }
        }

        let mut then = Vec::new();
        if self.core.is_local_name(member) {
            then.extend(self.drop_member_entry(member, id, reason));
        } else {
            let Some(link) = self.core.route_target(member, id).filter(RemoteEndpoint::is_bus_to_bus) else {
                return (RemoveMemberReply::Failed, Vec::new());
            };
            if link.protocol_version() < SELF_JOIN_MIN_PROTOCOL {
                return (RemoveMemberReply::IncompatibleRemoteDaemon, Vec::new());
            }
            let Some(dest) = Self::remote_controller(&link) else {
                return (RemoveMemberReply::Failed, Vec::new());
            };
            then.push(self.daemon_signal(
                &dest,
                "SessionMemberRemoved",
                vec![json!(id), json!(member), json!(reason.code())],
            ));
            if let Some(v) = self.core.virtuals.lock().get_mut(member) {
                v.remove_session_routes(id);
            }
        }
        then.extend(self.remove_refs(member, id, reason, Departure::Member));
        self.prune_session_routes(id);
        tracing::info!(binder, member, session = id, ?reason, "removed session member");
        (RemoveMemberReply::Success, then)
    }

    /// A remote host removed one of our members.
    pub(super) fn session_member_removed(&self, id: SessionId, member: &str, reason: u32) {
        if !self.core.is_local_name(member) {
            return;
        }
        let reason = SessionLostReason::from_code(reason).unwrap_or(SessionLostReason::RemovedByBinder);
        let mut then = self.drop_member_entry(member, id, reason);
        then.extend(self.remove_refs(member, id, reason, Departure::Member));
        self.prune_session_routes(id);
        self.post_all(then);
    }

    /// Remove `member`'s membership from its own entry and tell it.
    fn drop_member_entry(&self, member: &str, id: SessionId, reason: SessionLostReason) -> Vec<Message> {
        let mut sessions = self.core.sessions.lock();
        let Some(entry) = sessions.get_mut(member, id) else {
            return Vec::new();
        };
        if entry.session_host == member {
            // Self-joined host keeps hosting.
            entry.remove_member(member);
            if entry.member_names.is_empty() {
                sessions.remove(member, id);
            }
        } else {
            sessions.remove(member, id);
        }
        drop(sessions);
        self.session_lost(member, id, reason, SessionLostDisposition::Member)
    }

    /// A participant on another daemon left session `id`.
    pub(super) fn detach_session(&self, b2b: &RemoteEndpoint, id: SessionId, name: &str) {
        if self.core.is_local_name(name) {
            return;
        }
        let participants: Vec<String> = {
            let sessions = self.core.sessions.lock();
            let mut all = Vec::new();
            for entry in sessions.entries_for_id(id) {
                for p in entry.participants() {
                    if !all.contains(&p) {
                        all.push(p);
                    }
                }
            }
            all
        };
        let mut then = self.remove_refs(name, id, SessionLostReason::RemoteEndLeft, Departure::Both);
        if !then.is_empty() {
            then.extend(self.detach_remote(name, id, &participants, Some(b2b)));
        }
        if let Some(v) = self.core.virtuals.lock().get_mut(name) {
            v.remove_session_routes(id);
        }
        self.prune_session_routes(id);
        self.post_all(then);
    }

    // ── Purge ────────────────────────────────────────────────────────────────

    /// Purge `name` from every other local participant's view of `id`.
    pub fn remove_session_refs(&self, name: &str, id: SessionId, reason: SessionLostReason) {
        let then = self.remove_refs(name, id, reason, Departure::Both);
        self.prune_session_routes(id);
        self.post_all(then);
    }

    pub(super) fn remove_refs(
        &self,
        name: &str,
        id: SessionId,
        reason: SessionLostReason,
        which: Departure,
    ) -> Vec<Message> {
        let mut out = Vec::new();
        let mut sessions = self.core.sessions.lock();
        let others: Vec<String> = sessions
            .entries_for_id(id)
            .into_iter()
            .map(|e| e.endpoint_name.clone())
            .filter(|n| n != name)
            .collect();

        for other in others {
            let (lost, disposition, multipoint) = {
                let Some(entry) = sessions.get_mut(&other, id) else {
                    continue;
                };
                let mut changed = false;
                if which.clears_host() && entry.session_host == name {
                    entry.session_host.clear();
                    changed = true;
                }
                if which.removes_member() && entry.remove_member(name) {
                    changed = true;
                }
                if !changed {
                    continue;
                }
                let disposition = if entry.member_names.len() == 1 {
                    SessionLostDisposition::Member
                } else {
                    SessionLostDisposition::Host
                };
                (entry.is_lost(), disposition, entry.opts.is_multipoint)
            };
            if lost {
                sessions.remove(&other, id);
                out.extend(self.session_lost(&other, id, reason, disposition));
            } else if multipoint {
                out.push(self.mp_session_changed(&other, id, name, false));
            }
        }
        out
    }

    pub(super) fn session_lost(
        &self,
        dest: &str,
        id: SessionId,
        reason: SessionLostReason,
        disposition: SessionLostDisposition,
    ) -> Vec<Message> {
        tracing::debug!(endpoint = dest, session = id, ?reason, ?disposition, "session lost");
        vec![
            self.signal(dest, "SessionLost", id, vec![json!(id)]),
            self.signal(dest, "SessionLostWithReason", id, vec![json!(id), json!(reason.code())]),
            self.signal(
                dest,
                "SessionLostWithReasonAndDisposition",
                id,
                vec![json!(id), json!(reason.code()), json!(disposition.code())],
            ),
        ]
    }

    /// Drop virtual routes for `id` once no local endpoint is in it.
    fn prune_session_routes(&self, id: SessionId) {
        let sessions = self.core.sessions.lock();
        if sessions.is_id_in_use(id) {
            return;
        }
        let mut virtuals = self.core.virtuals.lock();
        for v in virtuals.values_mut() {
            v.remove_session_routes(id);
        }
    }

    /// Everything `name` took part in goes away with it.
    pub(super) fn remove_session_refs_for_endpoint(&self, name: &str, status: Option<&BusError>) {
        let reason = SessionLostReason::from_status(status);
        let owned: Vec<(SessionId, Vec<String>)> = {
            let mut sessions = self.core.sessions.lock();
            for port in sessions.bound_ports(name) {
                self.joins.forget_binding(name, port);
            }
            sessions.remove(name, 0);
            let ids = sessions.ids_for(name);
            ids.into_iter()
                .filter_map(|id| sessions.remove(name, id).map(|e| (id, e.participants())))
                .collect()
        };

        let mut then = Vec::new();
        for (id, participants) in owned {
            then.extend(self.detach_remote(name, id, &participants, None));
            then.extend(self.remove_refs(name, id, reason, Departure::Both));
            self.prune_session_routes(id);
        }
        self.post_all(then);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::router::DaemonRouter;
    use crate::session_map::SessionMapEntry;
    use junction_core::config::RouterConfig;
    use junction_core::session::SessionOpts;
    use junction_core::Guid128;
    use std::sync::Arc;

    fn entry(name: &str, id: SessionId, host: &str, members: &[&String], multipoint: bool) -> SessionMapEntry {
        SessionMapEntry {
            endpoint_name: name.to_string(),
            id,
            session_host: host.to_string(),
            session_port: 42,
            opts: if multipoint {
                SessionOpts::multipoint()
            } else {
                SessionOpts::default()
            },
            member_names: members.iter().map(|m| m.to_string()).collect(),
            is_initializing: false,
        }
    }

    fn setup<const N: usize>() -> (Arc<DaemonRouter>, [String; N]) {
        let router = DaemonRouter::new(Guid128::generate(), RouterConfig::default());
        let names = std::array::from_fn(|_| router.core().new_unique_name());
        (router, names)
    }

    fn sent(messages: &[Message]) -> Vec<(String, String)> {
        messages
            .iter()
            .map(|m| (m.destination().to_string(), m.member().to_string()))
            .collect()
    }

    fn to(dest: &str, member: &str) -> (String, String) {
        (dest.to_string(), member.to_string())
    }

    #[tokio::test]
    async fn member_leaving_point_to_point_loses_host_session() {
        let (router, [h, m]) = setup();
        {
            let mut s = router.core().sessions.lock();
            s.insert(entry(&h, 9, &h, &[&m], false));
            s.insert(entry(&m, 9, &h, &[&m], false));
        }
        let (reply, then) = router.bus().leave_inner(&m, 9, LeaveKind::Joined);
        assert_eq!(reply, LeaveReply::Success);
        assert_eq!(sent(&then)[0], to(&h, "SessionLost"));
        assert_eq!(then.len(), 3);
        assert!(router.core().sessions.lock().is_empty());

        let last = &then[2];
        assert_eq!(last.member(), "SessionLostWithReasonAndDisposition");
        assert_eq!(last.u64_arg(1).ok(), Some(SessionLostReason::RemoteEndLeft.code() as u64));
        assert_eq!(last.u64_arg(2).ok(), Some(SessionLostDisposition::Host.code() as u64));
    }

    #[tokio::test]
    async fn multipoint_leave_notifies_survivors() {
        let (router, [h, m1, m2]) = setup();
        {
            let mut s = router.core().sessions.lock();
            s.insert(entry(&h, 9, &h, &[&m1, &m2], true));
            s.insert(entry(&m1, 9, &h, &[&m1, &m2], true));
            s.insert(entry(&m2, 9, &h, &[&m1, &m2], true));
        }
        let (reply, then) = router.bus().leave_inner(&m2, 9, LeaveKind::Any);
        assert_eq!(reply, LeaveReply::Success);
        assert_eq!(sent(&then), vec![to(&h, "MPSessionChanged"), to(&m1, "MPSessionChanged")]);
        assert_eq!(then[0].str_arg(1).ok(), Some(m2.as_str()));
        assert_eq!(then[0].arg(2).and_then(|v| v.as_bool()), Some(false));

        let s = router.core().sessions.lock();
        assert_eq!(s.get(&m1, 9).map(|e| e.member_names.clone()), Some(vec![m1.clone()]));
        assert!(s.get(&m2, 9).is_none());
    }

    #[tokio::test]
    async fn host_leaving_leaves_lone_member_with_member_disposition() {
        let (router, [h, m]) = setup();
        {
            let mut s = router.core().sessions.lock();
            s.insert(entry(&h, 9, &h, &[&m], true));
            s.insert(entry(&m, 9, &h, &[&m], true));
        }
        let (reply, then) = router.bus().leave_inner(&h, 9, LeaveKind::Hosted);
        assert_eq!(reply, LeaveReply::Success);
        assert_eq!(then.len(), 3);
        assert_eq!(then[2].destination(), m);
        assert_eq!(then[2].u64_arg(2).ok(), Some(SessionLostDisposition::Member.code() as u64));
    }

    #[tokio::test]
    async fn self_joined_host_must_say_which_role() {
        let (router, [h, m]) = setup();
        let bus = router.bus();
        {
            let mut s = router.core().sessions.lock();
            s.insert(entry(&h, 9, &h, &[&h, &m], true));
            s.insert(entry(&m, 9, &h, &[&h, &m], true));
        }
        assert_eq!(bus.leave_inner(&h, 9, LeaveKind::Any).0, LeaveReply::NoSession);
        assert_eq!(bus.leave_inner(&m, 9, LeaveKind::Hosted).0, LeaveReply::NoSession);
        assert_eq!(bus.leave_inner(&h, 0, LeaveKind::Hosted).0, LeaveReply::NoSession);

        let (reply, _) = bus.leave_inner(&h, 9, LeaveKind::Joined);
        assert_eq!(reply, LeaveReply::Success);
        let s = router.core().sessions.lock();
        assert_eq!(s.get(&h, 9).map(|e| e.member_names.clone()), Some(vec![m.clone()]));
        assert_eq!(s.get(&m, 9).map(|e| e.member_names.clone()), Some(vec![m.clone()]));
    }

    #[tokio::test]
    async fn remove_member_checks_binder_and_mode() {
        let (router, [h, m1, m2, p2p, p2p_member, stranger]) = setup();
        let bus = router.bus();
        {
            let mut s = router.core().sessions.lock();
            s.insert(entry(&h, 9, &h, &[&m1, &m2], true));
            s.insert(entry(&m1, 9, &h, &[&m1, &m2], true));
            s.insert(entry(&m2, 9, &h, &[&m1, &m2], true));
            s.insert(entry(&p2p, 10, &p2p, &[&p2p_member], false));
        }
        assert_eq!(bus.remove_session_member_inner(&m1, 9, &m2).0, RemoveMemberReply::NotBinder);
        assert_eq!(bus.remove_session_member_inner(&p2p, 10, &p2p_member).0, RemoveMemberReply::NotMultipoint);
        assert_eq!(bus.remove_session_member_inner(&h, 9, &stranger).0, RemoveMemberReply::NotFound);
        assert_eq!(bus.remove_session_member_inner(&h, 11, &m2).0, RemoveMemberReply::NoSession);

        let (reply, then) = bus.remove_session_member_inner(&h, 9, &m2);
        assert_eq!(reply, RemoveMemberReply::Success);
        assert_eq!(then[0].destination(), m2);
        assert_eq!(then[1].u64_arg(1).ok(), Some(SessionLostReason::RemovedByBinder.code() as u64));
        assert_eq!(sent(&then[3..]), vec![to(&h, "MPSessionChanged"), to(&m1, "MPSessionChanged")]);
        assert!(router.core().sessions.lock().get(&m2, 9).is_none());
    }

    #[tokio::test]
    async fn binder_removing_itself() {
        let (router, [h, m]) = setup();
        {
            let mut s = router.core().sessions.lock();
            s.insert(entry(&h, 9, &h, &[&h, &m], true));
            s.insert(entry(&m, 9, &h, &[&h, &m], true));
        }
        let (reply, then) = router.bus().remove_session_member_inner(&h, 9, &h);
        assert_eq!(reply, RemoveMemberReply::Success);
        assert_eq!(then[0].destination(), h);
        assert_eq!(then[1].u64_arg(1).ok(), Some(SessionLostReason::RemovedByBinderSelf.code() as u64));
        let s = router.core().sessions.lock();
        assert_eq!(s.get(&h, 9).map(|e| e.session_host.clone()), Some(h.clone()));
    }

    #[tokio::test]
    async fn endpoint_death_purges_bindings_and_sessions() {
        let (router, [h, m1, m2]) = setup();
        let bus = router.bus();
        bus.bind_session_port(&h, 42, SessionOpts::multipoint());
        {
            let mut s = router.core().sessions.lock();
            s.insert(entry(&h, 9, &h, &[&m1, &m2], true));
            s.insert(entry(&m1, 9, &h, &[&m1, &m2], true));
            s.insert(entry(&m2, 9, &h, &[&m1, &m2], true));
        }
        bus.remove_session_refs_for_endpoint(&h, Some(&BusError::OtherEndClosed));
        let s = router.core().sessions.lock();
        assert!(s.binding(&h, 42).is_none());
        assert!(s.get(&h, 9).is_none());
        // Two members and no host is still a session.
        let survivor = s.get(&m1, 9).cloned();
        assert_eq!(survivor.as_ref().map(|e| e.session_host.is_empty()), Some(true));
        assert_eq!(survivor.map(|e| e.member_names.len()), Some(2));
    }
}
