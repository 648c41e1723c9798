//! Daemon-to-daemon name exchange and link teardown.
//!
//! Remote unique names become virtual endpoints routed through the link
//! that announced them; remote well-known names become virtual aliases.
//! Anything that changed our view is passed on to the other links, never
//! back to a daemon with the announcer's GUID.

use serde_json::json;

use junction_core::session::{SessionId, SessionLostReason};
use junction_core::{BusError, Message};

use super::leave::Departure;
use super::BusController;
use crate::endpoint::RemoteEndpoint;
use crate::name_table::NameChange;
use crate::router::VirtualEndpoint;

impl BusController {
    /// Full snapshot of what is reachable through us, minus what `link`
    /// itself gave us.
    pub(super) fn send_exchange_names(&self, link: &RemoteEndpoint) {
        let Some(dest) = Self::remote_controller(link) else {
            return;
        };
        let list: Vec<(String, Vec<String>)> = {
            let table = self.core.names.lock();
            let virtuals = self.core.virtuals.lock();
            let mut list: Vec<(String, Vec<String>)> = table
                .unique_names()
                .filter(|u| self.core.endpoint(u).is_some_and(|ep| !ep.is_bus_to_bus()))
                .map(|u| (u.to_string(), table.aliases_of(u)))
                .collect();
            for (name, v) in virtuals.iter() {
                if v.is_orphaned() || v.only_via(link.unique_name()) {
                    continue;
                }
                list.push((name.clone(), table.aliases_of(name)));
            }
            list
        };
        tracing::debug!(link = %link.unique_name(), names = list.len(), "sending ExchangeNames");
        self.post(self.daemon_signal(&dest, "ExchangeNames", vec![json!(list)]));
    }

    pub(super) fn exchange_names(&self, link: &RemoteEndpoint, names: Vec<(String, Vec<String>)>) {
        let via = link.unique_name();
        let mut changed = false;
        let mut visible: Vec<NameChange> = Vec::new();
        let mut accepted: Vec<(String, Vec<String>)> = Vec::new();
        {
            let mut table = self.core.names.lock();
            let mut virtuals = self.core.virtuals.lock();
            for (unique, aliases) in names {
                if !unique.starts_with(':') || self.core.is_local_name(&unique) {
                    continue;
                }
                let is_new = !virtuals.contains_key(&unique);
                let vep = virtuals
                    .entry(unique.clone())
                    .or_insert_with(|| VirtualEndpoint::new(&unique));
                changed |= vep.add_route(0, via);
                if is_new {
                    visible.push(NameChange {
                        name: unique.clone(),
                        old_owner: None,
                        new_owner: Some(unique.clone()),
                    });
                }
                for alias in &aliases {
                    let (c, v) = table.set_virtual_alias(alias, Some(&unique));
                    changed |= c;
                    visible.extend(v);
                }
                accepted.push((unique, aliases));
            }
        }
        self.core.notify_name_changes(&visible);

        tracing::debug!(link = %via, names = accepted.len(), changed, "ExchangeNames");
        if changed {
            for (dest, _) in self.other_links(link) {
                self.post(self.daemon_signal(&dest, "ExchangeNames", vec![json!(accepted)]));
            }
        }
    }

    /// An owner change announced by the daemon behind `link`. Empty strings
    /// stand for "no owner".
    pub(super) fn name_changed(&self, link: &RemoteEndpoint, alias: &str, old: &str, new: &str) {
        if alias.starts_with(':') {
            if self.core.is_local_name(alias) {
                return;
            }
            let changed = if new.is_empty() {
                self.remote_unique_gone(link, alias)
            } else {
                let is_new = {
                    let mut virtuals = self.core.virtuals.lock();
                    let is_new = !virtuals.contains_key(alias);
                    let added = virtuals
                        .entry(alias.to_string())
                        .or_insert_with(|| VirtualEndpoint::new(alias))
                        .add_route(0, link.unique_name());
                    if !added {
                        return;
                    }
                    is_new
                };
                if is_new {
                    self.core.notify_name_changes(&[NameChange {
                        name: alias.to_string(),
                        old_owner: None,
                        new_owner: Some(alias.to_string()),
                    }]);
                }
                true
            };
            if changed {
                self.forward_name_changed(link, alias, old, new);
            }
            return;
        }

        // Our own names echoed back.
        if (!new.is_empty() && self.core.is_local_name(new)) || (new.is_empty() && self.core.is_local_name(old)) {
            return;
        }
        let (changed, visible) = {
            let mut table = self.core.names.lock();
            if new.is_empty() {
                if table.virtual_owner(alias) != Some(old) {
                    return;
                }
                table.set_virtual_alias(alias, None)
            } else {
                let mut virtuals = self.core.virtuals.lock();
                virtuals
                    .entry(new.to_string())
                    .or_insert_with(|| VirtualEndpoint::new(new))
                    .add_route(0, link.unique_name());
                table.set_virtual_alias(alias, Some(new))
            }
        };
        if let Some(change) = visible {
            self.core.notify_name_changes(&[change]);
        }
        if changed {
            self.forward_name_changed(link, alias, old, new);
        }
    }

    fn forward_name_changed(&self, link: &RemoteEndpoint, alias: &str, old: &str, new: &str) {
        for (dest, _) in self.other_links(link) {
            self.post(self.daemon_signal(&dest, "NameChanged", vec![json!(alias), json!(old), json!(new)]));
        }
    }

    /// Controllers of every bus-to-bus link except `link` and links to the
    /// same daemon.
    fn other_links(&self, link: &RemoteEndpoint) -> Vec<(String, RemoteEndpoint)> {
        let guid = link.remote_guid();
        self.core
            .b2b_endpoints()
            .into_iter()
            .filter(|ep| !ep.ptr_eq(link) && (guid.is_none() || ep.remote_guid() != guid))
            .filter_map(|ep| Self::remote_controller(&ep).map(|dest| (dest, ep)))
            .collect()
    }

    /// `name` is no longer reachable through `link`. Returns whether the
    /// virtual endpoint went away entirely.
    fn remote_unique_gone(&self, link: &RemoteEndpoint, name: &str) -> bool {
        let (session_ids, orphaned) = {
            let mut virtuals = self.core.virtuals.lock();
            let Some(v) = virtuals.get_mut(name) else {
                return false;
            };
            let ids: Vec<SessionId> = v
                .remove_routes_via(link.unique_name())
                .into_iter()
                .filter(|id| *id != 0 && !v.has_session_route(*id))
                .collect();
            let orphaned = v.is_orphaned();
            if orphaned {
                virtuals.remove(name);
            }
            (ids, orphaned)
        };

        let mut then = Vec::new();
        for id in session_ids {
            then.extend(self.remove_refs(name, id, SessionLostReason::RemoteEndLeft, Departure::Both));
        }
        self.post_all(then);
        if orphaned {
            self.drop_virtual_names(&[name.to_string()]);
        }
        orphaned
    }

    fn drop_virtual_names(&self, gone: &[String]) {
        let mut changes = Vec::new();
        {
            let mut table = self.core.names.lock();
            for name in gone {
                changes.extend(table.remove_virtual_owner(name));
            }
        }
        changes.extend(gone.iter().map(|name| NameChange {
            name: name.clone(),
            old_owner: Some(name.clone()),
            new_owner: None,
        }));
        self.core.notify_name_changes(&changes);
    }

    /// A remote member joined a multipoint session some of our endpoints
    /// are in.
    pub(super) fn session_member_added(&self, link: &RemoteEndpoint, id: SessionId, member: &str) {
        if self.core.is_local_name(member) {
            return;
        }
        let mut sessions = self.core.sessions.lock();
        let mut touched = false;
        for entry in sessions.entries_for_id_mut(id) {
            touched |= entry.add_member(member);
        }
        if touched {
            self.core
                .virtuals
                .lock()
                .entry(member.to_string())
                .or_insert_with(|| VirtualEndpoint::new(member))
                .add_route(id, link.unique_name());
        }
    }

    /// Tell daemons carrying remote participants of `id` about a new member.
    pub(super) fn announce_member(
        &self,
        id: SessionId,
        joiner: &str,
        participants: &[String],
        joiner_link: Option<&RemoteEndpoint>,
    ) -> Vec<Message> {
        let mut links: Vec<RemoteEndpoint> = Vec::new();
        for p in participants.iter().filter(|p| *p != joiner && !self.core.is_local_name(p)) {
            let Some(link) = self.core.route_target(p, id).filter(RemoteEndpoint::is_bus_to_bus) else {
                continue;
            };
            if joiner_link.is_some_and(|j| j.ptr_eq(&link)) || links.iter().any(|l| l.ptr_eq(&link)) {
                continue;
            }
            links.push(link);
        }
        links
            .iter()
            .filter_map(Self::remote_controller)
            .map(|dest| self.daemon_signal(&dest, "SessionMemberAdded", vec![json!(id), json!(joiner)]))
            .collect()
    }

    /// Everything that was reachable only through `link` is gone.
    pub(super) fn b2b_disconnected(&self, link: &RemoteEndpoint, status: Option<&BusError>) {
        let via = link.unique_name();
        let reason = SessionLostReason::from_status(status);
        let (affected, orphans) = {
            let mut virtuals = self.core.virtuals.lock();
            let mut affected: Vec<(String, SessionId)> = Vec::new();
            let mut orphans: Vec<String> = Vec::new();
            for (name, v) in virtuals.iter_mut() {
                for id in v.remove_routes_via(via) {
                    if id != 0 && !v.has_session_route(id) {
                        affected.push((name.clone(), id));
                    }
                }
                if v.is_orphaned() {
                    orphans.push(name.clone());
                }
            }
            for name in &orphans {
                virtuals.remove(name);
            }
            (affected, orphans)
        };
        tracing::info!(link = %via, lost_names = orphans.len(), lost_sessions = affected.len(), ?reason, "bus-to-bus link gone");

        let mut then = Vec::new();
        for (name, id) in &affected {
            then.extend(self.remove_refs(name, *id, reason, Departure::Both));
        }
        self.post_all(then);
        self.drop_virtual_names(&orphans);

        for (dest, _) in self.other_links(link) {
            for name in &orphans {
                self.post(self.daemon_signal(&dest, "NameChanged", vec![json!(name), json!(name), json!("")]));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::EndpointOptions;
    use crate::router::{DaemonRouter, EndpointRouter};
    use crate::session_map::SessionMapEntry;
    use junction_core::config::RouterConfig;
    use junction_core::message::FrameCodec;
    use junction_core::session::SessionOpts;
    use junction_core::Guid128;
    use std::sync::{Arc, Weak};

    fn link(router: &Arc<DaemonRouter>, remote: Guid128) -> RemoteEndpoint {
        let weak: Weak<dyn EndpointRouter> = Arc::downgrade(router) as Weak<dyn EndpointRouter>;
        let opts = EndpointOptions {
            bus_to_bus: true,
            remote_guid: Some(remote),
            ..EndpointOptions::default()
        };
        let ep = RemoteEndpoint::new(weak, Arc::new(FrameCodec::default()), opts);
        ep.set_unique_name(router.core().new_unique_name()).ok();
        ep
    }

    #[tokio::test]
    async fn exchange_creates_virtual_names() {
        let router = DaemonRouter::new(Guid128::generate(), RouterConfig::default());
        let remote = Guid128::generate();
        let b2b = link(&router, remote);
        let prefix = remote.unique_prefix();
        let own = router.core().new_unique_name();

        router.bus().exchange_names(
            &b2b,
            vec![
                (format!("{prefix}2"), vec!["org.example.svc".to_string()]),
                (own.clone(), vec!["org.example.mine".to_string()]),
            ],
        );

        let remote_name = format!("{prefix}2");
        assert_eq!(router.core().resolve("org.example.svc"), Some(remote_name.clone()));
        assert!(router.core().resolve("org.example.mine").is_none());
        assert!(router.core().virtuals.lock().contains_key(&remote_name));
        assert!(!router.core().virtuals.lock().contains_key(&own));
    }

    #[tokio::test]
    async fn name_changed_moves_and_clears_aliases() {
        let router = DaemonRouter::new(Guid128::generate(), RouterConfig::default());
        let remote = Guid128::generate();
        let b2b = link(&router, remote);
        let a = format!("{}2", remote.unique_prefix());
        let b = format!("{}3", remote.unique_prefix());

        router.bus().name_changed(&b2b, "org.example.svc", "", &a);
        assert_eq!(router.core().resolve("org.example.svc"), Some(a.clone()));
        router.bus().name_changed(&b2b, "org.example.svc", &a, &b);
        assert_eq!(router.core().resolve("org.example.svc"), Some(b.clone()));
        // Stale release from the previous owner is ignored.
        router.bus().name_changed(&b2b, "org.example.svc", &a, "");
        assert_eq!(router.core().resolve("org.example.svc"), Some(b.clone()));
        router.bus().name_changed(&b2b, "org.example.svc", &b, "");
        assert!(router.core().resolve("org.example.svc").is_none());

        router.bus().name_changed(&b2b, &b, &b, "");
        assert!(!router.core().virtuals.lock().contains_key(&b));
    }

    #[tokio::test]
    async fn link_loss_drops_its_names_and_session_members() {
        let router = DaemonRouter::new(Guid128::generate(), RouterConfig::default());
        let remote = Guid128::generate();
        let b2b = link(&router, remote);
        let far = format!("{}2", remote.unique_prefix());
        let host = router.core().new_unique_name();

        router.bus().exchange_names(&b2b, vec![(far.clone(), vec!["org.example.far".to_string()])]);
        {
            let mut s = router.core().sessions.lock();
            s.insert(SessionMapEntry {
                endpoint_name: host.clone(),
                id: 77,
                session_host: host.clone(),
                session_port: 42,
                opts: SessionOpts::default(),
                member_names: vec![far.clone()],
                is_initializing: false,
            });
            if let Some(v) = router.core().virtuals.lock().get_mut(&far) {
                v.add_route(77, b2b.unique_name());
            }
        }

        router.bus().b2b_disconnected(&b2b, Some(&BusError::Timeout));
        assert!(router.core().virtuals.lock().is_empty());
        assert!(router.core().resolve("org.example.far").is_none());
        assert!(router.core().sessions.lock().get(&host, 77).is_none());
    }

    #[tokio::test]
    async fn member_added_updates_local_entries() {
        let router = DaemonRouter::new(Guid128::generate(), RouterConfig::default());
        let remote = Guid128::generate();
        let b2b = link(&router, remote);
        let local = router.core().new_unique_name();
        let host = format!("{}2", remote.unique_prefix());
        let joiner = format!("{}3", remote.unique_prefix());
        router.core().sessions.lock().insert(SessionMapEntry {
            endpoint_name: local.clone(),
            id: 5,
            session_host: host.clone(),
            session_port: 42,
            opts: SessionOpts::multipoint(),
            member_names: vec![local.clone()],
            is_initializing: false,
        });

        router.bus().session_member_added(&b2b, 5, &joiner);
        let members = router.core().sessions.lock().get(&local, 5).map(|e| e.member_names.clone());
        assert_eq!(members, Some(vec![local.clone(), joiner.clone()]));
        let route = router.core().virtuals.lock().get(&joiner).map(|v| v.has_session_route(5));
        assert_eq!(route, Some(true));
    }
}
