//! Session map: per-endpoint view of every session it takes part in.
//!
//! Keyed by `(endpoint_name, session_id)`. Id 0 holds binding
//! reservations, of which an endpoint may have several (one per port).

use std::collections::BTreeMap;

use junction_core::session::{SessionId, SessionOpts, SessionPort, FIRST_EPHEMERAL_PORT, SESSION_PORT_ANY};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionMapEntry {
    pub endpoint_name: String,
    pub id: SessionId,
    /// Empty once the host has left.
    pub session_host: String,
    pub session_port: SessionPort,
    pub opts: SessionOpts,
    /// Joiners in join order, no duplicates.
    pub member_names: Vec<String>,
    pub is_initializing: bool,
}

impl SessionMapEntry {
    pub fn binding(endpoint_name: &str, port: SessionPort, opts: SessionOpts) -> Self {
        Self {
            endpoint_name: endpoint_name.to_string(),
            id: 0,
            session_host: endpoint_name.to_string(),
            session_port: port,
            opts,
            member_names: Vec::new(),
            is_initializing: false,
        }
    }

    pub fn is_self_joined(&self) -> bool {
        !self.session_host.is_empty() && self.member_names.iter().any(|m| *m == self.session_host)
    }

    pub fn add_member(&mut self, name: &str) -> bool {
        if self.member_names.iter().any(|m| m == name) {
            return false;
        }
        self.member_names.push(name.to_string());
        true
    }

    pub fn remove_member(&mut self, name: &str) -> bool {
        let before = self.member_names.len();
        self.member_names.retain(|m| m != name);
        before != self.member_names.len()
    }

    /// Host plus members, without duplicates.
    pub fn participants(&self) -> Vec<String> {
        let mut out = Vec::with_capacity(self.member_names.len() + 1);
        if !self.session_host.is_empty() {
            out.push(self.session_host.clone());
        }
        for m in &self.member_names {
            if !out.contains(m) {
                out.push(m.clone());
            }
        }
        out
    }

    /// A session with no members, or a lone member and no host, is over.
    pub fn is_lost(&self) -> bool {
        self.member_names.is_empty() || (self.member_names.len() == 1 && self.session_host.is_empty())
    }
}

#[derive(Debug, Default)]
pub struct SessionMap {
    entries: BTreeMap<(String, SessionId), Vec<SessionMapEntry>>,
}

impl SessionMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace the entry for `(endpoint_name, id)`. Bindings are
    /// replaced per port.
    pub fn insert(&mut self, entry: SessionMapEntry) {
        let slot = self
            .entries
            .entry((entry.endpoint_name.clone(), entry.id))
            .or_default();
        if entry.id == 0 {
            slot.retain(|e| e.session_port != entry.session_port);
            slot.push(entry);
        } else {
            slot.clear();
            slot.push(entry);
        }
    }

    pub fn get(&self, name: &str, id: SessionId) -> Option<&SessionMapEntry> {
        self.entries.get(&(name.to_string(), id)).and_then(|v| v.first())
    }

    pub fn get_mut(&mut self, name: &str, id: SessionId) -> Option<&mut SessionMapEntry> {
        self.entries
            .get_mut(&(name.to_string(), id))
            .and_then(|v| v.first_mut())
    }

    pub fn remove(&mut self, name: &str, id: SessionId) -> Option<SessionMapEntry> {
        let mut slot = self.entries.remove(&(name.to_string(), id))?;
        if slot.is_empty() {
            return None;
        }
        Some(slot.swap_remove(0))
    }

    pub fn binding(&self, name: &str, port: SessionPort) -> Option<&SessionMapEntry> {
        self.entries
            .get(&(name.to_string(), 0))
            .and_then(|v| v.iter().find(|e| e.session_port == port))
    }

    pub fn remove_binding(&mut self, name: &str, port: SessionPort) -> Option<SessionMapEntry> {
        let key = (name.to_string(), 0);
        let slot = self.entries.get_mut(&key)?;
        let pos = slot.iter().position(|e| e.session_port == port)?;
        let entry = slot.remove(pos);
        if slot.is_empty() {
            self.entries.remove(&key);
        }
        Some(entry)
    }

    /// Ports `name` has bound.
    pub fn bound_ports(&self, name: &str) -> Vec<SessionPort> {
        self.entries
            .get(&(name.to_string(), 0))
            .map(|v| v.iter().map(|e| e.session_port).collect())
            .unwrap_or_default()
    }

    /// First port at or above 10000 that `name` has not bound, or the
    /// requested port when it is explicit.
    pub fn resolve_port(&self, name: &str, requested: SessionPort) -> Option<SessionPort> {
        if requested != SESSION_PORT_ANY {
            return Some(requested);
        }
        (FIRST_EPHEMERAL_PORT..=SessionPort::MAX).find(|p| self.binding(name, *p).is_none())
    }

    /// Session hosted by `host` on `port`, if one exists.
    pub fn hosted_session(&self, host: &str, port: SessionPort) -> Option<&SessionMapEntry> {
        self.entries
            .range((host.to_string(), 1)..=(host.to_string(), SessionId::MAX))
            .flat_map(|(_, v)| v.iter())
            .find(|e| e.session_port == port && e.session_host == host)
    }

    /// Every entry of session `id`, one per local participant.
    pub fn entries_for_id(&self, id: SessionId) -> Vec<&SessionMapEntry> {
        self.entries
            .iter()
            .filter(|((_, sid), _)| *sid == id)
            .flat_map(|(_, v)| v.iter())
            .collect()
    }

    pub fn entries_for_id_mut(&mut self, id: SessionId) -> impl Iterator<Item = &mut SessionMapEntry> {
        self.entries
            .iter_mut()
            .filter(move |((_, sid), _)| *sid == id)
            .flat_map(|(_, v)| v.iter_mut())
    }

    /// Session ids (bindings included) held by `name`.
    pub fn ids_for(&self, name: &str) -> Vec<SessionId> {
        self.entries
            .range((name.to_string(), 0)..=(name.to_string(), SessionId::MAX))
            .map(|((_, id), _)| *id)
            .collect()
    }

    pub fn is_id_in_use(&self, id: SessionId) -> bool {
        self.entries.keys().any(|(_, sid)| *sid == id)
    }

    pub fn len(&self) -> usize {
        self.entries.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
