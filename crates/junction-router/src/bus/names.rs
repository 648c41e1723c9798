//! DBus name ownership on the controller.

use std::sync::Weak;

use serde_json::json;

use junction_core::BusError;

use super::BusController;
use crate::name_table::{NameChange, NameListener, ReleaseNameReply, RequestNameReply};

impl BusController {
    pub fn request_name(&self, sender: &str, name: &str, flags: u32) -> Result<RequestNameReply, BusError> {
        if name.is_empty() || name.starts_with(':') {
            return Err(BusError::Malformed(format!("cannot request {name:?}")));
        }
        let (reply, change) = self.core.names.lock().request_name(name, sender, flags);
        tracing::debug!(name, sender, ?reply, "request name");
        if let Some(change) = change {
            self.core.notify_name_changes(&[change]);
        }
        Ok(reply)
    }

    pub fn release_name(&self, sender: &str, name: &str) -> ReleaseNameReply {
        let (reply, change) = self.core.names.lock().release_name(name, sender);
        tracing::debug!(name, sender, ?reply, "release name");
        if let Some(change) = change {
            self.core.notify_name_changes(&[change]);
        }
        reply
    }

    pub fn get_name_owner(&self, name: &str) -> Option<String> {
        if name.starts_with(':') {
            let known = self.core.names.lock().has_unique(name) || self.core.virtuals.lock().contains_key(name);
            return known.then(|| name.to_string());
        }
        self.core.names.lock().owner(name).map(String::from)
    }

    pub fn name_has_owner(&self, name: &str) -> bool {
        self.get_name_owner(name).is_some()
    }

    /// Local names, virtual aliases and virtual endpoints.
    pub fn list_names(&self) -> Vec<String> {
        let mut names = self.core.names.lock().all_names();
        names.extend(self.core.virtuals.lock().keys().cloned());
        names.sort();
        names.dedup();
        names
    }

    fn on_owner_changed(&self, change: &NameChange) {
        let old = change.old_owner.as_deref().unwrap_or("");
        let new = change.new_owner.as_deref().unwrap_or("");
        self.post(self.dbus_signal("NameOwnerChanged", vec![json!(change.name), json!(old), json!(new)]));

        // Only changes that originate here travel to peers; forwarded remote
        // changes go through exchange handling instead.
        let local_origin = (!old.is_empty() && self.core.is_local_name(old))
            || (!new.is_empty() && self.core.is_local_name(new));
        if !local_origin {
            return;
        }
        for b2b in self.core.b2b_endpoints() {
            let Some(dest) = Self::remote_controller(&b2b) else {
                continue;
            };
            self.post(self.daemon_signal(&dest, "NameChanged", vec![json!(change.name), json!(old), json!(new)]));
        }
    }
}

/// Relays table changes to the controller without keeping it alive.
pub(super) struct OwnerChangeRelay {
    bus: Weak<BusController>,
}

impl OwnerChangeRelay {
    pub(super) fn new(bus: Weak<BusController>) -> Self {
        Self { bus }
    }
}

impl NameListener for OwnerChangeRelay {
    fn name_owner_changed(&self, change: &NameChange) {
        if let Some(bus) = self.bus.upgrade() {
            bus.on_owner_changed(change);
        }
    }
}
