//! Session port bindings.

use junction_core::session::{BindReply, SessionOpts, SessionPort, UnbindReply};

use super::BusController;
use crate::session_map::SessionMapEntry;

impl BusController {
    /// Reserve `port` for `sender`. Port 0 picks the next free ephemeral one.
    pub fn bind_session_port(&self, sender: &str, port: SessionPort, opts: SessionOpts) -> (BindReply, SessionPort) {
        if !opts.is_valid_for_bind() {
            return (BindReply::InvalidOpts, port);
        }
        let mut sessions = self.core.sessions.lock();
        let Some(port) = sessions.resolve_port(sender, port) else {
            return (BindReply::Failed, port);
        };
        if sessions.binding(sender, port).is_some() {
            return (BindReply::AlreadyExists, port);
        }
        sessions.insert(SessionMapEntry::binding(sender, port, opts));
        tracing::debug!(sender, port, multipoint = opts.is_multipoint, "bound session port");
        (BindReply::Success, port)
    }

    pub fn unbind_session_port(&self, sender: &str, port: SessionPort) -> UnbindReply {
        match self.core.sessions.lock().remove_binding(sender, port) {
            Some(_) => {
                self.joins.forget_binding(sender, port);
                tracing::debug!(sender, port, "unbound session port");
                UnbindReply::Success
            }
            None => UnbindReply::BadPort,
        }
    }
}
