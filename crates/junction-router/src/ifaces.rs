//! Well-known bus names, object paths and interfaces.

pub const DBUS_NAME: &str = "org.freedesktop.DBus";
pub const DBUS_PATH: &str = "/org/freedesktop/DBus";
pub const DBUS_IFACE: &str = "org.freedesktop.DBus";
pub const DBUS_PEER_IFACE: &str = "org.freedesktop.DBus.Peer";

pub const BUS_NAME: &str = "org.alljoyn.Bus";
pub const BUS_PATH: &str = "/org/alljoyn/Bus";
pub const BUS_IFACE: &str = "org.alljoyn.Bus";

/// Daemon-to-daemon interface.
pub const DAEMON_NAME: &str = "org.alljoyn.Daemon";
pub const DAEMON_PATH: &str = "/org/alljoyn/Bus";
pub const DAEMON_IFACE: &str = "org.alljoyn.Daemon";

/// Implemented by applications that bind session ports.
pub const PEER_SESSION_PATH: &str = "/org/alljoyn/Bus/Peer";
pub const PEER_SESSION_IFACE: &str = "org.alljoyn.Bus.Peer.Session";

pub const BT_CONTROLLER_IFACE: &str = "org.alljoyn.Bus.BTController";
pub const BT_CONTROLLER_PATH: &str = "/org/alljoyn/Bus/BTController";

pub const PROBE_REQ: &str = "ProbeReq";
pub const PROBE_ACK: &str = "ProbeAck";

/// Error names carried in `Error` replies.
pub mod errors {
    pub const SERVICE_UNKNOWN: &str = "org.freedesktop.DBus.Error.ServiceUnknown";
    pub const UNKNOWN_METHOD: &str = "org.freedesktop.DBus.Error.UnknownMethod";
    pub const INVALID_ARGS: &str = "org.freedesktop.DBus.Error.InvalidArgs";
    pub const NAME_HAS_NO_OWNER: &str = "org.freedesktop.DBus.Error.NameHasNoOwner";
    pub const FAILED: &str = "org.alljoyn.Bus.Failed";
}

/// Destinations handled by the daemon itself rather than an endpoint.
pub fn is_bus_controller_destination(dest: &str, controller_name: &str) -> bool {
    dest == DBUS_NAME || dest == BUS_NAME || dest == DAEMON_NAME || dest == controller_name
}
