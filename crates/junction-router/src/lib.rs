//! junction-router: the routing half of the Junction daemon.
//! Remote endpoints, the name and session tables, the bus controller that
//! implements the bus interfaces, and Bluetooth topology control.

pub mod bt;
pub mod bus;
pub mod endpoint;
pub mod ifaces;
pub mod name_table;
pub mod router;
pub mod session_map;

pub use bus::{BusController, BusObject, NameService};
pub use endpoint::{EndpointOptions, EndpointTimeouts, RemoteEndpoint, Role};
pub use name_table::{NameChange, NameListener};
pub use router::{DaemonRouter, EndpointRouter, RouterCore};
