//! Bluetooth topology control.
//!
//! `BtDispatcher` owns a `BtController` and feeds it from one queue;
//! everything else talks to it through a `BtHandle`. The radio sits behind
//! `BluetoothDeviceInterface` and peer controllers are reached through a
//! `TopologyLink`, normally `BusTopologyLink`.

pub mod controller;
pub mod device;
pub mod dispatch;
pub mod link;
pub mod name_args;
pub mod node;

#[cfg(test)]
mod mock;

pub use controller::{BtController, Delegation, TopologyRole, TopologySnapshot, INVALID_UUIDREV};
pub use device::{BluetoothDeviceInterface, BtRole, DeviceInfo};
pub use dispatch::{BtDispatcher, BtHandle, DispatchInfo};
pub use junction_core::config::bt_limits;
pub use link::{
    register_with_bus, AdvertiseArgs, BusTopologyLink, FindArgs, SetStateReply, SetStateRequest, TopologyLink,
    TopologySignal,
};
pub use name_args::NameOp;
pub use node::{BtBusAddress, BtNode, NodeAdvert, NodeState, Relationship};
