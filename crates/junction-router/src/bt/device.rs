//! The radio as the topology controller sees it.

use std::time::Duration;

use async_trait::async_trait;

use junction_core::BusError;

use super::node::{BtBusAddress, NodeAdvert};
use crate::endpoint::RemoteEndpoint;

/// Link-level role requested from the radio.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BtRole {
    Master,
    Slave,
}

/// What an SDP query on an advertising device returned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    pub uuid_rev: u32,
    pub connect_addr: BtBusAddress,
    pub ad_info: Vec<NodeAdvert>,
}

/// Capabilities of the local Bluetooth device. The controller never touches
/// hardware except through this.
///
/// A zero `duration` means run until stopped.
#[async_trait]
pub trait BluetoothDeviceInterface: Send + Sync {
    async fn start_find(&self, ignore_addrs: &[u64], duration: Duration) -> Result<(), BusError>;
    async fn stop_find(&self) -> Result<(), BusError>;

    async fn start_advertise(
        &self,
        uuid_rev: u32,
        addr: BtBusAddress,
        ad_info: &[NodeAdvert],
        duration: Duration,
    ) -> Result<(), BusError>;
    async fn stop_advertise(&self) -> Result<(), BusError>;

    /// Report names found (or lost) on the daemon `guid` reachable at `addr`.
    fn found_names_change(&self, guid: &str, names: &[String], addr: BtBusAddress, lost: bool);

    /// Start accepting connections; returns the address we listen on.
    async fn start_listen(&self) -> Result<BtBusAddress, BusError>;
    async fn stop_listen(&self);

    async fn get_device_info(&self, addr: u64) -> Result<DeviceInfo, BusError>;

    /// Drop the connection behind the endpoint with `unique_name`.
    async fn disconnect(&self, unique_name: &str) -> Result<(), BusError>;

    /// Borrow the Bluetooth endpoint named `unique_name`, if it is one.
    fn lookup_endpoint(&self, unique_name: &str) -> Option<RemoteEndpoint>;
    fn return_endpoint(&self, ep: RemoteEndpoint);

    async fn is_master(&self, addr: u64) -> Result<bool, BusError>;
    async fn request_bt_role(&self, addr: u64, role: BtRole);

    fn is_eir_capable(&self) -> bool;
}
