//! Recording stand-ins for the radio and the controller link.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use junction_core::message::FrameCodec;
use junction_core::session::PROTOCOL_VERSION;
use junction_core::BusError;

use super::device::{BluetoothDeviceInterface, BtRole, DeviceInfo};
use super::link::{SetStateReply, SetStateRequest, TopologyLink, TopologySignal};
use super::node::{BtBusAddress, BtNode, NodeAdvert};
use crate::endpoint::{EndpointOptions, RemoteEndpoint};
use crate::router::{DaemonRouter, EndpointRouter};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceCall {
    StartFind { ignore: Vec<u64>, duration: Duration },
    StopFind,
    StartAdvertise { uuid_rev: u32, names: Vec<String>, duration: Duration },
    StopAdvertise,
    FoundNames { guid: String, names: Vec<String>, lost: bool },
    StartListen,
    StopListen,
    DeviceInfo(u64),
    Disconnect(String),
    RequestRole(u64, BtRole),
}

pub struct MockDevice {
    addr: BtBusAddress,
    eir: bool,
    listen_fails: Mutex<bool>,
    remote_protocol: Mutex<Option<u32>>,
    device_info: Mutex<HashMap<u64, DeviceInfo>>,
    calls: Mutex<Vec<DeviceCall>>,
}

impl MockDevice {
    pub fn new(addr: BtBusAddress, eir: bool) -> Arc<Self> {
        Arc::new(Self {
            addr,
            eir,
            listen_fails: Mutex::new(false),
            remote_protocol: Mutex::new(Some(PROTOCOL_VERSION)),
            device_info: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
        })
    }

    pub fn calls(&self) -> Vec<DeviceCall> {
        self.calls.lock().clone()
    }

    pub fn fail_listen(&self) {
        *self.listen_fails.lock() = true;
    }

    pub fn set_remote_protocol(&self, version: u32) {
        *self.remote_protocol.lock() = Some(version);
    }

    pub fn set_endpoint_missing(&self) {
        *self.remote_protocol.lock() = None;
    }

    pub fn set_device_info(&self, addr: u64, info: DeviceInfo) {
        self.device_info.lock().insert(addr, info);
    }

    fn record(&self, call: DeviceCall) {
        self.calls.lock().push(call);
    }
}

#[async_trait]
impl BluetoothDeviceInterface for MockDevice {
    async fn start_find(&self, ignore_addrs: &[u64], duration: Duration) -> Result<(), BusError> {
        self.record(DeviceCall::StartFind {
            ignore: ignore_addrs.to_vec(),
            duration,
        });
        Ok(())
    }

    async fn stop_find(&self) -> Result<(), BusError> {
        self.record(DeviceCall::StopFind);
        Ok(())
    }

    async fn start_advertise(
        &self,
        uuid_rev: u32,
        _addr: BtBusAddress,
        ad_info: &[NodeAdvert],
        duration: Duration,
    ) -> Result<(), BusError> {
        self.record(DeviceCall::StartAdvertise {
            uuid_rev,
            names: ad_info.iter().flat_map(|a| a.names.iter().cloned()).collect(),
            duration,
        });
        Ok(())
    }

    async fn stop_advertise(&self) -> Result<(), BusError> {
        self.record(DeviceCall::StopAdvertise);
        Ok(())
    }

    fn found_names_change(&self, guid: &str, names: &[String], _addr: BtBusAddress, lost: bool) {
        self.record(DeviceCall::FoundNames {
            guid: guid.to_string(),
            names: names.to_vec(),
            lost,
        });
    }

    async fn start_listen(&self) -> Result<BtBusAddress, BusError> {
        self.record(DeviceCall::StartListen);
        if *self.listen_fails.lock() {
            return Err(BusError::DeviceUnavailable);
        }
        Ok(self.addr)
    }

    async fn stop_listen(&self) {
        self.record(DeviceCall::StopListen);
    }

    async fn get_device_info(&self, addr: u64) -> Result<DeviceInfo, BusError> {
        self.record(DeviceCall::DeviceInfo(addr));
        self.device_info
            .lock()
            .get(&addr)
            .cloned()
            .ok_or(BusError::Failed("no SDP record".into()))
    }

    async fn disconnect(&self, unique_name: &str) -> Result<(), BusError> {
        self.record(DeviceCall::Disconnect(unique_name.to_string()));
        Ok(())
    }

    fn lookup_endpoint(&self, _unique_name: &str) -> Option<RemoteEndpoint> {
        let protocol_version = (*self.remote_protocol.lock())?;
        let router: Weak<dyn EndpointRouter> = Weak::<DaemonRouter>::new();
        let opts = EndpointOptions {
            bus_to_bus: true,
            protocol_version,
            ..EndpointOptions::default()
        };
        Some(RemoteEndpoint::new(router, Arc::new(FrameCodec::default()), opts))
    }

    fn return_endpoint(&self, _ep: RemoteEndpoint) {}

    async fn is_master(&self, _addr: u64) -> Result<bool, BusError> {
        Ok(true)
    }

    async fn request_bt_role(&self, addr: u64, role: BtRole) {
        self.record(DeviceCall::RequestRole(addr, role));
    }

    fn is_eir_capable(&self) -> bool {
        self.eir
    }
}

#[derive(Default)]
pub struct MockLink {
    signals: Mutex<Vec<(BtBusAddress, TopologySignal)>>,
    reply: Mutex<Option<Result<SetStateReply, BusError>>>,
}

impl MockLink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Answer the next `SetState`. Unset, it times out.
    pub fn set_reply(&self, reply: Result<SetStateReply, BusError>) {
        *self.reply.lock() = Some(reply);
    }

    pub fn last_signal_to(&self, addr: BtBusAddress) -> Option<TopologySignal> {
        self.signals
            .lock()
            .iter()
            .rev()
            .find(|(to, _)| *to == addr)
            .map(|(_, sig)| sig.clone())
    }

    pub fn clear(&self) {
        self.signals.lock().clear();
    }
}

#[async_trait]
impl TopologyLink for MockLink {
    async fn set_state(&self, _to: &BtNode, _req: SetStateRequest) -> Result<SetStateReply, BusError> {
        self.reply.lock().take().unwrap_or(Err(BusError::Timeout))
    }

    async fn signal(&self, to: &BtNode, sig: TopologySignal) -> Result<(), BusError> {
        self.signals.lock().push((to.addr, sig));
        Ok(())
    }
}
