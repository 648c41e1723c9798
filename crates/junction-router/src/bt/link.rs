//! How topology controllers talk to each other.
//!
//! Controllers exchange `SetState` calls and a handful of signals on the
//! `org.alljoyn.Bus.BTController` interface. Payloads travel as a single
//! JSON argument.

use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use junction_core::{BusError, Header, Message, MessageType};

use super::dispatch::BtHandle;
use super::name_args::NameOp;
use super::node::{BtBusAddress, BtNode, NodeAdvert, NodeState};
use crate::bus::{BusController, BusObject};
use crate::endpoint::RemoteEndpoint;
use crate::ifaces::{BT_CONTROLLER_IFACE, BT_CONTROLLER_PATH};

/// Sent by a daemon that just connected to another.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetStateRequest {
    pub direct_minions: usize,
    pub eir_capable: bool,
    pub uuid_rev: u32,
    pub addr: BtBusAddress,
    pub node_states: Vec<NodeState>,
    pub found_nodes: Vec<NodeAdvert>,
}

/// Empty `node_states` means the responder stays master.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetStateReply {
    pub eir_capable: bool,
    pub uuid_rev: u32,
    pub addr: BtBusAddress,
    pub node_states: Vec<NodeState>,
    pub found_nodes: Vec<NodeAdvert>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FindArgs {
    pub ignore_addrs: Vec<u64>,
    /// Zero runs until told otherwise.
    pub duration_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdvertiseArgs {
    pub uuid_rev: u32,
    pub addr: BtBusAddress,
    pub ad_info: Vec<NodeAdvert>,
    pub duration_secs: u64,
}

impl AdvertiseArgs {
    pub fn is_stop(&self) -> bool {
        self.ad_info.is_empty() && self.duration_secs == 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TopologySignal {
    /// Master to delegate. `None` stops finding.
    DelegateFind(Option<FindArgs>),
    /// Master to delegate.
    DelegateAdvertise(AdvertiseArgs),
    /// Name list change, minion to master.
    NameOp {
        op: NameOp,
        add: bool,
        from: BtBusAddress,
        name: String,
    },
    /// A delegate saw an advertising device.
    FoundDevice { addr: u64, uuid_rev: u32, eir_capable: bool },
    /// Names gained or lost. Carries deltas when sent by a master.
    FoundNodes { nodes: Vec<NodeAdvert>, lost: bool },
}

impl TopologySignal {
    pub fn member(&self) -> &'static str {
        match self {
            TopologySignal::DelegateFind(_) => "DelegateFind",
            TopologySignal::DelegateAdvertise(_) => "DelegateAdvertise",
            TopologySignal::NameOp { op: NameOp::Find, add: true, .. } => "FindName",
            TopologySignal::NameOp { op: NameOp::Find, add: false, .. } => "CancelFindName",
            TopologySignal::NameOp { op: NameOp::Advertise, add: true, .. } => "AdvertiseName",
            TopologySignal::NameOp { op: NameOp::Advertise, add: false, .. } => "CancelAdvertiseName",
            TopologySignal::FoundDevice { .. } => "FoundDevice",
            TopologySignal::FoundNodes { lost: false, .. } => "FoundNodes",
            TopologySignal::FoundNodes { lost: true, .. } => "LostNodes",
        }
    }
}

/// Transport between controllers. `to` carries the peer controller's
/// unique name and the session it is reached over.
#[async_trait]
pub trait TopologyLink: Send + Sync {
    async fn set_state(&self, to: &BtNode, req: SetStateRequest) -> Result<SetStateReply, BusError>;
    async fn signal(&self, to: &BtNode, sig: TopologySignal) -> Result<(), BusError>;
}

// ── Bus-backed link ───────────────────────────────────────────────────────────

/// Sends controller traffic through the daemon's router.
pub struct BusTopologyLink {
    bus: Weak<BusController>,
    timeout: Duration,
}

impl BusTopologyLink {
    pub fn new(bus: &Arc<BusController>, timeout: Duration) -> Self {
        Self {
            bus: Arc::downgrade(bus),
            timeout,
        }
    }

    fn bus(&self) -> Result<Arc<BusController>, BusError> {
        self.bus.upgrade().ok_or(BusError::Stopping)
    }
}

#[async_trait]
impl TopologyLink for BusTopologyLink {
    async fn set_state(&self, to: &BtNode, req: SetStateRequest) -> Result<SetStateReply, BusError> {
        let bus = self.bus()?;
        let via = bus
            .core()
            .route_target(&to.unique_name, to.session_id)
            .ok_or(BusError::NoRoute)?;
        let header = Header::method_call(&to.unique_name, BT_CONTROLLER_PATH, BT_CONTROLLER_IFACE, "SetState")
            .session(to.session_id);
        let reply = bus
            .call_method(&via, header, vec![serde_json::to_value(req)?], self.timeout)
            .await?;
        reply.typed_arg(0)
    }

    async fn signal(&self, to: &BtNode, sig: TopologySignal) -> Result<(), BusError> {
        let bus = self.bus()?;
        let core = bus.core();
        let msg = Message::new(
            Header::signal(&to.unique_name, BT_CONTROLLER_PATH, BT_CONTROLLER_IFACE, sig.member())
                .sender(core.controller_name())
                .serial(core.next_serial())
                .session(to.session_id),
            vec![serde_json::to_value(&sig)?],
        );
        core.deliver(msg).await
    }
}

// ── Inbound ───────────────────────────────────────────────────────────────────

/// Receives controller traffic addressed to this daemon.
pub struct BtControllerObject {
    bus: Weak<BusController>,
    handle: BtHandle,
}

#[async_trait]
impl BusObject for BtControllerObject {
    async fn handle(&self, msg: Message, _sender: &RemoteEndpoint) -> Result<(), BusError> {
        match msg.msg_type() {
            MessageType::MethodCall if msg.member() == "SetState" => {
                let req: SetStateRequest = msg.typed_arg(0)?;
                let Some(bus) = self.bus.upgrade() else {
                    return Err(BusError::Stopping);
                };
                let handle = self.handle.clone();
                // Answered by the dispatcher, off the read pump.
                tokio::spawn(async move {
                    match handle.set_state(msg.sender(), msg.session_id(), req).await {
                        Ok(reply) => match serde_json::to_value(reply) {
                            Ok(v) => bus.reply(&msg, vec![v]),
                            Err(e) => bus.reply_error(&msg, &BusError::from(e)),
                        },
                        Err(e) => {
                            tracing::warn!(sender = msg.sender(), error = %e, "SetState refused");
                            bus.reply_error(&msg, &e);
                        }
                    }
                });
                Ok(())
            }
            MessageType::Signal => {
                let sig: TopologySignal = msg.typed_arg(0)?;
                self.handle.signal_received(msg.sender(), sig);
                Ok(())
            }
            _ => Err(BusError::NotAllowed(format!("{}.{}", msg.interface(), msg.member()))),
        }
    }
}

/// Hook a topology controller into the bus. It also becomes the
/// Bluetooth name service and hears about lost unique names.
pub fn register_with_bus(bus: &Arc<BusController>, handle: &BtHandle) {
    bus.register_object(
        BT_CONTROLLER_IFACE,
        Arc::new(BtControllerObject {
            bus: Arc::downgrade(bus),
            handle: handle.clone(),
        }),
    );
    bus.register_name_service(Arc::new(handle.clone()));
    bus.core().add_name_listener(Arc::new(handle.clone()));
}
