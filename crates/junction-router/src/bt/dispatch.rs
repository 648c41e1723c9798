//! Dispatcher for the topology controller.
//!
//! Every input to the controller (device events, remote signals, local name
//! requests, alarms) becomes a `DispatchInfo` on one queue. A single task
//! drains it, so the controller never needs a lock.

use std::sync::Arc;

use tokio::sync::{broadcast, mpsc, oneshot};

use junction_core::config::BluetoothConfig;
use junction_core::session::transport::{self, TransportMask};
use junction_core::session::SessionId;
use junction_core::BusError;

use super::controller::{BtController, TopologySnapshot};
use super::device::BluetoothDeviceInterface;
use super::link::{AdvertiseArgs, FindArgs, SetStateReply, SetStateRequest, TopologyLink, TopologySignal};
use super::name_args::NameOp;
use super::node::{BtBusAddress, BtNode, NodeAdvert};
use crate::bus::NameService;
use crate::name_table::{NameChange, NameListener};

#[derive(Debug)]
pub enum DispatchInfo {
    UpdateDelegations {
        reset_minions: bool,
    },
    ExpireCachedNodes,
    NameLost {
        name: String,
    },
    BtDeviceAvailable {
        on: bool,
    },
    SendSetState {
        node: BtNode,
    },
    ProcessSetStateReply {
        node: BtNode,
        result: Result<SetStateReply, BusError>,
    },
    HandleDelegateFind {
        from: String,
        args: Option<FindArgs>,
    },
    HandleDelegateAdvertise {
        from: String,
        args: AdvertiseArgs,
    },
    ExpireBlacklistedDevice {
        addr: u64,
    },
    /// `from` is `None` for our own names.
    NameOp {
        op: NameOp,
        add: bool,
        name: String,
        from: Option<BtBusAddress>,
    },
    SetState {
        sender: String,
        session_id: SessionId,
        req: SetStateRequest,
        reply: oneshot::Sender<Result<SetStateReply, BusError>>,
    },
    LostLastConnection {
        addr: BtBusAddress,
    },
    /// `from` is `None` when our own radio reported the nodes.
    FoundNodes {
        nodes: Vec<NodeAdvert>,
        lost: bool,
        from: Option<String>,
    },
    FoundDevice {
        addr: u64,
        uuid_rev: u32,
        eir_capable: bool,
        from: Option<String>,
    },
    ConnectFailed {
        addr: BtBusAddress,
    },
    RotateDelegate {
        op: NameOp,
        generation: u64,
    },
    Snapshot {
        reply: oneshot::Sender<TopologySnapshot>,
    },
}

/// Cheap handle for feeding the dispatcher.
#[derive(Clone)]
pub struct BtHandle {
    tx: mpsc::UnboundedSender<DispatchInfo>,
}

impl BtHandle {
    pub(crate) fn new(tx: mpsc::UnboundedSender<DispatchInfo>) -> Self {
        Self { tx }
    }

    fn send(&self, info: DispatchInfo) {
        if self.tx.send(info).is_err() {
            tracing::debug!("topology dispatcher is gone");
        }
    }

    pub fn device_available(&self, on: bool) {
        self.send(DispatchInfo::BtDeviceAvailable { on });
    }

    /// A Bluetooth link to `addr` came up. A master then sends `SetState`.
    pub fn node_connected(&self, addr: BtBusAddress, unique_name: &str, session_id: SessionId) {
        let mut node = BtNode::new(addr, unique_name);
        node.session_id = session_id;
        self.send(DispatchInfo::SendSetState { node });
    }

    pub async fn set_state(
        &self,
        sender: &str,
        session_id: SessionId,
        req: SetStateRequest,
    ) -> Result<SetStateReply, BusError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(DispatchInfo::SetState {
                sender: sender.to_string(),
                session_id,
                req,
                reply,
            })
            .map_err(|_| BusError::Stopping)?;
        rx.await.map_err(|_| BusError::Stopping)?
    }

    /// Route a signal from a peer controller.
    pub fn signal_received(&self, sender: &str, sig: TopologySignal) {
        let from = sender.to_string();
        let info = match sig {
            TopologySignal::DelegateFind(args) => DispatchInfo::HandleDelegateFind { from, args },
            TopologySignal::DelegateAdvertise(args) => DispatchInfo::HandleDelegateAdvertise { from, args },
            TopologySignal::NameOp { op, add, from, name } => DispatchInfo::NameOp {
                op,
                add,
                name,
                from: Some(from),
            },
            TopologySignal::FoundDevice {
                addr,
                uuid_rev,
                eir_capable,
            } => DispatchInfo::FoundDevice {
                addr,
                uuid_rev,
                eir_capable,
                from: Some(from),
            },
            TopologySignal::FoundNodes { nodes, lost } => DispatchInfo::FoundNodes {
                nodes,
                lost,
                from: Some(from),
            },
        };
        self.send(info);
    }

    pub fn lost_last_connection(&self, addr: BtBusAddress) {
        self.send(DispatchInfo::LostLastConnection { addr });
    }

    pub fn connect_failed(&self, addr: BtBusAddress) {
        self.send(DispatchInfo::ConnectFailed { addr });
    }

    /// Our radio heard an advertising device.
    pub fn device_found(&self, addr: u64, uuid_rev: u32, eir_capable: bool) {
        self.send(DispatchInfo::FoundDevice {
            addr,
            uuid_rev,
            eir_capable,
            from: None,
        });
    }

    /// Our radio resolved (or lost) advertised nodes.
    pub fn found_nodes(&self, nodes: Vec<NodeAdvert>, lost: bool) {
        self.send(DispatchInfo::FoundNodes { nodes, lost, from: None });
    }

    pub fn update_delegations(&self, reset_minions: bool) {
        self.send(DispatchInfo::UpdateDelegations { reset_minions });
    }

    pub async fn snapshot(&self) -> Option<TopologySnapshot> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(DispatchInfo::Snapshot { reply }).ok()?;
        rx.await.ok()
    }

    fn name_op(&self, op: NameOp, add: bool, name: &str) {
        self.send(DispatchInfo::NameOp {
            op,
            add,
            name: name.to_string(),
            from: None,
        });
    }
}

impl NameService for BtHandle {
    fn transports(&self) -> TransportMask {
        transport::BLUETOOTH
    }

    fn enable_advertisement(&self, name: &str) {
        self.name_op(NameOp::Advertise, true, name);
    }

    fn disable_advertisement(&self, name: &str) {
        self.name_op(NameOp::Advertise, false, name);
    }

    fn enable_discovery(&self, prefix: &str) {
        self.name_op(NameOp::Find, true, prefix);
    }

    fn disable_discovery(&self, prefix: &str) {
        self.name_op(NameOp::Find, false, prefix);
    }
}

impl NameListener for BtHandle {
    fn name_owner_changed(&self, change: &NameChange) {
        if change.name.starts_with(':') && change.new_owner.is_none() {
            self.send(DispatchInfo::NameLost {
                name: change.name.clone(),
            });
        }
    }
}

// ── Dispatcher ────────────────────────────────────────────────────────────────

pub struct BtDispatcher {
    controller: BtController,
    rx: mpsc::UnboundedReceiver<DispatchInfo>,
    shutdown: broadcast::Receiver<()>,
}

impl BtDispatcher {
    /// `local` carries our address, controller name and GUID.
    pub fn new(
        cfg: BluetoothConfig,
        local: BtNode,
        device: Arc<dyn BluetoothDeviceInterface>,
        link: Arc<dyn TopologyLink>,
        shutdown: broadcast::Receiver<()>,
    ) -> (Self, BtHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        let controller = BtController::new(cfg, local, device, link, tx.clone());
        (
            Self {
                controller,
                rx,
                shutdown,
            },
            BtHandle::new(tx),
        )
    }

    pub async fn run(mut self) -> anyhow::Result<()> {
        loop {
            tokio::select! {
                _ = self.shutdown.recv() => {
                    tracing::info!("topology controller shutting down");
                    self.controller.shutdown().await;
                    return Ok(());
                }

                info = self.rx.recv() => {
                    match info {
                        Some(info) => self.controller.dispatch(info).await,
                        None => return Ok(()),
                    }
                }
            }
        }
    }
}
