//! Bluetooth topology controller.
//!
//! Connected Bluetooth daemons form a piconet with one master. The master
//! keeps every node's name lists and decides who runs the radio's find and
//! advertise operations: itself, or one minion at a time, rotated when there
//! are enough minions to share the load. Minions forward their name changes
//! and discoveries to the master and do what it delegates.
//!
//! All state is owned by the dispatcher task. Every handler runs to
//! completion before the next input is looked at.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use junction_core::config::bt_limits::LOST_DEVICE_TIMEOUT_EXT;
use junction_core::config::BluetoothConfig;
use junction_core::session::{SessionId, PROTOCOL_VERSION};
use junction_core::BusError;

use super::device::{BluetoothDeviceInterface, BtRole};
use super::dispatch::DispatchInfo;
use super::link::{AdvertiseArgs, FindArgs, SetStateReply, SetStateRequest, TopologyLink, TopologySignal};
use super::name_args::{NameArgInfo, NameOp};
use super::node::{BtBusAddress, BtNode, BtNodeDb, NodeAdvert, NodeState, Relationship};

/// UUID revision meaning "no revision".
pub const INVALID_UUIDREV: u32 = 0;

/// Revisions this close to a peer's are too easy to confuse with it.
const UUIDREV_SPREAD: u32 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopologyRole {
    Master,
    /// Has a master and minions of its own.
    Drone,
    Minion,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Delegation {
    pub minion: BtBusAddress,
    pub active: bool,
}

/// Point-in-time view of the controller, for status output and tests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopologySnapshot {
    pub self_addr: BtBusAddress,
    pub role: TopologyRole,
    pub master: Option<BtBusAddress>,
    pub nodes: Vec<BtBusAddress>,
    pub found: Vec<BtBusAddress>,
    pub num_minions: usize,
    pub num_eir_minions: usize,
    pub find: Delegation,
    pub advertise: Delegation,
    pub master_uuid_rev: u32,
    pub blacklist: Vec<u64>,
    pub device_available: bool,
    pub listening: bool,
}

/// Name deltas collected while state settles, reported afterwards.
#[derive(Debug, Default)]
struct NameChanges {
    added: Vec<NodeAdvert>,
    removed: Vec<NodeAdvert>,
}

impl NameChanges {
    fn add(&mut self, node: &BtNode, names: Vec<String>) {
        if !names.is_empty() {
            self.added.push(NodeAdvert {
                names,
                ..node.advert(node.connect_addr)
            });
        }
    }

    fn remove(&mut self, node: &BtNode, names: Vec<String>) {
        if !names.is_empty() {
            self.removed.push(NodeAdvert {
                names,
                ..node.advert(node.connect_addr)
            });
        }
    }

    fn remove_all(&mut self, node: &BtNode) {
        self.remove(node, node.advertise_names.iter().cloned().collect());
    }

    fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

fn random_uuid_rev() -> u32 {
    let mut rng = rand::thread_rng();
    loop {
        let rev: u32 = rng.gen();
        if rev != INVALID_UUIDREV {
            return rev;
        }
    }
}

pub struct BtController {
    cfg: BluetoothConfig,
    device: Arc<dyn BluetoothDeviceInterface>,
    link: Arc<dyn TopologyLink>,
    tx: mpsc::UnboundedSender<DispatchInfo>,

    self_addr: BtBusAddress,
    /// Ourselves plus every minion below us.
    node_db: BtNodeDb,
    /// Nodes outside our piconet that we know of.
    found_node_db: BtNodeDb,
    master: Option<BtNode>,

    find: NameArgInfo,
    advertise: NameArgInfo,
    master_uuid_rev: u32,

    dev_available: bool,
    listening: bool,
    blacklist: BTreeMap<u64, JoinHandle<()>>,
    expire_alarm: Option<JoinHandle<()>>,
    /// Nodes we sent `SetState` to and have no answer from yet.
    joining: BTreeSet<BtBusAddress>,
}

impl BtController {
    pub fn new(
        cfg: BluetoothConfig,
        mut local: BtNode,
        device: Arc<dyn BluetoothDeviceInterface>,
        link: Arc<dyn TopologyLink>,
        tx: mpsc::UnboundedSender<DispatchInfo>,
    ) -> Self {
        let self_addr = local.addr;
        local.relationship = Relationship::SelfNode;
        local.connect_addr = self_addr;
        local.eir_capable = device.is_eir_capable();
        local.expires = None;
        let mut node_db = BtNodeDb::default();
        node_db.insert(local);

        Self {
            cfg,
            device,
            link,
            tx,
            self_addr,
            node_db,
            found_node_db: BtNodeDb::default(),
            master: None,
            find: NameArgInfo::new(NameOp::Find, self_addr),
            advertise: NameArgInfo::new(NameOp::Advertise, self_addr),
            master_uuid_rev: random_uuid_rev(),
            dev_available: false,
            listening: false,
            blacklist: BTreeMap::new(),
            expire_alarm: None,
            joining: BTreeSet::new(),
        }
    }

    pub async fn dispatch(&mut self, info: DispatchInfo) {
        match info {
            DispatchInfo::UpdateDelegations { reset_minions } => self.reset_delegations(reset_minions).await,
            DispatchInfo::ExpireCachedNodes => self.expire_cached_nodes().await,
            DispatchInfo::NameLost { name } => self.name_lost(&name).await,
            DispatchInfo::BtDeviceAvailable { on } => self.device_available(on).await,
            DispatchInfo::SendSetState { node } => self.send_set_state(node),
            DispatchInfo::ProcessSetStateReply { node, result } => self.process_set_state_reply(node, result).await,
            DispatchInfo::HandleDelegateFind { from, args } => self.handle_delegate_find(&from, args).await,
            DispatchInfo::HandleDelegateAdvertise { from, args } => self.handle_delegate_advertise(&from, args).await,
            DispatchInfo::ExpireBlacklistedDevice { addr } => {
                if self.blacklist.remove(&addr).is_some() {
                    tracing::debug!(device = format_args!("{addr:012x}"), "blacklist entry expired");
                }
            }
            DispatchInfo::NameOp { op, add, name, from } => self.name_op(op, add, name, from).await,
            DispatchInfo::SetState {
                sender,
                session_id,
                req,
                reply,
            } => {
                let result = self.handle_set_state(&sender, session_id, req).await;
                let _ = reply.send(result);
            }
            DispatchInfo::LostLastConnection { addr } => self.lost_last_connection(addr).await,
            DispatchInfo::FoundNodes { nodes, lost, from } => self.found_nodes(nodes, lost, from).await,
            DispatchInfo::FoundDevice {
                addr,
                uuid_rev,
                eir_capable,
                from,
            } => self.found_device(addr, uuid_rev, eir_capable, from).await,
            DispatchInfo::ConnectFailed { addr } => {
                self.joining.remove(&addr);
                self.blacklist_device(addr.addr).await;
            }
            DispatchInfo::RotateDelegate { op, generation } => self.rotate_delegate(op, generation).await,
            DispatchInfo::Snapshot { reply } => {
                let _ = reply.send(self.snapshot());
            }
        }
    }

    /// Stop whatever we run on the radio and cancel every alarm.
    pub async fn shutdown(&mut self) {
        for op in [NameOp::Find, NameOp::Advertise] {
            if self.info(op).active {
                self.stop_op(op, true).await;
            }
            self.info_mut(op).disarm();
        }
        if let Some(alarm) = self.expire_alarm.take() {
            alarm.abort();
        }
        for (_, alarm) in std::mem::take(&mut self.blacklist) {
            alarm.abort();
        }
        if self.listening {
            self.device.stop_listen().await;
            self.listening = false;
        }
    }

    // ── Roles and policy ─────────────────────────────────────────────────────

    pub fn is_master(&self) -> bool {
        self.master.is_none()
    }

    pub fn is_drone(&self) -> bool {
        self.master.is_some() && self.num_minions() > 0
    }

    pub fn is_minion(&self) -> bool {
        self.master.is_some() && self.num_minions() == 0
    }

    pub fn role(&self) -> TopologyRole {
        if self.is_master() {
            TopologyRole::Master
        } else if self.is_drone() {
            TopologyRole::Drone
        } else {
            TopologyRole::Minion
        }
    }

    pub fn num_minions(&self) -> usize {
        self.node_db.iter().filter(|n| n.is_minion()).count()
    }

    pub fn num_eir_minions(&self) -> usize {
        self.node_db.iter().filter(|n| n.is_minion() && n.eir_capable).count()
    }

    fn direct_minions(&self) -> usize {
        self.node_db
            .iter()
            .filter(|n| n.relationship == Relationship::DirectMinion)
            .count()
    }

    fn eir(&self) -> bool {
        self.device.is_eir_capable()
    }

    pub fn use_local_find(&self) -> bool {
        let eir_minions = self.num_eir_minions();
        self.is_minion() || (!self.eir() && self.num_minions() == 0) || (self.eir() && eir_minions == 0)
    }

    pub fn use_local_advertise(&self) -> bool {
        let eir_minions = self.num_eir_minions();
        self.is_minion()
            || (!self.eir() && eir_minions == 0 && self.num_minions() <= 1)
            || (self.eir() && eir_minions <= 1)
    }

    fn use_local(&self, op: NameOp) -> bool {
        match op {
            NameOp::Find => self.use_local_find(),
            NameOp::Advertise => self.use_local_advertise(),
        }
    }

    /// Whether delegations move between minions on a timer.
    pub fn rotate_minions(&self) -> bool {
        let eir_minions = self.num_eir_minions();
        self.is_master()
            && (eir_minions > self.cfg.rotate_eir_threshold
                || (eir_minions == 0 && self.num_minions() > self.cfg.rotate_minion_threshold))
    }

    fn info(&self, op: NameOp) -> &NameArgInfo {
        match op {
            NameOp::Find => &self.find,
            NameOp::Advertise => &self.advertise,
        }
    }

    fn info_mut(&mut self, op: NameOp) -> &mut NameArgInfo {
        match op {
            NameOp::Find => &mut self.find,
            NameOp::Advertise => &mut self.advertise,
        }
    }

    fn names_empty(&self, op: NameOp) -> bool {
        self.node_db.iter().all(|n| match op {
            NameOp::Find => n.find_names.is_empty(),
            NameOp::Advertise => n.advertise_names.is_empty(),
        })
    }

    fn bump_uuid_rev(&mut self) {
        self.master_uuid_rev = self.master_uuid_rev.wrapping_add(1);
        if self.master_uuid_rev == INVALID_UUIDREV {
            self.master_uuid_rev = 1;
        }
    }

    fn from_master(&self, sender: &str) -> bool {
        self.master.as_ref().is_some_and(|m| m.unique_name == sender)
    }

    pub fn snapshot(&self) -> TopologySnapshot {
        TopologySnapshot {
            self_addr: self.self_addr,
            role: self.role(),
            master: self.master.as_ref().map(|m| m.addr),
            nodes: self.node_db.addrs(),
            found: self.found_node_db.addrs(),
            num_minions: self.num_minions(),
            num_eir_minions: self.num_eir_minions(),
            find: Delegation {
                minion: self.find.minion,
                active: self.find.active,
            },
            advertise: Delegation {
                minion: self.advertise.minion,
                active: self.advertise.active,
            },
            master_uuid_rev: self.master_uuid_rev,
            blacklist: self.blacklist.keys().copied().collect(),
            device_available: self.dev_available,
            listening: self.listening,
        }
    }

    // ── Delegation ───────────────────────────────────────────────────────────

    /// Choose who runs `op` next. Falls back to ourselves when no minion
    /// qualifies.
    pub(super) fn pick_next_delegate(&mut self, op: NameOp) {
        let next = if self.use_local(op) {
            self.self_addr
        } else {
            let eir_minions = self.num_eir_minions();
            // Keep find and advertise on different radios when we can.
            let skip = (eir_minions > 1).then(|| self.info(op.other()).minion);
            let blacklist = &self.blacklist;
            self.node_db
                .find_delegate_minion(self.info(op).minion, skip, eir_minions > 0, |n| {
                    blacklist.contains_key(&n.addr.addr)
                })
                .unwrap_or(self.self_addr)
        };
        tracing::debug!(op = %op, delegate = %next, local = next == self.self_addr, "picked delegate");
        self.info_mut(op).minion = next;
    }

    fn ignore_addrs(&self) -> Vec<u64> {
        let mut addrs: Vec<u64> = self.node_db.iter().map(|n| n.addr.addr).collect();
        addrs.dedup();
        addrs
    }

    fn ad_info(&self) -> Vec<NodeAdvert> {
        self.node_db.iter().map(|n| n.advert(self.self_addr)).collect()
    }

    fn op_duration(&self) -> Duration {
        if self.rotate_minions() {
            self.cfg.delegate_time()
        } else {
            Duration::ZERO
        }
    }

    fn start_signal(&self, op: NameOp) -> TopologySignal {
        let duration_secs = self.op_duration().as_secs();
        match op {
            NameOp::Find => TopologySignal::DelegateFind(Some(FindArgs {
                ignore_addrs: self.ignore_addrs(),
                duration_secs,
            })),
            NameOp::Advertise => TopologySignal::DelegateAdvertise(AdvertiseArgs {
                uuid_rev: self.master_uuid_rev,
                addr: self.self_addr,
                ad_info: self.ad_info(),
                duration_secs,
            }),
        }
    }

    /// A non-immediate advertise stop keeps the current names on the air for
    /// one delegate period so peers see what went away.
    fn stop_signal(&self, op: NameOp, immediate: bool) -> TopologySignal {
        match op {
            NameOp::Find => TopologySignal::DelegateFind(None),
            NameOp::Advertise => TopologySignal::DelegateAdvertise(AdvertiseArgs {
                uuid_rev: self.master_uuid_rev,
                addr: self.self_addr,
                ad_info: if immediate { Vec::new() } else { self.ad_info() },
                duration_secs: if immediate { 0 } else { self.cfg.delegate_time().as_secs() },
            }),
        }
    }

    async fn send_to(&self, addr: BtBusAddress, sig: TopologySignal) -> Result<(), BusError> {
        let node = self
            .node_db
            .get(&addr)
            .or(self.master.as_ref().filter(|m| m.addr == addr))
            .ok_or(BusError::NoRoute)?;
        self.link.signal(node, sig).await
    }

    async fn start_local(&self, op: NameOp) -> Result<(), BusError> {
        match op {
            NameOp::Find => self.device.start_find(&self.ignore_addrs(), Duration::ZERO).await,
            NameOp::Advertise => {
                self.device
                    .start_advertise(self.master_uuid_rev, self.self_addr, &self.ad_info(), Duration::ZERO)
                    .await
            }
        }
    }

    async fn stop_local(&self, op: NameOp, immediate: bool) -> Result<(), BusError> {
        match op {
            NameOp::Find => self.device.stop_find().await,
            NameOp::Advertise if immediate => self.device.stop_advertise().await,
            NameOp::Advertise => {
                self.device
                    .start_advertise(
                        self.master_uuid_rev,
                        self.self_addr,
                        &self.ad_info(),
                        self.cfg.delegate_time(),
                    )
                    .await
            }
        }
    }

    fn arm_rotation(&mut self, op: NameOp) {
        let after = self.cfg.delegate_time();
        let info = match op {
            NameOp::Find => &mut self.find,
            NameOp::Advertise => &mut self.advertise,
        };
        info.arm(after, &self.tx);
    }

    async fn start_op(&mut self, op: NameOp) {
        let mut attempts = match (self.num_eir_minions(), self.direct_minions()) {
            (0, 0) => 1,
            (0, direct) => direct,
            (eir, _) => eir,
        };
        self.info_mut(op).take_changed();

        loop {
            self.pick_next_delegate(op);
            let minion = self.info(op).minion;
            let result = if minion == self.self_addr {
                self.start_local(op).await
            } else {
                let sent = self.send_to(minion, self.start_signal(op)).await;
                if sent.is_ok() && self.rotate_minions() {
                    self.arm_rotation(op);
                }
                sent
            };
            attempts -= 1;

            match result {
                Ok(()) => {
                    tracing::info!(op = %op, delegate = %minion, "started");
                    self.info_mut(op).active = true;
                    return;
                }
                Err(BusError::NoRoute) if attempts > 0 => {
                    tracing::debug!(op = %op, delegate = %minion, "delegate unreachable, trying the next");
                }
                Err(e) => {
                    tracing::warn!(op = %op, delegate = %minion, error = %e, "failed to start");
                    self.info_mut(op).active = false;
                    return;
                }
            }
        }
    }

    async fn stop_op(&mut self, op: NameOp, immediate: bool) {
        let minion = self.info(op).minion;
        let result = if minion == self.self_addr {
            let r = self.stop_local(op, immediate).await;
            self.info_mut(op).active = false;
            r
        } else {
            let r = self.send_to(minion, self.stop_signal(op, immediate)).await;
            let info = self.info_mut(op);
            info.disarm();
            // An unreachable delegate is not running anything.
            info.active = matches!(&r, Err(e) if *e != BusError::NoRoute);
            r
        };
        match result {
            Ok(()) => tracing::info!(op = %op, delegate = %minion, immediate, "stopped"),
            Err(e) => tracing::warn!(op = %op, delegate = %minion, error = %e, "failed to stop"),
        }
    }

    async fn restart_op(&mut self, op: NameOp) {
        self.stop_op(op, true).await;
        self.start_op(op).await;
    }

    /// Bring `op` in line with the current name lists and topology.
    pub(super) async fn update_delegations(&mut self, op: NameOp) {
        let allow = (op == NameOp::Find || self.listening)
            && self.is_master()
            && self.num_minions() < self.cfg.max_connections();
        let changed = self.info(op).dirty;
        let empty = self.names_empty(op);
        let active = self.info(op).active;

        let start = !active && !empty && allow && self.dev_available;
        let stop = active && (empty || !allow);
        let restart = active && changed && !empty && allow;

        if op == NameOp::Advertise && changed {
            self.bump_uuid_rev();
        }
        tracing::debug!(op = %op, start, stop, restart, allow, empty, "updating delegation");

        if start {
            self.start_op(op).await;
        } else if restart {
            self.restart_op(op).await;
        } else if stop {
            self.stop_op(op, false).await;
        }
    }

    async fn update_all(&mut self) {
        self.update_delegations(NameOp::Advertise).await;
        self.update_delegations(NameOp::Find).await;
    }

    async fn reset_delegations(&mut self, reset_minions: bool) {
        if reset_minions {
            for op in [NameOp::Find, NameOp::Advertise] {
                if self.info(op).active {
                    self.stop_op(op, true).await;
                }
                let self_addr = self.self_addr;
                let info = self.info_mut(op);
                info.minion = self_addr;
                info.dirty = true;
            }
        }
        self.update_all().await;
    }

    async fn rotate_delegate(&mut self, op: NameOp, generation: u64) {
        if !self.info(op).is_current(generation) {
            return;
        }
        if !self.rotate_minions() || self.names_empty(op) {
            // Back to a permanent delegation, or to nothing at all.
            let info = self.info_mut(op);
            info.disarm();
            info.dirty = true;
            self.update_delegations(op).await;
            return;
        }

        let prev = self.info(op).minion;
        self.arm_rotation(op);
        self.pick_next_delegate(op);
        let next = self.info(op).minion;

        if prev != next && prev != self.self_addr {
            if let Err(e) = self.send_to(prev, self.stop_signal(op, true)).await {
                tracing::debug!(op = %op, delegate = %prev, error = %e, "could not stop previous delegate");
            }
        }
        let result = if next == self.self_addr {
            self.start_local(op).await
        } else {
            self.send_to(next, self.start_signal(op)).await
        };
        match result {
            Ok(()) => {
                tracing::info!(op = %op, from = %prev, to = %next, "rotated delegate");
                self.info_mut(op).active = true;
            }
            Err(e) => {
                tracing::warn!(op = %op, delegate = %next, error = %e, "rotation failed");
                let info = self.info_mut(op);
                info.disarm();
                info.active = false;
                info.dirty = true;
            }
        }
    }

    // ── Name lists ───────────────────────────────────────────────────────────

    async fn name_op(&mut self, op: NameOp, add: bool, name: String, from: Option<BtBusAddress>) {
        let target = from.unwrap_or(self.self_addr);
        let Some(node) = self.node_db.get_mut(&target) else {
            tracing::debug!(op = %op, node = %target, "name change from a node we do not track");
            return;
        };
        let names = match op {
            NameOp::Find => &mut node.find_names,
            NameOp::Advertise => &mut node.advertise_names,
        };
        let changed = if add { names.insert(name.clone()) } else { names.remove(&name) };
        if !changed {
            return;
        }
        let node = node.clone();
        self.info_mut(op).dirty = true;
        tracing::debug!(op = %op, add, name = %name, node = %target, "name list changed");

        let mut changes = NameChanges::default();
        if op == NameOp::Advertise {
            if add {
                changes.add(&node, vec![name.clone()]);
            } else {
                changes.remove(&node, vec![name.clone()]);
            }
        }

        if let Some(master) = self.master.clone() {
            // Minions and drones pass the change up, including on behalf of
            // their own minions.
            let sig = TopologySignal::NameOp {
                op,
                add,
                from: target,
                name,
            };
            if let Err(e) = self.link.signal(&master, sig).await {
                tracing::warn!(op = %op, master = %master.addr, error = %e, "could not forward name change");
            }
            if self.is_drone() {
                self.distribute_to_minions(&changes).await;
            }
            return;
        }

        if !self.dev_available {
            return;
        }
        self.distribute(changes).await;
        self.update_delegations(op).await;
    }

    /// Report name deltas to our bus and pass them down to direct minions.
    async fn distribute(&self, changes: NameChanges) {
        if changes.is_empty() {
            return;
        }
        for ad in &changes.added {
            self.device.found_names_change(&ad.guid, &ad.names, ad.connect_addr, false);
        }
        for ad in &changes.removed {
            self.device.found_names_change(&ad.guid, &ad.names, ad.connect_addr, true);
        }
        self.distribute_to_minions(&changes).await;
    }

    async fn distribute_to_minions(&self, changes: &NameChanges) {
        let minions: Vec<&BtNode> = self
            .node_db
            .iter()
            .filter(|n| n.relationship == Relationship::DirectMinion)
            .collect();
        for minion in minions {
            for (nodes, lost) in [(&changes.added, false), (&changes.removed, true)] {
                if nodes.is_empty() {
                    continue;
                }
                let sig = TopologySignal::FoundNodes {
                    nodes: nodes.clone(),
                    lost,
                };
                if let Err(e) = self.link.signal(minion, sig).await {
                    tracing::debug!(minion = %minion.addr, error = %e, "could not pass on found nodes");
                }
            }
        }
    }

    // ── Found nodes ──────────────────────────────────────────────────────────

    /// Merge full advertisements. A known node takes the new name set as a
    /// whole.
    fn merge_found(&mut self, nodes: &[NodeAdvert], expires: Option<Instant>, changes: &mut NameChanges) {
        for ad in nodes {
            if ad.addr == self.self_addr
                || self.node_db.contains(&ad.addr)
                || self.blacklist.contains_key(&ad.addr.addr)
            {
                continue;
            }
            let names: BTreeSet<String> = ad.names.iter().cloned().collect();
            match self.found_node_db.get_mut(&ad.addr) {
                Some(node) => {
                    let (added, removed) = node.diff_names(&names);
                    changes.remove(node, removed);
                    node.advertise_names = names;
                    node.uuid_rev = ad.uuid_rev;
                    node.connect_addr = ad.connect_addr;
                    node.eir_capable = ad.eir_capable;
                    node.expires = expires;
                    if !ad.guid.is_empty() {
                        node.guid = ad.guid.clone();
                    }
                    changes.add(node, added);
                }
                None => {
                    let mut node = BtNode::from_advert(ad);
                    node.expires = expires;
                    changes.add(&node, ad.names.clone());
                    self.found_node_db.insert(node);
                }
            }
        }
    }

    /// Apply a delta sent down by our master.
    fn apply_found_delta(&mut self, nodes: Vec<NodeAdvert>, lost: bool, changes: &mut NameChanges) {
        for ad in nodes {
            if ad.addr == self.self_addr || self.node_db.contains(&ad.addr) {
                continue;
            }
            if lost {
                if let Some(node) = self.found_node_db.get_mut(&ad.addr) {
                    let gone: Vec<String> = ad
                        .names
                        .iter()
                        .filter(|n| node.advertise_names.remove(n.as_str()))
                        .cloned()
                        .collect();
                    changes.remove(node, gone);
                }
                continue;
            }
            if !self.found_node_db.contains(&ad.addr) {
                let mut node = BtNode::from_advert(&ad);
                node.advertise_names.clear();
                self.found_node_db.insert(node);
            }
            let Some(node) = self.found_node_db.get_mut(&ad.addr) else {
                continue;
            };
            let new: Vec<String> = ad
                .names
                .iter()
                .filter(|n| node.advertise_names.insert((*n).clone()))
                .cloned()
                .collect();
            changes.add(node, new);
        }
    }

    async fn found_nodes(&mut self, nodes: Vec<NodeAdvert>, lost: bool, from: Option<String>) {
        let from_master = from.as_deref().is_some_and(|f| self.from_master(f));
        if !self.is_master() && !from_master {
            if let Some(master) = self.master.clone() {
                if let Err(e) = self.link.signal(&master, TopologySignal::FoundNodes { nodes, lost }).await {
                    tracing::debug!(master = %master.addr, error = %e, "could not forward found nodes");
                }
            }
            return;
        }

        let mut changes = NameChanges::default();
        if from_master {
            self.apply_found_delta(nodes, lost, &mut changes);
        } else if lost {
            for ad in &nodes {
                if let Some(node) = self.found_node_db.remove(&ad.addr) {
                    changes.remove_all(&node);
                }
            }
        } else {
            let expires = Some(Instant::now() + self.cfg.lost_device_timeout());
            self.merge_found(&nodes, expires, &mut changes);
            self.reset_expire_alarm();
        }
        self.distribute(changes).await;
    }

    async fn found_device(&mut self, addr: u64, uuid_rev: u32, eir_capable: bool, from: Option<String>) {
        if !self.is_master() {
            if from.is_none() {
                if let Some(master) = self.master.clone() {
                    let sig = TopologySignal::FoundDevice {
                        addr,
                        uuid_rev,
                        eir_capable,
                    };
                    if let Err(e) = self.link.signal(&master, sig).await {
                        tracing::debug!(master = %master.addr, error = %e, "could not forward found device");
                    }
                }
            }
            return;
        }
        if self.node_db.iter().any(|n| n.addr.addr == addr) || self.blacklist.contains_key(&addr) {
            return;
        }

        let known = self.found_node_db.iter().find(|n| n.addr.addr == addr).cloned();
        if let Some(known) = known {
            if uuid_rev != INVALID_UUIDREV && known.uuid_rev == uuid_rev && eir_capable {
                // Same advertisement as before; just keep it alive.
                let expires = Instant::now() + self.cfg.lost_device_timeout();
                for a in self.found_node_db.via(known.connect_addr) {
                    if let Some(node) = self.found_node_db.get_mut(&a) {
                        node.expires = Some(expires);
                    }
                }
                self.reset_expire_alarm();
                return;
            }
        }

        match self.device.get_device_info(addr).await {
            Ok(info) => {
                let mut changes = NameChanges::default();
                let listed: BTreeSet<BtBusAddress> = info.ad_info.iter().map(|a| a.addr).collect();
                for stale in self.found_node_db.via(info.connect_addr) {
                    if listed.contains(&stale) {
                        continue;
                    }
                    if let Some(node) = self.found_node_db.remove(&stale) {
                        changes.remove_all(&node);
                    }
                }
                let expires = Some(Instant::now() + self.cfg.lost_device_timeout());
                self.merge_found(&info.ad_info, expires, &mut changes);
                self.reset_expire_alarm();
                tracing::debug!(device = format_args!("{addr:012x}"), uuid_rev = info.uuid_rev, "device info merged");
                self.distribute(changes).await;
            }
            Err(e) => {
                tracing::warn!(device = format_args!("{addr:012x}"), error = %e, "device info query failed");
                self.blacklist_device(addr).await;
            }
        }
    }

    async fn blacklist_device(&mut self, addr: u64) {
        let mut changes = NameChanges::default();
        for node in self.found_node_db.remove_device(addr) {
            changes.remove_all(&node);
        }
        let after = self.cfg.blacklist_time();
        let tx = self.tx.clone();
        let alarm = tokio::spawn(async move {
            tokio::time::sleep(after).await;
            let _ = tx.send(DispatchInfo::ExpireBlacklistedDevice { addr });
        });
        if let Some(old) = self.blacklist.insert(addr, alarm) {
            old.abort();
        }
        tracing::info!(device = format_args!("{addr:012x}"), secs = after.as_secs(), "device blacklisted");
        self.distribute(changes).await;
    }

    /// Re-arm the found-node expiry alarm for the earliest expiry. Only a
    /// master ages nodes out.
    fn reset_expire_alarm(&mut self) {
        if let Some(alarm) = self.expire_alarm.take() {
            alarm.abort();
        }
        if !self.is_master() {
            return;
        }
        let Some(next) = self.found_node_db.next_expiry() else {
            return;
        };
        let when = next + LOST_DEVICE_TIMEOUT_EXT;
        let tx = self.tx.clone();
        self.expire_alarm = Some(tokio::spawn(async move {
            tokio::time::sleep_until(when).await;
            let _ = tx.send(DispatchInfo::ExpireCachedNodes);
        }));
    }

    async fn expire_cached_nodes(&mut self) {
        self.expire_alarm = None;
        if !self.is_master() {
            return;
        }
        let mut changes = NameChanges::default();
        let gone = self.found_node_db.remove_expired(Instant::now());
        for node in &gone {
            changes.remove_all(node);
        }
        if !gone.is_empty() {
            tracing::debug!(count = gone.len(), "found nodes expired");
        }
        self.reset_expire_alarm();
        self.distribute(changes).await;
    }

    // ── Connections ──────────────────────────────────────────────────────────

    async fn device_available(&mut self, on: bool) {
        if on == self.dev_available {
            return;
        }
        self.dev_available = on;
        tracing::info!(available = on, "bluetooth device availability changed");

        if on {
            self.start_listening().await;
            self.find.dirty = true;
            self.advertise.dirty = true;
            self.update_all().await;
            return;
        }

        let self_addr = self.self_addr;
        self.find.reset(self_addr);
        self.advertise.reset(self_addr);
        if self.listening {
            self.device.stop_listen().await;
            self.listening = false;
        }
        let mut changes = NameChanges::default();
        for node in self.found_node_db.clear() {
            changes.remove_all(&node);
        }
        if let Some(alarm) = self.expire_alarm.take() {
            alarm.abort();
        }
        self.distribute(changes).await;
    }

    async fn start_listening(&mut self) {
        match self.device.start_listen().await {
            Ok(addr) => {
                if addr != self.self_addr {
                    tracing::warn!(expected = %self.self_addr, got = %addr, "listening on an unexpected address");
                }
                self.listening = true;
            }
            Err(e) => tracing::warn!(error = %e, "could not start listening"),
        }
    }

    async fn drop_link(&self, unique_name: &str) {
        if let Err(e) = self.device.disconnect(unique_name).await {
            tracing::debug!(peer = unique_name, error = %e, "disconnect failed");
        }
    }

    async fn align_bt_role(&self, addr: u64, want_master: bool) {
        match self.device.is_master(addr).await {
            Ok(is_master) if is_master == want_master => {}
            Ok(_) => {
                let role = if want_master { BtRole::Master } else { BtRole::Slave };
                self.device.request_bt_role(addr, role).await;
            }
            Err(e) => tracing::debug!(device = format_args!("{addr:012x}"), error = %e, "link role unknown"),
        }
    }

    fn node_states(&self) -> Vec<NodeState> {
        self.node_db.iter().map(BtNode::state).collect()
    }

    fn found_adverts(&self) -> Vec<NodeAdvert> {
        self.found_node_db.iter().map(|n| n.advert(n.connect_addr)).collect()
    }

    fn validate(&self, node_states: &[NodeState]) -> Result<(), BusError> {
        for st in node_states {
            if st.unique_name.is_empty() {
                return Err(BusError::InvalidNodeState(format!("node {} has no unique name", st.addr)));
            }
            if st.addr == self.self_addr {
                return Err(BusError::InvalidNodeState(format!("node {} claims our address", st.addr)));
            }
        }
        Ok(())
    }

    /// A link came up. Masters exchange state with the other side; whoever
    /// answers decides which of the two stays master.
    fn send_set_state(&mut self, node: BtNode) {
        if !self.is_master() {
            tracing::debug!(node = %node.addr, "not master, leaving SetState to the other side");
            return;
        }
        if node.addr == self.self_addr || self.node_db.contains(&node.addr) || !self.joining.insert(node.addr) {
            tracing::debug!(node = %node.addr, "SetState already done or in flight");
            return;
        }
        let req = SetStateRequest {
            direct_minions: self.direct_minions(),
            eir_capable: self.eir(),
            uuid_rev: self.master_uuid_rev,
            addr: self.self_addr,
            node_states: self.node_states(),
            found_nodes: self.found_adverts(),
        };
        tracing::debug!(node = %node.addr, nodes = req.node_states.len(), "sending SetState");
        let link = self.link.clone();
        let tx = self.tx.clone();
        tokio::spawn(async move {
            let result = link.set_state(&node, req).await;
            let _ = tx.send(DispatchInfo::ProcessSetStateReply { node, result });
        });
    }

    async fn process_set_state_reply(&mut self, mut node: BtNode, result: Result<SetStateReply, BusError>) {
        self.joining.remove(&node.addr);
        let joined = self.node_db.contains(&node.addr) || self.master.as_ref().is_some_and(|m| m.addr == node.addr);
        if joined {
            // The other side's SetState got there first.
            tracing::debug!(node = %node.addr, "already joined, ignoring SetState reply");
            return;
        }
        let reply = match result {
            Ok(reply) => reply,
            Err(e) => {
                tracing::warn!(node = %node.addr, error = %e, "SetState failed, topology unchanged");
                self.drop_link(&node.unique_name).await;
                return;
            }
        };
        if !self.is_master() {
            tracing::debug!(node = %node.addr, "no longer master, ignoring SetState reply");
            return;
        }
        if reply.addr != node.addr {
            tracing::warn!(expected = %node.addr, got = %reply.addr, "SetState reply from an unexpected node");
            self.drop_link(&node.unique_name).await;
            return;
        }

        node.eir_capable = reply.eir_capable;
        node.uuid_rev = reply.uuid_rev;
        node.expires = None;
        let outcome = if reply.node_states.is_empty() {
            self.become_minion(node.clone(), &[], &reply.found_nodes).await
        } else {
            let no_rotate = !self.rotate_minions();
            node.relationship = Relationship::DirectMinion;
            match self.import_state(node.clone(), &reply.node_states, &reply.found_nodes).await {
                Ok(()) => {
                    self.minion_joined(no_rotate, reply.uuid_rev).await;
                    self.update_all().await;
                    Ok(())
                }
                Err(e) => Err(e),
            }
        };
        if let Err(e) = outcome {
            tracing::warn!(node = %node.addr, error = %e, "rejected SetState reply");
            self.drop_link(&node.unique_name).await;
        }
    }

    async fn handle_set_state(
        &mut self,
        sender: &str,
        session_id: SessionId,
        req: SetStateRequest,
    ) -> Result<SetStateReply, BusError> {
        let ep = self
            .device
            .lookup_endpoint(sender)
            .ok_or_else(|| BusError::NotAllowed(format!("{sender} is not a bluetooth endpoint")))?;
        let remote_protocol = ep.protocol_version();
        self.device.return_endpoint(ep);

        if !self.is_master() {
            return Err(BusError::NotAllowed("SetState sent to a minion".into()));
        }
        if self.node_db.contains(&req.addr) {
            return Err(BusError::NotAllowed(format!("{} already sent its state", req.addr)));
        }
        if self.joining.contains(&req.addr) && self.self_addr > req.addr {
            // Crossed SetStates: the one sent by the higher address wins.
            return Err(BusError::NotAllowed(format!("SetState to {} already in flight", req.addr)));
        }
        if req.addr == self.self_addr {
            self.drop_link(sender).await;
            return Err(BusError::InvalidNodeState(format!("{sender} claims our address")));
        }
        self.validate(&req.node_states)?;

        let mut connecting = self
            .found_node_db
            .get(&req.addr)
            .cloned()
            .unwrap_or_else(|| BtNode::new(req.addr, sender));
        connecting.unique_name = sender.to_string();
        connecting.connect_addr = req.addr;
        connecting.uuid_rev = req.uuid_rev;
        connecting.session_id = session_id;
        connecting.eir_capable = req.eir_capable;
        connecting.expires = None;

        let eir = self.eir();
        let want_master = PROTOCOL_VERSION > remote_protocol
            || (PROTOCOL_VERSION == remote_protocol
                && ((!eir && req.eir_capable)
                    || (eir == req.eir_capable && self.direct_minions() >= req.direct_minions)));
        self.align_bt_role(req.addr.addr, want_master).await;
        tracing::info!(node = %req.addr, remote_protocol, want_master, "SetState election");

        if want_master {
            let mut found_nodes = self.found_adverts();
            found_nodes.extend(self.node_db.iter().map(|n| n.advert(self.self_addr)));
            let no_rotate = !self.rotate_minions();
            connecting.relationship = Relationship::DirectMinion;
            if let Err(e) = self.import_state(connecting, &req.node_states, &req.found_nodes).await {
                self.drop_link(sender).await;
                return Err(e);
            }
            self.minion_joined(no_rotate, req.uuid_rev).await;
            let _ = self.tx.send(DispatchInfo::UpdateDelegations { reset_minions: false });
            Ok(SetStateReply {
                eir_capable: eir,
                uuid_rev: self.master_uuid_rev,
                addr: self.self_addr,
                node_states: Vec::new(),
                found_nodes,
            })
        } else {
            let node_states = self.node_states();
            let found_nodes = self.found_adverts();
            if let Err(e) = self.become_minion(connecting, &req.node_states, &req.found_nodes).await {
                self.drop_link(sender).await;
                return Err(e);
            }
            Ok(SetStateReply {
                eir_capable: eir,
                uuid_rev: self.master_uuid_rev,
                addr: self.self_addr,
                node_states,
                found_nodes,
            })
        }
    }

    /// Adjust delegations after a minion joined us.
    async fn minion_joined(&mut self, no_rotate: bool, other_uuid_rev: u32) {
        for op in [NameOp::Find, NameOp::Advertise] {
            if self.info(op).minion == self.self_addr && !self.use_local(op) {
                if self.info(op).active {
                    if let Err(e) = self.stop_local(op, true).await {
                        tracing::warn!(op = %op, error = %e, "failed to stop local operation");
                    }
                    self.info_mut(op).active = false;
                }
                self.info_mut(op).dirty = true;
            }
        }
        if no_rotate && self.rotate_minions() {
            self.find.dirty = true;
            self.advertise.dirty = true;
        }
        if self.master_uuid_rev.abs_diff(other_uuid_rev) <= UUIDREV_SPREAD {
            loop {
                self.master_uuid_rev = random_uuid_rev();
                if self.master_uuid_rev.abs_diff(other_uuid_rev) > UUIDREV_SPREAD {
                    break;
                }
            }
        }
        // The ignore list grew.
        self.find.dirty = true;
        self.advertise.dirty = true;
    }

    async fn become_minion(
        &mut self,
        mut master: BtNode,
        node_states: &[NodeState],
        found_nodes: &[NodeAdvert],
    ) -> Result<(), BusError> {
        self.validate(node_states)?;
        for op in [NameOp::Advertise, NameOp::Find] {
            if self.info(op).active {
                self.stop_op(op, true).await;
            }
            let self_addr = self.self_addr;
            self.info_mut(op).reset(self_addr);
        }
        master.relationship = Relationship::Master;
        master.expires = None;
        tracing::info!(master = %master.addr, minions = self.num_minions(), "joining piconet");
        self.master = Some(master.clone());
        self.import_state(master, node_states, found_nodes).await
    }

    /// Fold a peer's node states and found nodes into ours. Nothing changes
    /// if the states are invalid.
    pub(super) async fn import_state(
        &mut self,
        connecting: BtNode,
        node_states: &[NodeState],
        found_nodes: &[NodeAdvert],
    ) -> Result<(), BusError> {
        self.validate(node_states)?;
        let via = connecting.addr;
        let mut changes = NameChanges::default();
        if self.is_master() {
            self.import_minions(connecting, node_states, found_nodes, &mut changes);
            self.reset_expire_alarm();
        } else {
            self.import_peers(&connecting, node_states, found_nodes, &mut changes);
            if let Some(alarm) = self.expire_alarm.take() {
                alarm.abort();
            }
        }
        tracing::debug!(
            node = %via,
            nodes = self.node_db.len(),
            found = self.found_node_db.len(),
            "imported state"
        );
        self.distribute(changes).await;
        Ok(())
    }

    fn import_minions(
        &mut self,
        connecting: BtNode,
        node_states: &[NodeState],
        found_nodes: &[NodeAdvert],
        changes: &mut NameChanges,
    ) {
        let via = connecting.addr;
        let mut saw_connecting = false;
        for st in node_states {
            let direct = st.addr == via;
            let mut node = if direct {
                saw_connecting = true;
                BtNode {
                    guid: st.guid.clone(),
                    advertise_names: st.advertise_names.iter().cloned().collect(),
                    find_names: st.find_names.iter().cloned().collect(),
                    eir_capable: st.eir_capable,
                    ..connecting.clone()
                }
            } else {
                BtNode::from_state(st, via)
            };
            node.relationship = if direct {
                Relationship::DirectMinion
            } else {
                Relationship::IndirectMinion
            };
            node.connect_addr = via;
            node.expires = None;
            self.merge_minion(node, changes);
        }
        if !saw_connecting {
            let mut node = connecting;
            node.relationship = Relationship::DirectMinion;
            node.connect_addr = via;
            node.expires = None;
            self.merge_minion(node, changes);
        }

        for stale in self.found_node_db.remove_via(via) {
            changes.remove_all(&stale);
        }
        let expires = Some(Instant::now() + self.cfg.lost_device_timeout());
        self.merge_found(found_nodes, expires, changes);
    }

    fn merge_minion(&mut self, node: BtNode, changes: &mut NameChanges) {
        if !node.advertise_names.is_empty() {
            self.advertise.dirty = true;
        }
        if !node.find_names.is_empty() {
            self.find.dirty = true;
        }
        match self.found_node_db.remove(&node.addr) {
            Some(known) => {
                let (added, removed) = known.diff_names(&node.advertise_names);
                changes.remove(&known, removed);
                changes.add(&node, added);
            }
            None => changes.add(&node, node.advertise_names.iter().cloned().collect()),
        }
        self.node_db.insert(node);
    }

    /// We are not master: the piconet we joined becomes found nodes reached
    /// through `connecting`.
    fn import_peers(
        &mut self,
        connecting: &BtNode,
        node_states: &[NodeState],
        found_nodes: &[NodeAdvert],
        changes: &mut NameChanges,
    ) {
        let via = connecting.addr;
        let peers: Vec<NodeAdvert> = if node_states.is_empty() {
            found_nodes
                .iter()
                .filter(|a| a.addr == via || a.connect_addr == via)
                .map(|a| NodeAdvert {
                    connect_addr: via,
                    ..a.clone()
                })
                .collect()
        } else {
            node_states
                .iter()
                .map(|st| NodeAdvert {
                    addr: st.addr,
                    connect_addr: via,
                    guid: st.guid.clone(),
                    uuid_rev: if st.addr == via { connecting.uuid_rev } else { INVALID_UUIDREV },
                    eir_capable: st.eir_capable,
                    names: st.advertise_names.clone(),
                })
                .collect()
        };
        let listed: BTreeSet<BtBusAddress> = peers.iter().map(|a| a.addr).collect();

        for stale in self.found_node_db.via(via) {
            if listed.contains(&stale) {
                continue;
            }
            if let Some(node) = self.found_node_db.remove(&stale) {
                changes.remove_all(&node);
            }
        }
        self.merge_found(&peers, None, changes);

        let rest: Vec<NodeAdvert> = found_nodes
            .iter()
            .filter(|a| !listed.contains(&a.addr) && !self.found_node_db.contains(&a.addr))
            .cloned()
            .collect();
        self.merge_found(&rest, None, changes);
    }

    async fn lost_last_connection(&mut self, addr: BtBusAddress) {
        self.joining.remove(&addr);
        let mut changes = NameChanges::default();
        let lost_master = self
            .master
            .as_ref()
            .is_some_and(|m| m.addr == addr || m.addr.addr == addr.addr);

        if lost_master {
            if let Some(old) = self.master.take() {
                tracing::info!(master = %old.addr, "lost master, taking over");
                for node in self.found_node_db.remove_via(old.addr) {
                    changes.remove_all(&node);
                }
            }
            let self_addr = self.self_addr;
            self.find.reset(self_addr);
            self.advertise.reset(self_addr);
            if self.dev_available && !self.listening {
                self.start_listening().await;
            }
            let expires = Instant::now() + self.cfg.lost_device_timeout();
            for a in self.found_node_db.addrs() {
                if let Some(node) = self.found_node_db.get_mut(&a) {
                    node.expires = Some(expires);
                }
            }
            self.reset_expire_alarm();
        } else {
            let Some(lost) = self.resolve_direct(addr) else {
                tracing::debug!(node = %addr, "lost connection to a node we do not track");
                return;
            };
            let gone = self.node_db.remove_via(lost);
            let self_addr = self.self_addr;
            for node in &gone {
                if self.find.minion == node.addr {
                    self.find.reset(self_addr);
                }
                if self.advertise.minion == node.addr {
                    self.advertise.reset(self_addr);
                }
                if !node.advertise_names.is_empty() {
                    self.advertise.dirty = true;
                }
                changes.remove_all(node);
            }
            self.find.dirty = true;
            tracing::info!(node = %lost, dropped = gone.len(), minions = self.num_minions(), "lost minion");
        }

        self.distribute(changes).await;
        self.update_all().await;
    }

    /// `addr` may carry a different PSM than the one we recorded.
    fn resolve_direct(&self, addr: BtBusAddress) -> Option<BtBusAddress> {
        if addr != self.self_addr && self.node_db.contains(&addr) {
            return Some(addr);
        }
        self.node_db
            .iter()
            .find(|n| n.addr.addr == addr.addr && n.relationship == Relationship::DirectMinion)
            .map(|n| n.addr)
    }

    async fn name_lost(&mut self, name: &str) {
        let addr = match &self.master {
            Some(m) if m.unique_name == name => Some(m.addr),
            _ => self
                .node_db
                .find_by_unique_name(name)
                .filter(|n| n.relationship == Relationship::DirectMinion)
                .map(|n| n.addr),
        };
        if let Some(addr) = addr {
            self.lost_last_connection(addr).await;
        }
    }

    // ── Delegated work ───────────────────────────────────────────────────────

    async fn handle_delegate_find(&mut self, from: &str, args: Option<FindArgs>) {
        if !self.from_master(from) {
            tracing::warn!(sender = from, "DelegateFind from a node that is not our master");
            return;
        }
        let result = match args {
            Some(args) => {
                self.device
                    .start_find(&args.ignore_addrs, Duration::from_secs(args.duration_secs))
                    .await
            }
            None => self.device.stop_find().await,
        };
        if let Err(e) = result {
            tracing::warn!(error = %e, "delegated find failed");
        }
    }

    async fn handle_delegate_advertise(&mut self, from: &str, args: AdvertiseArgs) {
        if !self.from_master(from) {
            tracing::warn!(sender = from, "DelegateAdvertise from a node that is not our master");
            return;
        }
        let result = if args.is_stop() {
            self.device.stop_advertise().await
        } else {
            self.device
                .start_advertise(
                    args.uuid_rev,
                    args.addr,
                    &args.ad_info,
                    Duration::from_secs(args.duration_secs),
                )
                .await
        };
        if let Err(e) = result {
            tracing::warn!(error = %e, "delegated advertise failed");
        }
    }
}
