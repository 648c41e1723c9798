//! Bluetooth node records and the node databases.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::ops::Bound;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use junction_core::session::SessionId;

/// Device address plus L2CAP PSM. Ordered by device address first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BtBusAddress {
    pub addr: u64,
    pub psm: u16,
}

impl BtBusAddress {
    pub const fn new(addr: u64, psm: u16) -> Self {
        Self { addr, psm }
    }
}

impl fmt::Display for BtBusAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = self.addr.to_be_bytes();
        write!(
            f,
            "addr={:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X},psm={:#06x}",
            b[2], b[3], b[4], b[5], b[6], b[7], self.psm
        )
    }
}

/// How a node relates to us.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Relationship {
    SelfNode,
    Master,
    DirectMinion,
    IndirectMinion,
    Unaffiliated,
}

/// Node state as exchanged in `SetState`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeState {
    pub guid: String,
    pub unique_name: String,
    pub addr: BtBusAddress,
    pub advertise_names: Vec<String>,
    pub find_names: Vec<String>,
    pub eir_capable: bool,
}

/// A node as seen in advertisements: where it is and what it advertises.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeAdvert {
    pub addr: BtBusAddress,
    /// Node to connect to in order to reach `addr`.
    pub connect_addr: BtBusAddress,
    pub guid: String,
    pub uuid_rev: u32,
    pub eir_capable: bool,
    pub names: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BtNode {
    pub addr: BtBusAddress,
    pub unique_name: String,
    pub guid: String,
    pub uuid_rev: u32,
    pub session_id: SessionId,
    pub relationship: Relationship,
    pub connect_addr: BtBusAddress,
    pub advertise_names: BTreeSet<String>,
    pub find_names: BTreeSet<String>,
    pub eir_capable: bool,
    /// Found nodes age out; connected nodes never do.
    pub expires: Option<Instant>,
}

impl BtNode {
    pub fn new(addr: BtBusAddress, unique_name: &str) -> Self {
        Self {
            addr,
            unique_name: unique_name.to_string(),
            guid: String::new(),
            uuid_rev: 0,
            session_id: 0,
            relationship: Relationship::Unaffiliated,
            connect_addr: addr,
            advertise_names: BTreeSet::new(),
            find_names: BTreeSet::new(),
            eir_capable: false,
            expires: None,
        }
    }

    pub fn from_state(st: &NodeState, connect_addr: BtBusAddress) -> Self {
        Self {
            guid: st.guid.clone(),
            connect_addr,
            advertise_names: st.advertise_names.iter().cloned().collect(),
            find_names: st.find_names.iter().cloned().collect(),
            eir_capable: st.eir_capable,
            ..Self::new(st.addr, &st.unique_name)
        }
    }

    pub fn from_advert(ad: &NodeAdvert) -> Self {
        Self {
            guid: ad.guid.clone(),
            uuid_rev: ad.uuid_rev,
            connect_addr: ad.connect_addr,
            advertise_names: ad.names.iter().cloned().collect(),
            eir_capable: ad.eir_capable,
            ..Self::new(ad.addr, "")
        }
    }

    pub fn is_minion(&self) -> bool {
        matches!(self.relationship, Relationship::DirectMinion | Relationship::IndirectMinion)
    }

    pub fn state(&self) -> NodeState {
        NodeState {
            guid: self.guid.clone(),
            unique_name: self.unique_name.clone(),
            addr: self.addr,
            advertise_names: self.advertise_names.iter().cloned().collect(),
            find_names: self.find_names.iter().cloned().collect(),
            eir_capable: self.eir_capable,
        }
    }

    /// Advertisement view, reachable through `connect_addr`.
    pub fn advert(&self, connect_addr: BtBusAddress) -> NodeAdvert {
        NodeAdvert {
            addr: self.addr,
            connect_addr,
            guid: self.guid.clone(),
            uuid_rev: self.uuid_rev,
            eir_capable: self.eir_capable,
            names: self.advertise_names.iter().cloned().collect(),
        }
    }

    /// Advertised names `other` has that we lack, and those we have that it
    /// dropped.
    pub fn diff_names(&self, other: &BTreeSet<String>) -> (Vec<String>, Vec<String>) {
        let added = other.difference(&self.advertise_names).cloned().collect();
        let removed = self.advertise_names.difference(other).cloned().collect();
        (added, removed)
    }
}

/// Nodes keyed by bus address.
#[derive(Debug, Default, Clone)]
pub struct BtNodeDb {
    nodes: BTreeMap<BtBusAddress, BtNode>,
}

impl BtNodeDb {
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn contains(&self, addr: &BtBusAddress) -> bool {
        self.nodes.contains_key(addr)
    }

    pub fn get(&self, addr: &BtBusAddress) -> Option<&BtNode> {
        self.nodes.get(addr)
    }

    pub fn get_mut(&mut self, addr: &BtBusAddress) -> Option<&mut BtNode> {
        self.nodes.get_mut(addr)
    }

    /// Insert or replace.
    pub fn insert(&mut self, node: BtNode) {
        self.nodes.insert(node.addr, node);
    }

    pub fn remove(&mut self, addr: &BtBusAddress) -> Option<BtNode> {
        self.nodes.remove(addr)
    }

    pub fn clear(&mut self) -> Vec<BtNode> {
        std::mem::take(&mut self.nodes).into_values().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &BtNode> {
        self.nodes.values()
    }

    pub fn addrs(&self) -> Vec<BtBusAddress> {
        self.nodes.keys().copied().collect()
    }

    pub fn find_by_unique_name(&self, name: &str) -> Option<&BtNode> {
        self.nodes.values().find(|n| !n.unique_name.is_empty() && n.unique_name == name)
    }

    /// Nodes reached through `connect_addr`, including the node itself.
    pub fn via(&self, connect_addr: BtBusAddress) -> Vec<BtBusAddress> {
        self.nodes
            .values()
            .filter(|n| n.addr == connect_addr || n.connect_addr == connect_addr)
            .map(|n| n.addr)
            .collect()
    }

    pub fn remove_via(&mut self, connect_addr: BtBusAddress) -> Vec<BtNode> {
        self.via(connect_addr)
            .into_iter()
            .filter_map(|a| self.nodes.remove(&a))
            .collect()
    }

    /// Drop every node on the device `addr`, whatever its PSM.
    pub fn remove_device(&mut self, addr: u64) -> Vec<BtNode> {
        let hits: Vec<BtBusAddress> = self.nodes.keys().filter(|k| k.addr == addr).copied().collect();
        hits.into_iter().filter_map(|a| self.nodes.remove(&a)).collect()
    }

    pub fn next_expiry(&self) -> Option<Instant> {
        self.nodes.values().filter_map(|n| n.expires).min()
    }

    pub fn remove_expired(&mut self, now: Instant) -> Vec<BtNode> {
        let gone: Vec<BtBusAddress> = self
            .nodes
            .values()
            .filter(|n| n.expires.is_some_and(|t| t <= now))
            .map(|n| n.addr)
            .collect();
        gone.into_iter().filter_map(|a| self.nodes.remove(&a)).collect()
    }

    /// Next minion after `start` in address order, wrapping around.
    ///
    /// With `prefer_eir` the first EIR-capable candidate wins; otherwise the
    /// first candidate does. `skip` and nodes rejected by `excluded` are
    /// never candidates.
    pub fn find_delegate_minion(
        &self,
        start: BtBusAddress,
        skip: Option<BtBusAddress>,
        prefer_eir: bool,
        excluded: impl Fn(&BtNode) -> bool,
    ) -> Option<BtBusAddress> {
        let after = self.nodes.range((Bound::Excluded(start), Bound::Unbounded));
        let before = self.nodes.range(..=start);
        let mut first = None;
        for node in after.chain(before).map(|(_, n)| n) {
            if !node.is_minion() || Some(node.addr) == skip || excluded(node) {
                continue;
            }
            if !prefer_eir {
                return Some(node.addr);
            }
            if node.eir_capable {
                return Some(node.addr);
            }
            first.get_or_insert(node.addr);
        }
        first
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minion(addr: u64, eir: bool) -> BtNode {
        BtNode {
            relationship: Relationship::DirectMinion,
            eir_capable: eir,
            ..BtNode::new(BtBusAddress::new(addr, 1), &format!(":m.{addr}"))
        }
    }

    fn db(nodes: Vec<BtNode>) -> BtNodeDb {
        let mut db = BtNodeDb::default();
        for n in nodes {
            db.insert(n);
        }
        db
    }

    #[test]
    fn address_display() {
        let a = BtBusAddress::new(0x0011_2233_4455, 0x1003);
        assert_eq!(a.to_string(), "addr=00:11:22:33:44:55,psm=0x1003");
    }

    #[test]
    fn delegate_search_wraps_in_address_order() {
        let me = BtNode {
            relationship: Relationship::SelfNode,
            ..BtNode::new(BtBusAddress::new(5, 1), ":me.1")
        };
        let db = db(vec![me, minion(2, false), minion(7, false), minion(9, false)]);
        let pick = |start: u64| db.find_delegate_minion(BtBusAddress::new(start, 1), None, false, |_| false);

        assert_eq!(pick(5), Some(BtBusAddress::new(7, 1)));
        assert_eq!(pick(7), Some(BtBusAddress::new(9, 1)));
        assert_eq!(pick(9), Some(BtBusAddress::new(2, 1)));
        // Start need not be present any more.
        assert_eq!(pick(8), Some(BtBusAddress::new(9, 1)));
    }

    #[test]
    fn delegate_search_prefers_eir_and_honours_exclusions() {
        let db = db(vec![minion(1, false), minion(2, true), minion(3, true)]);
        let start = BtBusAddress::new(0, 1);

        assert_eq!(db.find_delegate_minion(start, None, true, |_| false), Some(BtBusAddress::new(2, 1)));
        assert_eq!(
            db.find_delegate_minion(start, Some(BtBusAddress::new(2, 1)), true, |_| false),
            Some(BtBusAddress::new(3, 1))
        );
        assert_eq!(
            db.find_delegate_minion(start, None, true, |n| n.eir_capable),
            Some(BtBusAddress::new(1, 1))
        );
        assert_eq!(db.find_delegate_minion(start, None, false, |_| true), None);
    }

    #[test]
    fn removal_via_connect_node() {
        let mut hub = minion(1, false);
        hub.connect_addr = hub.addr;
        let mut leaf = minion(2, false);
        leaf.relationship = Relationship::IndirectMinion;
        leaf.connect_addr = hub.addr;
        let mut db = db(vec![hub, leaf, minion(3, false)]);

        let gone = db.remove_via(BtBusAddress::new(1, 1));
        assert_eq!(gone.len(), 2);
        assert_eq!(db.addrs(), vec![BtBusAddress::new(3, 1)]);
    }

    #[test]
    fn name_diff() {
        let mut node = minion(1, false);
        node.advertise_names = ["a", "b"].iter().map(|s| s.to_string()).collect();
        let other: BTreeSet<String> = ["b", "c"].iter().map(|s| s.to_string()).collect();
        let (added, removed) = node.diff_names(&other);
        assert_eq!(added, vec!["c".to_string()]);
        assert_eq!(removed, vec!["a".to_string()]);
    }
}
