//! Advertisement and discovery of well-known names.
//!
//! Transports that can reach other daemons register a `NameService`. A
//! transport is told to advertise a name when the first local endpoint
//! advertises it, and to stop when the last one cancels. Names found by
//! transports are cached with a time-to-live and matched against the
//! prefixes local endpoints are looking for.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::json;

use junction_core::session::transport::{self, TransportMask};
use junction_core::session::{AdvertiseReply, CancelAdvertiseReply, CancelFindReply, FindReply};
use junction_core::Message;

use super::BusController;

/// A transport's view of name advertisement and discovery.
pub trait NameService: Send + Sync {
    fn transports(&self) -> TransportMask;
    fn enable_advertisement(&self, name: &str);
    fn disable_advertisement(&self, name: &str);
    fn enable_discovery(&self, prefix: &str);
    fn disable_discovery(&self, prefix: &str);
}

/// One place a well-known name was seen.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NameMapEntry {
    pub bus_addr: String,
    pub guid: String,
    pub transport: TransportMask,
    pub timestamp: Instant,
    pub ttl: Duration,
}

impl NameMapEntry {
    fn is_expired(&self, now: Instant) -> bool {
        now.duration_since(self.timestamp) >= self.ttl
    }
}

/// Registrations are `(endpoint, transports)` in arrival order.
#[derive(Debug, Default)]
pub(super) struct Discovery {
    advertise: BTreeMap<String, Vec<(String, TransportMask)>>,
    discover: BTreeMap<String, Vec<(String, TransportMask)>>,
    found: BTreeMap<String, Vec<NameMapEntry>>,
    /// `(endpoint, name, bus_addr)` already sent `FoundAdvertisedName`.
    told: BTreeSet<(String, String, String)>,
}

enum Registered {
    First,
    Again,
    Duplicate,
}

fn register(map: &mut BTreeMap<String, Vec<(String, TransportMask)>>, key: &str, ep: &str, mask: TransportMask) -> Registered {
    let list = map.entry(key.to_string()).or_default();
    if list.iter().any(|(e, _)| e == ep) {
        return Registered::Duplicate;
    }
    list.push((ep.to_string(), mask));
    if list.len() == 1 {
        Registered::First
    } else {
        Registered::Again
    }
}

/// Removes the registration. `Some(true)` when it was the last one.
fn unregister(map: &mut BTreeMap<String, Vec<(String, TransportMask)>>, key: &str, ep: &str) -> Option<bool> {
    let list = map.get_mut(key)?;
    let before = list.len();
    list.retain(|(e, _)| e != ep);
    if list.len() == before {
        return None;
    }
    let last = list.is_empty();
    if last {
        map.remove(key);
    }
    Some(last)
}

impl Discovery {
    /// Lost notifications for an entry that went away.
    fn withdraw(&mut self, name: &str, entry: &NameMapEntry) -> Vec<(String, String, String, TransportMask)> {
        let mut out = Vec::new();
        for (prefix, finders) in self.discover.iter() {
            if !name.starts_with(prefix.as_str()) {
                continue;
            }
            for (ep, _) in finders {
                let key = (ep.clone(), name.to_string(), entry.bus_addr.clone());
                if self.told.remove(&key) {
                    out.push((ep.clone(), name.to_string(), prefix.clone(), entry.transport));
                }
            }
        }
        out
    }

    /// Found notifications for a new entry, once per endpoint.
    fn announce(&mut self, name: &str, entry: &NameMapEntry) -> Vec<(String, String, String, TransportMask)> {
        let mut out = Vec::new();
        for (prefix, finders) in self.discover.iter() {
            if !name.starts_with(prefix.as_str()) {
                continue;
            }
            for (ep, mask) in finders {
                if mask & entry.transport == 0 {
                    continue;
                }
                if self.told.insert((ep.clone(), name.to_string(), entry.bus_addr.clone())) {
                    out.push((ep.clone(), name.to_string(), prefix.clone(), entry.transport));
                }
            }
        }
        out
    }

    fn names_for(&self, guid: &str, bus_addr: &str) -> Vec<String> {
        self.found
            .iter()
            .filter(|(_, entries)| entries.iter().any(|e| e.guid == guid && e.bus_addr == bus_addr))
            .map(|(name, _)| name.clone())
            .collect()
    }
}

impl BusController {
    /// Add a transport. Current advertisements and searches are replayed
    /// onto it.
    pub fn register_name_service(&self, ns: Arc<dyn NameService>) {
        let (advertised, sought) = {
            let d = self.discovery.lock();
            let mask = ns.transports();
            let pick = |map: &BTreeMap<String, Vec<(String, TransportMask)>>| -> Vec<String> {
                map.iter()
                    .filter(|(_, regs)| regs.iter().any(|(_, m)| m & mask != 0))
                    .map(|(k, _)| k.clone())
                    .collect()
            };
            (pick(&d.advertise), pick(&d.discover))
        };
        for name in &advertised {
            ns.enable_advertisement(name);
        }
        for prefix in &sought {
            ns.enable_discovery(prefix);
        }
        self.name_services.lock().push(ns);
    }

    fn services_for(&self, mask: TransportMask) -> Vec<Arc<dyn NameService>> {
        self.name_services
            .lock()
            .iter()
            .filter(|ns| ns.transports() & mask != 0)
            .cloned()
            .collect()
    }

    fn available_transports(&self) -> TransportMask {
        self.name_services
            .lock()
            .iter()
            .fold(transport::LOCAL, |acc, ns| acc | ns.transports())
    }

    pub fn advertise_name(&self, sender: &str, name: &str, transports: TransportMask) -> AdvertiseReply {
        if transports & self.available_transports() == 0 {
            return AdvertiseReply::TransportNotAvailable;
        }
        let outcome = register(&mut self.discovery.lock().advertise, name, sender, transports);
        match outcome {
            Registered::Duplicate => AdvertiseReply::AlreadyAdvertising,
            Registered::Again => AdvertiseReply::Success,
            Registered::First => {
                for ns in self.services_for(transports) {
                    ns.enable_advertisement(name);
                }
                tracing::debug!(name, sender, transports, "advertising");
                AdvertiseReply::Success
            }
        }
    }

    pub fn cancel_advertise_name(&self, sender: &str, name: &str) -> CancelAdvertiseReply {
        let last = unregister(&mut self.discovery.lock().advertise, name, sender);
        match last {
            None => CancelAdvertiseReply::Failed,
            Some(false) => CancelAdvertiseReply::Success,
            Some(true) => {
                for ns in self.services_for(transport::ANY) {
                    ns.disable_advertisement(name);
                }
                CancelAdvertiseReply::Success
            }
        }
    }

    pub fn find_advertised_name(&self, sender: &str, prefix: &str, transports: TransportMask) -> FindReply {
        if transports & self.available_transports() == 0 {
            return FindReply::TransportNotAvailable;
        }
        let (outcome, replay) = {
            let mut d = self.discovery.lock();
            let outcome = register(&mut d.discover, prefix, sender, transports);
            let mut replay = Vec::new();
            if !matches!(outcome, Registered::Duplicate) {
                let cached: Vec<(String, NameMapEntry)> = d
                    .found
                    .iter()
                    .filter(|(name, _)| name.starts_with(prefix))
                    .flat_map(|(name, entries)| entries.iter().map(move |e| (name.clone(), e.clone())))
                    .filter(|(_, e)| e.transport & transports != 0)
                    .collect();
                for (name, entry) in cached {
                    if d.told.insert((sender.to_string(), name.clone(), entry.bus_addr.clone())) {
                        replay.push((sender.to_string(), name, prefix.to_string(), entry.transport));
                    }
                }
            }
            (outcome, replay)
        };
        match outcome {
            Registered::Duplicate => return FindReply::AlreadyDiscovering,
            Registered::First => {
                for ns in self.services_for(transports) {
                    ns.enable_discovery(prefix);
                }
            }
            Registered::Again => {}
        }
        self.post_found(replay, true);
        FindReply::Success
    }

    pub fn cancel_find_advertised_name(&self, sender: &str, prefix: &str) -> CancelFindReply {
        let last = {
            let mut d = self.discovery.lock();
            let last = unregister(&mut d.discover, prefix, sender);
            if last.is_some() {
                d.told
                    .retain(|(ep, name, _)| !(ep == sender && name.starts_with(prefix)));
            }
            last
        };
        match last {
            None => CancelFindReply::Failed,
            Some(false) => CancelFindReply::Success,
            Some(true) => {
                for ns in self.services_for(transport::ANY) {
                    ns.disable_discovery(prefix);
                }
                CancelFindReply::Success
            }
        }
    }

    /// Drop every advertisement and search `endpoint` made.
    pub(super) fn remove_discovery_for(&self, endpoint: &str) {
        let (names, prefixes) = {
            let mut d = self.discovery.lock();
            let adv: Vec<String> = d
                .advertise
                .iter()
                .filter(|(_, regs)| regs.iter().any(|(e, _)| e == endpoint))
                .map(|(k, _)| k.clone())
                .collect();
            let disc: Vec<String> = d
                .discover
                .iter()
                .filter(|(_, regs)| regs.iter().any(|(e, _)| e == endpoint))
                .map(|(k, _)| k.clone())
                .collect();
            let names: Vec<String> = adv
                .into_iter()
                .filter(|n| unregister(&mut d.advertise, n, endpoint) == Some(true))
                .collect();
            let prefixes: Vec<String> = disc
                .into_iter()
                .filter(|p| unregister(&mut d.discover, p, endpoint) == Some(true))
                .collect();
            d.told.retain(|(ep, _, _)| ep != endpoint);
            (names, prefixes)
        };
        if names.is_empty() && prefixes.is_empty() {
            return;
        }
        for ns in self.services_for(transport::ANY) {
            for name in &names {
                ns.disable_advertisement(name);
            }
            for prefix in &prefixes {
                ns.disable_discovery(prefix);
            }
        }
    }

    /// Names a transport saw at `bus_addr` on the daemon with `guid`.
    ///
    /// A `ttl_secs` of zero withdraws them; with `names` absent it
    /// withdraws everything seen from that daemon at that address.
    pub fn found_names(
        &self,
        bus_addr: &str,
        guid: &str,
        transport: TransportMask,
        names: Option<&[String]>,
        ttl_secs: u32,
    ) {
        let own = self.core.guid();
        if guid == own.to_string() || guid == own.short() {
            return;
        }
        let now = Instant::now();
        let mut found = Vec::new();
        let mut lost = Vec::new();
        {
            let mut d = self.discovery.lock();
            if ttl_secs == 0 {
                let names: Vec<String> = match names {
                    Some(n) => n.to_vec(),
                    None => d.names_for(guid, bus_addr),
                };
                for name in names {
                    let removed: Vec<NameMapEntry> = match d.found.get_mut(&name) {
                        Some(entries) => {
                            let (gone, keep): (Vec<_>, Vec<_>) = entries
                                .drain(..)
                                .partition(|e| e.guid == guid && e.bus_addr == bus_addr);
                            *entries = keep;
                            gone
                        }
                        None => Vec::new(),
                    };
                    if d.found.get(&name).is_some_and(Vec::is_empty) {
                        d.found.remove(&name);
                    }
                    for entry in removed {
                        lost.extend(d.withdraw(&name, &entry));
                    }
                }
            } else if let Some(names) = names {
                let ttl = Duration::from_secs(u64::from(ttl_secs));
                for name in names {
                    let entries = d.found.entry(name.clone()).or_default();
                    let entry = match entries.iter_mut().find(|e| e.bus_addr == bus_addr) {
                        Some(existing) => {
                            existing.timestamp = now;
                            existing.ttl = ttl;
                            existing.guid = guid.to_string();
                            if existing.transport == transport {
                                continue;
                            }
                            // Finders that only want the new transport
                            // have not heard of this entry yet.
                            existing.transport = transport;
                            existing.clone()
                        }
                        None => {
                            let entry = NameMapEntry {
                                bus_addr: bus_addr.to_string(),
                                guid: guid.to_string(),
                                transport,
                                timestamp: now,
                                ttl,
                            };
                            entries.push(entry.clone());
                            entry
                        }
                    };
                    found.extend(d.announce(name, &entry));
                }
            }
        }
        self.post_found(found, true);
        self.post_found(lost, false);
    }

    /// Sweep the found-name cache. Returns how many entries aged out.
    pub fn expire_names(&self) -> usize {
        let now = Instant::now();
        let (count, lost) = {
            let mut d = self.discovery.lock();
            let mut expired: Vec<(String, NameMapEntry)> = Vec::new();
            d.found.retain(|name, entries| {
                entries.retain(|e| {
                    if e.is_expired(now) {
                        expired.push((name.clone(), e.clone()));
                        false
                    } else {
                        true
                    }
                });
                !entries.is_empty()
            });
            let count = expired.len();
            let mut lost = Vec::new();
            for (name, entry) in expired {
                lost.extend(d.withdraw(&name, &entry));
            }
            (count, lost)
        };
        if count > 0 {
            tracing::debug!(expired = count, "advertised names aged out");
        }
        self.post_found(lost, false);
        count
    }

    /// Cached locations of `name`.
    pub fn found_entries(&self, name: &str) -> Vec<NameMapEntry> {
        self.discovery.lock().found.get(name).cloned().unwrap_or_default()
    }

    fn post_found(&self, list: Vec<(String, String, String, TransportMask)>, found: bool) {
        let member = if found { "FoundAdvertisedName" } else { "LostAdvertisedName" };
        let msgs: Vec<Message> = list
            .into_iter()
            .map(|(ep, name, prefix, transport)| {
                self.signal(&ep, member, 0, vec![json!(name), json!(transport), json!(prefix)])
            })
            .collect();
        self.post_all(msgs);
    }
}
