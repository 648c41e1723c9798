//! Bus name ownership.
//!
//! Tracks local unique names, well-known alias queues and aliases owned by
//! names on other daemons. Every mutation returns the resulting owner
//! changes so the caller can notify listeners after releasing the lock.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};

/// `RequestName` flag bits.
pub mod request_flags {
    pub const ALLOW_REPLACEMENT: u32 = 0x01;
    pub const REPLACE_EXISTING: u32 = 0x02;
    pub const DO_NOT_QUEUE: u32 = 0x04;
}

use request_flags::{ALLOW_REPLACEMENT, DO_NOT_QUEUE, REPLACE_EXISTING};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum RequestNameReply {
    PrimaryOwner = 1,
    InQueue = 2,
    Exists = 3,
    AlreadyOwner = 4,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ReleaseNameReply {
    Released = 1,
    NonExistent = 2,
    NotOwner = 3,
}

/// One owner transition of a bus name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NameChange {
    pub name: String,
    pub old_owner: Option<String>,
    pub new_owner: Option<String>,
}

impl NameChange {
    fn new(name: &str, old_owner: Option<&str>, new_owner: Option<&str>) -> Self {
        Self {
            name: name.to_string(),
            old_owner: old_owner.map(String::from),
            new_owner: new_owner.map(String::from),
        }
    }
}

/// Receives owner changes once the table lock is released.
pub trait NameListener: Send + Sync {
    fn name_owner_changed(&self, change: &NameChange);
}

#[derive(Debug, Clone)]
struct QueuedOwner {
    owner: String,
    flags: u32,
}

#[derive(Debug, Default)]
pub struct NameTable {
    unique: BTreeSet<String>,
    aliases: HashMap<String, VecDeque<QueuedOwner>>,
    /// Alias → owning unique name on another daemon.
    virtual_aliases: BTreeMap<String, String>,
}

impl NameTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_unique(&mut self, name: &str) -> Option<NameChange> {
        self.unique
            .insert(name.to_string())
            .then(|| NameChange::new(name, None, Some(name)))
    }

    pub fn has_unique(&self, name: &str) -> bool {
        self.unique.contains(name)
    }

    /// Drop a unique name and every alias claim it holds.
    pub fn remove_unique(&mut self, name: &str) -> Vec<NameChange> {
        let mut changes = Vec::new();
        let owned: Vec<String> = self
            .aliases
            .iter()
            .filter(|(_, q)| q.iter().any(|o| o.owner == name))
            .map(|(alias, _)| alias.clone())
            .collect();
        for alias in owned {
            if let Some(change) = self.drop_owner(&alias, name) {
                changes.push(change);
            }
        }
        if self.unique.remove(name) {
            changes.push(NameChange::new(name, Some(name), None));
        }
        changes
    }

    /// Primary owner of a well-known name. Local owners mask remote ones.
    pub fn owner(&self, alias: &str) -> Option<&str> {
        self.local_owner(alias)
            .or_else(|| self.virtual_aliases.get(alias).map(String::as_str))
    }

    pub fn local_owner(&self, alias: &str) -> Option<&str> {
        self.aliases
            .get(alias)
            .and_then(|q| q.front())
            .map(|o| o.owner.as_str())
    }

    pub fn queued_owners(&self, alias: &str) -> Vec<String> {
        self.aliases
            .get(alias)
            .map(|q| q.iter().map(|o| o.owner.clone()).collect())
            .unwrap_or_default()
    }

    /// Well-known names whose primary owner is `owner`.
    pub fn aliases_of(&self, owner: &str) -> Vec<String> {
        let mut out: Vec<String> = self
            .aliases
            .iter()
            .filter(|(_, q)| q.front().is_some_and(|o| o.owner == owner))
            .map(|(alias, _)| alias.clone())
            .collect();
        out.extend(
            self.virtual_aliases
                .iter()
                .filter(|(alias, o)| o.as_str() == owner && !self.aliases.contains_key(*alias))
                .map(|(alias, _)| alias.clone()),
        );
        out.sort();
        out
    }

    pub fn unique_names(&self) -> impl Iterator<Item = &str> {
        self.unique.iter().map(String::as_str)
    }

    pub fn all_names(&self) -> Vec<String> {
        let mut names: BTreeSet<String> = self.unique.iter().cloned().collect();
        names.extend(self.aliases.keys().cloned());
        names.extend(self.virtual_aliases.keys().cloned());
        names.into_iter().collect()
    }

    pub fn request_name(&mut self, alias: &str, requester: &str, flags: u32) -> (RequestNameReply, Option<NameChange>) {
        let old = self.owner(alias).map(String::from);
        let queue = self.aliases.entry(alias.to_string()).or_default();

        let Some(primary) = queue.front().cloned() else {
            queue.push_back(QueuedOwner {
                owner: requester.to_string(),
                flags,
            });
            let change = NameChange::new(alias, old.as_deref(), Some(requester));
            return (RequestNameReply::PrimaryOwner, Some(change));
        };

        if primary.owner == requester {
            if let Some(front) = queue.front_mut() {
                front.flags = flags;
            }
            return (RequestNameReply::AlreadyOwner, None);
        }

        if primary.flags & ALLOW_REPLACEMENT != 0 && flags & REPLACE_EXISTING != 0 {
            queue.retain(|o| o.owner != requester);
            queue.pop_front();
            if primary.flags & DO_NOT_QUEUE == 0 {
                queue.push_front(primary.clone());
            }
            queue.push_front(QueuedOwner {
                owner: requester.to_string(),
                flags,
            });
            let change = NameChange::new(alias, Some(&primary.owner), Some(requester));
            return (RequestNameReply::PrimaryOwner, Some(change));
        }

        if flags & DO_NOT_QUEUE != 0 {
            queue.retain(|o| o.owner != requester);
            return (RequestNameReply::Exists, None);
        }

        match queue.iter_mut().find(|o| o.owner == requester) {
            Some(existing) => existing.flags = flags,
            None => queue.push_back(QueuedOwner {
                owner: requester.to_string(),
                flags,
            }),
        }
        (RequestNameReply::InQueue, None)
    }

    pub fn release_name(&mut self, alias: &str, owner: &str) -> (ReleaseNameReply, Option<NameChange>) {
        let Some(queue) = self.aliases.get(alias) else {
            return (ReleaseNameReply::NonExistent, None);
        };
        if !queue.iter().any(|o| o.owner == owner) {
            return (ReleaseNameReply::NotOwner, None);
        }
        (ReleaseNameReply::Released, self.drop_owner(alias, owner))
    }

    /// Remove `owner` from the alias queue, promoting the next owner or an
    /// unmasked virtual owner. Returns a change only if the primary moved.
    fn drop_owner(&mut self, alias: &str, owner: &str) -> Option<NameChange> {
        let queue = self.aliases.get_mut(alias)?;
        let was_primary = queue.front().is_some_and(|o| o.owner == owner);
        queue.retain(|o| o.owner != owner);
        let next_local = queue.front().map(|o| o.owner.clone());
        if queue.is_empty() {
            self.aliases.remove(alias);
        }
        if !was_primary {
            return None;
        }
        let next = next_local.or_else(|| self.virtual_aliases.get(alias).cloned());
        Some(NameChange::new(alias, Some(owner), next.as_deref()))
    }

    /// Set or clear the remote owner of `alias`. Returns whether the
    /// virtual entry changed and, when no local owner masks it, the
    /// visible owner change.
    pub fn set_virtual_alias(&mut self, alias: &str, new_owner: Option<&str>) -> (bool, Option<NameChange>) {
        let old = self.virtual_aliases.get(alias).cloned();
        if old.as_deref() == new_owner {
            return (false, None);
        }
        match new_owner {
            Some(owner) => {
                self.virtual_aliases.insert(alias.to_string(), owner.to_string());
            }
            None => {
                self.virtual_aliases.remove(alias);
            }
        }
        let masked = self.local_owner(alias).is_some();
        let change = (!masked).then(|| NameChange::new(alias, old.as_deref(), new_owner));
        (true, change)
    }

    pub fn virtual_owner(&self, alias: &str) -> Option<&str> {
        self.virtual_aliases.get(alias).map(String::as_str)
    }

    /// Clear every virtual alias owned by `owner`.
    pub fn remove_virtual_owner(&mut self, owner: &str) -> Vec<NameChange> {
        let aliases: Vec<String> = self
            .virtual_aliases
            .iter()
            .filter(|(_, o)| o.as_str() == owner)
            .map(|(a, _)| a.clone())
            .collect();
        aliases
            .iter()
            .filter_map(|alias| self.set_virtual_alias(alias, None).1)
            .collect()
    }
}
