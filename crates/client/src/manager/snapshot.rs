//! Point-in-time views over a cache.

use std::collections::{BTreeMap, HashMap};

use synccache_core::{CacheEntry, GroupKey};

/// Every entry of a cache, indexed by URL, name and group.
///
/// Built on demand from the store and never written back. Group member lists
/// keep the store's insertion order.
#[derive(Debug, Clone, Default)]
pub struct CacheEntriesSnapshot {
    entries: Vec<CacheEntry>,
    by_url: HashMap<String, usize>,
    by_name: HashMap<String, usize>,
    groups: BTreeMap<GroupKey, Vec<String>>,
    group_created_at: HashMap<GroupKey, i64>,
}

impl CacheEntriesSnapshot {
    pub fn from_entries(entries: Vec<CacheEntry>) -> Self {
        let mut snapshot = Self::default();
        for entry in entries {
            snapshot.insert(entry);
        }
        snapshot
    }

    fn insert(&mut self, entry: CacheEntry) {
        let url = entry.url().to_string();
        if self.by_url.contains_key(&url) {
            return;
        }

        let index = self.entries.len();
        if let Some(name) = &entry.meta.name {
            self.by_name.insert(name.clone(), index);
        }
        if let Some(group) = &entry.meta.group {
            self.groups.entry(group.clone()).or_default().push(url.clone());
            self.group_created_at
                .entry(group.clone())
                .and_modify(|earliest| *earliest = (*earliest).min(entry.meta.created_at))
                .or_insert(entry.meta.created_at);
        }
        self.by_url.insert(url, index);
        self.entries.push(entry);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries in store order.
    pub fn iter(&self) -> impl Iterator<Item = &CacheEntry> {
        self.entries.iter()
    }

    pub fn get(&self, url: &str) -> Option<&CacheEntry> {
        self.by_url.get(url).map(|&i| &self.entries[i])
    }

    pub fn by_name(&self, name: &str) -> Option<&CacheEntry> {
        self.by_name.get(name).map(|&i| &self.entries[i])
    }

    /// Group keys present in the snapshot, sorted.
    pub fn groups(&self) -> impl Iterator<Item = &GroupKey> {
        self.groups.keys()
    }

    pub fn contains_group(&self, group: &GroupKey) -> bool {
        self.groups.contains_key(group)
    }

    /// Member URLs of `group`, in store order.
    pub fn group_urls(&self, group: &GroupKey) -> Option<&[String]> {
        self.groups.get(group).map(Vec::as_slice)
    }

    /// Member entries of `group`, in store order. Empty for unknown groups.
    pub fn group_members(&self, group: &GroupKey) -> Vec<&CacheEntry> {
        self.group_urls(group)
            .unwrap_or_default()
            .iter()
            .filter_map(|url| self.get(url))
            .collect()
    }

    /// Effective creation time of a group: the earliest `created_at` among its
    /// members, so the oldest member decides the staleness of the whole group.
    pub fn group_created_at(&self, group: &GroupKey) -> Option<i64> {
        self.group_created_at.get(group).copied()
    }

    /// Entries that belong to no group, in store order.
    pub fn ungrouped(&self) -> impl Iterator<Item = &CacheEntry> {
        self.entries.iter().filter(|e| e.meta.group.is_none())
    }
}
