//! Committed entry storage with a tag index.
//!
//! Entries are kept in key order. Every committed byte (serialized entry
//! size) is charged against an optional memory budget; exceeding it is an
//! `OutOfSpace` error and leaves the store unchanged.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use crate::entry::{DbEntry, MergeOutcome};
use crate::error::{PandoError, Result};
use crate::filter::EntryLookup;
use crate::key::DbKey;

/// Result of committing one entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    Unchanged,
    Merged,
}

#[derive(Debug, Default)]
pub struct EntryStore {
    entries: BTreeMap<DbKey, DbEntry>,
    by_tag: HashMap<String, BTreeSet<DbKey>>,
    used_bytes: u64,
    /// `None` means unbounded.
    limit_bytes: Option<u64>,
}

impl EntryStore {
    // -- Constructors ---------------------------------------------------------

    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_limit(limit_bytes: Option<u64>) -> Self {
        Self { limit_bytes, ..Self::default() }
    }

    // -- Accounting -----------------------------------------------------------

    pub fn used_bytes(&self) -> u64 {
        self.used_bytes
    }

    pub fn limit_bytes(&self) -> Option<u64> {
        self.limit_bytes
    }

    /// Check that growing by `grow` bytes (after releasing `release`) fits.
    fn reserve(&self, grow: u64, release: u64) -> Result<u64> {
        let next = self.used_bytes.saturating_sub(release).saturating_add(grow);
        match self.limit_bytes {
            Some(limit) if next > limit => Err(PandoError::OutOfSpace {
                requested: grow,
                used: self.used_bytes,
                limit,
            }),
            _ => Ok(next),
        }
    }

    fn index_tags(&mut self, entry: &DbEntry) {
        for tag in entry.tags() {
            self.by_tag.entry(tag.clone()).or_default().insert(entry.key());
        }
    }

    fn unindex_tag(&mut self, key: &DbKey, tag: &str) {
        if let Some(keys) = self.by_tag.get_mut(tag) {
            keys.remove(key);
            if keys.is_empty() {
                self.by_tag.remove(tag);
            }
        }
    }

    // -- Writes ---------------------------------------------------------------

    /// Insert, merging with an existing entry under the same key.
    pub fn insert(&mut self, entry: DbEntry) -> Result<InsertOutcome> {
        let key = entry.key();
        match self.entries.get(&key) {
            None => {
                self.used_bytes = self.reserve(entry.encoded_len() as u64, 0)?;
                self.index_tags(&entry);
                self.entries.insert(key, entry);
                Ok(InsertOutcome::Inserted)
            }
            Some(existing) => {
                let mut merged = existing.clone();
                if merged.merge(entry) == MergeOutcome::Unchanged {
                    return Ok(InsertOutcome::Unchanged);
                }
                let old_len = existing.encoded_len() as u64;
                self.used_bytes = self.reserve(merged.encoded_len() as u64, old_len)?;
                self.index_tags(&merged);
                self.entries.insert(key, merged);
                Ok(InsertOutcome::Merged)
            }
        }
    }

    /// Returns false when the key is missing or the tag already present.
    pub fn add_tag(&mut self, key: &DbKey, tag: &str) -> Result<bool> {
        let Some(entry) = self.entries.get(key) else { return Ok(false) };
        if entry.has_tag(tag) {
            return Ok(false);
        }
        self.used_bytes = self.reserve(8 + tag.len() as u64, 0)?;
        if let Some(entry) = self.entries.get_mut(key) {
            entry.add_tag(tag);
        }
        self.by_tag.entry(tag.to_string()).or_default().insert(*key);
        Ok(true)
    }

    pub fn remove_tag(&mut self, key: &DbKey, tag: &str) -> bool {
        let removed = self.entries.get_mut(key).map(|e| e.remove_tag(tag)).unwrap_or(false);
        if removed {
            self.used_bytes = self.used_bytes.saturating_sub(8 + tag.len() as u64);
            self.unindex_tag(key, tag);
        }
        removed
    }

    /// Replace a value. Returns false when the key is missing.
    pub fn set_value(&mut self, key: &DbKey, value: Vec<u8>) -> Result<bool> {
        let Some(entry) = self.entries.get(key) else { return Ok(false) };
        self.used_bytes = self.reserve(value.len() as u64, entry.value().len() as u64)?;
        if let Some(entry) = self.entries.get_mut(key) {
            entry.set_value(value);
        }
        Ok(true)
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.by_tag.clear();
        self.used_bytes = 0;
    }

    // -- Reads ----------------------------------------------------------------

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, key: &DbKey) -> Option<&DbEntry> {
        self.entries.get(key)
    }

    pub fn contains(&self, key: &DbKey) -> bool {
        self.entries.contains_key(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = &DbEntry> {
        self.entries.values()
    }

    pub fn keys(&self) -> impl Iterator<Item = &DbKey> {
        self.entries.keys()
    }

    /// Keys carrying every tag in `tags`, in key order.
    pub fn keys_with_tags(&self, tags: &[&str]) -> Vec<DbKey> {
        let mut sets: Vec<&BTreeSet<DbKey>> = Vec::with_capacity(tags.len());
        for tag in tags {
            match self.by_tag.get(*tag) {
                Some(keys) => sets.push(keys),
                None => return Vec::new(),
            }
        }
        sets.sort_by_key(|s| s.len());
        let Some((smallest, rest)) = sets.split_first() else {
            return self.entries.keys().copied().collect();
        };
        smallest
            .iter()
            .filter(|k| rest.iter().all(|s| s.contains(k)))
            .copied()
            .collect()
    }

    /// Entries carrying every tag in `tags`.
    pub fn query(&self, tags: &[&str]) -> Vec<DbEntry> {
        self.keys_with_tags(tags)
            .iter()
            .filter_map(|k| self.entries.get(k).cloned())
            .collect()
    }
}

impl EntryLookup for EntryStore {
    fn value_by_key(&self, key: &DbKey) -> Result<Option<Vec<u8>>> {
        Ok(self.get(key).map(|e| e.value().to_vec()))
    }

    fn entries_by_tags(&self, tags: &[&str]) -> Result<Vec<DbEntry>> {
        Ok(self.query(tags))
    }
}
