//! Staging buffer for mutations produced during a sweep.
//!
//! Nothing here is visible to filters until `stage_close` commits it.
//! New entries with the same key are merged while staged (same rule as the
//! store); the other buffers keep arrival order.

use std::collections::BTreeMap;

use crate::entry::DbEntry;
use crate::filter::Mutation;
use crate::key::DbKey;

#[derive(Debug, Default)]
pub struct StagedMutations {
    /// Keyed so colliding creations merge before commit.
    pub(crate) new_entries: BTreeMap<DbKey, DbEntry>,
    pub(crate) value_updates: Vec<(DbKey, Vec<u8>)>,
    pub(crate) tags_to_add: Vec<(DbKey, String)>,
    pub(crate) tags_to_remove: Vec<(DbKey, String)>,
}

impl StagedMutations {
    // -- Constructors ---------------------------------------------------------

    pub fn new() -> Self {
        Self::default()
    }

    // -- Write Operations -----------------------------------------------------

    pub fn add_entry(&mut self, entry: DbEntry) {
        match self.new_entries.get_mut(&entry.key()) {
            Some(existing) => {
                existing.merge(entry);
            }
            None => {
                self.new_entries.insert(entry.key(), entry);
            }
        }
    }

    pub fn add_tag(&mut self, key: DbKey, tag: String) {
        self.tags_to_add.push((key, tag));
    }

    pub fn remove_tag(&mut self, key: DbKey, tag: String) {
        self.tags_to_remove.push((key, tag));
    }

    pub fn update_value(&mut self, key: DbKey, value: Vec<u8>) {
        self.value_updates.push((key, value));
    }

    /// Stage a mutation. Subscriptions are not staged and come back out.
    pub fn stage(&mut self, mutation: Mutation) -> Option<Mutation> {
        match mutation {
            Mutation::AddEntry(entry) => self.add_entry(entry),
            Mutation::AddTag { key, tag } => self.add_tag(key, tag),
            Mutation::RemoveTag { key, tag } => self.remove_tag(key, tag),
            Mutation::UpdateValue { key, value } => self.update_value(key, value),
            sub @ Mutation::Subscribe { .. } => return Some(sub),
        }
        None
    }

    // -- Read Operations ------------------------------------------------------

    pub fn len(&self) -> usize {
        self.new_entries.len() + self.value_updates.len() + self.tags_to_add.len() + self.tags_to_remove.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Take everything out, leaving the buffer empty.
    pub fn take(&mut self) -> StagedMutations {
        std::mem::take(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::MERGED_TAG;
    use crate::filter::Wake;

    #[test]
    fn test_colliding_new_entries_merge() {
        let mut staged = StagedMutations::new();
        let key = DbKey::new(1, 2, 3);
        staged.add_entry(DbEntry::new(key, ["a"], "x"));
        staged.add_entry(DbEntry::new(key, ["b"], "y"));
        assert_eq!(staged.new_entries.len(), 1);
        let merged = &staged.new_entries[&key];
        assert!(merged.has_tag(MERGED_TAG));
        assert_eq!(merged.value(), b"x\ny");
    }

    #[test]
    fn test_subscription_is_not_staged() {
        let mut staged = StagedMutations::new();
        let sub = Mutation::Subscribe {
            subscriber: DbKey::new(1, 1, 1),
            wait_key: DbKey::new(2, 2, 2),
            wake: Wake::RemoveTag("t".into()),
        };
        assert_eq!(staged.stage(sub.clone()), Some(sub));
        assert!(staged.is_empty());

        assert!(staged.stage(Mutation::AddTag { key: DbKey::new(1, 1, 1), tag: "t".into() }).is_none());
        assert_eq!(staged.len(), 1);
        let taken = staged.take();
        assert_eq!(taken.len(), 1);
        assert!(staged.is_empty());
    }
}
