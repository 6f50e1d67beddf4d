//! SeqDb - single-node store plus the fixed-point filter loop.
//!
//! # Processing
//!
//! A sweep runs every installed single-entry filter over every committed
//! entry whose `should_run` holds and collects the emitted mutations. The
//! mutations are staged, then `stage_close` commits them in a fixed order:
//!
//! 1. new entries (merged on key collision, firing subscriptions)
//! 2. value updates
//! 3. tag additions
//! 4. tag removals
//!
//! `process()` repeats sweep + commit until a sweep emits nothing.
//!
//! # Sharing
//!
//! The committed store sits behind `Arc<RwLock<_>>` so a responder thread
//! can serve by-key reads while the owning loop keeps exclusive write
//! access.

mod io;
mod staging;
mod store;
mod subscriptions;

use std::path::Path;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::entry::DbEntry;
use crate::error::Result;
use crate::filter::{EntryAccess, EntryLookup, FilterCatalog, FilterSet, Mutation, Wake};
use crate::key::{DbKey, RandomKeyGen};

pub use io::{deserialize_entries, parse_db_file, read_export, serialize_entries, write_export};
pub use staging::StagedMutations;
pub use store::{EntryStore, InsertOutcome};
pub use subscriptions::{Subscriptions, Waiter};

pub type SharedStore = Arc<RwLock<EntryStore>>;

// ── Lookups ─────────────────────────────────────────────────────────

/// Result of asking the mesh for a key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fetched {
    /// This agent owns the key; read the local store.
    Local,
    Remote(Option<Vec<u8>>),
}

/// By-key reads for keys owned elsewhere.
pub trait RemoteFetch {
    fn fetch(&self, key: &DbKey) -> Result<Fetched>;
}

/// Lookup over a locked store, deferring non-owned keys to `remote`.
pub struct StoreLookup<'a> {
    store: &'a EntryStore,
    remote: Option<&'a dyn RemoteFetch>,
}

impl<'a> StoreLookup<'a> {
    pub fn new(store: &'a EntryStore, remote: Option<&'a dyn RemoteFetch>) -> Self {
        Self { store, remote }
    }
}

impl EntryLookup for StoreLookup<'_> {
    fn value_by_key(&self, key: &DbKey) -> Result<Option<Vec<u8>>> {
        if let Some(remote) = self.remote {
            if let Fetched::Remote(value) = remote.fetch(key)? {
                return Ok(value);
            }
        }
        self.store.value_by_key(key)
    }

    fn entries_by_tags(&self, tags: &[&str]) -> Result<Vec<DbEntry>> {
        self.store.entries_by_tags(tags)
    }
}

// ── Reports ─────────────────────────────────────────────────────────

/// Output of one sweep.
#[derive(Debug, Default)]
pub struct Sweep {
    /// Filter runs performed.
    pub runs: usize,
    pub mutations: Vec<Mutation>,
}

impl Sweep {
    pub fn produced_effects(&self) -> bool {
        !self.mutations.is_empty()
    }
}

/// Output of committing the staging buffer.
#[derive(Debug, Default)]
pub struct CloseReport {
    pub committed: usize,
    /// Wakes of subscriptions fired by new entries, not yet applied.
    pub wakes: Vec<Mutation>,
}

// ── SeqDb ───────────────────────────────────────────────────────────

pub struct SeqDb {
    store: SharedStore,
    staged: StagedMutations,
    subscriptions: Subscriptions,
    filters: FilterSet,
    keygen: RandomKeyGen,
}

impl SeqDb {
    // -- Constructors ---------------------------------------------------------

    pub fn new(catalog: Arc<FilterCatalog>) -> Self {
        Self::with_store(Arc::new(RwLock::new(EntryStore::new())), catalog, RandomKeyGen::new(0))
    }

    pub fn with_store(store: SharedStore, catalog: Arc<FilterCatalog>, keygen: RandomKeyGen) -> Self {
        Self {
            store,
            staged: StagedMutations::new(),
            subscriptions: Subscriptions::new(),
            filters: FilterSet::new(catalog),
            keygen,
        }
    }

    pub fn store(&self) -> &SharedStore {
        &self.store
    }

    pub fn read(&self) -> RwLockReadGuard<'_, EntryStore> {
        self.store.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, EntryStore> {
        self.store.write().unwrap_or_else(PoisonError::into_inner)
    }

    // -- Keys -----------------------------------------------------------------

    /// Give an unkeyed entry a random key.
    pub fn verify_entry_key(&mut self, mut entry: DbEntry) -> DbEntry {
        let key = self.keygen.assign(entry.key());
        entry.set_key(key);
        entry
    }

    pub fn random_key(&mut self) -> DbKey {
        self.keygen.next_key()
    }

    // -- Direct writes --------------------------------------------------------

    /// Apply one mutation to the committed store right away.
    ///
    /// Returns follow-up mutations (wakes of fired subscriptions), which
    /// the caller applies or routes.
    pub fn apply(&mut self, mutation: Mutation) -> Result<Vec<Mutation>> {
        match mutation {
            Mutation::AddEntry(entry) => {
                let entry = self.verify_entry_key(entry);
                let key = entry.key();
                self.write().insert(entry)?;
                Ok(self.subscriptions.fire(&key))
            }
            Mutation::AddTag { key, tag } => {
                if !self.read().contains(&key) {
                    tracing::warn!(%key, %tag, "add tag on missing entry");
                }
                self.write().add_tag(&key, &tag)?;
                Ok(Vec::new())
            }
            Mutation::RemoveTag { key, tag } => {
                self.write().remove_tag(&key, &tag);
                Ok(Vec::new())
            }
            Mutation::UpdateValue { key, value } => {
                if !self.write().set_value(&key, value)? {
                    tracing::warn!(%key, "value update on missing entry");
                }
                Ok(Vec::new())
            }
            Mutation::Subscribe { subscriber, wait_key, wake } => {
                Ok(self.subscribe(subscriber, wait_key, wake).into_iter().collect())
            }
        }
    }

    /// Apply a mutation and every follow-up it causes locally.
    pub fn apply_local(&mut self, mutation: Mutation) -> Result<()> {
        let mut queue = vec![mutation];
        while let Some(next) = queue.pop() {
            queue.extend(self.apply(next)?);
        }
        Ok(())
    }

    /// Insert an entry now, merging with any existing entry under its key.
    pub fn add_entry(&mut self, entry: DbEntry) -> Result<()> {
        self.apply_local(Mutation::AddEntry(entry))
    }

    /// Record that `subscriber` waits for `wait_key`.
    ///
    /// When the key already exists the wake is returned instead of queued.
    pub fn subscribe(&mut self, subscriber: DbKey, wait_key: DbKey, wake: Wake) -> Option<Mutation> {
        if self.read().contains(&wait_key) {
            return Some(Mutation::from_wake(subscriber, wake));
        }
        self.subscriptions.register(wait_key, subscriber, wake);
        None
    }

    // -- Staging --------------------------------------------------------------

    /// Stage a mutation for the next commit. Subscriptions are recorded
    /// immediately; a wake they produce is staged too.
    pub fn stage(&mut self, mutation: Mutation) {
        let mutation = match mutation {
            Mutation::AddEntry(entry) => Mutation::AddEntry(self.verify_entry_key(entry)),
            other => other,
        };
        if let Some(Mutation::Subscribe { subscriber, wait_key, wake }) = self.staged.stage(mutation) {
            if let Some(wake) = self.subscribe(subscriber, wait_key, wake) {
                self.staged.stage(wake);
            }
        }
    }

    pub fn staged_len(&self) -> usize {
        self.staged.len()
    }

    /// Commit the staging buffer and hand back fired wakes unapplied.
    pub fn commit_staged(&mut self) -> Result<CloseReport> {
        let staged = self.staged.take();
        let store = Arc::clone(&self.store);
        let mut store = store.write().unwrap_or_else(PoisonError::into_inner);
        let mut report = CloseReport::default();

        for (key, entry) in staged.new_entries {
            store.insert(entry)?;
            report.wakes.extend(self.subscriptions.fire(&key));
            report.committed += 1;
        }
        for (key, value) in staged.value_updates {
            if store.set_value(&key, value)? {
                report.committed += 1;
            } else {
                tracing::warn!(%key, "value update on missing entry");
            }
        }
        for (key, tag) in staged.tags_to_add {
            if !store.contains(&key) {
                tracing::warn!(%key, %tag, "add tag on missing entry");
                continue;
            }
            store.add_tag(&key, &tag)?;
            report.committed += 1;
        }
        for (key, tag) in staged.tags_to_remove {
            store.remove_tag(&key, &tag);
            report.committed += 1;
        }
        Ok(report)
    }

    /// Commit the staging buffer, applying fired wakes locally.
    pub fn stage_close(&mut self) -> Result<usize> {
        let report = self.commit_staged()?;
        for wake in report.wakes {
            self.apply_local(wake)?;
        }
        Ok(report.committed)
    }

    // -- Processing -----------------------------------------------------------

    /// Run every applicable single-entry filter once over the store.
    pub fn sweep(&self, remote: Option<&dyn RemoteFetch>) -> Result<Sweep> {
        let filters = self.filters.single_entry();
        let mut sweep = Sweep::default();
        if filters.is_empty() {
            return Ok(sweep);
        }

        let store = self.read();
        let lookup = StoreLookup::new(&store, remote);
        for entry in store.iter() {
            for filter in &filters {
                if filter.should_run(entry) {
                    let mut access = EntryAccess::new(entry, &lookup, &mut sweep.mutations);
                    filter.run(&mut access)?;
                    sweep.runs += 1;
                }
            }
        }
        Ok(sweep)
    }

    /// One sweep plus commit. Returns whether the sweep emitted anything.
    pub fn process_once(&mut self) -> Result<bool> {
        let sweep = self.sweep(None)?;
        let again = sweep.produced_effects();
        for mutation in sweep.mutations {
            self.stage(mutation);
        }
        self.stage_close()?;
        Ok(again)
    }

    /// Run sweeps to a fixed point. Returns the number of sweeps.
    pub fn process(&mut self) -> Result<usize> {
        let mut rounds = 1;
        while self.process_once()? {
            rounds += 1;
        }
        tracing::debug!(rounds, entries = self.size(), "fixed point reached");
        Ok(rounds)
    }

    // -- Filters --------------------------------------------------------------

    pub fn add_filter_dir(&mut self, bundle: &str) -> Result<usize> {
        self.filters.add_bundle(bundle)
    }

    pub fn install_filter(&mut self, name: &str) -> Result<()> {
        self.filters.install(name)
    }

    pub fn installed_filters(&self) -> Vec<String> {
        self.filters.installed_names()
    }

    pub fn clear_filters(&mut self) {
        self.filters.clear();
    }

    pub fn filters(&self) -> &FilterSet {
        &self.filters
    }

    pub fn subscriptions(&self) -> &Subscriptions {
        &self.subscriptions
    }

    // -- Reads ----------------------------------------------------------------

    pub fn size(&self) -> usize {
        self.read().len()
    }

    pub fn get_entry(&self, key: &DbKey) -> Option<DbEntry> {
        self.read().get(key).cloned()
    }

    pub fn get_entry_value_by_key(&self, key: &DbKey) -> Option<Vec<u8>> {
        self.read().get(key).map(|e| e.value().to_vec())
    }

    /// Entries carrying every tag in `tags`.
    pub fn query(&self, tags: &[&str]) -> Vec<DbEntry> {
        self.read().query(tags)
    }

    pub fn get_entries_by_tags(&self, tags: &[&str], pred: impl Fn(&DbEntry) -> bool) -> Vec<DbEntry> {
        let store = self.read();
        store
            .keys_with_tags(tags)
            .iter()
            .filter_map(|k| store.get(k))
            .filter(|e| pred(e))
            .cloned()
            .collect()
    }

    /// First entry (in key order) carrying every tag in `tags`.
    pub fn get_entry_by_tags(&self, tags: &[&str]) -> Option<DbEntry> {
        let store = self.read();
        store.keys_with_tags(tags).first().and_then(|k| store.get(k)).cloned()
    }

    pub fn entries(&self) -> Vec<DbEntry> {
        self.read().iter().cloned().collect()
    }

    // -- Files ----------------------------------------------------------------

    /// Ingest a `TAGS`/`VALUE`/`END` text file. Returns entries read.
    pub fn add_db_file(&mut self, path: &Path) -> Result<usize> {
        let entries = parse_db_file(path)?;
        let count = entries.len();
        for entry in entries {
            self.add_entry(entry)?;
        }
        Ok(count)
    }

    pub fn serialize_entries(&self) -> Vec<u8> {
        let store = self.read();
        let entries: Vec<&DbEntry> = store.iter().collect();
        serialize_entries(entries.into_iter())
    }

    pub fn export_db(&self, path: &Path) -> Result<()> {
        let store = self.read();
        let entries: Vec<&DbEntry> = store.iter().collect();
        write_export(path, entries.into_iter())
    }

    /// Load an export file, merging into the store. Returns entries read.
    pub fn import_db(&mut self, path: &Path) -> Result<usize> {
        let entries = read_export(path)?;
        let count = entries.len();
        for entry in entries {
            self.add_entry(entry)?;
        }
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::MERGED_TAG;
    use crate::filter::{Filter, SingleEntryFilter};
    use tempfile::tempdir;

    /// Tags "seen" entries tagged "input", then stops.
    struct MarkSeen;

    impl SingleEntryFilter for MarkSeen {
        fn name(&self) -> &str {
            "mark_seen"
        }

        fn should_run(&self, entry: &DbEntry) -> bool {
            entry.has_tag("input") && !entry.has_tag("mark_seen:done")
        }

        fn run(&self, access: &mut EntryAccess<'_>) -> Result<()> {
            let value = access.value().to_vec();
            let key = DbKey::new(7, access.key().b, 0);
            access.make_new_entry(["derived"], value, key);
            access.add_tag("mark_seen:done");
            Ok(())
        }
    }

    /// Waits for the entry `{9, b, 0}`; copies its value once present.
    struct WaitForPeer;

    impl SingleEntryFilter for WaitForPeer {
        fn name(&self) -> &str {
            "wait_for_peer"
        }

        fn should_run(&self, entry: &DbEntry) -> bool {
            entry.has_tag("waiter") && !entry.has_tag("wait:done") && !entry.has_tag("wait:inactive")
        }

        fn run(&self, access: &mut EntryAccess<'_>) -> Result<()> {
            let peer = DbKey::new(9, access.key().b, 0);
            match access.get_entry_by_key(&peer)? {
                Some(value) => {
                    access.update_value(value);
                    access.add_tag("wait:done");
                }
                None => {
                    access.add_tag("wait:inactive");
                    access.subscribe_to_entry(peer, "wait:inactive");
                }
            }
            Ok(())
        }
    }

    /// Creates the entry WaitForPeer waits on, from a "producer" entry.
    struct Produce;

    impl SingleEntryFilter for Produce {
        fn name(&self) -> &str {
            "produce"
        }

        fn should_run(&self, entry: &DbEntry) -> bool {
            entry.has_tag("producer") && !entry.has_tag("produce:done")
        }

        fn run(&self, access: &mut EntryAccess<'_>) -> Result<()> {
            let key = DbKey::new(9, access.key().b, 0);
            access.make_new_entry(["peer"], "from-peer", key);
            access.add_tag("produce:done");
            Ok(())
        }
    }

    fn db_with(filters: Vec<Filter>) -> SeqDb {
        let names: Vec<String> = filters.iter().map(|f| f.name().to_string()).collect();
        let mut catalog = FilterCatalog::new();
        catalog.register_bundle("test", filters);
        let mut db = SeqDb::new(Arc::new(catalog));
        db.add_filter_dir("test").unwrap();
        for name in names {
            db.install_filter(&name).unwrap();
        }
        db
    }

    #[test]
    fn test_add_same_entry_twice_keeps_one() {
        let mut db = SeqDb::new(Arc::new(FilterCatalog::new()));
        let e = DbEntry::new(DbKey::new(1, 1, 1), ["a"], "v");
        db.add_entry(e.clone()).unwrap();
        db.add_entry(e).unwrap();
        assert_eq!(db.size(), 1);
        assert!(!db.get_entry(&DbKey::new(1, 1, 1)).unwrap().has_tag(MERGED_TAG));
    }

    #[test]
    fn test_different_entries_same_key_merge() {
        let mut db = SeqDb::new(Arc::new(FilterCatalog::new()));
        db.add_entry(DbEntry::new(DbKey::new(1, 1, 1), ["a"], "one")).unwrap();
        db.add_entry(DbEntry::new(DbKey::new(1, 1, 1), ["b"], "two")).unwrap();
        assert_eq!(db.size(), 1);
        let e = db.get_entry(&DbKey::new(1, 1, 1)).unwrap();
        assert!(e.has_tag(MERGED_TAG));
        assert_eq!(e.value(), b"one\ntwo");
    }

    #[test]
    fn test_unkeyed_entries_get_random_keys() {
        let mut db = SeqDb::new(Arc::new(FilterCatalog::new()));
        db.add_entry(DbEntry::unkeyed(["x"], "1")).unwrap();
        db.add_entry(DbEntry::unkeyed(["x"], "2")).unwrap();
        let entries = db.query(&["x"]);
        assert_eq!(entries.len(), 2);
        assert!(entries.iter().all(DbEntry::is_random_key));
    }

    #[test]
    fn test_fixed_point_terminates() {
        let mut db = db_with(vec![Filter::single(MarkSeen)]);
        for b in 0..5 {
            db.add_entry(DbEntry::new(DbKey::new(1, b, 0), ["input"], format!("v{}", b))).unwrap();
        }
        let rounds = db.process().unwrap();
        assert_eq!(rounds, 2);
        assert_eq!(db.query(&["derived"]).len(), 5);
        assert_eq!(db.query(&["input", "mark_seen:done"]).len(), 5);
        assert_eq!(db.get_entry_value_by_key(&DbKey::new(7, 3, 0)).unwrap(), b"v3");

        // Nothing left for the filter to do.
        assert!(db.sweep(None).unwrap().mutations.is_empty());
    }

    #[test]
    fn test_staged_mutations_invisible_until_close() {
        let mut db = SeqDb::new(Arc::new(FilterCatalog::new()));
        db.add_entry(DbEntry::new(DbKey::new(1, 1, 0), ["a"], "v")).unwrap();
        db.stage(Mutation::AddTag { key: DbKey::new(1, 1, 0), tag: "b".into() });
        db.stage(Mutation::AddEntry(DbEntry::new(DbKey::new(2, 2, 0), ["c"], "")));
        assert!(db.query(&["b"]).is_empty());
        assert_eq!(db.size(), 1);
        assert_eq!(db.stage_close().unwrap(), 2);
        assert_eq!(db.query(&["b"]).len(), 1);
        assert_eq!(db.size(), 2);
    }

    #[test]
    fn test_subscription_resumes_waiting_filter() {
        let mut db = db_with(vec![Filter::single(WaitForPeer), Filter::single(Produce)]);
        db.add_entry(DbEntry::new(DbKey::new(1, 5, 0), ["waiter"], "")).unwrap();
        db.add_entry(DbEntry::new(DbKey::new(2, 5, 0), ["producer"], "")).unwrap();
        db.process().unwrap();

        let waiter = db.get_entry(&DbKey::new(1, 5, 0)).unwrap();
        assert!(waiter.has_tag("wait:done"));
        assert!(!waiter.has_tag("wait:inactive"));
        assert_eq!(waiter.value(), b"from-peer");
        assert!(db.subscriptions().is_empty());
    }

    #[test]
    fn test_subscribe_to_existing_key_fires_immediately() {
        let mut db = SeqDb::new(Arc::new(FilterCatalog::new()));
        db.add_entry(DbEntry::new(DbKey::new(1, 1, 0), ["w", "w:inactive"], "")).unwrap();
        db.add_entry(DbEntry::new(DbKey::new(2, 2, 0), [] as [&str; 0], "")).unwrap();
        let wake = db.subscribe(DbKey::new(1, 1, 0), DbKey::new(2, 2, 0), Wake::RemoveTag("w:inactive".into()));
        assert!(wake.is_some());
        db.apply_local(wake.unwrap()).unwrap();
        assert!(!db.get_entry(&DbKey::new(1, 1, 0)).unwrap().has_tag("w:inactive"));
    }

    #[test]
    fn test_get_entries_by_tags_with_predicate() {
        let mut db = SeqDb::new(Arc::new(FilterCatalog::new()));
        for b in 0..4 {
            db.add_entry(DbEntry::new(DbKey::new(1, b, 0), ["t"], b.to_string())).unwrap();
        }
        let odd = db.get_entries_by_tags(&["t"], |e| e.key().b % 2 == 1);
        assert_eq!(odd.len(), 2);
        assert_eq!(db.get_entry_by_tags(&["t"]).unwrap().key(), DbKey::new(1, 0, 0));
        assert!(db.get_entry_by_tags(&["none"]).is_none());
    }

    #[test]
    fn test_export_then_import_into_fresh_db() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("pando-export");
        let mut db = SeqDb::new(Arc::new(FilterCatalog::new()));
        db.add_entry(DbEntry::new(DbKey::new(1, 1, 1), ["a"], "x")).unwrap();
        db.add_entry(DbEntry::new(DbKey::new(1, 1, 2), ["b"], "y")).unwrap();
        db.export_db(&path).unwrap();

        let mut fresh = SeqDb::new(Arc::new(FilterCatalog::new()));
        assert_eq!(fresh.import_db(&path).unwrap(), 2);
        assert_eq!(fresh.entries(), db.entries());

        // Importing again changes nothing.
        fresh.import_db(&path).unwrap();
        assert_eq!(fresh.size(), 2);
    }

    #[test]
    fn test_clear_filters_stops_processing() {
        let mut db = db_with(vec![Filter::single(MarkSeen)]);
        db.add_entry(DbEntry::new(DbKey::new(1, 1, 0), ["input"], "")).unwrap();
        db.clear_filters();
        assert!(db.installed_filters().is_empty());
        assert_eq!(db.process().unwrap(), 1);
        assert!(db.query(&["derived"]).is_empty());
    }
}
