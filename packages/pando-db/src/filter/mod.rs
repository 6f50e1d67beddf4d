//! Filter interface.
//!
//! Filters never touch the store directly. A run reads its entry (or its
//! vertex) and emits [`Mutation`]s; the engine stages them and commits at
//! the end of the sweep, or routes them to the owning agent.
//!
//! - [`SingleEntryFilter`]: stateless predicate + effect over one entry.
//! - [`GroupFilter`]: per-vertex program factory for the graph engine.

mod registry;

use std::sync::Arc;

use crate::alg_db::GroupAccess;
use crate::entry::DbEntry;
use crate::error::Result;
use crate::key::DbKey;
use crate::wire::Message;

pub use registry::{FilterCatalog, FilterSet};

// ── Effects ─────────────────────────────────────────────────────────

/// What happens to a subscriber once the entry it waits on is created.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Wake {
    RemoveTag(String),
    AddTag(String),
}

/// A staged change to the store.
#[derive(Debug, Clone, PartialEq)]
pub enum Mutation {
    AddEntry(DbEntry),
    AddTag { key: DbKey, tag: String },
    RemoveTag { key: DbKey, tag: String },
    UpdateValue { key: DbKey, value: Vec<u8> },
    Subscribe { subscriber: DbKey, wait_key: DbKey, wake: Wake },
}

impl Mutation {
    /// Key whose owner applies the mutation.
    pub fn route_key(&self) -> DbKey {
        match self {
            Mutation::AddEntry(entry) => entry.key(),
            Mutation::AddTag { key, .. } | Mutation::RemoveTag { key, .. } | Mutation::UpdateValue { key, .. } => *key,
            Mutation::Subscribe { wait_key, .. } => *wait_key,
        }
    }

    /// The wake of a fired subscription, as a mutation on the subscriber.
    pub fn from_wake(subscriber: DbKey, wake: Wake) -> Self {
        match wake {
            Wake::RemoveTag(tag) => Mutation::RemoveTag { key: subscriber, tag },
            Wake::AddTag(tag) => Mutation::AddTag { key: subscriber, tag },
        }
    }

    pub fn into_message(self) -> Message {
        match self {
            Mutation::AddEntry(entry) => Message::AddEntry { entry },
            Mutation::AddTag { key, tag } => Message::AddTag { key, tag },
            Mutation::RemoveTag { key, tag } => Message::RemoveTag { key, tag },
            Mutation::UpdateValue { key, value } => Message::UpdateValue { key, value },
            Mutation::Subscribe { subscriber, wait_key, wake } => Message::Subscribe { subscriber, wait_key, wake },
        }
    }
}

// ── Reads ───────────────────────────────────────────────────────────

/// Read access to committed entries, local or across the mesh.
pub trait EntryLookup {
    fn value_by_key(&self, key: &DbKey) -> Result<Option<Vec<u8>>>;

    /// Entries carrying every tag in `tags`.
    fn entries_by_tags(&self, tags: &[&str]) -> Result<Vec<DbEntry>>;
}

// ── EntryAccess ─────────────────────────────────────────────────────

/// Capability handle given to a single-entry filter run.
pub struct EntryAccess<'a> {
    entry: &'a DbEntry,
    lookup: &'a dyn EntryLookup,
    out: &'a mut Vec<Mutation>,
}

impl<'a> EntryAccess<'a> {
    pub fn new(entry: &'a DbEntry, lookup: &'a dyn EntryLookup, out: &'a mut Vec<Mutation>) -> Self {
        Self { entry, lookup, out }
    }

    pub fn key(&self) -> DbKey {
        self.entry.key()
    }

    pub fn entry(&self) -> &DbEntry {
        self.entry
    }

    pub fn value(&self) -> &[u8] {
        self.entry.value()
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.entry.has_tag(tag)
    }

    pub fn make_new_entry<I, T>(&mut self, tags: I, value: impl Into<Vec<u8>>, key: DbKey)
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        self.out.push(Mutation::AddEntry(DbEntry::new(key, tags, value)));
    }

    pub fn add_tag(&mut self, tag: impl Into<String>) {
        self.out.push(Mutation::AddTag { key: self.entry.key(), tag: tag.into() });
    }

    pub fn remove_tag(&mut self, tag: impl Into<String>) {
        self.out.push(Mutation::RemoveTag { key: self.entry.key(), tag: tag.into() });
    }

    pub fn update_value(&mut self, value: impl Into<Vec<u8>>) {
        self.out.push(Mutation::UpdateValue { key: self.entry.key(), value: value.into() });
    }

    /// Wait for `wait_key` to be created; `resume_tag` is removed from this
    /// entry when it is.
    pub fn subscribe_to_entry(&mut self, wait_key: DbKey, resume_tag: impl Into<String>) {
        self.subscribe(wait_key, Wake::RemoveTag(resume_tag.into()));
    }

    pub fn subscribe(&mut self, wait_key: DbKey, wake: Wake) {
        self.out.push(Mutation::Subscribe { subscriber: self.entry.key(), wait_key, wake });
    }

    pub fn get_entry_by_key(&self, key: &DbKey) -> Result<Option<Vec<u8>>> {
        self.lookup.value_by_key(key)
    }

    pub fn get_entries_by_tags(&self, tags: &[&str]) -> Result<Vec<DbEntry>> {
        self.lookup.entries_by_tags(tags)
    }
}

// ── Filter traits ───────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterKind {
    SingleEntry,
    GroupEntries,
}

pub trait SingleEntryFilter: Send + Sync {
    fn name(&self) -> &str;

    /// Checked against the entry's current tags before every run.
    fn should_run(&self, entry: &DbEntry) -> bool;

    /// Record failures as tags; an `Err` is reserved for infrastructure
    /// faults (an unreachable owner during a lookup).
    fn run(&self, access: &mut EntryAccess<'_>) -> Result<()>;
}

pub trait GroupFilter: Send + Sync {
    fn name(&self) -> &str;

    fn should_run(&self, access: &GroupAccess<'_>) -> Result<bool>;

    /// Build the per-vertex state.
    fn init(&self, access: &mut GroupAccess<'_>) -> Result<Box<dyn VertexProgram>>;
}

/// Per-vertex, per-filter state of a graph run.
pub trait VertexProgram: Send {
    fn run(&mut self, access: &mut GroupAccess<'_>) -> Result<()>;

    /// Called once at teardown.
    fn destroy(self: Box<Self>) {}
}

#[derive(Clone)]
pub enum Filter {
    Single(Arc<dyn SingleEntryFilter>),
    Group(Arc<dyn GroupFilter>),
}

impl Filter {
    pub fn single(f: impl SingleEntryFilter + 'static) -> Self {
        Filter::Single(Arc::new(f))
    }

    pub fn group(f: impl GroupFilter + 'static) -> Self {
        Filter::Group(Arc::new(f))
    }

    pub fn name(&self) -> &str {
        match self {
            Filter::Single(f) => f.name(),
            Filter::Group(f) => f.name(),
        }
    }

    pub fn kind(&self) -> FilterKind {
        match self {
            Filter::Single(_) => FilterKind::SingleEntry,
            Filter::Group(_) => FilterKind::GroupEntries,
        }
    }
}

impl std::fmt::Debug for Filter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Filter").field("name", &self.name()).field("kind", &self.kind()).finish()
    }
}
