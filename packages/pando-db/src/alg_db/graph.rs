//! Vertex arena and the gather/apply/scatter round driver.
//!
//! Every non-random entry key `{a, b, c}` names two vertices, `(a, b)` and
//! `(a, c)`, in graph `a`, plus one out edge `b -> c`. Because ownership
//! ignores `c`, the out edges of a vertex always live with the vertex.
//!
//! Layout:
//! ```text
//! slots:  [VertexSlot { graph, vtx, out, state, programs[filter] }, ...]
//! index:  (graph, vtx) -> slot position
//! board:  iter -> (graph, vtx) -> [payload]
//! ```
//! Slots are only created during `setup` and only dropped in `teardown`;
//! access to a slot during a round is by position.

use std::collections::{BTreeSet, HashMap};
use std::mem;
use std::sync::Arc;

use super::board::{MessageBoard, VertexMessage};
use crate::entry::DbEntry;
use crate::error::Result;
use crate::filter::{EntryLookup, GroupFilter, Mutation, VertexProgram};
use crate::key::{DbKey, GraphId, VertexId};
use crate::seq_db::EntryStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VertexState {
    Active,
    Inactive,
}

/// Out edge of a vertex, with a snapshot of the entry that defines it.
#[derive(Debug, Clone)]
pub struct OutEdge {
    pub target: VertexId,
    pub entry: DbEntry,
}

impl OutEdge {
    pub fn key(&self) -> DbKey {
        self.entry.key()
    }
}

// ── GroupAccess ─────────────────────────────────────────────────────

/// Capability handle given to a vertex program for one run.
pub struct GroupAccess<'a> {
    graph: GraphId,
    vtx: VertexId,
    iter: u64,
    state: VertexState,
    out_edges: &'a [OutEdge],
    inbox: &'a [Vec<u8>],
    outbox: &'a mut Vec<VertexMessage>,
    lookup: &'a dyn EntryLookup,
    effects: &'a mut Vec<Mutation>,
}

impl<'a> GroupAccess<'a> {
    /// `{graph, vtx, 0}`: the key the vertex is owned under.
    pub fn key(&self) -> DbKey {
        DbKey::new(self.graph, self.vtx, 0)
    }

    pub fn graph(&self) -> GraphId {
        self.graph
    }

    pub fn vtx(&self) -> VertexId {
        self.vtx
    }

    pub fn iter(&self) -> u64 {
        self.iter
    }

    pub fn state(&self) -> VertexState {
        self.state
    }

    pub fn set_state(&mut self, state: VertexState) {
        self.state = state;
    }

    pub fn out_edges(&self) -> &'a [OutEdge] {
        self.out_edges
    }

    /// Payloads addressed to this vertex for the current iteration.
    pub fn inbox(&self) -> &'a [Vec<u8>] {
        self.inbox
    }

    /// Send to `target` in the same graph, for the next iteration.
    pub fn send(&mut self, target: VertexId, payload: Vec<u8>) {
        self.outbox.push(VertexMessage { graph: self.graph, vtx: target, payload });
    }

    pub fn make_new_entry<I, T>(&mut self, tags: I, value: impl Into<Vec<u8>>, key: DbKey)
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        self.effects.push(Mutation::AddEntry(DbEntry::new(key, tags, value)));
    }

    pub fn add_tag(&mut self, key: DbKey, tag: impl Into<String>) {
        self.effects.push(Mutation::AddTag { key, tag: tag.into() });
    }

    pub fn remove_tag(&mut self, key: DbKey, tag: impl Into<String>) {
        self.effects.push(Mutation::RemoveTag { key, tag: tag.into() });
    }

    pub fn update_value(&mut self, key: DbKey, value: impl Into<Vec<u8>>) {
        self.effects.push(Mutation::UpdateValue { key, value: value.into() });
    }

    pub fn get_entry_by_key(&self, key: &DbKey) -> Result<Option<Vec<u8>>> {
        self.lookup.value_by_key(key)
    }

    pub fn get_entries_by_tags(&self, tags: &[&str]) -> Result<Vec<DbEntry>> {
        self.lookup.entries_by_tags(tags)
    }
}

// ── GraphEngine ─────────────────────────────────────────────────────

struct VertexSlot {
    graph: GraphId,
    vtx: VertexId,
    out: Vec<OutEdge>,
    state: VertexState,
    /// One entry per group filter; `None` where `should_run` was false.
    programs: Vec<Option<Box<dyn VertexProgram>>>,
}

/// Result of one compute round.
#[derive(Debug, Default)]
pub struct RoundOutcome {
    /// Iteration the outgoing messages are for.
    pub iter: u64,
    /// Whether any vertex program ended the round ACTIVE.
    pub active: bool,
    pub outgoing: Vec<VertexMessage>,
    pub runs: usize,
}

#[derive(Default)]
pub struct GraphEngine {
    vertices: BTreeSet<(GraphId, VertexId)>,
    slots: Vec<VertexSlot>,
    index: HashMap<(GraphId, VertexId), usize>,
    filters: Vec<Arc<dyn GroupFilter>>,
    board: MessageBoard,
    /// Sent during `init`, delivered with the first round's output.
    pending: Vec<VertexMessage>,
    iter: u64,
    ready: bool,
}

impl GraphEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Vertices named by the non-random keys of `store`.
    pub fn local_vertices(store: &EntryStore) -> BTreeSet<(GraphId, VertexId)> {
        let mut vertices = BTreeSet::new();
        for key in store.keys().filter(|k| !k.is_random()) {
            vertices.insert((key.chain_info, key.b));
            vertices.insert((key.chain_info, key.c));
        }
        vertices
    }

    pub fn add_vertices(&mut self, vertices: impl IntoIterator<Item = (GraphId, VertexId)>) {
        self.vertices.extend(vertices);
    }

    /// Build one slot per known vertex, attach out edges from `store`, and
    /// init every group filter whose `should_run` holds. Returns the number
    /// of vertex programs created.
    pub fn setup(
        &mut self,
        store: &EntryStore,
        filters: Vec<Arc<dyn GroupFilter>>,
        lookup: &dyn EntryLookup,
        effects: &mut Vec<Mutation>,
    ) -> Result<usize> {
        self.filters = filters;
        self.slots.reserve(self.vertices.len());
        for &(graph, vtx) in &self.vertices {
            self.index.insert((graph, vtx), self.slots.len());
            self.slots.push(VertexSlot {
                graph,
                vtx,
                out: Vec::new(),
                state: VertexState::Active,
                programs: Vec::with_capacity(self.filters.len()),
            });
        }

        for entry in store.iter().filter(|e| !e.is_random_key()) {
            let key = entry.key();
            if let Some(&pos) = self.index.get(&(key.chain_info, key.b)) {
                self.slots[pos].out.push(OutEdge { target: key.c, entry: entry.clone() });
            }
        }

        let mut created = 0;
        for slot in &mut self.slots {
            for filter in &self.filters {
                let mut access = GroupAccess {
                    graph: slot.graph,
                    vtx: slot.vtx,
                    iter: 0,
                    state: slot.state,
                    out_edges: &slot.out,
                    inbox: &[],
                    outbox: &mut self.pending,
                    lookup,
                    effects: &mut *effects,
                };
                let program = if filter.should_run(&access)? {
                    created += 1;
                    Some(filter.init(&mut access)?)
                } else {
                    None
                };
                slot.programs.push(program);
            }
        }

        self.ready = true;
        tracing::debug!(vertices = self.slots.len(), programs = created, "graph set up");
        Ok(created)
    }

    /// Run every vertex program once for the current iteration.
    pub fn compute_round(&mut self, lookup: &dyn EntryLookup, effects: &mut Vec<Mutation>) -> Result<RoundOutcome> {
        let iter = self.iter;
        let mut outgoing = mem::take(&mut self.pending);
        let mut active = false;
        let mut runs = 0;

        for slot in &mut self.slots {
            let inbox = self.board.inbox(iter, slot.graph, slot.vtx);
            for program in slot.programs.iter_mut().flatten() {
                let mut access = GroupAccess {
                    graph: slot.graph,
                    vtx: slot.vtx,
                    iter,
                    state: slot.state,
                    out_edges: &slot.out,
                    inbox,
                    outbox: &mut outgoing,
                    lookup,
                    effects: &mut *effects,
                };
                program.run(&mut access)?;
                slot.state = access.state;
                runs += 1;
                active |= slot.state == VertexState::Active;
            }
        }

        self.iter += 1;
        self.board.discard_before(self.iter);
        Ok(RoundOutcome { iter: self.iter, active, outgoing, runs })
    }

    /// File messages for iteration `iter`.
    pub fn deliver(&mut self, iter: u64, msgs: impl IntoIterator<Item = VertexMessage>) {
        self.board.extend(iter, msgs);
    }

    /// Destroy all vertex state and reset the iteration counter.
    pub fn teardown(&mut self) {
        for slot in self.slots.drain(..) {
            for program in slot.programs.into_iter().flatten() {
                program.destroy();
            }
        }
        self.vertices.clear();
        self.index.clear();
        self.filters.clear();
        self.board.clear();
        self.pending.clear();
        self.iter = 0;
        self.ready = false;
    }

    pub fn iter(&self) -> u64 {
        self.iter
    }

    pub fn is_ready(&self) -> bool {
        self.ready
    }

    pub fn vertices(&self) -> &BTreeSet<(GraphId, VertexId)> {
        &self.vertices
    }

    pub fn vertex_count(&self) -> usize {
        self.slots.len()
    }

    pub fn out_degree(&self, graph: GraphId, vtx: VertexId) -> Option<usize> {
        self.index.get(&(graph, vtx)).map(|&pos| self.slots[pos].out.len())
    }

    pub fn vertex_state(&self, graph: GraphId, vtx: VertexId) -> Option<VertexState> {
        self.index.get(&(graph, vtx)).map(|&pos| self.slots[pos].state)
    }
}
