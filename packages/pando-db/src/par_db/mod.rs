//! ParDb - one agent of the distributed store.
//!
//! # State machine
//!
//! ```text
//! PRELOAD --PROCESS--> STAGE_BEGIN --barrier--> sweep
//!                      STAGE_PROCESSED --barrier--> commit, route wakes
//!                      STAGE_CLOSING --barrier--> PRELOAD | STAGE_BEGIN
//!                                                 (synchronizer decides:
//!                                                  PROCESS, ALGPROCESS or idle)
//! ALGPROCESS --> STAGE_ALG_PROCESS --barrier--> vertex exchange, GAS rounds
//!                                               --> STAGE_PROCESSED
//! ```
//!
//! Every transition happens on END_BARRIER, so no agent sees the effects
//! of phase N+1 before every agent finished phase N.
//!
//! # Ingest
//!
//! Mutations for keys this agent owns are applied directly in PRELOAD and
//! STAGE_CLOSING (tag additions only in STAGE_CLOSING) and staged
//! otherwise; subscriptions are recorded on arrival. Mutations for keys
//! owned elsewhere are forwarded once, and only in PRELOAD.
//!
//! Every mutation pushed between agents is counted on both ends for the
//! barrier, in every state. Client requests are not counted.

mod agent;
mod alg;
mod barrier;
mod responder;

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use crate::address::Address;
use crate::alg_db::{GraphEngine, VertexMessage};
use crate::config::AgentConfig;
use crate::entry::DbEntry;
use crate::error::{PandoError, Result};
use crate::filter::{FilterCatalog, Mutation};
use crate::key::{DbKey, GraphId, RandomKeyGen, VertexId};
use crate::mesh::Participant;
use crate::seq_db::{parse_db_file, read_export, EntryStore, Fetched, RemoteFetch, SeqDb, StoreLookup};
use crate::transport::{Envelope, Transport};
use crate::wire::{Message, Reply};

pub use agent::{spawn_agent, AgentHandle};
pub use alg::AlgExchange;
pub use barrier::{BarrierWait, SentLedger, SyncTally};
pub use responder::Responder;

/// Export file name prefix; the agent address is appended.
pub const EXPORT_PREFIX: &str = "pando-export-";

// ── State ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DbState {
    Preload,
    StageBegin,
    StageProcessed,
    StageClosing,
    StageAlgProcess,
}

impl DbState {
    pub fn name(&self) -> &'static str {
        match self {
            DbState::Preload => "PRELOAD",
            DbState::StageBegin => "STAGE_BEGIN",
            DbState::StageProcessed => "STAGE_PROCESSED",
            DbState::StageClosing => "STAGE_CLOSING",
            DbState::StageAlgProcess => "STAGE_ALG_PROCESS",
        }
    }
}

impl fmt::Display for DbState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// How a message reached the agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    /// Pushed by another agent; mutations count toward barriers.
    Peer,
    /// A request waiting for a reply.
    Client,
}

// ── Remote reads ────────────────────────────────────────────────────

/// Resolves non-owned keys through the owner's responder.
struct MeshFetch<'a> {
    mesh: &'a Participant,
    timeout: Duration,
}

impl RemoteFetch for MeshFetch<'_> {
    fn fetch(&self, key: &DbKey) -> Result<Fetched> {
        let owner = self.mesh.owner(key)?;
        if owner == self.mesh.addr() {
            return Ok(Fetched::Local);
        }
        match self.mesh.request(owner.responder(), &Message::GetEntryByKey { key: *key }, self.timeout)? {
            Reply::Value(value) => Ok(Fetched::Remote(value)),
            other => Err(PandoError::ProtocolState(format!("unexpected reply to GET_ENTRY_BY_KEY: {:?}", other))),
        }
    }
}

// ── ParDb ───────────────────────────────────────────────────────────

pub struct ParDb {
    seq: SeqDb,
    engine: GraphEngine,
    mesh: Participant,
    state: DbState,
    skip_group_filters: bool,
    request_timeout: Duration,

    // Barrier, agent side
    sent: SentLedger,
    wait: BarrierWait,
    local_process_again: bool,
    /// Arrived after this agent reached the STAGE_PROCESSED barrier; they
    /// belong to the closing phase and wait for the local commit.
    held: Vec<Mutation>,

    // Barrier, synchronizer side
    sync: SyncTally,
    run_active: bool,
    alg_pending: bool,
    last_round_alg: bool,

    exchange: AlgExchange,
}

impl ParDb {
    pub fn new(config: &AgentConfig, transport: Arc<dyn Transport>, catalog: Arc<FilterCatalog>) -> Result<Self> {
        let budget = config.memory_budget();
        let store = Arc::new(RwLock::new(EntryStore::with_limit(Some(budget.bytes))));
        let mut seq = SeqDb::with_store(store, catalog, RandomKeyGen::new(config.bind.serial()));
        for bundle in &config.filter_bundles {
            seq.add_filter_dir(bundle)?;
        }
        tracing::info!(
            addr = %config.bind,
            budget_bytes = budget.bytes,
            detected = budget.detected,
            bundles = ?config.filter_bundles,
            "agent created"
        );

        Ok(Self {
            seq,
            engine: GraphEngine::new(),
            mesh: Participant::new(config.bind, transport, config.virtual_agents, config.hb_rounds),
            state: DbState::Preload,
            skip_group_filters: config.skip_group_filters,
            request_timeout: config.request_timeout(),
            sent: SentLedger::new(),
            wait: BarrierWait::new(),
            local_process_again: false,
            held: Vec::new(),
            sync: SyncTally::new(),
            run_active: false,
            alg_pending: false,
            last_round_alg: false,
            exchange: AlgExchange::new(),
        })
    }

    // -- Accessors ------------------------------------------------------------

    pub fn addr(&self) -> Address {
        self.mesh.addr()
    }

    pub fn state(&self) -> DbState {
        self.state
    }

    pub fn seq(&self) -> &SeqDb {
        &self.seq
    }

    pub fn mesh(&self) -> &Participant {
        &self.mesh
    }

    /// True from a fresh PROCESS until the synchronizer sees the run idle.
    pub fn is_processing(&self) -> bool {
        self.state != DbState::Preload || self.run_active
    }

    pub fn join(&mut self, seed: Address) -> Result<()> {
        self.mesh.join(seed)
    }

    pub fn heartbeat(&mut self) -> bool {
        let db_size = self.seq.size() as u64;
        self.mesh.heartbeat(db_size)
    }

    // -- Dispatch -------------------------------------------------------------

    /// Decode and handle one inbound frame, replying if the sender waits.
    ///
    /// Errors are logged and sent back as error replies; only fatal ones
    /// (storage exhausted) are returned.
    pub fn dispatch(&mut self, mut env: Envelope) -> Result<()> {
        let origin = if env.expects_reply() { Origin::Client } else { Origin::Peer };
        let result = Message::decode(&env.payload)
            .map_err(PandoError::from)
            .and_then(|msg| self.handle(msg, origin));
        match result {
            Ok(reply) => {
                env.respond(reply.encode());
                Ok(())
            }
            Err(e) => {
                tracing::error!(addr = %self.addr(), state = %self.state, code = e.code(), error = %e, "message failed");
                env.respond(Reply::from_error(&e).encode());
                if e.is_fatal() {
                    Err(e)
                } else {
                    Ok(())
                }
            }
        }
    }

    pub fn handle(&mut self, msg: Message, origin: Origin) -> Result<Reply> {
        match msg {
            // Membership
            Message::Handshake { peers } => self.mesh.on_handshake(&peers)?,
            Message::Heartbeat { peers } => self.mesh.on_heartbeat(&peers),
            Message::WantHeartbeat { from } => self.mesh.on_want_heartbeat(from)?,
            Message::AddNeighbor { addr } => self.mesh.on_add_neighbor(addr)?,
            Message::NumNeighbors => return Ok(Reply::Count(self.mesh.num_neighbors() as u64)),
            Message::GetNeighbors => return Ok(Reply::Peers(self.mesh.agents())),
            Message::RingSize => return Ok(Reply::Count(self.mesh.ring_size() as u64)),
            Message::Stats { addr, db_size } => self.mesh.record_stats(addr, db_size),

            // Entry mutations
            Message::AddEntry { entry } => self.on_mutation(Mutation::AddEntry(entry), origin)?,
            Message::AddTag { key, tag } => self.on_mutation(Mutation::AddTag { key, tag }, origin)?,
            Message::RemoveTag { key, tag } => self.on_mutation(Mutation::RemoveTag { key, tag }, origin)?,
            Message::UpdateValue { key, value } => self.on_mutation(Mutation::UpdateValue { key, value }, origin)?,
            Message::Subscribe { subscriber, wait_key, wake } => {
                self.on_mutation(Mutation::Subscribe { subscriber, wait_key, wake }, origin)?
            }
            Message::GetEntryByKey { key } => return self.get_entry_by_key(key),

            // Filters and files
            Message::AddFilterDir { bundle } => {
                self.seq.add_filter_dir(&bundle)?;
            }
            Message::AddFilterDirBroadcast { bundle } => {
                self.seq.add_filter_dir(&bundle)?;
                self.fan_out(&Message::AddFilterDir { bundle })?;
            }
            Message::InstallFilter { name } => self.seq.install_filter(&name)?,
            Message::InstallFilterBroadcast { name } => {
                self.seq.install_filter(&name)?;
                self.fan_out(&Message::InstallFilter { name })?;
            }
            Message::ClearFilters => self.seq.clear_filters(),
            Message::ClearFiltersBroadcast => {
                self.seq.clear_filters();
                self.fan_out(&Message::ClearFilters)?;
            }
            Message::AddDbFile { path } => {
                self.require_preload("ADD_DB_FILE")?;
                let entries = parse_db_file(Path::new(&path))?;
                return self.route_entries(entries);
            }
            Message::ExportDb { dir } => {
                let path = self.export_path(&dir);
                self.seq.export_db(&path)?;
                return Ok(Reply::Text(path.display().to_string()));
            }
            Message::ExportDbBroadcast { dir } => {
                self.seq.export_db(&self.export_path(&dir))?;
                self.fan_out(&Message::ExportDb { dir })?;
            }
            Message::ImportDb { path } => return self.import_file(Path::new(&path)),
            Message::ImportDbDistribute { dir } => return self.import_distribute(Path::new(&dir)),

            // Introspection
            Message::DbSize => return Ok(Reply::Count(self.seq.size() as u64)),
            Message::GetState => return Ok(Reply::Text(self.state.name().to_string())),
            Message::Processing => return Ok(Reply::Flag(self.is_processing())),
            Message::Query { tags } => {
                let tags: Vec<&str> = tags.iter().map(String::as_str).collect();
                return Ok(Reply::Entries(self.seq.query(&tags)));
            }
            Message::GetEntries => return Ok(Reply::Entries(self.seq.entries())),
            Message::InstalledFilters => return Ok(Reply::Text(self.seq.installed_filters().join(","))),
            Message::PrintEntries => {
                for entry in self.seq.entries() {
                    tracing::info!(addr = %self.addr(), "\n{}", entry);
                }
            }

            // Processing and barriers
            Message::ProcessBroadcast => self.on_process_broadcast()?,
            Message::Process { fresh } => self.on_process(fresh)?,
            Message::AlgProcess => self.on_alg_process()?,
            Message::StartBarrierWait { from, process_again, sent } => {
                self.on_barrier_report(from, process_again, &sent)?
            }
            Message::BarrierMsgDist { expected } => {
                if self.wait.expect(expected) {
                    self.arrive()?;
                }
            }
            Message::AtBarrier { from } => self.on_at_barrier(from)?,
            Message::EndBarrier => self.on_end_barrier()?,

            // Graph stage
            Message::AlgVertices { from, vertices } => self.on_alg_vertices(from, vertices)?,
            Message::AlgInternalCompute { from, active, iter, messages } => {
                self.on_alg_compute(from, active, iter, messages)?
            }
        }
        Ok(Reply::Ack)
    }

    // -- Ingest and routing ---------------------------------------------------

    fn on_mutation(&mut self, mutation: Mutation, origin: Origin) -> Result<()> {
        let result = self.place(mutation, false);
        if origin == Origin::Peer {
            self.count_recv()?;
        }
        result
    }

    /// Send our own effect to its owner, or accept it locally.
    fn route(&mut self, mutation: Mutation) -> Result<()> {
        self.place(mutation, true)
    }

    fn place(&mut self, mutation: Mutation, own_effect: bool) -> Result<()> {
        let mutation = match mutation {
            Mutation::AddEntry(entry) => Mutation::AddEntry(self.seq.verify_entry_key(entry)),
            other => other,
        };
        let key = mutation.route_key();
        let owner = self.mesh.owner(&key)?;
        if owner == self.addr() {
            return self.accept(mutation);
        }
        if !own_effect && self.state != DbState::Preload {
            return Err(PandoError::ProtocolState(format!(
                "write for {} owned by {} arrived in {}",
                key, owner, self.state
            )));
        }
        self.mesh.send(owner, &mutation.into_message())?;
        self.sent.record(owner);
        Ok(())
    }

    /// Take a mutation for an owned key according to the current state.
    fn accept(&mut self, mutation: Mutation) -> Result<()> {
        if self.state == DbState::StageProcessed && self.wait.arrived() {
            self.held.push(mutation);
            return Ok(());
        }
        let direct = matches!(self.state, DbState::Preload | DbState::StageClosing);
        match mutation {
            Mutation::Subscribe { subscriber, wait_key, wake } => {
                if let Some(wake) = self.seq.subscribe(subscriber, wait_key, wake) {
                    self.route(wake)?;
                }
                Ok(())
            }
            m @ Mutation::AddTag { .. } if self.state == DbState::StageClosing => self.apply_now(m),
            m @ Mutation::AddTag { .. } => {
                self.seq.stage(m);
                Ok(())
            }
            m if direct => self.apply_now(m),
            m => {
                self.seq.stage(m);
                Ok(())
            }
        }
    }

    fn apply_now(&mut self, mutation: Mutation) -> Result<()> {
        for follow_up in self.seq.apply(mutation)? {
            self.route(follow_up)?;
        }
        Ok(())
    }

    fn route_entries(&mut self, entries: Vec<DbEntry>) -> Result<Reply> {
        let count = entries.len();
        for entry in entries {
            self.route(Mutation::AddEntry(entry))?;
        }
        Ok(Reply::Count(count as u64))
    }

    fn get_entry_by_key(&self, key: DbKey) -> Result<Reply> {
        let owner = self.mesh.owner(&key)?;
        if owner == self.addr() {
            return Ok(Reply::Value(self.seq.get_entry_value_by_key(&key)));
        }
        self.mesh.request(owner.responder(), &Message::GetEntryByKey { key }, self.request_timeout)
    }

    fn require_preload(&self, op: &str) -> Result<()> {
        if self.state != DbState::Preload {
            return Err(PandoError::ProtocolState(format!("{} while in {}", op, self.state)));
        }
        Ok(())
    }

    // -- Fan-out --------------------------------------------------------------

    /// Push to every agent, self included.
    fn broadcast(&self, msg: &Message) -> Result<()> {
        for agent in self.mesh.agents() {
            self.mesh.send(agent, msg)?;
        }
        Ok(())
    }

    /// Request on every other agent and wait for each ack.
    fn fan_out(&self, msg: &Message) -> Result<()> {
        for agent in self.mesh.agents().into_iter().filter(|a| *a != self.addr()) {
            self.mesh.request(agent, msg, self.request_timeout)?;
        }
        Ok(())
    }

    // -- Files ----------------------------------------------------------------

    fn export_path(&self, dir: &str) -> PathBuf {
        Path::new(dir).join(format!("{}{}", EXPORT_PREFIX, self.addr()))
    }

    fn import_file(&mut self, path: &Path) -> Result<Reply> {
        self.require_preload("IMPORT_DB")?;
        let entries = read_export(path)?;
        tracing::info!(addr = %self.addr(), path = %path.display(), entries = entries.len(), "importing");
        self.route_entries(entries)
    }

    /// Assign the directory's files round-robin to all agents.
    fn import_distribute(&mut self, dir: &Path) -> Result<Reply> {
        self.require_preload("IMPORT_DB_DISTRIBUTE")?;
        let mut files = Vec::new();
        for item in std::fs::read_dir(dir)? {
            let path = item?.path();
            if path.is_file() {
                files.push(path);
            }
        }
        files.sort();

        let agents = self.mesh.agents();
        if agents.is_empty() {
            return Err(PandoError::EmptyRing);
        }
        for (i, path) in files.iter().enumerate() {
            let agent = agents[i % agents.len()];
            if agent == self.addr() {
                self.import_file(path)?;
            } else {
                let msg = Message::ImportDb { path: path.display().to_string() };
                self.mesh.request(agent, &msg, self.request_timeout)?;
            }
        }
        Ok(Reply::Count(files.len() as u64))
    }

    // -- Processing -----------------------------------------------------------

    fn on_process_broadcast(&mut self) -> Result<()> {
        if self.is_processing() {
            return Err(PandoError::ProtocolState("processing already running".to_string()));
        }
        if self.mesh.is_synchronizer()? {
            self.run_active = true;
        }
        tracing::info!(addr = %self.addr(), agents = self.mesh.num_neighbors(), "processing started");
        self.broadcast(&Message::Process { fresh: true })
    }

    fn on_process(&mut self, fresh: bool) -> Result<()> {
        if fresh && self.mesh.is_synchronizer()? {
            self.run_active = true;
            self.alg_pending = true;
            self.last_round_alg = false;
        }
        self.state = DbState::StageBegin;
        self.local_process_again = false;
        self.start_barrier_wait()
    }

    fn on_alg_process(&mut self) -> Result<()> {
        self.state = DbState::StageAlgProcess;
        self.local_process_again = false;
        self.start_barrier_wait()
    }

    /// Local work of the phase is done; wait for everyone else.
    fn finish_db_process(&mut self) -> Result<()> {
        self.state = DbState::StageProcessed;
        self.start_barrier_wait()
    }

    // -- Barrier, agent side --------------------------------------------------

    fn start_barrier_wait(&mut self) -> Result<()> {
        let sync = self.mesh.synchronizer()?;
        let sent = self.sent.take();
        tracing::debug!(
            addr = %self.addr(),
            state = %self.state,
            process_again = self.local_process_again,
            sent = sent.iter().map(|(_, n)| n).sum::<u64>(),
            "barrier wait"
        );
        self.mesh.send(sync, &Message::StartBarrierWait { from: self.addr(), process_again: self.local_process_again, sent })
    }

    fn count_recv(&mut self) -> Result<()> {
        if self.wait.record_recv() {
            self.arrive()?;
        }
        Ok(())
    }

    fn arrive(&mut self) -> Result<()> {
        let sync = self.mesh.synchronizer()?;
        self.mesh.send(sync, &Message::AtBarrier { from: self.addr() })
    }

    fn on_end_barrier(&mut self) -> Result<()> {
        self.wait.end();
        tracing::debug!(addr = %self.addr(), state = %self.state, "end barrier");
        match self.state {
            DbState::Preload => Err(PandoError::ProtocolState("END_BARRIER in PRELOAD".to_string())),
            DbState::StageBegin => self.run_sweep(),
            DbState::StageProcessed => self.close_stage(),
            DbState::StageClosing => self.after_close(),
            DbState::StageAlgProcess => self.send_vertices(),
        }
    }

    fn run_sweep(&mut self) -> Result<()> {
        let sweep = {
            let fetch = MeshFetch { mesh: &self.mesh, timeout: self.request_timeout };
            self.seq.sweep(Some(&fetch))?
        };
        self.local_process_again = sweep.produced_effects();
        tracing::debug!(addr = %self.addr(), runs = sweep.runs, mutations = sweep.mutations.len(), "sweep");
        for mutation in sweep.mutations {
            self.route(mutation)?;
        }
        self.finish_db_process()
    }

    fn close_stage(&mut self) -> Result<()> {
        self.state = DbState::StageClosing;
        let report = self.seq.commit_staged()?;
        tracing::debug!(addr = %self.addr(), committed = report.committed, wakes = report.wakes.len(), "staged committed");
        for wake in report.wakes {
            self.route(wake)?;
        }
        for mutation in std::mem::take(&mut self.held) {
            self.accept(mutation)?;
        }
        self.start_barrier_wait()
    }

    fn after_close(&mut self) -> Result<()> {
        self.state = if self.local_process_again { DbState::StageBegin } else { DbState::Preload };
        if self.mesh.is_synchronizer()? {
            self.decide_next()?;
        }
        Ok(())
    }

    // -- Barrier, synchronizer side -------------------------------------------

    fn on_barrier_report(&mut self, from: Address, process_again: bool, sent: &[(Address, u64)]) -> Result<()> {
        let agents = self.mesh.agents();
        if let Some(dist) = self.sync.report(from, process_again, sent, &agents) {
            for (agent, expected) in dist {
                self.mesh.send(agent, &Message::BarrierMsgDist { expected })?;
            }
        }
        Ok(())
    }

    fn on_at_barrier(&mut self, from: Address) -> Result<()> {
        if self.sync.arrive(from, self.mesh.num_neighbors()) {
            self.broadcast(&Message::EndBarrier)?;
        }
        Ok(())
    }

    /// After a closing barrier: another single-entry round, the graph
    /// stage, or done.
    fn decide_next(&mut self) -> Result<()> {
        let graph_stage = !self.skip_group_filters && self.seq.filters().has_group_filters();
        if self.sync.take_process_again() {
            if !self.last_round_alg {
                self.alg_pending = true;
            }
            self.last_round_alg = false;
            self.broadcast(&Message::Process { fresh: false })
        } else if self.alg_pending && graph_stage {
            self.alg_pending = false;
            self.last_round_alg = true;
            self.broadcast(&Message::AlgProcess)
        } else {
            self.alg_pending = false;
            self.last_round_alg = false;
            self.run_active = false;
            tracing::info!(addr = %self.addr(), "processing finished");
            Ok(())
        }
    }

    // -- Graph stage ----------------------------------------------------------

    /// Send each locally named vertex to its owner; every agent gets a
    /// list, possibly empty.
    fn send_vertices(&mut self) -> Result<()> {
        let local = GraphEngine::local_vertices(&self.seq.read());
        let mut by_owner: BTreeMap<Address, Vec<(GraphId, VertexId)>> = BTreeMap::new();
        for (graph, vtx) in local {
            let owner = self.mesh.owner(&DbKey::new(graph, vtx, 0))?;
            by_owner.entry(owner).or_default().push((graph, vtx));
        }
        for agent in self.mesh.agents() {
            let vertices = by_owner.remove(&agent).unwrap_or_default();
            self.mesh.send(agent, &Message::AlgVertices { from: self.addr(), vertices })?;
        }
        Ok(())
    }

    fn on_alg_vertices(&mut self, from: Address, vertices: Vec<(GraphId, VertexId)>) -> Result<()> {
        self.engine.add_vertices(vertices);
        if !self.exchange.on_vertices(from, self.mesh.num_neighbors()) {
            return Ok(());
        }

        let mut effects = Vec::new();
        let programs = {
            let store = self.seq.read();
            let fetch = MeshFetch { mesh: &self.mesh, timeout: self.request_timeout };
            let lookup = StoreLookup::new(&store, Some(&fetch));
            self.engine.setup(&store, self.seq.filters().group(), &lookup, &mut effects)?
        };
        tracing::debug!(addr = %self.addr(), vertices = self.engine.vertex_count(), programs, "graph stage set up");
        self.route_effects(effects)?;
        self.alg_round()
    }

    fn alg_round(&mut self) -> Result<()> {
        let mut effects = Vec::new();
        let round = {
            let store = self.seq.read();
            let fetch = MeshFetch { mesh: &self.mesh, timeout: self.request_timeout };
            let lookup = StoreLookup::new(&store, Some(&fetch));
            self.engine.compute_round(&lookup, &mut effects)?
        };
        self.route_effects(effects)?;

        let mut batches: BTreeMap<Address, Vec<VertexMessage>> = BTreeMap::new();
        for msg in round.outgoing {
            let owner = self.mesh.owner(&DbKey::new(msg.graph, msg.vtx, 0))?;
            batches.entry(owner).or_default().push(msg);
        }
        for agent in self.mesh.agents() {
            let messages = batches.remove(&agent).unwrap_or_default();
            let report = Message::AlgInternalCompute { from: self.addr(), active: round.active, iter: round.iter, messages };
            self.mesh.send(agent, &report)?;
        }
        Ok(())
    }

    fn route_effects(&mut self, effects: Vec<Mutation>) -> Result<()> {
        self.local_process_again |= !effects.is_empty();
        for mutation in effects {
            self.route(mutation)?;
        }
        Ok(())
    }

    fn on_alg_compute(&mut self, from: Address, active: bool, iter: u64, messages: Vec<VertexMessage>) -> Result<()> {
        self.engine.deliver(iter, messages);
        self.exchange.on_compute(from, iter, active);
        if !self.engine.is_ready() {
            return Ok(());
        }
        match self.exchange.complete(self.engine.iter(), self.mesh.num_neighbors()) {
            None => Ok(()),
            Some(true) => self.alg_round(),
            Some(false) => {
                tracing::debug!(addr = %self.addr(), iterations = self.engine.iter(), "graph stage quiescent");
                self.engine.teardown();
                self.exchange.reset();
                self.finish_db_process()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::{EntryAccess, Filter, SingleEntryFilter};
    use crate::transport::MemoryTransport;
    use crossbeam_channel::Receiver;

    /// Adds "seen" to every entry tagged "input".
    struct MarkSeen;

    impl SingleEntryFilter for MarkSeen {
        fn name(&self) -> &str {
            "mark_seen"
        }

        fn should_run(&self, entry: &DbEntry) -> bool {
            entry.has_tag("input") && !entry.has_tag("seen")
        }

        fn run(&self, access: &mut EntryAccess<'_>) -> Result<()> {
            access.add_tag("seen");
            Ok(())
        }
    }

    fn catalog() -> Arc<FilterCatalog> {
        let mut catalog = FilterCatalog::new();
        catalog.register_bundle("test", vec![Filter::single(MarkSeen)]);
        Arc::new(catalog)
    }

    fn config(slot: u16) -> AgentConfig {
        AgentConfig {
            bind: Address::local(slot),
            memory_gb: Some(0.5),
            filter_bundles: vec!["test".to_string()],
            virtual_agents: 20,
            ..AgentConfig::default()
        }
    }

    fn agent(hub: &MemoryTransport, slot: u16) -> (ParDb, Receiver<Envelope>) {
        let inbox = hub.bind(Address::local(slot)).unwrap();
        let db = ParDb::new(&config(slot), Arc::new(hub.clone()), catalog()).unwrap();
        (db, inbox)
    }

    /// Handle queued frames until the inbox is empty.
    fn pump(db: &mut ParDb, inbox: &Receiver<Envelope>) -> usize {
        let mut handled = 0;
        while let Ok(env) = inbox.try_recv() {
            db.dispatch(env).unwrap();
            handled += 1;
        }
        handled
    }

    #[test]
    fn test_single_agent_full_run() {
        let hub = MemoryTransport::new();
        let (mut db, inbox) = agent(&hub, 0);
        db.handle(Message::InstallFilter { name: "mark_seen".into() }, Origin::Client).unwrap();
        let entry = DbEntry::new(DbKey::new(1, 1, 1), ["input"], "x");
        db.handle(Message::AddEntry { entry }, Origin::Client).unwrap();

        db.handle(Message::ProcessBroadcast, Origin::Client).unwrap();
        assert!(db.is_processing());
        pump(&mut db, &inbox);

        assert_eq!(db.state(), DbState::Preload);
        assert!(!db.is_processing());
        assert!(db.seq().get_entry(&DbKey::new(1, 1, 1)).unwrap().has_tag("seen"));
    }

    #[test]
    fn test_process_rejected_while_running() {
        let hub = MemoryTransport::new();
        let (mut db, _inbox) = agent(&hub, 0);
        db.handle(Message::ProcessBroadcast, Origin::Client).unwrap();
        let err = db.handle(Message::ProcessBroadcast, Origin::Client).unwrap_err();
        assert_eq!(err.code(), "PROTOCOL_STATE");
    }

    #[test]
    fn test_end_barrier_in_preload_is_protocol_error() {
        let hub = MemoryTransport::new();
        let (mut db, _inbox) = agent(&hub, 0);
        let err = db.handle(Message::EndBarrier, Origin::Peer).unwrap_err();
        assert_eq!(err.code(), "PROTOCOL_STATE");
    }

    #[test]
    fn test_state_and_introspection_replies() {
        let hub = MemoryTransport::new();
        let (mut db, _inbox) = agent(&hub, 0);
        assert_eq!(db.handle(Message::GetState, Origin::Client).unwrap(), Reply::Text("PRELOAD".into()));
        assert_eq!(db.handle(Message::RingSize, Origin::Client).unwrap(), Reply::Count(20));
        assert_eq!(db.handle(Message::Processing, Origin::Client).unwrap(), Reply::Flag(false));
        db.handle(Message::InstallFilter { name: "mark_seen".into() }, Origin::Client).unwrap();
        assert_eq!(db.handle(Message::InstalledFilters, Origin::Client).unwrap(), Reply::Text("mark_seen".into()));
    }

    fn key_owned_by(db: &ParDb, owner: Address) -> DbKey {
        (0..10_000)
            .map(|b| DbKey::new(7, b, 0))
            .find(|k| db.mesh().owner(k).unwrap() == owner)
            .unwrap()
    }

    #[test]
    fn test_preload_forwards_to_owner_and_counts() {
        let hub = MemoryTransport::new();
        let (mut db, _inbox) = agent(&hub, 0);
        let peer_rx = hub.bind(Address::local(3)).unwrap();
        db.handle(Message::Handshake { peers: vec![Address::local(3)] }, Origin::Peer).unwrap();
        let _ = peer_rx.try_iter().count();

        let key = key_owned_by(&db, Address::local(3));
        let entry = DbEntry::new(key, ["t"], "");
        db.handle(Message::AddEntry { entry: entry.clone() }, Origin::Client).unwrap();

        let forwarded: Vec<Message> = peer_rx.try_iter().map(|e| Message::decode(&e.payload).unwrap()).collect();
        assert_eq!(forwarded, vec![Message::AddEntry { entry }]);
        assert_eq!(db.sent.total(), 1);
        assert_eq!(db.seq().size(), 0);
    }

    #[test]
    fn test_foreign_write_outside_preload_is_protocol_error() {
        let hub = MemoryTransport::new();
        let (mut db, _inbox) = agent(&hub, 0);
        let _peer_rx = hub.bind(Address::local(3)).unwrap();
        db.handle(Message::Handshake { peers: vec![Address::local(3)] }, Origin::Peer).unwrap();
        db.handle(Message::Process { fresh: false }, Origin::Peer).unwrap();
        assert_eq!(db.state(), DbState::StageBegin);

        let key = key_owned_by(&db, Address::local(3));
        let err = db
            .handle(Message::AddEntry { entry: DbEntry::new(key, ["t"], "") }, Origin::Client)
            .unwrap_err();
        assert_eq!(err.code(), "PROTOCOL_STATE");
    }

    #[test]
    fn test_staged_outside_preload() {
        let hub = MemoryTransport::new();
        let (mut db, _inbox) = agent(&hub, 0);
        db.handle(Message::Process { fresh: false }, Origin::Peer).unwrap();
        let entry = DbEntry::new(DbKey::new(1, 2, 3), ["t"], "");
        db.handle(Message::AddEntry { entry }, Origin::Peer).unwrap();
        assert_eq!(db.seq().size(), 0);
        assert_eq!(db.seq().staged_len(), 1);
        assert_eq!(db.wait.received(), 1);
    }

    #[test]
    fn test_query_reply() {
        let hub = MemoryTransport::new();
        let (mut db, _inbox) = agent(&hub, 0);
        let entry = DbEntry::new(DbKey::new(1, 2, 3), ["a", "b"], "v");
        db.handle(Message::AddEntry { entry: entry.clone() }, Origin::Client).unwrap();
        let reply = db.handle(Message::Query { tags: vec!["a".into(), "b".into()] }, Origin::Client).unwrap();
        assert_eq!(reply, Reply::Entries(vec![entry]));
        assert_eq!(
            db.handle(Message::GetEntryByKey { key: DbKey::new(1, 2, 3) }, Origin::Client).unwrap(),
            Reply::Value(Some(b"v".to_vec()))
        );
    }
}
