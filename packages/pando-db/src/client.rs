//! Request/reply client for a running mesh.
//!
//! The client talks to one entry agent for most requests. Writes go
//! straight to the owning agent, using a ring built from the entry agent's
//! peer list, so they are applied before the call returns.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crate::address::{Address, STARTING_VAGENTS};
use crate::entry::DbEntry;
use crate::error::{PandoError, Result};
use crate::key::{DbKey, RandomKeyGen, SYNC_KEY};
use crate::ring::ConsistentHashRing;
use crate::transport::Transport;
use crate::wire::{Message, Reply};

const IDLE_POLL: Duration = Duration::from_millis(20);

pub struct ParDbClient {
    transport: Arc<dyn Transport>,
    agent: Address,
    timeout: Duration,
    vagents: u16,
    ring: Option<ConsistentHashRing>,
    keygen: RandomKeyGen,
}

fn unexpected(op: &str, reply: Reply) -> PandoError {
    PandoError::ProtocolState(format!("unexpected reply to {}: {:?}", op, reply))
}

impl ParDbClient {
    pub fn new(transport: Arc<dyn Transport>, agent: Address) -> Self {
        Self {
            transport,
            agent,
            timeout: Duration::from_secs(10),
            vagents: STARTING_VAGENTS,
            ring: None,
            keygen: RandomKeyGen::new(agent.serial()),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Must match the agents' `virtual_agents`.
    pub fn with_virtual_agents(mut self, vagents: u16) -> Self {
        self.vagents = vagents;
        self.ring = None;
        self
    }

    pub fn agent(&self) -> Address {
        self.agent
    }

    // -- Transport ------------------------------------------------------------

    pub fn call(&self, to: Address, msg: &Message) -> Result<Reply> {
        let bytes = self.transport.request(to, msg.encode(), self.timeout)?;
        Reply::decode(&bytes)?.into_result()
    }

    fn ack(&self, to: Address, msg: &Message, op: &str) -> Result<()> {
        match self.call(to, msg)? {
            Reply::Ack => Ok(()),
            other => Err(unexpected(op, other)),
        }
    }

    fn count(&self, to: Address, msg: &Message, op: &str) -> Result<u64> {
        match self.call(to, msg)? {
            Reply::Count(n) => Ok(n),
            other => Err(unexpected(op, other)),
        }
    }

    fn text(&self, to: Address, msg: &Message, op: &str) -> Result<String> {
        match self.call(to, msg)? {
            Reply::Text(s) => Ok(s),
            other => Err(unexpected(op, other)),
        }
    }

    fn entries(&self, to: Address, msg: &Message, op: &str) -> Result<Vec<DbEntry>> {
        match self.call(to, msg)? {
            Reply::Entries(entries) => Ok(entries),
            other => Err(unexpected(op, other)),
        }
    }

    // -- Ring -----------------------------------------------------------------

    pub fn neighbors(&self) -> Result<Vec<Address>> {
        match self.call(self.agent, &Message::GetNeighbors)? {
            Reply::Peers(peers) => Ok(peers),
            other => Err(unexpected("GET_NEIGHBORS", other)),
        }
    }

    /// Rebuild the local ring from the entry agent's view.
    pub fn refresh_ring(&mut self) -> Result<()> {
        let peers = self.neighbors()?;
        let mut ring = ConsistentHashRing::new(self.vagents);
        ring.update_agents(&peers);
        self.ring = Some(ring);
        Ok(())
    }

    pub fn owner(&mut self, key: &DbKey) -> Result<Address> {
        if self.ring.is_none() {
            self.refresh_ring()?;
        }
        match &self.ring {
            Some(ring) => ring.lookup_key(key),
            None => Err(PandoError::EmptyRing),
        }
    }

    pub fn synchronizer(&mut self) -> Result<Address> {
        self.refresh_ring()?;
        self.owner(&SYNC_KEY)
    }

    pub fn num_neighbors(&self, agent: Address) -> Result<u64> {
        self.count(agent, &Message::NumNeighbors, "NUM_NEIGHBORS")
    }

    pub fn ring_size(&self, agent: Address) -> Result<u64> {
        self.count(agent, &Message::RingSize, "RING_SIZE")
    }

    pub fn add_neighbor(&self, agent: Address, peer: Address) -> Result<()> {
        self.ack(agent, &Message::AddNeighbor { addr: peer }, "ADD_NEIGHBOR")
    }

    // -- Writes ---------------------------------------------------------------

    /// Unkeyed entries get a random key here, then go to their owner.
    pub fn add_entry(&mut self, mut entry: DbEntry) -> Result<()> {
        entry.set_key(self.keygen.assign(entry.key()));
        let owner = self.owner(&entry.key())?;
        self.ack(owner, &Message::AddEntry { entry }, "ADD_ENTRY")
    }

    pub fn add_tag(&mut self, key: DbKey, tag: impl Into<String>) -> Result<()> {
        let owner = self.owner(&key)?;
        self.ack(owner, &Message::AddTag { key, tag: tag.into() }, "ADD_TAG_TO_ENTRY")
    }

    pub fn remove_tag(&mut self, key: DbKey, tag: impl Into<String>) -> Result<()> {
        let owner = self.owner(&key)?;
        self.ack(owner, &Message::RemoveTag { key, tag: tag.into() }, "REMOVE_TAG_FROM_ENTRY")
    }

    pub fn update_value(&mut self, key: DbKey, value: impl Into<Vec<u8>>) -> Result<()> {
        let owner = self.owner(&key)?;
        self.ack(owner, &Message::UpdateValue { key, value: value.into() }, "UPDATE_ENTRY_VAL")
    }

    // -- Reads ----------------------------------------------------------------

    pub fn get_entry_by_key(&self, key: DbKey) -> Result<Option<Vec<u8>>> {
        match self.call(self.agent, &Message::GetEntryByKey { key })? {
            Reply::Value(value) => Ok(value),
            other => Err(unexpected("GET_ENTRY_BY_KEY", other)),
        }
    }

    pub fn db_size(&self, agent: Address) -> Result<u64> {
        self.count(agent, &Message::DbSize, "DB_SIZE")
    }

    /// Sum of `DB_SIZE` over every agent.
    pub fn total_size(&self) -> Result<u64> {
        let mut total = 0;
        for agent in self.neighbors()? {
            total += self.db_size(agent)?;
        }
        Ok(total)
    }

    pub fn state(&self, agent: Address) -> Result<String> {
        self.text(agent, &Message::GetState, "GET_STATE")
    }

    pub fn query(&self, agent: Address, tags: &[&str]) -> Result<Vec<DbEntry>> {
        let msg = Message::Query { tags: tags.iter().map(|t| t.to_string()).collect() };
        self.entries(agent, &msg, "QUERY")
    }

    /// `QUERY` on every agent, concatenated.
    pub fn query_all(&self, tags: &[&str]) -> Result<Vec<DbEntry>> {
        let mut found = Vec::new();
        for agent in self.neighbors()? {
            found.extend(self.query(agent, tags)?);
        }
        Ok(found)
    }

    pub fn get_entries(&self, agent: Address) -> Result<Vec<DbEntry>> {
        self.entries(agent, &Message::GetEntries, "GET_ENTRIES")
    }

    pub fn installed_filters(&self, agent: Address) -> Result<Vec<String>> {
        let joined = self.text(agent, &Message::InstalledFilters, "INSTALLED_FILTERS")?;
        Ok(joined.split(',').filter(|s| !s.is_empty()).map(str::to_string).collect())
    }

    pub fn print_entries(&self, agent: Address) -> Result<()> {
        self.ack(agent, &Message::PrintEntries, "PRINT_ENTRIES")
    }

    // -- Filters and files ----------------------------------------------------

    pub fn add_filter_dir(&self, bundle: &str) -> Result<()> {
        self.ack(self.agent, &Message::AddFilterDirBroadcast { bundle: bundle.to_string() }, "ADD_FILTER_DIR_BROADCAST")
    }

    pub fn install_filter(&self, name: &str) -> Result<()> {
        self.ack(self.agent, &Message::InstallFilterBroadcast { name: name.to_string() }, "INSTALL_FILTER_BROADCAST")
    }

    pub fn clear_filters(&self) -> Result<()> {
        self.ack(self.agent, &Message::ClearFiltersBroadcast, "CLEAR_FILTERS_BROADCAST")
    }

    /// Returns the number of entries read.
    pub fn add_db_file(&self, path: &str) -> Result<u64> {
        self.count(self.agent, &Message::AddDbFile { path: path.to_string() }, "ADD_DB_FILE")
    }

    pub fn export_db(&self, dir: &str) -> Result<()> {
        self.ack(self.agent, &Message::ExportDbBroadcast { dir: dir.to_string() }, "EXPORT_DB_BROADCAST")
    }

    /// Returns the number of files assigned.
    pub fn import_db(&self, dir: &str) -> Result<u64> {
        self.count(self.agent, &Message::ImportDbDistribute { dir: dir.to_string() }, "IMPORT_DB_DISTRIBUTE")
    }

    // -- Processing -----------------------------------------------------------

    /// Start a run on the synchronizer.
    pub fn process(&mut self) -> Result<()> {
        let sync = self.synchronizer()?;
        self.ack(sync, &Message::ProcessBroadcast, "PROCESS_BROADCAST")
    }

    pub fn processing(&self, agent: Address) -> Result<bool> {
        match self.call(agent, &Message::Processing)? {
            Reply::Flag(b) => Ok(b),
            other => Err(unexpected("PROCESSING", other)),
        }
    }

    /// Poll the synchronizer until the run is idle.
    pub fn wait_idle(&mut self, timeout: Duration) -> Result<()> {
        let sync = self.synchronizer()?;
        let deadline = Instant::now() + timeout;
        while self.processing(sync)? {
            if Instant::now() >= deadline {
                return Err(PandoError::Timeout(sync));
            }
            thread::sleep(IDLE_POLL);
        }
        Ok(())
    }
}
