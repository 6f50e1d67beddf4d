//! Mesh membership: handshake on join, heartbeat gossip, key ownership.
//!
//! Membership only grows. Any change (a new peer from a handshake, a
//! heartbeat or an explicit add) re-arms a small heartbeat counter; each
//! heartbeat tick while the counter is positive pushes the full peer list
//! to every other agent, so views converge within a few ticks and traffic
//! stops once they have.
//!
//! An observer participant (`is_agent == false`) tracks the ring without
//! owning keys and pulls peer lists with `WANT_HEARTBEAT`.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use crate::address::Address;
use crate::error::Result;
use crate::key::{DbKey, SYNC_KEY};
use crate::ring::ConsistentHashRing;
use crate::transport::Transport;
use crate::wire::{Message, Reply};

/// Heartbeat ticks sent after the last membership change.
pub const HB_CTR_MAX: u32 = 3;

pub struct Participant {
    addr: Address,
    is_agent: bool,
    agents: BTreeSet<Address>,
    ring: ConsistentHashRing,
    hb_ctr: u32,
    hb_rounds: u32,
    /// Last `STATS` report per agent.
    db_sizes: BTreeMap<Address, u64>,
    transport: Arc<dyn Transport>,
}

impl Participant {
    // -- Constructors ---------------------------------------------------------

    /// Storage agent; owns part of the ring from the start.
    pub fn new(addr: Address, transport: Arc<dyn Transport>, vagents: u16, hb_rounds: u32) -> Self {
        let mut participant = Self::build(addr, true, transport, vagents, hb_rounds);
        participant.agents.insert(addr);
        participant.ring.update_agents(&[addr]);
        participant
    }

    /// Ring observer; never a key owner.
    pub fn observer(addr: Address, transport: Arc<dyn Transport>, vagents: u16) -> Self {
        Self::build(addr, false, transport, vagents, HB_CTR_MAX)
    }

    fn build(addr: Address, is_agent: bool, transport: Arc<dyn Transport>, vagents: u16, hb_rounds: u32) -> Self {
        Self {
            addr,
            is_agent,
            agents: BTreeSet::new(),
            ring: ConsistentHashRing::new(vagents),
            hb_ctr: 0,
            hb_rounds,
            db_sizes: BTreeMap::new(),
            transport,
        }
    }

    // -- Ownership ------------------------------------------------------------

    pub fn addr(&self) -> Address {
        self.addr
    }

    pub fn is_agent(&self) -> bool {
        self.is_agent
    }

    /// Known agents, self included for a storage agent.
    pub fn agents(&self) -> Vec<Address> {
        self.agents.iter().copied().collect()
    }

    pub fn num_neighbors(&self) -> usize {
        self.agents.len()
    }

    pub fn ring_size(&self) -> usize {
        self.ring.ring_size()
    }

    pub fn owner(&self, key: &DbKey) -> Result<Address> {
        self.ring.lookup_key(key)
    }

    pub fn has_ownership(&self, key: &DbKey) -> Result<bool> {
        Ok(self.owner(key)? == self.addr)
    }

    /// Owner of the sentinel key; coordinates every barrier.
    pub fn synchronizer(&self) -> Result<Address> {
        self.owner(&SYNC_KEY)
    }

    pub fn is_synchronizer(&self) -> Result<bool> {
        self.has_ownership(&SYNC_KEY)
    }

    // -- Membership -----------------------------------------------------------

    /// Add one peer. With `notify`, send it our view so it adds us back.
    /// Returns whether the peer was new.
    pub fn add_neighbor(&mut self, peer: Address, notify: bool) -> Result<bool> {
        if !self.agents.insert(peer) {
            return Ok(false);
        }
        self.hb_ctr = self.hb_rounds;
        self.ring.update_agents(&self.agents());
        tracing::info!(addr = %self.addr, %peer, agents = self.agents.len(), "neighbor added");

        if notify && peer != self.addr {
            self.send(peer, &Message::Handshake { peers: self.agents() })?;
        }
        Ok(true)
    }

    /// Merge a peer list. Returns whether anything was new.
    pub fn merge_peers(&mut self, peers: &[Address]) -> bool {
        let before = self.agents.len();
        let fresh: Vec<Address> = peers.iter().copied().filter(|p| !self.agents.contains(p)).collect();
        if fresh.is_empty() {
            return false;
        }
        self.agents.extend(fresh);
        self.hb_ctr = self.hb_rounds;
        self.ring.update_agents(&self.agents());
        tracing::info!(addr = %self.addr, added = self.agents.len() - before, agents = self.agents.len(), "mesh merged");
        true
    }

    /// Join a mesh through `seed`.
    pub fn join(&mut self, seed: Address) -> Result<()> {
        self.add_neighbor(seed, true)?;
        Ok(())
    }

    /// Merge a joiner's view and answer every peer we had not seen with
    /// ours, so both sides end up with the union.
    pub fn on_handshake(&mut self, peers: &[Address]) -> Result<()> {
        let fresh: Vec<Address> = peers.iter().copied().filter(|p| !self.agents.contains(p)).collect();
        if !self.merge_peers(peers) || !self.is_agent {
            return Ok(());
        }
        let view = Message::Handshake { peers: self.agents() };
        for peer in fresh.into_iter().filter(|p| *p != self.addr) {
            self.send(peer, &view)?;
        }
        Ok(())
    }

    pub fn on_heartbeat(&mut self, peers: &[Address]) {
        self.merge_peers(peers);
    }

    /// A peer wants our view now: re-arm gossip and answer it directly.
    pub fn on_want_heartbeat(&mut self, from: Address) -> Result<()> {
        self.hb_ctr = self.hb_rounds;
        self.send(from, &Message::Heartbeat { peers: self.agents() })
    }

    pub fn on_add_neighbor(&mut self, peer: Address) -> Result<()> {
        let notify = self.is_agent;
        self.add_neighbor(peer, notify)?;
        if !notify {
            self.request_mesh(peer)?;
        }
        Ok(())
    }

    /// Ask `peer` for its peer list.
    pub fn request_mesh(&self, peer: Address) -> Result<()> {
        self.send(peer, &Message::WantHeartbeat { from: self.addr })
    }

    // -- Heartbeat ------------------------------------------------------------

    pub fn hb_ctr(&self) -> u32 {
        self.hb_ctr
    }

    /// One heartbeat tick. Returns whether anything was sent.
    pub fn heartbeat(&mut self, db_size: u64) -> bool {
        if self.hb_ctr == 0 {
            return false;
        }
        self.hb_ctr -= 1;

        let heartbeat = Message::Heartbeat { peers: self.agents() }.encode();
        let stats = Message::Stats { addr: self.addr, db_size }.encode();
        for peer in self.agents.iter().filter(|p| **p != self.addr) {
            for frame in [&heartbeat, &stats] {
                if let Err(e) = self.transport.push(*peer, frame.clone()) {
                    tracing::warn!(%peer, error = %e, "heartbeat not delivered");
                }
            }
        }
        true
    }

    pub fn record_stats(&mut self, addr: Address, db_size: u64) {
        self.db_sizes.insert(addr, db_size);
    }

    pub fn db_sizes(&self) -> &BTreeMap<Address, u64> {
        &self.db_sizes
    }

    // -- Sending --------------------------------------------------------------

    pub fn send(&self, to: Address, msg: &Message) -> Result<()> {
        self.transport.push(to, msg.encode())
    }

    pub fn request(&self, to: Address, msg: &Message, timeout: Duration) -> Result<Reply> {
        let bytes = self.transport.request(to, msg.encode(), timeout)?;
        Reply::decode(&bytes)?.into_result()
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }
}
