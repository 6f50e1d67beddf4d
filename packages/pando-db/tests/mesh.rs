//! Integration test: a three-agent mesh over the in-memory transport.
//!
//! Covers:
//! - membership convergence and ring agreement
//! - owner placement of client writes and forwarded writes
//! - the distributed fixed point (single-entry filters) under barriers
//! - subscriptions that wait on entries owned by another agent
//! - the distributed graph stage (BFS distance)
//! - text ingestion, export and distributed import

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use pando::filter::{EntryAccess, Filter, SingleEntryFilter};
use pando::filters::UNREACHED;
use pando::key::{chain, kind, pack_chain_info};
use pando::wire::{Message, Reply};
use pando::{
    spawn_agent, Address, AgentConfig, AgentHandle, ConsistentHashRing, DbEntry, DbKey, FilterCatalog,
    MemoryTransport, ParDbClient,
};
use serde_json::json;
use tempfile::TempDir;

const VAGENTS: u16 = 20;
const RUN_TIMEOUT: Duration = Duration::from_secs(30);

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

struct Mesh {
    hub: MemoryTransport,
    agents: Vec<AgentHandle>,
}

impl Mesh {
    fn start(n: usize) -> Self {
        Self::with_catalog(n, FilterCatalog::builtin())
    }

    fn with_catalog(n: usize, catalog: FilterCatalog) -> Self {
        let hub = MemoryTransport::new();
        let catalog = Arc::new(catalog);
        let mut agents = Vec::new();
        for i in 0..n {
            let config = AgentConfig {
                bind: Address::local(i as u16 * 10),
                seed: if i == 0 { None } else { Some(Address::local(0)) },
                memory_gb: Some(0.5),
                virtual_agents: VAGENTS,
                heartbeat_interval_ms: 10,
                poll_timeout_ms: 10,
                ..AgentConfig::default()
            };
            agents.push(spawn_agent(&config, Arc::new(hub.clone()), Arc::clone(&catalog)).unwrap());
        }

        let mesh = Self { hub, agents };
        let client = mesh.client();
        eventually("membership converges", || {
            mesh.addrs().iter().all(|a| client.num_neighbors(*a).unwrap() == n as u64)
        });
        mesh
    }

    fn addrs(&self) -> Vec<Address> {
        self.agents.iter().map(AgentHandle::addr).collect()
    }

    fn client(&self) -> ParDbClient {
        ParDbClient::new(Arc::new(self.hub.clone()), Address::local(0)).with_virtual_agents(VAGENTS)
    }

    fn ring(&self) -> ConsistentHashRing {
        let mut ring = ConsistentHashRing::new(VAGENTS);
        ring.update_agents(&self.addrs());
        ring
    }

    /// Run to completion from the client's point of view.
    fn process(&self, client: &mut ParDbClient) {
        client.process().unwrap();
        client.wait_idle(RUN_TIMEOUT).unwrap();
        for addr in self.addrs() {
            eventually("agent back in PRELOAD", || client.state(addr).unwrap() == "PRELOAD");
        }
    }
}

impl Drop for Mesh {
    fn drop(&mut self) {
        for agent in self.agents.drain(..) {
            let _ = agent.shutdown();
        }
    }
}

fn eventually(what: &str, mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting: {}", what);
        thread::sleep(Duration::from_millis(10));
    }
}

fn btc_block(txids: &[String]) -> String {
    let txs: Vec<_> = txids.iter().map(|id| json!({ "txid": id })).collect();
    json!({ "tx": txs }).to_string()
}

fn txid(i: u32) -> String {
    format!("{:015x}{}", 0xabc000 + i, "0".repeat(49))
}

const WAITER: u64 = 1;
const PRODUCER: u64 = 2;
const PEER: u64 = 9;

/// Copies the value of `{PEER, b, 0}` into the waiter once that entry exists.
struct WaitForPeer;

impl SingleEntryFilter for WaitForPeer {
    fn name(&self) -> &str {
        "wait_for_peer"
    }

    fn should_run(&self, entry: &DbEntry) -> bool {
        entry.has_tag("waiter") && !entry.has_tag("wait:done") && !entry.has_tag("wait:inactive")
    }

    fn run(&self, access: &mut EntryAccess<'_>) -> pando::Result<()> {
        let peer = DbKey::new(PEER, access.key().b, 0);
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

/// Creates `{PEER, b, 0}` one round after it first sees the producer entry.
struct DelayedProduce;

impl SingleEntryFilter for DelayedProduce {
    fn name(&self) -> &str {
        "delayed_produce"
    }

    fn should_run(&self, entry: &DbEntry) -> bool {
        entry.has_tag("producer") && !entry.has_tag("produce:done")
    }

    fn run(&self, access: &mut EntryAccess<'_>) -> pando::Result<()> {
        if !access.has_tag("produce:armed") {
            access.add_tag("produce:armed");
            return Ok(());
        }
        let key = DbKey::new(PEER, access.key().b, 0);
        access.make_new_entry(["peer"], format!("peer {}", key.b), key);
        access.add_tag("produce:done");
        Ok(())
    }
}

fn waiting_catalog() -> FilterCatalog {
    let mut catalog = FilterCatalog::builtin();
    catalog.register_bundle("waiting", vec![Filter::single(WaitForPeer), Filter::single(DelayedProduce)]);
    catalog
}

// ---------------------------------------------------------------------------
// Tests: Membership and placement
// ---------------------------------------------------------------------------

#[test]
fn mesh_converges_on_one_ring() {
    let mesh = Mesh::start(3);
    let client = mesh.client();
    for addr in mesh.addrs() {
        assert_eq!(client.ring_size(addr).unwrap(), 3 * VAGENTS as u64);
        assert_eq!(client.state(addr).unwrap(), "PRELOAD");
        assert!(!client.processing(addr).unwrap());
    }
    assert_eq!(client.neighbors().unwrap(), mesh.addrs());
}

#[test]
fn client_writes_land_on_owner() {
    let mesh = Mesh::start(3);
    let mut client = mesh.client();
    let ring = mesh.ring();

    for b in 0..30 {
        client.add_entry(DbEntry::new(DbKey::new(7, b, 0), ["placed"], b.to_string())).unwrap();
    }
    assert_eq!(client.total_size().unwrap(), 30);

    for addr in mesh.addrs() {
        for entry in client.get_entries(addr).unwrap() {
            assert_eq!(ring.lookup_key(&entry.key()).unwrap(), addr, "{} misplaced", entry.key());
        }
    }
    let key = DbKey::new(7, 12, 0);
    assert_eq!(client.get_entry_by_key(key).unwrap(), Some(b"12".to_vec()));
    assert_eq!(client.get_entry_by_key(DbKey::new(7, 99, 0)).unwrap(), None);
}

#[test]
fn preload_writes_to_non_owner_are_forwarded() {
    let mesh = Mesh::start(3);
    let client = mesh.client();
    let ring = mesh.ring();

    // Find a key agent 0 does not own and hand it to agent 0 anyway.
    let key = (0..)
        .map(|b| DbKey::new(3, b, 1))
        .find(|k| ring.lookup_key(k).unwrap() != Address::local(0))
        .unwrap();
    let owner = ring.lookup_key(&key).unwrap();
    let entry = DbEntry::new(key, ["forwarded"], "v");
    assert_eq!(client.call(Address::local(0), &Message::AddEntry { entry }).unwrap(), Reply::Ack);

    eventually("forwarded entry lands", || client.db_size(owner).unwrap() == 1);
    assert_eq!(client.db_size(Address::local(0)).unwrap(), 0);
}

// ---------------------------------------------------------------------------
// Tests: Processing
// ---------------------------------------------------------------------------

#[test]
fn fixed_point_splits_blocks_across_agents() {
    let mesh = Mesh::start(3);
    let mut client = mesh.client();
    client.install_filter("BTC_block_to_tx").unwrap();
    for addr in mesh.addrs() {
        assert_eq!(client.installed_filters(addr).unwrap(), ["BTC_block_to_tx"]);
    }

    let txids: Vec<String> = (0..40).map(txid).collect();
    for (i, chunk) in txids.chunks(8).enumerate() {
        client.add_entry(DbEntry::new(DbKey::new(1, i as i64, 0), ["BTC", "block"], btc_block(chunk))).unwrap();
    }

    mesh.process(&mut client);

    let txs = client.query_all(&["BTC", "tx"]).unwrap();
    assert_eq!(txs.len(), 40);
    let ring = mesh.ring();
    let tx_owners: std::collections::BTreeSet<_> =
        txs.iter().map(|e| ring.lookup_key(&e.key()).unwrap()).collect();
    assert!(tx_owners.len() > 1, "transactions should spread over the mesh");

    assert_eq!(client.query_all(&["BTC_block_to_tx:done"]).unwrap().len(), 5);
    assert_eq!(client.total_size().unwrap(), 45);

    // A second run has nothing left to do.
    mesh.process(&mut client);
    assert_eq!(client.total_size().unwrap(), 45);
}

#[test]
fn subscriptions_wake_waiters_across_agents() {
    let mesh = Mesh::with_catalog(3, waiting_catalog());
    let mut client = mesh.client();
    client.add_filter_dir("waiting").unwrap();
    client.install_filter("wait_for_peer").unwrap();
    client.install_filter("delayed_produce").unwrap();

    let ring = mesh.ring();
    let mut remote_waits = 0;
    for b in 0..40 {
        let waiter = DbKey::new(WAITER, b, 0);
        client.add_entry(DbEntry::new(waiter, ["waiter"], "")).unwrap();
        client.add_entry(DbEntry::new(DbKey::new(PRODUCER, b, 0), ["producer"], "")).unwrap();
        if ring.lookup_key(&waiter).unwrap() != ring.lookup_key(&DbKey::new(PEER, b, 0)).unwrap() {
            remote_waits += 1;
        }
    }
    assert!(remote_waits > 0, "some waiters should depend on another agent");

    mesh.process(&mut client);

    assert_eq!(client.query_all(&["waiter", "wait:done"]).unwrap().len(), 40);
    assert!(client.query_all(&["wait:inactive"]).unwrap().is_empty());
    assert_eq!(client.query_all(&["peer"]).unwrap().len(), 40);
    for b in 0..40 {
        let value = client.get_entry_by_key(DbKey::new(WAITER, b, 0)).unwrap();
        assert_eq!(value, Some(format!("peer {}", b).into_bytes()), "waiter {}", b);
    }
}

#[test]
fn process_is_rejected_while_running_or_repeats_cleanly() {
    let mesh = Mesh::start(2);
    let mut client = mesh.client();
    client.install_filter("BTC_block_to_tx").unwrap();
    client.add_entry(DbEntry::new(DbKey::new(1, 1, 0), ["BTC", "block"], btc_block(&[txid(1)]))).unwrap();

    client.process().unwrap();
    // Either still running (rejected) or already finished (accepted).
    let _ = client.process();
    client.wait_idle(RUN_TIMEOUT).unwrap();
    for addr in mesh.addrs() {
        eventually("agent back in PRELOAD", || client.state(addr).unwrap() == "PRELOAD");
    }
    assert_eq!(client.query_all(&["BTC", "tx"]).unwrap().len(), 1);
}

#[test]
fn distributed_bfs_distances() {
    let mesh = Mesh::start(3);
    let mut client = mesh.client();
    client.install_filter("BTC_tx_subgraph_search").unwrap();

    let graph = pack_chain_info(chain::BTC, kind::TX_OUT_EDGE, kind::NOT_UTXO);
    // 1 -> 2 -> 4, 1 -> 3 -> 5, 6 -> 7 (unseeded)
    for (src, dst) in [(1, 2), (1, 3), (2, 4), (3, 5), (6, 7)] {
        client.add_entry(DbEntry::new(DbKey::new(graph, src, dst), ["BTC", "edge"], "")).unwrap();
    }
    let seed = DbKey::new(pack_chain_info(chain::BTC, kind::BFS_INITIAL_VALUE, 0), 1, 0);
    client.add_entry(DbEntry::new(seed, ["BTC", "seed"], "0")).unwrap();

    mesh.process(&mut client);

    let distance_kind = pack_chain_info(chain::BTC, kind::DISTANCE, 0);
    let unreached = UNREACHED.to_string();
    let unreached = unreached.as_str();
    for (vtx, expected) in [(1, "0"), (2, "1"), (3, "1"), (4, "2"), (5, "2"), (6, unreached), (7, unreached)] {
        let value = client.get_entry_by_key(DbKey::new(distance_kind, vtx, 0)).unwrap();
        assert_eq!(value.as_deref(), Some(expected.as_bytes()), "vertex {}", vtx);
    }
    assert_eq!(client.query_all(&["BTC_tx_subgraph_search:done"]).unwrap().len(), 5);
    assert!(client.query_all(&["MERGED"]).unwrap().is_empty());
}

#[test]
fn skip_group_filters_skips_graph_stage() {
    let hub = MemoryTransport::new();
    let config = AgentConfig {
        memory_gb: Some(0.5),
        virtual_agents: VAGENTS,
        skip_group_filters: true,
        heartbeat_interval_ms: 10,
        poll_timeout_ms: 10,
        ..AgentConfig::default()
    };
    let agent = spawn_agent(&config, Arc::new(hub.clone()), Arc::new(FilterCatalog::builtin())).unwrap();
    let mut client = ParDbClient::new(Arc::new(hub), agent.addr()).with_virtual_agents(VAGENTS);
    client.install_filter("BTC_tx_subgraph_search").unwrap();
    let graph = pack_chain_info(chain::BTC, kind::TX_OUT_EDGE, kind::NOT_UTXO);
    client.add_entry(DbEntry::new(DbKey::new(graph, 1, 2), ["BTC"], "")).unwrap();

    client.process().unwrap();
    client.wait_idle(RUN_TIMEOUT).unwrap();
    assert!(client.query_all(&["TX_DISTANCE"]).unwrap().is_empty());
    agent.shutdown().unwrap();
}

// ---------------------------------------------------------------------------
// Tests: Files
// ---------------------------------------------------------------------------

#[test]
fn db_file_ingest_then_process() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("blocks.txt");
    let mut text = String::new();
    for i in 0..4 {
        text.push_str(&format!("TAGS\nBTC\nblock\nVALUE\n{}\nEND\n", btc_block(&[txid(i * 2), txid(i * 2 + 1)])));
    }
    std::fs::write(&path, text).unwrap();

    let mesh = Mesh::start(3);
    let mut client = mesh.client();
    client.install_filter("BTC_block_to_tx").unwrap();
    assert_eq!(client.add_db_file(path.to_str().unwrap()).unwrap(), 4);
    eventually("ingested blocks land", || client.total_size().unwrap() == 4);

    mesh.process(&mut client);
    assert_eq!(client.query_all(&["BTC", "tx"]).unwrap().len(), 8);
}

#[test]
fn export_then_import_into_new_mesh() {
    let dir = TempDir::new().unwrap();
    let dir_str = dir.path().to_str().unwrap().to_string();
    let mut keys = Vec::new();

    {
        let mesh = Mesh::start(3);
        let mut client = mesh.client();
        for b in 0..24 {
            let key = DbKey::new(5, b, b + 1);
            client.add_entry(DbEntry::new(key, ["exported"], format!("value {}", b))).unwrap();
            keys.push(key);
        }
        client.export_db(&dir_str).unwrap();
    }
    let files = std::fs::read_dir(dir.path()).unwrap().count();
    assert_eq!(files, 3);

    let mesh = Mesh::start(2);
    let client = mesh.client();
    assert_eq!(client.import_db(&dir_str).unwrap(), 3);
    eventually("imported entries land", || client.total_size().unwrap() == 24);

    let ring = mesh.ring();
    for (b, key) in keys.iter().enumerate() {
        assert_eq!(client.get_entry_by_key(*key).unwrap(), Some(format!("value {}", b).into_bytes()));
        let owner = ring.lookup_key(key).unwrap();
        assert!(client.get_entries(owner).unwrap().iter().any(|e| e.key() == *key));
    }
}
