//! Hop distance over the transaction out-edge graph.
//!
//! Runs on graph `pack(chain, TX_OUT_EDGE, NOT_UTXO)`. A vertex starts from
//! the value stored at `{pack(chain, BFS_INITIAL_VALUE, 0), v, 0}` (decimal,
//! [`UNREACHED`] when absent) and keeps the smallest distance it hears of.
//! The result lives at `{pack(chain, DISTANCE, 0), v, 0}`, tagged
//! `{<CHAIN>, "TX_DISTANCE"}`.
//!
//! A vertex with out edges is done once every out edge carries
//! `<name>:done`; a sink is done once its result entry exists.

use super::done_tag;
use crate::alg_db::{GasProgram, GasVertex, GroupAccess};
use crate::error::Result;
use crate::filter::{GroupFilter, VertexProgram};
use crate::key::{kind, pack_chain_info, DbKey, GraphId, VertexId};

pub const UNREACHED: u64 = u64::MAX;

pub struct TxSubgraphSearch {
    name: String,
    chain_tag: &'static str,
    chain_id: u32,
    graph: GraphId,
    done: String,
}

impl TxSubgraphSearch {
    pub fn new(chain_tag: &'static str, chain_id: u32) -> Self {
        let name = format!("{}_tx_subgraph_search", chain_tag);
        Self {
            done: done_tag(&name),
            name,
            chain_tag,
            chain_id,
            graph: pack_chain_info(chain_id, kind::TX_OUT_EDGE, kind::NOT_UTXO),
        }
    }

    fn result_key(&self, vtx: VertexId) -> DbKey {
        DbKey::new(pack_chain_info(self.chain_id, kind::DISTANCE, 0), vtx, 0)
    }
}

impl GroupFilter for TxSubgraphSearch {
    fn name(&self) -> &str {
        &self.name
    }

    fn should_run(&self, access: &GroupAccess<'_>) -> Result<bool> {
        if access.graph() != self.graph {
            return Ok(false);
        }
        let edges = access.out_edges();
        if edges.is_empty() {
            return Ok(access.get_entry_by_key(&self.result_key(access.vtx()))?.is_none());
        }
        Ok(edges.iter().any(|e| !e.entry.has_tag(&self.done)))
    }

    fn init(&self, access: &mut GroupAccess<'_>) -> Result<Box<dyn VertexProgram>> {
        Ok(Box::new(GasVertex::new(TxDistance {
            chain_tag: self.chain_tag,
            seed_key: DbKey::new(pack_chain_info(self.chain_id, kind::BFS_INITIAL_VALUE, 0), access.vtx(), 0),
            result_key: self.result_key(access.vtx()),
            done: self.done.clone(),
        })))
    }
}

/// Per-vertex BFS state.
pub struct TxDistance {
    chain_tag: &'static str,
    seed_key: DbKey,
    result_key: DbKey,
    done: String,
}

fn parse_distance(raw: Option<Vec<u8>>, key: &DbKey) -> Option<u64> {
    let raw = raw?;
    match std::str::from_utf8(&raw).ok().and_then(|s| s.trim().parse().ok()) {
        Some(d) => Some(d),
        None => {
            tracing::warn!(%key, "ignoring non-numeric distance");
            None
        }
    }
}

impl GasProgram for TxDistance {
    type Msg = u64;
    type Value = u64;

    fn gather(&self, a: u64, b: u64) -> u64 {
        a.min(b)
    }

    fn apply(&self, value: u64, gathered: u64) -> u64 {
        value.min(gathered)
    }

    fn scatter(&self, value: u64) -> u64 {
        value.saturating_add(1)
    }

    fn gather_init(&self, _access: &GroupAccess<'_>) -> u64 {
        UNREACHED
    }

    fn init(&mut self, access: &mut GroupAccess<'_>) -> Result<u64> {
        let seed = parse_distance(access.get_entry_by_key(&self.seed_key)?, &self.seed_key).unwrap_or(UNREACHED);
        let existing = access.get_entry_by_key(&self.result_key)?;
        if existing.is_none() {
            access.make_new_entry([self.chain_tag, "TX_DISTANCE"], seed.to_string(), self.result_key);
            return Ok(seed);
        }
        // A rerun resumes from the stored distance.
        Ok(parse_distance(existing, &self.result_key).map_or(seed, |d| d.min(seed)))
    }

    fn save_output(&mut self, access: &mut GroupAccess<'_>, value: u64) -> Result<()> {
        access.update_value(self.result_key, value.to_string());
        for edge in access.out_edges() {
            access.add_tag(edge.key(), self.done.clone());
        }
        Ok(())
    }
}
