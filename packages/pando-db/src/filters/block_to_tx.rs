//! Split a block entry into one entry per transaction.
//!
//! Input: an entry tagged `{<CHAIN>, "block"}` whose value is the block
//! JSON with a `tx` array. Output per transaction:
//!
//! ```text
//! key   {pack(chain, TX, 0), hex(txid[0..15]), 0}
//! tags  {<CHAIN>, "tx", "txid=<txid>"}
//! value {"tx": <tx object>}
//! ```
//!
//! The block is tagged `<name>:done`, or `<name>:fail` when the JSON does
//! not have that shape; a failed block emits no transactions.

use serde_json::{json, Value};

use super::{done_tag, fail_tag};
use crate::entry::DbEntry;
use crate::error::Result;
use crate::filter::{EntryAccess, SingleEntryFilter};
use crate::key::{kind, pack_chain_info, DbKey, VertexId};

const TXID_KEY_DIGITS: usize = 15;

pub struct BlockToTx {
    name: String,
    chain_tag: &'static str,
    chain_id: u32,
    done: String,
    fail: String,
}

impl BlockToTx {
    pub fn new(chain_tag: &'static str, chain_id: u32) -> Self {
        let name = format!("{}_block_to_tx", chain_tag);
        Self { done: done_tag(&name), fail: fail_tag(&name), name, chain_tag, chain_id }
    }

    fn tx_key(&self, txid: &str) -> Option<DbKey> {
        let prefix = txid.get(..TXID_KEY_DIGITS)?;
        let b = VertexId::from_str_radix(prefix, 16).ok()?;
        Some(DbKey::new(pack_chain_info(self.chain_id, kind::TX, 0), b, 0))
    }

    /// Everything the block yields, or the reason it yields nothing.
    fn split(&self, raw: &[u8]) -> std::result::Result<Vec<(DbKey, String, String)>, String> {
        let block: Value = serde_json::from_slice(raw).map_err(|e| format!("parse error: {}", e))?;
        let txs = match block.get("tx") {
            Some(Value::Array(txs)) => txs,
            Some(_) => return Err("tx is not an array".to_string()),
            None => return Err("no member \"tx\"".to_string()),
        };

        let mut out = Vec::with_capacity(txs.len());
        for tx in txs {
            if !tx.is_object() {
                return Err("tx is not an object".to_string());
            }
            let txid = match tx.get("txid") {
                Some(Value::String(id)) => id,
                Some(_) => return Err("txid is not a string".to_string()),
                None => return Err("no member \"txid\"".to_string()),
            };
            let key = self.tx_key(txid).ok_or_else(|| format!("txid {:?} is not hex", txid))?;
            let value = serde_json::to_string_pretty(&json!({ "tx": tx })).map_err(|e| e.to_string())?;
            out.push((key, format!("txid={}", txid), value));
        }
        Ok(out)
    }
}

impl SingleEntryFilter for BlockToTx {
    fn name(&self) -> &str {
        &self.name
    }

    fn should_run(&self, entry: &DbEntry) -> bool {
        entry.has_tag(self.chain_tag)
            && entry.has_tag("block")
            && !entry.has_tag(&self.done)
            && !entry.has_tag(&self.fail)
    }

    fn run(&self, access: &mut EntryAccess<'_>) -> Result<()> {
        match self.split(access.value()) {
            Ok(txs) => {
                for (key, txid_tag, value) in txs {
                    access.make_new_entry([self.chain_tag, "tx", txid_tag.as_str()], value, key);
                }
                access.add_tag(self.done.clone());
            }
            Err(reason) => {
                tracing::warn!(filter = %self.name, key = %access.key(), %reason, "unable to split block");
                access.add_tag(self.fail.clone());
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::{Filter, FilterCatalog, Mutation};
    use crate::key::chain;
    use crate::seq_db::{EntryStore, SeqDb};
    use std::sync::Arc;

    const TXID_A: &str = "4a5e1e4baab89f3a32518a88c31bc87f618f76673e2cc77ab2127b7afdeda33b";
    const TXID_B: &str = "0e3e2357e806b6cdb1f70b54c3a3a17b6714ee1f0e68bebb44a74b1efd512098";

    fn block(txids: &[&str]) -> String {
        let txs: Vec<_> = txids.iter().map(|id| json!({ "txid": id, "vout": [] })).collect();
        json!({ "hash": "00ab", "tx": txs }).to_string()
    }

    fn run_on(filter: &BlockToTx, entry: &DbEntry) -> Vec<Mutation> {
        let store = EntryStore::new();
        let mut out = Vec::new();
        let mut access = EntryAccess::new(entry, &store, &mut out);
        filter.run(&mut access).unwrap();
        out
    }

    #[test]
    fn test_should_run_tags() {
        let f = BlockToTx::new("BTC", chain::BTC);
        let key = DbKey::new(1, 1, 1);
        assert!(f.should_run(&DbEntry::new(key, ["BTC", "block"], "")));
        assert!(!f.should_run(&DbEntry::new(key, ["DOGE", "block"], "")));
        assert!(!f.should_run(&DbEntry::new(key, ["BTC"], "")));
        assert!(!f.should_run(&DbEntry::new(key, ["BTC", "block", "BTC_block_to_tx:done"], "")));
        assert!(!f.should_run(&DbEntry::new(key, ["BTC", "block", "BTC_block_to_tx:fail"], "")));
    }

    #[test]
    fn test_splits_block() {
        let f = BlockToTx::new("BTC", chain::BTC);
        let entry = DbEntry::new(DbKey::new(1, 1, 1), ["BTC", "block"], block(&[TXID_A, TXID_B]));
        let out = run_on(&f, &entry);
        assert_eq!(out.len(), 3);

        match &out[0] {
            Mutation::AddEntry(tx) => {
                let expected_b = VertexId::from_str_radix(&TXID_A[..15], 16).unwrap();
                assert_eq!(tx.key(), DbKey::new(pack_chain_info(chain::BTC, kind::TX, 0), expected_b, 0));
                assert!(tx.has_tag("BTC") && tx.has_tag("tx"));
                assert!(tx.has_tag(&format!("txid={}", TXID_A)));
                let value: Value = serde_json::from_slice(tx.value()).unwrap();
                assert_eq!(value["tx"]["txid"], TXID_A);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(out[2], Mutation::AddTag { key: entry.key(), tag: "BTC_block_to_tx:done".into() });
    }

    #[test]
    fn test_malformed_blocks_fail() {
        let f = BlockToTx::new("DOGE", chain::DOGE);
        for raw in [
            "not json".to_string(),
            json!({ "hash": "00" }).to_string(),
            json!({ "tx": {} }).to_string(),
            json!({ "tx": [1] }).to_string(),
            json!({ "tx": [{ "txid": 7 }] }).to_string(),
            json!({ "tx": [{ "txid": "zz" }] }).to_string(),
        ] {
            let entry = DbEntry::new(DbKey::new(1, 1, 1), ["DOGE", "block"], raw.clone());
            let out = run_on(&f, &entry);
            assert_eq!(
                out,
                vec![Mutation::AddTag { key: entry.key(), tag: "DOGE_block_to_tx:fail".into() }],
                "input {}",
                raw
            );
        }
    }

    #[test]
    fn test_fixed_point_runs_once() {
        let mut catalog = FilterCatalog::new();
        catalog.register_bundle("chain", vec![Filter::single(BlockToTx::new("BTC", chain::BTC))]);
        let mut db = SeqDb::new(Arc::new(catalog));
        db.add_filter_dir("chain").unwrap();
        db.install_filter("BTC_block_to_tx").unwrap();
        db.add_entry(DbEntry::new(DbKey::new(1, 1, 1), ["BTC", "block"], block(&[TXID_A, TXID_B]))).unwrap();

        assert_eq!(db.process().unwrap(), 2);
        assert_eq!(db.query(&["BTC", "tx"]).len(), 2);
        assert_eq!(db.query(&["BTC_block_to_tx:done"]).len(), 1);
        assert_eq!(db.size(), 3);
    }
}
