//! Consistent hash ring: key hash -> owning agent.
//!
//! Every physical agent contributes `vagents` virtual positions; a
//! position is the blake3 hash of the agent serial tagged with the
//! virtual id. A key belongs to the first position at or after its hash,
//! wrapping at the end of the ring. Agents holding the same membership
//! view compute the same owner for every key.

use crate::address::{pack_agent, Address, STARTING_VAGENTS};
use crate::error::{PandoError, Result};
use crate::key::DbKey;

fn position_hash(packed_agent: u64) -> u64 {
    let hash = blake3::hash(&packed_agent.to_le_bytes());
    let mut word = [0u8; 8];
    word.copy_from_slice(&hash.as_bytes()[0..8]);
    u64::from_le_bytes(word)
}

/// One ring slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Position {
    hash: u64,
    /// Agent serial tagged with the virtual id.
    packed: u64,
    agent: Address,
}

#[derive(Debug, Clone)]
pub struct ConsistentHashRing {
    positions: Vec<Position>,
    vagents: u16,
}

impl Default for ConsistentHashRing {
    fn default() -> Self {
        Self::new(STARTING_VAGENTS)
    }
}

impl ConsistentHashRing {
    /// Create an empty ring with `vagents` virtual positions per agent.
    pub fn new(vagents: u16) -> Self {
        Self { positions: Vec::new(), vagents: vagents.max(1) }
    }

    /// Rebuild from the full membership list.
    pub fn update_agents(&mut self, agents: &[Address]) {
        let mut positions = Vec::with_capacity(agents.len() * self.vagents as usize);
        for agent in agents {
            for vid in 0..self.vagents {
                let packed = pack_agent(agent.serial(), vid);
                positions.push(Position { hash: position_hash(packed), packed, agent: *agent });
            }
        }
        // Ties on hash are broken by the packed id so every agent sorts alike.
        positions.sort_unstable_by_key(|p| (p.hash, p.packed));
        positions.dedup_by_key(|p| p.packed);
        self.positions = positions;
    }

    /// Owner of a 64-bit hash.
    pub fn lookup(&self, hash: u64) -> Result<Address> {
        if self.positions.is_empty() {
            return Err(PandoError::EmptyRing);
        }
        let idx = self.positions.partition_point(|p| p.hash < hash);
        let pos = self.positions.get(idx).unwrap_or(&self.positions[0]);
        Ok(pos.agent)
    }

    /// Owner of a key (see [`DbKey::owner_hash`]).
    pub fn lookup_key(&self, key: &DbKey) -> Result<Address> {
        self.lookup(key.owner_hash())
    }

    pub fn ring_size(&self) -> usize {
        self.positions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn agents(n: u16) -> Vec<Address> {
        (0..n).map(|i| Address::local(i * 3)).collect()
    }

    #[test]
    fn test_empty_ring_fails() {
        let ring = ConsistentHashRing::default();
        assert!(matches!(ring.lookup(5), Err(PandoError::EmptyRing)));
    }

    #[test]
    fn test_ring_size() {
        let mut ring = ConsistentHashRing::new(10);
        ring.update_agents(&agents(3));
        assert_eq!(ring.ring_size(), 30);
    }

    #[test]
    fn test_rebuild_is_deterministic() {
        let members = agents(4);
        let mut a = ConsistentHashRing::default();
        let mut b = ConsistentHashRing::default();
        a.update_agents(&members);
        b.update_agents(&members);
        a.update_agents(&members);

        for h in (0..10_000u64).map(|i| i.wrapping_mul(0x9e37_79b9_7f4a_7c15)) {
            assert_eq!(a.lookup(h).unwrap(), b.lookup(h).unwrap());
        }
    }

    #[test]
    fn test_membership_order_does_not_matter() {
        let members = agents(5);
        let mut reversed = members.clone();
        reversed.reverse();

        let mut a = ConsistentHashRing::default();
        let mut b = ConsistentHashRing::default();
        a.update_agents(&members);
        b.update_agents(&reversed);
        for i in 0..1000 {
            let key = DbKey::new(i, i as i64, 0);
            assert_eq!(a.lookup_key(&key).unwrap(), b.lookup_key(&key).unwrap());
        }
    }

    #[test]
    fn test_wraps_past_last_position() {
        let mut ring = ConsistentHashRing::new(4);
        ring.update_agents(&agents(2));
        let first = ring.lookup(0).unwrap();
        assert_eq!(ring.lookup(u64::MAX).unwrap(), first);
    }

    #[test]
    fn test_load_spread() {
        let mut ring = ConsistentHashRing::default();
        let members = agents(4);
        ring.update_agents(&members);

        let mut counts: HashMap<Address, usize> = HashMap::new();
        for i in 0..8000i64 {
            *counts.entry(ring.lookup_key(&DbKey::new(1, i, 0)).unwrap()).or_default() += 1;
        }
        assert_eq!(counts.len(), 4);
        for count in counts.values() {
            assert!(*count > 800, "unbalanced ring: {:?}", counts);
        }
    }
}
