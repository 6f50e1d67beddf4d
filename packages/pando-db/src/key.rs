//! Database keys.
//!
//! A key is `(chain_info, b, c)` ordered lexicographically. `chain_info`
//! usually packs `(domain: u32, kind: u16, flag: u16)`; `b` and `c` are
//! vertex-like ids. Keys with the top bit of `chain_info` set are random
//! keys: the producer did not pick one, so they never take part in graph
//! construction.

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Vertex id type (`b` / `c`).
pub type VertexId = i64;

/// Graph namespace (`chain_info` of an edge key).
pub type GraphId = u64;

pub const RANDOM_KEY_BIT: u64 = 1 << 63;

/// Sentinel for "no key supplied yet".
pub const INITIAL_KEY: DbKey = DbKey { chain_info: RANDOM_KEY_BIT, b: -1, c: -1 };

/// Key whose owner acts as barrier synchronizer.
pub const SYNC_KEY: DbKey = DbKey { chain_info: 0, b: 0, c: 0 };

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct DbKey {
    pub chain_info: u64,
    pub b: VertexId,
    pub c: VertexId,
}

impl DbKey {
    pub const fn new(chain_info: u64, b: VertexId, c: VertexId) -> Self {
        Self { chain_info, b, c }
    }

    pub fn is_random(&self) -> bool {
        self.chain_info & RANDOM_KEY_BIT != 0
    }

    /// Key of the vertex `(chain_info, b)`; `c` is zeroed.
    pub fn vertex_key(&self) -> DbKey {
        DbKey::new(self.chain_info, self.b, 0)
    }

    pub fn to_bytes(&self) -> [u8; 24] {
        let mut out = [0u8; 24];
        out[0..8].copy_from_slice(&self.chain_info.to_le_bytes());
        out[8..16].copy_from_slice(&self.b.to_le_bytes());
        out[16..24].copy_from_slice(&self.c.to_le_bytes());
        out
    }

    /// Hash used for ring ownership.
    ///
    /// Ignores `c`, so every out edge of a vertex lands on the vertex owner.
    pub fn owner_hash(&self) -> u64 {
        let hash = blake3::hash(&self.vertex_key().to_bytes());
        let mut word = [0u8; 8];
        word.copy_from_slice(&hash.as_bytes()[0..8]);
        u64::from_le_bytes(word)
    }
}

impl fmt::Display for DbKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.chain_info, self.b, self.c)
    }
}

// ── chain_info packing ──────────────────────────────────────────────

pub fn pack_chain_info(domain: u32, kind: u16, flag: u16) -> u64 {
    (u64::from(domain) << 32) | (u64::from(kind) << 16) | u64::from(flag)
}

pub fn unpack_chain_info(chain_info: u64) -> (u32, u16, u16) {
    ((chain_info >> 32) as u32, (chain_info >> 16) as u16, chain_info as u16)
}

/// Domain ids (upper 32 bits of `chain_info`).
pub mod chain {
    pub const BTC: u32 = 0;
    pub const ZEC: u32 = 1;
    pub const ETH: u32 = 2;
    pub const XMR: u32 = 3;
    pub const USD: u32 = 4;
    pub const DGB: u32 = 5;
    pub const DOGE: u32 = 6;
    pub const BCH: u32 = 7;
    pub const POLY: u32 = 8;
    pub const DASH: u32 = 9;
    pub const LTC: u32 = 10;

    const TAGS: &[(&str, u32)] = &[
        ("BTC", BTC),
        ("ZEC", ZEC),
        ("ETH", ETH),
        ("XMR", XMR),
        ("USD", USD),
        ("DGB", DGB),
        ("DOGE", DOGE),
        ("BCH", BCH),
        ("POLY", POLY),
        ("DASH", DASH),
        ("LTC", LTC),
    ];

    /// Domain id for a chain tag such as `"BTC"`.
    pub fn from_tag(tag: &str) -> Option<u32> {
        TAGS.iter().find(|(t, _)| *t == tag).map(|(_, id)| *id)
    }
}

/// Record kinds (middle 16 bits of `chain_info`).
pub mod kind {
    pub const TX_IN_EDGE: u16 = 0;
    pub const TX_OUT_EDGE: u16 = 1;
    pub const UTXO_EDGE: u16 = 2;
    pub const UTXO_STATS: u16 = 3;
    pub const TXTIME: u16 = 4;
    pub const DISTANCE: u16 = 5;
    pub const BFS_INITIAL_VALUE: u16 = 6;
    pub const EXCHANGE_RATE: u16 = 7;
    pub const OUT_VAL: u16 = 8;
    pub const OUT_VAL_ROUNDED: u16 = 9;
    pub const VOUT_ADDR: u16 = 13;
    pub const BLOCK_NUMBER_LOOKUP: u16 = 14;
    pub const TX: u16 = 15;
    pub const ADDR: u16 = 16;

    /// Flags (low 16 bits).
    pub const NOT_UTXO: u16 = 0;
    pub const UTXO: u16 = 1;
}

// ── RandomKeyGen ────────────────────────────────────────────────────

/// Generates random keys for entries whose producer supplied none.
pub struct RandomKeyGen {
    rng: StdRng,
}

impl RandomKeyGen {
    /// Seed from the agent serial and the wall clock so colocated agents
    /// do not collide.
    pub fn new(agent_serial: u64) -> Self {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0);
        Self::with_seed(agent_serial.rotate_left(32) ^ (nanos & 0xffff_ffff))
    }

    pub fn with_seed(seed: u64) -> Self {
        Self { rng: StdRng::seed_from_u64(seed) }
    }

    pub fn next_key(&mut self) -> DbKey {
        DbKey::new(RANDOM_KEY_BIT | self.rng.gen::<u64>(), self.rng.gen(), self.rng.gen())
    }

    /// Replace the unassigned sentinel with a fresh random key.
    pub fn assign(&mut self, key: DbKey) -> DbKey {
        if key == INITIAL_KEY {
            self.next_key()
        } else {
            key
        }
    }
}
