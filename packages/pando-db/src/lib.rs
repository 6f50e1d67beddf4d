//! Pando - shard-partitioned key/value store with fixed-point filters
//!
//! Entries are `{key, tags, value}` records. Each agent owns the keys the
//! consistent hash ring assigns to it and runs installed filters over its
//! shard until nothing changes; a graph stage then runs vertex programs
//! over the entry graph in synchronized rounds.
//!
//! Layers, bottom up:
//! - `seq_db`: single-node store, staging and the filter fixed point
//! - `alg_db`: single-node GAS graph engine on top of `seq_db`
//! - `par_db`: the agent, its barrier protocol and the distributed graph stage
//! - `client`: request/reply access to a running mesh

pub mod address;
pub mod alg_db;
pub mod client;
pub mod config;
pub mod entry;
pub mod error;
pub mod filter;
pub mod filters;
pub mod key;
pub mod mesh;
pub mod par_db;
pub mod resource;
pub mod ring;
pub mod seq_db;
pub mod transport;
pub mod wire;

pub use address::Address;
pub use alg_db::AlgDb;
pub use client::ParDbClient;
pub use config::{AgentArgs, AgentConfig};
pub use entry::DbEntry;
pub use error::{PandoError, Result};
pub use filter::{Filter, FilterCatalog};
pub use key::DbKey;
pub use par_db::{spawn_agent, AgentHandle, DbState, ParDb};
pub use ring::ConsistentHashRing;
pub use seq_db::SeqDb;
pub use transport::{MemoryTransport, TcpTransport, Transport};
