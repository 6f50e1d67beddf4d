//! Agent addresses.
//!
//! An address is an IPv4 endpoint plus a small slot number. The slot picks
//! the TCP port (`START_PORT + slot`) and lets colocated sub-services live
//! next to an agent: the map service at `slot + 1` and the by-key responder
//! at `slot + 2`. Agents on one host are therefore spaced three slots apart.
//!
//! Serialized form (u64):
//! ```text
//! bits 0..16   slot
//! bits 16..48  IPv4 (big-endian octet order)
//! bits 49..64  virtual agent id (ring positions only)
//! ```

use std::fmt;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::PandoError;

// ── Constants ───────────────────────────────────────────────────────

/// Port of slot 0.
pub const START_PORT: u16 = 17200;

/// Publisher offset kept for parity with peers that split pub/pull sockets.
pub const PUB_OFFSET: u16 = 100;
pub const PULL_OFFSET: u16 = 200;

/// Exclusive upper bound of the user-visible slot id.
pub const MAX_SLOT_ID: u16 = 200;

/// Virtual ring positions per physical agent.
pub const STARTING_VAGENTS: u16 = 100;

pub const MAP_LOCALNUM_OFFSET: u16 = 1;
pub const RESPONDER_LOCALNUM_OFFSET: u16 = 2;

const VIRTUAL_SHIFT: u32 = 49;
const AGENT_MASK: u64 = (1u64 << VIRTUAL_SHIFT) - 1;

// ── Address ─────────────────────────────────────────────────────────

/// Config files carry the `"<ipv4>,<id>"` form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Address {
    ip: Ipv4Addr,
    slot: u16,
}

impl Address {
    pub fn new(ip: Ipv4Addr, slot: u16) -> Self {
        Self { ip, slot }
    }

    /// Loopback address, mostly for tests and single-host meshes.
    pub fn local(slot: u16) -> Self {
        Self::new(Ipv4Addr::LOCALHOST, slot)
    }

    pub fn ip(&self) -> Ipv4Addr {
        self.ip
    }

    pub fn slot(&self) -> u16 {
        self.slot
    }

    pub fn port(&self) -> u16 {
        START_PORT.wrapping_add(self.slot)
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(self.ip, self.port()))
    }

    /// Address of a colocated sub-service.
    pub fn offset(&self, by: u16) -> Self {
        Self::new(self.ip, self.slot.wrapping_add(by))
    }

    pub fn responder(&self) -> Self {
        self.offset(RESPONDER_LOCALNUM_OFFSET)
    }

    pub fn map_service(&self) -> Self {
        self.offset(MAP_LOCALNUM_OFFSET)
    }

    pub fn serial(&self) -> u64 {
        (u64::from(u32::from(self.ip)) << 16) | u64::from(self.slot)
    }

    /// Inverse of [`Address::serial`]; any virtual id bits are stripped.
    pub fn from_serial(serial: u64) -> Self {
        let serial = serial & AGENT_MASK;
        Self::new(Ipv4Addr::from((serial >> 16) as u32), serial as u16)
    }
}

/// Tag a serialized agent with a virtual id for a ring position.
pub fn pack_agent(serial: u64, vid: u16) -> u64 {
    serial | (u64::from(vid) << VIRTUAL_SHIFT)
}

/// Strip the virtual id of a ring position.
pub fn unpack_agent(packed: u64) -> u64 {
    packed & AGENT_MASK
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},{}", self.ip, self.slot)
    }
}

impl FromStr for Address {
    type Err = PandoError;

    /// Parse `"<ipv4>,<id>"`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bad = || PandoError::InvalidAddress(s.to_string());
        let (ip, id) = s.split_once(',').ok_or_else(bad)?;
        let ip: Ipv4Addr = ip.trim().parse().map_err(|_| bad())?;
        let id: u16 = id.trim().parse().map_err(|_| bad())?;
        if id >= MAX_SLOT_ID {
            return Err(bad());
        }
        Ok(Self::new(ip, id))
    }
}

impl TryFrom<String> for Address {
    type Error = PandoError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<Address> for String {
    fn from(addr: Address) -> Self {
        addr.to_string()
    }
}
