//! Wire protocol between agents, responders and clients.
//!
//! Every frame starts with a one-byte message type followed by the
//! type-specific payload (see [`codec`] for primitive encodings). Requests
//! that expect an answer get a [`Reply`] frame back, which starts with its
//! own one-byte tag.

pub mod codec;

use crate::address::Address;
use crate::alg_db::VertexMessage;
use crate::entry::DbEntry;
use crate::error::{DecodeError, PandoError};
use crate::filter::Wake;
use crate::key::{DbKey, GraphId, VertexId};
use codec::{ByteReader, ByteWriter};

type DecodeResult<T> = std::result::Result<T, DecodeError>;

// ── Message types ───────────────────────────────────────────────────

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    Handshake = 0xa0,
    NumNeighbors = 0xa1,
    AddNeighbor = 0xa2,
    RingSize = 0xa3,
    AddEntry = 0xa4,
    DbSize = 0xa5,
    AddFilterDir = 0xa6,
    InstallFilter = 0xa7,
    Process = 0xa8,
    AddTagToEntry = 0xa9,
    StartBarrierWait = 0xaa,
    BarrierMsgDist = 0xab,
    EndBarrier = 0xac,
    AtBarrier = 0xad,
    Stats = 0xb0,
    AddDbFile = 0xb1,
    AddFilterDirBroadcast = 0xb2,
    InstallFilterBroadcast = 0xb3,
    ProcessBroadcast = 0xb4,
    PrintEntries = 0xb5,
    RemoveTagFromEntry = 0xb6,
    UpdateEntryVal = 0xb7,
    SubscribeToEntry = 0xb8,
    GetEntryByKey = 0xbb,
    InstalledFilters = 0xc0,
    GetEntries = 0xc1,
    Query = 0xc5,
    GetNeighbors = 0xc6,
    Processing = 0xc7,
    ExportDb = 0xc8,
    ExportDbBroadcast = 0xc9,
    ImportDb = 0xca,
    ImportDbDistribute = 0xcb,
    ClearFiltersBroadcast = 0xcc,
    ClearFilters = 0xcd,
    AlgProcess = 0xce,
    AlgInternalCompute = 0xcf,
    AlgVertices = 0xd0,
    GetState = 0xd1,
    WantHeartbeat = 0xfe,
    Heartbeat = 0xff,
}

impl TryFrom<u8> for MessageType {
    type Error = DecodeError;

    fn try_from(byte: u8) -> DecodeResult<Self> {
        use MessageType::*;
        Ok(match byte {
            0xa0 => Handshake,
            0xa1 => NumNeighbors,
            0xa2 => AddNeighbor,
            0xa3 => RingSize,
            0xa4 => AddEntry,
            0xa5 => DbSize,
            0xa6 => AddFilterDir,
            0xa7 => InstallFilter,
            0xa8 => Process,
            0xa9 => AddTagToEntry,
            0xaa => StartBarrierWait,
            0xab => BarrierMsgDist,
            0xac => EndBarrier,
            0xad => AtBarrier,
            0xb0 => Stats,
            0xb1 => AddDbFile,
            0xb2 => AddFilterDirBroadcast,
            0xb3 => InstallFilterBroadcast,
            0xb4 => ProcessBroadcast,
            0xb5 => PrintEntries,
            0xb6 => RemoveTagFromEntry,
            0xb7 => UpdateEntryVal,
            0xb8 => SubscribeToEntry,
            0xbb => GetEntryByKey,
            0xc0 => InstalledFilters,
            0xc1 => GetEntries,
            0xc5 => Query,
            0xc6 => GetNeighbors,
            0xc7 => Processing,
            0xc8 => ExportDb,
            0xc9 => ExportDbBroadcast,
            0xca => ImportDb,
            0xcb => ImportDbDistribute,
            0xcc => ClearFiltersBroadcast,
            0xcd => ClearFilters,
            0xce => AlgProcess,
            0xcf => AlgInternalCompute,
            0xd0 => AlgVertices,
            0xd1 => GetState,
            0xfe => WantHeartbeat,
            0xff => Heartbeat,
            other => return Err(DecodeError::UnknownMessageType(other)),
        })
    }
}

// ── Messages ────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    // Membership
    Handshake { peers: Vec<Address> },
    Heartbeat { peers: Vec<Address> },
    WantHeartbeat { from: Address },
    AddNeighbor { addr: Address },
    NumNeighbors,
    GetNeighbors,
    RingSize,
    Stats { addr: Address, db_size: u64 },

    // Entry mutations, routed to the owner
    AddEntry { entry: DbEntry },
    AddTag { key: DbKey, tag: String },
    RemoveTag { key: DbKey, tag: String },
    UpdateValue { key: DbKey, value: Vec<u8> },
    Subscribe { subscriber: DbKey, wait_key: DbKey, wake: Wake },
    GetEntryByKey { key: DbKey },

    // Filters and files
    AddFilterDir { bundle: String },
    AddFilterDirBroadcast { bundle: String },
    InstallFilter { name: String },
    InstallFilterBroadcast { name: String },
    ClearFilters,
    ClearFiltersBroadcast,
    AddDbFile { path: String },
    ExportDb { dir: String },
    ExportDbBroadcast { dir: String },
    ImportDb { path: String },
    ImportDbDistribute { dir: String },

    // Introspection
    DbSize,
    GetState,
    Processing,
    Query { tags: Vec<String> },
    GetEntries,
    InstalledFilters,
    PrintEntries,

    // Processing rounds and barriers
    /// `fresh` marks a client-initiated run.
    Process { fresh: bool },
    ProcessBroadcast,
    AlgProcess,
    StartBarrierWait { from: Address, process_again: bool, sent: Vec<(Address, u64)> },
    BarrierMsgDist { expected: u64 },
    AtBarrier { from: Address },
    EndBarrier,

    // Distributed graph iterations
    AlgVertices { from: Address, vertices: Vec<(GraphId, VertexId)> },
    AlgInternalCompute { from: Address, active: bool, iter: u64, messages: Vec<VertexMessage> },
}

fn put_addresses(w: &mut ByteWriter, addrs: &[Address]) {
    w.put_len(addrs.len());
    for a in addrs {
        w.put_address(a);
    }
}

fn get_addresses(r: &mut ByteReader<'_>) -> DecodeResult<Vec<Address>> {
    let n = r.get_len(8)?;
    (0..n).map(|_| r.get_address()).collect()
}

fn put_strings(w: &mut ByteWriter, items: &[String]) {
    w.put_len(items.len());
    for s in items {
        w.put_str(s);
    }
}

fn get_strings(r: &mut ByteReader<'_>, what: &'static str) -> DecodeResult<Vec<String>> {
    let n = r.get_len(8)?;
    (0..n).map(|_| r.get_string(what)).collect()
}

fn put_wake(w: &mut ByteWriter, wake: &Wake) {
    match wake {
        Wake::RemoveTag(tag) => {
            w.put_u8(0);
            w.put_str(tag);
        }
        Wake::AddTag(tag) => {
            w.put_u8(1);
            w.put_str(tag);
        }
    }
}

fn get_wake(r: &mut ByteReader<'_>) -> DecodeResult<Wake> {
    match r.get_u8()? {
        0 => Ok(Wake::RemoveTag(r.get_string("wake tag")?)),
        1 => Ok(Wake::AddTag(r.get_string("wake tag")?)),
        other => Err(DecodeError::Invalid(format!("wake reason {}", other))),
    }
}

impl Message {
    pub fn message_type(&self) -> MessageType {
        use MessageType as T;
        match self {
            Message::Handshake { .. } => T::Handshake,
            Message::Heartbeat { .. } => T::Heartbeat,
            Message::WantHeartbeat { .. } => T::WantHeartbeat,
            Message::AddNeighbor { .. } => T::AddNeighbor,
            Message::NumNeighbors => T::NumNeighbors,
            Message::GetNeighbors => T::GetNeighbors,
            Message::RingSize => T::RingSize,
            Message::Stats { .. } => T::Stats,
            Message::AddEntry { .. } => T::AddEntry,
            Message::AddTag { .. } => T::AddTagToEntry,
            Message::RemoveTag { .. } => T::RemoveTagFromEntry,
            Message::UpdateValue { .. } => T::UpdateEntryVal,
            Message::Subscribe { .. } => T::SubscribeToEntry,
            Message::GetEntryByKey { .. } => T::GetEntryByKey,
            Message::AddFilterDir { .. } => T::AddFilterDir,
            Message::AddFilterDirBroadcast { .. } => T::AddFilterDirBroadcast,
            Message::InstallFilter { .. } => T::InstallFilter,
            Message::InstallFilterBroadcast { .. } => T::InstallFilterBroadcast,
            Message::ClearFilters => T::ClearFilters,
            Message::ClearFiltersBroadcast => T::ClearFiltersBroadcast,
            Message::AddDbFile { .. } => T::AddDbFile,
            Message::ExportDb { .. } => T::ExportDb,
            Message::ExportDbBroadcast { .. } => T::ExportDbBroadcast,
            Message::ImportDb { .. } => T::ImportDb,
            Message::ImportDbDistribute { .. } => T::ImportDbDistribute,
            Message::DbSize => T::DbSize,
            Message::GetState => T::GetState,
            Message::Processing => T::Processing,
            Message::Query { .. } => T::Query,
            Message::GetEntries => T::GetEntries,
            Message::InstalledFilters => T::InstalledFilters,
            Message::PrintEntries => T::PrintEntries,
            Message::Process { .. } => T::Process,
            Message::ProcessBroadcast => T::ProcessBroadcast,
            Message::AlgProcess => T::AlgProcess,
            Message::StartBarrierWait { .. } => T::StartBarrierWait,
            Message::BarrierMsgDist { .. } => T::BarrierMsgDist,
            Message::AtBarrier { .. } => T::AtBarrier,
            Message::EndBarrier => T::EndBarrier,
            Message::AlgVertices { .. } => T::AlgVertices,
            Message::AlgInternalCompute { .. } => T::AlgInternalCompute,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut w = ByteWriter::new();
        w.put_u8(self.message_type() as u8);
        match self {
            Message::Handshake { peers } | Message::Heartbeat { peers } => put_addresses(&mut w, peers),
            Message::WantHeartbeat { from } => w.put_address(from),
            Message::AddNeighbor { addr } => w.put_address(addr),
            Message::Stats { addr, db_size } => {
                w.put_address(addr);
                w.put_u64(*db_size);
            }
            Message::AddEntry { entry } => entry.encode(&mut w),
            Message::AddTag { key, tag } | Message::RemoveTag { key, tag } => {
                w.put_key(key);
                w.put_str(tag);
            }
            Message::UpdateValue { key, value } => {
                w.put_key(key);
                w.put_bytes(value);
            }
            Message::Subscribe { subscriber, wait_key, wake } => {
                w.put_key(subscriber);
                w.put_key(wait_key);
                put_wake(&mut w, wake);
            }
            Message::GetEntryByKey { key } => w.put_key(key),
            Message::AddFilterDir { bundle } | Message::AddFilterDirBroadcast { bundle } => w.put_str(bundle),
            Message::InstallFilter { name } | Message::InstallFilterBroadcast { name } => w.put_str(name),
            Message::AddDbFile { path } | Message::ImportDb { path } => w.put_str(path),
            Message::ExportDb { dir }
            | Message::ExportDbBroadcast { dir }
            | Message::ImportDbDistribute { dir } => w.put_str(dir),
            Message::Query { tags } => put_strings(&mut w, tags),
            Message::Process { fresh } => w.put_bool(*fresh),
            Message::StartBarrierWait { from, process_again, sent } => {
                w.put_address(from);
                w.put_bool(*process_again);
                w.put_len(sent.len());
                for (addr, count) in sent {
                    w.put_address(addr);
                    w.put_u64(*count);
                }
            }
            Message::BarrierMsgDist { expected } => w.put_u64(*expected),
            Message::AtBarrier { from } => w.put_address(from),
            Message::AlgVertices { from, vertices } => {
                w.put_address(from);
                w.put_len(vertices.len());
                for (graph, vtx) in vertices {
                    w.put_u64(*graph);
                    w.put_i64(*vtx);
                }
            }
            Message::AlgInternalCompute { from, active, iter, messages } => {
                w.put_address(from);
                w.put_bool(*active);
                w.put_u64(*iter);
                w.put_len(messages.len());
                for m in messages {
                    w.put_u64(m.graph);
                    w.put_i64(m.vtx);
                    w.put_bytes(&m.payload);
                }
            }
            Message::NumNeighbors
            | Message::GetNeighbors
            | Message::RingSize
            | Message::ClearFilters
            | Message::ClearFiltersBroadcast
            | Message::DbSize
            | Message::GetState
            | Message::Processing
            | Message::GetEntries
            | Message::InstalledFilters
            | Message::PrintEntries
            | Message::ProcessBroadcast
            | Message::AlgProcess
            | Message::EndBarrier => {}
        }
        w.into_inner()
    }

    pub fn decode(frame: &[u8]) -> DecodeResult<Self> {
        let mut r = ByteReader::new(frame);
        let kind = MessageType::try_from(r.get_u8()?)?;
        use MessageType as T;
        let msg = match kind {
            T::Handshake => Message::Handshake { peers: get_addresses(&mut r)? },
            T::Heartbeat => Message::Heartbeat { peers: get_addresses(&mut r)? },
            T::WantHeartbeat => Message::WantHeartbeat { from: r.get_address()? },
            T::AddNeighbor => Message::AddNeighbor { addr: r.get_address()? },
            T::NumNeighbors => Message::NumNeighbors,
            T::GetNeighbors => Message::GetNeighbors,
            T::RingSize => Message::RingSize,
            T::Stats => Message::Stats { addr: r.get_address()?, db_size: r.get_u64()? },
            T::AddEntry => Message::AddEntry { entry: DbEntry::decode(&mut r)? },
            T::AddTagToEntry => Message::AddTag { key: r.get_key()?, tag: r.get_string("tag")? },
            T::RemoveTagFromEntry => Message::RemoveTag { key: r.get_key()?, tag: r.get_string("tag")? },
            T::UpdateEntryVal => Message::UpdateValue { key: r.get_key()?, value: r.get_bytes()?.to_vec() },
            T::SubscribeToEntry => Message::Subscribe {
                subscriber: r.get_key()?,
                wait_key: r.get_key()?,
                wake: get_wake(&mut r)?,
            },
            T::GetEntryByKey => Message::GetEntryByKey { key: r.get_key()? },
            T::AddFilterDir => Message::AddFilterDir { bundle: r.get_string("bundle")? },
            T::AddFilterDirBroadcast => Message::AddFilterDirBroadcast { bundle: r.get_string("bundle")? },
            T::InstallFilter => Message::InstallFilter { name: r.get_string("filter name")? },
            T::InstallFilterBroadcast => Message::InstallFilterBroadcast { name: r.get_string("filter name")? },
            T::ClearFilters => Message::ClearFilters,
            T::ClearFiltersBroadcast => Message::ClearFiltersBroadcast,
            T::AddDbFile => Message::AddDbFile { path: r.get_string("path")? },
            T::ExportDb => Message::ExportDb { dir: r.get_string("dir")? },
            T::ExportDbBroadcast => Message::ExportDbBroadcast { dir: r.get_string("dir")? },
            T::ImportDb => Message::ImportDb { path: r.get_string("path")? },
            T::ImportDbDistribute => Message::ImportDbDistribute { dir: r.get_string("dir")? },
            T::DbSize => Message::DbSize,
            T::GetState => Message::GetState,
            T::Processing => Message::Processing,
            T::Query => Message::Query { tags: get_strings(&mut r, "tag")? },
            T::GetEntries => Message::GetEntries,
            T::InstalledFilters => Message::InstalledFilters,
            T::PrintEntries => Message::PrintEntries,
            T::Process => Message::Process { fresh: r.get_bool()? },
            T::ProcessBroadcast => Message::ProcessBroadcast,
            T::AlgProcess => Message::AlgProcess,
            T::StartBarrierWait => {
                let from = r.get_address()?;
                let process_again = r.get_bool()?;
                let n = r.get_len(16)?;
                let mut sent = Vec::with_capacity(n);
                for _ in 0..n {
                    sent.push((r.get_address()?, r.get_u64()?));
                }
                Message::StartBarrierWait { from, process_again, sent }
            }
            T::BarrierMsgDist => Message::BarrierMsgDist { expected: r.get_u64()? },
            T::AtBarrier => Message::AtBarrier { from: r.get_address()? },
            T::EndBarrier => Message::EndBarrier,
            T::AlgVertices => {
                let from = r.get_address()?;
                let n = r.get_len(16)?;
                let mut vertices = Vec::with_capacity(n);
                for _ in 0..n {
                    vertices.push((r.get_u64()?, r.get_i64()?));
                }
                Message::AlgVertices { from, vertices }
            }
            T::AlgInternalCompute => {
                let from = r.get_address()?;
                let active = r.get_bool()?;
                let iter = r.get_u64()?;
                let n = r.get_len(24)?;
                let mut messages = Vec::with_capacity(n);
                for _ in 0..n {
                    messages.push(VertexMessage {
                        graph: r.get_u64()?,
                        vtx: r.get_i64()?,
                        payload: r.get_bytes()?.to_vec(),
                    });
                }
                Message::AlgInternalCompute { from, active, iter, messages }
            }
        };
        r.finish()?;
        Ok(msg)
    }
}

// ── Replies ─────────────────────────────────────────────────────────

const REPLY_ACK: u8 = 0x00;
const REPLY_COUNT: u8 = 0x01;
const REPLY_FLAG: u8 = 0x02;
const REPLY_TEXT: u8 = 0x03;
const REPLY_ENTRIES: u8 = 0x04;
const REPLY_VALUE: u8 = 0x05;
const REPLY_PEERS: u8 = 0x06;
const REPLY_ERROR: u8 = 0x7f;

#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    Ack,
    Count(u64),
    Flag(bool),
    Text(String),
    Entries(Vec<DbEntry>),
    /// By-key lookup; `None` when the key is absent.
    Value(Option<Vec<u8>>),
    Peers(Vec<Address>),
    Error { code: String, message: String },
}

impl Reply {
    pub fn from_error(err: &PandoError) -> Self {
        Reply::Error { code: err.code().to_string(), message: err.to_string() }
    }

    /// Turn an error reply into `PandoError::Remote`.
    pub fn into_result(self) -> Result<Reply, PandoError> {
        match self {
            Reply::Error { code, message } => Err(PandoError::Remote { code, message }),
            other => Ok(other),
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut w = ByteWriter::new();
        match self {
            Reply::Ack => w.put_u8(REPLY_ACK),
            Reply::Count(n) => {
                w.put_u8(REPLY_COUNT);
                w.put_u64(*n);
            }
            Reply::Flag(b) => {
                w.put_u8(REPLY_FLAG);
                w.put_bool(*b);
            }
            Reply::Text(s) => {
                w.put_u8(REPLY_TEXT);
                w.put_str(s);
            }
            Reply::Entries(entries) => {
                w.put_u8(REPLY_ENTRIES);
                w.put_len(entries.len());
                for e in entries {
                    w.put_len(e.encoded_len());
                    e.encode(&mut w);
                }
            }
            Reply::Value(v) => {
                w.put_u8(REPLY_VALUE);
                w.put_bool(v.is_some());
                if let Some(v) = v {
                    w.put_bytes(v);
                }
            }
            Reply::Peers(peers) => {
                w.put_u8(REPLY_PEERS);
                put_addresses(&mut w, peers);
            }
            Reply::Error { code, message } => {
                w.put_u8(REPLY_ERROR);
                w.put_str(code);
                w.put_str(message);
            }
        }
        w.into_inner()
    }

    pub fn decode(frame: &[u8]) -> DecodeResult<Self> {
        let mut r = ByteReader::new(frame);
        let reply = match r.get_u8()? {
            REPLY_ACK => Reply::Ack,
            REPLY_COUNT => Reply::Count(r.get_u64()?),
            REPLY_FLAG => Reply::Flag(r.get_bool()?),
            REPLY_TEXT => Reply::Text(r.get_string("text")?),
            REPLY_ENTRIES => {
                let n = r.get_len(8)?;
                let mut entries = Vec::with_capacity(n);
                for _ in 0..n {
                    let size = r.get_len(1)?;
                    entries.push(DbEntry::from_bytes(r.take(size)?)?);
                }
                Reply::Entries(entries)
            }
            REPLY_VALUE => {
                if r.get_bool()? {
                    Reply::Value(Some(r.get_bytes()?.to_vec()))
                } else {
                    Reply::Value(None)
                }
            }
            REPLY_PEERS => Reply::Peers(get_addresses(&mut r)?),
            REPLY_ERROR => Reply::Error { code: r.get_string("code")?, message: r.get_string("message")? },
            other => return Err(DecodeError::UnknownReplyTag(other)),
        };
        r.finish()?;
        Ok(reply)
    }
}
