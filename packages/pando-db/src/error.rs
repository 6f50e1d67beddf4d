//! Error types for the pando agent

use thiserror::Error;

use crate::address::Address;

pub type Result<T> = std::result::Result<T, PandoError>;

/// Failure while decoding a wire frame, an entry or an export file.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("truncated input: needed {needed} bytes, {remaining} remaining")]
    Truncated { needed: usize, remaining: usize },

    #[error("unknown message type 0x{0:02x}")]
    UnknownMessageType(u8),

    #[error("unknown reply tag 0x{0:02x}")]
    UnknownReplyTag(u8),

    #[error("invalid utf-8 in {0}")]
    InvalidUtf8(&'static str),

    #[error("{0} trailing bytes after message")]
    TrailingBytes(usize),

    #[error("invalid payload: {0}")]
    Invalid(String),
}

#[derive(Error, Debug)]
pub enum PandoError {
    // ── Routing ──
    #[error("unknown agent: {0}")]
    UnknownAgent(Address),

    #[error("ownership lookup on an empty ring")]
    EmptyRing,

    #[error("agent {addr} unreachable: {reason}")]
    Unreachable { addr: Address, reason: String },

    #[error("invalid address '{0}'")]
    InvalidAddress(String),

    #[error("request to {0} timed out")]
    Timeout(Address),

    // ── Protocol state ──
    #[error("protocol state error: {0}")]
    ProtocolState(String),

    #[error("agent replied with error {code}: {message}")]
    Remote { code: String, message: String },

    // ── Storage ──
    #[error("out of space: {requested} bytes requested, {used}/{limit} used")]
    OutOfSpace { requested: u64, used: u64, limit: u64 },

    #[error("filter not found: {0}")]
    FilterNotFound(String),

    #[error("filter bundle not found: {0}")]
    FilterBundleNotFound(String),

    #[error("invalid db file: {0}")]
    InvalidDbFile(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("decode error: {0}")]
    Decode(#[from] DecodeError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl PandoError {
    /// Get error code for wire protocol
    pub fn code(&self) -> &'static str {
        match self {
            PandoError::UnknownAgent(_)
            | PandoError::EmptyRing
            | PandoError::Unreachable { .. }
            | PandoError::InvalidAddress(_)
            | PandoError::Timeout(_) => "ROUTING",
            PandoError::ProtocolState(_) => "PROTOCOL_STATE",
            PandoError::OutOfSpace { .. } => "OUT_OF_SPACE",
            PandoError::FilterNotFound(_) | PandoError::FilterBundleNotFound(_) => "FILTER_NOT_FOUND",
            PandoError::Decode(_) => "DECODE",
            PandoError::Remote { .. } => "REMOTE",
            _ => "INTERNAL_ERROR",
        }
    }

    /// Routing failures are fatal to the operation only.
    pub fn is_routing(&self) -> bool {
        self.code() == "ROUTING"
    }

    /// Allocation failures are fatal to the agent.
    pub fn is_fatal(&self) -> bool {
        matches!(self, PandoError::OutOfSpace { .. })
    }
}
