//! Message transport between addresses.
//!
//! A [`Transport`] binds an [`Address`] to an inbox channel and delivers
//! frames to other bound addresses, either fire-and-forget (`push`) or as a
//! request that blocks for one reply frame. The agent loop only sees
//! [`Envelope`]s on a crossbeam receiver, so the same loop runs over the
//! in-process hub ([`MemoryTransport`]) and over TCP ([`TcpTransport`]).

pub mod memory;
pub mod tcp;

use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, Sender};

use crate::address::Address;
use crate::error::Result;

pub use memory::MemoryTransport;
pub use tcp::TcpTransport;

/// One inbound frame, with a way back to the requester if it waits for one.
#[derive(Debug)]
pub struct Envelope {
    pub payload: Vec<u8>,
    reply_to: Option<Sender<Vec<u8>>>,
}

impl Envelope {
    pub fn push(payload: Vec<u8>) -> Self {
        Self { payload, reply_to: None }
    }

    /// Envelope plus the receiver its reply will arrive on.
    pub fn request(payload: Vec<u8>) -> (Self, Receiver<Vec<u8>>) {
        let (tx, rx) = bounded(1);
        (Self { payload, reply_to: Some(tx) }, rx)
    }

    pub fn expects_reply(&self) -> bool {
        self.reply_to.is_some()
    }

    /// Send the reply; a requester that gave up is ignored.
    pub fn respond(&mut self, reply: Vec<u8>) {
        if let Some(tx) = self.reply_to.take() {
            let _ = tx.send(reply);
        }
    }
}

pub trait Transport: Send + Sync {
    /// Start accepting frames for `addr`.
    fn bind(&self, addr: Address) -> Result<Receiver<Envelope>>;

    /// Stop accepting frames for `addr`.
    fn unbind(&self, addr: Address);

    /// Deliver a frame without waiting for an answer.
    fn push(&self, to: Address, payload: Vec<u8>) -> Result<()>;

    /// Deliver a frame and wait for the reply frame.
    fn request(&self, to: Address, payload: Vec<u8>, timeout: Duration) -> Result<Vec<u8>>;
}
