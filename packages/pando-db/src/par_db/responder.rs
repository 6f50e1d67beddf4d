//! By-key responder.
//!
//! Runs on its own thread at `addr.responder()` and answers
//! `GET_ENTRY_BY_KEY` straight from the committed store, so peers can
//! resolve keys while the agent loop is busy inside a sweep or a graph
//! round.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError};
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError};

use crate::error::{PandoError, Result};
use crate::seq_db::SharedStore;
use crate::transport::Envelope;
use crate::wire::{Message, Reply};

pub struct Responder {
    store: SharedStore,
}

impl Responder {
    pub fn new(store: SharedStore) -> Self {
        Self { store }
    }

    pub fn answer(&self, frame: &[u8]) -> Reply {
        match self.lookup(frame) {
            Ok(reply) => reply,
            Err(e) => Reply::from_error(&e),
        }
    }

    fn lookup(&self, frame: &[u8]) -> Result<Reply> {
        match Message::decode(frame)? {
            Message::GetEntryByKey { key } => {
                let store = self.store.read().unwrap_or_else(PoisonError::into_inner);
                Ok(Reply::Value(store.get(&key).map(|e| e.value().to_vec())))
            }
            other => Err(PandoError::ProtocolState(format!(
                "responder only serves GET_ENTRY_BY_KEY, got {:?}",
                other.message_type()
            ))),
        }
    }

    /// Serve until `shutdown` is set or the inbox closes.
    pub fn run(self, inbox: Receiver<Envelope>, shutdown: Arc<AtomicBool>, poll: Duration) {
        while !shutdown.load(Ordering::Relaxed) {
            match inbox.recv_timeout(poll) {
                Ok(mut env) => {
                    let reply = self.answer(&env.payload);
                    env.respond(reply.encode());
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        tracing::debug!("responder stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::DbEntry;
    use crate::key::DbKey;
    use crate::seq_db::EntryStore;
    use std::sync::RwLock;

    #[test]
    fn test_answers_by_key() {
        let mut store = EntryStore::new();
        store.insert(DbEntry::new(DbKey::new(1, 2, 3), ["t"], "v")).unwrap();
        let responder = Responder::new(Arc::new(RwLock::new(store)));

        let hit = responder.answer(&Message::GetEntryByKey { key: DbKey::new(1, 2, 3) }.encode());
        assert_eq!(hit, Reply::Value(Some(b"v".to_vec())));
        let miss = responder.answer(&Message::GetEntryByKey { key: DbKey::new(9, 9, 9) }.encode());
        assert_eq!(miss, Reply::Value(None));
    }

    #[test]
    fn test_rejects_other_messages() {
        let responder = Responder::new(Arc::new(RwLock::new(EntryStore::new())));
        match responder.answer(&Message::DbSize.encode()) {
            Reply::Error { code, .. } => assert_eq!(code, "PROTOCOL_STATE"),
            other => panic!("unexpected {:?}", other),
        }
    }
}
