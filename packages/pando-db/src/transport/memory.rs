//! In-process transport: a shared routing table of inbox senders.
//!
//! Every agent, responder and client in one process shares a clone of the
//! hub. Delivery is FIFO per destination.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};

use super::{Envelope, Transport};
use crate::address::Address;
use crate::error::{PandoError, Result};

#[derive(Clone, Default)]
pub struct MemoryTransport {
    routes: Arc<RwLock<HashMap<Address, Sender<Envelope>>>>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn route(&self, to: Address) -> Result<Sender<Envelope>> {
        self.routes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&to)
            .cloned()
            .ok_or_else(|| PandoError::Unreachable { addr: to, reason: "not bound".to_string() })
    }

    fn deliver(&self, to: Address, env: Envelope) -> Result<()> {
        self.route(to)?.send(env).map_err(|_| PandoError::Unreachable {
            addr: to,
            reason: "inbox closed".to_string(),
        })
    }

    pub fn is_bound(&self, addr: Address) -> bool {
        self.routes.read().unwrap_or_else(PoisonError::into_inner).contains_key(&addr)
    }
}

impl Transport for MemoryTransport {
    fn bind(&self, addr: Address) -> Result<Receiver<Envelope>> {
        let mut routes = self.routes.write().unwrap_or_else(PoisonError::into_inner);
        if routes.contains_key(&addr) {
            return Err(PandoError::Io(std::io::Error::new(
                std::io::ErrorKind::AddrInUse,
                format!("{} already bound", addr),
            )));
        }
        let (tx, rx) = unbounded();
        routes.insert(addr, tx);
        Ok(rx)
    }

    fn unbind(&self, addr: Address) {
        self.routes.write().unwrap_or_else(PoisonError::into_inner).remove(&addr);
    }

    fn push(&self, to: Address, payload: Vec<u8>) -> Result<()> {
        self.deliver(to, Envelope::push(payload))
    }

    fn request(&self, to: Address, payload: Vec<u8>, timeout: Duration) -> Result<Vec<u8>> {
        let (env, reply) = Envelope::request(payload);
        self.deliver(to, env)?;
        match reply.recv_timeout(timeout) {
            Ok(bytes) => Ok(bytes),
            Err(RecvTimeoutError::Timeout) => Err(PandoError::Timeout(to)),
            Err(RecvTimeoutError::Disconnected) => Err(PandoError::Unreachable {
                addr: to,
                reason: "request dropped without reply".to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_push_is_fifo() {
        let hub = MemoryTransport::new();
        let addr = Address::local(0);
        let inbox = hub.bind(addr).unwrap();
        hub.push(addr, vec![1]).unwrap();
        hub.push(addr, vec![2]).unwrap();
        assert_eq!(inbox.recv().unwrap().payload, vec![1]);
        assert_eq!(inbox.recv().unwrap().payload, vec![2]);
    }

    #[test]
    fn test_request_reply() {
        let hub = MemoryTransport::new();
        let addr = Address::local(3);
        let inbox = hub.bind(addr).unwrap();
        let server = thread::spawn(move || {
            let mut env = inbox.recv().unwrap();
            let mut reply = env.payload.clone();
            reply.push(9);
            env.respond(reply);
        });
        let reply = hub.request(addr, vec![4], Duration::from_secs(5)).unwrap();
        assert_eq!(reply, vec![4, 9]);
        server.join().unwrap();
    }

    #[test]
    fn test_unbound_address_is_unreachable() {
        let hub = MemoryTransport::new();
        let err = hub.push(Address::local(9), vec![]).unwrap_err();
        assert!(err.is_routing());
    }

    #[test]
    fn test_double_bind_fails() {
        let hub = MemoryTransport::new();
        let _inbox = hub.bind(Address::local(1)).unwrap();
        assert!(hub.bind(Address::local(1)).is_err());
        hub.unbind(Address::local(1));
        assert!(!hub.is_bound(Address::local(1)));
    }
}
