//! Agent threads.
//!
//! `spawn_agent` binds the agent and responder addresses, joins the mesh
//! through the configured seed and starts two threads:
//!
//! - main loop: one message per poll, heartbeat tick on an interval
//! - responder: by-key reads from the shared store
//!
//! Both observe the shutdown flag at poll boundaries.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;

use crossbeam_channel::RecvTimeoutError;

use super::{ParDb, Responder};
use crate::address::Address;
use crate::config::AgentConfig;
use crate::error::{PandoError, Result};
use crate::filter::FilterCatalog;
use crate::transport::Transport;

pub struct AgentHandle {
    addr: Address,
    shutdown: Arc<AtomicBool>,
    main: Option<JoinHandle<Result<()>>>,
    responder: Option<JoinHandle<()>>,
}

impl AgentHandle {
    pub fn addr(&self) -> Address {
        self.addr
    }

    /// Flag that stops both threads; hand it to a signal handler.
    pub fn shutdown_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.shutdown)
    }

    pub fn is_finished(&self) -> bool {
        self.main.as_ref().map_or(true, JoinHandle::is_finished)
    }

    /// Stop both threads and wait for them.
    pub fn shutdown(mut self) -> Result<()> {
        self.shutdown.store(true, Ordering::Relaxed);
        self.join_threads()
    }

    /// Wait for the threads without requesting a stop.
    pub fn join(mut self) -> Result<()> {
        self.join_threads()
    }

    fn join_threads(&mut self) -> Result<()> {
        let result = match self.main.take() {
            Some(main) => main
                .join()
                .unwrap_or_else(|_| Err(PandoError::ProtocolState("agent thread panicked".to_string()))),
            None => Ok(()),
        };
        // The responder outlives a failed main loop otherwise.
        self.shutdown.store(true, Ordering::Relaxed);
        if let Some(responder) = self.responder.take() {
            if responder.join().is_err() {
                tracing::error!(addr = %self.addr, "responder thread panicked");
            }
        }
        result
    }
}

impl Drop for AgentHandle {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
    }
}

pub fn spawn_agent(
    config: &AgentConfig,
    transport: Arc<dyn Transport>,
    catalog: Arc<FilterCatalog>,
) -> Result<AgentHandle> {
    config.validate()?;
    let addr = config.bind;
    let poll = config.poll_timeout();
    let hb_interval = config.heartbeat_interval();

    let mut db = ParDb::new(config, Arc::clone(&transport), catalog)?;
    let inbox = transport.bind(addr)?;
    let responder_inbox = match transport.bind(addr.responder()) {
        Ok(rx) => rx,
        Err(e) => {
            transport.unbind(addr);
            return Err(e);
        }
    };
    if let Some(seed) = config.seed {
        if let Err(e) = db.join(seed) {
            transport.unbind(addr);
            transport.unbind(addr.responder());
            return Err(e);
        }
    }

    let shutdown = Arc::new(AtomicBool::new(false));

    let responder = {
        let store = Arc::clone(db.seq().store());
        let shutdown = Arc::clone(&shutdown);
        let transport = Arc::clone(&transport);
        thread::Builder::new().name(format!("pando-responder-{}", addr)).spawn(move || {
            Responder::new(store).run(responder_inbox, shutdown, poll);
            transport.unbind(addr.responder());
        })?
    };

    let main = {
        let shutdown = Arc::clone(&shutdown);
        thread::Builder::new().name(format!("pando-agent-{}", addr)).spawn(move || {
            tracing::info!(%addr, "agent running");
            let mut last_heartbeat = Instant::now();
            let mut result = Ok(());
            while !shutdown.load(Ordering::Relaxed) {
                match inbox.recv_timeout(poll) {
                    Ok(env) => {
                        if let Err(e) = db.dispatch(env) {
                            tracing::error!(%addr, error = %e, "fatal error, stopping agent");
                            result = Err(e);
                            break;
                        }
                    }
                    Err(RecvTimeoutError::Timeout) => {}
                    Err(RecvTimeoutError::Disconnected) => break,
                }
                if last_heartbeat.elapsed() >= hb_interval {
                    db.heartbeat();
                    last_heartbeat = Instant::now();
                }
            }
            transport.unbind(addr);
            tracing::info!(%addr, entries = db.seq().size(), "agent stopped");
            result
        })?
    };

    Ok(AgentHandle { addr, shutdown, main: Some(main), responder: Some(responder) })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MemoryTransport;
    use crate::wire::{Message, Reply};
    use std::time::Duration;

    fn config(slot: u16) -> AgentConfig {
        AgentConfig {
            bind: Address::local(slot),
            memory_gb: Some(0.5),
            filter_bundles: Vec::new(),
            virtual_agents: 10,
            poll_timeout_ms: 20,
            heartbeat_interval_ms: 20,
            ..AgentConfig::default()
        }
    }

    #[test]
    fn test_spawn_serve_and_shutdown() {
        let hub = MemoryTransport::new();
        let handle = spawn_agent(&config(0), Arc::new(hub.clone()), Arc::new(FilterCatalog::new())).unwrap();
        assert!(hub.is_bound(Address::local(0)));
        assert!(hub.is_bound(Address::local(0).responder()));

        let reply = hub.request(Address::local(0), Message::GetState.encode(), Duration::from_secs(5)).unwrap();
        assert_eq!(Reply::decode(&reply).unwrap(), Reply::Text("PRELOAD".into()));

        handle.shutdown().unwrap();
        assert!(!hub.is_bound(Address::local(0)));
        assert!(!hub.is_bound(Address::local(0).responder()));
    }

    #[test]
    fn test_bind_conflict_fails() {
        let hub = MemoryTransport::new();
        let _taken = hub.bind(Address::local(0)).unwrap();
        let err = spawn_agent(&config(0), Arc::new(hub), Arc::new(FilterCatalog::new()));
        assert!(err.is_err());
    }

    #[test]
    fn test_unreachable_seed_fails() {
        let hub = MemoryTransport::new();
        let mut cfg = config(0);
        cfg.seed = Some(Address::local(3));
        match spawn_agent(&cfg, Arc::new(hub.clone()), Arc::new(FilterCatalog::new())) {
            Err(err) => assert!(err.is_routing(), "unexpected error: {}", err),
            Ok(_) => panic!("agent started without a reachable seed"),
        }
        assert!(!hub.is_bound(Address::local(0)));
    }
}
