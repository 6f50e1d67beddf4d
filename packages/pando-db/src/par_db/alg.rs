//! Distributed graph-stage bookkeeping.
//!
//! Vertex sets are exchanged once per graph stage; after that every agent
//! reports once per iteration with its batch of vertex messages. Reports
//! for a later iteration may arrive while an earlier one is still open, so
//! tallies are kept per iteration.

use std::collections::{BTreeMap, BTreeSet};

use crate::address::Address;

#[derive(Debug, Default)]
struct IterTally {
    reported: BTreeSet<Address>,
    active: bool,
}

#[derive(Debug, Default)]
pub struct AlgExchange {
    vertex_reports: BTreeSet<Address>,
    tallies: BTreeMap<u64, IterTally>,
}

impl AlgExchange {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an ALG_VERTICES report. Returns true when it is the last of
    /// `num_agents`.
    pub fn on_vertices(&mut self, from: Address, num_agents: usize) -> bool {
        self.vertex_reports.insert(from);
        self.vertex_reports.len() == num_agents
    }

    pub fn on_compute(&mut self, from: Address, iter: u64, active: bool) {
        let tally = self.tallies.entry(iter).or_default();
        tally.reported.insert(from);
        tally.active |= active;
    }

    /// `Some(any_active)` once all agents reported for `iter`; the tally is
    /// consumed.
    pub fn complete(&mut self, iter: u64, num_agents: usize) -> Option<bool> {
        let done = self.tallies.get(&iter).is_some_and(|t| t.reported.len() >= num_agents);
        if !done {
            return None;
        }
        self.tallies.remove(&iter).map(|t| t.active)
    }

    pub fn reset(&mut self) {
        self.vertex_reports.clear();
        self.tallies.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vertex_reports_complete_once() {
        let mut ex = AlgExchange::new();
        assert!(!ex.on_vertices(Address::local(0), 2));
        assert!(!ex.on_vertices(Address::local(0), 2));
        assert!(ex.on_vertices(Address::local(3), 2));
    }

    #[test]
    fn test_iteration_tallies_are_independent() {
        let mut ex = AlgExchange::new();
        ex.on_compute(Address::local(0), 1, false);
        ex.on_compute(Address::local(0), 2, true);
        assert_eq!(ex.complete(1, 2), None);

        ex.on_compute(Address::local(3), 1, true);
        assert_eq!(ex.complete(1, 2), Some(true));
        assert_eq!(ex.complete(1, 2), None);

        ex.on_compute(Address::local(3), 2, false);
        assert_eq!(ex.complete(2, 2), Some(true));
        ex.reset();
        assert_eq!(ex.complete(3, 0), None);
    }
}
