//! Barrier accounting.
//!
//! Every agent keeps a [`SentLedger`] of mutations pushed to each peer and a
//! [`BarrierWait`] counting mutations received. On entering a barrier the
//! ledger is reported to the synchronizer, whose [`SyncTally`] sums what
//! everyone sent to each agent. Once all agents reported, each one is told
//! how many it must have received; an agent whose count matches arrives,
//! and when all have arrived the synchronizer ends the barrier.
//!
//! ```text
//! agent                         synchronizer
//!   START_BARRIER_WAIT{sent} -->  report()
//!                           <--   BARRIER_MSG_DIST{expected}   (all reported)
//!   recv == expected
//!   AT_BARRIER               -->  arrive()
//!                           <--   END_BARRIER                  (all arrived)
//! ```

use std::collections::{BTreeMap, BTreeSet};

use crate::address::Address;

// ── Agent side ──────────────────────────────────────────────────────

/// Mutations pushed per peer since the last barrier report.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SentLedger {
    counts: BTreeMap<Address, u64>,
}

impl SentLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, to: Address) {
        *self.counts.entry(to).or_insert(0) += 1;
    }

    pub fn total(&self) -> u64 {
        self.counts.values().sum()
    }

    /// Hand over the counts for a barrier report and start over.
    pub fn take(&mut self) -> Vec<(Address, u64)> {
        std::mem::take(&mut self.counts).into_iter().collect()
    }
}

/// Received-count side of one agent's barrier.
#[derive(Debug, Default)]
pub struct BarrierWait {
    received: u64,
    expected: Option<u64>,
    arrived: bool,
}

impl BarrierWait {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn received(&self) -> u64 {
        self.received
    }

    /// Whether AT_BARRIER went out and END_BARRIER has not come yet.
    pub fn arrived(&self) -> bool {
        self.arrived
    }

    /// Count one received mutation. Returns true when this completes the
    /// wait.
    pub fn record_recv(&mut self) -> bool {
        self.received += 1;
        self.try_arrive()
    }

    /// The synchronizer's expected count arrived. Returns true when the
    /// wait is already complete.
    pub fn expect(&mut self, expected: u64) -> bool {
        self.expected = Some(expected);
        self.try_arrive()
    }

    pub fn end(&mut self) {
        self.arrived = false;
    }

    fn try_arrive(&mut self) -> bool {
        let Some(expected) = self.expected else {
            return false;
        };
        if self.received > expected {
            tracing::warn!(received = self.received, expected, "received more than the barrier expects");
        }
        if self.received != expected {
            return false;
        }
        self.received = 0;
        self.expected = None;
        self.arrived = true;
        true
    }
}

// ── Synchronizer side ───────────────────────────────────────────────

#[derive(Debug, Default)]
pub struct SyncTally {
    reported: BTreeSet<Address>,
    expected: BTreeMap<Address, u64>,
    arrived: BTreeSet<Address>,
    process_again: bool,
}

impl SyncTally {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one agent's START_BARRIER_WAIT. Once every agent in `agents`
    /// reported, returns each agent's expected receive count.
    pub fn report(
        &mut self,
        from: Address,
        process_again: bool,
        sent: &[(Address, u64)],
        agents: &[Address],
    ) -> Option<Vec<(Address, u64)>> {
        if !self.reported.insert(from) {
            tracing::warn!(%from, "duplicate barrier report");
        }
        self.process_again |= process_again;
        for (to, count) in sent {
            *self.expected.entry(*to).or_insert(0) += count;
        }
        if self.reported.len() < agents.len() {
            return None;
        }

        let dist = agents.iter().map(|a| (*a, self.expected.get(a).copied().unwrap_or(0))).collect();
        self.reported.clear();
        self.expected.clear();
        self.arrived.clear();
        Some(dist)
    }

    /// Record one AT_BARRIER. Returns true once all `num_agents` arrived.
    pub fn arrive(&mut self, from: Address, num_agents: usize) -> bool {
        self.arrived.insert(from);
        if self.arrived.len() < num_agents {
            return false;
        }
        self.arrived.clear();
        true
    }

    /// Whether any agent asked for another round since the last call.
    pub fn take_process_again(&mut self) -> bool {
        std::mem::take(&mut self.process_again)
    }

    pub fn pending_reports(&self) -> usize {
        self.reported.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn a(slot: u16) -> Address {
        Address::local(slot)
    }

    #[test]
    fn test_ledger_take_resets() {
        let mut ledger = SentLedger::new();
        ledger.record(a(3));
        ledger.record(a(3));
        ledger.record(a(6));
        assert_eq!(ledger.total(), 3);
        assert_eq!(ledger.take(), vec![(a(3), 2), (a(6), 1)]);
        assert_eq!(ledger.total(), 0);
    }

    #[test]
    fn test_wait_expected_before_receipts() {
        let mut wait = BarrierWait::new();
        assert!(!wait.expect(2));
        assert!(!wait.record_recv());
        assert!(wait.record_recv());
        assert!(wait.arrived());
        assert_eq!(wait.received(), 0);
        wait.end();
        assert!(!wait.arrived());
    }

    #[test]
    fn test_wait_receipts_before_expected() {
        let mut wait = BarrierWait::new();
        assert!(!wait.record_recv());
        assert!(wait.expect(1));
    }

    #[test]
    fn test_wait_zero_expected() {
        let mut wait = BarrierWait::new();
        assert!(wait.expect(0));
    }

    #[test]
    fn test_wait_never_completes_early() {
        let mut wait = BarrierWait::new();
        assert!(!wait.expect(3));
        assert!(!wait.record_recv());
        assert!(!wait.record_recv());
        assert!(!wait.arrived());
    }

    #[test]
    fn test_tally_sums_sent_per_receiver() {
        let agents = [a(0), a(3), a(6)];
        let mut tally = SyncTally::new();
        assert!(tally.report(a(0), false, &[(a(3), 2), (a(6), 1)], &agents).is_none());
        assert!(tally.report(a(3), true, &[(a(0), 4)], &agents).is_none());
        let dist = tally.report(a(6), false, &[(a(3), 1)], &agents).unwrap();
        assert_eq!(dist, vec![(a(0), 4), (a(3), 3), (a(6), 1)]);
        assert_eq!(tally.pending_reports(), 0);

        assert!(tally.take_process_again());
        assert!(!tally.take_process_again());
    }

    #[test]
    fn test_tally_arrivals() {
        let mut tally = SyncTally::new();
        assert!(!tally.arrive(a(0), 2));
        assert!(!tally.arrive(a(0), 2));
        assert!(tally.arrive(a(3), 2));
        assert!(!tally.arrive(a(3), 2));
    }
}
