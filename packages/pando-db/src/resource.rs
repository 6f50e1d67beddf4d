//! Host resource detection for the store's default memory budget.
//!
//! An agent started without `-M<GB>` sizes its entry store from what the
//! host can spare. Stateless: every `SystemResources::detect()` call
//! re-probes the system.

use sysinfo::{MemoryRefreshKind, RefreshKind, System};

// ── Constants ───────────────────────────────────────────────────────

const MB: u64 = 1024 * 1024;
pub const GB: u64 = 1024 * 1024 * 1024;

/// Budget floor (256 MB).
const BUDGET_MIN: u64 = 256 * MB;

/// Fraction of available memory handed to the store.
const BUDGET_AVAILABLE_FRACTION: f64 = 0.5;

/// The store never claims more than this share of physical RAM.
const BUDGET_TOTAL_FRACTION: f64 = 0.8;

// ── SystemResources ─────────────────────────────────────────────────

/// Snapshot of detected hardware resources.
#[derive(Debug, Clone)]
pub struct SystemResources {
    /// Total physical RAM in bytes.
    pub total_memory_bytes: u64,
    /// Available (re-usable) RAM in bytes.
    pub available_memory_bytes: u64,
}

impl SystemResources {
    /// Probe the current system for RAM.
    pub fn detect() -> Self {
        let mut sys = System::new_with_specifics(
            RefreshKind::new().with_memory(MemoryRefreshKind::everything()),
        );
        sys.refresh_memory();

        Self {
            total_memory_bytes: sys.total_memory(),
            available_memory_bytes: sys.available_memory(),
        }
    }

    /// Default store budget in bytes.
    ///
    /// `available * 0.5`, capped at `total * 0.8` and floored at 256 MB.
    /// The floor wins over the cap on very small hosts.
    pub fn default_store_budget(&self) -> u64 {
        let wanted = (self.available_memory_bytes as f64 * BUDGET_AVAILABLE_FRACTION) as u64;
        let cap = (self.total_memory_bytes as f64 * BUDGET_TOTAL_FRACTION) as u64;
        wanted.min(cap).max(BUDGET_MIN)
    }
}

// ── Tests ───────────────────────────────────────────────────────────
