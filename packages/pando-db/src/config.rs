//! Agent configuration.
//!
//! An optional YAML file supplies defaults; command-line flags override
//! it. Example:
//!
//! ```yaml
//! bind: "10.0.0.4,3"
//! seed: "10.0.0.1,0"
//! memory_gb: 8
//! filter_bundles: [builtin]
//! heartbeat_interval_ms: 500
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::Parser;
use serde::{Deserialize, Serialize};

use crate::address::{Address, MAX_SLOT_ID, STARTING_VAGENTS};
use crate::error::{PandoError, Result};
use crate::filters::BUILTIN_BUNDLE;
use crate::mesh::HB_CTR_MAX;
use crate::resource::{SystemResources, GB};

// ── AgentConfig ─────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AgentConfig {
    pub bind: Address,
    /// Existing agent to handshake with; `None` starts a new mesh.
    pub seed: Option<Address>,
    /// Store budget in GB; detected from host memory when unset.
    pub memory_gb: Option<f64>,
    pub skip_group_filters: bool,
    /// Filter bundles made available at start-up.
    pub filter_bundles: Vec<String>,
    pub virtual_agents: u16,
    pub heartbeat_interval_ms: u64,
    pub poll_timeout_ms: u64,
    pub request_timeout_ms: u64,
    /// Heartbeat ticks gossiped after a membership change.
    pub hb_rounds: u32,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            bind: Address::local(0),
            seed: None,
            memory_gb: None,
            skip_group_filters: false,
            filter_bundles: vec![BUILTIN_BUNDLE.to_string()],
            virtual_agents: STARTING_VAGENTS,
            heartbeat_interval_ms: 500,
            poll_timeout_ms: 500,
            request_timeout_ms: 5_000,
            hb_rounds: HB_CTR_MAX,
        }
    }
}

impl AgentConfig {
    pub fn from_yaml(text: &str) -> Result<Self> {
        serde_yaml::from_str(text).map_err(|e| PandoError::Config(e.to_string()))
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_yaml(&text)
    }

    /// File (if given) plus flag overrides, validated.
    pub fn from_args(args: &AgentArgs) -> Result<Self> {
        let mut config = match &args.config {
            Some(path) => Self::load(path)?,
            None => Self::default(),
        };
        args.apply(&mut config);
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.bind.slot() >= MAX_SLOT_ID {
            return Err(PandoError::Config(format!(
                "bind slot {} outside 0..{}",
                self.bind.slot(),
                MAX_SLOT_ID
            )));
        }
        if self.virtual_agents == 0 {
            return Err(PandoError::Config("virtual_agents must be positive".to_string()));
        }
        if let Some(gb) = self.memory_gb {
            if !(gb > 0.0 && gb.is_finite()) {
                return Err(PandoError::Config(format!("memory_gb must be positive, got {}", gb)));
            }
        }
        if self.poll_timeout_ms == 0 || self.heartbeat_interval_ms == 0 {
            return Err(PandoError::Config("poll and heartbeat intervals must be positive".to_string()));
        }
        Ok(())
    }

    pub fn memory_budget(&self) -> MemoryBudget {
        match self.memory_gb {
            Some(gb) => MemoryBudget::from_gb(gb),
            None => MemoryBudget::detect(),
        }
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

// ── MemoryBudget ────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryBudget {
    pub bytes: u64,
    /// Derived from host memory rather than configured.
    pub detected: bool,
}

impl MemoryBudget {
    pub fn from_gb(gb: f64) -> Self {
        Self { bytes: (gb * GB as f64) as u64, detected: false }
    }

    pub fn detect() -> Self {
        Self { bytes: SystemResources::detect().default_store_budget(), detected: true }
    }
}

// ── Command line ────────────────────────────────────────────────────

/// Pando storage agent.
#[derive(Parser, Debug, Default)]
#[command(name = "pando-agent", version)]
pub struct AgentArgs {
    /// YAML config file; flags override its values.
    #[arg(long, short = 'c')]
    pub config: Option<PathBuf>,

    /// Address to bind, as "<ipv4>,<id>".
    #[arg(long, short = 'b')]
    pub bind: Option<Address>,

    /// Agent to join through, as "<ipv4>,<id>".
    #[arg(long, short = 's')]
    pub seed: Option<Address>,

    /// Store budget in GB.
    #[arg(short = 'M', long = "memory-gb")]
    pub memory_gb: Option<f64>,

    #[arg(long)]
    pub skip_group_filters: bool,

    /// Filter bundle to make available (repeatable).
    #[arg(long = "bundle")]
    pub bundles: Vec<String>,

    #[arg(long)]
    pub virtual_agents: Option<u16>,

    #[arg(long)]
    pub heartbeat_interval_ms: Option<u64>,
}

impl AgentArgs {
    fn apply(&self, config: &mut AgentConfig) {
        if let Some(bind) = self.bind {
            config.bind = bind;
        }
        if self.seed.is_some() {
            config.seed = self.seed;
        }
        if self.memory_gb.is_some() {
            config.memory_gb = self.memory_gb;
        }
        if self.skip_group_filters {
            config.skip_group_filters = true;
        }
        if !self.bundles.is_empty() {
            config.filter_bundles = self.bundles.clone();
        }
        if let Some(n) = self.virtual_agents {
            config.virtual_agents = n;
        }
        if let Some(ms) = self.heartbeat_interval_ms {
            config.heartbeat_interval_ms = ms;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::net::Ipv4Addr;

    #[test]
    fn test_yaml_with_defaults() {
        let config = AgentConfig::from_yaml("bind: \"10.0.0.4,3\"\nseed: \"10.0.0.1,0\"\nmemory_gb: 2\n").unwrap();
        assert_eq!(config.bind, Address::new(Ipv4Addr::new(10, 0, 0, 4), 3));
        assert_eq!(config.seed, Some(Address::new(Ipv4Addr::new(10, 0, 0, 1), 0)));
        assert_eq!(config.virtual_agents, STARTING_VAGENTS);
        assert_eq!(config.filter_bundles, vec![BUILTIN_BUNDLE.to_string()]);
        assert_eq!(config.memory_budget(), MemoryBudget { bytes: 2 * GB, detected: false });
    }

    #[test]
    fn test_yaml_rejects_bad_address() {
        let err = AgentConfig::from_yaml("bind: \"10.0.0.4\"\n").unwrap_err();
        assert!(err.to_string().contains("invalid address"));
    }

    #[test]
    fn test_yaml_rejects_unknown_field() {
        assert!(AgentConfig::from_yaml("bogus: 1\n").is_err());
    }

    #[test]
    fn test_validate() {
        let mut config = AgentConfig::default();
        assert!(config.validate().is_ok());
        config.virtual_agents = 0;
        assert!(config.validate().is_err());

        let mut config = AgentConfig::default();
        config.memory_gb = Some(-1.0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_flags_override_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "bind: \"127.0.0.1,0\"\nvirtual_agents: 20\nskip_group_filters: false").unwrap();

        let args = AgentArgs::parse_from([
            "pando-agent",
            "--config",
            file.path().to_str().unwrap(),
            "--bind",
            "127.0.0.1,6",
            "-M",
            "1.5",
            "--skip-group-filters",
        ]);
        let config = AgentConfig::from_args(&args).unwrap();
        assert_eq!(config.bind, Address::local(6));
        assert_eq!(config.virtual_agents, 20);
        assert!(config.skip_group_filters);
        assert_eq!(config.memory_gb, Some(1.5));
    }

    #[test]
    fn test_bind_slot_out_of_range_rejected_by_parser() {
        assert!(AgentArgs::try_parse_from(["pando-agent", "--bind", "127.0.0.1,250"]).is_err());
    }
}
