//! Simulation configuration loading and management.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;

use netting_core::{BlockTimeout, ProtocolConfig, TokenAmount};
use netting_network::DeliveryFaults;

/// Full configuration for a simulated netting network.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct NettingConfig {
    /// Protocol parameters shared by every node.
    #[serde(default)]
    pub protocol: ProtocolConfig,

    /// Network shape and workload.
    #[serde(default)]
    pub simulation: SimulationConfig,

    /// Message delivery faults injected by the hub.
    #[serde(default)]
    pub faults: DeliveryFaults,

    /// Logging settings.
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// How the simulation drives its transfers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum SimulationMode {
    /// Start every transfer, then wait for all of them.
    Throughput,
    /// Wait for each transfer before starting the next.
    Latency,
}

impl fmt::Display for SimulationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Throughput => write!(f, "throughput"),
            Self::Latency => write!(f, "latency"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulationConfig {
    /// Number of nodes.
    #[serde(default = "default_nodes")]
    pub nodes: usize,
    /// Number of assets, each with its own channel graph.
    #[serde(default = "default_assets")]
    pub assets: usize,
    /// Channels each node opens towards later nodes in the ring.
    #[serde(default = "default_channels_per_node")]
    pub channels_per_node: usize,
    /// Transfers started per asset.
    #[serde(default = "default_transfers")]
    pub transfers: usize,
    /// Amount of each transfer. TOML has no 128-bit integers.
    #[serde(default = "default_amount")]
    pub amount: u64,
    /// Settle timeout for every opened channel.
    #[serde(default = "default_settle_timeout")]
    pub settle_timeout: BlockTimeout,
    /// Wall-clock duration of one block.
    #[serde(default = "default_block_time_ms")]
    pub block_time_ms: u64,
    #[serde(default = "default_mode")]
    pub mode: SimulationMode,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error).
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Log format (text, json).
    #[serde(default = "default_log_format")]
    pub format: String,
}

// Default value functions
fn default_nodes() -> usize {
    10
}
fn default_assets() -> usize {
    1
}
fn default_channels_per_node() -> usize {
    2
}
fn default_transfers() -> usize {
    100
}
fn default_amount() -> u64 {
    2
}
fn default_settle_timeout() -> BlockTimeout {
    30
}
fn default_block_time_ms() -> u64 {
    100
}
fn default_mode() -> SimulationMode {
    SimulationMode::Throughput
}
fn default_log_level() -> String {
    "info".into()
}
fn default_log_format() -> String {
    "text".into()
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            nodes: default_nodes(),
            assets: default_assets(),
            channels_per_node: default_channels_per_node(),
            transfers: default_transfers(),
            amount: default_amount(),
            settle_timeout: default_settle_timeout(),
            block_time_ms: default_block_time_ms(),
            mode: default_mode(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl SimulationConfig {
    pub fn transfer_amount(&self) -> TokenAmount {
        TokenAmount::from(self.amount)
    }

    /// Deposit each participant makes into each channel: enough for every
    /// transfer of the run to cross the same edge.
    pub fn deposit_per_channel(&self) -> TokenAmount {
        self.transfer_amount() * self.transfers.max(1) as TokenAmount
    }
}

impl NettingConfig {
    /// Load config from a TOML file, falling back to defaults for missing fields.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            let contents = std::fs::read_to_string(path)?;
            let config: NettingConfig = toml::from_str(&contents)?;
            Ok(config)
        } else {
            Ok(Self::default())
        }
    }

    /// Save the current config to a TOML file.
    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        let contents = toml::to_string_pretty(self)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, contents)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = NettingConfig::default();
        assert_eq!(config.simulation.nodes, 10);
        assert_eq!(config.simulation.channels_per_node, 2);
        assert_eq!(config.simulation.mode, SimulationMode::Throughput);
        assert_eq!(config.protocol.reveal_timeout, 3);
        assert_eq!(config.logging.level, "info");
        assert!(config.faults.is_none());
    }

    #[test]
    fn test_deposit_per_channel() {
        let sim = SimulationConfig {
            amount: 5,
            transfers: 20,
            ..SimulationConfig::default()
        };
        assert_eq!(sim.deposit_per_channel(), 100);
    }

    #[test]
    fn test_config_serialization_roundtrip() {
        let config = NettingConfig::default();
        let toml_str = toml::to_string_pretty(&config).expect("serialize");
        let decoded: NettingConfig = toml::from_str(&toml_str).expect("deserialize");
        assert_eq!(decoded.simulation.nodes, config.simulation.nodes);
        assert_eq!(decoded.simulation.amount, config.simulation.amount);
        assert_eq!(decoded.protocol, config.protocol);
        assert_eq!(decoded.faults, config.faults);
    }

    #[test]
    fn test_config_save_then_load() {
        let path = std::env::temp_dir().join(format!("netting-{}.toml", std::process::id()));
        let mut config = NettingConfig::default();
        config.simulation.amount = 7;
        config.simulation.mode = SimulationMode::Latency;
        config.save(&path).unwrap();
        let loaded = NettingConfig::load(&path).unwrap();
        std::fs::remove_file(&path).unwrap();
        assert_eq!(loaded.simulation.amount, 7);
        assert_eq!(loaded.simulation.transfer_amount(), 7);
        assert_eq!(loaded.simulation.mode, SimulationMode::Latency);
    }

    #[test]
    fn test_config_load_nonexistent_uses_defaults() {
        let config = NettingConfig::load(Path::new("/nonexistent/netting.toml")).unwrap();
        assert_eq!(config.simulation.transfers, 100);
    }

    #[test]
    fn test_config_from_toml_partial() {
        let toml_str = r#"
[simulation]
nodes = 4
mode = "latency"

[faults]
duplicate_probability = 0.25

[protocol]
reveal_timeout = 5
"#;
        let config: NettingConfig = toml::from_str(toml_str).expect("parse");
        assert_eq!(config.simulation.nodes, 4);
        assert_eq!(config.simulation.mode, SimulationMode::Latency);
        assert_eq!(config.faults.duplicate_probability, 0.25);
        assert_eq!(config.protocol.reveal_timeout, 5);
        // Defaults for unspecified
        assert_eq!(config.simulation.assets, 1);
        assert_eq!(config.protocol.max_hops, 6);
        assert_eq!(config.faults.max_jitter_ms, 0);
        assert_eq!(config.logging.format, "text");
    }
}
