//! Agent configuration
//!
//! Loaded from a TOML file. Every field has a default so an empty (or absent)
//! file yields a working single-node setup.
//!
//! ```toml
//! debug = false
//!
//! [redis]
//! url = "redis://127.0.0.1:6379/0"
//! vm_create_queue = "Q:VMCreate"
//! instruction_channel = "C:Instruction"
//! emit_channel = "C:Emit"
//!
//! [admission]
//! load_threshold = 0.6
//! time_unit_ms = 1000
//! ```

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::Parser;
use serde::Deserialize;

use crate::error::ConfigError;

/// Command line arguments
#[derive(Debug, Parser)]
#[command(name = "nodevisor", version, about = "Per-node hypervisor agent")]
pub struct Cli {
    /// Path to the TOML configuration file
    #[arg(long, env = "NODEVISOR_CONFIG", default_value = "/etc/nodevisor/nodevisor.toml")]
    pub config: PathBuf,

    /// Enable debug reporting (overrides the config file)
    #[arg(long)]
    pub debug: bool,
}

/// Full agent configuration
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Report unknown-guest instructions to the emit channel
    pub debug: bool,
    pub redis: RedisConfig,
    pub hypervisor: HypervisorConfig,
    pub storage: StorageConfig,
    pub admission: AdmissionConfig,
    pub operate: OperateConfig,
    pub telemetry: TelemetryConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RedisConfig {
    pub url: String,
    /// List the orchestrator pushes creation jobs onto
    pub vm_create_queue: String,
    /// Pub/sub topic carrying lifecycle instructions
    pub instruction_channel: String,
    /// Pub/sub topic alerts are published on (empty disables emission)
    pub emit_channel: String,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379/0".to_string(),
            vm_create_queue: "Q:VMCreate".to_string(),
            instruction_channel: "C:Instruction".to_string(),
            emit_channel: "C:Emit".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HypervisorConfig {
    /// libvirt connection URI
    pub uri: String,
    pub virsh_bin: PathBuf,
}

impl Default for HypervisorConfig {
    fn default() -> Self {
        Self {
            uri: "qemu:///system".to_string(),
            virsh_bin: PathBuf::from("virsh"),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Directory under which each distributed volume is mounted by name
    pub mount_base: PathBuf,
    /// Volume-relative directory holding one working directory per guest
    pub instances_dir: String,
    pub qemu_img_bin: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            mount_base: PathBuf::from("/mnt/glusterfs"),
            instances_dir: "instances".to_string(),
            qemu_img_bin: PathBuf::from("qemu-img"),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AdmissionConfig {
    /// Nodes whose 5-minute load average exceeds this take no new guests
    pub load_threshold: f64,
    /// Length of one admission time unit
    pub time_unit_ms: u64,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            load_threshold: 0.6,
            time_unit_ms: 1000,
        }
    }
}

impl AdmissionConfig {
    pub fn time_unit(&self) -> Duration {
        Duration::from_millis(self.time_unit_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OperateConfig {
    /// Bounded wait for one instruction
    pub poll_timeout_ms: u64,
}

impl Default for OperateConfig {
    fn default() -> Self {
        Self { poll_timeout_ms: 1000 }
    }
}

impl OperateConfig {
    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    /// Emit logs as JSON lines
    pub log_json: bool,
    /// OTLP collector endpoint; traces are only exported when set
    pub otlp_endpoint: Option<String>,
    /// Address for the Prometheus `/metrics` endpoint
    pub metrics_addr: Option<SocketAddr>,
}

impl AgentConfig {
    /// Load configuration from `path`, falling back to defaults if it does not exist
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml(&raw)
    }

    /// Parse and validate configuration from TOML text
    pub fn from_toml(raw: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Resolve configuration from command line arguments
    pub fn from_cli(cli: &Cli) -> Result<Self, ConfigError> {
        let mut config = Self::load(&cli.config)?;
        config.debug |= cli.debug;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let threshold = self.admission.load_threshold;
        if !threshold.is_finite() || threshold <= 0.0 {
            return Err(ConfigError::Invalid(format!(
                "admission.load_threshold must be positive, got {}",
                threshold
            )));
        }
        if self.admission.time_unit_ms == 0 {
            return Err(ConfigError::Invalid(
                "admission.time_unit_ms must be positive".to_string(),
            ));
        }
        if self.redis.vm_create_queue.is_empty() || self.redis.instruction_channel.is_empty() {
            return Err(ConfigError::Invalid(
                "redis.vm_create_queue and redis.instruction_channel are required".to_string(),
            ));
        }
        Ok(())
    }
}
