//! nodevisor - per-node hypervisor agent
//!
//! Runs on every compute node of a virtualization cluster and executes the
//! orchestrator's decisions against the local libvirt daemon.
//!
//! # Modules
//!
//! - `engine` - the creation engine (admission-controlled provisioning from a
//!   work queue) and the operate engine (lifecycle instructions from a pub/sub
//!   channel), plus their supervision
//! - `guest` - creation jobs, guest working directories and scene cleanup
//! - `hypervisor` - the `Hypervisor` seam, descriptor parsing and a `virsh` driver
//! - `storage` - guest directories on mounted distributed volumes
//! - `queue` - Redis work queue and instruction channel
//! - `diagnostics` - operator alerts published to the emit channel
//! - `metrics` - Prometheus metrics for observability
//! - `tracing` - log and span setup
//! - `config` - TOML configuration and command line
//!
//! # Quick Start
//!
//! ```ignore
//! use nodevisor::engine::{AgentHandle, CreationEngine, OperateEngine};
//!
//! let handle = AgentHandle::spawn(creation, operate, CancellationToken::new());
//! tokio::signal::ctrl_c().await?;
//! handle.shutdown().await;
//! ```

pub mod config;
pub mod diagnostics;
pub mod engine;
pub mod error;
pub mod guest;
pub mod hypervisor;
pub mod metrics;
pub mod queue;
pub mod storage;
pub mod tracing;

#[cfg(test)]
pub(crate) mod testing;

// Re-export commonly used types at crate root for convenience
pub use config::AgentConfig;
pub use engine::{AgentHandle, CreationEngine, OperateEngine};
pub use error::{AgentError, Result};
