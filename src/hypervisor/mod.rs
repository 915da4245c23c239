//! Hypervisor connection
//!
//! The agent opens one session to the local hypervisor at startup and shares
//! it between both engines as an `Arc<dyn Hypervisor>`. Domains are owned by
//! the hypervisor; the agent only holds `Domain` references to them.
//!
//! - `descriptor` - domain XML parsing (uuid, name, backing storage)
//! - `virsh` - libvirt implementation driven through the `virsh` CLI

pub mod descriptor;
pub mod virsh;

use std::fmt;

use async_trait::async_trait;

use crate::error::HypervisorError;

pub use descriptor::StoragePath;
pub use virsh::VirshHypervisor;

/// Reference to a hypervisor domain, addressed by its UUID
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Domain {
    pub uuid: String,
}

impl Domain {
    pub fn new(uuid: impl Into<String>) -> Self {
        Self { uuid: uuid.into() }
    }
}

impl fmt::Display for Domain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.uuid)
    }
}

/// Operations the agent needs from the local hypervisor session
///
/// Implementations must tolerate concurrent calls from both engines.
#[async_trait]
pub trait Hypervisor: Send + Sync {
    /// Enumerate every domain, running or not
    async fn list_all_domains(&self) -> Result<Vec<Domain>, HypervisorError>;

    /// Define a persistent domain from its XML descriptor
    async fn define_xml(&self, descriptor: &str) -> Result<Domain, HypervisorError>;

    /// Start a defined domain
    async fn create(&self, domain: &Domain) -> Result<(), HypervisorError>;

    /// Hard power-off
    async fn destroy(&self, domain: &Domain) -> Result<(), HypervisorError>;

    async fn undefine(&self, domain: &Domain) -> Result<(), HypervisorError>;

    async fn reboot(&self, domain: &Domain) -> Result<(), HypervisorError>;

    async fn shutdown(&self, domain: &Domain) -> Result<(), HypervisorError>;

    async fn suspend(&self, domain: &Domain) -> Result<(), HypervisorError>;

    async fn resume(&self, domain: &Domain) -> Result<(), HypervisorError>;

    /// Fetch the domain's current XML descriptor
    async fn xml_desc(&self, domain: &Domain) -> Result<String, HypervisorError>;
}
