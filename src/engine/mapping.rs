//! Guest mapping cache
//!
//! Domains can appear and disappear outside this agent (operators, migrations),
//! so the mapping is rebuilt from the hypervisor before every instruction
//! instead of being maintained incrementally.

use std::collections::HashMap;

use crate::error::HypervisorError;
use crate::hypervisor::{Domain, Hypervisor};

/// `guest_id -> Domain` snapshot of the local hypervisor
#[derive(Debug, Default)]
pub struct GuestMapping {
    by_uuid: HashMap<String, Domain>,
}

impl GuestMapping {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the mapping with the hypervisor's current domain list
    ///
    /// On failure the previous snapshot is kept.
    pub async fn refresh(&mut self, hypervisor: &dyn Hypervisor) -> Result<usize, HypervisorError> {
        let domains = hypervisor.list_all_domains().await?;
        self.by_uuid.clear();
        self.by_uuid
            .extend(domains.into_iter().map(|d| (d.uuid.clone(), d)));
        Ok(self.by_uuid.len())
    }

    pub fn get(&self, guest_id: &str) -> Option<&Domain> {
        self.by_uuid.get(guest_id)
    }

    pub fn len(&self) -> usize {
        self.by_uuid.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_uuid.is_empty()
    }
}
