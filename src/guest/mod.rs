//! Guest creation jobs
//!
//! A `CreationJob` is what the orchestrator pushes onto the work queue. Once
//! dequeued it is wrapped in a `GuestContext` that lives for exactly one
//! creation attempt and is passed by reference through every step.
//!
//! - `provisioner` - builds the guest's working directory and disk images
//! - `scene` - reclaims the artifacts of an attempt that did not finish

pub mod provisioner;
pub mod scene;

use serde::Deserialize;
use uuid::Uuid;

pub use provisioner::{GuestProvisioner, QemuImgProvisioner};
pub use scene::SceneState;

/// One disk of a guest, in attach order
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct DiskSpec {
    /// File stem of the image inside the guest directory (e.g. "disk0")
    pub label: String,
    /// Virtual size in GiB; 0 keeps the template's size for the system disk
    #[serde(default)]
    pub size_gb: u64,
    #[serde(default = "default_format")]
    pub format: String,
}

fn default_format() -> String {
    "qcow2".to_string()
}

impl DiskSpec {
    pub fn file_name(&self) -> String {
        format!("{}.{}", self.label, self.format)
    }
}

/// Guest creation request as published by the orchestrator
#[derive(Debug, Clone, Deserialize)]
pub struct CreationJob {
    #[serde(rename = "uuid")]
    pub guest_id: String,
    pub name: String,
    /// Distributed volume holding the template and the guest's disks
    #[serde(rename = "glusterfs_volume")]
    pub volume_name: String,
    /// Volume-relative path of the system disk template
    pub template_path: String,
    /// First entry is the system disk, the rest are blank data disks
    #[serde(rename = "guest_disks")]
    pub disk_specs: Vec<DiskSpec>,
    /// Opaque parameters for guest configuration rendering
    #[serde(rename = "writes")]
    pub write_params: serde_json::Value,
    /// Rendered libvirt domain descriptor
    #[serde(rename = "xml")]
    pub domain_xml: String,
}

impl CreationJob {
    /// Decode a queue payload
    pub fn decode(payload: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(payload)
    }
}

/// State of a single creation attempt
#[derive(Debug, Clone)]
pub struct GuestContext {
    pub job: CreationJob,
    /// Volume-relative working directory, `<instances_dir>/<guest_id>`
    pub guest_dir: String,
    /// Correlates all log lines of this attempt
    pub trace_id: String,
}

impl GuestContext {
    pub fn new(job: CreationJob, instances_dir: &str) -> Self {
        let guest_dir = format!("{}/{}", instances_dir.trim_matches('/'), job.guest_id);
        Self {
            job,
            guest_dir,
            trace_id: Uuid::now_v7().to_string(),
        }
    }

    pub fn guest_id(&self) -> &str {
        &self.job.guest_id
    }

    pub fn volume(&self) -> &str {
        &self.job.volume_name
    }

    pub fn system_disk(&self) -> Option<&DiskSpec> {
        self.job.disk_specs.first()
    }

    pub fn data_disks(&self) -> &[DiskSpec] {
        self.job.disk_specs.get(1..).unwrap_or(&[])
    }

    /// Volume-relative path of a disk image
    pub fn disk_path(&self, disk: &DiskSpec) -> String {
        format!("{}/{}", self.guest_dir, disk.file_name())
    }
}
