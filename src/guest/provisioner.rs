//! Guest provisioner
//!
//! Materialises a guest on its volume before the domain is defined:
//!
//! ```text
//! <volume>/<instances_dir>/<guest_id>/
//!     disk0.qcow2     ← system disk, overlay backed by the template
//!     disk1.qcow2     ← blank data disks
//!     config.json     ← rendered write parameters
//! ```
//!
//! The template's format is taken from its extension: `.raw` and `.img` are
//! raw images, `.vmdk` is VMDK, anything else is treated as qcow2.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info};

use super::{DiskSpec, GuestContext};
use crate::error::ProvisionError;
use crate::storage::MountedVolumeStore;

/// File the guest's write parameters are rendered into
pub const CONFIG_FILE: &str = "config.json";

/// Steps that build a guest's on-disk artifacts
#[async_trait]
pub trait GuestProvisioner: Send + Sync {
    /// Create the guest's working directory
    async fn generate_guest_dir(&self, guest: &GuestContext) -> Result<(), ProvisionError>;

    /// Create the system disk from the job's template
    async fn generate_system_image(&self, guest: &GuestContext) -> Result<(), ProvisionError>;

    /// Render the guest's configuration
    async fn init_config(&self, guest: &GuestContext) -> Result<(), ProvisionError>;

    /// Create the data disks
    async fn generate_disk_image(&self, guest: &GuestContext) -> Result<(), ProvisionError>;
}

/// Provisioner that builds images with `qemu-img` on mounted volumes
#[derive(Debug, Clone)]
pub struct QemuImgProvisioner {
    store: MountedVolumeStore,
    qemu_img_bin: PathBuf,
}

impl QemuImgProvisioner {
    pub fn new(store: MountedVolumeStore, qemu_img_bin: impl Into<PathBuf>) -> Self {
        Self {
            store,
            qemu_img_bin: qemu_img_bin.into(),
        }
    }

    fn disk_location(&self, guest: &GuestContext, disk: &DiskSpec) -> Result<PathBuf, ProvisionError> {
        Ok(self.store.resolve(guest.volume(), &guest.disk_path(disk))?)
    }

    async fn qemu_img(&self, args: &[&str]) -> Result<(), ProvisionError> {
        debug!(args = ?args, "qemu-img");

        let output = Command::new(&self.qemu_img_bin)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .await?;

        if !output.status.success() {
            return Err(ProvisionError::Command {
                command: format!("qemu-img {}", args.join(" ")),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(())
    }
}

fn path_arg(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

#[async_trait]
impl GuestProvisioner for QemuImgProvisioner {
    async fn generate_guest_dir(&self, guest: &GuestContext) -> Result<(), ProvisionError> {
        let dir = self.store.resolve(guest.volume(), &guest.guest_dir)?;
        tokio::fs::create_dir_all(&dir).await?;
        info!(guest_id = guest.guest_id(), dir = %dir.display(), "guest directory created");
        Ok(())
    }

    async fn generate_system_image(&self, guest: &GuestContext) -> Result<(), ProvisionError> {
        let disk = guest.system_disk().ok_or(ProvisionError::NoSystemDisk)?;
        let template = self.store.resolve(guest.volume(), &guest.job.template_path)?;
        let image = self.disk_location(guest, disk)?;

        let (template, image) = (path_arg(&template), path_arg(&image));
        let size = format!("{}G", disk.size_gb);
        let mut args = vec![
            "create",
            "-f",
            disk.format.as_str(),
            "-F",
            backing_format(&guest.job.template_path),
            "-b",
            template.as_str(),
            image.as_str(),
        ];
        if disk.size_gb > 0 {
            args.push(size.as_str());
        }
        self.qemu_img(&args).await
    }

    async fn init_config(&self, guest: &GuestContext) -> Result<(), ProvisionError> {
        let rendered = serde_json::to_vec_pretty(&guest.job.write_params)?;
        let path = self
            .store
            .resolve(guest.volume(), &format!("{}/{}", guest.guest_dir, CONFIG_FILE))?;
        tokio::fs::write(&path, rendered).await?;
        Ok(())
    }

    async fn generate_disk_image(&self, guest: &GuestContext) -> Result<(), ProvisionError> {
        for disk in guest.data_disks() {
            let image = path_arg(&self.disk_location(guest, disk)?);
            let size = format!("{}G", disk.size_gb);
            self.qemu_img(&["create", "-f", disk.format.as_str(), image.as_str(), size.as_str()])
                .await?;
        }
        Ok(())
    }
}

/// Backing file format for `qemu-img create -F`
fn backing_format(template_path: &str) -> &'static str {
    let ext = Path::new(template_path)
        .extension()
        .and_then(|ext| ext.to_str())
        .unwrap_or_default();
    match ext.to_ascii_lowercase().as_str() {
        "raw" | "img" => "raw",
        "vmdk" => "vmdk",
        _ => "qcow2",
    }
}
