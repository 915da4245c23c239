//! libvirt hypervisor driven through the `virsh` CLI
//!
//! Every call runs `virsh -c <uri> <subcommand> ...` as a child process;
//! libvirtd serialises concurrent calls on its side, so the same
//! `VirshHypervisor` is safe to share between both engines.

use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info};

use super::{descriptor, Domain, Hypervisor};
use crate::config::HypervisorConfig;
use crate::error::{AgentError, HypervisorError};

/// Session to the local libvirt daemon
#[derive(Debug, Clone)]
pub struct VirshHypervisor {
    virsh_bin: PathBuf,
    uri: String,
}

impl VirshHypervisor {
    /// Open the session and verify the daemon answers
    ///
    /// Failure here is fatal to agent startup.
    pub async fn open(config: &HypervisorConfig) -> Result<Self, AgentError> {
        let hv = Self {
            virsh_bin: config.virsh_bin.clone(),
            uri: config.uri.clone(),
        };

        let canonical = hv
            .run(&["uri"], None)
            .await
            .map_err(|e| AgentError::ConnectionFailed(format!("{} ({})", e, hv.uri)))?;
        info!(uri = %canonical.trim(), "hypervisor connection opened");

        Ok(hv)
    }

    /// Run one virsh subcommand, optionally feeding `stdin`, and return stdout
    async fn run(&self, args: &[&str], stdin: Option<&str>) -> Result<String, HypervisorError> {
        debug!(args = ?args, "virsh");

        let mut child = Command::new(&self.virsh_bin)
            .arg("-c")
            .arg(&self.uri)
            .args(args)
            .stdin(if stdin.is_some() { Stdio::piped() } else { Stdio::null() })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        if let (Some(input), Some(mut pipe)) = (stdin, child.stdin.take()) {
            pipe.write_all(input.as_bytes()).await?;
            // closing the pipe signals EOF to virsh
            drop(pipe);
        }

        let output = child.wait_with_output().await?;
        if !output.status.success() {
            return Err(HypervisorError::Command {
                command: format!("virsh {}", args.join(" ")),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    async fn domain_op(&self, op: &str, domain: &Domain) -> Result<(), HypervisorError> {
        self.run(&[op, domain.uuid.as_str()], None).await.map(|_| ())
    }
}

#[async_trait]
impl Hypervisor for VirshHypervisor {
    async fn list_all_domains(&self) -> Result<Vec<Domain>, HypervisorError> {
        let out = self.run(&["list", "--all", "--uuid"], None).await?;
        Ok(parse_uuid_list(&out))
    }

    async fn define_xml(&self, xml: &str) -> Result<Domain, HypervisorError> {
        self.run(&["define", "/dev/stdin"], Some(xml)).await?;

        if let Some(uuid) = descriptor::domain_uuid(xml)? {
            return Ok(Domain::new(uuid));
        }

        // libvirt generated the uuid, ask for it by name
        let name = descriptor::domain_name(xml)?.ok_or_else(|| {
            HypervisorError::Descriptor("descriptor has neither uuid nor name".to_string())
        })?;
        let uuid = self.run(&["domuuid", name.as_str()], None).await?;
        Ok(Domain::new(uuid.trim()))
    }

    async fn create(&self, domain: &Domain) -> Result<(), HypervisorError> {
        self.domain_op("start", domain).await
    }

    async fn destroy(&self, domain: &Domain) -> Result<(), HypervisorError> {
        match self.domain_op("destroy", domain).await {
            Err(HypervisorError::Command { stderr, .. }) if is_not_running(&stderr) => {
                Err(HypervisorError::NotRunning(domain.uuid.clone()))
            }
            other => other,
        }
    }

    async fn undefine(&self, domain: &Domain) -> Result<(), HypervisorError> {
        self.domain_op("undefine", domain).await
    }

    async fn reboot(&self, domain: &Domain) -> Result<(), HypervisorError> {
        self.domain_op("reboot", domain).await
    }

    async fn shutdown(&self, domain: &Domain) -> Result<(), HypervisorError> {
        self.domain_op("shutdown", domain).await
    }

    async fn suspend(&self, domain: &Domain) -> Result<(), HypervisorError> {
        self.domain_op("suspend", domain).await
    }

    async fn resume(&self, domain: &Domain) -> Result<(), HypervisorError> {
        self.domain_op("resume", domain).await
    }

    async fn xml_desc(&self, domain: &Domain) -> Result<String, HypervisorError> {
        self.run(&["dumpxml", domain.uuid.as_str()], None).await
    }
}

/// Parse `virsh list --uuid` output, one uuid per line
fn parse_uuid_list(out: &str) -> Vec<Domain> {
    out.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(Domain::new)
        .collect()
}

fn is_not_running(stderr: &str) -> bool {
    stderr.contains("domain is not running")
}
