//! Lifecycle instructions
//!
//! Instructions arrive as `{"action": "...", "uuid": "..."}`; any other field
//! is ignored. A message missing either field is not an instruction.

use std::fmt;
use std::str::FromStr;

use serde::Deserialize;

/// Lifecycle command for one guest
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    Reboot,
    /// Hard destroy, then start
    ForceReboot,
    Shutdown,
    /// Hard destroy
    ForceShutdown,
    Boot,
    Suspend,
    Resume,
    /// Destroy, undefine and reclaim the guest's storage
    Delete,
    DiskResize,
    AttachDisk,
    DetachDisk,
    Migrate,
    /// Any action this agent does not know
    Unsupported(String),
}

impl Action {
    pub fn as_str(&self) -> &str {
        match self {
            Action::Reboot => "reboot",
            Action::ForceReboot => "force_reboot",
            Action::Shutdown => "shutdown",
            Action::ForceShutdown => "force_shutdown",
            Action::Boot => "boot",
            Action::Suspend => "suspend",
            Action::Resume => "resume",
            Action::Delete => "delete",
            Action::DiskResize => "disk-resize",
            Action::AttachDisk => "attach-disk",
            Action::DetachDisk => "detach-disk",
            Action::Migrate => "migrate",
            Action::Unsupported(name) => name,
        }
    }

    /// Metric label; unknown names collapse into one series
    pub fn label(&self) -> &str {
        match self {
            Action::Unsupported(_) => "unsupported",
            known => known.as_str(),
        }
    }
}

impl FromStr for Action {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "reboot" => Action::Reboot,
            "force_reboot" => Action::ForceReboot,
            "shutdown" => Action::Shutdown,
            "force_shutdown" => Action::ForceShutdown,
            "boot" => Action::Boot,
            "suspend" => Action::Suspend,
            "resume" => Action::Resume,
            "delete" => Action::Delete,
            "disk-resize" => Action::DiskResize,
            "attach-disk" => Action::AttachDisk,
            "detach-disk" => Action::DetachDisk,
            "migrate" => Action::Migrate,
            other => Action::Unsupported(other.to_string()),
        })
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Wire form; both fields optional so incomplete messages are distinguishable
/// from unparsable ones
#[derive(Debug, Deserialize)]
struct RawInstruction {
    action: Option<String>,
    uuid: Option<String>,
}

/// A complete instruction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstructionMessage {
    pub action: Action,
    pub guest_id: String,
}

impl InstructionMessage {
    /// Decode a channel payload
    ///
    /// `Err` for payloads that are not a JSON object of strings, `Ok(None)`
    /// when `action` or `uuid` is missing.
    pub fn decode(payload: &str) -> Result<Option<Self>, serde_json::Error> {
        let raw: RawInstruction = serde_json::from_str(payload)?;
        Ok(match (raw.action, raw.uuid) {
            (Some(action), Some(guest_id)) => Some(Self {
                action: action.parse().unwrap_or_else(|never| match never {}),
                guest_id,
            }),
            _ => None,
        })
    }
}
