//! Container status and the state JSON emitted by `state` and `list`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::record::ContainerRecord;

/// Observable lifecycle status of a container.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerStatus {
    Created,
    Running,
    Paused,
    Stopped,
    Unknown,
}

impl ContainerStatus {
    /// Map the platform's state string. An empty string means the system
    /// was created but never started.
    pub fn from_platform_state(state: &str) -> Self {
        match state {
            "" | "Created" => Self::Created,
            "Running" => Self::Running,
            "Paused" => Self::Paused,
            "Stopped" => Self::Stopped,
            _ => Self::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Stopped => "stopped",
            Self::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for ContainerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// The platform-agnostic state document for one container.
///
/// Carries the full persisted record alongside the derived status so a
/// reader can reconstruct the record from `list` output.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ContainerState {
    pub id: String,
    pub sandbox_id: String,
    pub bundle_path: std::path::PathBuf,
    pub created: DateTime<Utc>,
    pub rootfs_path: Option<std::path::PathBuf>,
    pub spec: Box<oci_spec::runtime::Spec>,
    pub is_sandbox: bool,
    pub vm_isolated: bool,
    pub status: ContainerStatus,
    pub shim_pid: u32,
}

impl ContainerState {
    pub fn new(record: ContainerRecord, status: ContainerStatus, shim_pid: u32) -> Self {
        Self {
            id: record.id,
            sandbox_id: record.sandbox_id,
            bundle_path: record.bundle_path,
            created: record.created,
            rootfs_path: record.rootfs_path,
            spec: record.spec,
            is_sandbox: record.is_sandbox,
            vm_isolated: record.vm_isolated,
            status,
            shim_pid,
        }
    }

    /// The persisted record this state was derived from.
    pub fn into_record(self) -> ContainerRecord {
        ContainerRecord {
            id: self.id,
            sandbox_id: self.sandbox_id,
            bundle_path: self.bundle_path,
            created: self.created,
            rootfs_path: self.rootfs_path,
            spec: self.spec,
            is_sandbox: self.is_sandbox,
            vm_isolated: self.vm_isolated,
        }
    }
}
