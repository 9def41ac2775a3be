//! The platform capability contract.
//!
//! The Host Compute Service is consumed through [`ComputeApi`], an opaque
//! capability with a defined contract. The production binding lives in
//! `crate::platform` behind `cfg(windows)`; tests drive the runtime through
//! an in-memory fake. Keeping the boundary here keeps every piece of domain
//! logic portable and testable.
//!
//! Contract notes:
//! - `create_system` returns the handle even when the platform reports the
//!   operation as pending; the caller always awaits the create-completed
//!   notification. The other asynchronous operations (start, shutdown,
//!   terminate, pause, resume) surface a pending platform result as
//!   `HcsliteError::Pending`, which the handle layer either awaits or treats
//!   as success depending on the operation.
//! - Notifications are delivered by invoking
//!   [`crate::hcs::callback::deliver`] with the callback number passed at
//!   registration time, on threads the platform owns.
//! - `unregister_callback` blocks until in-flight callbacks have returned.

use std::fs::File;

use async_trait::async_trait;
use hcslite_shared::HcsliteResult;
use std::path::Path;

/// Opaque token for a native system, process, or callback registration.
pub type RawHandle = u64;

/// Notification kinds delivered by the platform.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum NotificationKind {
    SystemExited,
    SystemCreateCompleted,
    SystemStartCompleted,
    SystemPauseCompleted,
    SystemResumeCompleted,
    SystemSaveCompleted,
    ProcessExited,
    ServiceDisconnect,
}

impl NotificationKind {
    /// Wire codes used by the platform callback.
    pub fn from_code(code: u32) -> Option<Self> {
        match code {
            0x0000_0001 => Some(Self::SystemExited),
            0x0000_0002 => Some(Self::SystemCreateCompleted),
            0x0000_0003 => Some(Self::SystemStartCompleted),
            0x0000_0004 => Some(Self::SystemPauseCompleted),
            0x0000_0005 => Some(Self::SystemResumeCompleted),
            0x0000_0006 => Some(Self::SystemSaveCompleted),
            0x0001_0000 => Some(Self::ProcessExited),
            0x0100_0000 => Some(Self::ServiceDisconnect),
            _ => None,
        }
    }

    pub fn code(self) -> u32 {
        match self {
            Self::SystemExited => 0x0000_0001,
            Self::SystemCreateCompleted => 0x0000_0002,
            Self::SystemStartCompleted => 0x0000_0003,
            Self::SystemPauseCompleted => 0x0000_0004,
            Self::SystemResumeCompleted => 0x0000_0005,
            Self::SystemSaveCompleted => 0x0000_0006,
            Self::ProcessExited => 0x0001_0000,
            Self::ServiceDisconnect => 0x0100_0000,
        }
    }
}

/// Raw stdio endpoints handed back by process creation.
///
/// Endpoints the caller takes out of this struct become the caller's
/// responsibility to close.
#[derive(Debug, Default)]
pub struct ProcessStdio {
    pub stdin: Option<File>,
    pub stdout: Option<File>,
    pub stderr: Option<File>,
}

/// Result of creating a process inside a compute system.
#[derive(Debug)]
pub struct ProcessCreated {
    pub process_id: u32,
    pub handle: RawHandle,
    pub stdio: ProcessStdio,
}

/// The Host Compute Service surface consumed by the runtime.
#[async_trait]
pub trait ComputeApi: Send + Sync {
    async fn create_system(&self, id: &str, document: &str) -> HcsliteResult<RawHandle>;
    async fn open_system(&self, id: &str) -> HcsliteResult<RawHandle>;
    async fn start_system(&self, handle: RawHandle, options: Option<&str>) -> HcsliteResult<()>;
    async fn shutdown_system(&self, handle: RawHandle, options: Option<&str>) -> HcsliteResult<()>;
    async fn terminate_system(&self, handle: RawHandle, options: Option<&str>)
    -> HcsliteResult<()>;
    async fn pause_system(&self, handle: RawHandle, options: Option<&str>) -> HcsliteResult<()>;
    async fn resume_system(&self, handle: RawHandle, options: Option<&str>) -> HcsliteResult<()>;
    async fn modify_system(&self, handle: RawHandle, request: &str) -> HcsliteResult<()>;
    async fn system_properties(&self, handle: RawHandle, query: &str) -> HcsliteResult<String>;
    fn close_system(&self, handle: RawHandle) -> HcsliteResult<()>;

    fn register_system_callback(
        &self,
        handle: RawHandle,
        callback_number: u64,
    ) -> HcsliteResult<RawHandle>;
    fn register_process_callback(
        &self,
        handle: RawHandle,
        callback_number: u64,
    ) -> HcsliteResult<RawHandle>;
    fn unregister_callback(&self, callback_handle: RawHandle) -> HcsliteResult<()>;

    async fn create_process(
        &self,
        system: RawHandle,
        document: &str,
    ) -> HcsliteResult<ProcessCreated>;
    async fn signal_process(&self, process: RawHandle, options: &str) -> HcsliteResult<()>;
    async fn terminate_process(&self, process: RawHandle) -> HcsliteResult<()>;
    async fn modify_process(&self, process: RawHandle, request: &str) -> HcsliteResult<()>;
    async fn process_properties(&self, process: RawHandle) -> HcsliteResult<String>;
    fn close_process(&self, process: RawHandle) -> HcsliteResult<()>;
}

/// Virtual-disk operations the runtime needs from the platform.
#[async_trait]
pub trait DiskApi: Send + Sync {
    /// Create an empty dynamic VHD of `size_gb` gibibytes at `path`.
    async fn create_vhd(&self, path: &Path, size_gb: u64) -> HcsliteResult<()>;

    /// Grant the VM identified by `vm_id` access to the file at `path`.
    async fn grant_vm_access(&self, vm_id: &str, path: &Path) -> HcsliteResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn notification_codes_round_trip() {
        for kind in [
            NotificationKind::SystemExited,
            NotificationKind::SystemCreateCompleted,
            NotificationKind::SystemStartCompleted,
            NotificationKind::SystemPauseCompleted,
            NotificationKind::SystemResumeCompleted,
            NotificationKind::SystemSaveCompleted,
            NotificationKind::ProcessExited,
            NotificationKind::ServiceDisconnect,
        ] {
            assert_eq!(NotificationKind::from_code(kind.code()), Some(kind));
        }
        assert_eq!(NotificationKind::from_code(0xdead_beef), None);
    }
}
