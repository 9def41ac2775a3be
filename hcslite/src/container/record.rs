//! The persisted container record and its typed store accessors.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use hcslite_shared::{HcsliteError, HcsliteResult};
use serde::{Deserialize, Serialize};

use crate::store::StateStore;

/// Store key holding the full record.
pub const KEY_STATE: &str = "state";
/// Store key holding the container shim pid.
pub const KEY_SHIM: &str = "shim";
/// Store key holding the VM shim pid (sandboxes with a utility VM only).
pub const KEY_VMSHIM: &str = "vmshim";
/// Store key flagging that layers are mounted.
pub const KEY_MOUNT: &str = "mount";
/// Prefix for host-pid → guest-pid mappings.
pub const PID_MAP_PREFIX: &str = "pid_map:";

/// Identifier of the utility VM owned by a sandbox container.
pub fn vm_id(sandbox_id: &str) -> String {
    format!("{}@vm", sandbox_id)
}

/// Authoritative persisted state of one container.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ContainerRecord {
    pub id: String,
    pub sandbox_id: String,
    pub bundle_path: PathBuf,
    pub created: DateTime<Utc>,
    pub rootfs_path: Option<PathBuf>,
    pub spec: Box<oci_spec::runtime::Spec>,
    pub is_sandbox: bool,
    pub vm_isolated: bool,
}

/// Typed view over the keyed document store.
#[derive(Clone)]
pub struct ContainerStore {
    store: Arc<dyn StateStore>,
}

impl ContainerStore {
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        Self { store }
    }

    pub fn save_record(&self, record: &ContainerRecord) -> HcsliteResult<()> {
        self.store
            .put(&record.id, KEY_STATE, &serde_json::to_value(record)?)
    }

    pub fn load_record(&self, id: &str) -> HcsliteResult<ContainerRecord> {
        match self.store.get(id, KEY_STATE)? {
            Some(value) => Ok(serde_json::from_value(value)?),
            None => Err(HcsliteError::NotFound(format!("container {}", id))),
        }
    }

    pub fn exists(&self, id: &str) -> HcsliteResult<bool> {
        Ok(self.store.get(id, KEY_STATE)?.is_some())
    }

    /// Delete every document for the container.
    pub fn remove(&self, id: &str) -> HcsliteResult<()> {
        self.store.delete_all(id)
    }

    pub fn list_ids(&self) -> HcsliteResult<Vec<String>> {
        self.store.list_ids()
    }

    pub fn set_shim_pid(&self, id: &str, pid: u32) -> HcsliteResult<()> {
        self.store.put(id, KEY_SHIM, &serde_json::json!(pid))
    }

    /// Zero when no shim pid was recorded.
    pub fn shim_pid(&self, id: &str) -> HcsliteResult<u32> {
        Ok(self
            .store
            .get(id, KEY_SHIM)?
            .and_then(|v| v.as_u64())
            .unwrap_or(0) as u32)
    }

    pub fn clear_shim_pid(&self, id: &str) -> HcsliteResult<()> {
        self.store.delete(id, KEY_SHIM)
    }

    pub fn set_vmshim_pid(&self, id: &str, pid: u32) -> HcsliteResult<()> {
        self.store.put(id, KEY_VMSHIM, &serde_json::json!(pid))
    }

    pub fn vmshim_pid(&self, id: &str) -> HcsliteResult<u32> {
        Ok(self
            .store
            .get(id, KEY_VMSHIM)?
            .and_then(|v| v.as_u64())
            .unwrap_or(0) as u32)
    }

    pub fn set_mounted(&self, id: &str, mounted: bool) -> HcsliteResult<()> {
        self.store.put(id, KEY_MOUNT, &serde_json::json!(mounted))
    }

    pub fn mounted(&self, id: &str) -> HcsliteResult<bool> {
        Ok(self
            .store
            .get(id, KEY_MOUNT)?
            .and_then(|v| v.as_bool())
            .unwrap_or(false))
    }

    pub fn set_pid_mapping(&self, id: &str, host_pid: u32, guest_pid: u32) -> HcsliteResult<()> {
        self.store.put(
            id,
            &format!("{}{}", PID_MAP_PREFIX, host_pid),
            &serde_json::json!(guest_pid),
        )
    }

    pub fn guest_pid(&self, id: &str, host_pid: u32) -> HcsliteResult<Option<u32>> {
        Ok(self
            .store
            .get(id, &format!("{}{}", PID_MAP_PREFIX, host_pid))?
            .and_then(|v| v.as_u64())
            .map(|pid| pid as u32))
    }
}

/// Sandbox annotations carried on the OCI spec.
pub mod annotations {
    /// `sandbox` or `container`.
    pub const CONTAINER_TYPE: &str = "io.kubernetes.cri.container-type";
    /// Names the owning sandbox for `container`-typed containers.
    pub const SANDBOX_ID: &str = "io.kubernetes.cri.sandbox-id";

    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub enum ContainerType {
        None,
        Sandbox,
        Container,
    }

    /// Read the sandbox annotations from a spec.
    pub fn parse(spec: &oci_spec::runtime::Spec) -> (ContainerType, Option<String>) {
        let Some(map) = spec.annotations().as_ref() else {
            return (ContainerType::None, None);
        };
        let container_type = match map.get(CONTAINER_TYPE).map(String::as_str) {
            Some("sandbox") => ContainerType::Sandbox,
            Some("container") => ContainerType::Container,
            _ => ContainerType::None,
        };
        (container_type, map.get(SANDBOX_ID).cloned())
    }
}

/// The spec in its canonical JSON form. Filesystem details of the windows
/// section are read through this shape rather than through typed accessors,
/// which keeps them stable against the spec model's representation choices.
pub fn spec_json(spec: &oci_spec::runtime::Spec) -> serde_json::Value {
    serde_json::to_value(spec).unwrap_or_default()
}

/// Whether the spec asks for hypervisor isolation.
pub fn requests_hyperv(spec: &oci_spec::runtime::Spec) -> bool {
    spec_json(spec).pointer("/windows/hyperv").is_some()
}

/// Whether the spec describes a Linux guest.
pub fn is_linux_spec(spec: &oci_spec::runtime::Spec) -> bool {
    let value = spec_json(spec);
    value.pointer("/linux").is_some() && value.pointer("/windows").is_none()
}

/// The spec's layer folders, if any.
pub fn layer_folders(spec: &oci_spec::runtime::Spec) -> Vec<PathBuf> {
    spec_json(spec)
        .pointer("/windows/layerFolders")
        .and_then(|folders| serde_json::from_value(folders.clone()).ok())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::SqliteStore;
    use oci_spec::runtime::Spec;

    fn store() -> ContainerStore {
        ContainerStore::new(Arc::new(SqliteStore::in_memory().unwrap()))
    }

    fn record(id: &str) -> ContainerRecord {
        ContainerRecord {
            id: id.to_string(),
            sandbox_id: id.to_string(),
            bundle_path: PathBuf::from("/bundles").join(id),
            created: Utc::now(),
            rootfs_path: None,
            spec: Box::new(Spec::default()),
            is_sandbox: true,
            vm_isolated: false,
        }
    }

    #[test]
    fn record_round_trips_through_the_store() {
        let store = store();
        let record = record("c1");
        store.save_record(&record).unwrap();

        let loaded = store.load_record("c1").unwrap();
        assert_eq!(loaded.id, record.id);
        assert_eq!(loaded.bundle_path, record.bundle_path);
        assert_eq!(loaded.created, record.created);
        assert!(loaded.is_sandbox);
    }

    #[test]
    fn missing_records_are_not_found() {
        let err = store().load_record("ghost").unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn auxiliary_keys_cover_shim_mount_and_pid_map() {
        let store = store();
        store.save_record(&record("c1")).unwrap();

        assert_eq!(store.shim_pid("c1").unwrap(), 0);
        store.set_shim_pid("c1", 4242).unwrap();
        assert_eq!(store.shim_pid("c1").unwrap(), 4242);

        assert!(!store.mounted("c1").unwrap());
        store.set_mounted("c1", true).unwrap();
        assert!(store.mounted("c1").unwrap());

        store.set_pid_mapping("c1", 100, 7).unwrap();
        assert_eq!(store.guest_pid("c1", 100).unwrap(), Some(7));
        assert_eq!(store.guest_pid("c1", 101).unwrap(), None);
    }

    #[test]
    fn remove_deletes_every_key() {
        let store = store();
        store.save_record(&record("c1")).unwrap();
        store.set_shim_pid("c1", 1).unwrap();
        store.set_mounted("c1", true).unwrap();

        store.remove("c1").unwrap();
        assert!(!store.exists("c1").unwrap());
        assert_eq!(store.shim_pid("c1").unwrap(), 0);
    }

    #[test]
    fn vm_id_is_a_pure_function_of_the_sandbox() {
        assert_eq!(vm_id("pod-1"), "pod-1@vm");
    }
}
