//! Utility-VM resource management.
//!
//! A [`UtilityVm`] composes a [`System`] handle with ref-counted resource
//! tables for SCSI disks, VSMB and Plan9 file shares, and VPMem devices.
//! High-level requests ("expose this VHD read-only", "share this
//! directory") become modify-settings requests plus guest-hosted-settings
//! payloads.
//!
//! Concurrency: one mutex serializes every table against the modify call it
//! belongs to. The platform expects a single modify at a time per utility
//! VM, and splitting the lock around the native call would let two callers
//! race the same ref-count with conflicting requests. Lock order is
//! container lock → VM lock → system lock, never reversed.

pub mod create;
pub mod netns;
pub mod plan9;
pub mod scratch;
pub mod scsi;
pub mod vpmem;
pub mod vsmb;

use std::sync::Arc;

use hcslite_shared::errors::{HcsliteError, HcsliteResult, OpContext};
use tokio::sync::Mutex;

use crate::hcs::{GuestOs, System};
use crate::schema::{
    self, Attachment, MappedPlan9Share, MappedVPMemController, MappedVirtualDisk, ModifyRequest,
    Plan9Share, RequestType, VirtualPMemDevice, VirtualSmbShare,
};
use netns::NamespaceTable;
use plan9::{Plan9Add, Plan9Remove, Plan9Table};
use scsi::ScsiTable;
use vpmem::{VpmemAdd, VpmemRemove, VpmemTable};
use vsmb::{VsmbAdd, VsmbRemove, VsmbTable};

pub use create::UvmOptions;
pub use scratch::{DEFAULT_SCRATCH_SIZE_GB, create_scratch};

struct UvmResources {
    scsi: ScsiTable,
    vsmb: VsmbTable,
    plan9: Plan9Table,
    vpmem: VpmemTable,
    namespaces: NamespaceTable,
}

/// A running utility VM and its attachments.
pub struct UtilityVm {
    system: Arc<System>,
    os: GuestOs,
    resources: Mutex<UvmResources>,
}

impl UtilityVm {
    pub(crate) fn new(system: Arc<System>, os: GuestOs, scratch_path: Option<&str>) -> Self {
        let mut scsi = ScsiTable::new();
        if let Some(path) = scratch_path {
            scsi.reserve_scratch(path);
        }
        Self {
            system,
            os,
            resources: Mutex::new(UvmResources {
                scsi,
                vsmb: VsmbTable::new(),
                plan9: Plan9Table::new(),
                vpmem: VpmemTable::new(),
                namespaces: NamespaceTable::new(),
            }),
        }
    }

    pub fn id(&self) -> &str {
        self.system.id()
    }

    pub fn os(&self) -> GuestOs {
        self.os
    }

    pub fn system(&self) -> &Arc<System> {
        &self.system
    }

    pub async fn start(&self) -> HcsliteResult<()> {
        self.system.start().await
    }

    pub async fn terminate(&self) -> HcsliteResult<()> {
        self.system.terminate().await
    }

    pub async fn wait(&self) -> HcsliteResult<()> {
        self.system.wait().await
    }

    pub async fn close(&self) -> HcsliteResult<()> {
        self.system.close().await
    }

    // ------------------------------------------------------------------
    // SCSI
    // ------------------------------------------------------------------

    /// Attach a virtual disk at the first free (controller, LUN) slot.
    ///
    /// `guest_path` controls the guest side: `None` attaches without guest
    /// settings, `Some("")` asks the guest to attach without mounting, and a
    /// non-empty path mounts the disk there.
    pub async fn add_scsi(
        &self,
        host_path: &str,
        guest_path: Option<&str>,
    ) -> HcsliteResult<(u8, u8)> {
        let ctx = || OpContext::new("uvm::add_scsi").system(self.id());
        let mut resources = self.resources.lock().await;

        if resources.scsi.find(host_path).is_some() {
            return Err(HcsliteError::AlreadyAttached(host_path.to_string()).in_op(ctx()));
        }

        let (controller, lun) = resources
            .scsi
            .allocate(host_path, guest_path.unwrap_or(""))
            .map_err(|e| e.in_op(ctx()))?;

        // Only controller 0 is wired up today.
        if controller > 0 {
            let _ = resources.scsi.deallocate(controller, lun);
            return Err(HcsliteError::TooManyAttachments.in_op(ctx()));
        }

        let request = ModifyRequest {
            resource_path: schema::scsi_resource_path(controller, lun),
            request_type: RequestType::Add,
            settings: Some(serde_json::to_value(Attachment::virtual_disk(host_path))?),
            hosted_settings: match guest_path {
                Some(path) => Some(serde_json::to_value(MappedVirtualDisk {
                    container_path: (!path.is_empty()).then(|| path.to_string()),
                    lun,
                    attach_only: path.is_empty(),
                })?),
                None => None,
            },
        };

        if let Err(err) = self.system.modify(&request).await {
            let _ = resources.scsi.deallocate(controller, lun);
            return Err(err.in_op(ctx()));
        }

        tracing::debug!(uvm = %self.id(), host_path, controller, lun, "attached scsi disk");
        Ok((controller, lun))
    }

    /// Detach the virtual disk holding `host_path`.
    pub async fn remove_scsi(&self, host_path: &str) -> HcsliteResult<()> {
        let ctx = || OpContext::new("uvm::remove_scsi").system(self.id());
        let mut resources = self.resources.lock().await;

        let (controller, lun, slot) = resources
            .scsi
            .find(host_path)
            .ok_or_else(|| HcsliteError::NotAttached(host_path.to_string()).in_op(ctx()))?;
        let guest_path = slot.guest_path.clone();

        // The VM's own scratch never detaches.
        if resources.scsi.pinned() == Some((controller, lun)) {
            return Err(HcsliteError::InvalidState(format!(
                "scsi slot ({}, {}) holds the utility VM scratch",
                controller, lun
            ))
            .in_op(ctx()));
        }

        let request = ModifyRequest {
            resource_path: schema::scsi_resource_path(controller, lun),
            request_type: RequestType::Remove,
            settings: None,
            hosted_settings: if guest_path.is_empty() {
                None
            } else {
                Some(serde_json::to_value(MappedVirtualDisk {
                    container_path: Some(guest_path),
                    lun,
                    attach_only: false,
                })?)
            },
        };

        self.system.modify(&request).await.map_err(|e| e.in_op(ctx()))?;
        resources
            .scsi
            .deallocate(controller, lun)
            .map_err(|e| e.in_op(ctx()))?;
        tracing::debug!(uvm = %self.id(), host_path, controller, lun, "detached scsi disk");
        Ok(())
    }

    /// The slot holding `host_path`, or `NotAttached`.
    pub async fn find_scsi(&self, host_path: &str) -> HcsliteResult<(u8, u8)> {
        let resources = self.resources.lock().await;
        resources
            .scsi
            .find(host_path)
            .map(|(controller, lun, _)| (controller, lun))
            .ok_or_else(|| HcsliteError::NotAttached(host_path.to_string()))
    }

    /// Claim a SCSI slot without emitting a platform request. Exposed for
    /// flows that build the attachment into a larger document.
    pub async fn allocate_scsi(&self, host_path: &str) -> HcsliteResult<(u8, u8)> {
        let mut resources = self.resources.lock().await;
        resources.scsi.allocate(host_path, "")
    }

    /// Return a slot claimed with [`UtilityVm::allocate_scsi`].
    pub async fn deallocate_scsi(&self, controller: u8, lun: u8) -> HcsliteResult<()> {
        let mut resources = self.resources.lock().await;
        resources.scsi.deallocate(controller, lun)
    }

    // ------------------------------------------------------------------
    // VSMB
    // ------------------------------------------------------------------

    /// Share a host directory into a Windows guest. Returns the share's
    /// stable GUID name.
    pub async fn add_vsmb(
        &self,
        host_path: &str,
        flags: u32,
        guest_path: Option<&str>,
    ) -> HcsliteResult<String> {
        let ctx = || OpContext::new("uvm::add_vsmb").system(self.id());
        if self.os != GuestOs::Windows {
            return Err(
                HcsliteError::Unsupported("vsmb shares require a windows guest".into())
                    .in_op(ctx()),
            );
        }

        let mut resources = self.resources.lock().await;
        match resources.vsmb.add(host_path, flags, guest_path) {
            VsmbAdd::Again { ref_count } => {
                tracing::trace!(uvm = %self.id(), host_path, ref_count, "vsmb share ref added");
                Ok(resources
                    .vsmb
                    .get(host_path)
                    .map(|s| s.guid.clone())
                    .unwrap_or_default())
            }
            VsmbAdd::First { guid } => {
                let request = ModifyRequest {
                    resource_path: schema::vsmb_resource_path(&guid),
                    request_type: RequestType::Add,
                    settings: Some(serde_json::to_value(VirtualSmbShare {
                        name: guid.clone(),
                        path: host_path.to_string(),
                        flags,
                    })?),
                    hosted_settings: None,
                };
                if let Err(err) = self.system.modify(&request).await {
                    resources.vsmb.forget(host_path);
                    return Err(err.in_op(ctx()));
                }
                tracing::debug!(uvm = %self.id(), host_path, %guid, "added vsmb share");
                Ok(guid)
            }
        }
    }

    /// Drop one reference to a VSMB share, removing it at zero.
    pub async fn remove_vsmb(&self, host_path: &str) -> HcsliteResult<()> {
        let ctx = || OpContext::new("uvm::remove_vsmb").system(self.id());
        let mut resources = self.resources.lock().await;

        match resources.vsmb.remove(host_path) {
            VsmbRemove::NotFound => {
                Err(HcsliteError::NotAttached(host_path.to_string()).in_op(ctx()))
            }
            VsmbRemove::Decremented { ref_count } => {
                tracing::trace!(uvm = %self.id(), host_path, ref_count, "vsmb share ref dropped");
                Ok(())
            }
            VsmbRemove::Removed { guid } => {
                let request = ModifyRequest {
                    resource_path: schema::vsmb_resource_path(&guid),
                    request_type: RequestType::Remove,
                    settings: None,
                    hosted_settings: None,
                };
                self.system.modify(&request).await.map_err(|e| e.in_op(ctx()))?;
                tracing::debug!(uvm = %self.id(), host_path, %guid, "removed vsmb share");
                Ok(())
            }
        }
    }

    /// The stable GUID name for a shared host path.
    pub async fn vsmb_guid(&self, host_path: &str) -> HcsliteResult<String> {
        let resources = self.resources.lock().await;
        resources
            .vsmb
            .get(host_path)
            .map(|share| share.guid.clone())
            .ok_or_else(|| HcsliteError::NotFound(format!("vsmb share for {}", host_path)))
    }

    /// Current reference count of a VSMB share, if present.
    pub async fn vsmb_ref_count(&self, host_path: &str) -> Option<u32> {
        let resources = self.resources.lock().await;
        resources.vsmb.get(host_path).map(|share| share.ref_count)
    }

    // ------------------------------------------------------------------
    // Plan9
    // ------------------------------------------------------------------

    /// Share a host directory into a Linux guest. Returns the 9p port.
    pub async fn add_plan9(
        &self,
        host_path: &str,
        guest_path: &str,
        read_only: bool,
    ) -> HcsliteResult<u32> {
        let ctx = || OpContext::new("uvm::add_plan9").system(self.id());
        if self.os != GuestOs::Linux {
            return Err(
                HcsliteError::Unsupported("plan9 shares require a linux guest".into())
                    .in_op(ctx()),
            );
        }

        let mut resources = self.resources.lock().await;
        match resources.plan9.add(host_path, guest_path, read_only) {
            Plan9Add::Again { ref_count, port } => {
                tracing::trace!(uvm = %self.id(), host_path, ref_count, "plan9 share ref added");
                Ok(port)
            }
            Plan9Add::First { guid, port } => {
                let request = ModifyRequest {
                    resource_path: schema::plan9_resource_path(&guid),
                    request_type: RequestType::Add,
                    settings: Some(serde_json::to_value(Plan9Share {
                        name: guid.clone(),
                        path: host_path.to_string(),
                        port,
                    })?),
                    hosted_settings: Some(serde_json::to_value(MappedPlan9Share {
                        mount_path: guest_path.to_string(),
                        port,
                        read_only,
                    })?),
                };
                if let Err(err) = self.system.modify(&request).await {
                    resources.plan9.forget(host_path);
                    return Err(err.in_op(ctx()));
                }
                tracing::debug!(uvm = %self.id(), host_path, port, "added plan9 share");
                Ok(port)
            }
        }
    }

    /// Drop one reference to a Plan9 share, removing it at zero.
    pub async fn remove_plan9(&self, host_path: &str) -> HcsliteResult<()> {
        let ctx = || OpContext::new("uvm::remove_plan9").system(self.id());
        let mut resources = self.resources.lock().await;

        match resources.plan9.remove(host_path) {
            Plan9Remove::NotFound => {
                Err(HcsliteError::NotAttached(host_path.to_string()).in_op(ctx()))
            }
            Plan9Remove::Decremented { ref_count } => {
                tracing::trace!(uvm = %self.id(), host_path, ref_count, "plan9 share ref dropped");
                Ok(())
            }
            Plan9Remove::Removed { guid } => {
                let request = ModifyRequest {
                    resource_path: schema::plan9_resource_path(&guid),
                    request_type: RequestType::Remove,
                    settings: None,
                    hosted_settings: None,
                };
                self.system.modify(&request).await.map_err(|e| e.in_op(ctx()))?;
                tracing::debug!(uvm = %self.id(), host_path, %guid, "removed plan9 share");
                Ok(())
            }
        }
    }

    // ------------------------------------------------------------------
    // VPMem
    // ------------------------------------------------------------------

    /// Expose a read-only VHD as a VPMem device. Returns the device number
    /// visible to the guest.
    pub async fn add_vpmem(
        &self,
        host_path: &str,
        guest_path: Option<&str>,
    ) -> HcsliteResult<u32> {
        let ctx = || OpContext::new("uvm::add_vpmem").system(self.id());
        if self.os != GuestOs::Linux {
            return Err(
                HcsliteError::Unsupported("vpmem devices require a linux guest".into())
                    .in_op(ctx()),
            );
        }

        let mut resources = self.resources.lock().await;
        match resources
            .vpmem
            .add(host_path, guest_path.unwrap_or(""))
            .map_err(|e| e.in_op(ctx()))?
        {
            VpmemAdd::Again { device, ref_count } => {
                tracing::trace!(uvm = %self.id(), host_path, device, ref_count, "vpmem ref added");
                Ok(device)
            }
            VpmemAdd::First { device } => {
                let request = ModifyRequest {
                    resource_path: schema::vpmem_resource_path(device),
                    request_type: RequestType::Add,
                    settings: Some(serde_json::to_value(VirtualPMemDevice::vhd1(host_path))?),
                    hosted_settings: match guest_path {
                        Some(path) if !path.is_empty() => {
                            Some(serde_json::to_value(MappedVPMemController {
                                mapped_devices: [(device, path.to_string())].into_iter().collect(),
                            })?)
                        }
                        _ => None,
                    },
                };
                if let Err(err) = self.system.modify(&request).await {
                    resources.vpmem.forget(device);
                    return Err(err.in_op(ctx()));
                }
                tracing::debug!(uvm = %self.id(), host_path, device, "added vpmem device");
                Ok(device)
            }
        }
    }

    /// Drop one reference to a VPMem device, removing it at zero.
    pub async fn remove_vpmem(&self, host_path: &str) -> HcsliteResult<()> {
        let ctx = || OpContext::new("uvm::remove_vpmem").system(self.id());
        let mut resources = self.resources.lock().await;

        let guest_path = resources
            .vpmem
            .find(host_path)
            .map(|device| resources.vpmem.get(device).guest_path.clone());

        match resources.vpmem.remove(host_path).map_err(|e| e.in_op(ctx()))? {
            VpmemRemove::Decremented { device, ref_count } => {
                tracing::trace!(uvm = %self.id(), host_path, device, ref_count, "vpmem ref dropped");
                Ok(())
            }
            VpmemRemove::Removed { device } => {
                let request = ModifyRequest {
                    resource_path: schema::vpmem_resource_path(device),
                    request_type: RequestType::Remove,
                    settings: None,
                    hosted_settings: match guest_path {
                        Some(path) if !path.is_empty() => {
                            Some(serde_json::to_value(MappedVPMemController {
                                mapped_devices: [(device, path)].into_iter().collect(),
                            })?)
                        }
                        _ => None,
                    },
                };
                self.system.modify(&request).await.map_err(|e| e.in_op(ctx()))?;
                tracing::debug!(uvm = %self.id(), host_path, device, "removed vpmem device");
                Ok(())
            }
        }
    }

    // ------------------------------------------------------------------
    // Network namespaces
    // ------------------------------------------------------------------

    pub async fn add_namespace_endpoint(&self, namespace: &str, endpoint: &str) {
        let mut resources = self.resources.lock().await;
        resources.namespaces.add_endpoint(namespace, endpoint);
    }

    pub async fn remove_namespace_endpoint(&self, namespace: &str, endpoint: &str) {
        let mut resources = self.resources.lock().await;
        resources.namespaces.remove_endpoint(namespace, endpoint);
    }

    pub async fn namespace_endpoints(&self, namespace: &str) -> Vec<String> {
        let resources = self.resources.lock().await;
        resources.namespaces.endpoints(namespace).to_vec()
    }
}

impl std::fmt::Debug for UtilityVm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UtilityVm")
            .field("id", &self.id())
            .field("os", &self.os)
            .finish_non_exhaustive()
    }
}
