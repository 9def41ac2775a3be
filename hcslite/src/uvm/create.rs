//! Utility-VM creation.
//!
//! Resolves options, prepares the boot scratch (Windows) or verifies the
//! kernel/initrd pair (Linux), builds the HCS create document, merges any
//! caller-supplied JSON over it (caller wins), and hands the result to the
//! system handle.

use std::path::PathBuf;
use std::sync::Arc;

use hcslite_shared::errors::{HcsliteError, HcsliteResult, OpContext};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::UtilityVm;
use crate::hcs::{ComputeApi, DiskApi, GuestOs, System, SystemOptions};
use crate::schema::{
    self, Attachment, Chipset, ComputeSystemDocument, Devices, GuestInterface, Memory, Plan9,
    Processor, SchemaVersion, ScsiController, Topology, Uefi, UefiBootEntry, VirtualMachine,
    VirtualPMemController, VirtualSmb, VirtualSmbShare, vsmb_flag,
};
use crate::uvm::vpmem::MAX_VPMEM_DEVICES;

/// Default guest memory when the caller does not say.
const DEFAULT_MEMORY_MB: u64 = 1024;

/// File name of the boot scratch in the top-most layer folder.
const SCRATCH_VHDX: &str = "sandbox.vhdx";

/// File name of the platform's system template inside the utility-VM folder.
const SYSTEM_TEMPLATE_VHDX: &str = "SystemTemplate.vhdx";

/// Subdirectory of a base layer holding the utility-VM image.
const UTILITY_VM_DIR: &str = "UtilityVM";

/// Flag set used for the boot file share.
const BOOT_SHARE_FLAGS: u32 = vsmb_flag::READ_ONLY
    | vsmb_flag::SHARE_READ
    | vsmb_flag::CACHE_IO
    | vsmb_flag::PSEUDO_OPLOCKS
    | vsmb_flag::TAKE_BACKUP_PRIVILEGE;

/// Options for creating a utility VM.
///
/// Serializable because the VM shim receives its options document on stdin.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UvmOptions {
    /// Identifier; a GUID is generated when absent.
    pub id: Option<String>,
    /// Ownership token; defaults to the executable's basename.
    pub owner: Option<String>,
    /// Guest OS. Anything but windows/linux fails before reaching here
    /// because the type only parses those two.
    pub os: GuestOs,
    pub memory_mb: Option<u64>,
    pub processor_count: Option<u32>,
    /// Windows: layer folders, base first, scratch last. At least two.
    #[serde(default)]
    pub layer_folders: Vec<PathBuf>,
    /// Linux: directory holding the kernel and initrd.
    pub kird_path: Option<PathBuf>,
    /// Linux kernel file under `kird_path`.
    pub kernel_file: Option<String>,
    /// Linux initrd file under `kird_path`.
    pub initrd_file: Option<String>,
    /// Extra kernel boot options.
    pub boot_options: Option<String>,
    /// Wire up serial console, keyboard, mouse and video for debugging.
    #[serde(default)]
    pub debug: bool,
    /// Named pipe for the debug serial console.
    pub console_pipe: Option<String>,
    /// Caller-supplied JSON merged over the generated document; the caller
    /// wins on conflicts.
    pub additional_json: Option<Value>,
}

impl UvmOptions {
    pub fn new(os: GuestOs) -> Self {
        Self {
            id: None,
            owner: None,
            os,
            memory_mb: None,
            processor_count: None,
            layer_folders: Vec::new(),
            kird_path: None,
            kernel_file: None,
            initrd_file: None,
            boot_options: None,
            debug: false,
            console_pipe: None,
            additional_json: None,
        }
    }
}

impl UtilityVm {
    /// Create (but do not start) a utility VM.
    pub async fn create(
        api: Arc<dyn ComputeApi>,
        disk: Arc<dyn DiskApi>,
        options: UvmOptions,
        system_options: SystemOptions,
    ) -> HcsliteResult<Arc<UtilityVm>> {
        let id = options
            .id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let owner = options.owner.clone().unwrap_or_else(default_owner);
        let ctx = || OpContext::new("uvm::create").system(&id);

        let built = match options.os {
            GuestOs::Windows => build_windows(&id, &owner, &options, disk.as_ref())
                .await
                .map_err(|e| e.in_op(ctx()))?,
            GuestOs::Linux => build_linux(&owner, &options).map_err(|e| e.in_op(ctx()))?,
        };

        let mut document = serde_json::to_value(&built.document)?;
        if let Some(extra) = &options.additional_json {
            merge_json(&mut document, extra);
        }

        let system = System::create(api, &id, &owner, &document, system_options).await?;
        tracing::info!(uvm = %id, os = %options.os, "created utility vm");
        Ok(Arc::new(UtilityVm::new(
            system,
            options.os,
            built.scratch_path.as_deref(),
        )))
    }
}

#[derive(Debug)]
struct BuiltDocument {
    document: ComputeSystemDocument,
    scratch_path: Option<String>,
}

/// Processor count: the caller's choice, bounded by the host; a single-CPU
/// host always gets exactly one.
fn resolve_processor_count(requested: Option<u32>) -> u32 {
    let host = std::thread::available_parallelism()
        .map(|n| n.get() as u32)
        .unwrap_or(1);
    if host == 1 {
        return 1;
    }
    requested.unwrap_or(host).clamp(1, host)
}

fn topology(options: &UvmOptions) -> Topology {
    Topology {
        memory: Memory {
            size_in_mb: options.memory_mb.unwrap_or(DEFAULT_MEMORY_MB),
        },
        processor: Processor {
            count: resolve_processor_count(options.processor_count),
        },
    }
}

async fn build_windows(
    id: &str,
    owner: &str,
    options: &UvmOptions,
    disk: &dyn DiskApi,
) -> HcsliteResult<BuiltDocument> {
    if options.layer_folders.len() < 2 {
        return Err(HcsliteError::InvalidState(
            "a windows utility vm needs at least one base layer and a scratch folder".into(),
        ));
    }

    // The base image lives in whichever read-only layer carries UtilityVM\;
    // the scratch folder is the top-most (last) entry.
    let Some((scratch_folder, parents)) = options.layer_folders.split_last() else {
        return Err(HcsliteError::InvalidState("no layer folders".into()));
    };
    let uvm_folder = parents
        .iter()
        .map(|layer| layer.join(UTILITY_VM_DIR))
        .find(|candidate| candidate.exists())
        .ok_or_else(|| {
            HcsliteError::NotFound("no layer folder contains a utility-vm image".into())
        })?;

    let scratch = scratch_folder.join(SCRATCH_VHDX);
    if !scratch.exists() {
        let template = uvm_folder.join(SYSTEM_TEMPLATE_VHDX);
        tokio::fs::copy(&template, &scratch).await.map_err(|e| {
            HcsliteError::Io(format!(
                "copying {} to {}: {}",
                template.display(),
                scratch.display(),
                e
            ))
        })?;
        disk.grant_vm_access(id, &scratch).await?;
        tracing::debug!(uvm = id, scratch = %scratch.display(), "prepared boot scratch");
    }

    let boot_files = uvm_folder.join("Files");
    let boot_share = VirtualSmbShare {
        name: "os".into(),
        path: boot_files.to_string_lossy().into_owned(),
        flags: BOOT_SHARE_FLAGS,
    };

    let mut devices = Devices {
        virtual_smb: Some(VirtualSmb {
            shares: vec![boot_share],
        }),
        guest_interface: Some(GuestInterface {
            connect_to_bridge: true,
        }),
        ..Devices::default()
    };
    devices.scsi.insert(
        "0".into(),
        ScsiController {
            attachments: [(
                "0".into(),
                Attachment::virtual_disk(scratch.to_string_lossy().into_owned()),
            )]
            .into_iter()
            .collect(),
        },
    );
    apply_debug_devices(&mut devices, options);

    let document = ComputeSystemDocument {
        owner: owner.to_string(),
        schema_version: SchemaVersion::v2(),
        should_terminate_on_last_handle_closed: true,
        virtual_machine: Some(VirtualMachine {
            chipset: Chipset {
                uefi: Uefi {
                    boot_this: UefiBootEntry {
                        device_type: "VmbFs".into(),
                        device_path: r"\EFI\Microsoft\Boot\bootmgfw.efi".into(),
                        optional_data: None,
                    },
                },
            },
            compute_topology: topology(options),
            devices,
        }),
        container: None,
    };

    Ok(BuiltDocument {
        document,
        scratch_path: Some(scratch.to_string_lossy().into_owned()),
    })
}

fn build_linux(owner: &str, options: &UvmOptions) -> HcsliteResult<BuiltDocument> {
    let kird_path = options.kird_path.as_deref().ok_or_else(|| {
        HcsliteError::InvalidState("a linux utility vm needs a kernel/initrd directory".into())
    })?;
    let kernel_file = options.kernel_file.as_deref().unwrap_or("bootx64.efi");
    let initrd_file = options.initrd_file.as_deref().unwrap_or("initrd.img");

    for file in [kernel_file, initrd_file] {
        let path = kird_path.join(file);
        if !path.exists() {
            return Err(HcsliteError::NotFound(format!(
                "boot file {}",
                path.display()
            )));
        }
    }

    let boot_share = VirtualSmbShare {
        name: "os".into(),
        path: kird_path.to_string_lossy().into_owned(),
        flags: BOOT_SHARE_FLAGS,
    };

    let mut devices = Devices {
        virtual_smb: Some(VirtualSmb {
            shares: vec![boot_share],
        }),
        virtual_pmem: Some(VirtualPMemController {
            maximum_count: MAX_VPMEM_DEVICES,
        }),
        plan9: Some(Plan9::default()),
        guest_interface: Some(GuestInterface {
            connect_to_bridge: true,
        }),
        ..Devices::default()
    };
    apply_debug_devices(&mut devices, options);

    let mut boot_options = format!("initrd=/{}", initrd_file);
    if let Some(extra) = &options.boot_options {
        boot_options.push(' ');
        boot_options.push_str(extra);
    }

    let document = ComputeSystemDocument {
        owner: owner.to_string(),
        schema_version: SchemaVersion::v2(),
        should_terminate_on_last_handle_closed: true,
        virtual_machine: Some(VirtualMachine {
            chipset: Chipset {
                uefi: Uefi {
                    boot_this: UefiBootEntry {
                        device_type: "VmbFs".into(),
                        device_path: format!(r"\{}", kernel_file),
                        optional_data: Some(boot_options),
                    },
                },
            },
            compute_topology: topology(options),
            devices,
        }),
        container: None,
    };

    Ok(BuiltDocument {
        document,
        scratch_path: None,
    })
}

fn apply_debug_devices(devices: &mut Devices, options: &UvmOptions) {
    if !options.debug {
        return;
    }
    let pipe = options
        .console_pipe
        .clone()
        .unwrap_or_else(|| r"\\.\pipe\vmpipe-debug".into());
    devices.com_ports = Some(
        [(
            "0".to_string(),
            schema::ComPort { named_pipe: pipe },
        )]
        .into_iter()
        .collect(),
    );
    devices.keyboard = Some(Value::Object(Default::default()));
    devices.mouse = Some(Value::Object(Default::default()));
    devices.video_monitor = Some(Value::Object(Default::default()));
}

fn default_owner() -> String {
    std::env::current_exe()
        .ok()
        .and_then(|path| {
            path.file_stem()
                .map(|stem| stem.to_string_lossy().into_owned())
        })
        .unwrap_or_else(|| "hcslite".into())
}

/// Recursive merge of `extra` over `base`; the caller's values win. Objects
/// merge key by key, everything else replaces.
pub fn merge_json(base: &mut Value, extra: &Value) {
    match (base, extra) {
        (Value::Object(base_map), Value::Object(extra_map)) => {
            for (key, extra_value) in extra_map {
                match base_map.get_mut(key) {
                    Some(base_value) => merge_json(base_value, extra_value),
                    None => {
                        base_map.insert(key.clone(), extra_value.clone());
                    }
                }
            }
        }
        (base_slot, extra_value) => *base_slot = extra_value.clone(),
    }
}
