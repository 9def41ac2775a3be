//! Container creation.
//!
//! The persisted record is the authoritative state; everything after the
//! record lands is unwound if a later step fails. Creation decides between
//! three shapes: a sandbox that boots a new utility VM (vmshim launch), a
//! secondary container joining its sandbox's VM (create-container request),
//! and a directly hosted container (in-process layer mount + create).

use std::path::{Path, PathBuf};

use chrono::Utc;
use hcslite_shared::errors::{HcsliteError, HcsliteResult, OpContext};
use hcslite_shared::protocol::{ShimOp, ShimRequest};

use super::HcsliteRuntime;
use super::record::{self, ContainerRecord, annotations};
use crate::hcs::{GuestOs, System};
use crate::layers::absolutize;
use crate::schema::{ComputeSystemDocument, ContainerDocument, Layer, SchemaVersion};
use crate::uvm::UvmOptions;
use crate::uvm::vsmb::share_name;

/// `create` subcommand inputs.
#[derive(Clone, Debug)]
pub struct CreateOptions {
    pub id: String,
    pub bundle: PathBuf,
    pub pid_file: Option<PathBuf>,
    pub shim_log: Option<PathBuf>,
    pub vm_log: Option<PathBuf>,
}

impl HcsliteRuntime {
    /// Create a container from an OCI bundle.
    pub async fn create(&self, options: CreateOptions) -> HcsliteResult<()> {
        let id = options.id.clone();
        let ctx = || OpContext::new("container::create").container(&id);

        if self.containers().exists(&id)? {
            return Err(
                HcsliteError::InvalidState(format!("container {} already exists", id))
                    .in_op(ctx()),
            );
        }

        let cwd = std::env::current_dir()?;
        let bundle = absolutize(&options.bundle, &cwd);
        let config = bundle.join("config.json");
        let mut spec = oci_spec::runtime::Spec::load(&config).map_err(|e| {
            HcsliteError::InvalidState(format!("loading {}: {}", config.display(), e)).in_op(ctx())
        })?;

        // Sandbox annotations decide who owns the utility VM.
        let (container_type, sandbox_annotation) = annotations::parse(&spec);
        let is_sandbox = container_type == annotations::ContainerType::Sandbox;
        let sandbox_id = match container_type {
            annotations::ContainerType::Container => sandbox_annotation.ok_or_else(|| {
                HcsliteError::InvalidState(
                    "a container-typed container needs a sandbox-id annotation".into(),
                )
                .in_op(ctx())
            })?,
            annotations::ContainerType::Sandbox => {
                if let Some(annotated) = sandbox_annotation {
                    if annotated != id {
                        return Err(HcsliteError::InvalidState(format!(
                            "sandbox-id annotation {} does not match the sandbox id",
                            annotated
                        ))
                        .in_op(ctx()));
                    }
                }
                id.clone()
            }
            annotations::ContainerType::None => id.clone(),
        };

        // Linux containers always need a VM; Windows only when the spec asks.
        let wants_vm = record::requests_hyperv(&spec) || record::is_linux_spec(&spec);
        let (new_vm, vm_isolated) = if is_sandbox || sandbox_id == id {
            (is_sandbox && wants_vm, is_sandbox && wants_vm)
        } else {
            let sandbox = self.containers().load_record(&sandbox_id).map_err(|e| e.in_op(ctx()))?;
            if !sandbox.is_sandbox {
                return Err(HcsliteError::InvalidState(format!(
                    "{} is not a sandbox",
                    sandbox_id
                ))
                .in_op(ctx()));
            }
            if wants_vm && !sandbox.vm_isolated {
                return Err(HcsliteError::InvalidState(format!(
                    "sandbox {} is not vm-isolated",
                    sandbox_id
                ))
                .in_op(ctx()));
            }
            (false, sandbox.vm_isolated)
        };

        absolutize_spec_paths(&mut spec, &cwd).map_err(|e| e.in_op(ctx()))?;

        let record = ContainerRecord {
            id: id.clone(),
            sandbox_id,
            bundle_path: bundle,
            created: Utc::now(),
            rootfs_path: None,
            spec: Box::new(spec),
            is_sandbox,
            vm_isolated,
        };
        self.containers().save_record(&record)?;

        if let Err(err) = self.create_inner(&record, new_vm, &options).await {
            tracing::warn!(container = %id, %err, "create failed; unwinding");
            let _ = self.containers().remove(&id);
            return Err(err.in_op(ctx()));
        }

        tracing::info!(container = %id, vm_isolated, new_vm, "created container");
        Ok(())
    }

    async fn create_inner(
        &self,
        record: &ContainerRecord,
        new_vm: bool,
        options: &CreateOptions,
    ) -> HcsliteResult<()> {
        let id = &record.id;
        let mut record = record.clone();

        if new_vm {
            let uvm_options = self.uvm_options_for(&record)?;
            let payload = serde_json::to_vec(&uvm_options)?;
            let mut args = vec![
                "vmshim".to_string(),
                "--id".to_string(),
                record.sandbox_id.clone(),
                "--data-dir".to_string(),
                self.options().data_dir.to_string_lossy().into_owned(),
            ];
            if let Some(log) = &options.vm_log {
                args.push("--log".to_string());
                args.push(log.to_string_lossy().into_owned());
            }
            let vmshim = self.shims().launch(&args, Some(payload)).await?;
            self.containers().set_vmshim_pid(id, vmshim.pid)?;
        }

        if record.vm_isolated {
            // The sandbox's VM shim creates the compute system inside its
            // utility VM, whether the VM is brand new or inherited.
            crate::shim::vmshim_request(
                self.options(),
                &record.sandbox_id,
                &ShimRequest {
                    id: id.clone(),
                    op: ShimOp::CreateContainer,
                },
            )
            .await?;
            self.containers().set_mounted(id, true)?;

            // Confirm the system exists before handing it to a shim.
            let system = System::open(self.api().clone(), id, self.system_options()).await?;
            system.close().await?;
        } else {
            let folders = record::layer_folders(&record.spec);
            if folders.is_empty() {
                return Err(HcsliteError::InvalidState(
                    "the spec names no layer folders".into(),
                ));
            }
            let rootfs = self.layers().mount(id, &folders).await?;
            self.containers().set_mounted(id, true)?;
            record.rootfs_path = Some(rootfs);
            self.containers().save_record(&record)?;

            let document = build_container_document(&record, None)?;
            let document = serde_json::to_value(&document)?;
            let system = System::create(
                self.api().clone(),
                id,
                &owner(),
                &document,
                self.system_options(),
            )
            .await?;
            system.close().await?;
        }

        let mut args = vec![
            "shim".to_string(),
            "--container".to_string(),
            id.clone(),
            "--data-dir".to_string(),
            self.options().data_dir.to_string_lossy().into_owned(),
        ];
        if let Some(log) = &options.shim_log {
            args.push("--log".to_string());
            args.push(log.to_string_lossy().into_owned());
        }
        let shim = self.shims().launch(&args, None).await?;
        self.containers().set_shim_pid(id, shim.pid)?;

        if let Some(pid_file) = &options.pid_file {
            tokio::fs::write(pid_file, shim.pid.to_string()).await?;
        }
        Ok(())
    }

    /// Utility-VM options for a sandbox's new VM, derived from its spec.
    pub(crate) fn uvm_options_for(&self, record: &ContainerRecord) -> HcsliteResult<UvmOptions> {
        let os = if record::is_linux_spec(&record.spec) {
            GuestOs::Linux
        } else {
            GuestOs::Windows
        };
        let mut uvm = UvmOptions::new(os);
        uvm.id = Some(record::vm_id(&record.sandbox_id));
        uvm.owner = Some(owner());
        match os {
            GuestOs::Windows => {
                uvm.layer_folders = record::layer_folders(&record.spec);
            }
            GuestOs::Linux => {
                uvm.kird_path = Some(self.options().kird_path());
            }
        }
        let value = record::spec_json(&record.spec);
        if let Some(limit) = value
            .pointer("/windows/resources/memory/limit")
            .and_then(serde_json::Value::as_u64)
        {
            uvm.memory_mb = Some(limit / (1024 * 1024));
        }
        if let Some(count) = value
            .pointer("/windows/resources/cpu/count")
            .and_then(serde_json::Value::as_u64)
        {
            uvm.processor_count = Some(count as u32);
        }
        Ok(uvm)
    }
}

/// Make the spec's filesystem references absolute against the working
/// directory, leaving extended-length paths untouched. The rewrite goes
/// through the spec's JSON form so only the two path fields are touched.
fn absolutize_spec_paths(
    spec: &mut oci_spec::runtime::Spec,
    cwd: &Path,
) -> HcsliteResult<()> {
    let mut value = serde_json::to_value(&*spec)?;

    if let Some(folders) = value
        .pointer_mut("/windows/layerFolders")
        .and_then(serde_json::Value::as_array_mut)
    {
        for folder in folders {
            if let Some(raw) = folder.as_str() {
                *folder = serde_json::json!(absolutize(Path::new(raw), cwd));
            }
        }
    }
    if let Some(root_path) = value.pointer_mut("/root/path") {
        if let Some(raw) = root_path.as_str() {
            *root_path = serde_json::json!(absolutize(Path::new(raw), cwd));
        }
    }

    *spec = serde_json::from_value(value)?;
    Ok(())
}

fn owner() -> String {
    std::env::current_exe()
        .ok()
        .and_then(|path| {
            path.file_stem()
                .map(|stem| stem.to_string_lossy().into_owned())
        })
        .unwrap_or_else(|| "hcslite".into())
}

/// Build the create document for a container, hosted directly or inside the
/// named utility VM.
pub fn build_container_document(
    record: &ContainerRecord,
    hosting_system_id: Option<&str>,
) -> HcsliteResult<ComputeSystemDocument> {
    let folders = record::layer_folders(&record.spec);

    // The top-most folder is the scratch; the rest are read-only layers.
    let Some((scratch, parents)) = folders.split_last() else {
        return Err(HcsliteError::InvalidState(
            "the spec names no layer folders".into(),
        ));
    };
    let layers = parents
        .iter()
        .map(|folder| Layer {
            id: share_name(&folder.to_string_lossy()),
            path: folder.to_string_lossy().into_owned(),
        })
        .collect();

    Ok(ComputeSystemDocument {
        owner: owner(),
        schema_version: SchemaVersion::v2(),
        should_terminate_on_last_handle_closed: false,
        virtual_machine: None,
        container: Some(ContainerDocument {
            system_type: "Container".into(),
            owner: owner(),
            layer_folder_path: Some(scratch.to_string_lossy().into_owned()),
            layers,
            hv_partition: false,
            hosting_system_id: hosting_system_id.map(str::to_string),
        }),
    })
}
