//! The VM shim.
//!
//! Owns a sandbox's utility VM: creates and starts the VM from the options
//! document its parent handed over, signals readiness, then serves per-VM
//! requests on the sandbox's vmshim pipe until the VM exits.

use hcslite_shared::errors::{HcsliteError, HcsliteResult};
use hcslite_shared::protocol::{self, ShimOp, ShimRequest};
use hcslite_shared::PipeAddr;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use super::ShimEnv;
use super::spawn::ReadySignal;
use crate::container::create::build_container_document;
use crate::container::record;
use crate::hcs::System;
use crate::layers::UnmountOp;
use crate::pipe::{self, PipeStream};
use crate::uvm::{UtilityVm, UvmOptions};

/// Run the VM shim for `sandbox_id`. `ready` fires once the VM is serving.
/// Returns the process exit code.
pub async fn run(
    env: ShimEnv,
    sandbox_id: String,
    options: UvmOptions,
    ready: ReadySignal,
) -> HcsliteResult<i32> {
    let uvm = UtilityVm::create(
        env.api.clone(),
        env.disk.clone(),
        options,
        env.options.system_options(None),
    )
    .await?;
    uvm.start().await?;

    let addr = PipeAddr::vmshim(&sandbox_id);
    let mut listener = pipe::listen(&addr, &env.options.pipe_dir).await?;

    ready();
    tracing::info!(sandbox = %sandbox_id, uvm = %uvm.id(), "vm shim serving");

    // Serve until the utility VM exits.
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok(stream) => {
                        if let Err(err) = handle_connection(&env, &uvm, stream).await {
                            tracing::warn!(sandbox = %sandbox_id, %err, "request failed");
                        }
                    }
                    Err(err) => {
                        tracing::warn!(sandbox = %sandbox_id, %err, "accept failed");
                    }
                }
            }
            terminal = uvm.wait() => {
                match terminal {
                    Ok(()) => tracing::info!(sandbox = %sandbox_id, "utility vm exited"),
                    Err(err) => {
                        tracing::warn!(sandbox = %sandbox_id, %err, "utility vm exited with error")
                    }
                }
                break;
            }
        }
    }

    let _ = uvm.close().await;
    Ok(0)
}

/// One request per connection: framed JSON in, marker or error text out,
/// half-close, then drain so the requester sees completed cleanup.
async fn handle_connection(
    env: &ShimEnv,
    uvm: &UtilityVm,
    mut stream: PipeStream,
) -> HcsliteResult<()> {
    let request: ShimRequest = protocol::read_message(&mut stream).await?;
    tracing::debug!(op = %request.op, container = %request.id, "vm shim request");

    match serve(env, uvm, &request).await {
        Ok(()) => protocol::write_success(&mut stream).await?,
        Err(err) => {
            tracing::warn!(op = %request.op, container = %request.id, %err, "request failed");
            protocol::write_error_text(&mut stream, &err).await?;
        }
    }
    stream.shutdown().await?;
    let mut drain = Vec::new();
    let _ = stream.read_to_end(&mut drain).await;
    Ok(())
}

async fn serve(env: &ShimEnv, uvm: &UtilityVm, request: &ShimRequest) -> HcsliteResult<()> {
    match request.op {
        ShimOp::CreateContainer => create_container(env, uvm, &request.id).await,
        ShimOp::UnmountContainer => unmount(env, &request.id, UnmountOp::All).await,
        ShimOp::UnmountContainerDiskOnly => unmount(env, &request.id, UnmountOp::DiskOnly).await,
        ShimOp::SyncNamespace => Err(HcsliteError::Unsupported(
            "sync-namespace is not implemented".into(),
        )),
    }
}

/// Create the container's compute system inside this utility VM.
async fn create_container(env: &ShimEnv, uvm: &UtilityVm, container_id: &str) -> HcsliteResult<()> {
    let record = env.containers.load_record(container_id)?;
    let document = build_container_document(&record, Some(uvm.id()))?;
    let document = serde_json::to_value(&document)?;

    let system = System::create(
        env.api.clone(),
        container_id,
        uvm.system().owner(),
        &document,
        env.options.system_options(None),
    )
    .await?;
    // The container shim opens its own handle later.
    system.close().await?;
    tracing::info!(container = container_id, uvm = %uvm.id(), "created container in vm");
    Ok(())
}

async fn unmount(env: &ShimEnv, container_id: &str, op: UnmountOp) -> HcsliteResult<()> {
    let record = env.containers.load_record(container_id)?;
    env.layers
        .unmount(container_id, &record::layer_folders(&record.spec), op)
        .await?;
    if op == UnmountOp::All {
        env.containers.set_mounted(container_id, false)?;
    }
    Ok(())
}
