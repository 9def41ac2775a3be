//! One-shot ext4 scratch creation for Linux containers.
//!
//! Formatting a fresh VHD needs a Linux kernel, so the work happens inside a
//! dedicated helper utility VM: create an empty VHD, hot-attach it, wait for
//! the SCSI device to surface in sysfs, find the block device name, run
//! mkfs.ext4 with the journal disabled, detach, and optionally seed a cache
//! so the next request is a plain file copy.

use std::io::Read;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use hcslite_shared::errors::{HcsliteError, HcsliteResult, OpContext};

use super::{UtilityVm, UvmOptions};
use crate::hcs::{ComputeApi, DiskApi, GuestOs, SystemOptions};
use crate::schema::ProcessDocument;

/// Size served from the cache.
pub const DEFAULT_SCRATCH_SIZE_GB: u64 = 20;

/// How long the SCSI device may take to surface in the guest.
const DEVICE_WAIT_TIMEOUT: Duration = Duration::from_secs(30);

/// Deadline for each short guest probe (`ls`).
const PROBE_TIMEOUT: Duration = Duration::from_secs(10);

/// Deadline for the format step.
const MKFS_TIMEOUT: Duration = Duration::from_secs(4 * 60);

/// Pause between sysfs probes.
const PROBE_INTERVAL: Duration = Duration::from_millis(500);

/// Produce an ext4-formatted VHD at `dest`.
///
/// A cache hit (the cache file exists and the default size was requested)
/// is a plain copy and spawns no helper VM. Otherwise the VHD is formatted
/// inside a helper VM built from `helper_options`, and the result seeds the
/// cache when a cache path was given.
pub async fn create_scratch(
    api: Arc<dyn ComputeApi>,
    disk: Arc<dyn DiskApi>,
    helper_options: UvmOptions,
    system_options: SystemOptions,
    dest: &Path,
    size_gb: u64,
    cache_path: Option<&Path>,
    vm_id: Option<&str>,
) -> HcsliteResult<()> {
    let ctx = || OpContext::new("uvm::create_scratch");

    if helper_options.os != GuestOs::Linux {
        return Err(HcsliteError::Unsupported(
            "scratch creation requires a linux helper vm".into(),
        )
        .in_op(ctx()));
    }

    if let Some(cache) = cache_path {
        if cache.exists() && size_gb == DEFAULT_SCRATCH_SIZE_GB {
            tracing::debug!(cache = %cache.display(), dest = %dest.display(), "scratch cache hit");
            copy_file(cache, dest).await.map_err(|e| e.in_op(ctx()))?;
            if let Some(vm_id) = vm_id {
                disk.grant_vm_access(vm_id, dest).await.map_err(|e| e.in_op(ctx()))?;
            }
            return Ok(());
        }
    }

    let uvm = UtilityVm::create(
        Arc::clone(&api),
        Arc::clone(&disk),
        helper_options,
        system_options,
    )
    .await?;
    uvm.start().await?;

    let format_result = format_in_vm(&uvm, disk.as_ref(), dest, size_gb).await;

    // The helper VM is disposable either way.
    let _ = uvm.terminate().await;
    let _ = uvm.wait().await;
    let _ = uvm.close().await;
    format_result.map_err(|e| e.in_op(ctx()))?;

    if let Some(vm_id) = vm_id {
        disk.grant_vm_access(vm_id, dest).await.map_err(|e| e.in_op(ctx()))?;
    }

    if let Some(cache) = cache_path {
        if !cache.exists() {
            copy_file(dest, cache).await.map_err(|e| e.in_op(ctx()))?;
            tracing::debug!(cache = %cache.display(), "seeded scratch cache");
        }
    }
    Ok(())
}

async fn format_in_vm(
    uvm: &UtilityVm,
    disk: &dyn DiskApi,
    dest: &Path,
    size_gb: u64,
) -> HcsliteResult<()> {
    let dest_str = dest.to_string_lossy().into_owned();
    disk.create_vhd(dest, size_gb).await?;

    // Attach without mounting; the guest only needs the raw device.
    let (_, lun) = uvm.add_scsi(&dest_str, Some("")).await?;

    let device_dir = format!("/sys/bus/scsi/devices/0:0:0:{}", lun);
    wait_for_device(uvm, &device_dir).await?;

    let listing = run_guest_command(
        uvm,
        &format!("ls {}/block", device_dir),
        PROBE_TIMEOUT,
    )
    .await?;
    if listing.exit_code != 0 {
        return Err(HcsliteError::Internal(format!(
            "listing {}/block failed with exit code {}",
            device_dir, listing.exit_code
        )));
    }
    let device = listing
        .stdout
        .split_whitespace()
        .next()
        .map(str::to_string)
        .ok_or_else(|| {
            HcsliteError::Internal(format!("no block device under {}", device_dir))
        })?;

    let mkfs = run_guest_command(
        uvm,
        &format!("mkfs.ext4 -q -E lazy_itable_init=1 -O ^has_journal /dev/{}", device),
        MKFS_TIMEOUT,
    )
    .await?;
    if mkfs.exit_code != 0 {
        return Err(HcsliteError::Internal(format!(
            "mkfs.ext4 on /dev/{} failed with exit code {}",
            device, mkfs.exit_code
        )));
    }

    uvm.remove_scsi(&dest_str).await?;
    tracing::info!(dest = %dest.display(), size_gb, "formatted scratch vhd");
    Ok(())
}

/// Poll the guest until the sysfs device directory appears.
async fn wait_for_device(uvm: &UtilityVm, device_dir: &str) -> HcsliteResult<()> {
    let deadline = tokio::time::Instant::now() + DEVICE_WAIT_TIMEOUT;
    loop {
        let probe = run_guest_command(uvm, &format!("ls {}", device_dir), PROBE_TIMEOUT).await?;
        if probe.exit_code == 0 {
            return Ok(());
        }
        if tokio::time::Instant::now() >= deadline {
            return Err(HcsliteError::Timeout(DEVICE_WAIT_TIMEOUT));
        }
        tokio::time::sleep(PROBE_INTERVAL).await;
    }
}

struct GuestOutput {
    exit_code: i32,
    stdout: String,
}

/// Run one command in the helper VM with its own deadline.
async fn run_guest_command(
    uvm: &UtilityVm,
    command_line: &str,
    timeout: Duration,
) -> HcsliteResult<GuestOutput> {
    let document = ProcessDocument {
        command_line: command_line.to_string(),
        create_std_out_pipe: true,
        create_std_err_pipe: true,
        ..Default::default()
    };
    let process = uvm.system().create_process(&document).await?;
    let stdio = process.stdio();

    if tokio::time::timeout(timeout, process.wait()).await.is_err() {
        let _ = process.kill().await;
        let _ = process.close().await;
        return Err(HcsliteError::Timeout(timeout)
            .in_op(OpContext::new("uvm::guest_command").system(uvm.id())));
    }

    let exit_code = process.exit_code().await?;
    let stdout = match stdio.stdout {
        Some(mut file) => {
            tokio::task::spawn_blocking(move || {
                let mut buffer = String::new();
                file.read_to_string(&mut buffer).map(|_| buffer)
            })
            .await
            .map_err(|e| HcsliteError::Internal(format!("stdout reader task: {}", e)))??
        }
        None => String::new(),
    };
    process.close().await?;

    tracing::trace!(uvm = %uvm.id(), command_line, exit_code, "guest command finished");
    Ok(GuestOutput { exit_code, stdout })
}

async fn copy_file(from: &Path, to: &Path) -> HcsliteResult<()> {
    if let Some(parent) = to.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::copy(from, to).await.map_err(|e| {
        HcsliteError::Io(format!(
            "copying {} to {}: {}",
            from.display(),
            to.display(),
            e
        ))
    })?;
    Ok(())
}
