//! Integration tests for ext4 scratch creation through a helper VM.

use std::sync::Arc;
use std::time::Duration;

use hcslite::hcs::{GuestOs, SystemOptions};
use hcslite::uvm::{self, UvmOptions};
use hcslite_test_utils::{FakeCompute, FakeDisk, ProcessScript};
use tempfile::TempDir;

fn helper_options(kird: &TempDir) -> UvmOptions {
    std::fs::write(kird.path().join("bootx64.efi"), b"efi").unwrap();
    std::fs::write(kird.path().join("initrd.img"), b"initrd").unwrap();
    let mut options = UvmOptions::new(GuestOs::Linux);
    options.kird_path = Some(kird.path().to_path_buf());
    options
}

/// Scripts for the three in-VM steps: the sysfs probe, the block-device
/// listing, and mkfs.
fn push_format_scripts(fake: &FakeCompute) {
    fake.push_process_script(ProcessScript {
        exit_code: 0,
        ..ProcessScript::default()
    });
    fake.push_process_script(ProcessScript {
        exit_code: 0,
        stdout: "sdb\n".into(),
        ..ProcessScript::default()
    });
    fake.push_process_script(ProcessScript {
        exit_code: 0,
        exit_delay: Duration::from_millis(10),
        ..ProcessScript::default()
    });
}

#[tokio::test]
async fn create_scratch_formats_in_a_helper_vm_and_seeds_the_cache() {
    let fake = FakeCompute::new();
    let disk = FakeDisk::new();
    let kird = TempDir::new().unwrap();
    let out = TempDir::new().unwrap();
    let dest = out.path().join("scratch.vhdx");
    let cache = out.path().join("cache").join("scratch.vhdx");

    push_format_scripts(&fake);
    uvm::create_scratch(
        fake.clone().arc(),
        Arc::new(disk.clone()),
        helper_options(&kird),
        SystemOptions::default(),
        &dest,
        uvm::DEFAULT_SCRATCH_SIZE_GB,
        Some(&cache),
        None,
    )
    .await
    .unwrap();

    // The requested size reached the disk layer, and the cache is a
    // byte-identical copy of the result.
    assert_eq!(std::fs::read(&dest).unwrap(), b"vhd:20gb");
    assert_eq!(std::fs::read(&cache).unwrap(), std::fs::read(&dest).unwrap());

    // The helper VM hot-attached the disk (attach-only, first free slot)
    // and detached it afterwards.
    let dest_str = dest.to_string_lossy().into_owned();
    let adds = fake.modify_log_matching(&dest_str);
    assert_eq!(adds.len(), 1);
    assert_eq!(adds[0].request["RequestType"], "Add");
    assert_eq!(adds[0].request["HostedSettings"]["AttachOnly"], true);

    let slot_log = fake.modify_log_matching("VirtualMachine/Devices/SCSI/0/0");
    assert_eq!(slot_log.len(), 2);
    assert_eq!(slot_log[1].request["RequestType"], "Remove");

    // One helper VM was spawned and torn down.
    assert_eq!(fake.created_system_count(), 1);
}

#[tokio::test]
async fn a_cache_hit_copies_without_spawning_a_helper_vm() {
    let fake = FakeCompute::new();
    let disk = FakeDisk::new();
    let kird = TempDir::new().unwrap();
    let out = TempDir::new().unwrap();
    let dest = out.path().join("first.vhdx");
    let cache = out.path().join("cache.vhdx");

    push_format_scripts(&fake);
    uvm::create_scratch(
        fake.clone().arc(),
        Arc::new(disk.clone()),
        helper_options(&kird),
        SystemOptions::default(),
        &dest,
        uvm::DEFAULT_SCRATCH_SIZE_GB,
        Some(&cache),
        None,
    )
    .await
    .unwrap();
    assert_eq!(fake.created_system_count(), 1);

    // Same parameters again: served from the cache, no new VM.
    let second = out.path().join("second.vhdx");
    uvm::create_scratch(
        fake.clone().arc(),
        Arc::new(disk.clone()),
        helper_options(&kird),
        SystemOptions::default(),
        &second,
        uvm::DEFAULT_SCRATCH_SIZE_GB,
        Some(&cache),
        None,
    )
    .await
    .unwrap();
    assert_eq!(std::fs::read(&second).unwrap(), b"vhd:20gb");
    assert_eq!(fake.created_system_count(), 1);
}

#[tokio::test]
async fn a_non_default_size_bypasses_the_cache() {
    let fake = FakeCompute::new();
    let disk = FakeDisk::new();
    let kird = TempDir::new().unwrap();
    let out = TempDir::new().unwrap();
    let cache = out.path().join("cache.vhdx");
    std::fs::write(&cache, b"vhd:20gb").unwrap();

    push_format_scripts(&fake);
    let dest = out.path().join("big.vhdx");
    uvm::create_scratch(
        fake.clone().arc(),
        Arc::new(disk.clone()),
        helper_options(&kird),
        SystemOptions::default(),
        &dest,
        64,
        Some(&cache),
        None,
    )
    .await
    .unwrap();

    assert_eq!(std::fs::read(&dest).unwrap(), b"vhd:64gb");
    // The pre-existing cache was left untouched.
    assert_eq!(std::fs::read(&cache).unwrap(), b"vhd:20gb");
    assert_eq!(fake.created_system_count(), 1);
}

#[tokio::test]
async fn a_failed_mkfs_surfaces_and_still_tears_the_helper_down() {
    let fake = FakeCompute::new();
    let kird = TempDir::new().unwrap();
    let out = TempDir::new().unwrap();

    fake.push_process_script(ProcessScript {
        exit_code: 0,
        ..ProcessScript::default()
    });
    fake.push_process_script(ProcessScript {
        exit_code: 0,
        stdout: "sdb\n".into(),
        ..ProcessScript::default()
    });
    fake.push_process_script(ProcessScript {
        exit_code: 1,
        ..ProcessScript::default()
    });

    let dest = out.path().join("broken.vhdx");
    let err = uvm::create_scratch(
        fake.clone().arc(),
        FakeDisk::new().arc(),
        helper_options(&kird),
        SystemOptions::default(),
        &dest,
        uvm::DEFAULT_SCRATCH_SIZE_GB,
        None,
        None,
    )
    .await
    .unwrap_err();
    assert!(err.to_string().contains("mkfs.ext4"));
}
