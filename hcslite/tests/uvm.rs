//! Integration tests for utility-VM resource management.

use std::sync::Arc;

use hcslite::hcs::{GuestOs, SystemOptions};
use hcslite::schema::vsmb_flag;
use hcslite::uvm::{UtilityVm, UvmOptions};
use hcslite::HcsliteError;
use hcslite_test_utils::{FakeCompute, FakeDisk};
use tempfile::TempDir;

// ============================================================================
// TEST FIXTURES
// ============================================================================

struct UvmContext {
    fake: FakeCompute,
    disk: FakeDisk,
    uvm: Arc<UtilityVm>,
    _dirs: TempDir,
}

async fn windows_uvm() -> UvmContext {
    let dirs = TempDir::new().unwrap();
    let base = dirs.path().join("base");
    let scratch = dirs.path().join("scratch");
    std::fs::create_dir_all(base.join("UtilityVM").join("Files")).unwrap();
    std::fs::write(
        base.join("UtilityVM").join("SystemTemplate.vhdx"),
        b"template",
    )
    .unwrap();
    std::fs::create_dir_all(&scratch).unwrap();

    let mut options = UvmOptions::new(GuestOs::Windows);
    options.id = Some("uvm-win".into());
    options.layer_folders = vec![base, scratch];

    let fake = FakeCompute::new();
    let disk = FakeDisk::new();
    let uvm = UtilityVm::create(
        fake.clone().arc(),
        Arc::new(disk.clone()),
        options,
        SystemOptions::default(),
    )
    .await
    .unwrap();
    UvmContext {
        fake,
        disk,
        uvm,
        _dirs: dirs,
    }
}

async fn linux_uvm() -> UvmContext {
    let dirs = TempDir::new().unwrap();
    std::fs::write(dirs.path().join("bootx64.efi"), b"efi").unwrap();
    std::fs::write(dirs.path().join("initrd.img"), b"initrd").unwrap();

    let mut options = UvmOptions::new(GuestOs::Linux);
    options.id = Some("uvm-lin".into());
    options.kird_path = Some(dirs.path().to_path_buf());

    let fake = FakeCompute::new();
    let disk = FakeDisk::new();
    let uvm = UtilityVm::create(
        fake.clone().arc(),
        Arc::new(disk.clone()),
        options,
        SystemOptions::default(),
    )
    .await
    .unwrap();
    UvmContext {
        fake,
        disk,
        uvm,
        _dirs: dirs,
    }
}

// ============================================================================
// CREATION
// ============================================================================

#[tokio::test]
async fn windows_creation_prepares_the_boot_scratch() {
    let ctx = windows_uvm().await;

    // The template was copied to sandbox.vhdx and the VM granted access.
    let scratch = ctx._dirs.path().join("scratch").join("sandbox.vhdx");
    assert!(scratch.exists());
    let grants = ctx.disk.grants();
    assert_eq!(grants.len(), 1);
    assert_eq!(grants[0].0, "uvm-win");
    assert_eq!(grants[0].1, scratch);

    // The scratch rides at SCSI (0, 0) in the create document.
    let document = ctx.fake.create_document("uvm-win").unwrap();
    let attachment = &document["VirtualMachine"]["Devices"]["Scsi"]["0"]["Attachments"]["0"];
    assert_eq!(attachment["Type"], "VirtualDisk");
    assert_eq!(
        attachment["Path"],
        scratch.to_string_lossy().into_owned().as_str()
    );

    // The boot share is read-only.
    let share = &document["VirtualMachine"]["Devices"]["VirtualSmb"]["Shares"][0];
    assert_eq!(share["Name"], "os");
    assert_ne!(share["Flags"].as_u64().unwrap() & vsmb_flag::READ_ONLY as u64, 0);
}

#[tokio::test]
async fn caller_json_wins_over_the_generated_document() {
    let dirs = TempDir::new().unwrap();
    std::fs::write(dirs.path().join("bootx64.efi"), b"efi").unwrap();
    std::fs::write(dirs.path().join("initrd.img"), b"initrd").unwrap();

    let mut options = UvmOptions::new(GuestOs::Linux);
    options.id = Some("uvm-merge".into());
    options.kird_path = Some(dirs.path().to_path_buf());
    options.memory_mb = Some(1024);
    options.additional_json = Some(serde_json::json!({
        "VirtualMachine": {"ComputeTopology": {"Memory": {"SizeInMB": 8192}}}
    }));

    let fake = FakeCompute::new();
    let _uvm = UtilityVm::create(
        fake.clone().arc(),
        FakeDisk::new().arc(),
        options,
        SystemOptions::default(),
    )
    .await
    .unwrap();

    let document = fake.create_document("uvm-merge").unwrap();
    assert_eq!(
        document["VirtualMachine"]["ComputeTopology"]["Memory"]["SizeInMB"],
        8192
    );
}

// ============================================================================
// SCSI
// ============================================================================

#[tokio::test]
async fn scsi_allocation_exhausts_at_255_slots() {
    let ctx = windows_uvm().await;

    for i in 0..255u32 {
        let (controller, lun) = ctx
            .uvm
            .allocate_scsi(&format!("disk-{}.vhdx", i))
            .await
            .unwrap();
        // LUNs advance 1..63 on controller 0, then move to controller 1.
        if i < 63 {
            assert_eq!((controller, lun), (0, (i + 1) as u8));
        } else if i == 63 {
            assert_eq!((controller, lun), (1, 0));
        }
    }

    let err = ctx.uvm.allocate_scsi("one-too-many.vhdx").await.unwrap_err();
    assert_eq!(err, HcsliteError::NoFreeSlots);
}

#[tokio::test]
async fn add_scsi_round_trip_and_duplicate_detection() {
    let ctx = windows_uvm().await;

    let (controller, lun) = ctx.uvm.add_scsi(r"C:\disks\d.vhdx", Some(r"C:\data")).await.unwrap();
    assert_eq!((controller, lun), (0, 1));
    assert_eq!(ctx.uvm.find_scsi(r"C:\disks\d.vhdx").await.unwrap(), (0, 1));

    let err = ctx
        .uvm
        .add_scsi(r"C:\disks\d.vhdx", None)
        .await
        .unwrap_err();
    assert!(matches!(err.root(), HcsliteError::AlreadyAttached(_)));

    // One add request with guest-hosted settings.
    let adds = ctx.fake.modify_log_matching("VirtualMachine/Devices/SCSI/0/1");
    assert_eq!(adds.len(), 1);
    assert_eq!(adds[0].request["RequestType"], "Add");
    assert_eq!(adds[0].request["HostedSettings"]["ContainerPath"], r"C:\data");
    assert_eq!(adds[0].request["HostedSettings"]["AttachOnly"], false);

    ctx.uvm.remove_scsi(r"C:\disks\d.vhdx").await.unwrap();
    let log = ctx.fake.modify_log_matching("VirtualMachine/Devices/SCSI/0/1");
    assert_eq!(log.len(), 2);
    assert_eq!(log[1].request["RequestType"], "Remove");

    // The slot returns to the pool.
    let err = ctx.uvm.find_scsi(r"C:\disks\d.vhdx").await.unwrap_err();
    assert!(matches!(err, HcsliteError::NotAttached(_)));
    assert_eq!(
        ctx.uvm.add_scsi(r"C:\disks\other.vhdx", None).await.unwrap(),
        (0, 1)
    );
}

#[tokio::test]
async fn add_scsi_beyond_controller_zero_is_too_many_attachments() {
    let ctx = windows_uvm().await;

    for i in 0..63u32 {
        ctx.uvm
            .add_scsi(&format!(r"C:\disks\d{}.vhdx", i), None)
            .await
            .unwrap();
    }
    let err = ctx
        .uvm
        .add_scsi(r"C:\disks\overflow.vhdx", None)
        .await
        .unwrap_err();
    assert!(matches!(err.root(), HcsliteError::TooManyAttachments));
    // The speculatively claimed slot was returned.
    let err = ctx.uvm.find_scsi(r"C:\disks\overflow.vhdx").await.unwrap_err();
    assert!(matches!(err, HcsliteError::NotAttached(_)));
}

#[tokio::test]
async fn failed_modify_rolls_the_scsi_table_back() {
    let ctx = windows_uvm().await;
    ctx.fake.fail_next_modify(HcsliteError::AccessDenied);

    let err = ctx.uvm.add_scsi(r"C:\disks\d.vhdx", None).await.unwrap_err();
    assert!(err.is_access_denied());
    let err = ctx.uvm.find_scsi(r"C:\disks\d.vhdx").await.unwrap_err();
    assert!(matches!(err, HcsliteError::NotAttached(_)));
}

#[tokio::test]
async fn the_scratch_slot_is_pinned_for_the_vm_lifetime() {
    let ctx = windows_uvm().await;
    let scratch = ctx._dirs.path().join("scratch").join("sandbox.vhdx");
    let err = ctx
        .uvm
        .remove_scsi(&scratch.to_string_lossy())
        .await
        .unwrap_err();
    assert!(matches!(err.root(), HcsliteError::InvalidState(_)));
}

// ============================================================================
// VSMB
// ============================================================================

#[tokio::test]
async fn vsmb_ref_counting_emits_one_add_and_one_remove() {
    let ctx = windows_uvm().await;
    let flags = vsmb_flag::READ_ONLY | vsmb_flag::SHARE_READ;

    let mut guid = String::new();
    for _ in 0..64 {
        guid = ctx.uvm.add_vsmb(r"C:\X", flags, None).await.unwrap();
    }
    assert!(!guid.is_empty());
    // Case-insensitive lookup converges on the same share.
    assert_eq!(ctx.uvm.vsmb_guid(r"c:\x").await.unwrap(), guid);
    assert_eq!(ctx.uvm.vsmb_ref_count(r"C:\X").await, Some(64));

    for _ in 0..64 {
        ctx.uvm.remove_vsmb(r"C:\X").await.unwrap();
    }
    let err = ctx.uvm.vsmb_guid(r"c:\x").await.unwrap_err();
    assert!(err.is_not_found());

    // Exactly one platform add and one remove for the share's GUID,
    // regardless of the ref-count churn.
    let log = ctx.fake.modify_log_matching(&guid);
    assert_eq!(log.len(), 2);
    assert_eq!(log[0].request["RequestType"], "Add");
    assert_eq!(log[0].request["Settings"]["Flags"], flags);
    assert_eq!(log[1].request["RequestType"], "Remove");
}

#[tokio::test]
async fn vsmb_requires_a_windows_guest() {
    let ctx = linux_uvm().await;
    let err = ctx
        .uvm
        .add_vsmb(r"C:\X", vsmb_flag::READ_ONLY, None)
        .await
        .unwrap_err();
    assert!(err.is_not_supported());
}

// ============================================================================
// PLAN9
// ============================================================================

#[tokio::test]
async fn plan9_ports_are_monotonic_and_shared_by_refs() {
    let ctx = linux_uvm().await;

    let first = ctx.uvm.add_plan9("/srv/a", "/a", true).await.unwrap();
    let again = ctx.uvm.add_plan9("/SRV/A", "/a", true).await.unwrap();
    assert_eq!(first, again);
    let second = ctx.uvm.add_plan9("/srv/b", "/b", false).await.unwrap();
    assert_eq!(second, first + 1);

    // One add per distinct share, with hosted settings for the guest.
    let adds = ctx.fake.modify_log_matching("plan9shares");
    assert_eq!(adds.len(), 2);
    assert_eq!(adds[0].request["HostedSettings"]["MountPath"], "/a");
    assert_eq!(adds[0].request["HostedSettings"]["ReadOnly"], true);
    assert_eq!(adds[0].request["HostedSettings"]["Port"], first);

    ctx.uvm.remove_plan9("/srv/a").await.unwrap();
    ctx.uvm.remove_plan9("/srv/a").await.unwrap();
    ctx.uvm.remove_plan9("/srv/b").await.unwrap();
    assert_eq!(ctx.fake.modify_log_matching("plan9shares").len(), 4);

    // A re-added share takes a fresh port, never a reused one.
    let third = ctx.uvm.add_plan9("/srv/a", "/a", true).await.unwrap();
    assert_eq!(third, second + 1);
}

#[tokio::test]
async fn plan9_requires_a_linux_guest() {
    let ctx = windows_uvm().await;
    let err = ctx.uvm.add_plan9("/srv/a", "/a", false).await.unwrap_err();
    assert!(err.is_not_supported());
}

// ============================================================================
// VPMEM
// ============================================================================

#[tokio::test]
async fn vpmem_devices_are_read_only_vhd1_records() {
    let ctx = linux_uvm().await;

    let device = ctx
        .uvm
        .add_vpmem("/layers/base.vhd", Some("/run/layers/0"))
        .await
        .unwrap();
    assert_eq!(device, 0);

    let adds = ctx.fake.modify_log_matching("VirtualPMem/Devices/0");
    assert_eq!(adds.len(), 1);
    assert_eq!(adds[0].request["Settings"]["ReadOnly"], true);
    assert_eq!(adds[0].request["Settings"]["ImageFormat"], "Vhd1");
    assert_eq!(
        adds[0].request["HostedSettings"]["MappedDevices"]["0"],
        "/run/layers/0"
    );

    // Second reference, same device, no new platform request.
    assert_eq!(
        ctx.uvm
            .add_vpmem("/layers/base.vhd", Some("/run/layers/0"))
            .await
            .unwrap(),
        0
    );
    assert_eq!(ctx.fake.modify_log_matching("VirtualPMem/Devices/0").len(), 1);

    ctx.uvm.remove_vpmem("/layers/base.vhd").await.unwrap();
    ctx.uvm.remove_vpmem("/layers/base.vhd").await.unwrap();
    let log = ctx.fake.modify_log_matching("VirtualPMem/Devices/0");
    assert_eq!(log.len(), 2);
    assert_eq!(log[1].request["RequestType"], "Remove");
}

// ============================================================================
// NAMESPACES
// ============================================================================

#[tokio::test]
async fn namespace_endpoints_are_tracked_per_vm() {
    let ctx = linux_uvm().await;
    ctx.uvm.add_namespace_endpoint("ns-1", "ep-a").await;
    ctx.uvm.add_namespace_endpoint("ns-1", "ep-b").await;
    assert_eq!(
        ctx.uvm.namespace_endpoints("ns-1").await,
        vec!["ep-a".to_string(), "ep-b".to_string()]
    );
    ctx.uvm.remove_namespace_endpoint("ns-1", "ep-a").await;
    assert_eq!(
        ctx.uvm.namespace_endpoints("ns-1").await,
        vec!["ep-b".to_string()]
    );
}
