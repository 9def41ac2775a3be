//! Integration tests for the system and process handles, driven through
//! the in-memory compute service.

use std::time::{Duration, Instant};

use hcslite::hcs::{GuestOs, System, SystemOptions};
use hcslite::schema::{
    ComputeSystemDocument, ContainerDocument, ProcessDocument, SchemaVersion, SignalOptions,
};
use hcslite::uvm::{UtilityVm, UvmOptions};
use hcslite_test_utils::{FakeCompute, FakeDisk, ProcessScript};
use tempfile::TempDir;

fn linux_uvm_options(kird: &TempDir) -> UvmOptions {
    std::fs::write(kird.path().join("bootx64.efi"), b"efi").unwrap();
    std::fs::write(kird.path().join("initrd.img"), b"initrd").unwrap();
    let mut options = UvmOptions::new(GuestOs::Linux);
    options.kird_path = Some(kird.path().to_path_buf());
    options.memory_mb = Some(1024);
    options.processor_count = Some(1);
    options
}

fn container_document() -> serde_json::Value {
    serde_json::to_value(ComputeSystemDocument {
        owner: "test".into(),
        schema_version: SchemaVersion::v2(),
        should_terminate_on_last_handle_closed: false,
        virtual_machine: None,
        container: Some(ContainerDocument {
            system_type: "Container".into(),
            owner: "test".into(),
            layer_folder_path: Some(r"C:\layers\scratch".into()),
            layers: Vec::new(),
            hv_partition: false,
            hosting_system_id: None,
        }),
    })
    .unwrap()
}

// ============================================================================
// SYSTEM LIFECYCLE
// ============================================================================

#[tokio::test]
async fn create_start_terminate_resolves_wait_exactly_once() {
    let fake = FakeCompute::new();
    let kird = TempDir::new().unwrap();
    let uvm = UtilityVm::create(
        fake.clone().arc(),
        FakeDisk::new().arc(),
        linux_uvm_options(&kird),
        SystemOptions::default(),
    )
    .await
    .unwrap();

    // The create document carries the requested topology.
    let document = fake.create_document(uvm.id()).unwrap();
    assert_eq!(
        document["VirtualMachine"]["ComputeTopology"]["Memory"]["SizeInMB"],
        1024
    );
    assert_eq!(
        document["VirtualMachine"]["ComputeTopology"]["Processor"]["Count"],
        1
    );

    uvm.start().await.unwrap();
    assert_eq!(fake.system_state(uvm.id()).as_deref(), Some("Running"));

    uvm.terminate().await.unwrap();
    // A requested terminate is a clean exit.
    uvm.wait().await.unwrap();
    // Later waits return the same value without blocking.
    uvm.wait().await.unwrap();
    uvm.system().exit_error().unwrap();

    uvm.close().await.unwrap();
    let err = uvm.start().await.unwrap_err();
    assert!(err.is_already_closed());
}

#[tokio::test]
async fn create_timeout_triggers_best_effort_terminate() {
    let fake = FakeCompute::new();
    fake.set_withhold_create_completed(true);

    let kird = TempDir::new().unwrap();
    let options = SystemOptions {
        create_timeout: Duration::from_millis(100),
        ..SystemOptions::default()
    };
    let err = UtilityVm::create(
        fake.clone().arc(),
        FakeDisk::new().arc(),
        linux_uvm_options(&kird),
        options,
    )
    .await
    .unwrap_err();
    assert!(err.is_timeout());
}

#[tokio::test]
async fn exit_error_is_not_exited_until_the_wait_block_resolves() {
    let fake = FakeCompute::new();
    let system = System::create(
        fake.clone().arc(),
        "c-exit",
        "test",
        &container_document(),
        SystemOptions::default(),
    )
    .await
    .unwrap();

    let err = system.exit_error().unwrap_err();
    assert_eq!(err, hcslite::HcsliteError::NotExited);

    system.terminate().await.unwrap();
    system.wait().await.unwrap();
    system.exit_error().unwrap();
    system.close().await.unwrap();
}

#[tokio::test]
async fn shutdown_twice_treats_already_stopped_as_success() {
    let fake = FakeCompute::new();
    let system = System::create(
        fake.clone().arc(),
        "c-shutdown",
        "test",
        &container_document(),
        SystemOptions::default(),
    )
    .await
    .unwrap();

    system.shutdown().await.unwrap();
    system.wait().await.unwrap();
    // The platform now reports already-stopped; shutdown still succeeds.
    system.shutdown().await.unwrap();
    system.terminate().await.unwrap();
    system.close().await.unwrap();
}

#[tokio::test]
async fn open_missing_system_is_not_found() {
    let fake = FakeCompute::new();
    let err = System::open(fake.arc(), "ghost", SystemOptions::default())
        .await
        .unwrap_err();
    assert!(err.is_not_found());
}

// ============================================================================
// PROCESSES
// ============================================================================

async fn test_system(fake: &FakeCompute, id: &str) -> std::sync::Arc<System> {
    System::create(
        fake.clone().arc(),
        id,
        "test",
        &container_document(),
        SystemOptions::default(),
    )
    .await
    .unwrap()
}

#[tokio::test]
async fn exit_code_is_invalid_state_before_exit_and_stable_after() {
    let fake = FakeCompute::new();
    fake.push_process_script(ProcessScript {
        exit_code: 7,
        exit_delay: Duration::from_millis(150),
        ..ProcessScript::default()
    });
    let system = test_system(&fake, "c-exitcode").await;

    let document = ProcessDocument {
        command_line: "cmd /c exit 7".into(),
        ..Default::default()
    };
    let process = system.create_process(&document).await.unwrap();

    let err = process.exit_code().await.unwrap_err();
    assert!(err.is_invalid_state());

    process.wait().await.unwrap();
    assert_eq!(process.exit_code().await.unwrap(), 7);
    assert_eq!(process.exit_code().await.unwrap(), 7);
    process.close().await.unwrap();
    system.close().await.unwrap();
}

#[tokio::test]
async fn failed_last_wait_result_reports_minus_one() {
    let fake = FakeCompute::new();
    fake.push_process_script(ProcessScript {
        exit_code: 5,
        last_wait_result: 0x8000_4005u32 as i32,
        ..ProcessScript::default()
    });
    let system = test_system(&fake, "c-lastwait").await;

    let process = system
        .create_process(&ProcessDocument {
            command_line: "x".into(),
            ..Default::default()
        })
        .await
        .unwrap();
    process.wait().await.unwrap();
    assert_eq!(process.exit_code().await.unwrap(), -1);
    process.close().await.unwrap();
    system.close().await.unwrap();
}

#[tokio::test]
async fn signal_after_exit_with_lost_notification_force_unblocks_within_a_second() {
    let fake = FakeCompute::new();
    fake.push_process_script(ProcessScript {
        exit_code: 42,
        exit_delay: Duration::from_millis(1),
        lose_exit_notification: true,
        ..ProcessScript::default()
    });
    let system = test_system(&fake, "c-race").await;

    let process = system
        .create_process(&ProcessDocument {
            command_line: "x".into(),
            ..Default::default()
        })
        .await
        .unwrap();

    // Let the process exit without its notification being delivered.
    tokio::time::sleep(Duration::from_millis(50)).await;

    // Not delivered because the process already exited; no error.
    let delivered = process.kill().await.unwrap();
    assert!(!delivered);

    // The deferred force-unblock resolves the wait channel.
    let started = Instant::now();
    let wait_result = tokio::time::timeout(Duration::from_secs(3), process.wait())
        .await
        .expect("wait did not unblock");
    assert!(wait_result.is_err());
    assert!(started.elapsed() >= Duration::from_millis(900));

    // The real exit code is still observable.
    assert_eq!(process.exit_code().await.unwrap(), 42);
    process.close().await.unwrap();
    system.close().await.unwrap();
}

#[tokio::test]
async fn signal_on_a_running_process_is_delivered() {
    let fake = FakeCompute::new();
    fake.push_process_script(ProcessScript {
        exit_delay: Duration::from_secs(30),
        ..ProcessScript::default()
    });
    let system = test_system(&fake, "c-signal").await;

    let process = system
        .create_process(&ProcessDocument {
            command_line: "sleep".into(),
            ..Default::default()
        })
        .await
        .unwrap();
    assert!(process.signal(&SignalOptions { signal: Some(15) }).await.unwrap());

    // Terminate delivers and the waiter observes the exit.
    assert!(process.kill().await.unwrap());
    process.wait().await.unwrap();
    assert_eq!(process.exit_code().await.unwrap(), 137);
    process.close().await.unwrap();
    system.close().await.unwrap();
}

#[tokio::test]
async fn stdio_is_handed_out_at_most_once() {
    let fake = FakeCompute::new();
    fake.push_process_script(ProcessScript {
        stdout: "hello".into(),
        ..ProcessScript::default()
    });
    let system = test_system(&fake, "c-stdio").await;

    let process = system
        .create_process(&ProcessDocument {
            command_line: "echo hello".into(),
            create_std_out_pipe: true,
            ..Default::default()
        })
        .await
        .unwrap();

    let first = process.stdio();
    assert!(first.stdout.is_some());
    let second = process.stdio();
    assert!(second.stdout.is_none());

    process.wait().await.unwrap();
    process.close().await.unwrap();
    system.close().await.unwrap();
}

#[tokio::test]
async fn platform_connect_refuses_non_windows_hosts() {
    if cfg!(windows) {
        return;
    }
    let err = hcslite::platform::connect().err().expect("must refuse");
    assert!(err.is_not_supported());
}
