//! Integration tests for the container state machine, with shim helpers
//! running in-process against the in-memory compute service.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use hcslite::container::record::vm_id;
use hcslite::{
    ContainerState, ContainerStatus, CreateOptions, HcsliteError, HcsliteRuntime, RuntimeOptions,
    SqliteStore,
};
use hcslite_test_utils::{FakeCompute, FakeDisk, FakeLayers, InProcessShims, ProcessScript};
use tempfile::TempDir;

// ============================================================================
// TEST FIXTURES
// ============================================================================

struct TestContext {
    runtime: HcsliteRuntime,
    fake: FakeCompute,
    layers: Arc<FakeLayers>,
    dirs: TempDir,
}

impl TestContext {
    fn new() -> Self {
        let dirs = TempDir::new().expect("temp dir");
        let options = RuntimeOptions::with_data_dir(dirs.path().join("data"));
        let fake = FakeCompute::new();
        let layers = Arc::new(FakeLayers::new());
        let store = Arc::new(SqliteStore::open(&options.store_path()).expect("store"));

        let runtime = HcsliteRuntime::new(
            options,
            fake.clone().arc(),
            FakeDisk::new().arc(),
            layers.clone(),
            store,
        );
        let shims = InProcessShims::new(runtime.shim_env()).arc();
        let runtime = runtime.with_shim_launcher(shims);
        Self {
            runtime,
            fake,
            layers,
            dirs,
        }
    }

    /// A windows bundle whose base layer carries the utility-VM image.
    fn write_bundle(&self, name: &str, hyperv: bool, annotations: &[(&str, &str)]) -> PathBuf {
        let bundle = self.dirs.path().join(name);
        let base = bundle.join("layers").join("base");
        let scratch = bundle.join("layers").join("scratch");
        std::fs::create_dir_all(base.join("UtilityVM").join("Files")).unwrap();
        std::fs::write(
            base.join("UtilityVM").join("SystemTemplate.vhdx"),
            b"template",
        )
        .unwrap();
        std::fs::create_dir_all(&scratch).unwrap();

        let mut windows = serde_json::json!({
            "layerFolders": [base, scratch],
        });
        if hyperv {
            windows["hyperv"] = serde_json::json!({});
        }
        let annotations: serde_json::Map<String, serde_json::Value> = annotations
            .iter()
            .map(|(key, value)| ((*key).to_string(), serde_json::json!(value)))
            .collect();
        let config = serde_json::json!({
            "ociVersion": "1.0.2",
            "process": {"args": ["cmd", "/c", "ping -t localhost"], "cwd": "C:\\"},
            "windows": windows,
            "annotations": annotations,
        });
        std::fs::write(
            bundle.join("config.json"),
            serde_json::to_string_pretty(&config).unwrap(),
        )
        .unwrap();
        bundle
    }

    async fn create(&self, id: &str, bundle: &Path) {
        self.runtime
            .create(CreateOptions {
                id: id.to_string(),
                bundle: bundle.to_path_buf(),
                pid_file: None,
                shim_log: None,
                vm_log: None,
            })
            .await
            .unwrap()
    }
}

async fn wait_until(what: &str, mut check: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !check() {
        assert!(Instant::now() < deadline, "timed out waiting for {}", what);
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

// ============================================================================
// DIRECTLY HOSTED CONTAINERS
// ============================================================================

#[tokio::test]
async fn create_persists_mounts_and_launches_a_shim() {
    let ctx = TestContext::new();
    let bundle = ctx.write_bundle("c1", false, &[]);
    let pid_file = ctx.dirs.path().join("c1.pid");

    ctx.runtime
        .create(CreateOptions {
            id: "c1".into(),
            bundle,
            pid_file: Some(pid_file.clone()),
            shim_log: None,
            vm_log: None,
        })
        .await
        .unwrap();

    assert!(ctx.runtime.containers().exists("c1").unwrap());
    assert!(ctx.fake.has_system("c1"));
    assert_eq!(ctx.layers.mounted(), vec!["c1".to_string()]);
    assert!(ctx.runtime.containers().mounted("c1").unwrap());

    // The shim pid landed in the store and the pid file.
    let shim_pid = ctx.runtime.containers().shim_pid("c1").unwrap();
    assert_ne!(shim_pid, 0);
    assert_eq!(
        std::fs::read_to_string(&pid_file).unwrap(),
        shim_pid.to_string()
    );

    let (status, _) = ctx.runtime.status("c1").await.unwrap();
    assert_eq!(status, ContainerStatus::Created);

    // The record kept the mounted rootfs.
    let record = ctx.runtime.containers().load_record("c1").unwrap();
    assert!(record.rootfs_path.is_some());
    assert!(!record.vm_isolated);
}

#[tokio::test]
async fn duplicate_create_is_invalid_state() {
    let ctx = TestContext::new();
    let bundle = ctx.write_bundle("c1", false, &[]);
    ctx.create("c1", &bundle).await;

    let err = ctx
        .runtime
        .create(CreateOptions {
            id: "c1".into(),
            bundle,
            pid_file: None,
            shim_log: None,
            vm_log: None,
        })
        .await
        .unwrap_err();
    assert!(matches!(err.root(), HcsliteError::InvalidState(_)));
}

#[tokio::test]
async fn start_runs_init_and_exit_removes_the_persisted_state() {
    let ctx = TestContext::new();
    // Init exits almost immediately with code 0.
    ctx.fake.push_process_script(ProcessScript {
        exit_code: 0,
        exit_delay: Duration::from_millis(20),
        ..ProcessScript::default()
    });

    let bundle = ctx.write_bundle("c1", false, &[]);
    ctx.create("c1", &bundle).await;
    ctx.runtime.start("c1").await.unwrap();

    // Exit flow: init exits, the shim drives shutdown, state is removed.
    wait_until("the record to be removed", || {
        !ctx.runtime.containers().exists("c1").unwrap()
    })
    .await;
    wait_until("the system to stop", || {
        ctx.fake.system_state("c1").as_deref() == Some("Stopped")
    })
    .await;
    assert!(
        ctx.layers
            .unmounted()
            .iter()
            .any(|(id, _)| id == "c1"),
        "layers were unmounted on exit"
    );
}

#[tokio::test]
async fn pause_and_resume_follow_the_platform_state() {
    let ctx = TestContext::new();
    // Keep init running so the container stays up.
    ctx.fake.push_process_script(ProcessScript {
        exit_delay: Duration::from_secs(60),
        ..ProcessScript::default()
    });

    let bundle = ctx.write_bundle("c1", false, &[]);
    ctx.create("c1", &bundle).await;
    ctx.runtime.start("c1").await.unwrap();

    let (status, _) = ctx.runtime.status("c1").await.unwrap();
    assert_eq!(status, ContainerStatus::Running);

    ctx.runtime.pause("c1").await.unwrap();
    let (status, _) = ctx.runtime.status("c1").await.unwrap();
    assert_eq!(status, ContainerStatus::Paused);

    ctx.runtime.resume("c1").await.unwrap();
    let (status, _) = ctx.runtime.status("c1").await.unwrap();
    assert_eq!(status, ContainerStatus::Running);

    ctx.runtime.remove("c1", true).await.unwrap();
    assert!(!ctx.runtime.containers().exists("c1").unwrap());
}

#[tokio::test]
async fn exec_propagates_the_process_exit_code() {
    let ctx = TestContext::new();
    ctx.fake.push_process_script(ProcessScript {
        exit_delay: Duration::from_secs(60),
        ..ProcessScript::default()
    });

    let bundle = ctx.write_bundle("c1", false, &[]);
    ctx.create("c1", &bundle).await;
    ctx.runtime.start("c1").await.unwrap();

    let process_file = ctx.dirs.path().join("exec.json");
    std::fs::write(
        &process_file,
        serde_json::to_string(&serde_json::json!({
            "args": ["cmd", "/c", "exit 3"],
            "cwd": "C:\\",
        }))
        .unwrap(),
    )
    .unwrap();

    ctx.fake.push_process_script(ProcessScript {
        exit_code: 3,
        ..ProcessScript::default()
    });
    let code = ctx
        .runtime
        .exec("c1", &process_file, None, None, None, None)
        .await
        .unwrap();
    assert_eq!(code, 3);

    ctx.runtime.remove("c1", true).await.unwrap();
}

#[tokio::test]
async fn kill_treats_a_stopped_container_as_success() {
    let ctx = TestContext::new();
    ctx.fake.push_process_script(ProcessScript {
        exit_delay: Duration::from_secs(60),
        ..ProcessScript::default()
    });
    let bundle = ctx.write_bundle("c1", false, &[]);
    ctx.create("c1", &bundle).await;
    ctx.runtime.start("c1").await.unwrap();

    ctx.runtime.kill("c1", Some(9)).await.unwrap();
    assert_eq!(ctx.fake.system_state("c1").as_deref(), Some("Stopped"));
    // Killing again finds the system already gone to rest.
    ctx.runtime.kill("c1", Some(9)).await.unwrap();
}

// ============================================================================
// STATE & LIST
// ============================================================================

#[tokio::test]
async fn list_json_reconstructs_field_equal_records() {
    let ctx = TestContext::new();
    let bundle = ctx.write_bundle("c1", false, &[]);
    ctx.create("c1", &bundle).await;

    let listed = ctx.runtime.list().await.unwrap();
    assert_eq!(listed.len(), 1);

    // Round-trip through JSON, the way `list --format json` emits it.
    let raw = serde_json::to_string(&listed).unwrap();
    let parsed: Vec<ContainerState> = serde_json::from_str(&raw).unwrap();
    let reconstructed = parsed.into_iter().next().unwrap().into_record();

    let stored = ctx.runtime.containers().load_record("c1").unwrap();
    assert_eq!(reconstructed.id, stored.id);
    assert_eq!(reconstructed.sandbox_id, stored.sandbox_id);
    assert_eq!(reconstructed.bundle_path, stored.bundle_path);
    assert_eq!(reconstructed.created, stored.created);
    assert_eq!(reconstructed.rootfs_path, stored.rootfs_path);
    assert_eq!(reconstructed.is_sandbox, stored.is_sandbox);
    assert_eq!(reconstructed.vm_isolated, stored.vm_isolated);
    assert_eq!(
        serde_json::to_value(&reconstructed.spec).unwrap(),
        serde_json::to_value(&stored.spec).unwrap()
    );
}

#[tokio::test]
async fn state_of_an_unknown_container_is_not_found() {
    let ctx = TestContext::new();
    let err = ctx.runtime.state("ghost").await.unwrap_err();
    assert!(err.is_not_found());
}

// ============================================================================
// SANDBOXES AND UTILITY VMS
// ============================================================================

#[tokio::test]
async fn a_hyperv_sandbox_boots_a_vm_and_hosts_its_container() {
    let ctx = TestContext::new();
    let bundle = ctx.write_bundle(
        "pod",
        true,
        &[("io.kubernetes.cri.container-type", "sandbox")],
    );
    ctx.create("pod", &bundle).await;

    // The VM shim created and started the utility VM, then hosted the
    // sandbox container inside it.
    assert!(ctx.fake.has_system(&vm_id("pod")));
    assert_eq!(
        ctx.fake.system_state(&vm_id("pod")).as_deref(),
        Some("Running")
    );
    assert!(ctx.fake.has_system("pod"));
    let document = ctx.fake.create_document("pod").unwrap();
    assert_eq!(document["Container"]["HostingSystemId"], vm_id("pod"));

    let record = ctx.runtime.containers().load_record("pod").unwrap();
    assert!(record.is_sandbox);
    assert!(record.vm_isolated);
    assert_ne!(ctx.runtime.containers().vmshim_pid("pod").unwrap(), 0);
}

#[tokio::test]
async fn a_secondary_container_joins_its_sandbox_vm() {
    let ctx = TestContext::new();
    let pod_bundle = ctx.write_bundle(
        "pod",
        true,
        &[("io.kubernetes.cri.container-type", "sandbox")],
    );
    ctx.create("pod", &pod_bundle).await;

    let worker_bundle = ctx.write_bundle(
        "worker",
        false,
        &[
            ("io.kubernetes.cri.container-type", "container"),
            ("io.kubernetes.cri.sandbox-id", "pod"),
        ],
    );
    ctx.create("worker", &worker_bundle).await;

    let record = ctx.runtime.containers().load_record("worker").unwrap();
    assert!(!record.is_sandbox);
    assert_eq!(record.sandbox_id, "pod");
    // Isolation is inherited from the sandbox.
    assert!(record.vm_isolated);

    let document = ctx.fake.create_document("worker").unwrap();
    assert_eq!(document["Container"]["HostingSystemId"], vm_id("pod"));

    // Removal asks the sandbox's VM shim to unmount.
    ctx.runtime.remove("worker", true).await.unwrap();
    assert!(ctx.layers.unmounted().iter().any(|(id, _)| id == "worker"));
    assert!(!ctx.runtime.containers().exists("worker").unwrap());

    // Removing the sandbox terminates its utility VM.
    ctx.runtime.remove("pod", true).await.unwrap();
    wait_until("the vm to stop", || {
        ctx.fake.system_state(&vm_id("pod")).as_deref() == Some("Stopped")
    })
    .await;
    assert!(!ctx.runtime.containers().exists("pod").unwrap());
}

#[tokio::test]
async fn joining_a_missing_sandbox_fails_without_leaving_state_behind() {
    let ctx = TestContext::new();
    let pod_bundle = ctx.write_bundle(
        "pod",
        false,
        &[("io.kubernetes.cri.container-type", "sandbox")],
    );
    ctx.create("pod", &pod_bundle).await;

    // Remove the sandbox's persisted record out from under the runtime.
    ctx.runtime.containers().remove("pod").unwrap();

    let worker_bundle = ctx.write_bundle(
        "worker",
        false,
        &[
            ("io.kubernetes.cri.container-type", "container"),
            ("io.kubernetes.cri.sandbox-id", "pod"),
        ],
    );
    let err = ctx
        .runtime
        .create(CreateOptions {
            id: "worker".into(),
            bundle: worker_bundle,
            pid_file: None,
            shim_log: None,
            vm_log: None,
        })
        .await
        .unwrap_err();

    assert!(err.is_not_found());
    assert!(!ctx.runtime.containers().exists("worker").unwrap());
}

#[tokio::test]
async fn a_container_annotation_without_a_sandbox_id_is_rejected() {
    let ctx = TestContext::new();
    let bundle = ctx.write_bundle(
        "stray",
        false,
        &[("io.kubernetes.cri.container-type", "container")],
    );
    let err = ctx
        .runtime
        .create(CreateOptions {
            id: "stray".into(),
            bundle,
            pid_file: None,
            shim_log: None,
            vm_log: None,
        })
        .await
        .unwrap_err();
    assert!(matches!(err.root(), HcsliteError::InvalidState(_)));
    assert!(!ctx.runtime.containers().exists("stray").unwrap());
}

#[tokio::test]
async fn requesting_hyperv_against_a_plain_sandbox_is_rejected() {
    let ctx = TestContext::new();
    let pod_bundle = ctx.write_bundle(
        "pod",
        false,
        &[("io.kubernetes.cri.container-type", "sandbox")],
    );
    ctx.create("pod", &pod_bundle).await;

    let worker_bundle = ctx.write_bundle(
        "worker",
        true,
        &[
            ("io.kubernetes.cri.container-type", "container"),
            ("io.kubernetes.cri.sandbox-id", "pod"),
        ],
    );
    let err = ctx
        .runtime
        .create(CreateOptions {
            id: "worker".into(),
            bundle: worker_bundle,
            pid_file: None,
            shim_log: None,
            vm_log: None,
        })
        .await
        .unwrap_err();
    assert!(matches!(err.root(), HcsliteError::InvalidState(_)));
    assert!(!ctx.runtime.containers().exists("worker").unwrap());
}
