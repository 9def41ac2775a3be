//! Test fixtures: an in-memory compute service.
//!
//! [`FakeCompute`] implements the platform capability the runtime consumes.
//! It keeps scripted compute systems and processes in memory, records every
//! modify request for assertions, and delivers notifications from freshly
//! spawned OS threads so the dispatcher sees the same foreign-thread
//! behavior the real service exhibits.

use std::collections::{HashMap, VecDeque};
use std::io::{Seek, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use hcslite::hcs::api::{ComputeApi, DiskApi, NotificationKind, ProcessCreated, ProcessStdio, RawHandle};
use hcslite::hcs::callback;
use hcslite::layers::{LayerMounter, UnmountOp};
use hcslite::schema::{ComputeSystemDocument, ProcessProperties, SystemProperties};
use hcslite::shim::spawn::{LaunchedShim, ReadySignal, ShimLauncher};
use hcslite::shim::{ShimEnv, container, vm};
use hcslite::uvm::UvmOptions;
use hcslite_shared::{HcsliteError, HcsliteResult};
use parking_lot::Mutex;

/// One recorded modify request.
#[derive(Clone, Debug)]
pub struct ModifyRecord {
    pub system_id: String,
    pub request: serde_json::Value,
}

/// Scripted behavior for the next created process.
#[derive(Clone, Debug)]
pub struct ProcessScript {
    pub exit_code: i32,
    pub stdout: String,
    pub exit_delay: Duration,
    /// Simulate the platform race where the exit notification is lost.
    pub lose_exit_notification: bool,
    pub last_wait_result: i32,
}

impl Default for ProcessScript {
    fn default() -> Self {
        Self {
            exit_code: 0,
            stdout: String::new(),
            exit_delay: Duration::from_millis(5),
            lose_exit_notification: false,
            last_wait_result: 0,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Target {
    System,
    Process,
}

struct ProcessEntry {
    exited: bool,
    exit_code: i32,
    last_wait_result: i32,
    callback: Option<u64>,
    notification_pending: bool,
    lose_exit_notification: bool,
}

struct SystemEntry {
    state: String,
    os: String,
    system_type: String,
    callbacks: Vec<u64>,
    pending: Vec<(NotificationKind, i32)>,
    next_pid: u32,
}

struct FakeState {
    next_handle: u64,
    systems: HashMap<String, SystemEntry>,
    // handle → (target kind, system id, pid)
    handles: HashMap<u64, (Target, String, u32)>,
    processes: HashMap<(String, u32), ProcessEntry>,
    modify_log: Vec<ModifyRecord>,
    create_documents: HashMap<String, serde_json::Value>,
    scripts: VecDeque<ProcessScript>,
    // Complete start/pause/resume synchronously instead of via Pending.
    synchronous_lifecycle: bool,
    // Never deliver create-completed (exercises the create deadline).
    withhold_create_completed: bool,
    fail_next_modify: Option<HcsliteError>,
}

/// The in-memory compute service.
#[derive(Clone)]
pub struct FakeCompute {
    state: Arc<Mutex<FakeState>>,
}

impl Default for FakeCompute {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeCompute {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(FakeState {
                next_handle: 1,
                systems: HashMap::new(),
                handles: HashMap::new(),
                processes: HashMap::new(),
                modify_log: Vec::new(),
                create_documents: HashMap::new(),
                scripts: VecDeque::new(),
                synchronous_lifecycle: false,
                withhold_create_completed: false,
                fail_next_modify: None,
            })),
        }
    }

    pub fn arc(self) -> Arc<dyn ComputeApi> {
        Arc::new(self)
    }

    /// Script the next created process (FIFO).
    pub fn push_process_script(&self, script: ProcessScript) {
        self.state.lock().scripts.push_back(script);
    }

    /// Make start/pause/resume complete without a Pending round trip.
    pub fn set_synchronous_lifecycle(&self, synchronous: bool) {
        self.state.lock().synchronous_lifecycle = synchronous;
    }

    /// Never deliver create-completed; creation runs into its deadline.
    pub fn set_withhold_create_completed(&self, withhold: bool) {
        self.state.lock().withhold_create_completed = withhold;
    }

    /// Fail the next modify request with `err`.
    pub fn fail_next_modify(&self, err: HcsliteError) {
        self.state.lock().fail_next_modify = Some(err);
    }

    /// Every modify request seen so far.
    pub fn modify_log(&self) -> Vec<ModifyRecord> {
        self.state.lock().modify_log.clone()
    }

    /// Modify requests whose serialized form contains `needle`.
    pub fn modify_log_matching(&self, needle: &str) -> Vec<ModifyRecord> {
        self.modify_log()
            .into_iter()
            .filter(|record| record.request.to_string().contains(needle))
            .collect()
    }

    /// The create document a system was built from.
    pub fn create_document(&self, id: &str) -> Option<serde_json::Value> {
        self.state.lock().create_documents.get(id).cloned()
    }

    /// Whether a system currently exists.
    pub fn has_system(&self, id: &str) -> bool {
        self.state.lock().systems.contains_key(id)
    }

    /// The platform-visible state string of a system.
    pub fn system_state(&self, id: &str) -> Option<String> {
        self.state.lock().systems.get(id).map(|s| s.state.clone())
    }

    /// How many systems have ever been created.
    pub fn created_system_count(&self) -> usize {
        self.state.lock().create_documents.len()
    }

    /// Deliver a notification on a foreign thread, the way the platform
    /// does.
    fn deliver(callback_number: u64, kind: NotificationKind, hr: i32) {
        std::thread::spawn(move || {
            callback::deliver(callback_number, kind.code(), hr, None);
        });
    }

    fn deliver_delayed(callback_number: u64, kind: NotificationKind, hr: i32, delay: Duration) {
        std::thread::spawn(move || {
            std::thread::sleep(delay);
            callback::deliver(callback_number, kind.code(), hr, None);
        });
    }

    fn notify_system(state: &mut FakeState, id: &str, kind: NotificationKind, hr: i32) {
        let Some(system) = state.systems.get_mut(id) else {
            return;
        };
        if system.callbacks.is_empty() {
            system.pending.push((kind, hr));
            return;
        }
        for number in &system.callbacks {
            Self::deliver(*number, kind, hr);
        }
    }

    fn classify_os(document: &serde_json::Value) -> (String, String) {
        if document.get("VirtualMachine").is_some() {
            let os = if document
                .pointer("/VirtualMachine/Devices/VirtualPmem")
                .or_else(|| document.pointer("/VirtualMachine/Devices/VirtualPMem"))
                .is_some()
            {
                "Linux"
            } else {
                "Windows"
            };
            (os.to_string(), "VirtualMachine".to_string())
        } else {
            ("Windows".to_string(), "Container".to_string())
        }
    }

    fn insert_handle(state: &mut FakeState, target: Target, id: &str, pid: u32) -> u64 {
        let handle = state.next_handle;
        state.next_handle += 1;
        state.handles.insert(handle, (target, id.to_string(), pid));
        handle
    }

    fn system_of(state: &FakeState, handle: RawHandle) -> HcsliteResult<String> {
        match state.handles.get(&handle) {
            Some((Target::System, id, _)) => Ok(id.clone()),
            _ => Err(HcsliteError::AlreadyClosed),
        }
    }

    fn process_of(state: &FakeState, handle: RawHandle) -> HcsliteResult<(String, u32)> {
        match state.handles.get(&handle) {
            Some((Target::Process, id, pid)) => Ok((id.clone(), *pid)),
            _ => Err(HcsliteError::AlreadyClosed),
        }
    }
}

#[async_trait]
impl ComputeApi for FakeCompute {
    async fn create_system(&self, id: &str, document: &str) -> HcsliteResult<RawHandle> {
        let parsed: serde_json::Value = serde_json::from_str(document)
            .map_err(|e| HcsliteError::Unsupported(format!("invalid json: {}", e)))?;
        // Exercise the typed document model on the way in.
        let _typed: ComputeSystemDocument = serde_json::from_value(parsed.clone())
            .map_err(|e| HcsliteError::Unsupported(format!("invalid document: {}", e)))?;

        let mut state = self.state.lock();
        if state.systems.contains_key(id) {
            return Err(HcsliteError::InvalidState(format!(
                "system {} already exists",
                id
            )));
        }
        let (os, system_type) = Self::classify_os(&parsed);
        let pending = if state.withhold_create_completed {
            Vec::new()
        } else {
            vec![(NotificationKind::SystemCreateCompleted, 0)]
        };
        state.create_documents.insert(id.to_string(), parsed);
        state.systems.insert(
            id.to_string(),
            SystemEntry {
                state: "Created".into(),
                os,
                system_type,
                callbacks: Vec::new(),
                pending,
                next_pid: 100,
            },
        );
        Ok(Self::insert_handle(&mut state, Target::System, id, 0))
    }

    async fn open_system(&self, id: &str) -> HcsliteResult<RawHandle> {
        let mut state = self.state.lock();
        if !state.systems.contains_key(id) {
            return Err(HcsliteError::NotFound(format!("compute system {}", id)));
        }
        Ok(Self::insert_handle(&mut state, Target::System, id, 0))
    }

    async fn start_system(&self, handle: RawHandle, _options: Option<&str>) -> HcsliteResult<()> {
        let mut state = self.state.lock();
        let id = Self::system_of(&state, handle)?;
        let synchronous = state.synchronous_lifecycle;
        let system = state.systems.get_mut(&id).expect("handle points at system");
        if system.state == "Stopped" {
            return Err(HcsliteError::AlreadyStopped);
        }
        system.state = "Running".into();
        if synchronous {
            return Ok(());
        }
        Self::notify_system(&mut state, &id, NotificationKind::SystemStartCompleted, 0);
        Err(HcsliteError::Pending)
    }

    async fn shutdown_system(&self, handle: RawHandle, _options: Option<&str>) -> HcsliteResult<()> {
        let mut state = self.state.lock();
        let id = Self::system_of(&state, handle)?;
        let system = state.systems.get_mut(&id).expect("handle points at system");
        if system.state == "Stopped" {
            return Err(HcsliteError::AlreadyStopped);
        }
        system.state = "Stopped".into();
        Self::notify_system(&mut state, &id, NotificationKind::SystemExited, 0);
        Err(HcsliteError::Pending)
    }

    async fn terminate_system(
        &self,
        handle: RawHandle,
        _options: Option<&str>,
    ) -> HcsliteResult<()> {
        let mut state = self.state.lock();
        let id = Self::system_of(&state, handle)?;
        let system = state.systems.get_mut(&id).expect("handle points at system");
        if system.state == "Stopped" {
            return Err(HcsliteError::AlreadyStopped);
        }
        system.state = "Stopped".into();
        Self::notify_system(&mut state, &id, NotificationKind::SystemExited, 0);
        Ok(())
    }

    async fn pause_system(&self, handle: RawHandle, _options: Option<&str>) -> HcsliteResult<()> {
        let mut state = self.state.lock();
        let id = Self::system_of(&state, handle)?;
        let synchronous = state.synchronous_lifecycle;
        let system = state.systems.get_mut(&id).expect("handle points at system");
        if system.state != "Running" {
            return Err(HcsliteError::InvalidState(format!(
                "cannot pause from {}",
                system.state
            )));
        }
        system.state = "Paused".into();
        if synchronous {
            return Ok(());
        }
        Self::notify_system(&mut state, &id, NotificationKind::SystemPauseCompleted, 0);
        Err(HcsliteError::Pending)
    }

    async fn resume_system(&self, handle: RawHandle, _options: Option<&str>) -> HcsliteResult<()> {
        let mut state = self.state.lock();
        let id = Self::system_of(&state, handle)?;
        let synchronous = state.synchronous_lifecycle;
        let system = state.systems.get_mut(&id).expect("handle points at system");
        if system.state != "Paused" {
            return Err(HcsliteError::InvalidState(format!(
                "cannot resume from {}",
                system.state
            )));
        }
        system.state = "Running".into();
        if synchronous {
            return Ok(());
        }
        Self::notify_system(&mut state, &id, NotificationKind::SystemResumeCompleted, 0);
        Err(HcsliteError::Pending)
    }

    async fn modify_system(&self, handle: RawHandle, request: &str) -> HcsliteResult<()> {
        let mut state = self.state.lock();
        let id = Self::system_of(&state, handle)?;
        if let Some(err) = state.fail_next_modify.take() {
            return Err(err);
        }
        let request: serde_json::Value = serde_json::from_str(request)
            .map_err(|e| HcsliteError::Unsupported(format!("invalid json: {}", e)))?;
        state.modify_log.push(ModifyRecord {
            system_id: id,
            request,
        });
        Ok(())
    }

    async fn system_properties(&self, handle: RawHandle, _query: &str) -> HcsliteResult<String> {
        let state = self.state.lock();
        let id = Self::system_of(&state, handle)?;
        let system = state.systems.get(&id).expect("handle points at system");
        let properties = SystemProperties {
            id: id.clone(),
            state: system.state.clone(),
            system_type: system.system_type.clone(),
            runtime_os_type: system.os.clone(),
            owner: "fake".into(),
            stopped: system.state == "Stopped",
            statistics: None,
        };
        Ok(serde_json::to_string(&properties)?)
    }

    fn close_system(&self, handle: RawHandle) -> HcsliteResult<()> {
        let mut state = self.state.lock();
        match state.handles.remove(&handle) {
            Some((Target::System, _, _)) => Ok(()),
            _ => Err(HcsliteError::AlreadyClosed),
        }
    }

    fn register_system_callback(
        &self,
        handle: RawHandle,
        callback_number: u64,
    ) -> HcsliteResult<RawHandle> {
        let mut state = self.state.lock();
        let id = Self::system_of(&state, handle)?;
        let system = state.systems.get_mut(&id).expect("handle points at system");
        system.callbacks.push(callback_number);
        for (kind, hr) in std::mem::take(&mut system.pending) {
            Self::deliver(callback_number, kind, hr);
        }
        Ok(Self::insert_handle(&mut state, Target::System, &id, u32::MAX))
    }

    fn register_process_callback(
        &self,
        handle: RawHandle,
        callback_number: u64,
    ) -> HcsliteResult<RawHandle> {
        let mut state = self.state.lock();
        let (id, pid) = Self::process_of(&state, handle)?;
        let process = state
            .processes
            .get_mut(&(id.clone(), pid))
            .ok_or(HcsliteError::NotFound(format!("process {}", pid)))?;
        process.callback = Some(callback_number);
        if process.notification_pending {
            process.notification_pending = false;
            Self::deliver(callback_number, NotificationKind::ProcessExited, 0);
        }
        Ok(Self::insert_handle(&mut state, Target::Process, &id, pid))
    }

    fn unregister_callback(&self, callback_handle: RawHandle) -> HcsliteResult<()> {
        self.state.lock().handles.remove(&callback_handle);
        Ok(())
    }

    async fn create_process(
        &self,
        system: RawHandle,
        document: &str,
    ) -> HcsliteResult<ProcessCreated> {
        let script;
        let id;
        let pid;
        let handle;
        {
            let mut state = self.state.lock();
            id = Self::system_of(&state, system)?;
            let entry = state.systems.get_mut(&id).expect("handle points at system");
            if entry.state == "Stopped" {
                return Err(HcsliteError::InvalidState("system is stopped".into()));
            }
            pid = entry.next_pid;
            entry.next_pid += 1;
            script = state.scripts.pop_front().unwrap_or_default();
            state.processes.insert(
                (id.clone(), pid),
                ProcessEntry {
                    exited: false,
                    exit_code: script.exit_code,
                    last_wait_result: script.last_wait_result,
                    callback: None,
                    notification_pending: false,
                    lose_exit_notification: script.lose_exit_notification,
                },
            );
            handle = Self::insert_handle(&mut state, Target::Process, &id, pid);
        }

        let doc: serde_json::Value = serde_json::from_str(document)
            .map_err(|e| HcsliteError::Unsupported(format!("invalid json: {}", e)))?;
        let wants_stdout = doc
            .get("CreateStdOutPipe")
            .and_then(|v| v.as_bool())
            .unwrap_or(false);

        let stdout = if wants_stdout {
            let mut file = tempfile::tempfile()?;
            file.write_all(script.stdout.as_bytes())?;
            file.rewind()?;
            Some(file)
        } else {
            None
        };

        // "Run" the process on its own thread, then report the exit.
        let state_ref = Arc::clone(&self.state);
        let exit_system = id.clone();
        std::thread::spawn(move || {
            std::thread::sleep(script.exit_delay);
            let callback = {
                let mut state = state_ref.lock();
                let Some(process) = state.processes.get_mut(&(exit_system, pid)) else {
                    return;
                };
                process.exited = true;
                if process.lose_exit_notification {
                    None
                } else {
                    match process.callback {
                        Some(number) => Some(number),
                        None => {
                            process.notification_pending = true;
                            None
                        }
                    }
                }
            };
            if let Some(number) = callback {
                callback::deliver(number, NotificationKind::ProcessExited.code(), 0, None);
            }
        });

        Ok(ProcessCreated {
            process_id: pid,
            handle,
            stdio: ProcessStdio {
                stdin: None,
                stdout,
                stderr: None,
            },
        })
    }

    async fn signal_process(&self, process: RawHandle, _options: &str) -> HcsliteResult<()> {
        let state = self.state.lock();
        let (id, pid) = Self::process_of(&state, process)?;
        let entry = state
            .processes
            .get(&(id, pid))
            .ok_or(HcsliteError::NotFound(format!("process {}", pid)))?;
        if entry.exited {
            return Err(HcsliteError::InvalidState("process already exited".into()));
        }
        Ok(())
    }

    async fn terminate_process(&self, process: RawHandle) -> HcsliteResult<()> {
        let (callback, already_exited) = {
            let mut state = self.state.lock();
            let (id, pid) = Self::process_of(&state, process)?;
            let entry = state
                .processes
                .get_mut(&(id, pid))
                .ok_or(HcsliteError::NotFound(format!("process {}", pid)))?;
            if entry.exited {
                (None, true)
            } else {
                entry.exited = true;
                entry.exit_code = 137;
                (entry.callback.filter(|_| !entry.lose_exit_notification), false)
            }
        };
        if already_exited {
            return Err(HcsliteError::InvalidState("process already exited".into()));
        }
        if let Some(number) = callback {
            Self::deliver_delayed(
                number,
                NotificationKind::ProcessExited,
                0,
                Duration::from_millis(1),
            );
        }
        Ok(())
    }

    async fn modify_process(&self, process: RawHandle, request: &str) -> HcsliteResult<()> {
        let mut state = self.state.lock();
        let (id, pid) = Self::process_of(&state, process)?;
        let request: serde_json::Value = serde_json::from_str(request)
            .map_err(|e| HcsliteError::Unsupported(format!("invalid json: {}", e)))?;
        state.modify_log.push(ModifyRecord {
            system_id: format!("{}:{}", id, pid),
            request,
        });
        Ok(())
    }

    async fn process_properties(&self, process: RawHandle) -> HcsliteResult<String> {
        let state = self.state.lock();
        let (id, pid) = Self::process_of(&state, process)?;
        let entry = state
            .processes
            .get(&(id, pid))
            .ok_or(HcsliteError::NotFound(format!("process {}", pid)))?;
        let properties = ProcessProperties {
            process_id: pid,
            exited: entry.exited,
            exit_code: entry.exit_code,
            last_wait_result: entry.last_wait_result,
        };
        Ok(serde_json::to_string(&properties)?)
    }

    fn close_process(&self, process: RawHandle) -> HcsliteResult<()> {
        let mut state = self.state.lock();
        match state.handles.remove(&process) {
            Some((Target::Process, _, _)) => Ok(()),
            _ => Err(HcsliteError::AlreadyClosed),
        }
    }
}

/// Records disk operations; VHDs become sparse files.
#[derive(Clone, Default)]
pub struct FakeDisk {
    grants: Arc<Mutex<Vec<(String, PathBuf)>>>,
}

impl FakeDisk {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc(self) -> Arc<dyn DiskApi> {
        Arc::new(self)
    }

    pub fn grants(&self) -> Vec<(String, PathBuf)> {
        self.grants.lock().clone()
    }
}

#[async_trait]
impl DiskApi for FakeDisk {
    async fn create_vhd(&self, path: &Path, size_gb: u64) -> HcsliteResult<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        // A size marker stands in for the disk body; tests compare bytes
        // without writing gibibytes.
        std::fs::write(path, format!("vhd:{}gb", size_gb))?;
        Ok(())
    }

    async fn grant_vm_access(&self, vm_id: &str, path: &Path) -> HcsliteResult<()> {
        self.grants
            .lock()
            .push((vm_id.to_string(), path.to_path_buf()));
        Ok(())
    }
}

/// Records mount calls; rootfs paths land under a temp dir.
pub struct FakeLayers {
    root: tempfile::TempDir,
    mounts: Mutex<Vec<String>>,
    unmounts: Mutex<Vec<(String, UnmountOp)>>,
}

impl FakeLayers {
    pub fn new() -> Self {
        Self {
            root: tempfile::tempdir().expect("temp dir"),
            mounts: Mutex::new(Vec::new()),
            unmounts: Mutex::new(Vec::new()),
        }
    }

    pub fn arc(self) -> Arc<dyn LayerMounter> {
        Arc::new(self)
    }

    pub fn mounted(&self) -> Vec<String> {
        self.mounts.lock().clone()
    }

    pub fn unmounted(&self) -> Vec<(String, UnmountOp)> {
        self.unmounts.lock().clone()
    }
}

impl Default for FakeLayers {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LayerMounter for FakeLayers {
    async fn mount(
        &self,
        container_id: &str,
        _layer_folders: &[PathBuf],
    ) -> HcsliteResult<PathBuf> {
        let rootfs = self.root.path().join(container_id).join("rootfs");
        std::fs::create_dir_all(&rootfs)?;
        self.mounts.lock().push(container_id.to_string());
        Ok(rootfs)
    }

    async fn unmount(
        &self,
        container_id: &str,
        _layer_folders: &[PathBuf],
        op: UnmountOp,
    ) -> HcsliteResult<()> {
        self.unmounts.lock().push((container_id.to_string(), op));
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// In-process shim launcher
// ----------------------------------------------------------------------------

/// Runs shim helpers as tasks inside the test process instead of spawning
/// the CLI binary. Argument parsing mirrors the hidden subcommands.
pub struct InProcessShims {
    env: ShimEnv,
}

impl InProcessShims {
    pub fn new(env: ShimEnv) -> Self {
        Self { env }
    }

    pub fn arc(self) -> Arc<dyn ShimLauncher> {
        Arc::new(self)
    }
}

fn flag_value(args: &[String], flag: &str) -> Option<String> {
    args.iter()
        .position(|a| a == flag)
        .and_then(|i| args.get(i + 1))
        .cloned()
}

#[async_trait]
impl ShimLauncher for InProcessShims {
    async fn launch(
        &self,
        args: &[String],
        stdin_payload: Option<Vec<u8>>,
    ) -> HcsliteResult<LaunchedShim> {
        let (ready_tx, ready_rx) = tokio::sync::oneshot::channel::<()>();
        let ready: ReadySignal = Box::new(move || {
            let _ = ready_tx.send(());
        });

        let env = self.env.clone();
        let task = match args.first().map(String::as_str) {
            Some("vmshim") => {
                let id = flag_value(args, "--id")
                    .ok_or_else(|| HcsliteError::Internal("vmshim needs --id".into()))?;
                let payload = stdin_payload
                    .ok_or_else(|| HcsliteError::Internal("vmshim needs options".into()))?;
                let options: UvmOptions = serde_json::from_slice(&payload)?;
                tokio::spawn(vm::run(env, id, options, ready))
            }
            Some("shim") => {
                let options = container::ContainerShimOptions {
                    container_id: flag_value(args, "--container")
                        .ok_or_else(|| HcsliteError::Internal("shim needs --container".into()))?,
                    exec_process: args
                        .iter()
                        .any(|a| a == "--exec")
                        .then(|| flag_value(args, "--process").map(PathBuf::from))
                        .flatten(),
                    stdin: flag_value(args, "--stdin"),
                    stdout: flag_value(args, "--stdout"),
                    stderr: flag_value(args, "--stderr"),
                };
                tokio::spawn(container::run(env, options, ready))
            }
            other => {
                return Err(HcsliteError::Internal(format!(
                    "unknown shim subcommand {:?}",
                    other
                )));
            }
        };

        match ready_rx.await {
            Ok(()) => Ok(LaunchedShim::from_task(std::process::id(), task)),
            Err(_) => {
                // The shim finished (or died) before reporting ready.
                let outcome = task
                    .await
                    .map_err(|e| HcsliteError::Internal(format!("shim task: {}", e)))?;
                match outcome {
                    Ok(code) => Err(HcsliteError::Internal(format!(
                        "shim exited with code {} before serving",
                        code
                    ))),
                    Err(err) => Err(err),
                }
            }
        }
    }
}
