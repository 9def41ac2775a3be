//! The container shim.
//!
//! A long-lived child process that owns one process inside a container. In
//! init mode it opens the compute system, listens on the container's pipe,
//! and creates the init process when the runtime dials in to start the
//! container; on init exit it drives a graceful shutdown before escalating
//! to terminate, then removes the container's persisted state. In exec mode
//! it creates one additional process and exits with that process's code.

use std::path::PathBuf;
use std::time::Duration;

use hcslite_shared::errors::{HcsliteError, HcsliteResult, OpContext};
use hcslite_shared::protocol::{self, ShimOp, ShimRequest};
use hcslite_shared::PipeAddr;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use super::spawn::ReadySignal;
use super::{ShimEnv, vmshim_request};
use crate::container::record::{self, ContainerRecord};
use crate::hcs::{Process, ProcessStdio, System};
use crate::layers::UnmountOp;
use crate::pipe;
use crate::schema::ProcessDocument;
use crate::util::command_line_from_args;

/// How long a graceful shutdown may take before terminate.
const GRACEFUL_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Arguments of the hidden `shim` subcommand.
#[derive(Clone, Debug)]
pub struct ContainerShimOptions {
    pub container_id: String,
    /// Path to a process document: exec mode. Absent: init mode.
    pub exec_process: Option<PathBuf>,
    /// Pipe names to dial for the process's stdio.
    pub stdin: Option<String>,
    pub stdout: Option<String>,
    pub stderr: Option<String>,
}

impl ContainerShimOptions {
    fn stdio_names(&self) -> (Option<&str>, Option<&str>, Option<&str>) {
        (
            self.stdin.as_deref(),
            self.stdout.as_deref(),
            self.stderr.as_deref(),
        )
    }
}

/// Run the shim. `ready` fires once setup is complete and the parent may
/// proceed. The returned value is the process exit code to report.
pub async fn run(
    env: ShimEnv,
    options: ContainerShimOptions,
    ready: ReadySignal,
) -> HcsliteResult<i32> {
    let record = env.containers.load_record(&options.container_id)?;
    let system = System::open(
        env.api.clone(),
        &options.container_id,
        env.options.system_options(None),
    )
    .await?;

    let result = match &options.exec_process {
        Some(process_file) => run_exec(&env, &options, &system, process_file, ready).await,
        None => run_init(&env, &options, &system, &record, ready).await,
    };

    let _ = system.close().await;
    result
}

/// Exec mode: create the given process, proxy stdio, propagate its exit
/// code.
async fn run_exec(
    env: &ShimEnv,
    options: &ContainerShimOptions,
    system: &std::sync::Arc<System>,
    process_file: &std::path::Path,
    ready: ReadySignal,
) -> HcsliteResult<i32> {
    let raw = tokio::fs::read_to_string(process_file).await.map_err(|e| {
        HcsliteError::Io(format!("reading {}: {}", process_file.display(), e))
    })?;
    let spec: oci_spec::runtime::Process = serde_json::from_str(&raw)?;

    let document = process_document(&spec, options.stdio_names());
    let process = system.create_process(&document).await?;

    ready();

    let exit_code = serve_process(env, options, &process).await?;
    let _ = process.close().await;
    Ok(exit_code)
}

/// Init mode: listen for the start trigger, own the init process, and tear
/// the container down when it exits.
async fn run_init(
    env: &ShimEnv,
    options: &ContainerShimOptions,
    system: &std::sync::Arc<System>,
    record: &ContainerRecord,
    ready: ReadySignal,
) -> HcsliteResult<i32> {
    let addr = PipeAddr::shim(&options.container_id);
    let mut listener = pipe::listen(&addr, &env.options.pipe_dir).await?;

    ready();
    tracing::info!(container = %options.container_id, "container shim serving");

    // The start trigger, or the container dying before anyone started it.
    let mut conn = tokio::select! {
        accepted = listener.accept() => accepted?,
        terminal = system.wait() => {
            tracing::warn!(container = %options.container_id, "compute system exited before start");
            cleanup(env, options, record).await;
            return match terminal {
                Ok(()) => Ok(1),
                Err(err) => Err(err),
            };
        }
    };

    // The trigger carries no payload; drain the client's half-close.
    let mut trigger = Vec::new();
    conn.read_to_end(&mut trigger).await?;

    let init_result = start_init(env, options, system, record).await;
    let process = match init_result {
        Ok(process) => {
            protocol::write_success(&mut conn).await?;
            conn.shutdown().await?;
            process
        }
        Err(err) => {
            tracing::error!(container = %options.container_id, %err, "failed to start init");
            let _ = protocol::write_error_text(&mut conn, &err).await;
            let _ = conn.shutdown().await;
            cleanup(env, options, record).await;
            return Err(err);
        }
    };
    drop(conn);

    let exit_code = serve_process(env, options, &process).await.unwrap_or(-1);
    let _ = process.close().await;
    tracing::info!(container = %options.container_id, exit_code, "init exited");

    shutdown_system(system, &options.container_id).await;
    cleanup(env, options, record).await;
    Ok(exit_code)
}

async fn start_init(
    env: &ShimEnv,
    options: &ContainerShimOptions,
    system: &std::sync::Arc<System>,
    record: &ContainerRecord,
) -> HcsliteResult<std::sync::Arc<Process>> {
    let spec = record.spec.process().as_ref().ok_or_else(|| {
        HcsliteError::InvalidState("the container spec has no process".into())
            .in_op(OpContext::new("shim::start_init").container(&options.container_id))
    })?;

    let document = process_document(spec, options.stdio_names());
    let process = system.create_process(&document).await?;

    // The init process is owned by this shim; record the host→guest pid
    // mapping under the shim's own pid.
    env.containers.set_pid_mapping(
        &options.container_id,
        std::process::id(),
        process.pid(),
    )?;
    Ok(process)
}

/// Proxy stdio until the process exits, then report its exit code. Output
/// streams are drained before returning.
async fn serve_process(
    env: &ShimEnv,
    options: &ContainerShimOptions,
    process: &std::sync::Arc<Process>,
) -> HcsliteResult<i32> {
    let stdio = process.stdio();
    let pumps = spawn_stdio_pumps(&env.options.pipe_dir, options, process, stdio).await?;

    let wait_result = process.wait().await;
    if let Err(err) = &wait_result {
        tracing::warn!(pid = process.pid(), %err, "process wait resolved with error");
    }

    // Drain stdout/stderr; stop feeding stdin.
    if let Some(task) = pumps.stdin {
        task.abort();
    }
    if let Some(task) = pumps.stdout {
        let _ = task.await;
    }
    if let Some(task) = pumps.stderr {
        let _ = task.await;
    }

    match process.exit_code().await {
        Ok(code) => Ok(code),
        Err(err) => {
            tracing::warn!(pid = process.pid(), %err, "exit code unavailable");
            Ok(-1)
        }
    }
}

struct StdioPumps {
    stdin: Option<tokio::task::JoinHandle<()>>,
    stdout: Option<tokio::task::JoinHandle<()>>,
    stderr: Option<tokio::task::JoinHandle<()>>,
}

async fn spawn_stdio_pumps(
    pipe_dir: &std::path::Path,
    options: &ContainerShimOptions,
    process: &std::sync::Arc<Process>,
    stdio: ProcessStdio,
) -> HcsliteResult<StdioPumps> {
    let mut pumps = StdioPumps {
        stdin: None,
        stdout: None,
        stderr: None,
    };

    if let (Some(name), Some(file)) = (&options.stdin, stdio.stdin) {
        let mut source = pipe::connect(&PipeAddr::raw(name), &pipe_dir).await?;
        let mut sink = tokio::fs::File::from_std(file);
        let process = std::sync::Arc::clone(process);
        pumps.stdin = Some(tokio::spawn(async move {
            let _ = tokio::io::copy(&mut source, &mut sink).await;
            drop(sink);
            // The writer went away; pass end-of-input into the guest.
            let _ = process.close_stdin().await;
        }));
    }
    if let (Some(name), Some(file)) = (&options.stdout, stdio.stdout) {
        let mut sink = pipe::connect(&PipeAddr::raw(name), &pipe_dir).await?;
        let mut source = tokio::fs::File::from_std(file);
        pumps.stdout = Some(tokio::spawn(async move {
            let _ = tokio::io::copy(&mut source, &mut sink).await;
            let _ = sink.shutdown().await;
        }));
    }
    if let (Some(name), Some(file)) = (&options.stderr, stdio.stderr) {
        let mut sink = pipe::connect(&PipeAddr::raw(name), &pipe_dir).await?;
        let mut source = tokio::fs::File::from_std(file);
        pumps.stderr = Some(tokio::spawn(async move {
            let _ = tokio::io::copy(&mut source, &mut sink).await;
            let _ = sink.shutdown().await;
        }));
    }
    Ok(pumps)
}

/// Graceful shutdown with a deadline, then terminate.
async fn shutdown_system(system: &std::sync::Arc<System>, container_id: &str) {
    if let Err(err) = system.shutdown().await {
        tracing::warn!(container = container_id, %err, "shutdown request failed; terminating");
        let _ = system.terminate().await;
    }
    if tokio::time::timeout(GRACEFUL_SHUTDOWN_TIMEOUT, system.wait())
        .await
        .is_err()
    {
        tracing::warn!(container = container_id, "graceful shutdown timed out; terminating");
        let _ = system.terminate().await;
        let _ = system.wait().await;
    }
}

/// Exit-path cleanup: unmount storage and drop the persisted state.
async fn cleanup(env: &ShimEnv, options: &ContainerShimOptions, record: &ContainerRecord) {
    let id = &options.container_id;

    if env.containers.mounted(id).unwrap_or(false) {
        let unmounted = if record.vm_isolated && !record.is_sandbox {
            vmshim_request(
                &env.options,
                &record.sandbox_id,
                &ShimRequest {
                    id: id.clone(),
                    op: ShimOp::UnmountContainer,
                },
            )
            .await
        } else {
            env.layers
                .unmount(id, &record::layer_folders(&record.spec), UnmountOp::All)
                .await
        };
        match unmounted {
            Ok(()) => {
                let _ = env.containers.set_mounted(id, false);
            }
            Err(err) => tracing::warn!(container = %id, %err, "unmount failed during cleanup"),
        }
    }

    if let Err(err) = env.containers.remove(id) {
        tracing::warn!(container = %id, %err, "failed to remove persisted state");
    }
}

/// Translate an OCI process spec into the platform's process document.
fn process_document(
    spec: &oci_spec::runtime::Process,
    (stdin, stdout, stderr): (Option<&str>, Option<&str>, Option<&str>),
) -> ProcessDocument {
    let command_line = spec
        .args()
        .as_ref()
        .map(|args| command_line_from_args(args))
        .unwrap_or_default();
    let environment = spec
        .env()
        .as_ref()
        .map(|entries| {
            entries
                .iter()
                .filter_map(|entry| {
                    entry
                        .split_once('=')
                        .map(|(key, value)| (key.to_string(), value.to_string()))
                })
                .collect()
        })
        .unwrap_or_default();

    ProcessDocument {
        application_name: None,
        command_line,
        user: None,
        working_directory: Some(spec.cwd().to_string_lossy().into_owned())
            .filter(|cwd| !cwd.is_empty()),
        environment,
        emulate_console: spec.terminal().unwrap_or(false),
        create_std_in_pipe: stdin.is_some(),
        create_std_out_pipe: stdout.is_some(),
        create_std_err_pipe: stderr.is_some(),
        console_size: console_size_of(spec),
    }
}

fn console_size_of(spec: &oci_spec::runtime::Process) -> Option<[u16; 2]> {
    let value = serde_json::to_value(spec).ok()?;
    let size = value.pointer("/consoleSize")?;
    Some([
        size.get("height")?.as_u64()? as u16,
        size.get("width")?.as_u64()? as u16,
    ])
}

#[cfg(test)]
mod tests {
    use super::*;
    use oci_spec::runtime::ProcessBuilder;

    #[test]
    fn process_documents_carry_the_spec() {
        let spec = ProcessBuilder::default()
            .args(vec!["cmd".to_string(), "/c".to_string(), "echo hi".to_string()])
            .cwd("C:\\work")
            .env(vec!["PATH=C:\\windows".to_string(), "BROKEN".to_string()])
            .terminal(true)
            .build()
            .unwrap();

        let doc = process_document(&spec, (Some("in"), Some("out"), None));
        assert_eq!(doc.command_line, r#"cmd /c "echo hi""#);
        assert_eq!(doc.working_directory.as_deref(), Some("C:\\work"));
        assert_eq!(
            doc.environment.get("PATH").map(String::as_str),
            Some("C:\\windows")
        );
        assert!(!doc.environment.contains_key("BROKEN"));
        assert!(doc.emulate_console);
        assert!(doc.create_std_in_pipe);
        assert!(doc.create_std_out_pipe);
        assert!(!doc.create_std_err_pipe);
    }
}
