//! Parent-side shim launching.
//!
//! Shim children report readiness over their stderr pipe: the fixed success
//! marker followed by end-of-file, or free-form error text. The parent
//! reads the whole pipe before deciding. [`ShimLauncher`] is the seam the
//! runtime launches through; production uses [`ExeShimLauncher`] (a hidden
//! subcommand of this executable), tests run shims in-process.

use std::process::Stdio;

use async_trait::async_trait;
use hcslite_shared::errors::{HcsliteError, HcsliteResult, OpContext};
use hcslite_shared::protocol;
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, Command};

/// Called exactly once when a shim has finished its setup and is serving.
pub type ReadySignal = Box<dyn FnOnce() + Send>;

/// A launched shim that has completed its handshake.
pub struct LaunchedShim {
    pub pid: u32,
    handle: ShimHandle,
}

enum ShimHandle {
    Child(Child),
    Task(tokio::task::JoinHandle<HcsliteResult<i32>>),
}

impl LaunchedShim {
    pub fn from_child(pid: u32, child: Child) -> Self {
        Self {
            pid,
            handle: ShimHandle::Child(child),
        }
    }

    pub fn from_task(pid: u32, task: tokio::task::JoinHandle<HcsliteResult<i32>>) -> Self {
        Self {
            pid,
            handle: ShimHandle::Task(task),
        }
    }

    /// Wait for the shim to finish and report its exit code. Dropping a
    /// `LaunchedShim` instead detaches it.
    pub async fn wait(self) -> HcsliteResult<i32> {
        match self.handle {
            ShimHandle::Child(mut child) => {
                let status = child
                    .wait()
                    .await
                    .map_err(|e| HcsliteError::Io(format!("waiting for shim: {}", e)))?;
                Ok(status.code().unwrap_or(-1))
            }
            ShimHandle::Task(task) => task
                .await
                .map_err(|e| HcsliteError::Internal(format!("shim task: {}", e)))?,
        }
    }
}

/// Launches shim helpers and waits for their readiness handshake.
#[async_trait]
pub trait ShimLauncher: Send + Sync {
    /// `args` are the subcommand arguments of this executable;
    /// `stdin_payload`, when present, is written to the child's stdin and
    /// closed (the VM shim reads its options document this way).
    async fn launch(
        &self,
        args: &[String],
        stdin_payload: Option<Vec<u8>>,
    ) -> HcsliteResult<LaunchedShim>;
}

/// The production launcher: re-invokes the current executable with a hidden
/// subcommand.
pub struct ExeShimLauncher;

#[async_trait]
impl ShimLauncher for ExeShimLauncher {
    async fn launch(
        &self,
        args: &[String],
        stdin_payload: Option<Vec<u8>>,
    ) -> HcsliteResult<LaunchedShim> {
        let exe = std::env::current_exe()
            .map_err(|e| HcsliteError::Io(format!("locating executable: {}", e)))?;

        let mut command = Command::new(&exe);
        command
            .args(args)
            .stdin(if stdin_payload.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::null())
            .stderr(Stdio::piped());

        let mut child = command.spawn().map_err(|e| {
            HcsliteError::Io(format!("spawning {} {:?}: {}", exe.display(), args, e))
        })?;
        let pid = child.id().unwrap_or_default();

        if let Some(payload) = stdin_payload {
            let mut stdin = child
                .stdin
                .take()
                .ok_or_else(|| HcsliteError::Internal("child stdin missing".into()))?;
            stdin.write_all(&payload).await?;
            stdin.shutdown().await?;
            drop(stdin);
        }

        let mut stderr = child
            .stderr
            .take()
            .ok_or_else(|| HcsliteError::Internal("child stderr missing".into()))?;

        match protocol::read_response(&mut stderr).await {
            Ok(()) => {
                tracing::debug!(pid, ?args, "shim reported ready");
                Ok(LaunchedShim::from_child(pid, child))
            }
            Err(err) => {
                // The child failed before serving; reap it so it doesn't
                // linger.
                let _ = child.kill().await;
                let _ = child.wait().await;
                Err(err.in_op(OpContext::new("shim::spawn")))
            }
        }
    }
}

/// The child side of the handshake: write the success marker on stderr,
/// then close stderr so the parent's read reaches end-of-file.
pub fn signal_parent_ready() {
    use std::io::Write;
    let mut stderr = std::io::stderr().lock();
    let _ = stderr.write_all(hcslite_shared::constants::shim::SUCCESS_MARKER);
    let _ = stderr.flush();
    drop(stderr);
    release_stderr();
}

/// Report a fatal setup error to the parent and exit non-zero.
pub fn fail_parent(err: &HcsliteError) -> ! {
    use std::io::Write;
    let mut stderr = std::io::stderr().lock();
    let _ = stderr.write_all(err.to_string().as_bytes());
    let _ = stderr.flush();
    drop(stderr);
    std::process::exit(1);
}

/// Replace fd 2 with the null device so the parent's pipe read terminates
/// while this process keeps running.
#[cfg(unix)]
fn release_stderr() {
    use std::os::fd::AsRawFd;
    if let Ok(null) = std::fs::OpenOptions::new().write(true).open("/dev/null") {
        unsafe {
            libc::dup2(null.as_raw_fd(), libc::STDERR_FILENO);
        }
    }
}

#[cfg(windows)]
fn release_stderr() {
    crate::platform::release_stderr();
}

/// Keep shim children from outliving a dead parent.
#[cfg(target_os = "linux")]
pub fn watch_parent() {
    unsafe {
        if libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGTERM) != 0 {
            tracing::warn!("failed to arm parent death signal");
        }
    }
}

#[cfg(not(target_os = "linux"))]
pub fn watch_parent() {}
