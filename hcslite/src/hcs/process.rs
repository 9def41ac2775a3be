//! Safe handle over a process inside a compute system.
//!
//! Mirrors the callback and wait-block discipline of [`System`]. The extra
//! concerns here are the stdio triple (owned by the caller once taken) and a
//! known platform race: a process-exit notification can be lost, so a signal
//! that lands after exit schedules a deferred force-unblock of the wait
//! channel rather than leaving waiters hung.

use std::sync::Arc;
use std::time::Duration;

use hcslite_shared::errors::{HcsliteError, HcsliteResult, OpContext};
use parking_lot::Mutex;
use tokio::sync::RwLock;

use super::api::{ComputeApi, NotificationKind, ProcessStdio, RawHandle};
use super::callback::{self, CallbackId};
use super::system::System;
use super::waitblock::WaitBlock;
use super::watchdog::watched;
use crate::schema::{
    CloseHandle, ConsoleSize, ProcessDocument, ProcessModifyOperation, ProcessModifyRequest,
    ProcessProperties, SignalOptions, StdHandle,
};

/// Delay before the wait channel is force-unblocked after a signal raced an
/// unobserved exit.
const FORCED_UNBLOCK_DELAY: Duration = Duration::from_secs(1);

/// A handle to one process inside a compute system.
pub struct Process {
    pid: u32,
    system_id: String,
    api: Arc<dyn ComputeApi>,
    watchdog_threshold: Duration,
    handle: RwLock<Option<RawHandle>>,
    callback: Mutex<Option<CallbackId>>,
    stdio: Mutex<ProcessStdio>,
    wait_block: WaitBlock,
    cached_exit_code: Mutex<Option<i32>>,
}

impl System {
    /// Create a process inside this compute system.
    pub async fn create_process(
        self: &Arc<Self>,
        document: &ProcessDocument,
    ) -> HcsliteResult<Arc<Process>> {
        let ctx = || OpContext::new("hcs::system::create_process").system(self.id());
        let raw = serde_json::to_string(document)
            .map_err(|e| HcsliteError::Json(e.to_string()).in_op(ctx()))?;

        let threshold = self.watchdog_threshold();
        let api = Arc::clone(self.api());
        let created = self
            .with_handle("hcs::system::create_process", async |handle| {
                watched("create_process", threshold, api.create_process(handle, &raw)).await
            })
            .await
            .map_err(|e| e.in_op(ctx()))?;

        let callback = match callback::register_for_process(
            self.api(),
            created.handle,
            self.id(),
            created.process_id,
        ) {
            Ok(callback) => callback,
            Err(err) => {
                // The stdio endpoints drop (and close) with `created`.
                let _ = self.api().close_process(created.handle);
                return Err(err.in_op(ctx().pid(created.process_id)));
            }
        };

        let process = Arc::new(Process {
            pid: created.process_id,
            system_id: self.id().to_string(),
            api: Arc::clone(self.api()),
            watchdog_threshold: threshold,
            handle: RwLock::new(Some(created.handle)),
            callback: Mutex::new(Some(callback)),
            stdio: Mutex::new(created.stdio),
            wait_block: WaitBlock::new(),
            cached_exit_code: Mutex::new(None),
        });
        process.spawn_waiter();
        tracing::debug!(system_id = %self.id(), pid = created.process_id, "created process");
        Ok(process)
    }
}

impl Process {
    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn system_id(&self) -> &str {
        &self.system_id
    }

    fn ctx(&self, op: &str) -> OpContext {
        OpContext::new(op).system(&self.system_id).pid(self.pid)
    }

    /// Take the stdio endpoints. Endpoints are handed out at most once;
    /// whoever takes one owns closing it.
    pub fn stdio(&self) -> ProcessStdio {
        let mut stdio = self.stdio.lock();
        ProcessStdio {
            stdin: stdio.stdin.take(),
            stdout: stdio.stdout.take(),
            stderr: stdio.stderr.take(),
        }
    }

    /// Deliver a signal.
    ///
    /// Tri-state: `Ok(true)` delivered, `Ok(false)` not delivered because the
    /// process already exited, `Err` otherwise.
    pub async fn signal(&self, options: &SignalOptions) -> HcsliteResult<bool> {
        let ctx = self.ctx("hcs::process::signal");
        let raw = serde_json::to_string(options)
            .map_err(|e| HcsliteError::Json(e.to_string()).in_op(ctx.clone()))?;

        let guard = self.handle.read().await;
        let handle = guard
            .ok_or(HcsliteError::AlreadyClosed)
            .map_err(|e| e.in_op(ctx.clone()))?;
        let result = watched(
            "signal_process",
            self.watchdog_threshold,
            self.api.signal_process(handle, &raw),
        )
        .await;
        self.tri_state(result).map_err(|e| e.in_op(ctx))
    }

    /// Force-kill the process. Same tri-state as [`Process::signal`].
    pub async fn kill(&self) -> HcsliteResult<bool> {
        let ctx = self.ctx("hcs::process::kill");
        let guard = self.handle.read().await;
        let handle = guard
            .ok_or(HcsliteError::AlreadyClosed)
            .map_err(|e| e.in_op(ctx.clone()))?;
        let result = watched(
            "terminate_process",
            self.watchdog_threshold,
            self.api.terminate_process(handle),
        )
        .await;
        self.tri_state(result).map_err(|e| e.in_op(ctx))
    }

    fn tri_state(&self, result: HcsliteResult<()>) -> HcsliteResult<bool> {
        match result {
            Ok(()) => Ok(true),
            Err(err)
                if err.is_already_stopped() || err.is_invalid_state() || err.is_not_found() =>
            {
                if !self.wait_block.is_resolved() {
                    self.schedule_forced_unblock(err);
                }
                Ok(false)
            }
            Err(err) => Err(err),
        }
    }

    /// Compensation for the lost-exit-notification race: if the platform
    /// says the process is gone but the waiter has not observed exit,
    /// force-unblock the wait channel after a short delay with the signal
    /// error as the cause. The real exit notification wins if it arrives
    /// first.
    fn schedule_forced_unblock(&self, cause: HcsliteError) {
        let wait_block = self.wait_block.clone();
        let pid = self.pid;
        let system_id = self.system_id.clone();
        tokio::spawn(async move {
            tokio::time::sleep(FORCED_UNBLOCK_DELAY).await;
            if wait_block.resolve(Some(cause)) {
                tracing::warn!(
                    %system_id,
                    pid,
                    "process exit notification was lost; wait channel force-unblocked"
                );
            }
        });
    }

    /// Close the guest process's stdin: a modify request plus closing the
    /// local endpoint.
    pub async fn close_stdin(&self) -> HcsliteResult<()> {
        let ctx = self.ctx("hcs::process::close_stdin");
        let request = ProcessModifyRequest {
            operation: ProcessModifyOperation::CloseHandle,
            console_size: None,
            close_handle: Some(CloseHandle {
                handle: StdHandle::StdIn,
            }),
        };
        self.modify(&request).await.map_err(|e| e.in_op(ctx))?;
        drop(self.stdio.lock().stdin.take());
        Ok(())
    }

    /// Resize the guest console.
    pub async fn resize_console(&self, width: u16, height: u16) -> HcsliteResult<()> {
        let ctx = self.ctx("hcs::process::resize_console");
        let request = ProcessModifyRequest {
            operation: ProcessModifyOperation::ConsoleSize,
            console_size: Some(ConsoleSize { height, width }),
            close_handle: None,
        };
        self.modify(&request).await.map_err(|e| e.in_op(ctx))
    }

    async fn modify(&self, request: &ProcessModifyRequest) -> HcsliteResult<()> {
        let raw = serde_json::to_string(request).map_err(|e| HcsliteError::Json(e.to_string()))?;
        let guard = self.handle.read().await;
        let handle = guard.ok_or(HcsliteError::AlreadyClosed)?;
        watched(
            "modify_process",
            self.watchdog_threshold,
            self.api.modify_process(handle, &raw),
        )
        .await
    }

    /// Query the platform's view of this process.
    pub async fn properties(&self) -> HcsliteResult<ProcessProperties> {
        let ctx = self.ctx("hcs::process::properties");
        let guard = self.handle.read().await;
        let handle = guard
            .ok_or(HcsliteError::AlreadyClosed)
            .map_err(|e| e.in_op(ctx.clone()))?;
        let raw = watched(
            "process_properties",
            self.watchdog_threshold,
            self.api.process_properties(handle),
        )
        .await
        .map_err(|e| e.in_op(ctx.clone()))?;
        serde_json::from_str(&raw).map_err(|e| HcsliteError::Json(e.to_string()).in_op(ctx))
    }

    /// The exit code, only meaningful after the process exited.
    ///
    /// Returns `InvalidState` while the process is running. A non-zero
    /// last-wait-result from the platform yields −1 (and a log line) rather
    /// than a bogus code.
    pub async fn exit_code(&self) -> HcsliteResult<i32> {
        if let Some(code) = *self.cached_exit_code.lock() {
            return Ok(code);
        }

        let props = self.properties().await?;
        if !props.exited {
            return Err(HcsliteError::InvalidState(
                "process has not yet exited".into(),
            )
            .in_op(self.ctx("hcs::process::exit_code")));
        }

        let code = if props.last_wait_result != 0 {
            tracing::warn!(
                system_id = %self.system_id,
                pid = self.pid,
                last_wait_result = props.last_wait_result,
                "process reported a failed last wait; exit code unavailable"
            );
            -1
        } else {
            props.exit_code
        };
        *self.cached_exit_code.lock() = Some(code);
        Ok(code)
    }

    /// Block until the process reaches its terminal state. Resolves exactly
    /// once; later calls return the same value without blocking.
    pub async fn wait(&self) -> HcsliteResult<()> {
        match self.wait_block.wait().await {
            None => Ok(()),
            Some(err) => Err(err),
        }
    }

    /// Release the handle and any stdio endpoints not yet handed out.
    pub async fn close(&self) -> HcsliteResult<()> {
        let mut guard = self.handle.write().await;
        let Some(handle) = guard.take() else {
            return Ok(());
        };

        if let Some(callback) = self.callback.lock().take() {
            callback::unregister(&self.api, callback)?;
        }
        drop(std::mem::take(&mut *self.stdio.lock()));
        self.api.close_process(handle)?;
        self.wait_block.resolve(Some(HcsliteError::AlreadyClosed));
        tracing::debug!(system_id = %self.system_id, pid = self.pid, "closed process handle");
        Ok(())
    }

    fn spawn_waiter(self: &Arc<Self>) {
        let process = Arc::clone(self);
        let Some(callback) = *self.callback.lock() else {
            return;
        };
        tokio::spawn(async move {
            let (kind, result) = callback::wait_for_either(
                callback,
                NotificationKind::ProcessExited,
                NotificationKind::ServiceDisconnect,
            )
            .await;

            let terminal = match kind {
                NotificationKind::ServiceDisconnect => Some(match result {
                    Ok(()) => HcsliteError::ServiceDisconnect,
                    Err(err) => err,
                }),
                _ => match result {
                    Ok(()) => None,
                    Err(err) => Some(err),
                },
            };

            if process.wait_block.resolve(terminal) {
                tracing::debug!(
                    system_id = %process.system_id,
                    pid = process.pid,
                    "process reached terminal state"
                );
            }
        });
    }
}

impl std::fmt::Debug for Process {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Process")
            .field("pid", &self.pid)
            .field("system_id", &self.system_id)
            .finish_non_exhaustive()
    }
}
