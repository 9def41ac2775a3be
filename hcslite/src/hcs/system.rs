//! Safe handle over a compute system.
//!
//! One `System` exists per container or utility VM. It serializes handle
//! lifetime against concurrent operations (operations take the handle lock
//! shared, close takes it exclusive) and owns a one-shot wait-block that
//! resolves exactly once, either from the background waiter or from a forced
//! close.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use hcslite_shared::errors::{HcsliteError, HcsliteResult, OpContext};
use parking_lot::Mutex;
use tokio::sync::RwLock;

use super::api::{ComputeApi, NotificationKind, RawHandle};
use super::callback::{self, CallbackId};
use super::waitblock::WaitBlock;
use super::watchdog::watched;
use crate::schema::{ModifyRequest, PropertyQuery, SystemProperties};

/// Default deadline for asynchronous system operations.
pub const DEFAULT_OPERATION_TIMEOUT: Duration = Duration::from_secs(4 * 60);

/// Default threshold before a platform call is reported as stalled.
pub const DEFAULT_WATCHDOG_THRESHOLD: Duration = Duration::from_secs(30);

/// Interval at which the start limiter re-checks for a free slot.
const LIMITER_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Guest operating system of a compute system.
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GuestOs {
    Windows,
    Linux,
}

impl GuestOs {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "Windows" | "windows" => Some(Self::Windows),
            "Linux" | "linux" => Some(Self::Linux),
            _ => None,
        }
    }
}

impl std::fmt::Display for GuestOs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Windows => write!(f, "windows"),
            Self::Linux => write!(f, "linux"),
        }
    }
}

/// The two kinds of compute system.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SystemType {
    Container,
    UtilityVm,
}

impl SystemType {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "Container" => Some(Self::Container),
            "VirtualMachine" => Some(Self::UtilityVm),
            _ => None,
        }
    }
}

/// Limits how many compute systems may be starting at once.
///
/// The counter is polled rather than signalled; the platform itself expects
/// start storms to be spread out, not queued precisely.
pub struct StartLimiter {
    max: u32,
    current: AtomicU32,
}

impl StartLimiter {
    pub fn new(max: u32) -> Arc<Self> {
        Arc::new(Self {
            max: max.max(1),
            current: AtomicU32::new(0),
        })
    }

    async fn acquire(self: &Arc<Self>) -> StartPermit {
        loop {
            let current = self.current.load(Ordering::Acquire);
            if current < self.max
                && self
                    .current
                    .compare_exchange(current, current + 1, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
            {
                return StartPermit {
                    limiter: Arc::clone(self),
                };
            }
            tokio::time::sleep(LIMITER_POLL_INTERVAL).await;
        }
    }
}

struct StartPermit {
    limiter: Arc<StartLimiter>,
}

impl Drop for StartPermit {
    fn drop(&mut self) {
        self.limiter.current.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Tunables for a system handle.
#[derive(Clone)]
pub struct SystemOptions {
    pub create_timeout: Duration,
    pub start_timeout: Duration,
    pub pause_timeout: Duration,
    pub resume_timeout: Duration,
    pub watchdog_threshold: Duration,
    pub start_limiter: Option<Arc<StartLimiter>>,
}

impl Default for SystemOptions {
    fn default() -> Self {
        Self {
            create_timeout: DEFAULT_OPERATION_TIMEOUT,
            start_timeout: DEFAULT_OPERATION_TIMEOUT,
            pause_timeout: DEFAULT_OPERATION_TIMEOUT,
            resume_timeout: DEFAULT_OPERATION_TIMEOUT,
            watchdog_threshold: DEFAULT_WATCHDOG_THRESHOLD,
            start_limiter: None,
        }
    }
}

/// A handle to one compute system.
pub struct System {
    id: String,
    owner: String,
    api: Arc<dyn ComputeApi>,
    options: SystemOptions,
    handle: RwLock<Option<RawHandle>>,
    callback: Mutex<Option<CallbackId>>,
    wait_block: WaitBlock,
    exit_error: Mutex<Option<HcsliteError>>,
    os_type: OnceLock<GuestOs>,
    system_type: OnceLock<SystemType>,
}

impl System {
    /// Create a new compute system from a marshalled configuration document.
    ///
    /// Waits for the create-completed notification with the configured
    /// deadline; on timeout a best-effort terminate is issued before the
    /// error propagates.
    pub async fn create(
        api: Arc<dyn ComputeApi>,
        id: &str,
        owner: &str,
        document: &serde_json::Value,
        options: SystemOptions,
    ) -> HcsliteResult<Arc<Self>> {
        let ctx = || OpContext::new("hcs::system::create").system(id);
        let raw = serde_json::to_string(document).map_err(|e| {
            HcsliteError::Json(e.to_string()).in_op(ctx())
        })?;

        tracing::debug!(id, owner, "creating compute system");
        let handle = watched(
            "create_system",
            options.watchdog_threshold,
            api.create_system(id, &raw),
        )
        .await
        .map_err(|e| e.in_op(ctx()))?;

        let system = Self::from_handle(api, id, owner, handle, options)?;

        match callback::wait_for(
            system.callback_id()?,
            NotificationKind::SystemCreateCompleted,
            Some(system.options.create_timeout),
        )
        .await
        {
            Ok(()) => {}
            Err(err) => {
                if err.is_timeout() {
                    tracing::warn!(id, "create timed out; terminating");
                    let _ = system.api.terminate_system(handle, None).await;
                }
                let _ = system.close().await;
                return Err(err.in_op(ctx()));
            }
        }

        system.refresh_cached_properties().await?;
        system.spawn_waiter();
        Ok(system)
    }

    /// Open an existing compute system by identifier.
    pub async fn open(
        api: Arc<dyn ComputeApi>,
        id: &str,
        options: SystemOptions,
    ) -> HcsliteResult<Arc<Self>> {
        let ctx = || OpContext::new("hcs::system::open").system(id);
        let handle = watched("open_system", options.watchdog_threshold, api.open_system(id))
            .await
            .map_err(|e| e.in_op(ctx()))?;

        let system = Self::from_handle(api, id, "", handle, options)?;
        system.refresh_cached_properties().await?;
        system.spawn_waiter();
        Ok(system)
    }

    fn from_handle(
        api: Arc<dyn ComputeApi>,
        id: &str,
        owner: &str,
        handle: RawHandle,
        options: SystemOptions,
    ) -> HcsliteResult<Arc<Self>> {
        let callback = match callback::register_for_system(&api, handle, id) {
            Ok(callback) => callback,
            Err(err) => {
                let _ = api.close_system(handle);
                return Err(err.in_op(OpContext::new("hcs::system::register_callback").system(id)));
            }
        };

        Ok(Arc::new(Self {
            id: id.to_string(),
            owner: owner.to_string(),
            api,
            options,
            handle: RwLock::new(Some(handle)),
            callback: Mutex::new(Some(callback)),
            wait_block: WaitBlock::new(),
            exit_error: Mutex::new(None),
            os_type: OnceLock::new(),
            system_type: OnceLock::new(),
        }))
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    /// Guest OS, cached from the first properties query.
    pub fn os_type(&self) -> Option<GuestOs> {
        self.os_type.get().copied()
    }

    /// System kind, cached from the first properties query.
    pub fn system_type(&self) -> Option<SystemType> {
        self.system_type.get().copied()
    }

    fn callback_id(&self) -> HcsliteResult<CallbackId> {
        self.callback.lock().ok_or(HcsliteError::AlreadyClosed)
    }

    async fn refresh_cached_properties(&self) -> HcsliteResult<()> {
        let props = self.properties(&PropertyQuery::default()).await?;
        if let Some(os) = GuestOs::parse(&props.runtime_os_type) {
            let _ = self.os_type.set(os);
        }
        if let Some(typ) = SystemType::parse(&props.system_type) {
            let _ = self.system_type.set(typ);
        }
        Ok(())
    }

    /// Start the compute system, honoring the optional global start limiter.
    pub async fn start(&self) -> HcsliteResult<()> {
        let _permit = match &self.options.start_limiter {
            Some(limiter) => Some(limiter.acquire().await),
            None => None,
        };

        let ctx = || OpContext::new("hcs::system::start").system(&self.id);
        // The handle lock is held for the platform call only; the
        // completion wait must not block close().
        let result = {
            let guard = self.handle.read().await;
            let handle = guard
                .ok_or(HcsliteError::AlreadyClosed)
                .map_err(|e| e.in_op(ctx()))?;
            watched(
                "start_system",
                self.options.watchdog_threshold,
                self.api.start_system(handle, None),
            )
            .await
        };
        self.await_if_pending(
            result,
            NotificationKind::SystemStartCompleted,
            self.options.start_timeout,
        )
        .await
        .map_err(|e| e.in_op(ctx()))
    }

    /// Request a graceful shutdown. Asynchronous on the platform: already
    /// stopped, not found, and pending all count as success, and the
    /// background waiter observes the actual exit.
    pub async fn shutdown(&self) -> HcsliteResult<()> {
        let ctx = || OpContext::new("hcs::system::shutdown").system(&self.id);
        let guard = self.handle.read().await;
        let handle = guard.ok_or(HcsliteError::AlreadyClosed).map_err(|e| e.in_op(ctx()))?;

        let result = watched(
            "shutdown_system",
            self.options.watchdog_threshold,
            self.api.shutdown_system(handle, None),
        )
        .await;
        Self::ignore_stop_races(result).map_err(|e| e.in_op(ctx()))
    }

    /// Force-terminate. Same success semantics as [`System::shutdown`].
    pub async fn terminate(&self) -> HcsliteResult<()> {
        let ctx = || OpContext::new("hcs::system::terminate").system(&self.id);
        let guard = self.handle.read().await;
        let handle = guard.ok_or(HcsliteError::AlreadyClosed).map_err(|e| e.in_op(ctx()))?;

        let result = watched(
            "terminate_system",
            self.options.watchdog_threshold,
            self.api.terminate_system(handle, None),
        )
        .await;
        Self::ignore_stop_races(result).map_err(|e| e.in_op(ctx()))
    }

    pub async fn pause(&self) -> HcsliteResult<()> {
        let ctx = || OpContext::new("hcs::system::pause").system(&self.id);
        let result = {
            let guard = self.handle.read().await;
            let handle = guard
                .ok_or(HcsliteError::AlreadyClosed)
                .map_err(|e| e.in_op(ctx()))?;
            watched(
                "pause_system",
                self.options.watchdog_threshold,
                self.api.pause_system(handle, None),
            )
            .await
        };
        self.await_if_pending(
            result,
            NotificationKind::SystemPauseCompleted,
            self.options.pause_timeout,
        )
        .await
        .map_err(|e| e.in_op(ctx()))
    }

    pub async fn resume(&self) -> HcsliteResult<()> {
        let ctx = || OpContext::new("hcs::system::resume").system(&self.id);
        let result = {
            let guard = self.handle.read().await;
            let handle = guard
                .ok_or(HcsliteError::AlreadyClosed)
                .map_err(|e| e.in_op(ctx()))?;
            watched(
                "resume_system",
                self.options.watchdog_threshold,
                self.api.resume_system(handle, None),
            )
            .await
        };
        self.await_if_pending(
            result,
            NotificationKind::SystemResumeCompleted,
            self.options.resume_timeout,
        )
        .await
        .map_err(|e| e.in_op(ctx()))
    }

    /// Send a modify-settings request.
    pub async fn modify(&self, request: &ModifyRequest) -> HcsliteResult<()> {
        let ctx = || OpContext::new("hcs::system::modify").system(&self.id);
        let raw = serde_json::to_string(request).map_err(|e| {
            HcsliteError::Json(e.to_string()).in_op(ctx())
        })?;

        let guard = self.handle.read().await;
        let handle = guard.ok_or(HcsliteError::AlreadyClosed).map_err(|e| e.in_op(ctx()))?;
        watched(
            "modify_system",
            self.options.watchdog_threshold,
            self.api.modify_system(handle, &raw),
        )
        .await
        .map_err(|e| e.in_op(ctx()))
    }

    /// Query properties.
    pub async fn properties(&self, query: &PropertyQuery) -> HcsliteResult<SystemProperties> {
        let ctx = || OpContext::new("hcs::system::properties").system(&self.id);
        let raw_query = serde_json::to_string(query).map_err(|e| {
            HcsliteError::Json(e.to_string()).in_op(ctx())
        })?;

        let guard = self.handle.read().await;
        let handle = guard.ok_or(HcsliteError::AlreadyClosed).map_err(|e| e.in_op(ctx()))?;
        let raw = watched(
            "system_properties",
            self.options.watchdog_threshold,
            self.api.system_properties(handle, &raw_query),
        )
        .await
        .map_err(|e| e.in_op(ctx()))?;
        serde_json::from_str(&raw).map_err(|e| HcsliteError::Json(e.to_string()).in_op(ctx()))
    }

    /// Block until the system reaches its terminal state.
    ///
    /// Resolves exactly once; every later call returns the same value
    /// without blocking. A clean exit (including a requested terminate) is
    /// `Ok(())`.
    pub async fn wait(&self) -> HcsliteResult<()> {
        match self.wait_block.wait().await {
            None => Ok(()),
            Some(err) => Err(err),
        }
    }

    /// Non-blocking terminal-state check: `NotExited` before the wait block
    /// resolves, then the cause of an unexpected exit (or the terminal
    /// error) forever after.
    pub fn exit_error(&self) -> HcsliteResult<()> {
        match self.wait_block.peek() {
            None => Err(HcsliteError::NotExited),
            Some(terminal) => {
                if let Some(cause) = self.exit_error.lock().clone() {
                    return Err(cause);
                }
                match terminal {
                    None => Ok(()),
                    Some(err) => Err(err),
                }
            }
        }
    }

    /// Release the handle.
    ///
    /// Takes the handle lock exclusively, unregisters the callback, closes
    /// the native handle, and resolves the wait block with `AlreadyClosed`
    /// if the system had not already exited.
    pub async fn close(&self) -> HcsliteResult<()> {
        let mut guard = self.handle.write().await;
        let Some(handle) = guard.take() else {
            return Ok(());
        };

        if let Some(callback) = self.callback.lock().take() {
            callback::unregister(&self.api, callback)?;
        }
        self.api.close_system(handle)?;
        self.wait_block.resolve(Some(HcsliteError::AlreadyClosed));
        tracing::debug!(id = %self.id, "closed compute system handle");
        Ok(())
    }

    /// Treat a pending platform result as "await the completion
    /// notification"; anything else passes through.
    async fn await_if_pending(
        &self,
        result: HcsliteResult<()>,
        kind: NotificationKind,
        timeout: Duration,
    ) -> HcsliteResult<()> {
        match result {
            Err(err) if err.is_pending() => {
                callback::wait_for(self.callback_id()?, kind, Some(timeout)).await
            }
            other => other,
        }
    }

    fn ignore_stop_races(result: HcsliteResult<()>) -> HcsliteResult<()> {
        match result {
            Ok(()) => Ok(()),
            Err(err) if err.is_already_stopped() || err.is_pending() => Ok(()),
            Err(err) => Err(err),
        }
    }

    /// One task per handle, spawned at create/open time. Resolves the wait
    /// block from the exit notification, recording the cause separately
    /// when the platform reports an unexpected exit.
    fn spawn_waiter(self: &Arc<Self>) {
        let system = Arc::clone(self);
        let Ok(callback) = self.callback_id() else {
            return;
        };
        tokio::spawn(async move {
            let (kind, result) = callback::wait_for_either(
                callback,
                NotificationKind::SystemExited,
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
                    Err(err) if matches!(err.root(), HcsliteError::UnexpectedExit) => {
                        *system.exit_error.lock() = Some(err);
                        None
                    }
                    Err(err) => Some(err),
                },
            };

            if system.wait_block.resolve(terminal) {
                tracing::debug!(id = %system.id, ?kind, "compute system reached terminal state");
            }
        });
    }

    pub(crate) fn api(&self) -> &Arc<dyn ComputeApi> {
        &self.api
    }

    pub(crate) fn watchdog_threshold(&self) -> Duration {
        self.options.watchdog_threshold
    }

    pub(crate) async fn with_handle<T>(
        &self,
        op: &'static str,
        f: impl AsyncFnOnce(RawHandle) -> HcsliteResult<T>,
    ) -> HcsliteResult<T> {
        let guard = self.handle.read().await;
        let handle = guard.ok_or(HcsliteError::AlreadyClosed).map_err(|e| {
            e.in_op(OpContext::new(op).system(&self.id))
        })?;
        f(handle).await
    }
}

impl std::fmt::Debug for System {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("System")
            .field("id", &self.id)
            .field("owner", &self.owner)
            .field("os_type", &self.os_type.get())
            .field("system_type", &self.system_type.get())
            .finish_non_exhaustive()
    }
}
