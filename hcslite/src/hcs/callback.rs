//! Notification dispatcher.
//!
//! The platform delivers notifications by invoking a callback on a thread it
//! owns, with an opaque context value. Pointer addresses are not stable
//! enough to ride in that slot, so registration substitutes a monotonic
//! integer "callback number" and keeps the real context in a process-wide
//! map. [`deliver`] is the single entry point the platform bindings call.
//!
//! Locking: the map is a reader-writer lock, read for dispatch and wait,
//! write for insert/remove. The platform unregister call blocks until
//! in-flight callbacks return, and those callbacks take the read lock, so
//! the map lock is never held across the unregister call.

use std::collections::HashMap;
use std::sync::LazyLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use hcslite_shared::{HcsliteError, HcsliteResult};
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use tokio::sync::Notify;

use super::api::{ComputeApi, NotificationKind, RawHandle};
use super::result;

static NEXT_CALLBACK_NUMBER: AtomicU64 = AtomicU64::new(1);

static CALLBACKS: LazyLock<RwLock<HashMap<u64, Arc<CallbackContext>>>> =
    LazyLock::new(|| RwLock::new(HashMap::new()));

/// Identifier handed back by registration.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CallbackId(u64);

impl CallbackId {
    pub fn number(self) -> u64 {
        self.0
    }
}

const SYSTEM_KINDS: &[NotificationKind] = &[
    NotificationKind::SystemExited,
    NotificationKind::SystemCreateCompleted,
    NotificationKind::SystemStartCompleted,
    NotificationKind::SystemPauseCompleted,
    NotificationKind::SystemResumeCompleted,
    NotificationKind::SystemSaveCompleted,
    NotificationKind::ServiceDisconnect,
];

const PROCESS_KINDS: &[NotificationKind] = &[
    NotificationKind::ProcessExited,
    NotificationKind::ServiceDisconnect,
];

struct CallbackContext {
    channels: HashMap<NotificationKind, NotifySlot>,
    system_id: String,
    process_id: Option<u32>,
    callback_handle: Mutex<Option<RawHandle>>,
}

impl CallbackContext {
    fn new(kinds: &[NotificationKind], system_id: &str, process_id: Option<u32>) -> Self {
        Self {
            channels: kinds.iter().map(|k| (*k, NotifySlot::new())).collect(),
            system_id: system_id.to_string(),
            process_id,
            callback_handle: Mutex::new(None),
        }
    }

    fn close_all(&self) {
        for slot in self.channels.values() {
            slot.close();
        }
    }
}

/// Register a callback for a compute system handle.
pub fn register_for_system(
    api: &Arc<dyn ComputeApi>,
    handle: RawHandle,
    system_id: &str,
) -> HcsliteResult<CallbackId> {
    register(
        api,
        handle,
        CallbackContext::new(SYSTEM_KINDS, system_id, None),
        true,
    )
}

/// Register a callback for a process handle.
pub fn register_for_process(
    api: &Arc<dyn ComputeApi>,
    handle: RawHandle,
    system_id: &str,
    pid: u32,
) -> HcsliteResult<CallbackId> {
    register(
        api,
        handle,
        CallbackContext::new(PROCESS_KINDS, system_id, Some(pid)),
        false,
    )
}

fn register(
    api: &Arc<dyn ComputeApi>,
    handle: RawHandle,
    context: CallbackContext,
    system: bool,
) -> HcsliteResult<CallbackId> {
    let number = NEXT_CALLBACK_NUMBER.fetch_add(1, Ordering::Relaxed);
    let context = Arc::new(context);
    CALLBACKS.write().insert(number, Arc::clone(&context));

    let registered = if system {
        api.register_system_callback(handle, number)
    } else {
        api.register_process_callback(handle, number)
    };

    match registered {
        Ok(callback_handle) => {
            *context.callback_handle.lock() = Some(callback_handle);
            tracing::debug!(
                callback = number,
                system_id = %context.system_id,
                pid = ?context.process_id,
                "registered platform callback"
            );
            Ok(CallbackId(number))
        }
        Err(err) => {
            CALLBACKS.write().remove(&number);
            Err(err)
        }
    }
}

/// Entry point invoked by the platform binding on its own threads.
///
/// Non-blocking: decodes the payload and stores it in the capacity-one slot
/// for `(callback, kind)`; the most recent value wins. Notifications for an
/// unknown callback number are logged and dropped.
pub fn deliver(callback_number: u64, notification_code: u32, hresult: i32, payload: Option<&str>) {
    let context = match CALLBACKS.read().get(&callback_number) {
        Some(context) => Arc::clone(context),
        None => {
            tracing::warn!(
                callback = callback_number,
                code = format_args!("{:#x}", notification_code),
                "notification for unknown callback; dropping"
            );
            return;
        }
    };

    let kind = match NotificationKind::from_code(notification_code) {
        Some(kind) => kind,
        None => {
            tracing::warn!(
                callback = callback_number,
                code = format_args!("{:#x}", notification_code),
                system_id = %context.system_id,
                "unknown notification kind; dropping"
            );
            return;
        }
    };

    let error = result::decode(hresult, payload);
    match context.channels.get(&kind) {
        Some(slot) => slot.send(error),
        None => tracing::warn!(
            callback = callback_number,
            ?kind,
            system_id = %context.system_id,
            "notification kind not expected for this object; dropping"
        ),
    }
}

/// Receive one notification of `kind`, honoring an optional deadline.
///
/// The received value is the decoded platform error for that notification:
/// `Ok(())` for a clean notification, the error otherwise. A closed channel
/// surfaces as `AlreadyClosed`, an elapsed deadline as `Timeout`.
pub async fn wait_for(
    id: CallbackId,
    kind: NotificationKind,
    timeout: Option<Duration>,
) -> HcsliteResult<()> {
    let slot = slot_for(id, kind)?;
    match slot.recv(timeout).await {
        Ok(None) => Ok(()),
        Ok(Some(err)) => Err(err),
        Err(RecvError::Closed) => Err(HcsliteError::AlreadyClosed),
        Err(RecvError::Timeout(d)) => Err(HcsliteError::Timeout(d)),
    }
}

/// Receive whichever of `first` or `second` fires first.
///
/// Used by background waiters that must observe both an exit notification
/// and a service disconnect.
pub async fn wait_for_either(
    id: CallbackId,
    first: NotificationKind,
    second: NotificationKind,
) -> (NotificationKind, HcsliteResult<()>) {
    let map_result = |r: Result<Option<HcsliteError>, RecvError>| match r {
        Ok(None) => Ok(()),
        Ok(Some(err)) => Err(err),
        Err(RecvError::Closed) => Err(HcsliteError::AlreadyClosed),
        Err(RecvError::Timeout(d)) => Err(HcsliteError::Timeout(d)),
    };

    let (slot_a, slot_b) = match (slot_for(id, first), slot_for(id, second)) {
        (Ok(a), Ok(b)) => (a, b),
        (Err(err), _) | (_, Err(err)) => return (first, Err(err)),
    };

    tokio::select! {
        r = slot_a.recv(None) => (first, map_result(r)),
        r = slot_b.recv(None) => (second, map_result(r)),
    }
}

fn slot_for(id: CallbackId, kind: NotificationKind) -> HcsliteResult<NotifySlot> {
    let context = CALLBACKS
        .read()
        .get(&id.0)
        .cloned()
        .ok_or(HcsliteError::AlreadyClosed)?;
    context
        .channels
        .get(&kind)
        .cloned()
        .ok_or_else(|| HcsliteError::Internal(format!("no channel for {:?}", kind)))
}

/// Tear down a registration.
///
/// Closes every channel (waking waiters with `AlreadyClosed`), invokes the
/// platform unregister — which blocks until in-flight callbacks return, so
/// the map lock must not be held here — and finally removes the map entry.
pub fn unregister(api: &Arc<dyn ComputeApi>, id: CallbackId) -> HcsliteResult<()> {
    let context = match CALLBACKS.read().get(&id.0) {
        Some(context) => Arc::clone(context),
        None => return Ok(()),
    };

    context.close_all();

    if let Some(handle) = context.callback_handle.lock().take() {
        api.unregister_callback(handle)?;
    }

    CALLBACKS.write().remove(&id.0);
    tracing::debug!(callback = id.0, system_id = %context.system_id, "unregistered platform callback");
    Ok(())
}

// ----------------------------------------------------------------------------
// Capacity-one notification slot
// ----------------------------------------------------------------------------

#[derive(Debug)]
enum RecvError {
    Closed,
    Timeout(Duration),
}

struct SlotState {
    value: Option<Option<HcsliteError>>,
    closed: bool,
}

/// A capacity-one channel where the most recent send wins.
///
/// Sends never block, which makes the slot safe to fill from the platform's
/// callback threads.
#[derive(Clone)]
struct NotifySlot {
    inner: Arc<SlotInner>,
}

struct SlotInner {
    state: Mutex<SlotState>,
    notify: Notify,
}

impl NotifySlot {
    fn new() -> Self {
        Self {
            inner: Arc::new(SlotInner {
                state: Mutex::new(SlotState {
                    value: None,
                    closed: false,
                }),
                notify: Notify::new(),
            }),
        }
    }

    fn send(&self, value: Option<HcsliteError>) {
        {
            let mut state = self.inner.state.lock();
            if state.closed {
                tracing::trace!("notification after channel close; dropping");
                return;
            }
            state.value = Some(value);
        }
        self.inner.notify.notify_waiters();
    }

    fn close(&self) {
        self.inner.state.lock().closed = true;
        self.inner.notify.notify_waiters();
    }

    async fn recv(&self, timeout: Option<Duration>) -> Result<Option<HcsliteError>, RecvError> {
        let deadline = timeout.map(|d| tokio::time::Instant::now() + d);
        loop {
            // Arm the waiter before inspecting state so a send between the
            // check and the await cannot be missed.
            let notified = self.inner.notify.notified();
            {
                let mut state = self.inner.state.lock();
                if let Some(value) = state.value.take() {
                    return Ok(value);
                }
                if state.closed {
                    return Err(RecvError::Closed);
                }
            }
            match deadline {
                Some(deadline) => {
                    if tokio::time::timeout_at(deadline, notified).await.is_err() {
                        return Err(RecvError::Timeout(timeout.unwrap_or_default()));
                    }
                }
                None => notified.await,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn slot_delivers_a_value() {
        let slot = NotifySlot::new();
        slot.send(None);
        assert!(matches!(slot.recv(None).await, Ok(None)));
    }

    #[tokio::test]
    async fn most_recent_send_wins() {
        let slot = NotifySlot::new();
        slot.send(Some(HcsliteError::Pending));
        slot.send(Some(HcsliteError::AlreadyStopped));
        match slot.recv(None).await {
            Ok(Some(err)) => assert_eq!(err, HcsliteError::AlreadyStopped),
            other => panic!("unexpected: {:?}", other.map(|v| v.map(|e| e.to_string()))),
        }
    }

    #[tokio::test]
    async fn recv_times_out() {
        let slot = NotifySlot::new();
        let result = slot.recv(Some(Duration::from_millis(20))).await;
        assert!(matches!(result, Err(RecvError::Timeout(_))));
    }

    #[tokio::test]
    async fn close_wakes_waiters() {
        let slot = NotifySlot::new();
        let waiter = {
            let slot = slot.clone();
            tokio::spawn(async move { slot.recv(None).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        slot.close();
        assert!(matches!(waiter.await.unwrap(), Err(RecvError::Closed)));
    }

    #[tokio::test]
    async fn send_from_a_foreign_thread_reaches_an_async_waiter() {
        let slot = NotifySlot::new();
        let sender = slot.clone();
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(10));
            sender.send(None);
        });
        let received = slot.recv(Some(Duration::from_secs(5))).await;
        assert!(matches!(received, Ok(None)));
    }
}
