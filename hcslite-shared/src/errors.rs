//! Error taxonomy for the runtime.
//!
//! Every layer of the runtime reports through [`HcsliteError`]. Platform
//! failures are classified into well-known kinds so that callers can recover
//! locally (shutdown treats "already stopped" as success, attach paths treat
//! "pending" as in-flight, and so on). Wrapped errors keep their causal chain:
//! the recovery predicates always inspect the root cause, not the outermost
//! wrapper.
//!
//! The type is `Clone` on purpose. A compute system's terminal error is
//! observed by every caller blocked in `wait()`, so the stored value must be
//! shareable.

use std::fmt;
use std::time::Duration;

use thiserror::Error;

/// Convenience alias used across the workspace.
pub type HcsliteResult<T> = Result<T, HcsliteError>;

/// Context attached when an error is wrapped at an operation boundary.
///
/// Carries the operation name and whichever identities apply (system id,
/// process pid, container id), plus any error events decoded from the
/// platform's JSON result document.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OpContext {
    pub op: String,
    pub system_id: Option<String>,
    pub pid: Option<u32>,
    pub container_id: Option<String>,
    pub events: Vec<String>,
}

impl OpContext {
    pub fn new(op: impl Into<String>) -> Self {
        Self {
            op: op.into(),
            ..Default::default()
        }
    }

    pub fn system(mut self, id: impl Into<String>) -> Self {
        self.system_id = Some(id.into());
        self
    }

    pub fn pid(mut self, pid: u32) -> Self {
        self.pid = Some(pid);
        self
    }

    pub fn container(mut self, id: impl Into<String>) -> Self {
        self.container_id = Some(id.into());
        self
    }

    pub fn events(mut self, events: Vec<String>) -> Self {
        self.events = events;
        self
    }
}

impl fmt::Display for OpContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.op)?;
        if let Some(id) = &self.system_id {
            write!(f, " {}", id)?;
        }
        if let Some(pid) = self.pid {
            write!(f, " pid {}", pid)?;
        }
        if let Some(id) = &self.container_id {
            write!(f, " container {}", id)?;
        }
        for event in &self.events {
            write!(f, ": {}", event)?;
        }
        Ok(())
    }
}

/// Errors that can occur anywhere in the runtime.
///
/// The first group mirrors the platform's well-known failure kinds; the second
/// group covers the utility-VM resource tables; the rest are ambient
/// (io/json/storage/protocol) with an [`Operation`](HcsliteError::Operation)
/// wrapper that retains the cause.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum HcsliteError {
    /// Compute system or process does not exist.
    #[error("compute system or process not found: {0}")]
    NotFound(String),

    /// Compute system or process is already terminated.
    #[error("already stopped")]
    AlreadyStopped,

    /// The local handle was closed.
    #[error("handle is already closed")]
    AlreadyClosed,

    /// Operation not valid in the current state.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// An asynchronous operation exceeded its deadline.
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    /// The platform did not understand the request.
    #[error("unsupported platform request: {0}")]
    Unsupported(String),

    /// An asynchronous operation is still in progress.
    #[error("operation is pending")]
    Pending,

    /// The compute system terminated outside of a requested shutdown.
    #[error("compute system exited unexpectedly")]
    UnexpectedExit,

    /// Lost communication with the compute service.
    #[error("lost communication with the compute service")]
    ServiceDisconnect,

    /// The platform refused the operation.
    #[error("operation denied")]
    OperationDenied,

    /// The platform refused access to the object.
    #[error("access denied")]
    AccessDenied,

    /// `exit_code` was queried before the process exited.
    #[error("process has not yet exited")]
    NotExited,

    /// Every slot of a fixed-capacity attachment table is occupied.
    #[error("no free slots available")]
    NoFreeSlots,

    /// The host path is already attached to this utility VM.
    #[error("already attached: {0}")]
    AlreadyAttached(String),

    /// The attachment would exceed what the platform supports today.
    #[error("too many attachments")]
    TooManyAttachments,

    /// The host path is not attached to this utility VM.
    #[error("not attached: {0}")]
    NotAttached(String),

    /// Filesystem or pipe I/O failure.
    #[error("io: {0}")]
    Io(String),

    /// JSON marshalling failure.
    #[error("json: {0}")]
    Json(String),

    /// Persisted state store failure.
    #[error("storage: {0}")]
    Storage(String),

    /// Shim pipe protocol violation.
    #[error("protocol: {0}")]
    Protocol(String),

    /// Anything that should not happen.
    #[error("{0}")]
    Internal(String),

    /// An error wrapped with the operation name and object identity.
    #[error("{context}: {source}")]
    Operation {
        context: OpContext,
        #[source]
        source: Box<HcsliteError>,
    },
}

impl HcsliteError {
    /// Wrap this error with operation context.
    pub fn in_op(self, context: OpContext) -> Self {
        Self::Operation {
            context,
            source: Box::new(self),
        }
    }

    /// Walk the `Operation` chain down to the root cause.
    pub fn root(&self) -> &HcsliteError {
        let mut err = self;
        while let HcsliteError::Operation { source, .. } = err {
            err = source;
        }
        err
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self.root(), HcsliteError::NotFound(_))
    }

    /// True for "already stopped" and for "does not exist": both mean the
    /// object is gone as far as a stop path is concerned.
    pub fn is_already_stopped(&self) -> bool {
        matches!(
            self.root(),
            HcsliteError::AlreadyStopped | HcsliteError::NotFound(_)
        )
    }

    pub fn is_already_closed(&self) -> bool {
        matches!(self.root(), HcsliteError::AlreadyClosed)
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self.root(), HcsliteError::Timeout(_))
    }

    pub fn is_pending(&self) -> bool {
        matches!(self.root(), HcsliteError::Pending)
    }

    pub fn is_not_supported(&self) -> bool {
        matches!(self.root(), HcsliteError::Unsupported(_))
    }

    pub fn is_access_denied(&self) -> bool {
        matches!(
            self.root(),
            HcsliteError::AccessDenied | HcsliteError::OperationDenied
        )
    }

    pub fn is_invalid_state(&self) -> bool {
        matches!(self.root(), HcsliteError::InvalidState(_))
    }
}

impl From<std::io::Error> for HcsliteError {
    fn from(err: std::io::Error) -> Self {
        HcsliteError::Io(err.to_string())
    }
}

impl From<serde_json::Error> for HcsliteError {
    fn from(err: serde_json::Error) -> Self {
        HcsliteError::Json(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn predicates_inspect_the_root_cause() {
        let err = HcsliteError::NotFound("vm1".into())
            .in_op(OpContext::new("hcs::system::start").system("vm1"))
            .in_op(OpContext::new("container::exec").container("c1"));

        assert!(err.is_not_found());
        assert!(err.is_already_stopped());
        assert!(!err.is_timeout());
        assert_eq!(err.root(), &HcsliteError::NotFound("vm1".into()));
    }

    #[test]
    fn already_stopped_covers_not_found() {
        assert!(HcsliteError::AlreadyStopped.is_already_stopped());
        assert!(HcsliteError::NotFound("p".into()).is_already_stopped());
        assert!(!HcsliteError::Pending.is_already_stopped());
    }

    #[test]
    fn display_includes_operation_and_identity() {
        let err = HcsliteError::AccessDenied
            .in_op(OpContext::new("hcs::system::modify").system("uvm-3").pid(42));
        let text = err.to_string();
        assert!(text.contains("hcs::system::modify"));
        assert!(text.contains("uvm-3"));
        assert!(text.contains("pid 42"));
        assert!(text.contains("access denied"));
    }

    #[test]
    fn display_includes_decoded_events() {
        let err = HcsliteError::InvalidState("cannot start".into()).in_op(
            OpContext::new("hcs::system::start")
                .system("c9")
                .events(vec!["vm is in the wrong state".into()]),
        );
        assert!(err.to_string().contains("vm is in the wrong state"));
    }
}
