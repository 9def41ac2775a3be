//! Handles over the Host Compute Service.
//!
//! This layer sits directly above the platform capability: callback-driven
//! native operations become awaitable methods with deadlines, a one-shot
//! wait discipline, and taxonomy errors.

pub mod api;
pub mod callback;
pub mod process;
pub mod result;
pub mod system;
pub mod waitblock;
pub mod watchdog;

pub use api::{ComputeApi, DiskApi, NotificationKind, ProcessCreated, ProcessStdio, RawHandle};
pub use process::Process;
pub use system::{GuestOs, StartLimiter, System, SystemOptions, SystemType};
