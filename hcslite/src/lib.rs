//! hcslite - a host-side runtime for containers and utility VMs.
//!
//! hcslite turns OCI container specifications into live compute systems
//! managed by a platform Host Compute Service, maintains the lifecycle and
//! resource attachments of those systems, proxies process I/O into them,
//! and tears everything down cleanly on failure or exit.
//!
//! ## Architecture
//!
//! Three tightly coupled layers, bottom up:
//! - [`hcs`]: safe handles over the platform's callback-driven native
//!   operations (systems and processes), plus the notification dispatcher
//!   and result decoder.
//! - [`uvm`]: ref-counted resource attachment for a utility VM (SCSI,
//!   VSMB, Plan9, VPMem) and VM creation/scratch tooling.
//! - [`container`]: the per-container state machine driven by the `runhcs`
//!   CLI, with persisted records, layer mounting, and shim processes.
//!
//! The platform itself is consumed through the [`hcs::ComputeApi`]
//! capability; `platform::connect()` provides the production binding on
//! Windows hosts, and tests substitute an in-memory fake.

pub mod container;
pub mod hcs;
pub mod layers;
pub mod logging;
pub mod options;
pub mod pipe;
pub mod platform;
pub mod schema;
pub mod shim;
pub mod store;
pub mod util;
pub mod uvm;

pub use container::{ContainerState, ContainerStatus, CreateOptions, HcsliteRuntime};
pub use hcs::{GuestOs, Process, System, SystemType};
pub use hcslite_shared::{HcsliteError, HcsliteResult};
pub use options::RuntimeOptions;
pub use store::{SqliteStore, StateStore};
pub use uvm::{UtilityVm, UvmOptions};
