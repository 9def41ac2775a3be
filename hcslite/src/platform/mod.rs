//! Production platform bindings.
//!
//! [`connect`] yields the capability set the runtime consumes: the compute
//! service, virtual-disk helpers, and the layer-mount utilities. Only
//! Windows hosts carry a real Host Compute Service; every other target gets
//! a clear `Unsupported` error, and tests drive the runtime through the
//! in-memory fake instead.

use std::sync::Arc;

use hcslite_shared::HcsliteResult;

use crate::hcs::{ComputeApi, DiskApi};
use crate::layers::LayerMounter;

#[cfg(windows)]
mod windows;

#[cfg(windows)]
pub use windows::{is_process_alive, release_stderr};

/// The full capability set for this host.
pub struct Platform {
    pub compute: Arc<dyn ComputeApi>,
    pub disk: Arc<dyn DiskApi>,
    pub layers: Arc<dyn LayerMounter>,
}

/// Connect to the host's compute service.
#[cfg(windows)]
pub fn connect() -> HcsliteResult<Platform> {
    Ok(Platform {
        compute: Arc::new(windows::VmCompute::new()),
        disk: Arc::new(windows::VirtDisk),
        layers: Arc::new(windows::WcLayers::default()),
    })
}

/// Connect to the host's compute service.
#[cfg(not(windows))]
pub fn connect() -> HcsliteResult<Platform> {
    Err(hcslite_shared::HcsliteError::Unsupported(
        "the host compute service is only available on Windows".into(),
    ))
}
