//! The per-container state machine.
//!
//! The persisted record is the authoritative state. Creation decides who
//! owns the utility VM, mounts storage, and launches the shim that owns the
//! init process; the other operations derive everything from the record,
//! the shim pid, and the platform's reported state.

pub mod create;
pub mod ops;
pub mod record;
pub mod state;

use std::sync::Arc;

use crate::hcs::{ComputeApi, DiskApi, StartLimiter, SystemOptions};
use crate::layers::LayerMounter;
use crate::options::RuntimeOptions;
use crate::shim::spawn::{ExeShimLauncher, ShimLauncher};
use crate::store::StateStore;
use record::ContainerStore;

pub use create::CreateOptions;
pub use state::{ContainerState, ContainerStatus};

/// The host-side container runtime.
///
/// Cheap to clone; all clones share the platform capabilities and the
/// store.
#[derive(Clone)]
pub struct HcsliteRuntime {
    options: RuntimeOptions,
    api: Arc<dyn ComputeApi>,
    disk: Arc<dyn DiskApi>,
    layers: Arc<dyn LayerMounter>,
    containers: ContainerStore,
    shims: Arc<dyn ShimLauncher>,
    start_limiter: Option<Arc<StartLimiter>>,
}

impl HcsliteRuntime {
    pub fn new(
        options: RuntimeOptions,
        api: Arc<dyn ComputeApi>,
        disk: Arc<dyn DiskApi>,
        layers: Arc<dyn LayerMounter>,
        store: Arc<dyn StateStore>,
    ) -> Self {
        let start_limiter = options.max_parallel_starts.map(StartLimiter::new);
        Self {
            options,
            api,
            disk,
            layers,
            containers: ContainerStore::new(store),
            shims: Arc::new(ExeShimLauncher),
            start_limiter,
        }
    }

    /// Replace how shim helpers are launched. Tests run them in-process.
    pub fn with_shim_launcher(mut self, shims: Arc<dyn ShimLauncher>) -> Self {
        self.shims = shims;
        self
    }

    pub fn shims(&self) -> &Arc<dyn ShimLauncher> {
        &self.shims
    }

    pub fn options(&self) -> &RuntimeOptions {
        &self.options
    }

    pub fn api(&self) -> &Arc<dyn ComputeApi> {
        &self.api
    }

    pub fn disk(&self) -> &Arc<dyn DiskApi> {
        &self.disk
    }

    pub fn layers(&self) -> &Arc<dyn LayerMounter> {
        &self.layers
    }

    pub fn containers(&self) -> &ContainerStore {
        &self.containers
    }

    /// System-handle tunables, including the global start limiter.
    pub fn system_options(&self) -> SystemOptions {
        self.options.system_options(self.start_limiter.clone())
    }

    /// The environment handed to shim subcommands.
    pub fn shim_env(&self) -> crate::shim::ShimEnv {
        crate::shim::ShimEnv {
            options: self.options.clone(),
            api: self.api.clone(),
            disk: self.disk.clone(),
            layers: self.layers.clone(),
            containers: self.containers.clone(),
        }
    }
}

impl std::fmt::Debug for HcsliteRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HcsliteRuntime")
            .field("data_dir", &self.options.data_dir)
            .finish_non_exhaustive()
    }
}
