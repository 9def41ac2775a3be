//! Layer-mount collaborator interface.
//!
//! Building the union filesystem out of layer folders is platform plumbing
//! that lives outside this runtime. The container state machine only needs
//! the operations below; the production implementation is supplied with the
//! platform capability set.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use hcslite_shared::HcsliteResult;

/// How much of a container's storage to tear down.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UnmountOp {
    /// Layers and scratch disk.
    All,
    /// Only detach the scratch disk, leaving layer state for a later full
    /// unmount.
    DiskOnly,
}

/// Mounts and unmounts a container's layer stack.
#[async_trait]
pub trait LayerMounter: Send + Sync {
    /// Mount the layer folders for `container_id` and return the rootfs
    /// path the compute system should use.
    async fn mount(&self, container_id: &str, layer_folders: &[PathBuf])
    -> HcsliteResult<PathBuf>;

    /// Tear down what [`LayerMounter::mount`] built.
    async fn unmount(
        &self,
        container_id: &str,
        layer_folders: &[PathBuf],
        op: UnmountOp,
    ) -> HcsliteResult<()>;
}

/// Normalize a path against the working directory the way the platform
/// expects: relative paths become absolute, but extended-length paths
/// (`\\?\`-prefixed) pass through untouched.
pub fn absolutize(path: &Path, cwd: &Path) -> PathBuf {
    let raw = path.to_string_lossy();
    if raw.starts_with(r"\\?\") || path.is_absolute() {
        return path.to_path_buf();
    }
    cwd.join(path)
}
