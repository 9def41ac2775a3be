//! Shim processes.
//!
//! Two long-lived helpers run as children of the CLI: the container shim
//! owns a container's init process (or one exec'd process), and the VM shim
//! owns a sandbox's utility VM and serves per-VM requests over a pipe. Both
//! report readiness to their parent over the stderr-pipe convention in
//! [`spawn`].

pub mod container;
pub mod spawn;
pub mod vm;

use std::sync::Arc;

use hcslite_shared::protocol::{self, ShimRequest};
use hcslite_shared::{HcsliteResult, PipeAddr};
use tokio::io::AsyncWriteExt;

use crate::container::record::ContainerStore;
use crate::hcs::{ComputeApi, DiskApi};
use crate::layers::LayerMounter;
use crate::options::RuntimeOptions;
use crate::pipe;

/// Everything a shim needs from its host environment.
#[derive(Clone)]
pub struct ShimEnv {
    pub options: RuntimeOptions,
    pub api: Arc<dyn ComputeApi>,
    pub disk: Arc<dyn DiskApi>,
    pub layers: Arc<dyn LayerMounter>,
    pub containers: ContainerStore,
}

/// Send one request to a sandbox's VM shim and await its verdict.
///
/// Framing per the wire contract: framed JSON request, then the peer's
/// success marker or error text, then half-close and drain.
pub async fn vmshim_request(
    options: &RuntimeOptions,
    sandbox_id: &str,
    request: &ShimRequest,
) -> HcsliteResult<()> {
    let addr = PipeAddr::vmshim(sandbox_id);
    let mut stream = pipe::connect(&addr, &options.pipe_dir).await?;
    protocol::write_message(&mut stream, request).await?;
    stream.shutdown().await?;
    protocol::read_response(&mut stream).await
}
