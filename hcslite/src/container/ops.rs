//! Container operations past creation.

use std::path::{Path, PathBuf};

use hcslite_shared::errors::{HcsliteError, HcsliteResult, OpContext};
use hcslite_shared::protocol::{ShimOp, ShimRequest};
use hcslite_shared::PipeAddr;
use tokio::io::AsyncWriteExt;

use super::HcsliteRuntime;
use super::record;
use super::state::{ContainerState, ContainerStatus};
use crate::hcs::{GuestOs, System};
use crate::layers::UnmountOp;
use crate::pipe;
use crate::schema::PropertyQuery;
use crate::util::is_process_alive;
use crate::uvm::{self, UvmOptions};

impl HcsliteRuntime {
    /// Start a created container: start the compute system, then trigger
    /// the init shim through the container's pipe.
    pub async fn start(&self, id: &str) -> HcsliteResult<()> {
        let ctx = || OpContext::new("container::start").container(id);
        let _record = self.containers().load_record(id).map_err(|e| e.in_op(ctx()))?;
        let shim_pid = self.containers().shim_pid(id)?;
        if shim_pid == 0 {
            return Err(
                HcsliteError::InvalidState("the container has no shim".into()).in_op(ctx()),
            );
        }

        let system = System::open(self.api().clone(), id, self.system_options())
            .await
            .map_err(|e| e.in_op(ctx()))?;
        let started = system.start().await;
        let _ = system.close().await;
        started.map_err(|e| e.in_op(ctx()))?;

        // Dial the shim and read its verdict on the init launch.
        let triggered = self.trigger_init(id).await;
        if let Err(err) = triggered {
            if !is_process_alive(shim_pid) {
                return Err(HcsliteError::InvalidState(format!(
                    "the container shim (pid {}) died: {}",
                    shim_pid, err
                ))
                .in_op(ctx()));
            }
            return Err(err.in_op(ctx()));
        }
        tracing::info!(container = id, "started container");
        Ok(())
    }

    async fn trigger_init(&self, id: &str) -> HcsliteResult<()> {
        let addr = PipeAddr::shim(id);
        let mut stream = pipe::connect(&addr, &self.options().pipe_dir).await?;
        // The trigger carries no payload; half-close and await the verdict.
        stream.shutdown().await?;
        hcslite_shared::protocol::read_response(&mut stream).await
    }

    /// Exec an additional process. Blocks until the process exits and
    /// returns its exit code.
    pub async fn exec(
        &self,
        id: &str,
        process_file: &Path,
        stdin: Option<&str>,
        stdout: Option<&str>,
        stderr: Option<&str>,
        shim_log: Option<&Path>,
    ) -> HcsliteResult<i32> {
        let ctx = || OpContext::new("container::exec").container(id);
        let _record = self.containers().load_record(id).map_err(|e| e.in_op(ctx()))?;

        let mut args = vec![
            "shim".to_string(),
            "--container".to_string(),
            id.to_string(),
            "--data-dir".to_string(),
            self.options().data_dir.to_string_lossy().into_owned(),
            "--exec".to_string(),
            "--process".to_string(),
            process_file.to_string_lossy().into_owned(),
        ];
        for (flag, value) in [("--stdin", stdin), ("--stdout", stdout), ("--stderr", stderr)] {
            if let Some(value) = value {
                args.push(flag.to_string());
                args.push(value.to_string());
            }
        }
        if let Some(log) = shim_log {
            args.push("--log".to_string());
            args.push(log.to_string_lossy().into_owned());
        }

        let shim = self.shims().launch(&args, None).await.map_err(|e| e.in_op(ctx()))?;
        shim.wait().await.map_err(|e| e.in_op(ctx()))
    }

    /// Signal the container. Termination is the only signal the platform
    /// carries for a compute system; pending means "wait for the exit".
    pub async fn kill(&self, id: &str, signal: Option<i32>) -> HcsliteResult<()> {
        let ctx = || OpContext::new("container::kill").container(id);
        let _record = self.containers().load_record(id).map_err(|e| e.in_op(ctx()))?;

        let system = match System::open(self.api().clone(), id, self.system_options()).await {
            Ok(system) => system,
            Err(err) if err.is_already_stopped() => return Ok(()),
            Err(err) => return Err(err.in_op(ctx())),
        };

        // A system that already stopped has no exit left to wait for.
        if let Ok(props) = system.properties(&PropertyQuery::default()).await {
            if props.stopped || props.state == "Stopped" {
                let _ = system.close().await;
                return Ok(());
            }
        }

        tracing::debug!(container = id, ?signal, "terminating compute system");
        let terminated = system.terminate().await;
        let result = match terminated {
            Ok(()) => {
                // Terminate reports success for pending too; the wait block
                // resolves once the exit notification lands.
                system.wait().await
            }
            Err(err) if err.is_already_stopped() => Ok(()),
            Err(err) => Err(err),
        };
        let _ = system.close().await;
        result.map_err(|e| e.in_op(ctx()))
    }

    /// Remove a container record and tear down its resources.
    pub async fn remove(&self, id: &str, force: bool) -> HcsliteResult<()> {
        let ctx = || OpContext::new("container::remove").container(id);
        let record = match self.containers().load_record(id) {
            Ok(record) => record,
            Err(err) if err.is_not_found() && force => return Ok(()),
            Err(err) => return Err(err.in_op(ctx())),
        };

        let (status, _) = self.status(id).await?;
        if status == ContainerStatus::Running || status == ContainerStatus::Paused {
            if !force {
                return Err(HcsliteError::InvalidState(format!(
                    "container {} is {}",
                    id, status
                ))
                .in_op(ctx()));
            }
            self.kill(id, None).await?;
        }

        if self.containers().mounted(id)? {
            let unmounted = if record.vm_isolated && !record.is_sandbox {
                crate::shim::vmshim_request(
                    self.options(),
                    &record.sandbox_id,
                    &ShimRequest {
                        id: id.to_string(),
                        op: ShimOp::UnmountContainer,
                    },
                )
                .await
            } else if !record.vm_isolated {
                self.layers()
                    .unmount(id, &record::layer_folders(&record.spec), UnmountOp::All)
                    .await
            } else {
                // The sandbox's own storage lives and dies with its VM.
                Ok(())
            };
            match unmounted {
                Ok(()) => self.containers().set_mounted(id, false)?,
                Err(err) => {
                    tracing::warn!(container = id, %err, "unmount failed during remove");
                }
            }
        }

        if record.is_sandbox && record.vm_isolated {
            match System::open(
                self.api().clone(),
                &record::vm_id(id),
                self.system_options(),
            )
            .await
            {
                Ok(vm) => {
                    let _ = vm.terminate().await;
                    let _ = vm.close().await;
                }
                Err(err) if err.is_already_stopped() => {}
                Err(err) => {
                    tracing::warn!(container = id, %err, "failed to reach the utility vm");
                }
            }
        }

        self.containers().remove(id)?;
        tracing::info!(container = id, "removed container");
        Ok(())
    }

    pub async fn pause(&self, id: &str) -> HcsliteResult<()> {
        let ctx = || OpContext::new("container::pause").container(id);
        let _record = self.containers().load_record(id).map_err(|e| e.in_op(ctx()))?;
        let system = System::open(self.api().clone(), id, self.system_options())
            .await
            .map_err(|e| e.in_op(ctx()))?;
        let paused = system.pause().await;
        let _ = system.close().await;
        paused.map_err(|e| e.in_op(ctx()))
    }

    pub async fn resume(&self, id: &str) -> HcsliteResult<()> {
        let ctx = || OpContext::new("container::resume").container(id);
        let _record = self.containers().load_record(id).map_err(|e| e.in_op(ctx()))?;
        let system = System::open(self.api().clone(), id, self.system_options())
            .await
            .map_err(|e| e.in_op(ctx()))?;
        let resumed = system.resume().await;
        let _ = system.close().await;
        resumed.map_err(|e| e.in_op(ctx()))
    }

    /// Derived status: a container with no shim is stopped; otherwise the
    /// platform's state string decides.
    pub async fn status(&self, id: &str) -> HcsliteResult<(ContainerStatus, u32)> {
        let shim_pid = self.containers().shim_pid(id)?;
        if shim_pid == 0 || !is_process_alive(shim_pid) {
            return Ok((ContainerStatus::Stopped, 0));
        }

        match System::open(self.api().clone(), id, self.system_options()).await {
            Ok(system) => {
                let props = system.properties(&PropertyQuery::default()).await;
                let _ = system.close().await;
                match props {
                    Ok(props) => Ok((
                        ContainerStatus::from_platform_state(&props.state),
                        shim_pid,
                    )),
                    Err(_) => Ok((ContainerStatus::Unknown, shim_pid)),
                }
            }
            Err(err) if err.is_already_stopped() => Ok((ContainerStatus::Stopped, shim_pid)),
            Err(_) => Ok((ContainerStatus::Unknown, shim_pid)),
        }
    }

    /// The platform-agnostic state document for one container.
    pub async fn state(&self, id: &str) -> HcsliteResult<ContainerState> {
        let record = self.containers().load_record(id)?;
        let (status, shim_pid) = self.status(id).await?;
        Ok(ContainerState::new(record, status, shim_pid))
    }

    /// Every container known to this host.
    pub async fn list(&self) -> HcsliteResult<Vec<ContainerState>> {
        let mut states = Vec::new();
        for id in self.containers().list_ids()? {
            match self.state(&id).await {
                Ok(state) => states.push(state),
                Err(err) => {
                    tracing::warn!(container = %id, %err, "skipping unreadable container")
                }
            }
        }
        Ok(states)
    }

    /// Produce an ext4 scratch VHD via a helper VM (or the cache).
    pub async fn create_scratch(
        &self,
        dest: &Path,
        size_gb: u64,
        cache_path: Option<&PathBuf>,
    ) -> HcsliteResult<()> {
        let mut helper = UvmOptions::new(GuestOs::Linux);
        helper.kird_path = Some(self.options().kird_path());
        helper.owner = Some("hcslite-scratch".into());
        uvm::create_scratch(
            self.api().clone(),
            self.disk().clone(),
            helper,
            self.system_options(),
            dest,
            size_gb,
            cache_path.map(PathBuf::as_path),
            None,
        )
        .await
    }
}
