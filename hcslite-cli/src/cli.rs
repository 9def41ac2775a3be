//! Top-level argument structure and shared runtime construction.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use hcslite::{HcsliteRuntime, RuntimeOptions, SqliteStore};

use crate::commands;

#[derive(Parser, Debug)]
#[command(
    name = "runhcs",
    version,
    about = "Host-side runtime for containers and utility VMs over the Host Compute Service"
)]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalFlags,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(clap::Args, Debug)]
pub struct GlobalFlags {
    /// Root directory for persisted state, pipes and logs
    #[arg(long, global = true, env = "HCSLITE_DATA_DIR")]
    pub data_dir: Option<PathBuf>,

    /// Directory holding the Linux utility-VM kernel and initrd
    #[arg(long, global = true, env = "HCSLITE_KIRD_PATH")]
    pub kird_path: Option<PathBuf>,

    /// Cap on concurrently starting compute systems
    #[arg(long, global = true)]
    pub max_parallel_starts: Option<u32>,
}

impl GlobalFlags {
    pub fn runtime_options(&self) -> RuntimeOptions {
        let mut options = match &self.data_dir {
            Some(dir) => RuntimeOptions::with_data_dir(dir.clone()),
            None => RuntimeOptions::default(),
        };
        options.kird_path = self.kird_path.clone();
        options.max_parallel_starts = self.max_parallel_starts;
        options
    }

    /// Build the runtime against the host's real compute service.
    pub fn runtime(&self) -> anyhow::Result<HcsliteRuntime> {
        let options = self.runtime_options();
        let platform = hcslite::platform::connect()?;
        let store = Arc::new(SqliteStore::open(&options.store_path())?);
        Ok(HcsliteRuntime::new(
            options,
            platform.compute,
            platform.disk,
            platform.layers,
            store,
        ))
    }
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Create a container from the bundle in the current directory
    Create(commands::create::CreateArgs),
    /// Start a created container's init process
    Start(commands::start::StartArgs),
    /// Exec an additional process in a running container
    Exec(commands::exec::ExecArgs),
    /// Signal a container
    Kill(commands::kill::KillArgs),
    /// Remove a container record and tear down its resources
    Delete(commands::delete::DeleteArgs),
    /// Suspend a running container
    Pause(commands::pause::PauseArgs),
    /// Resume a paused container
    Resume(commands::resume::ResumeArgs),
    /// Emit a container's state JSON
    State(commands::state::StateArgs),
    /// Enumerate containers
    List(commands::list::ListArgs),
    /// Produce an ext4 scratch VHD via a helper VM
    #[command(name = "create-scratch")]
    CreateScratch(commands::create_scratch::CreateScratchArgs),
    /// Internal container shim; not to be invoked manually
    #[command(hide = true)]
    Shim(commands::shim::ShimArgs),
    /// Internal VM shim; not to be invoked manually
    #[command(hide = true)]
    Vmshim(commands::vmshim::VmshimArgs),
}
