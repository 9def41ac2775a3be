use std::path::{Path, PathBuf};

use clap::Args;
use hcslite::RuntimeOptions;
use hcslite::UvmOptions;
use hcslite::shim::{spawn, vm};
use tokio::io::AsyncReadExt;

use crate::cli::GlobalFlags;

#[derive(Args, Debug)]
pub struct VmshimArgs {
    /// Sandbox whose utility VM this shim owns
    #[arg(long)]
    pub id: String,

    /// Log file (defaults to the runtime log directory)
    #[arg(long)]
    pub log: Option<PathBuf>,
}

pub async fn execute(args: VmshimArgs, global: &GlobalFlags) -> anyhow::Result<i32> {
    let runtime = match global.runtime() {
        Ok(runtime) => runtime,
        Err(err) => spawn::fail_parent(&hcslite::HcsliteError::Internal(format!("{:#}", err))),
    };

    let _log_guard = init_shim_logging(runtime.options(), args.log.as_deref(), "runhcs-vmshim.log");
    spawn::watch_parent();

    // The parent writes the VM options document on stdin and closes it.
    let mut raw_options = String::new();
    if let Err(err) = tokio::io::stdin().read_to_string(&mut raw_options).await {
        spawn::fail_parent(&hcslite::HcsliteError::Io(format!(
            "reading options from stdin: {}",
            err
        )));
    }
    let options: UvmOptions = match serde_json::from_str(&raw_options) {
        Ok(options) => options,
        Err(err) => spawn::fail_parent(&hcslite::HcsliteError::Json(format!(
            "parsing vm options: {}",
            err
        ))),
    };

    match vm::run(
        runtime.shim_env(),
        args.id,
        options,
        Box::new(spawn::signal_parent_ready),
    )
    .await
    {
        Ok(exit_code) => Ok(exit_code),
        Err(err) => spawn::fail_parent(&err),
    }
}

/// File logging for shim processes; stderr stays reserved for the parent
/// handshake.
pub fn init_shim_logging(
    options: &RuntimeOptions,
    log: Option<&Path>,
    default_name: &str,
) -> Option<hcslite::logging::WorkerGuard> {
    let (dir, file) = match log {
        Some(path) => (
            path.parent().unwrap_or(Path::new(".")).to_path_buf(),
            path.file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_else(|| default_name.to_string()),
        ),
        None => (options.log_dir(), default_name.to_string()),
    };
    hcslite::logging::init_file_logging(&dir, &file).ok()
}
