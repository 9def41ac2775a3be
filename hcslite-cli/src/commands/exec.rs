use std::path::PathBuf;

use clap::Args;

use crate::cli::GlobalFlags;

#[derive(Args, Debug)]
pub struct ExecArgs {
    /// Container identifier
    pub id: String,

    /// Path to a process document (OCI process JSON)
    #[arg(short, long)]
    pub process: PathBuf,

    /// Pipe name the exec'd process's stdin is dialed from
    #[arg(long)]
    pub stdin: Option<String>,

    /// Pipe name the exec'd process's stdout is dialed to
    #[arg(long)]
    pub stdout: Option<String>,

    /// Pipe name the exec'd process's stderr is dialed to
    #[arg(long)]
    pub stderr: Option<String>,

    /// Log file for the exec shim
    #[arg(long)]
    pub shim_log: Option<PathBuf>,
}

pub async fn execute(args: ExecArgs, global: &GlobalFlags) -> anyhow::Result<i32> {
    let runtime = global.runtime()?;
    let exit_code = runtime
        .exec(
            &args.id,
            &args.process,
            args.stdin.as_deref(),
            args.stdout.as_deref(),
            args.stderr.as_deref(),
            args.shim_log.as_deref(),
        )
        .await?;
    Ok(exit_code)
}
