use clap::Args;

use crate::cli::GlobalFlags;

#[derive(Args, Debug)]
pub struct PauseArgs {
    /// Container identifier
    pub id: String,
}

pub async fn execute(args: PauseArgs, global: &GlobalFlags) -> anyhow::Result<i32> {
    let runtime = global.runtime()?;
    runtime.pause(&args.id).await?;
    Ok(0)
}
