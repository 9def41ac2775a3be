use clap::Args;

use crate::cli::GlobalFlags;

#[derive(Args, Debug)]
pub struct StartArgs {
    /// Container identifier
    pub id: String,
}

pub async fn execute(args: StartArgs, global: &GlobalFlags) -> anyhow::Result<i32> {
    let runtime = global.runtime()?;
    runtime.start(&args.id).await?;
    Ok(0)
}
