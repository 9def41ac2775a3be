use clap::Args;

use crate::cli::GlobalFlags;

#[derive(Args, Debug)]
pub struct ResumeArgs {
    /// Container identifier
    pub id: String,
}

pub async fn execute(args: ResumeArgs, global: &GlobalFlags) -> anyhow::Result<i32> {
    let runtime = global.runtime()?;
    runtime.resume(&args.id).await?;
    Ok(0)
}
