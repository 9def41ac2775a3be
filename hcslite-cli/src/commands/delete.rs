use clap::Args;

use crate::cli::GlobalFlags;

#[derive(Args, Debug)]
pub struct DeleteArgs {
    /// Container identifier
    pub id: String,

    /// Remove even if running (terminates first) and ignore missing state
    #[arg(short, long)]
    pub force: bool,
}

pub async fn execute(args: DeleteArgs, global: &GlobalFlags) -> anyhow::Result<i32> {
    let runtime = global.runtime()?;
    runtime.remove(&args.id, args.force).await?;
    Ok(0)
}
