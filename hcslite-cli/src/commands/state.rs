use clap::Args;

use crate::cli::GlobalFlags;

#[derive(Args, Debug)]
pub struct StateArgs {
    /// Container identifier
    pub id: String,
}

pub async fn execute(args: StateArgs, global: &GlobalFlags) -> anyhow::Result<i32> {
    let runtime = global.runtime()?;
    let state = runtime.state(&args.id).await?;
    println!("{}", serde_json::to_string_pretty(&state)?);
    Ok(0)
}
