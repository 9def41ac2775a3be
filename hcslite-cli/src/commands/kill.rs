use clap::Args;

use crate::cli::GlobalFlags;

#[derive(Args, Debug)]
pub struct KillArgs {
    /// Container identifier
    pub id: String,

    /// Signal number or name (informational; the platform carries
    /// termination only)
    pub signal: Option<String>,
}

pub async fn execute(args: KillArgs, global: &GlobalFlags) -> anyhow::Result<i32> {
    let runtime = global.runtime()?;
    let signal = args.signal.as_deref().and_then(parse_signal);
    runtime.kill(&args.id, signal).await?;
    Ok(0)
}

fn parse_signal(raw: &str) -> Option<i32> {
    if let Ok(number) = raw.parse::<i32>() {
        return Some(number);
    }
    match raw.trim_start_matches("SIG").to_ascii_uppercase().as_str() {
        "TERM" => Some(15),
        "KILL" => Some(9),
        "INT" => Some(2),
        _ => None,
    }
}
