use clap::{Args, ValueEnum};

use crate::cli::GlobalFlags;
use crate::formatter;

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum ListFormat {
    Table,
    Json,
}

#[derive(Args, Debug)]
pub struct ListArgs {
    /// Output format
    #[arg(long, value_enum, default_value = "table")]
    pub format: ListFormat,

    /// Only print container identifiers
    #[arg(short, long)]
    pub quiet: bool,
}

pub async fn execute(args: ListArgs, global: &GlobalFlags) -> anyhow::Result<i32> {
    let runtime = global.runtime()?;
    let states = runtime.list().await?;

    if args.quiet {
        for state in &states {
            println!("{}", state.id);
        }
        return Ok(0);
    }

    match args.format {
        ListFormat::Json => println!("{}", serde_json::to_string_pretty(&states)?),
        ListFormat::Table => println!("{}", formatter::state_table(&states)),
    }
    Ok(0)
}
