//! runhcs - CLI entry point.
//!
//! Every subcommand returns a process exit code: 0 on success, the init
//! process's code when a shim propagates it, 1 with one line on stderr for
//! anything else.

mod cli;
mod commands;
mod formatter;

use clap::Parser;
use cli::{Cli, Command};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Shim subcommands log to files; their stderr carries the parent
    // handshake.
    match &cli.command {
        Command::Shim(_) | Command::Vmshim(_) => {}
        _ => hcslite::logging::init_stderr_logging(),
    }

    let code = match run(cli).await {
        Ok(code) => code,
        Err(err) => {
            eprintln!("runhcs: {:#}", err);
            1
        }
    };
    std::process::exit(code);
}

async fn run(cli: Cli) -> anyhow::Result<i32> {
    match cli.command {
        Command::Create(args) => commands::create::execute(args, &cli.global).await,
        Command::Start(args) => commands::start::execute(args, &cli.global).await,
        Command::Exec(args) => commands::exec::execute(args, &cli.global).await,
        Command::Kill(args) => commands::kill::execute(args, &cli.global).await,
        Command::Delete(args) => commands::delete::execute(args, &cli.global).await,
        Command::Pause(args) => commands::pause::execute(args, &cli.global).await,
        Command::Resume(args) => commands::resume::execute(args, &cli.global).await,
        Command::State(args) => commands::state::execute(args, &cli.global).await,
        Command::List(args) => commands::list::execute(args, &cli.global).await,
        Command::CreateScratch(args) => commands::create_scratch::execute(args, &cli.global).await,
        Command::Shim(args) => commands::shim::execute(args, &cli.global).await,
        Command::Vmshim(args) => commands::vmshim::execute(args, &cli.global).await,
    }
}
