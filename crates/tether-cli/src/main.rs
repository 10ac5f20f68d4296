//! # tether: attach client
//!
//! Runs commands as attachable containers and executes commands inside
//! running ones, managing the local terminal and forwarding signals for
//! the duration of the session.

#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used, clippy::panic))]

mod commands;
mod host;
mod logging;
mod output;

use clap::Parser;

use crate::commands::Cli;

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    logging::init(cli.log_json);

    let runtime = tokio::runtime::Runtime::new()?;
    let result = runtime.block_on(commands::execute(cli));
    // Standard input is read on a blocking thread that never returns.
    runtime.shutdown_background();

    let code = result?;
    if code != 0 {
        std::process::exit(code);
    }
    Ok(())
}
