// SPDX-License-Identifier: Apache-2.0
// Copyright Authors of gotel

use args::Commands;
use clap::Parser;
use probes::execute_probes;
use trace::execute_trace;

mod args;
mod probes;
mod trace;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();
    let cli = crate::args::Cli::parse();

    cli.command.execute().await
}

impl Commands {
    pub(crate) async fn execute(&self) -> Result<(), anyhow::Error> {
        match self {
            Commands::Trace(args) => execute_trace(args).await,
            Commands::Probes => execute_probes(),
        }
    }
}
