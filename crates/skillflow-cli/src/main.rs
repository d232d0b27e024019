use anyhow::Result;
use clap::Parser;
use skillflow_cli::{init_tracing, run_cli, Cli};

fn main() -> Result<()> {
    init_tracing()?;
    run_cli(Cli::parse())
}
