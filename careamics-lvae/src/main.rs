use anyhow::Result;
use careamics_lvae::cli::{run, Cli};
use clap::Parser;

fn main() -> Result<()> {
    let cli = Cli::parse();
    run(&cli)
}
