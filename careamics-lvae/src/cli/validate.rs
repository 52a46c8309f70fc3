use careamics_config::AlgorithmConfig;
use clap::Args;
use log::info;
use std::path::PathBuf;

#[derive(Args, Debug)]
pub struct ValidateArgs {
    /// Algorithm configuration (JSON)
    #[arg(short, long)]
    pub config: PathBuf,

    #[arg(short, long)]
    pub verbose: bool,
}

/// Print the configuration with every default filled in
pub fn run(args: &ValidateArgs) -> anyhow::Result<()> {
    crate::logging::init_logger(args.verbose);

    let config = AlgorithmConfig::from_json_file(&args.config)?;
    info!(
        "{:?}: algorithm `{}`, loss `{}`",
        args.config,
        config.algorithm(),
        config.loss()
    );
    println!("{}", config.to_json_string()?);
    Ok(())
}
