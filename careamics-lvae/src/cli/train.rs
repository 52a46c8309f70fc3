use crate::candle_data_loader::PatchData;
use crate::candle_inference::TrainConfig;
use crate::candle_loss_functions::LvaeLossParameters;
use crate::candle_lvae::model_factory;
use crate::candle_lvae_inference::LvaeTrainer;
use crate::cli::{load_image_stack, ComputeDevice};

use candle_core::DType;
use candle_nn::{VarBuilder, VarMap};
use careamics_config::AlgorithmConfig;
use clap::Args;
use log::info;
use std::path::PathBuf;

#[derive(Args, Debug)]
pub struct TrainArgs {
    /// Algorithm configuration (JSON)
    #[arg(short, long)]
    pub config: PathBuf,

    /// Input patches (N, C_in, Y, X) in `.npy`
    #[arg(short, long)]
    pub input: PathBuf,

    /// Target patches (N, C_out, Y, X) in `.npy`
    #[arg(short, long)]
    pub target: PathBuf,

    /// Trained weights (`.safetensors`)
    #[arg(short, long)]
    pub out: PathBuf,

    /// Per-epoch losses as JSON
    #[arg(long)]
    pub trace: Option<PathBuf>,

    #[arg(long, default_value_t = 100)]
    pub epochs: usize,

    #[arg(long, default_value_t = 32)]
    pub minibatch_size: usize,

    /// Overrides the optimizer learning rate of the configuration
    #[arg(long)]
    pub learning_rate: Option<f64>,

    /// Candle device
    #[arg(long, value_enum, default_value = "cpu")]
    pub device: ComputeDevice,

    #[arg(short, long)]
    pub verbose: bool,
}

pub fn run(args: &TrainArgs) -> anyhow::Result<()> {
    crate::logging::init_logger(args.verbose);

    let config = AlgorithmConfig::from_json_file(&args.config)?;
    let dev = args.device.device()?;

    let input = load_image_stack(&args.input, &dev)?;
    let target = load_image_stack(&args.target, &dev)?;
    let mut data = PatchData::new(input, target)?;

    let parameters = VarMap::new();
    let param_builder = VarBuilder::from_varmap(&parameters, DType::F32, &dev);

    let mut loss_params = LvaeLossParameters::from_config(&config)?;
    let model = model_factory(config.model(), param_builder)?
        .with_non_stochastic(loss_params.non_stochastic);

    let mut train_config =
        TrainConfig::from_optimizer(config.optimizer(), args.minibatch_size, args.epochs, dev);
    if let Some(lr) = args.learning_rate {
        train_config.learning_rate = lr;
    }
    train_config.verbose = args.verbose;

    info!(
        "Training `{}` for {} epochs on {:?}",
        config.loss(),
        args.epochs,
        data.input_shape()
    );

    let trace = LvaeTrainer::new(&model, &parameters).train(
        &mut data,
        &mut loss_params,
        config.optimizer().name,
        config.lr_scheduler(),
        &train_config,
    )?;

    if trace.total_skipped() > 0 {
        info!("{} minibatches skipped in total", trace.total_skipped());
    }

    parameters.save(&args.out)?;
    info!("Saved weights to {:?}", args.out);

    if let Some(path) = &args.trace {
        let json = serde_json::json!({
            "loss": trace.loss,
            "reconstruction_loss": trace.reconstruction_loss,
            "kl_loss": trace.kl_loss,
            "skipped_batches": trace.skipped_batches,
            "learning_rate": trace.learning_rate,
        });
        // non-finite epoch means become null
        std::fs::write(path, serde_json::to_string_pretty(&json)?)?;
        info!("Saved training trace to {:?}", path);
    }

    Ok(())
}
