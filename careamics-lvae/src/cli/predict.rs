use crate::candle_loss_functions::LvaeLossParameters;
use crate::candle_lvae::model_factory;
use crate::candle_model_traits::LadderVaeModuleT;
use crate::candle_pad_crop::{crop_img_tensor, pad_img_tensor};
use crate::candle_prediction::{predict_mmse, PredictInput};
use crate::cli::{load_image_stack, ComputeDevice};

use candle_core::{DType, Tensor};
use candle_nn::{VarBuilder, VarMap};
use careamics_config::{AlgorithmConfig, ModelConfig};
use clap::Args;
use indicatif::{ProgressBar, ProgressDrawTarget};
use log::info;
use std::path::PathBuf;

#[derive(Args, Debug)]
pub struct PredictArgs {
    /// Algorithm configuration (JSON)
    #[arg(short, long)]
    pub config: PathBuf,

    /// Trained weights (`.safetensors`)
    #[arg(short, long)]
    pub weights: PathBuf,

    /// Images (N, C_in, Y, X) in `.npy`
    #[arg(short, long)]
    pub input: PathBuf,

    /// Predictions (N, C_out, Y, X) in `.npy`
    #[arg(short, long)]
    pub out: PathBuf,

    /// Predicted log-variance of the first sample, if the model has one
    #[arg(long)]
    pub logvar_out: Option<PathBuf>,

    /// Stochastic passes averaged per image
    #[arg(long, default_value_t = 1)]
    pub mmse_count: i64,

    #[arg(long, default_value_t = 8)]
    pub minibatch_size: usize,

    /// Candle device
    #[arg(long, value_enum, default_value = "cpu")]
    pub device: ComputeDevice,

    #[arg(short, long)]
    pub verbose: bool,
}

pub fn run(args: &PredictArgs) -> anyhow::Result<()> {
    crate::logging::init_logger(args.verbose);

    let config = AlgorithmConfig::from_json_file(&args.config)?;
    let dev = args.device.device()?;

    let ModelConfig::Lvae(model_config) = config.model() else {
        anyhow::bail!("only LVAE models can be restored from weights");
    };

    let mut parameters = VarMap::new();
    let param_builder = VarBuilder::from_varmap(&parameters, DType::F32, &dev);
    let loss_params = LvaeLossParameters::from_config(&config)?;
    let model = model_factory(config.model(), param_builder)?
        .with_non_stochastic(loss_params.non_stochastic);
    parameters.load(&args.weights)?;
    let likelihood = loss_params.prediction_likelihood()?;

    let images = load_image_stack(&args.input, &dev)?;
    let (n, _, ny, nx) = images.dims4()?;

    // spatial dims must survive the downsampling path
    let factor = model_config.total_downsampling();
    let padded = [ny.div_ceil(factor) * factor, nx.div_ceil(factor) * factor];
    if padded != [ny, nx] {
        info!("padding {:?} to {:?}", [ny, nx], padded);
    }

    let pb = ProgressBar::new(n as u64);
    if args.verbose {
        pb.set_draw_target(ProgressDrawTarget::hidden());
    }

    let batch_size = args.minibatch_size.max(1);
    let mut predictions = vec![];
    let mut log_vars = vec![];

    for lb in (0..n).step_by(batch_size) {
        let len = batch_size.min(n - lb);
        let x = pad_img_tensor(&images.narrow(0, lb, len)?, &padded)?;
        let out = predict_mmse(&model, likelihood, &PredictInput::<()>::Tensor(x), args.mmse_count)?;

        predictions.push(crop_img_tensor(out.prediction(), &[ny, nx])?);
        if let Some(lv) = out.log_var() {
            log_vars.push(crop_img_tensor(lv, &[ny, nx])?);
        }
        pb.inc(len as u64);
    }
    pb.finish_and_clear();

    let prediction = Tensor::cat(&predictions, 0)?;
    info!(
        "{} target channels, prediction {:?}",
        model.target_channels(),
        prediction.dims()
    );
    prediction.write_npy(&args.out)?;
    info!("Saved predictions to {:?}", args.out);

    match (&args.logvar_out, log_vars.is_empty()) {
        (Some(path), false) => {
            Tensor::cat(&log_vars, 0)?.write_npy(path)?;
            info!("Saved log-variance to {:?}", path);
        }
        (Some(_), true) => log::warn!("the model does not predict a log-variance"),
        _ => {}
    }
    Ok(())
}
