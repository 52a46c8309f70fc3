pub mod predict;
pub mod train;
pub mod validate;

use candle_core::{DType, Device, Tensor};
use clap::{Parser, Subcommand, ValueEnum};
use log::info;
use std::path::Path;

pub use predict::PredictArgs;
pub use train::TrainArgs;
pub use validate::ValidateArgs;

#[derive(Parser)]
#[command(name = "careamics")]
#[command(version, about = "Ladder VAE training and prediction (muSplit, denoiSplit)")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Load and validate an algorithm configuration
    Validate(ValidateArgs),
    /// Train a ladder VAE on `.npy` patches
    Train(TrainArgs),
    /// Predict with trained weights
    Predict(PredictArgs),
}

#[derive(ValueEnum, Clone, Debug, PartialEq)]
#[clap(rename_all = "lowercase")]
pub enum ComputeDevice {
    Cpu,
    Cuda,
    Metal,
}

impl ComputeDevice {
    pub fn device(&self) -> anyhow::Result<Device> {
        Ok(match self {
            ComputeDevice::Metal => Device::new_metal(0)?,
            ComputeDevice::Cuda => Device::new_cuda(0)?,
            ComputeDevice::Cpu => Device::Cpu,
        })
    }
}

/// Read an `(N, C, Y, X)` array as f32 on `device`
pub fn load_image_stack(path: &Path, device: &Device) -> anyhow::Result<Tensor> {
    let x = Tensor::read_npy(path)?;
    if x.rank() != 4 {
        anyhow::bail!("{:?}: expected (N, C, Y, X), got {:?}", path, x.dims());
    }
    // convert on the host; not every backend casts f64
    let x = if x.dtype() != DType::F32 {
        x.to_dtype(DType::F32)?
    } else {
        x
    };
    info!("{:?}: {:?}", path, x.dims());
    Ok(x.to_device(device)?)
}

pub fn run(cli: &Cli) -> anyhow::Result<()> {
    match &cli.command {
        Commands::Validate(args) => validate::run(args),
        Commands::Train(args) => train::run(args),
        Commands::Predict(args) => predict::run(args),
    }
}
