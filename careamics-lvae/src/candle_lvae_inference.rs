use crate::candle_data_loader::*;
use crate::candle_inference::TrainConfig;
use crate::candle_loss_functions::{lvae_loss, LvaeLossParameters};
use crate::candle_model_traits::LadderVaeModuleT;

use candle_core::{DType, Tensor};
use candle_nn::{AdamW, Optimizer, ParamsAdamW, SGD};
use careamics_config::{LrSchedulerConfig, SupportedOptimizer, SupportedScheduler};
use indicatif::{ProgressBar, ProgressDrawTarget};
use log::{debug, info, warn};

/// Per-epoch training diagnostics
#[derive(Debug, Default, Clone)]
pub struct TrainTrace {
    pub loss: Vec<f32>,
    pub reconstruction_loss: Vec<f32>,
    pub kl_loss: Vec<f32>,
    /// minibatches whose loss was not finite
    pub skipped_batches: Vec<usize>,
    pub learning_rate: Vec<f64>,
}

impl TrainTrace {
    pub fn total_skipped(&self) -> usize {
        self.skipped_batches.iter().sum()
    }
}

enum LvaeOptimizer {
    AdamW(AdamW),
    Sgd(SGD),
}

impl LvaeOptimizer {
    fn new(
        name: SupportedOptimizer,
        vars: Vec<candle_core::Var>,
        train_config: &TrainConfig,
    ) -> candle_core::Result<Self> {
        match name {
            SupportedOptimizer::Adam | SupportedOptimizer::AdamW => {
                let params = ParamsAdamW {
                    lr: train_config.learning_rate,
                    weight_decay: train_config.weight_decay,
                    ..Default::default()
                };
                Ok(Self::AdamW(AdamW::new(vars, params)?))
            }
            SupportedOptimizer::Sgd => {
                if train_config.weight_decay > 0.0 {
                    warn!(
                        "SGD has no weight decay; ignoring weight_decay = {}",
                        train_config.weight_decay
                    );
                }
                Ok(Self::Sgd(SGD::new(vars, train_config.learning_rate)?))
            }
        }
    }

    fn backward_step(&mut self, loss: &Tensor) -> candle_core::Result<()> {
        match self {
            Self::AdamW(opt) => opt.backward_step(loss),
            Self::Sgd(opt) => opt.backward_step(loss),
        }
    }

    fn learning_rate(&self) -> f64 {
        match self {
            Self::AdamW(opt) => opt.learning_rate(),
            Self::Sgd(opt) => opt.learning_rate(),
        }
    }

    fn set_learning_rate(&mut self, lr: f64) {
        match self {
            Self::AdamW(opt) => opt.set_learning_rate(lr),
            Self::Sgd(opt) => opt.set_learning_rate(lr),
        }
    }
}

/// Learning-rate decay driven by the epoch count or the training loss
pub struct LrScheduler {
    config: LrSchedulerConfig,
    best: f64,
    bad_epochs: usize,
}

impl LrScheduler {
    pub fn new(config: &LrSchedulerConfig) -> Self {
        Self {
            config: config.clone(),
            best: f64::INFINITY,
            bad_epochs: 0,
        }
    }

    /// New learning rate after epoch `epoch` (0-based) ended with `metric`
    pub fn step(&mut self, epoch: usize, metric: f64, lr: f64) -> f64 {
        match self.config.name {
            SupportedScheduler::StepLr => {
                if (epoch + 1) % self.config.step_size.max(1) == 0 {
                    lr * self.config.factor
                } else {
                    lr
                }
            }
            SupportedScheduler::ReduceLrOnPlateau => {
                if !metric.is_finite() {
                    return lr;
                }
                if metric < self.best - 1e-4 * self.best.abs() {
                    self.best = metric;
                    self.bad_epochs = 0;
                    lr
                } else {
                    self.bad_epochs += 1;
                    if self.bad_epochs > self.config.patience {
                        self.bad_epochs = 0;
                        lr * self.config.factor
                    } else {
                        lr
                    }
                }
            }
        }
    }
}

pub struct LvaeTrainer<'a, M>
where
    M: LadderVaeModuleT,
{
    pub model: &'a M,
    pub variable_map: &'a candle_nn::VarMap,
}

impl<'a, M> LvaeTrainer<'a, M>
where
    M: LadderVaeModuleT,
{
    pub fn new(model: &'a M, variable_map: &'a candle_nn::VarMap) -> Self {
        Self {
            model,
            variable_map,
        }
    }

    /// Train the ladder VAE
    /// * `data` - data loader should have `minibatch_data`
    /// * `loss_params` - composite loss inputs; training resumes at its
    ///   `current_epoch`, which is advanced here
    /// * `optimizer` - which optimizer to step
    /// * `scheduler` - learning-rate schedule
    /// * `train_config` - training configuration
    ///
    /// Minibatches whose loss is not finite are skipped without an
    /// optimizer step and counted in the trace.
    pub fn train<DataL>(
        &mut self,
        data: &mut DataL,
        loss_params: &mut LvaeLossParameters,
        optimizer: SupportedOptimizer,
        scheduler: &LrSchedulerConfig,
        train_config: &TrainConfig,
    ) -> anyhow::Result<TrainTrace>
    where
        DataL: DataLoader,
    {
        let device = &train_config.device;
        let mut opt = LvaeOptimizer::new(optimizer, self.variable_map.all_vars(), train_config)?;
        let mut lr_scheduler = LrScheduler::new(scheduler);

        let pb = ProgressBar::new(train_config.num_epochs as u64);

        if !train_config.show_progress || train_config.verbose {
            pb.set_draw_target(ProgressDrawTarget::hidden());
        }

        let mut trace = TrainTrace::default();

        let first_epoch = loss_params.current_epoch;

        for epoch in first_epoch..(first_epoch + train_config.num_epochs) {
            loss_params.current_epoch = epoch;
            data.shuffle_minibatch(train_config.batch_size)?;

            let mut loss_tot = 0f32;
            let mut recon_tot = 0f32;
            let mut kl_tot = 0f32;
            let mut n_steps = 0usize;
            let mut n_skipped = 0usize;

            for b in 0..data.num_minibatch() {
                let mb = data.minibatch_data(b, device)?;
                let (recon, td_data) = self.model.forward_t(&mb.input, true)?;

                match lvae_loss((&recon, &td_data), &mb.target, loss_params)? {
                    Some(out) => {
                        opt.backward_step(&out.loss)?;
                        loss_tot += scalar(&out.loss)?;
                        recon_tot += scalar(&out.reconstruction_loss)?;
                        kl_tot += scalar(&out.kl_loss)?;
                        n_steps += 1;
                    }
                    None => {
                        debug!("[{}] skipping minibatch {}: non-finite loss", epoch + 1, b);
                        n_skipped += 1;
                    }
                }
            }

            let denom = n_steps as f32;
            let mean_loss = if n_steps > 0 { loss_tot / denom } else { f32::NAN };
            trace.loss.push(mean_loss);
            trace.reconstruction_loss.push(if n_steps > 0 { recon_tot / denom } else { f32::NAN });
            trace.kl_loss.push(if n_steps > 0 { kl_tot / denom } else { f32::NAN });
            trace.skipped_batches.push(n_skipped);
            trace.learning_rate.push(opt.learning_rate());

            if n_skipped > 0 {
                warn!(
                    "[{}] skipped {} of {} minibatches with a non-finite loss",
                    epoch + 1,
                    n_skipped,
                    data.num_minibatch()
                );
            }

            let lr = opt.learning_rate();
            let next_lr = lr_scheduler.step(epoch, mean_loss as f64, lr);
            if next_lr != lr {
                info!("[{}] learning rate: {} -> {}", epoch + 1, lr, next_lr);
                opt.set_learning_rate(next_lr);
            }

            pb.inc(1);

            if train_config.verbose {
                info!(
                    "[{}] loss: {}, reconstruction: {}, kl: {}",
                    epoch + 1,
                    mean_loss,
                    trace.reconstruction_loss.last().ok_or(anyhow::anyhow!("recon"))?,
                    trace.kl_loss.last().ok_or(anyhow::anyhow!("kl"))?
                );
            }
        }

        pb.finish_and_clear();
        Ok(trace)
    }
}

fn scalar(x: &Tensor) -> candle_core::Result<f32> {
    x.to_dtype(DType::F32)?.sum_all()?.to_scalar::<f32>()
}
