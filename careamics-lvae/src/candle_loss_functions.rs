use crate::candle_likelihood::{GaussianLikelihood, LikelihoodModule, NoiseModelLikelihood};
use crate::candle_model_traits::TopDownLayerData;
use crate::candle_stable_dist::{compute_batch_mean, free_bits_kl, DEFAULT_FREE_BITS_EPS};
use crate::error::{invalid_arg, LvaeResult};
use candle_core::{DType, Result, Tensor};
use careamics_config::{
    AlgorithmConfig, KlAggregation, KlLossConfig, KlRescaling, SupportedLoss,
};

/// Free-bits floor used by the denoiSplit KL convention
pub const DENOISPLIT_FREE_BITS: f64 = 1.0;

/// Everything a composite loss needs besides the model outputs
pub struct LvaeLossParameters {
    pub loss_type: SupportedLoss,
    pub gaussian_likelihood: Option<GaussianLikelihood>,
    pub noise_model_likelihood: Option<NoiseModelLikelihood>,
    pub reconstruction_weight: f64,
    pub kl_weight: f64,
    pub musplit_weight: f64,
    pub denoisplit_weight: f64,
    pub kl_params: KlLossConfig,
    /// advanced by the training loop between epochs
    pub current_epoch: usize,
    pub non_stochastic: bool,
    /// (B) boolean mask (u8) over the samples kept for reconstruction
    pub mask: Option<Tensor>,
}

impl LvaeLossParameters {
    /// Build the likelihood modules (loading noise models) for a
    /// validated configuration
    pub fn from_config(config: &AlgorithmConfig) -> LvaeResult<Self> {
        let loss = config.loss_config();

        let gaussian_likelihood = config.gaussian_likelihood().map(GaussianLikelihood::new);

        let noise_model_likelihood = match (config.noise_model_likelihood(), config.noise_model()) {
            (Some(lik), Some(nm)) => Some(NoiseModelLikelihood::from_config(lik, nm)?),
            (Some(_), None) => invalid_arg!("noise model likelihood without a noise model"),
            _ => None,
        };

        Ok(Self {
            loss_type: config.loss(),
            gaussian_likelihood,
            noise_model_likelihood,
            reconstruction_weight: loss.reconstruction_weight,
            kl_weight: loss.kl_weight,
            musplit_weight: loss.musplit_weight,
            denoisplit_weight: loss.denoisplit_weight,
            kl_params: loss.kl_params.clone(),
            current_epoch: loss.current_epoch,
            non_stochastic: loss.non_stochastic,
            mask: None,
        })
    }

    /// Likelihood of the single-likelihood losses: Gaussian for muSplit,
    /// noise model otherwise
    pub fn likelihood(&self) -> Result<&dyn LikelihoodModule> {
        let lik: Option<&dyn LikelihoodModule> = match self.loss_type {
            SupportedLoss::Musplit => self
                .gaussian_likelihood
                .as_ref()
                .map(|l| l as &dyn LikelihoodModule),
            SupportedLoss::Denoisplit | SupportedLoss::DenoisplitMusplit => self
                .noise_model_likelihood
                .as_ref()
                .map(|l| l as &dyn LikelihoodModule),
        };
        match lik {
            Some(l) => Ok(l),
            None => candle_core::bail!("no likelihood configured for loss `{}`", self.loss_type),
        }
    }

    /// Likelihood that splits the decoder output for prediction: the
    /// Gaussian one whenever configured (it knows about `predict_logvar`),
    /// the noise model otherwise
    pub fn prediction_likelihood(&self) -> Result<&dyn LikelihoodModule> {
        if let Some(l) = self.gaussian_likelihood.as_ref() {
            return Ok(l);
        }
        match self.noise_model_likelihood.as_ref() {
            Some(l) => Ok(l),
            None => candle_core::bail!("no likelihood configured for prediction"),
        }
    }

    /// KL weight at the current epoch
    pub fn annealed_kl_weight(&self) -> f64 {
        get_kl_weight(
            self.kl_params.annealing,
            self.kl_params.start,
            self.kl_params.annealtime,
            self.kl_weight,
            self.current_epoch,
        )
    }
}

/// Diagnostics of one loss evaluation
pub struct LossOutput {
    /// differentiable total
    pub loss: Tensor,
    pub reconstruction_loss: Tensor,
    pub kl_loss: Tensor,
}

pub struct ReconstructionLoss {
    /// sum of kept per-sample losses over the batch size
    pub loss: Tensor,
    /// same reduction restricted to channel `i` (`ch{i+1}_loss`)
    pub channel_losses: Vec<Tensor>,
}

/// Linear KL warm-up
///
/// 0 before `start`, `kl_weight` after `start + annealtime`, linear in
/// between. Without annealing the configured weight is returned as is.
pub fn get_kl_weight(
    annealing: bool,
    start: i64,
    annealtime: usize,
    kl_weight: f64,
    current_epoch: usize,
) -> f64 {
    if !annealing {
        return kl_weight;
    }
    let progress = (current_epoch as f64 - start as f64) / annealtime.max(1) as f64;
    kl_weight * progress.clamp(0.0, 1.0)
}

/// Per-sample negative log-likelihood, aggregated over the kept samples
///
/// * `reconstruction` - decoder output (B x C x ...) or (B x 2C x ...)
/// * `target` - (B x C x ...)
/// * `mask` - (B) u8, keep where non-zero; all kept if `None`
///
/// The kept losses are summed and divided by the full batch size, so a
/// sparser mask lowers the loss.
pub fn get_reconstruction_loss(
    reconstruction: &Tensor,
    target: &Tensor,
    likelihood: &dyn LikelihoodModule,
    mask: Option<&Tensor>,
) -> Result<ReconstructionLoss> {
    let (ll, _) = likelihood.forward(reconstruction, target)?;
    let nll = ll.neg()?;

    let loss_b = compute_batch_mean(&nll)?;
    let channel_b = if nll.dim(1)? > 1 {
        (0..target.dim(1)?)
            .map(|c| compute_batch_mean(&nll.narrow(1, c, 1)?))
            .collect::<Result<Vec<_>>>()?
    } else {
        vec![loss_b.clone()]
    };

    let batch_size = reconstruction.dim(0)? as f64;

    let reduce = |v: &Tensor| -> Result<Tensor> {
        let kept = match mask {
            Some(m) => {
                if m.dims() != v.dims() {
                    candle_core::bail!(
                        "splitting mask {:?} does not match the per-sample loss {:?}",
                        m.dims(),
                        v.dims()
                    );
                }
                m.where_cond(v, &v.zeros_like()?)?
            }
            None => v.clone(),
        };
        kept.sum_all()? / batch_size
    };

    Ok(ReconstructionLoss {
        loss: reduce(&loss_b)?,
        channel_losses: channel_b.iter().map(&reduce).collect::<Result<Vec<_>>>()?,
    })
}

/// Weighted sum of a noise-model and a Gaussian reconstruction loss, each
/// a plain mean over all elements
///
/// The noise model only sees the mean half of the prediction when the
/// log-variance is predicted.
pub fn reconstruction_loss_musplit_denoisplit(
    predictions: &Tensor,
    targets: &Tensor,
    nm_likelihood: &NoiseModelLikelihood,
    gaussian_likelihood: &GaussianLikelihood,
    nm_weight: f64,
    gaussian_weight: f64,
) -> Result<Tensor> {
    let target_ch = targets.dim(1)?;
    let out_mean = if predictions.dim(1)? == 2 * target_ch {
        predictions.narrow(1, 0, target_ch)?
    } else {
        predictions.clone()
    };

    let nm = nm_likelihood.forward(&out_mean, targets)?.0.neg()?.mean_all()?;
    let gm = gaussian_likelihood
        .forward(predictions, targets)?
        .0
        .neg()?
        .mean_all()?;

    (nm * nm_weight)? + (gm * gaussian_weight)?
}

/// KL over the hierarchy
///
/// * `kl_layers` - per-level KL, each (B)
/// * `latent_sizes` - per-sample latent element count of each level
/// * `img_shape` - spatial shape of the input image
/// * `rescaling` - per-level division by the latent size, or a division
///   of the aggregate by the image size
/// * `aggregation` - sum or mean over levels
/// * `free_bits` - per-element floor (see [`free_bits_kl`])
pub fn kl_divergence_loss(
    kl_layers: &[Tensor],
    latent_sizes: &[usize],
    img_shape: &[usize],
    rescaling: KlRescaling,
    aggregation: KlAggregation,
    free_bits: f64,
) -> Result<Tensor> {
    if kl_layers.is_empty() || kl_layers.len() != latent_sizes.len() {
        candle_core::bail!(
            "{} KL terms for {} latent levels",
            kl_layers.len(),
            latent_sizes.len()
        );
    }

    let mut kl = Tensor::stack(kl_layers, 1)?;

    if rescaling == KlRescaling::LatentDim {
        let inv: Vec<f64> = latent_sizes.iter().map(|&n| 1.0 / n as f64).collect();
        let inv = Tensor::from_vec(inv, (1, latent_sizes.len()), kl.device())?
            .to_dtype(kl.dtype())?;
        kl = kl.broadcast_mul(&inv)?;
    }

    let per_layer = free_bits_kl(&kl, free_bits, false, DEFAULT_FREE_BITS_EPS)?;

    let agg = match aggregation {
        KlAggregation::Sum => per_layer.sum_all()?,
        KlAggregation::Mean => per_layer.mean_all()?,
    };

    match rescaling {
        KlRescaling::ImageDim => agg / img_shape.iter().product::<usize>() as f64,
        KlRescaling::LatentDim => Ok(agg),
    }
}

/// KL under the loss configuration's own rescaling/aggregation/free bits
pub fn get_kl_divergence_loss(
    td_data: &TopDownLayerData,
    kl_params: &KlLossConfig,
    img_shape: &[usize],
) -> Result<Tensor> {
    kl_divergence_loss(
        &td_data.kl_for(kl_params.kl_type)?,
        &td_data.latent_sizes(),
        img_shape,
        kl_params.rescaling,
        kl_params.aggregation,
        kl_params.free_bits_coeff,
    )
}

/// muSplit convention: every level normalized by its latent size, no
/// free bits, mean over levels
pub fn get_kl_divergence_loss_usplit(
    td_data: &TopDownLayerData,
    kl_params: &KlLossConfig,
) -> Result<Tensor> {
    kl_divergence_loss(
        &td_data.kl_for(kl_params.kl_type)?,
        &td_data.latent_sizes(),
        &[],
        KlRescaling::LatentDim,
        KlAggregation::Mean,
        0.0,
    )
}

/// denoiSplit convention: raw KL with a free-bits floor of 1, summed over
/// levels and divided by the input image size
///
/// Coarser levels contribute more; summing makes the term grow with the
/// number of levels.
pub fn get_kl_divergence_loss_denoisplit(
    td_data: &TopDownLayerData,
    kl_params: &KlLossConfig,
    img_shape: &[usize],
) -> Result<Tensor> {
    kl_divergence_loss(
        &td_data.kl_for(kl_params.kl_type)?,
        &td_data.latent_sizes(),
        img_shape,
        KlRescaling::ImageDim,
        KlAggregation::Sum,
        DENOISPLIT_FREE_BITS,
    )
}

fn scalar_value(x: &Tensor) -> Result<f64> {
    x.to_dtype(DType::F64)?.sum_all()?.to_scalar::<f64>()
}

/// NaN reconstruction terms become 0 instead of failing the step
fn zero_if_nan(x: Tensor) -> Result<Tensor> {
    if scalar_value(&x)?.is_nan() {
        x.zeros_like()
    } else {
        Ok(x)
    }
}

fn zero_scalar(like: &Tensor) -> Result<Tensor> {
    Tensor::zeros((), like.dtype(), like.device())
}

fn finish(recons_loss: Tensor, kl_loss: Tensor) -> Result<Option<LossOutput>> {
    let recons_loss = recons_loss.reshape(())?;
    let kl_loss = kl_loss.reshape(())?;
    let loss = (&recons_loss + &kl_loss)?;

    if !scalar_value(&loss)?.is_finite() {
        return Ok(None);
    }

    Ok(Some(LossOutput {
        loss,
        reconstruction_loss: recons_loss.detach(),
        kl_loss: kl_loss.detach(),
    }))
}

fn spatial_shape(targets: &Tensor) -> &[usize] {
    &targets.dims()[2..]
}

/// muSplit: Gaussian reconstruction + annealed latent-normalized KL
///
/// Returns `None` when the total is not finite; the step should be
/// skipped.
pub fn musplit_loss(
    model_outputs: (&Tensor, &TopDownLayerData),
    targets: &Tensor,
    params: &LvaeLossParameters,
) -> Result<Option<LossOutput>> {
    let (predictions, td_data) = model_outputs;

    let recons = get_reconstruction_loss(
        predictions,
        targets,
        params.likelihood()?,
        params.mask.as_ref(),
    )?;
    let recons_loss = zero_if_nan((recons.loss * params.reconstruction_weight)?)?;

    let kl_loss = if params.non_stochastic {
        zero_scalar(predictions)?
    } else {
        (get_kl_divergence_loss_usplit(td_data, &params.kl_params)?
            * params.annealed_kl_weight())?
    };

    finish(recons_loss, kl_loss)
}

/// denoiSplit: noise-model reconstruction + annealed image-normalized KL
pub fn denoisplit_loss(
    model_outputs: (&Tensor, &TopDownLayerData),
    targets: &Tensor,
    params: &LvaeLossParameters,
) -> Result<Option<LossOutput>> {
    let (predictions, td_data) = model_outputs;

    let recons = get_reconstruction_loss(
        predictions,
        targets,
        params.likelihood()?,
        params.mask.as_ref(),
    )?;
    let recons_loss = zero_if_nan((recons.loss * params.reconstruction_weight)?)?;

    let kl_loss = if params.non_stochastic {
        zero_scalar(predictions)?
    } else {
        let kl = get_kl_divergence_loss_denoisplit(
            td_data,
            &params.kl_params,
            spatial_shape(targets),
        )?;
        (kl * params.annealed_kl_weight())?
    };

    finish(recons_loss, kl_loss)
}

/// Combined objective: both reconstruction terms and both KL conventions,
/// mixed by `denoisplit_weight` and `musplit_weight`
///
/// The mixed KL is multiplied by the configured `kl_weight` once more and
/// is not annealed.
pub fn denoisplit_musplit_loss(
    model_outputs: (&Tensor, &TopDownLayerData),
    targets: &Tensor,
    params: &LvaeLossParameters,
) -> Result<Option<LossOutput>> {
    let (predictions, td_data) = model_outputs;

    let (Some(nm_likelihood), Some(gaussian_likelihood)) = (
        params.noise_model_likelihood.as_ref(),
        params.gaussian_likelihood.as_ref(),
    ) else {
        candle_core::bail!("`denoisplit_musplit` needs both a noise model and a Gaussian likelihood");
    };

    let recons_loss = zero_if_nan(reconstruction_loss_musplit_denoisplit(
        predictions,
        targets,
        nm_likelihood,
        gaussian_likelihood,
        params.denoisplit_weight,
        params.musplit_weight,
    )?)?;

    let kl_loss = if params.non_stochastic {
        zero_scalar(predictions)?
    } else {
        let denoisplit_kl = get_kl_divergence_loss_denoisplit(
            td_data,
            &params.kl_params,
            spatial_shape(targets),
        )?;
        let musplit_kl = get_kl_divergence_loss_usplit(td_data, &params.kl_params)?;
        let mixed = ((denoisplit_kl * params.denoisplit_weight)?
            + (musplit_kl * params.musplit_weight)?)?;
        (mixed * params.kl_weight)?
    };

    finish(recons_loss, kl_loss)
}

/// Composite loss selected by `params.loss_type`
pub fn lvae_loss(
    model_outputs: (&Tensor, &TopDownLayerData),
    targets: &Tensor,
    params: &LvaeLossParameters,
) -> Result<Option<LossOutput>> {
    match params.loss_type {
        SupportedLoss::Musplit => musplit_loss(model_outputs, targets, params),
        SupportedLoss::Denoisplit => denoisplit_loss(model_outputs, targets, params),
        SupportedLoss::DenoisplitMusplit => {
            denoisplit_musplit_loss(model_outputs, targets, params)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use candle_core::Device;
    use careamics_config::GaussianLikelihoodConfig;

    fn mse_likelihood() -> GaussianLikelihood {
        GaussianLikelihood::new(&GaussianLikelihoodConfig::default())
    }

    #[test]
    fn kl_annealing_ramp() {
        assert_eq!(get_kl_weight(false, 5, 10, 2.0, 0), 2.0);
        assert_eq!(get_kl_weight(true, 5, 10, 2.0, 0), 0.0);
        assert_eq!(get_kl_weight(true, 5, 10, 2.0, 5), 0.0);
        assert_abs_diff_eq!(get_kl_weight(true, 5, 10, 2.0, 10), 1.0);
        assert_eq!(get_kl_weight(true, 5, 10, 2.0, 15), 2.0);
        assert_eq!(get_kl_weight(true, 5, 10, 2.0, 100), 2.0);
    }

    #[test]
    fn per_channel_losses() -> Result<()> {
        let dev = Device::Cpu;
        // channel 0 off by 1, channel 1 exact
        let pred = Tensor::ones((2, 2, 2, 2), DType::F64, &dev)?;
        let target = Tensor::cat(
            &[
                Tensor::zeros((2, 1, 2, 2), DType::F64, &dev)?,
                Tensor::ones((2, 1, 2, 2), DType::F64, &dev)?,
            ],
            1,
        )?;
        let rec = get_reconstruction_loss(&pred, &target, &mse_likelihood(), None)?;
        assert_eq!(rec.channel_losses.len(), 2);
        assert_abs_diff_eq!(scalar_value(&rec.channel_losses[0])?, 0.5);
        assert_abs_diff_eq!(scalar_value(&rec.channel_losses[1])?, 0.0);
        assert_abs_diff_eq!(scalar_value(&rec.loss)?, 0.25);
        Ok(())
    }

    #[test]
    fn mask_scales_by_full_batch() -> Result<()> {
        let dev = Device::Cpu;
        let pred = Tensor::ones((4, 1, 2, 2), DType::F64, &dev)?;
        let target = Tensor::zeros((4, 1, 2, 2), DType::F64, &dev)?;
        let lik = mse_likelihood();

        let all = Tensor::ones(4, DType::U8, &dev)?;
        let none = Tensor::zeros(4, DType::U8, &dev)?;
        let half = Tensor::new(&[1u8, 0, 1, 0], &dev)?;

        let full = scalar_value(&get_reconstruction_loss(&pred, &target, &lik, None)?.loss)?;
        let kept = scalar_value(&get_reconstruction_loss(&pred, &target, &lik, Some(&all))?.loss)?;
        assert_abs_diff_eq!(full, kept);
        assert_abs_diff_eq!(full, 0.5);

        let rec = get_reconstruction_loss(&pred, &target, &lik, Some(&none))?;
        assert_eq!(scalar_value(&rec.loss)?, 0.0);
        for ch in rec.channel_losses.iter() {
            assert_eq!(scalar_value(ch)?, 0.0);
        }

        let rec = get_reconstruction_loss(&pred, &target, &lik, Some(&half))?;
        assert_abs_diff_eq!(scalar_value(&rec.loss)?, 0.25);
        Ok(())
    }

    #[test]
    fn mask_shape_is_checked() -> Result<()> {
        let dev = Device::Cpu;
        let pred = Tensor::ones((4, 1, 2, 2), DType::F64, &dev)?;
        let mask = Tensor::ones(3, DType::U8, &dev)?;
        assert!(get_reconstruction_loss(&pred, &pred, &mse_likelihood(), Some(&mask)).is_err());
        Ok(())
    }

    #[test]
    fn kl_needs_matching_levels() -> Result<()> {
        let kl = vec![Tensor::ones(2, DType::F32, &Device::Cpu)?];
        let res = kl_divergence_loss(
            &kl,
            &[1, 2],
            &[4, 4],
            KlRescaling::LatentDim,
            KlAggregation::Mean,
            0.0,
        );
        assert!(res.is_err());
        Ok(())
    }
}
