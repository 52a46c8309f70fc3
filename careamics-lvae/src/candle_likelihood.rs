use crate::candle_noise_model::MultiChannelNoiseModel;
use crate::candle_stable_dist::{clamp_min, StableLogVar, DEFAULT_VAR_EPS};
use crate::error::LvaeResult;
use candle_core::{Result, Tensor};
use careamics_config::{GaussianLikelihoodConfig, MultiChannelNmConfig, NmLikelihoodConfig};

/// Distribution parameters extracted from the decoder output
#[derive(Clone, Debug)]
pub struct LikelihoodAux {
    pub mean: Tensor,
    pub logvar: Option<Tensor>,
}

/// Reconstruction likelihood `p(target | decoder output)`
pub trait LikelihoodModule {
    /// Split the decoder output into a prediction and an optional
    /// log-variance (channel-wise halves when the variance is predicted)
    fn get_mean_lv(&self, x: &Tensor) -> Result<(Tensor, Option<Tensor>)>;

    /// Elementwise log-likelihood of `x` under the given parameters
    fn log_likelihood(&self, x: &Tensor, params: &LikelihoodAux) -> Result<Tensor>;

    fn distr_params(&self, x: &Tensor) -> Result<LikelihoodAux> {
        let (mean, logvar) = self.get_mean_lv(x)?;
        Ok(LikelihoodAux { mean, logvar })
    }

    /// * `input` - decoder output (B, C or 2C, ...)
    /// * `x` - target (B, C, ...)
    ///
    /// Returns the elementwise log-likelihood (B, C, ...) and the
    /// parameters it was evaluated under
    fn forward(&self, input: &Tensor, x: &Tensor) -> Result<(Tensor, LikelihoodAux)> {
        let params = self.distr_params(input)?;
        let ll = self.log_likelihood(x, &params)?;
        Ok((ll, params))
    }
}

/// Diagonal Gaussian likelihood
///
/// * predicted log-variance: the decoder emits `[mean, logvar]` along the
///   channel axis; the variance goes through [`StableLogVar`]
/// * fixed variance: normalized density with a known variance
/// * neither: the unnormalized `-0.5 (x - mean)^2`
#[derive(Clone, Debug)]
pub struct GaussianLikelihood {
    predict_logvar: bool,
    logvar_lowerbound: Option<f64>,
    fixed_variance: Option<f64>,
}

impl GaussianLikelihood {
    pub fn new(config: &GaussianLikelihoodConfig) -> Self {
        Self {
            predict_logvar: config.predict_logvar,
            logvar_lowerbound: config.logvar_lowerbound,
            fixed_variance: config.fixed_variance,
        }
    }

    pub fn predict_logvar(&self) -> bool {
        self.predict_logvar
    }
}

impl LikelihoodModule for GaussianLikelihood {
    fn get_mean_lv(&self, x: &Tensor) -> Result<(Tensor, Option<Tensor>)> {
        if !self.predict_logvar {
            return Ok((x.clone(), None));
        }

        let n_ch = x.dim(1)?;
        if n_ch % 2 != 0 {
            candle_core::bail!(
                "predicted log-variance needs an even number of channels, got {}",
                n_ch
            );
        }
        let mean = x.narrow(1, 0, n_ch / 2)?;
        let mut lv = x.narrow(1, n_ch / 2, n_ch / 2)?;
        if let Some(lb) = self.logvar_lowerbound {
            lv = clamp_min(&lv, lb)?;
        }
        Ok((mean, Some(lv)))
    }

    fn log_likelihood(&self, x: &Tensor, params: &LikelihoodAux) -> Result<Tensor> {
        let ln_2pi = (2.0 * std::f64::consts::PI).ln();
        let sq = x.sub(&params.mean)?.sqr()?;

        match (&params.logvar, self.fixed_variance) {
            (Some(lv), _) => {
                let lv = StableLogVar::new(lv.clone(), true, DEFAULT_VAR_EPS);
                let var = lv.get_var()?;
                ((sq.div(&var)? + lv.get()?)? + ln_2pi)? * (-0.5)
            }
            (None, Some(var)) => sq.affine(-0.5 / var, -0.5 * (var.ln() + ln_2pi)),
            (None, None) => sq * (-0.5),
        }
    }
}

/// Likelihood under per-channel Gaussian mixture noise models
///
/// Prediction and target are normalized; both are mapped back to raw
/// intensities with `data_mean`/`data_std` before the noise model is
/// evaluated.
#[derive(Clone, Debug)]
pub struct NoiseModelLikelihood {
    data_mean: Vec<f64>,
    data_std: Vec<f64>,
    noise_model: MultiChannelNoiseModel,
}

impl NoiseModelLikelihood {
    pub fn new(config: &NmLikelihoodConfig, noise_model: MultiChannelNoiseModel) -> Self {
        Self {
            data_mean: config.data_mean.clone(),
            data_std: config.data_std.clone(),
            noise_model,
        }
    }

    pub fn from_config(
        config: &NmLikelihoodConfig,
        noise_model: &MultiChannelNmConfig,
    ) -> LvaeResult<Self> {
        Ok(Self::new(
            config,
            MultiChannelNoiseModel::from_config(noise_model)?,
        ))
    }

    pub fn noise_model(&self) -> &MultiChannelNoiseModel {
        &self.noise_model
    }

    pub fn denormalize(&self, x: &Tensor) -> Result<Tensor> {
        let std = channel_values(&self.data_std, x)?;
        let mean = channel_values(&self.data_mean, x)?;
        x.broadcast_mul(&std)?.broadcast_add(&mean)
    }
}

/// Broadcastable (1, C, 1, ...) tensor from scalar or per-channel values
fn channel_values(values: &[f64], like: &Tensor) -> Result<Tensor> {
    let mut shape = vec![1usize; like.rank()];
    if values.len() > 1 {
        shape[1] = values.len();
    }
    Tensor::from_slice(values, shape, like.device())?.to_dtype(like.dtype())
}

impl LikelihoodModule for NoiseModelLikelihood {
    fn get_mean_lv(&self, x: &Tensor) -> Result<(Tensor, Option<Tensor>)> {
        Ok((x.clone(), None))
    }

    fn log_likelihood(&self, x: &Tensor, params: &LikelihoodAux) -> Result<Tensor> {
        let signal = self.denormalize(&params.mean)?;
        let obs = self.denormalize(x)?;
        self.noise_model.likelihood(&obs, &signal)?.log()
    }
}
