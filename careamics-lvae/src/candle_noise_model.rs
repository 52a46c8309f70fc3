//! Gaussian mixture noise models
//!
//! A noise model describes the distribution of a noisy observation given
//! the clean signal underneath it, `p(obs | signal)`, as a mixture of
//! `n_gaussian` normals. Every mixture parameter (mean, log-variance,
//! mixture logit) is a polynomial in the normalized signal
//! `(signal - min_signal) / (max_signal - min_signal)`.
//!
//! The polynomial coefficients are calibrated offline and stored in an
//! `.npz` archive; here they are a frozen lookup table. Gradients flow to
//! the signal (the network prediction), never to the coefficients.

use crate::candle_stable_dist::clamp_min;
use crate::error::{invalid_arg, LvaeResult};
use candle_core::{Result, Tensor};
use careamics_config::{GaussianMixtureNmConfig, MultiChannelNmConfig};
use log::{debug, info};
use std::path::Path;

pub const NPZ_WEIGHT: &str = "trained_weight";
pub const NPZ_MIN_SIGNAL: &str = "min_signal";
pub const NPZ_MAX_SIGNAL: &str = "max_signal";
pub const NPZ_MIN_SIGMA: &str = "min_sigma";

#[derive(Clone, Debug)]
pub struct GaussianMixtureNoiseModel {
    /// (3 * n_gaussian) x n_coeff: means, log-variances, logits
    weight: Vec<Vec<f64>>,
    n_gaussian: usize,
    min_signal: f64,
    max_signal: f64,
    min_sigma: f64,
    tol: f64,
}

/// Per-component mixture parameters, each the shape of the signal
pub struct MixtureParams {
    pub mu: Vec<Tensor>,
    pub sigma: Vec<Tensor>,
    pub alpha: Vec<Tensor>,
}

impl GaussianMixtureNoiseModel {
    pub fn new(
        weight: Vec<Vec<f64>>,
        min_signal: f64,
        max_signal: f64,
        min_sigma: f64,
        tol: f64,
    ) -> LvaeResult<Self> {
        if weight.is_empty() || weight.len() % 3 != 0 {
            invalid_arg!(
                "noise model weight needs 3 x n_gaussian rows, got {}",
                weight.len()
            );
        }
        let n_coeff = weight[0].len();
        if n_coeff < 2 || weight.iter().any(|row| row.len() != n_coeff) {
            invalid_arg!("noise model weight rows must share at least 2 coefficients");
        }
        if !(max_signal > min_signal) {
            invalid_arg!(
                "noise model signal range is empty: [{}, {}]",
                min_signal,
                max_signal
            );
        }
        let n_gaussian = weight.len() / 3;
        Ok(Self {
            weight,
            n_gaussian,
            min_signal,
            max_signal,
            min_sigma,
            tol,
        })
    }

    /// Build from a validated configuration, reading the artifact if a
    /// path is given. With an artifact the signal range and `min_sigma`
    /// come from the archive unless the configuration overrides `min_sigma`.
    pub fn from_config(config: &GaussianMixtureNmConfig) -> LvaeResult<Self> {
        if let Some(path) = &config.path {
            let mut nm = Self::load_npz(path, config.tol)?;
            if let Some(s) = config.min_sigma {
                nm.min_sigma = s;
            }
            return Ok(nm);
        }

        let Some(weight) = config.weight.clone() else {
            invalid_arg!("noise model needs either a path or inline weights");
        };

        Self::new(
            weight,
            config.min_signal,
            config.max_signal,
            config.min_sigma.unwrap_or(0.0),
            config.tol,
        )
    }

    pub fn load_npz<P: AsRef<Path>>(path: P, tol: f64) -> LvaeResult<Self> {
        let arrays = Tensor::read_npz(path.as_ref())?;

        let find = |key: &str| -> Option<&Tensor> {
            arrays.iter().find(|(k, _)| k == key).map(|(_, t)| t)
        };

        let Some(weight) = find(NPZ_WEIGHT) else {
            invalid_arg!(
                "{} has no `{}` array",
                path.as_ref().display(),
                NPZ_WEIGHT
            );
        };

        if weight.rank() != 2 {
            invalid_arg!(
                "`{}` must be a matrix, got shape {:?}",
                NPZ_WEIGHT,
                weight.dims()
            );
        }

        let weight = weight
            .to_dtype(candle_core::DType::F64)?
            .to_vec2::<f64>()?;

        let scalar = |key: &str, default: Option<f64>| -> LvaeResult<f64> {
            match (find(key), default) {
                (Some(t), _) => Ok(t
                    .to_dtype(candle_core::DType::F64)?
                    .flatten_all()?
                    .get(0)?
                    .to_scalar::<f64>()?),
                (None, Some(d)) => Ok(d),
                (None, None) => invalid_arg!("noise model archive has no `{}` array", key),
            }
        };

        let min_signal = scalar(NPZ_MIN_SIGNAL, None)?;
        let max_signal = scalar(NPZ_MAX_SIGNAL, None)?;
        let min_sigma = scalar(NPZ_MIN_SIGMA, Some(0.0))?;

        info!(
            "noise model {}: {} gaussians, {} coefficients, signal in [{}, {}]",
            path.as_ref().display(),
            weight.len() / 3,
            weight.first().map(|r| r.len()).unwrap_or(0),
            min_signal,
            max_signal
        );

        Self::new(weight, min_signal, max_signal, min_sigma, tol)
    }

    /// Write the model back into an `.npz` archive
    pub fn save_npz<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let dev = candle_core::Device::Cpu;
        let n_coeff = self.n_coeff();
        let flat: Vec<f64> = self.weight.iter().flatten().copied().collect();
        let weight = Tensor::from_vec(flat, (self.weight.len(), n_coeff), &dev)?;
        let min_signal = Tensor::new(&[self.min_signal], &dev)?;
        let max_signal = Tensor::new(&[self.max_signal], &dev)?;
        let min_sigma = Tensor::new(&[self.min_sigma], &dev)?;

        Tensor::write_npz(
            &[
                (NPZ_WEIGHT, &weight),
                (NPZ_MIN_SIGNAL, &min_signal),
                (NPZ_MAX_SIGNAL, &max_signal),
                (NPZ_MIN_SIGMA, &min_sigma),
            ],
            path.as_ref(),
        )?;
        debug!("saved noise model to {}", path.as_ref().display());
        Ok(())
    }

    pub fn n_gaussian(&self) -> usize {
        self.n_gaussian
    }

    pub fn n_coeff(&self) -> usize {
        self.weight.first().map(|r| r.len()).unwrap_or(0)
    }

    pub fn signal_range(&self) -> (f64, f64) {
        (self.min_signal, self.max_signal)
    }

    pub fn min_sigma(&self) -> f64 {
        self.min_sigma
    }

    /// sum_i w_i * s^i on the normalized signal
    fn polynomial(&self, coeffs: &[f64], s_norm: &Tensor) -> Result<Tensor> {
        let mut acc = s_norm.zeros_like()?;
        let mut pow = s_norm.ones_like()?;
        for (i, &w) in coeffs.iter().enumerate() {
            if i > 0 {
                pow = pow.mul(s_norm)?;
            }
            acc = (acc + pow.affine(w, 0.0)?)?;
        }
        Ok(acc)
    }

    pub fn mixture_params(&self, signal: &Tensor) -> Result<MixtureParams> {
        let k = self.n_gaussian;
        let range = self.max_signal - self.min_signal;
        let s_norm = signal.affine(1.0 / range, -self.min_signal / range)?;

        let mut mu = Vec::with_capacity(k);
        let mut sigma = Vec::with_capacity(k);
        let mut alpha = Vec::with_capacity(k);

        for j in 0..k {
            mu.push(self.polynomial(&self.weight[j], &s_norm)?);

            let var = self.polynomial(&self.weight[k + j], &s_norm)?.exp()?;
            sigma.push(clamp_min(&var.sqrt()?, self.min_sigma)?);

            let logit = self.polynomial(&self.weight[2 * k + j], &s_norm)?;
            alpha.push((logit + self.tol)?.exp()?);
        }

        let mut sum_alpha = alpha[0].clone();
        for a in alpha.iter().skip(1) {
            sum_alpha = (sum_alpha + a)?;
        }
        let alpha = alpha
            .iter()
            .map(|a| a.div(&sum_alpha))
            .collect::<Result<Vec<_>>>()?;

        // shift the means so that the mixture mean is the signal itself
        let mut mixture_mean = signal.zeros_like()?;
        for (a, m) in alpha.iter().zip(mu.iter()) {
            mixture_mean = (mixture_mean + a.mul(m)?)?;
        }
        let offset = signal.sub(&mixture_mean)?;
        let mu = mu
            .iter()
            .map(|m| m.add(&offset))
            .collect::<Result<Vec<_>>>()?;

        Ok(MixtureParams { mu, sigma, alpha })
    }

    /// p(obs | signal) elementwise, floored by `tol`
    pub fn likelihood(&self, obs: &Tensor, signal: &Tensor) -> Result<Tensor> {
        let params = self.mixture_params(signal)?;
        let mut p = obs.zeros_like()?;
        for j in 0..self.n_gaussian {
            let dens = normal_density(obs, &params.mu[j], &params.sigma[j])?;
            p = (p + dens.mul(&params.alpha[j])?)?;
        }
        p + self.tol
    }
}

fn normal_density(x: &Tensor, mean: &Tensor, std: &Tensor) -> Result<Tensor> {
    let var = std.sqr()?;
    let expo = x.sub(mean)?.sqr()?.div(&var.affine(2.0, 0.0)?)?.neg()?.exp()?;
    let norm = var.affine(2.0 * std::f64::consts::PI, 0.0)?.sqrt()?;
    expo.div(&norm)
}

/// One noise model per channel of a (B, C, ...) tensor
#[derive(Clone, Debug)]
pub struct MultiChannelNoiseModel {
    models: Vec<GaussianMixtureNoiseModel>,
}

impl MultiChannelNoiseModel {
    pub fn new(models: Vec<GaussianMixtureNoiseModel>) -> LvaeResult<Self> {
        if models.is_empty() {
            invalid_arg!("at least one channel noise model is required");
        }
        Ok(Self { models })
    }

    pub fn from_config(config: &MultiChannelNmConfig) -> LvaeResult<Self> {
        let models = config
            .noise_models
            .iter()
            .map(GaussianMixtureNoiseModel::from_config)
            .collect::<LvaeResult<Vec<_>>>()?;
        Self::new(models)
    }

    pub fn num_channels(&self) -> usize {
        self.models.len()
    }

    pub fn channel(&self, c: usize) -> Option<&GaussianMixtureNoiseModel> {
        self.models.get(c)
    }

    /// Channel `c` of `obs`/`signal` goes through model `c`
    pub fn likelihood(&self, obs: &Tensor, signal: &Tensor) -> Result<Tensor> {
        let n_ch = obs.dim(1)?;
        if n_ch != self.models.len() || signal.dim(1)? != n_ch {
            candle_core::bail!(
                "{} noise models for observation/signal with {}/{} channels",
                self.models.len(),
                n_ch,
                signal.dim(1)?
            );
        }

        let per_channel = self
            .models
            .iter()
            .enumerate()
            .map(|(c, nm)| nm.likelihood(&obs.narrow(1, c, 1)?, &signal.narrow(1, c, 1)?))
            .collect::<Result<Vec<_>>>()?;

        Tensor::cat(&per_channel, 1)
    }
}
