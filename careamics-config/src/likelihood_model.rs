use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Gaussian likelihood on the decoder output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct GaussianLikelihoodConfig {
    /// The decoder emits a per-pixel log-variance next to the mean
    pub predict_logvar: bool,
    /// Lower clip applied to the predicted log-variance
    pub logvar_lowerbound: Option<f64>,
    /// Known variance used when the log-variance is not predicted;
    /// without it the likelihood is the unnormalized `-0.5 (x - mu)^2`
    pub fixed_variance: Option<f64>,
}

impl GaussianLikelihoodConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(v) = self.fixed_variance {
            if !(v.is_finite() && v > 0.0) {
                return Err(ConfigError::invalid(
                    "fixed_variance",
                    format!("must be a positive number, got {}", v),
                ));
            }
            if self.predict_logvar {
                return Err(ConfigError::invalid(
                    "fixed_variance",
                    "cannot be combined with `predict_logvar`",
                ));
            }
        }
        if let Some(lb) = self.logvar_lowerbound {
            if !lb.is_finite() {
                return Err(ConfigError::invalid("logvar_lowerbound", "must be finite"));
            }
        }
        Ok(())
    }
}

/// Noise-model likelihood; `data_mean`/`data_std` undo the target
/// normalization before the noise model is evaluated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NmLikelihoodConfig {
    pub data_mean: Vec<f64>,
    pub data_std: Vec<f64>,
}

impl Default for NmLikelihoodConfig {
    fn default() -> Self {
        Self {
            data_mean: vec![0.0],
            data_std: vec![1.0],
        }
    }
}

impl NmLikelihoodConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.data_mean.is_empty() || self.data_std.is_empty() {
            return Err(ConfigError::invalid(
                "data_mean",
                "mean and std need at least one value",
            ));
        }
        if let Some(s) = self.data_std.iter().find(|s| !(s.is_finite() && **s > 0.0)) {
            return Err(ConfigError::invalid(
                "data_std",
                format!("must be positive, got {}", s),
            ));
        }
        Ok(())
    }

    /// Statistics must be scalar or given per output channel
    pub fn validate_channels(&self, output_channels: usize) -> Result<(), ConfigError> {
        for (field, n) in [
            ("data_mean", self.data_mean.len()),
            ("data_std", self.data_std.len()),
        ] {
            if n != 1 && n != output_channels {
                return Err(ConfigError::invalid(
                    field,
                    format!(
                        "expected 1 or {} values (one per output channel), got {}",
                        output_channels, n
                    ),
                ));
            }
        }
        Ok(())
    }
}
