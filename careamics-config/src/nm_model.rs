use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::support::NoiseModelType;

/// Gaussian mixture noise model for a single channel.
///
/// Parameters come either from a `.npz` artifact at `path` or from an
/// inline `weight` matrix of shape `3 * n_gaussian x n_coeff` (means,
/// log-variances and mixture logits, one polynomial per row).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GaussianMixtureNmConfig {
    pub model_type: NoiseModelType,
    pub path: Option<PathBuf>,
    pub weight: Option<Vec<Vec<f64>>>,
    pub n_gaussian: usize,
    pub n_coeff: usize,
    pub min_signal: f64,
    pub max_signal: f64,
    pub min_sigma: Option<f64>,
    pub tol: f64,
}

impl Default for GaussianMixtureNmConfig {
    fn default() -> Self {
        Self {
            model_type: NoiseModelType::GaussianMixture,
            path: None,
            weight: None,
            n_gaussian: 1,
            n_coeff: 2,
            min_signal: 0.0,
            max_signal: 1.0,
            min_sigma: None,
            tol: 1e-10,
        }
    }
}

impl GaussianMixtureNmConfig {
    pub fn from_path(path: impl Into<PathBuf>) -> Self {
        Self {
            path: Some(path.into()),
            ..Default::default()
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.n_gaussian < 1 {
            return Err(ConfigError::invalid("n_gaussian", "must be at least 1"));
        }
        if self.n_coeff < 2 {
            return Err(ConfigError::invalid("n_coeff", "must be at least 2"));
        }
        if self.min_signal < 0.0 {
            return Err(ConfigError::invalid("min_signal", "must be non-negative"));
        }
        if self.max_signal <= self.min_signal {
            return Err(ConfigError::invalid(
                "max_signal",
                format!(
                    "must exceed min_signal ({} <= {})",
                    self.max_signal, self.min_signal
                ),
            ));
        }
        if let Some(s) = self.min_sigma {
            if s < 0.0 {
                return Err(ConfigError::invalid("min_sigma", "must be non-negative"));
            }
        }
        if self.tol < 0.0 {
            return Err(ConfigError::invalid("tol", "must be non-negative"));
        }

        match (&self.path, &self.weight) {
            (None, None) => Err(ConfigError::invalid(
                "path",
                "either `path` or `weight` must be provided",
            )),
            (Some(path), _) if !path.is_file() => Err(ConfigError::invalid(
                "path",
                format!("noise model artifact {} does not exist", path.display()),
            )),
            (_, Some(weight)) => self.validate_weight(weight),
            _ => Ok(()),
        }
    }

    fn validate_weight(&self, weight: &[Vec<f64>]) -> Result<(), ConfigError> {
        if weight.len() != 3 * self.n_gaussian {
            return Err(ConfigError::invalid(
                "weight",
                format!(
                    "expected {} rows (3 x n_gaussian), got {}",
                    3 * self.n_gaussian,
                    weight.len()
                ),
            ));
        }
        if let Some(row) = weight.iter().find(|row| row.len() != self.n_coeff) {
            return Err(ConfigError::invalid(
                "weight",
                format!("expected {} coefficients per row, got {}", self.n_coeff, row.len()),
            ));
        }
        Ok(())
    }
}

/// One noise model per output channel, in channel order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MultiChannelNmConfig {
    pub noise_models: Vec<GaussianMixtureNmConfig>,
}

impl MultiChannelNmConfig {
    pub fn new(noise_models: Vec<GaussianMixtureNmConfig>) -> Self {
        Self { noise_models }
    }

    pub fn len(&self) -> usize {
        self.noise_models.len()
    }

    pub fn is_empty(&self) -> bool {
        self.noise_models.is_empty()
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.noise_models.is_empty() {
            return Err(ConfigError::invalid(
                "noise_models",
                "at least one channel noise model is required",
            ));
        }
        self.noise_models.iter().try_for_each(|nm| nm.validate())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inline(n_gaussian: usize, n_coeff: usize) -> GaussianMixtureNmConfig {
        GaussianMixtureNmConfig {
            weight: Some(vec![vec![0.0; n_coeff]; 3 * n_gaussian]),
            n_gaussian,
            n_coeff,
            ..Default::default()
        }
    }

    #[test]
    fn inline_weights() {
        inline(3, 2).validate().unwrap();
        let mut bad = inline(3, 2);
        bad.n_gaussian = 2;
        assert!(bad.validate().is_err());
    }

    #[test]
    fn needs_a_source() {
        assert!(GaussianMixtureNmConfig::default().validate().is_err());
    }

    #[test]
    fn missing_artifact() {
        let cfg = GaussianMixtureNmConfig::from_path("/definitely/not/here.npz");
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("does not exist"));
    }

    #[test]
    fn existing_artifact() {
        let file = tempfile::NamedTempFile::new().unwrap();
        GaussianMixtureNmConfig::from_path(file.path()).validate().unwrap();
    }

    #[test]
    fn signal_range() {
        let mut cfg = inline(1, 2);
        cfg.max_signal = 0.0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn empty_multichannel() {
        assert!(MultiChannelNmConfig::new(vec![]).validate().is_err());
        MultiChannelNmConfig::new(vec![inline(1, 2); 2]).validate().unwrap();
    }
}
