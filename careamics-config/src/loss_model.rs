use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::support::{KlAggregation, KlRescaling, KlType};

/// KL divergence term of the LVAE loss.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KlLossConfig {
    #[serde(rename = "type")]
    pub kl_type: KlType,
    pub rescaling: KlRescaling,
    pub aggregation: KlAggregation,
    pub free_bits_coeff: f64,
    pub annealing: bool,
    /// Epoch at which the annealing ramp starts
    pub start: i64,
    /// Length of the ramp in epochs
    pub annealtime: usize,
}

impl Default for KlLossConfig {
    fn default() -> Self {
        Self {
            kl_type: KlType::Kl,
            rescaling: KlRescaling::LatentDim,
            aggregation: KlAggregation::Mean,
            free_bits_coeff: 0.0,
            annealing: false,
            start: -1,
            annealtime: 10,
        }
    }
}

impl KlLossConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.free_bits_coeff.is_finite() && self.free_bits_coeff >= 0.0) {
            return Err(ConfigError::invalid(
                "free_bits_coeff",
                format!("must be non-negative, got {}", self.free_bits_coeff),
            ));
        }
        if self.annealing && self.annealtime == 0 {
            return Err(ConfigError::invalid(
                "annealtime",
                "annealing needs at least one epoch",
            ));
        }
        Ok(())
    }
}

/// Weights and schedule of the LVAE loss.
///
/// `net_loss = reconstruction_weight * rec_loss + kl_weight * kl_loss`;
/// `musplit_weight`/`denoisplit_weight` mix the two terms of the combined
/// denoiSplit-muSplit loss. `current_epoch` is advanced by the training
/// loop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LvaeLossConfig {
    pub reconstruction_weight: f64,
    pub kl_weight: f64,
    pub musplit_weight: f64,
    pub denoisplit_weight: f64,
    pub kl_params: KlLossConfig,
    pub current_epoch: usize,
    /// Train as a deterministic autoencoder: no sampling, no KL
    pub non_stochastic: bool,
}

impl Default for LvaeLossConfig {
    fn default() -> Self {
        Self {
            reconstruction_weight: 1.0,
            kl_weight: 1.0,
            musplit_weight: 0.1,
            denoisplit_weight: 0.9,
            kl_params: KlLossConfig::default(),
            current_epoch: 0,
            non_stochastic: false,
        }
    }
}

impl LvaeLossConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (field, w) in [
            ("reconstruction_weight", self.reconstruction_weight),
            ("kl_weight", self.kl_weight),
            ("musplit_weight", self.musplit_weight),
            ("denoisplit_weight", self.denoisplit_weight),
        ] {
            if !(w.is_finite() && w >= 0.0) {
                return Err(ConfigError::invalid(
                    field,
                    format!("must be a non-negative number, got {}", w),
                ));
            }
        }
        self.kl_params.validate()
    }
}
