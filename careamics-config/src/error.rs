use std::path::PathBuf;

use thiserror::Error;

use crate::support::{SupportedAlgorithm, SupportedLoss};

/// Everything that can go wrong while building or updating a configuration.
/// All of these are raised before any tensor is touched.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("algorithm `{algorithm}` does not support loss `{loss}` (expected {expected})")]
    LossAlgorithmMismatch {
        algorithm: SupportedAlgorithm,
        loss: SupportedLoss,
        expected: &'static str,
    },

    #[error(
        "number of output channels ({output_channels}) must match \
         the number of noise models ({noise_models})"
    )]
    ChannelNoiseModelMismatch {
        output_channels: usize,
        noise_models: usize,
    },

    #[error(
        "model `predict_logvar` ({model}) must match \
         Gaussian likelihood `predict_logvar` ({likelihood})"
    )]
    PredictLogvarMismatch { model: bool, likelihood: bool },

    #[error("loss `{loss}` requires {component}")]
    MissingComponent {
        loss: SupportedLoss,
        component: &'static str,
    },

    #[error("invalid architecture: {0}")]
    InvalidArchitecture(String),

    #[error("invalid patch geometry: {0}")]
    InvalidPatchGeometry(String),

    #[error("invalid value for `{field}`: {reason}")]
    InvalidValue { field: &'static str, reason: String },

    #[error("failed to parse configuration: {0}")]
    Json(#[from] serde_json::Error),

    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

impl ConfigError {
    pub(crate) fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        ConfigError::InvalidValue {
            field,
            reason: reason.into(),
        }
    }
}
