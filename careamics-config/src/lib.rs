//! Typed configuration records for LVAE-based restoration algorithms
//! (muSplit, denoiSplit).
//!
//! Every record deserializes from JSON and carries a `validate` method.
//! [`AlgorithmConfig`] ties the pieces together and can only be obtained
//! in validated form: deserialization goes through
//! [`UncheckedAlgorithmConfig`] and the cross-field rules in
//! [`algorithm_model`].

pub mod algorithm_model;
pub mod architectures;
pub mod error;
pub mod likelihood_model;
pub mod loss_model;
pub mod nm_model;
pub mod optimizer_models;
pub mod support;

pub use algorithm_model::{AlgorithmConfig, UncheckedAlgorithmConfig};
pub use architectures::{CustomModelConfig, LvaeModelConfig, ModelConfig};
pub use error::ConfigError;
pub use likelihood_model::{GaussianLikelihoodConfig, NmLikelihoodConfig};
pub use loss_model::{KlLossConfig, LvaeLossConfig};
pub use nm_model::{GaussianMixtureNmConfig, MultiChannelNmConfig};
pub use optimizer_models::{LrSchedulerConfig, OptimizerConfig};
pub use support::*;
