use std::path::Path;

use log::debug;
use serde::{Deserialize, Serialize};

use crate::architectures::ModelConfig;
use crate::error::ConfigError;
use crate::likelihood_model::{GaussianLikelihoodConfig, NmLikelihoodConfig};
use crate::loss_model::LvaeLossConfig;
use crate::nm_model::MultiChannelNmConfig;
use crate::optimizer_models::{LrSchedulerConfig, OptimizerConfig};
use crate::support::{SupportedAlgorithm, SupportedLoss};

/// Raw, not yet validated algorithm configuration.
///
/// This is what JSON deserializes into and what update closures edit;
/// converting it into an [`AlgorithmConfig`] runs every validation rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UncheckedAlgorithmConfig {
    pub algorithm: SupportedAlgorithm,
    pub loss: SupportedLoss,
    pub model: ModelConfig,
    #[serde(default)]
    pub noise_model: Option<MultiChannelNmConfig>,
    #[serde(default)]
    pub noise_model_likelihood: Option<NmLikelihoodConfig>,
    #[serde(default)]
    pub gaussian_likelihood: Option<GaussianLikelihoodConfig>,
    #[serde(default)]
    pub loss_config: LvaeLossConfig,
    #[serde(default)]
    pub optimizer: OptimizerConfig,
    #[serde(default)]
    pub lr_scheduler: LrSchedulerConfig,
}

/// Validated algorithm configuration: which algorithm, loss, architecture,
/// noise model, likelihoods, optimizer and scheduler a run uses.
///
/// Changes go through [`AlgorithmConfig::updated`] / [`AlgorithmConfig::update`],
/// which re-validate the whole record and never leave a half-applied state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "UncheckedAlgorithmConfig")]
pub struct AlgorithmConfig {
    algorithm: SupportedAlgorithm,
    loss: SupportedLoss,
    model: ModelConfig,
    noise_model: Option<MultiChannelNmConfig>,
    noise_model_likelihood: Option<NmLikelihoodConfig>,
    gaussian_likelihood: Option<GaussianLikelihoodConfig>,
    loss_config: LvaeLossConfig,
    optimizer: OptimizerConfig,
    lr_scheduler: LrSchedulerConfig,
}

impl TryFrom<UncheckedAlgorithmConfig> for AlgorithmConfig {
    type Error = ConfigError;

    fn try_from(raw: UncheckedAlgorithmConfig) -> Result<Self, Self::Error> {
        validate(&raw)?;
        Ok(Self {
            algorithm: raw.algorithm,
            loss: raw.loss,
            model: raw.model,
            noise_model: raw.noise_model,
            noise_model_likelihood: raw.noise_model_likelihood,
            gaussian_likelihood: raw.gaussian_likelihood,
            loss_config: raw.loss_config,
            optimizer: raw.optimizer,
            lr_scheduler: raw.lr_scheduler,
        })
    }
}

impl From<AlgorithmConfig> for UncheckedAlgorithmConfig {
    fn from(cfg: AlgorithmConfig) -> Self {
        Self {
            algorithm: cfg.algorithm,
            loss: cfg.loss,
            model: cfg.model,
            noise_model: cfg.noise_model,
            noise_model_likelihood: cfg.noise_model_likelihood,
            gaussian_likelihood: cfg.gaussian_likelihood,
            loss_config: cfg.loss_config,
            optimizer: cfg.optimizer,
            lr_scheduler: cfg.lr_scheduler,
        }
    }
}

impl AlgorithmConfig {
    /// Start from the required fields; everything else takes defaults.
    pub fn builder(
        algorithm: SupportedAlgorithm,
        loss: SupportedLoss,
        model: ModelConfig,
    ) -> UncheckedAlgorithmConfig {
        UncheckedAlgorithmConfig {
            algorithm,
            loss,
            model,
            noise_model: None,
            noise_model_likelihood: None,
            gaussian_likelihood: None,
            loss_config: LvaeLossConfig::default(),
            optimizer: OptimizerConfig::default(),
            lr_scheduler: LrSchedulerConfig::default(),
        }
    }

    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let raw: UncheckedAlgorithmConfig = serde_json::from_str(json)?;
        Self::try_from(raw)
    }

    pub fn from_json_file(path: &Path) -> Result<Self, ConfigError> {
        let json = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        debug!("read algorithm configuration from {}", path.display());
        Self::from_json_str(&json)
    }

    pub fn to_json_string(&self) -> Result<String, ConfigError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Copy-on-write update: apply `edit` to an unchecked copy and return
    /// the re-validated result. `self` is untouched either way.
    pub fn updated<F>(&self, edit: F) -> Result<Self, ConfigError>
    where
        F: FnOnce(&mut UncheckedAlgorithmConfig),
    {
        let mut raw = UncheckedAlgorithmConfig::from(self.clone());
        edit(&mut raw);
        Self::try_from(raw)
    }

    /// Apply `edit` and commit only if the result validates.
    pub fn update<F>(&mut self, edit: F) -> Result<(), ConfigError>
    where
        F: FnOnce(&mut UncheckedAlgorithmConfig),
    {
        *self = self.updated(edit)?;
        Ok(())
    }

    pub fn set_loss(&mut self, loss: SupportedLoss) -> Result<(), ConfigError> {
        self.update(|raw| raw.loss = loss)
    }

    pub fn set_model(&mut self, model: ModelConfig) -> Result<(), ConfigError> {
        self.update(|raw| raw.model = model)
    }

    pub fn set_noise_model(
        &mut self,
        noise_model: Option<MultiChannelNmConfig>,
    ) -> Result<(), ConfigError> {
        self.update(|raw| raw.noise_model = noise_model)
    }

    pub fn set_loss_config(&mut self, loss_config: LvaeLossConfig) -> Result<(), ConfigError> {
        self.update(|raw| raw.loss_config = loss_config)
    }

    pub fn algorithm(&self) -> SupportedAlgorithm {
        self.algorithm
    }

    pub fn loss(&self) -> SupportedLoss {
        self.loss
    }

    pub fn model(&self) -> &ModelConfig {
        &self.model
    }

    pub fn noise_model(&self) -> Option<&MultiChannelNmConfig> {
        self.noise_model.as_ref()
    }

    pub fn noise_model_likelihood(&self) -> Option<&NmLikelihoodConfig> {
        self.noise_model_likelihood.as_ref()
    }

    pub fn gaussian_likelihood(&self) -> Option<&GaussianLikelihoodConfig> {
        self.gaussian_likelihood.as_ref()
    }

    pub fn loss_config(&self) -> &LvaeLossConfig {
        &self.loss_config
    }

    pub fn optimizer(&self) -> &OptimizerConfig {
        &self.optimizer
    }

    pub fn lr_scheduler(&self) -> &LrSchedulerConfig {
        &self.lr_scheduler
    }
}

impl std::fmt::Display for AlgorithmConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match serde_json::to_string_pretty(self) {
            Ok(s) => f.write_str(&s),
            Err(_) => write!(f, "{:?}", self),
        }
    }
}

fn validate(raw: &UncheckedAlgorithmConfig) -> Result<(), ConfigError> {
    raw.model.validate()?;
    if let Some(nm) = &raw.noise_model {
        nm.validate()?;
    }
    if let Some(lik) = &raw.noise_model_likelihood {
        lik.validate()?;
    }
    if let Some(lik) = &raw.gaussian_likelihood {
        lik.validate()?;
    }
    raw.loss_config.validate()?;
    raw.optimizer.validate()?;
    raw.lr_scheduler.validate()?;

    validate_algorithm_loss(raw)?;
    validate_required_components(raw)?;
    validate_output_channels(raw)?;
    validate_predict_logvar(raw)?;
    Ok(())
}

fn validate_algorithm_loss(raw: &UncheckedAlgorithmConfig) -> Result<(), ConfigError> {
    match raw.algorithm {
        SupportedAlgorithm::Musplit if raw.loss != SupportedLoss::Musplit => {
            Err(ConfigError::LossAlgorithmMismatch {
                algorithm: raw.algorithm,
                loss: raw.loss,
                expected: "`musplit`",
            })
        }
        SupportedAlgorithm::Denoisplit => match raw.loss {
            SupportedLoss::Denoisplit | SupportedLoss::DenoisplitMusplit => {
                if raw.loss == SupportedLoss::Denoisplit && raw.model.predict_logvar() {
                    return Err(ConfigError::invalid(
                        "predict_logvar",
                        "algorithm `denoisplit` with loss `denoisplit` does not \
                         support a predicted log-variance",
                    ));
                }
                Ok(())
            }
            SupportedLoss::Musplit => Err(ConfigError::LossAlgorithmMismatch {
                algorithm: raw.algorithm,
                loss: raw.loss,
                expected: "`denoisplit` or `denoisplit_musplit`",
            }),
        },
        _ => Ok(()),
    }
}

fn validate_required_components(raw: &UncheckedAlgorithmConfig) -> Result<(), ConfigError> {
    let needs_nm = matches!(
        raw.loss,
        SupportedLoss::Denoisplit | SupportedLoss::DenoisplitMusplit
    );
    let needs_gaussian = matches!(
        raw.loss,
        SupportedLoss::Musplit | SupportedLoss::DenoisplitMusplit
    );

    if needs_nm && raw.noise_model.is_none() {
        return Err(ConfigError::MissingComponent {
            loss: raw.loss,
            component: "a noise model",
        });
    }
    if needs_nm && raw.noise_model_likelihood.is_none() {
        return Err(ConfigError::MissingComponent {
            loss: raw.loss,
            component: "a noise model likelihood",
        });
    }
    if needs_gaussian && raw.gaussian_likelihood.is_none() {
        return Err(ConfigError::MissingComponent {
            loss: raw.loss,
            component: "a Gaussian likelihood",
        });
    }
    Ok(())
}

fn validate_output_channels(raw: &UncheckedAlgorithmConfig) -> Result<(), ConfigError> {
    let output_channels = raw.model.output_channels();
    if let Some(nm) = &raw.noise_model {
        if nm.len() != output_channels {
            return Err(ConfigError::ChannelNoiseModelMismatch {
                output_channels,
                noise_models: nm.len(),
            });
        }
    }
    if let Some(lik) = &raw.noise_model_likelihood {
        lik.validate_channels(output_channels)?;
    }
    Ok(())
}

fn validate_predict_logvar(raw: &UncheckedAlgorithmConfig) -> Result<(), ConfigError> {
    if let Some(lik) = &raw.gaussian_likelihood {
        let model = raw.model.predict_logvar();
        if model != lik.predict_logvar {
            return Err(ConfigError::PredictLogvarMismatch {
                model,
                likelihood: lik.predict_logvar,
            });
        }
    }
    Ok(())
}
