use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::support::{SupportedOptimizer, SupportedScheduler};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimizerConfig {
    pub name: SupportedOptimizer,
    pub lr: f64,
    pub weight_decay: f64,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            name: SupportedOptimizer::Adam,
            lr: 1e-4,
            weight_decay: 0.0,
        }
    }
}

impl OptimizerConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.lr.is_finite() && self.lr > 0.0) {
            return Err(ConfigError::invalid("lr", format!("must be positive, got {}", self.lr)));
        }
        if !(self.weight_decay.is_finite() && self.weight_decay >= 0.0) {
            return Err(ConfigError::invalid(
                "weight_decay",
                format!("must be non-negative, got {}", self.weight_decay),
            ));
        }
        if self.name == SupportedOptimizer::Sgd && self.weight_decay > 0.0 {
            return Err(ConfigError::invalid(
                "weight_decay",
                format!("SGD has no weight decay, got {}", self.weight_decay),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LrSchedulerConfig {
    pub name: SupportedScheduler,
    /// Multiplicative decay applied on plateau or every `step_size` epochs
    pub factor: f64,
    /// Epochs without improvement before decaying (plateau scheduler)
    pub patience: usize,
    pub step_size: usize,
}

impl Default for LrSchedulerConfig {
    fn default() -> Self {
        Self {
            name: SupportedScheduler::ReduceLrOnPlateau,
            factor: 0.5,
            patience: 30,
            step_size: 100,
        }
    }
}

impl LrSchedulerConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.factor > 0.0 && self.factor < 1.0) {
            return Err(ConfigError::invalid(
                "factor",
                format!("must be in (0, 1), got {}", self.factor),
            ));
        }
        if self.name == SupportedScheduler::StepLr && self.step_size == 0 {
            return Err(ConfigError::invalid("step_size", "must be at least 1"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn optimizer_json() {
        let cfg: OptimizerConfig = serde_json::from_str(r#"{"name": "SGD", "lr": 0.01}"#).unwrap();
        assert_eq!(cfg.name, SupportedOptimizer::Sgd);
        cfg.validate().unwrap();
    }

    #[test]
    fn bad_lr() {
        let cfg = OptimizerConfig {
            lr: 0.0,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn sgd_rejects_weight_decay() {
        let cfg = OptimizerConfig {
            name: SupportedOptimizer::Sgd,
            weight_decay: 0.01,
            ..Default::default()
        };
        assert!(matches!(cfg.validate(), Err(ConfigError::InvalidValue { .. })));

        let cfg = OptimizerConfig {
            name: SupportedOptimizer::AdamW,
            weight_decay: 0.01,
            ..Default::default()
        };
        cfg.validate().unwrap();
    }

    #[test]
    fn scheduler_factor() {
        let cfg = LrSchedulerConfig {
            factor: 1.5,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }
}
