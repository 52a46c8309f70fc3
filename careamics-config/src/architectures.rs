use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::support::SupportedActivation;

/// Model architecture, discriminated by the `architecture` field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "architecture")]
pub enum ModelConfig {
    #[serde(rename = "LVAE")]
    Lvae(LvaeModelConfig),
    #[serde(rename = "custom")]
    Custom(CustomModelConfig),
}

impl ModelConfig {
    pub fn output_channels(&self) -> usize {
        match self {
            ModelConfig::Lvae(m) => m.output_channels,
            ModelConfig::Custom(m) => m.output_channels,
        }
    }

    pub fn predict_logvar(&self) -> bool {
        match self {
            ModelConfig::Lvae(m) => m.predict_logvar,
            ModelConfig::Custom(m) => m.predict_logvar,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        match self {
            ModelConfig::Lvae(m) => m.validate(),
            ModelConfig::Custom(m) => m.validate(),
        }
    }
}

/// Hierarchical (ladder) VAE.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LvaeModelConfig {
    /// Spatial patch shape (Y, X)
    pub input_shape: Vec<usize>,
    /// 0 or 1 disables lateral contextualization; otherwise the number of
    /// input channels carrying progressively wider context
    pub multiscale_count: usize,
    /// Latent channels per hierarchy level, bottom first
    pub z_dims: Vec<usize>,
    pub output_channels: usize,
    pub encoder_n_filters: usize,
    pub decoder_n_filters: usize,
    pub encoder_dropout: f64,
    pub decoder_dropout: f64,
    pub nonlinearity: SupportedActivation,
    pub predict_logvar: bool,
    pub enable_noise_model: bool,
    pub analytical_kl: bool,
}

impl Default for LvaeModelConfig {
    fn default() -> Self {
        Self {
            input_shape: vec![64, 64],
            multiscale_count: 1,
            z_dims: vec![128, 128, 128, 128],
            output_channels: 1,
            encoder_n_filters: 64,
            decoder_n_filters: 64,
            encoder_dropout: 0.1,
            decoder_dropout: 0.1,
            nonlinearity: SupportedActivation::Elu,
            predict_logvar: false,
            enable_noise_model: true,
            analytical_kl: false,
        }
    }
}

impl LvaeModelConfig {
    pub fn n_layers(&self) -> usize {
        self.z_dims.len()
    }

    /// Number of bottom-up levels that keep the resolution of the level
    /// below (lateral contextualization)
    pub fn num_retained_levels(&self) -> usize {
        self.multiscale_count.saturating_sub(1)
    }

    /// Whether bottom-up level `i` keeps its spatial size
    pub fn retains_spatial_dims(&self, level: usize) -> bool {
        level < self.num_retained_levels()
    }

    /// Overall downsampling between the input and the topmost latent
    pub fn total_downsampling(&self) -> usize {
        let n_down = self.n_layers().saturating_sub(self.num_retained_levels());
        1usize << n_down
    }

    /// Number of channels the network expects on its input
    pub fn input_channels(&self) -> usize {
        self.multiscale_count.max(1)
    }

    /// Number of channels the network emits
    pub fn decoder_output_channels(&self) -> usize {
        if self.predict_logvar {
            2 * self.output_channels
        } else {
            self.output_channels
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.validate_input_shape()?;

        if self.z_dims.len() < 2 {
            return Err(ConfigError::InvalidArchitecture(format!(
                "number of z dimensions must be at least 2 (got {})",
                self.z_dims.len()
            )));
        }
        if self.z_dims.iter().any(|&z| z == 0) {
            return Err(ConfigError::InvalidArchitecture(format!(
                "z dimensions must be positive (got {:?})",
                self.z_dims
            )));
        }

        if self.multiscale_count > self.n_layers() + 1 {
            return Err(ConfigError::InvalidArchitecture(format!(
                "multiscale count ({}) should not exceed the number of \
                 bottom up layers ({}) by more than 1",
                self.multiscale_count,
                self.n_layers()
            )));
        }

        if self.output_channels == 0 {
            return Err(ConfigError::invalid("output_channels", "must be at least 1"));
        }

        for (field, n) in [
            ("encoder_n_filters", self.encoder_n_filters),
            ("decoder_n_filters", self.decoder_n_filters),
        ] {
            if !(8..=1024).contains(&n) {
                return Err(ConfigError::invalid(field, format!("{} not in [8, 1024]", n)));
            }
            if n % 2 != 0 {
                return Err(ConfigError::invalid(
                    field,
                    format!("number of channels must be even (got {})", n),
                ));
            }
        }

        for (field, p) in [
            ("encoder_dropout", self.encoder_dropout),
            ("decoder_dropout", self.decoder_dropout),
        ] {
            if !(0.0..=0.9).contains(&p) {
                return Err(ConfigError::invalid(field, format!("{} not in [0, 0.9]", p)));
            }
        }

        let down = self.total_downsampling();
        if let Some(&side) = self.input_shape.last() {
            if side % down != 0 {
                return Err(ConfigError::InvalidPatchGeometry(format!(
                    "input size {} is not divisible by the total downsampling {}",
                    side, down
                )));
            }
        }

        Ok(())
    }

    fn validate_input_shape(&self) -> Result<(), ConfigError> {
        match self.input_shape.len() {
            2 => {}
            3 => {
                return Err(ConfigError::InvalidPatchGeometry(
                    "3D input shapes are not supported by the LVAE".into(),
                ))
            }
            n => {
                return Err(ConfigError::InvalidPatchGeometry(format!(
                    "input shape must be (Y, X), got {} dimensions",
                    n
                )))
            }
        }

        let (y, x) = (self.input_shape[0], self.input_shape[1]);
        if y != x {
            return Err(ConfigError::InvalidPatchGeometry(format!(
                "input shape must be square, got ({}, {})",
                y, x
            )));
        }
        if !(8..=1024).contains(&x) || !x.is_power_of_two() {
            return Err(ConfigError::InvalidPatchGeometry(format!(
                "input size must be a power of 2 in [8, 1024], got {}",
                x
            )));
        }
        Ok(())
    }
}

/// Architecture provided by the caller; only the fields needed for
/// cross-validation are typed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CustomModelConfig {
    pub name: String,
    #[serde(default = "default_output_channels")]
    pub output_channels: usize,
    #[serde(default)]
    pub predict_logvar: bool,
    #[serde(default)]
    pub parameters: serde_json::Map<String, serde_json::Value>,
}

fn default_output_channels() -> usize {
    1
}

impl CustomModelConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.name.trim().is_empty() {
            return Err(ConfigError::invalid("name", "custom model needs a name"));
        }
        if self.output_channels == 0 {
            return Err(ConfigError::invalid("output_channels", "must be at least 1"));
        }
        Ok(())
    }
}
