//! Closed name tables for the symbolic options used across configurations.
//!
//! Each enum maps one-to-one onto the string used in JSON files and on the
//! command line, in both directions.

use serde::{Deserialize, Serialize};

macro_rules! named_enum {
    (
        $(#[$meta:meta])*
        pub enum $name:ident { $( $variant:ident => $text:literal ),+ $(,)? }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub enum $name {
            $( #[serde(rename = $text)] $variant ),+
        }

        impl $name {
            pub const ALL: &'static [$name] = &[ $( $name::$variant ),+ ];

            pub fn as_str(&self) -> &'static str {
                match self {
                    $( $name::$variant => $text ),+
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl std::str::FromStr for $name {
            type Err = String;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $( $text => Ok($name::$variant), )+
                    _ => Err(format!(
                        "unknown {} `{}` (expected one of: {})",
                        stringify!($name),
                        s,
                        [$( $text ),+].join(", ")
                    )),
                }
            }
        }
    };
}

named_enum! {
    /// Training algorithm.
    pub enum SupportedAlgorithm {
        Musplit => "musplit",
        Denoisplit => "denoisplit",
        Custom => "custom",
    }
}

named_enum! {
    /// Composite LVAE loss.
    pub enum SupportedLoss {
        Musplit => "musplit",
        Denoisplit => "denoisplit",
        DenoisplitMusplit => "denoisplit_musplit",
    }
}

named_enum! {
    pub enum SupportedArchitecture {
        Lvae => "LVAE",
        Custom => "custom",
    }
}

named_enum! {
    pub enum SupportedActivation {
        Identity => "None",
        Sigmoid => "Sigmoid",
        Softmax => "Softmax",
        Tanh => "Tanh",
        Relu => "ReLU",
        LeakyRelu => "LeakyReLU",
        Elu => "ELU",
    }
}

named_enum! {
    /// Which per-layer KL divergence the loss reads from the top-down data.
    pub enum KlType {
        Kl => "kl",
        KlRestricted => "kl_restricted",
        KlSpatial => "kl_spatial",
        KlChannelwise => "kl_channelwise",
    }
}

named_enum! {
    /// Normalizer applied to each layer's KL.
    pub enum KlRescaling {
        LatentDim => "latent_dim",
        ImageDim => "image_dim",
    }
}

named_enum! {
    /// Reduction of the KL over hierarchy layers.
    pub enum KlAggregation {
        Sum => "sum",
        Mean => "mean",
    }
}

named_enum! {
    pub enum SupportedOptimizer {
        Adam => "Adam",
        AdamW => "AdamW",
        Sgd => "SGD",
    }
}

named_enum! {
    pub enum SupportedScheduler {
        ReduceLrOnPlateau => "ReduceLROnPlateau",
        StepLr => "StepLR",
    }
}

named_enum! {
    pub enum NoiseModelType {
        GaussianMixture => "GaussianMixtureNoiseModel",
    }
}

impl Default for SupportedActivation {
    fn default() -> Self {
        SupportedActivation::Elu
    }
}

impl Default for KlType {
    fn default() -> Self {
        KlType::Kl
    }
}

impl Default for KlRescaling {
    fn default() -> Self {
        KlRescaling::LatentDim
    }
}

impl Default for KlAggregation {
    fn default() -> Self {
        KlAggregation::Mean
    }
}

impl Default for SupportedOptimizer {
    fn default() -> Self {
        SupportedOptimizer::Adam
    }
}

impl Default for SupportedScheduler {
    fn default() -> Self {
        SupportedScheduler::ReduceLrOnPlateau
    }
}

impl Default for NoiseModelType {
    fn default() -> Self {
        NoiseModelType::GaussianMixture
    }
}
