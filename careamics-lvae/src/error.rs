use careamics_config::ConfigError;
use thiserror::Error;

/// Errors raised at the boundary of the numeric core.
#[derive(Debug, Error)]
pub enum LvaeError {
    /// Misuse detected at the call site (bad sizes, counts, ranks, artifacts)
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Tensor(#[from] candle_core::Error),
}

pub type LvaeResult<T> = std::result::Result<T, LvaeError>;

macro_rules! invalid_arg {
    ($($arg:tt)*) => {
        return Err($crate::error::LvaeError::InvalidArgument(format!($($arg)*)))
    };
}

pub(crate) use invalid_arg;
