pub mod candle_aux_layers;
pub mod candle_data_loader;
pub mod candle_inference;
pub mod candle_likelihood;
pub mod candle_loss_functions;
pub mod candle_lvae;
pub mod candle_lvae_inference;
pub mod candle_model_traits;
pub mod candle_noise_model;
pub mod candle_pad_crop;
pub mod candle_prediction;
pub mod candle_stable_dist;
pub mod cli;
pub mod error;
pub mod logging;

pub use candle_core;
pub use candle_nn;
pub use careamics_config;
