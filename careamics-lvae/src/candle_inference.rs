use careamics_config::OptimizerConfig;

pub struct TrainConfig {
    pub learning_rate: f64,
    pub weight_decay: f64,
    pub batch_size: usize,
    pub num_epochs: usize,
    pub device: candle_core::Device,
    pub verbose: bool,
    pub show_progress: bool,
}

impl TrainConfig {
    /// Learning rate and weight decay taken from the optimizer configuration
    pub fn from_optimizer(
        optimizer: &OptimizerConfig,
        batch_size: usize,
        num_epochs: usize,
        device: candle_core::Device,
    ) -> Self {
        Self {
            learning_rate: optimizer.lr,
            weight_decay: optimizer.weight_decay,
            batch_size,
            num_epochs,
            device,
            verbose: false,
            show_progress: true,
        }
    }
}
