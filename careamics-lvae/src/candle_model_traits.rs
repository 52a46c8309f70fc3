use candle_core::{Result, Tensor};
use careamics_config::KlType;

pub trait LadderVaeModuleT {
    /// Full ladder pass: bottom-up encoding, stochastic top-down decoding
    ///
    /// # Arguments
    /// * `x` - input image batch (B x C_in x Y x X)
    /// * `train` - whether to use dropout/batchnorm or not
    ///
    /// # Returns `(recon, td_data)`
    /// * `recon` - decoder output (B x C_out x Y x X), C_out doubled when
    ///   the log-variance is predicted
    /// * `td_data` - per-level latents and KL terms
    fn forward_t(&self, x: &Tensor, train: bool) -> Result<(Tensor, TopDownLayerData)>;

    /// Number of target channels the output is compared against
    fn target_channels(&self) -> usize;

    fn num_latent_levels(&self) -> usize;
}

/// Per-level outputs of one top-down pass, bottom level first
///
/// * `z` - sampled latents (B x C_i x Y_i x X_i)
/// * `kl` - KL summed over each level (B)
/// * `kl_restricted` - KL summed over the central region (B)
/// * `kl_spatial` - KL summed over channels (B x Y_i x X_i)
/// * `kl_channelwise` - KL summed over space (B x C_i)
#[derive(Clone, Debug, Default)]
pub struct TopDownLayerData {
    pub z: Vec<Tensor>,
    pub kl: Vec<Tensor>,
    pub kl_restricted: Vec<Tensor>,
    pub kl_spatial: Vec<Tensor>,
    pub kl_channelwise: Vec<Tensor>,
}

impl TopDownLayerData {
    pub fn num_layers(&self) -> usize {
        self.kl.len()
    }

    /// Per-level KL reduced to (B) under the chosen variant
    pub fn kl_for(&self, kl_type: KlType) -> Result<Vec<Tensor>> {
        let src = match kl_type {
            KlType::Kl => return Ok(self.kl.clone()),
            KlType::KlRestricted => return Ok(self.kl_restricted.clone()),
            KlType::KlSpatial => &self.kl_spatial,
            KlType::KlChannelwise => &self.kl_channelwise,
        };
        src.iter().map(|t| t.flatten_from(1)?.sum(1)).collect()
    }

    /// Number of latent elements per sample on each level
    pub fn latent_sizes(&self) -> Vec<usize> {
        self.z
            .iter()
            .map(|z| z.dims().iter().skip(1).product())
            .collect()
    }
}
