//! 2-D ladder variational autoencoder
//!
//! ```text
//!  input ─ first_bottom_up ─ bu[0] ─ bu[1] ─ ... ─ bu[L-1]
//!                             │       │             │
//!  recon ─ head ─ final ─── td[0] ─ td[1] ─ ... ─ td[L-1]
//! ```
//!
//! Bottom-up level `i` halves the resolution unless it is one of the first
//! `multiscale_count - 1` levels, which keep it and merge a lateral
//! context channel of the input instead. Each top-down level samples a
//! latent `z_i` from a posterior built from the bottom-up features of the
//! same level and the top-down features from above, and scores it against
//! a prior built from the top-down features alone (standard normal at the
//! top).

use crate::candle_aux_layers::*;
use crate::candle_model_traits::*;
use crate::candle_pad_crop::crop_img_tensor;
use crate::candle_stable_dist::{kl_normal_analytical, kl_normal_mc, StableLogVar};
use crate::error::{invalid_arg, LvaeResult};
use candle_core::{Module, ModuleT, Result, Tensor};
use candle_nn::{Conv2d, VarBuilder};
use careamics_config::{LvaeModelConfig, ModelConfig, SupportedActivation};

struct FirstBottomUp {
    conv: Conv2d,
    act: Nonlinearity,
    res: ResidualBlock,
}

impl ModuleT for FirstBottomUp {
    fn forward_t(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        let h = self.act.forward(&self.conv.forward(xs)?)?;
        self.res.forward_t(&h, train)
    }
}

impl FirstBottomUp {
    fn new(n_filters: usize, act: SupportedActivation, dropout: f64, vs: VarBuilder) -> Result<Self> {
        Ok(Self {
            conv: same_padding_conv2d(1, n_filters, 5, vs.pp("conv"))?,
            act: Nonlinearity(act),
            res: ResidualBlock::new(n_filters, act, dropout, vs.pp("res"))?,
        })
    }
}

struct BottomUpLayer {
    /// stride-2 conv, absent on levels that keep the resolution
    down: Option<Conv2d>,
    /// 1x1 conv merging the lateral context features
    lowres_merge: Option<Conv2d>,
    act: Nonlinearity,
    res: ResidualBlock,
}

impl BottomUpLayer {
    fn forward_t(&self, xs: &Tensor, lowres: Option<&Tensor>, train: bool) -> Result<Tensor> {
        let h = match &self.down {
            Some(down) => self.act.forward(&down.forward(xs)?)?,
            None => xs.clone(),
        };
        let h = self.res.forward_t(&h, train)?;
        match (&self.lowres_merge, lowres) {
            (Some(merge), Some(lr)) => {
                let merged = merge.forward(&Tensor::cat(&[&h, lr], 1)?)?;
                self.act.forward(&merged)
            }
            _ => Ok(h),
        }
    }
}

struct TopDownLayer {
    is_top: bool,
    retain_spatial_dims: bool,
    z_dim: usize,
    /// top-down features -> prior (mu, logvar)
    prior: Option<Conv2d>,
    /// [top-down, bottom-up] -> posterior (mu, logvar)
    posterior: Conv2d,
    /// [z, top-down] -> features
    merge: Conv2d,
    act: Nonlinearity,
    res: ResidualBlock,
    /// conv after nearest-neighbour upsampling
    up: Option<Conv2d>,
}

struct TopDownOutput {
    h: Tensor,
    z: Tensor,
    kl_elem: Tensor,
}

impl TopDownLayer {
    fn forward_t(
        &self,
        td: Option<&Tensor>,
        bu: &Tensor,
        stochastic: bool,
        analytical_kl: bool,
        train: bool,
    ) -> Result<TopDownOutput> {
        let (b, _, ny, nx) = bu.dims4()?;

        let (p_mu, p_lv) = match (&self.prior, td) {
            (Some(prior), Some(td)) => {
                let p = prior.forward(td)?;
                (p.narrow(1, 0, self.z_dim)?, p.narrow(1, self.z_dim, self.z_dim)?)
            }
            _ => {
                let zeros = Tensor::zeros((b, self.z_dim, ny, nx), bu.dtype(), bu.device())?;
                (zeros.clone(), zeros)
            }
        };

        let q_in = match td {
            Some(td) if !self.is_top => Tensor::cat(&[td, bu], 1)?,
            _ => bu.clone(),
        };
        let q = self.posterior.forward(&q_in)?;
        let q_mu = q.narrow(1, 0, self.z_dim)?;
        let q_lv = StableLogVar::stable(q.narrow(1, self.z_dim, self.z_dim)?);
        let p_lv = StableLogVar::stable(p_lv);

        let z = if stochastic {
            let eps = Tensor::randn_like(&q_mu, 0., 1.)?;
            (&q_mu + q_lv.get_std()?.mul(&eps)?)?
        } else {
            q_mu.clone()
        };

        let kl_elem = if analytical_kl {
            kl_normal_analytical(&p_mu, &p_lv, &q_mu, &q_lv)?
        } else {
            kl_normal_mc(&z, &p_mu, &p_lv, &q_mu, &q_lv)?
        };

        let merge_in = match td {
            Some(td) if !self.is_top => Tensor::cat(&[&z, td], 1)?,
            _ => z.clone(),
        };
        let h = self.act.forward(&self.merge.forward(&merge_in)?)?;
        let h = self.res.forward_t(&h, train)?;

        let h = match &self.up {
            Some(up) if !self.retain_spatial_dims => {
                let h = h.upsample_nearest2d(2 * ny, 2 * nx)?;
                self.act.forward(&up.forward(&h)?)?
            }
            _ => h,
        };

        Ok(TopDownOutput { h, z, kl_elem })
    }
}

pub struct LadderVae {
    config: LvaeModelConfig,
    non_stochastic: bool,
    first_bottom_up: FirstBottomUp,
    lowres_first_bottom_ups: Vec<FirstBottomUp>,
    bottom_up_layers: Vec<BottomUpLayer>,
    top_down_layers: Vec<TopDownLayer>,
    final_top_down: ResidualBlock,
    output_head: Conv2d,
}

impl LadderVaeModuleT for LadderVae {
    fn forward_t(&self, x: &Tensor, train: bool) -> Result<(Tensor, TopDownLayerData)> {
        let bu_values = self.bottomup_pass(x, train)?;
        let (h, td_data) = self.topdown_pass(&bu_values, train)?;
        let h = self.final_top_down.forward_t(&h, train)?;
        Ok((self.output_head.forward(&h)?, td_data))
    }

    fn target_channels(&self) -> usize {
        self.config.output_channels
    }

    fn num_latent_levels(&self) -> usize {
        self.config.n_layers()
    }
}

impl LadderVae {
    /// Will create a new ladder VAE with these variables:
    ///
    /// * `first_bottom_up.*`, `lowres_first_bottom_up.{i}.*`
    /// * `bottom_up.{i}.*`, `top_down.{i}.*` for each latent level `i`
    /// * `final_top_down.*`, `output_head.*`
    ///
    /// # Arguments
    /// * `config` - validated model configuration
    /// * `vs` - variable builder
    pub fn new(config: &LvaeModelConfig, vs: VarBuilder) -> Result<Self> {
        let n_layers = config.n_layers();
        let enc = config.encoder_n_filters;
        let dec = config.decoder_n_filters;
        let act = config.nonlinearity;

        let first_bottom_up =
            FirstBottomUp::new(enc, act, config.encoder_dropout, vs.pp("first_bottom_up"))?;

        let lowres_first_bottom_ups = (0..config.num_retained_levels())
            .map(|i| {
                FirstBottomUp::new(
                    enc,
                    act,
                    config.encoder_dropout,
                    vs.pp(format!("lowres_first_bottom_up.{}", i)),
                )
            })
            .collect::<Result<Vec<_>>>()?;

        let mut bottom_up_layers = Vec::with_capacity(n_layers);
        for i in 0..n_layers {
            let vs_i = vs.pp(format!("bottom_up.{}", i));
            let retain = config.retains_spatial_dims(i);
            bottom_up_layers.push(BottomUpLayer {
                down: if retain {
                    None
                } else {
                    Some(downsampling_conv2d(enc, enc, vs_i.pp("down"))?)
                },
                lowres_merge: if retain {
                    Some(candle_nn::conv2d(
                        2 * enc,
                        enc,
                        1,
                        Default::default(),
                        vs_i.pp("lowres_merge"),
                    )?)
                } else {
                    None
                },
                act: Nonlinearity(act),
                res: ResidualBlock::new(enc, act, config.encoder_dropout, vs_i.pp("res"))?,
            });
        }

        let mut top_down_layers = Vec::with_capacity(n_layers);
        for (i, &z_dim) in config.z_dims.iter().enumerate() {
            let vs_i = vs.pp(format!("top_down.{}", i));
            let is_top = i == n_layers - 1;
            let retain = config.retains_spatial_dims(i);
            let td_in = if is_top { 0 } else { dec };

            top_down_layers.push(TopDownLayer {
                is_top,
                retain_spatial_dims: retain,
                z_dim,
                prior: if is_top {
                    None
                } else {
                    Some(same_padding_conv2d(dec, 2 * z_dim, 3, vs_i.pp("prior"))?)
                },
                posterior: same_padding_conv2d(td_in + enc, 2 * z_dim, 3, vs_i.pp("posterior"))?,
                merge: candle_nn::conv2d(z_dim + td_in, dec, 1, Default::default(), vs_i.pp("merge"))?,
                act: Nonlinearity(act),
                res: ResidualBlock::new(dec, act, config.decoder_dropout, vs_i.pp("res"))?,
                up: if retain {
                    None
                } else {
                    Some(same_padding_conv2d(dec, dec, 3, vs_i.pp("up"))?)
                },
            });
        }

        let final_top_down =
            ResidualBlock::new(dec, act, config.decoder_dropout, vs.pp("final_top_down"))?;
        let output_head = candle_nn::conv2d(
            dec,
            config.decoder_output_channels(),
            1,
            Default::default(),
            vs.pp("output_head"),
        )?;

        Ok(Self {
            config: config.clone(),
            non_stochastic: false,
            first_bottom_up,
            lowres_first_bottom_ups,
            bottom_up_layers,
            top_down_layers,
            final_top_down,
            output_head,
        })
    }

    /// Use posterior means instead of samples
    pub fn with_non_stochastic(mut self, non_stochastic: bool) -> Self {
        self.non_stochastic = non_stochastic;
        self
    }

    pub fn config(&self) -> &LvaeModelConfig {
        &self.config
    }

    /// Bottom-up features of every latent level, bottom first
    pub fn bottomup_pass(&self, x: &Tensor, train: bool) -> Result<Vec<Tensor>> {
        let n_ch = self.config.input_channels();
        if x.rank() != 4 || x.dim(1)? != n_ch {
            candle_core::bail!(
                "expected input (B, {}, Y, X), got {:?}",
                n_ch,
                x.dims()
            );
        }

        let mut h = self
            .first_bottom_up
            .forward_t(&x.narrow(1, 0, 1)?, train)?;

        let mut bu_values = Vec::with_capacity(self.bottom_up_layers.len());
        for (i, layer) in self.bottom_up_layers.iter().enumerate() {
            let lowres = match self.lowres_first_bottom_ups.get(i) {
                Some(lr) => Some(lr.forward_t(&x.narrow(1, i + 1, 1)?, train)?),
                None => None,
            };
            h = layer.forward_t(&h, lowres.as_ref(), train)?;
            bu_values.push(h.clone());
        }
        Ok(bu_values)
    }

    /// Top-down pass from the topmost latent level down to the input
    /// resolution
    pub fn topdown_pass(
        &self,
        bu_values: &[Tensor],
        train: bool,
    ) -> Result<(Tensor, TopDownLayerData)> {
        let n_layers = self.top_down_layers.len();
        if bu_values.len() != n_layers {
            candle_core::bail!(
                "{} bottom-up values for {} latent levels",
                bu_values.len(),
                n_layers
            );
        }

        let mut z = Vec::with_capacity(n_layers);
        let mut kl = Vec::with_capacity(n_layers);
        let mut kl_restricted = Vec::with_capacity(n_layers);
        let mut kl_spatial = Vec::with_capacity(n_layers);
        let mut kl_channelwise = Vec::with_capacity(n_layers);

        let mut td: Option<Tensor> = None;
        for i in (0..n_layers).rev() {
            let layer = &self.top_down_layers[i];
            let out = layer.forward_t(
                td.as_ref(),
                &bu_values[i],
                !self.non_stochastic,
                self.config.analytical_kl,
                train,
            )?;

            let kl_elem = &out.kl_elem;
            kl.push(kl_elem.flatten_from(1)?.sum(1)?);
            kl_channelwise.push(kl_elem.sum((2, 3))?);
            kl_spatial.push(kl_elem.sum(1)?);
            kl_restricted.push(if layer.retain_spatial_dims {
                restricted_kl(kl_elem)?
            } else {
                kl_elem.flatten_from(1)?.sum(1)?
            });
            z.push(out.z);

            td = Some(out.h);
        }

        z.reverse();
        kl.reverse();
        kl_restricted.reverse();
        kl_spatial.reverse();
        kl_channelwise.reverse();

        let Some(h) = td else {
            candle_core::bail!("ladder VAE without latent levels");
        };

        Ok((
            h,
            TopDownLayerData {
                z,
                kl,
                kl_restricted,
                kl_spatial,
                kl_channelwise,
            },
        ))
    }
}

/// KL summed over the central half of the latent grid
fn restricted_kl(kl_elem: &Tensor) -> Result<Tensor> {
    let (_, _, ny, nx) = kl_elem.dims4()?;
    let size = [(ny / 2).max(1), (nx / 2).max(1)];
    let central = crop_img_tensor(kl_elem, &size).map_err(candle_core::Error::wrap)?;
    central.flatten_from(1)?.sum(1)
}

/// Instantiate the network named by the model configuration
pub fn model_factory(config: &ModelConfig, vs: VarBuilder) -> LvaeResult<LadderVae> {
    match config {
        ModelConfig::Lvae(cfg) => {
            cfg.validate()?;
            Ok(LadderVae::new(cfg, vs)?)
        }
        ModelConfig::Custom(cfg) => invalid_arg!(
            "custom architecture `{}` cannot be instantiated here",
            cfg.name
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    fn small(z_dims: Vec<usize>, multiscale_count: usize) -> LvaeModelConfig {
        LvaeModelConfig {
            input_shape: vec![16, 16],
            z_dims,
            multiscale_count,
            encoder_n_filters: 8,
            decoder_n_filters: 8,
            ..Default::default()
        }
    }

    #[test]
    fn latent_shapes_follow_the_hierarchy() -> anyhow::Result<()> {
        let dev = Device::Cpu;
        for (ms, sizes) in [(1, vec![8, 4]), (2, vec![16, 8]), (3, vec![16, 16])] {
            let cfg = small(vec![4, 6], ms);
            cfg.validate()?;
            let varmap = VarMap::new();
            let vs = VarBuilder::from_varmap(&varmap, DType::F32, &dev);
            let model = LadderVae::new(&cfg, vs)?;

            let x = Tensor::randn(0f32, 1., (2, cfg.input_channels(), 16, 16), &dev)?;
            let (recon, td) = model.forward_t(&x, true)?;
            assert_eq!(recon.dims(), &[2, 1, 16, 16]);
            assert_eq!(td.num_layers(), 2);
            for (i, &s) in sizes.iter().enumerate() {
                assert_eq!(td.z[i].dims(), &[2, cfg.z_dims[i], s, s], "ms={}", ms);
                assert_eq!(td.kl[i].dims(), &[2]);
                assert_eq!(td.kl_channelwise[i].dims(), &[2, cfg.z_dims[i]]);
                assert_eq!(td.kl_spatial[i].dims(), &[2, s, s]);
                assert_eq!(td.kl_restricted[i].dims(), &[2]);
            }
        }
        Ok(())
    }

    #[test]
    fn logvar_doubles_the_output() -> anyhow::Result<()> {
        let dev = Device::Cpu;
        let cfg = LvaeModelConfig {
            predict_logvar: true,
            output_channels: 2,
            analytical_kl: true,
            ..small(vec![4, 4], 1)
        };
        let varmap = VarMap::new();
        let model = LadderVae::new(&cfg, VarBuilder::from_varmap(&varmap, DType::F32, &dev))?;
        let x = Tensor::randn(0f32, 1., (1, 1, 16, 16), &dev)?;
        let (recon, _) = model.forward_t(&x, false)?;
        assert_eq!(recon.dims(), &[1, 4, 16, 16]);
        assert_eq!(model.target_channels(), 2);
        Ok(())
    }

    #[test]
    fn non_stochastic_is_deterministic() -> anyhow::Result<()> {
        let dev = Device::Cpu;
        let varmap = VarMap::new();
        let model = LadderVae::new(
            &small(vec![4, 4], 1),
            VarBuilder::from_varmap(&varmap, DType::F32, &dev),
        )?
        .with_non_stochastic(true);
        let x = Tensor::randn(0f32, 1., (1, 1, 16, 16), &dev)?;
        let a = model.forward_t(&x, false)?.0;
        let b = model.forward_t(&x, false)?.0;
        let diff = (a - b)?.abs()?.max_all()?.to_scalar::<f32>()?;
        assert_eq!(diff, 0.0);
        Ok(())
    }

    #[test]
    fn wrong_input_channels() {
        let dev = Device::Cpu;
        let varmap = VarMap::new();
        let model = LadderVae::new(
            &small(vec![4, 4], 2),
            VarBuilder::from_varmap(&varmap, DType::F32, &dev),
        )
        .unwrap();
        let x = Tensor::zeros((1, 1, 16, 16), DType::F32, &dev).unwrap();
        assert!(model.forward_t(&x, false).is_err());
    }

    #[test]
    fn custom_architecture_is_rejected() {
        let custom: ModelConfig =
            serde_json::from_str(r#"{"architecture": "custom", "name": "mine"}"#).unwrap();
        let varmap = VarMap::new();
        let vs = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        assert!(model_factory(&custom, vs).is_err());
    }
}
