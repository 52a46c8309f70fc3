//! Numerically stable pieces of the diagonal-Gaussian latent algebra.

use candle_core::{Result, Tensor};

pub const DEFAULT_VAR_EPS: f64 = 1e-6;
pub const DEFAULT_FREE_BITS_EPS: f64 = 1e-6;

/// Overflow-free surrogate of `exp`
///
/// exp(x) for x <= 0
/// 1 + x  for x > 0
///
/// This is intentionally *not* the exponential on the positive side;
/// variances derived from it grow linearly with the raw log-variance.
pub struct StableExponential {
    pos_mask: Tensor,
    pos_data: Tensor,
    neg_data: Tensor,
}

impl StableExponential {
    pub fn new(x: &Tensor) -> Result<Self> {
        Ok(Self {
            pos_mask: x.gt(0.0)?,
            pos_data: x.maximum(0.0)?,
            neg_data: x.minimum(0.0)?,
        })
    }

    pub fn exp(&self) -> Result<Tensor> {
        self.pos_mask
            .where_cond(&(&self.pos_data + 1.0)?, &self.neg_data.exp()?)
    }

    /// Natural log of [`StableExponential::exp`]
    pub fn log(&self) -> Result<Tensor> {
        self.pos_mask
            .where_cond(&(&self.pos_data + 1.0)?.log()?, &self.neg_data)
    }
}

/// Inverse of the surrogate exponential
///
/// ln(v)  for v <= 1
/// v - 1  for v > 1
pub fn stable_log(v: &Tensor) -> Result<Tensor> {
    v.gt(1.0)?.where_cond(&(v - 1.0)?, &v.log()?)
}

/// Log-variance with a strictly positive variance
///
/// var = stable_exp(lv) + eps, or plain `exp(lv)` when stabilization is off
#[derive(Clone, Debug)]
pub struct StableLogVar {
    lv: Tensor,
    enable_stable: bool,
    var_eps: f64,
}

impl StableLogVar {
    pub fn new(lv: Tensor, enable_stable: bool, var_eps: f64) -> Self {
        Self {
            lv,
            enable_stable,
            var_eps,
        }
    }

    pub fn stable(lv: Tensor) -> Self {
        Self::new(lv, true, DEFAULT_VAR_EPS)
    }

    pub fn raw(&self) -> &Tensor {
        &self.lv
    }

    /// Log-variance consistent with [`StableLogVar::get_var`]
    pub fn get(&self) -> Result<Tensor> {
        if !self.enable_stable {
            return Ok(self.lv.clone());
        }
        stable_log(&self.get_var()?)
    }

    pub fn get_var(&self) -> Result<Tensor> {
        if !self.enable_stable {
            return self.lv.exp();
        }
        StableExponential::new(&self.lv)?.exp()? + self.var_eps
    }

    pub fn get_std(&self) -> Result<Tensor> {
        self.get_var()?.sqrt()
    }
}

/// Elementwise `max(x, floor)` that lets NaN through
pub(crate) fn clamp_min(x: &Tensor, floor: f64) -> Result<Tensor> {
    let floor_t = x.ones_like()?.affine(0.0, floor)?;
    x.lt(floor)?.where_cond(&floor_t, x)
}

/// Mean over every non-batch dimension: (B, ...) -> (B,)
pub fn compute_batch_mean(x: &Tensor) -> Result<Tensor> {
    x.flatten_from(1)?.mean(1)
}

/// Free-bits KL
///
/// Takes a KL of shape (batch, layers) and returns the per-layer batch
/// average (layers,), with each element floored at `free_bits`. With
/// `batch_average` the floor applies to the batch mean instead, so only
/// the average KL per layer is kept above the floor.
///
/// * `kl` - (batch, layers)
/// * `free_bits` - floor; below `eps` it is ignored
/// * `batch_average` - clamp(mean(KL)) instead of mean(clamp(KL))
/// * `eps` - tolerance under which free bits count as disabled
pub fn free_bits_kl(kl: &Tensor, free_bits: f64, batch_average: bool, eps: f64) -> Result<Tensor> {
    if kl.rank() != 2 {
        candle_core::bail!(
            "free-bits KL expects a (batch, layers) tensor, got {:?}",
            kl.dims()
        );
    }
    if free_bits < eps {
        return kl.mean(0);
    }
    if batch_average {
        clamp_min(&kl.mean(0)?, free_bits)
    } else {
        clamp_min(kl, free_bits)?.mean(0)
    }
}

/// Elementwise log-density of N(mu, var)
pub fn normal_log_prob(x: &Tensor, mu: &Tensor, lv: &StableLogVar) -> Result<Tensor> {
    let ln_2pi: f64 = (2.0 * std::f64::consts::PI).ln();
    let var = lv.get_var()?;
    let sq = x.sub(mu)?.sqr()?.div(&var)?;
    ((sq + var.log()?)? + ln_2pi)? * (-0.5)
}

/// One-sample Monte Carlo estimate of the elementwise KL(q || p)
///
/// log q(z) - log p(z)
pub fn kl_normal_mc(
    z: &Tensor,
    p_mu: &Tensor,
    p_lv: &StableLogVar,
    q_mu: &Tensor,
    q_lv: &StableLogVar,
) -> Result<Tensor> {
    normal_log_prob(z, q_mu, q_lv)? - normal_log_prob(z, p_mu, p_lv)?
}

/// Closed-form elementwise KL(q || p) between diagonal Gaussians
///
/// 0.5 * (log var_p - log var_q + (var_q + (mu_q - mu_p)^2) / var_p - 1)
pub fn kl_normal_analytical(
    p_mu: &Tensor,
    p_lv: &StableLogVar,
    q_mu: &Tensor,
    q_lv: &StableLogVar,
) -> Result<Tensor> {
    let p_var = p_lv.get_var()?;
    let q_var = q_lv.get_var()?;
    let ratio = (q_var.clone() + q_mu.sub(p_mu)?.sqr()?)?.div(&p_var)?;
    let log_ratio = (p_var.log()? - q_var.log()?)?;
    ((log_ratio + ratio)? - 1.0)? * 0.5
}
