use crate::candle_likelihood::LikelihoodModule;
use crate::candle_model_traits::LadderVaeModuleT;
use crate::error::*;

use candle_core::Tensor;

/// A prediction request: a bare (S x C x Y x X) batch, or a batch with
/// metadata (e.g. tile positions) handed back untouched
#[derive(Clone, Debug)]
pub enum PredictInput<M> {
    Tensor(Tensor),
    WithAux(Tensor, Vec<M>),
}

impl<M> PredictInput<M> {
    pub fn tensor(&self) -> &Tensor {
        match self {
            Self::Tensor(x) => x,
            Self::WithAux(x, _) => x,
        }
    }
}

impl<M> From<Tensor> for PredictInput<M> {
    fn from(x: Tensor) -> Self {
        Self::Tensor(x)
    }
}

/// Mirrors the shape of the request it answers
#[derive(Clone, Debug)]
pub enum PredictOutput<M> {
    Tensor {
        prediction: Tensor,
        log_var: Option<Tensor>,
    },
    WithAux {
        prediction: (Tensor, Vec<M>),
        log_var: Option<(Tensor, Vec<M>)>,
    },
}

impl<M> PredictOutput<M>
where
    M: Clone,
{
    fn mirror(input: &PredictInput<M>, prediction: Tensor, log_var: Option<Tensor>) -> Self {
        match input {
            PredictInput::Tensor(_) => Self::Tensor {
                prediction,
                log_var,
            },
            PredictInput::WithAux(_, aux) => Self::WithAux {
                prediction: (prediction, aux.clone()),
                log_var: log_var.map(|lv| (lv, aux.clone())),
            },
        }
    }

    pub fn prediction(&self) -> &Tensor {
        match self {
            Self::Tensor { prediction, .. } => prediction,
            Self::WithAux { prediction, .. } => &prediction.0,
        }
    }

    pub fn log_var(&self) -> Option<&Tensor> {
        match self {
            Self::Tensor { log_var, .. } => log_var.as_ref(),
            Self::WithAux { log_var, .. } => log_var.as_ref().map(|(lv, _)| lv),
        }
    }

    pub fn aux(&self) -> Option<&[M]> {
        match self {
            Self::Tensor { .. } => None,
            Self::WithAux { prediction, .. } => Some(&prediction.1),
        }
    }
}

fn sample_mean_lv<Model, Lik>(
    model: &Model,
    likelihood: &Lik,
    x: &Tensor,
) -> LvaeResult<(Tensor, Option<Tensor>)>
where
    Model: LadderVaeModuleT + ?Sized,
    Lik: LikelihoodModule + ?Sized,
{
    if x.rank() != 4 {
        invalid_arg!("expected (S, C, Y, X) input, got {:?}", x.dims());
    }
    let (recon, _) = model.forward_t(x, false)?;
    let (mean, lv) = likelihood.get_mean_lv(&recon.detach())?;
    Ok((mean, lv))
}

/// One stochastic pass in evaluation mode
///
/// Returns the predicted sample and, when the likelihood predicts it,
/// the log-variance; metadata in the request is attached to both.
pub fn predict_single_sample<Model, Lik, M>(
    model: &Model,
    likelihood: &Lik,
    input: &PredictInput<M>,
) -> LvaeResult<PredictOutput<M>>
where
    Model: LadderVaeModuleT + ?Sized,
    Lik: LikelihoodModule + ?Sized,
    M: Clone,
{
    let (sample, lv) = sample_mean_lv(model, likelihood, input.tensor())?;
    Ok(PredictOutput::mirror(input, sample, lv))
}

/// Monte Carlo MMSE estimate over `mmse_count` sequential passes
///
/// The reported log-variance is the first sample's, not an average.
pub fn predict_mmse<Model, Lik, M>(
    model: &Model,
    likelihood: &Lik,
    input: &PredictInput<M>,
    mmse_count: i64,
) -> LvaeResult<PredictOutput<M>>
where
    Model: LadderVaeModuleT + ?Sized,
    Lik: LikelihoodModule + ?Sized,
    M: Clone,
{
    if mmse_count <= 0 {
        invalid_arg!("mmse_count must be positive, got {}", mmse_count);
    }

    let x = input.tensor();
    let mut samples = Vec::with_capacity(mmse_count as usize);
    let mut first_lv = None;

    for i in 0..mmse_count {
        let (sample, lv) = sample_mean_lv(model, likelihood, x)?;
        if i == 0 {
            first_lv = lv;
        }
        samples.push(sample);
    }

    let mmse = Tensor::stack(&samples, 0)?.mean(0)?;
    Ok(PredictOutput::mirror(input, mmse, first_lv))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::candle_likelihood::GaussianLikelihood;
    use crate::candle_model_traits::TopDownLayerData;
    use candle_core::{DType, Device};
    use careamics_config::GaussianLikelihoodConfig;
    use std::cell::Cell;

    /// Returns `calls` as a constant image, 2 channels per target channel
    struct CountingModel {
        calls: Cell<usize>,
    }

    impl LadderVaeModuleT for CountingModel {
        fn forward_t(&self, x: &Tensor, _train: bool) -> candle_core::Result<(Tensor, TopDownLayerData)> {
            let k = self.calls.get();
            self.calls.set(k + 1);
            let (b, _, h, w) = x.dims4()?;
            let mean = Tensor::full(k as f32, (b, 1, h, w), x.device())?;
            let lv = Tensor::full(-(k as f32), (b, 1, h, w), x.device())?;
            Ok((Tensor::cat(&[mean, lv], 1)?, TopDownLayerData::default()))
        }

        fn target_channels(&self) -> usize {
            1
        }

        fn num_latent_levels(&self) -> usize {
            0
        }
    }

    fn logvar_likelihood() -> GaussianLikelihood {
        GaussianLikelihood::new(&GaussianLikelihoodConfig {
            predict_logvar: true,
            ..Default::default()
        })
    }

    #[test]
    fn mmse_averages_and_keeps_first_logvar() -> anyhow::Result<()> {
        let model = CountingModel { calls: Cell::new(0) };
        let x = Tensor::zeros((2, 1, 4, 4), DType::F32, &Device::Cpu)?;
        let out = predict_mmse(&model, &logvar_likelihood(), &PredictInput::<()>::Tensor(x), 4)?;

        assert_eq!(model.calls.get(), 4);
        let mean = out.prediction().mean_all()?.to_scalar::<f32>()?;
        assert!((mean - 1.5).abs() < 1e-6);
        let lv = out.log_var().ok_or(anyhow::anyhow!("log_var"))?;
        assert_eq!(lv.mean_all()?.to_scalar::<f32>()?, 0.);
        Ok(())
    }

    #[test]
    fn aux_is_passed_through() -> anyhow::Result<()> {
        let model = CountingModel { calls: Cell::new(3) };
        let x = Tensor::zeros((1, 1, 2, 2), DType::F32, &Device::Cpu)?;
        let input = PredictInput::WithAux(x, vec![(0usize, 8usize)]);
        let out = predict_single_sample(&model, &logvar_likelihood(), &input)?;

        match out {
            PredictOutput::WithAux { prediction, log_var } => {
                assert_eq!(prediction.1, vec![(0, 8)]);
                let (lv, aux) = log_var.ok_or(anyhow::anyhow!("log_var"))?;
                assert_eq!(aux, vec![(0, 8)]);
                assert_eq!(lv.flatten_all()?.to_vec1::<f32>()?, vec![-3.; 4]);
            }
            PredictOutput::Tensor { .. } => anyhow::bail!("lost the metadata"),
        }
        Ok(())
    }

    #[test]
    fn no_logvar_without_prediction() -> anyhow::Result<()> {
        let model = CountingModel { calls: Cell::new(0) };
        let lik = GaussianLikelihood::new(&GaussianLikelihoodConfig::default());
        let x = Tensor::zeros((1, 1, 2, 2), DType::F32, &Device::Cpu)?;
        let input = PredictInput::WithAux(x, vec!["tile"]);
        let out = predict_single_sample(&model, &lik, &input)?;
        assert!(out.log_var().is_none());
        assert_eq!(out.aux(), Some(&["tile"][..]));
        assert_eq!(out.prediction().dims(), &[1, 2, 2, 2]);
        Ok(())
    }

    #[test]
    fn bad_requests() -> anyhow::Result<()> {
        let model = CountingModel { calls: Cell::new(0) };
        let x = Tensor::zeros((1, 1, 2, 2), DType::F32, &Device::Cpu)?;
        let input = PredictInput::<()>::Tensor(x);
        for count in [0, -1] {
            assert!(matches!(
                predict_mmse(&model, &logvar_likelihood(), &input, count),
                Err(LvaeError::InvalidArgument(_))
            ));
        }
        assert_eq!(model.calls.get(), 0);

        let flat = PredictInput::<()>::Tensor(Tensor::zeros((4, 4), DType::F32, &Device::Cpu)?);
        assert!(matches!(
            predict_single_sample(&model, &logvar_likelihood(), &flat),
            Err(LvaeError::InvalidArgument(_))
        ));
        Ok(())
    }
}
