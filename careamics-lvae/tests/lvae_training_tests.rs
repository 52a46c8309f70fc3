use candle_core::{DType, Device, Tensor};
use candle_nn::{VarBuilder, VarMap};
use careamics_config::*;
use careamics_lvae::candle_data_loader::PatchData;
use careamics_lvae::candle_inference::TrainConfig;
use careamics_lvae::candle_likelihood::GaussianLikelihood;
use careamics_lvae::candle_loss_functions::LvaeLossParameters;
use careamics_lvae::candle_lvae::{model_factory, LadderVae};
use careamics_lvae::candle_lvae_inference::LvaeTrainer;
use careamics_lvae::candle_noise_model::GaussianMixtureNoiseModel;
use careamics_lvae::candle_prediction::{predict_mmse, predict_single_sample, PredictInput};
use careamics_lvae::cli::{predict, train};

fn tiny_lvae(predict_logvar: bool) -> ModelConfig {
    ModelConfig::Lvae(LvaeModelConfig {
        input_shape: vec![16, 16],
        z_dims: vec![4, 4],
        encoder_n_filters: 8,
        decoder_n_filters: 8,
        encoder_dropout: 0.0,
        decoder_dropout: 0.0,
        predict_logvar,
        ..Default::default()
    })
}

fn musplit_config(predict_logvar: bool) -> anyhow::Result<AlgorithmConfig> {
    let mut raw = AlgorithmConfig::builder(
        SupportedAlgorithm::Musplit,
        SupportedLoss::Musplit,
        tiny_lvae(predict_logvar),
    );
    raw.gaussian_likelihood = Some(GaussianLikelihoodConfig {
        predict_logvar,
        ..Default::default()
    });
    raw.optimizer.lr = 1e-3;
    Ok(AlgorithmConfig::try_from(raw)?)
}

fn denoisplit_config(nm_path: &std::path::Path) -> anyhow::Result<AlgorithmConfig> {
    let mut raw = AlgorithmConfig::builder(
        SupportedAlgorithm::Denoisplit,
        SupportedLoss::Denoisplit,
        tiny_lvae(false),
    );
    raw.noise_model = Some(MultiChannelNmConfig::new(vec![
        GaussianMixtureNmConfig::from_path(nm_path),
    ]));
    raw.noise_model_likelihood = Some(NmLikelihoodConfig::default());
    raw.loss_config.kl_params.annealing = true;
    raw.loss_config.kl_params.start = 0;
    raw.loss_config.kl_params.annealtime = 2;
    raw.optimizer.name = SupportedOptimizer::Sgd;
    raw.optimizer.lr = 1e-4;
    Ok(AlgorithmConfig::try_from(raw)?)
}

fn combined_config(nm_path: &std::path::Path) -> anyhow::Result<AlgorithmConfig> {
    let mut raw = AlgorithmConfig::builder(
        SupportedAlgorithm::Denoisplit,
        SupportedLoss::DenoisplitMusplit,
        tiny_lvae(true),
    );
    raw.noise_model = Some(MultiChannelNmConfig::new(vec![
        GaussianMixtureNmConfig::from_path(nm_path),
    ]));
    raw.noise_model_likelihood = Some(NmLikelihoodConfig::default());
    raw.gaussian_likelihood = Some(GaussianLikelihoodConfig {
        predict_logvar: true,
        ..Default::default()
    });
    raw.optimizer.lr = 1e-4;
    Ok(AlgorithmConfig::try_from(raw)?)
}

fn save_noise_model(path: &std::path::Path) -> anyhow::Result<()> {
    GaussianMixtureNoiseModel::new(vec![vec![0.0, 1.0], vec![-4.0, 0.0], vec![0.0, 0.0]], 0.0, 1.0, 0.05, 1e-10)?
        .save_npz(path)?;
    Ok(())
}

fn patches(n: usize) -> anyhow::Result<PatchData> {
    let dev = Device::Cpu;
    let target = Tensor::rand(0.2f32, 0.8, (n, 1, 16, 16), &dev)?;
    let input = (&target + Tensor::randn(0f32, 0.05, (n, 1, 16, 16), &dev)?)?;
    PatchData::new(input, target)
}

fn build(config: &AlgorithmConfig, varmap: &VarMap) -> anyhow::Result<LadderVae> {
    let vs = VarBuilder::from_varmap(varmap, DType::F32, &Device::Cpu);
    Ok(model_factory(config.model(), vs)?)
}

fn train_config(config: &AlgorithmConfig, epochs: usize) -> TrainConfig {
    let mut tc = TrainConfig::from_optimizer(config.optimizer(), 4, epochs, Device::Cpu);
    tc.show_progress = false;
    tc
}

#[test]
fn musplit_training_smoke() -> anyhow::Result<()> {
    let config = musplit_config(true)?;
    let varmap = VarMap::new();
    let model = build(&config, &varmap)?;
    let mut data = patches(10)?;
    let mut loss_params = LvaeLossParameters::from_config(&config)?;

    let trace = LvaeTrainer::new(&model, &varmap).train(
        &mut data,
        &mut loss_params,
        config.optimizer().name,
        config.lr_scheduler(),
        &train_config(&config, 3),
    )?;

    assert_eq!(trace.loss.len(), 3);
    assert_eq!(trace.skipped_batches, vec![0, 0, 0]);
    assert!(trace.loss.iter().all(|l| l.is_finite()));
    assert_eq!(loss_params.current_epoch, 2);
    Ok(())
}

#[test]
fn denoisplit_training_with_npz_noise_model() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let nm_path = dir.path().join("noise_model.npz");
    save_noise_model(&nm_path)?;

    let config = denoisplit_config(&nm_path)?;
    let varmap = VarMap::new();
    let model = build(&config, &varmap)?;
    let mut data = patches(8)?;
    let mut loss_params = LvaeLossParameters::from_config(&config)?;

    let trace = LvaeTrainer::new(&model, &varmap).train(
        &mut data,
        &mut loss_params,
        config.optimizer().name,
        config.lr_scheduler(),
        &train_config(&config, 2),
    )?;

    assert_eq!(trace.learning_rate, vec![1e-4, 1e-4]);
    assert_eq!(trace.total_skipped(), 0);
    // the KL ramp starts at zero weight
    assert_eq!(trace.kl_loss[0], 0.);
    Ok(())
}

#[test]
fn single_mmse_sample_matches_single_prediction() -> anyhow::Result<()> {
    let config = musplit_config(true)?;
    let varmap = VarMap::new();
    let model = build(&config, &varmap)?.with_non_stochastic(true);
    let likelihood = GaussianLikelihood::new(&GaussianLikelihoodConfig {
        predict_logvar: true,
        ..Default::default()
    });

    let x = Tensor::rand(0f32, 1., (3, 1, 16, 16), &Device::Cpu)?;
    let input = PredictInput::WithAux(x, vec![[0usize, 0], [0, 16], [16, 0]]);

    let single = predict_single_sample(&model, &likelihood, &input)?;
    let mmse = predict_mmse(&model, &likelihood, &input, 1)?;

    let diff = (single.prediction() - mmse.prediction())?
        .abs()?
        .max_all()?
        .to_scalar::<f32>()?;
    assert!(diff < 1e-6);

    let (Some(lv_single), Some(lv_mmse)) = (single.log_var(), mmse.log_var()) else {
        anyhow::bail!("missing log-variance");
    };
    let diff = (lv_single - lv_mmse)?.abs()?.max_all()?.to_scalar::<f32>()?;
    assert!(diff < 1e-6);
    assert_eq!(mmse.aux(), single.aux());
    assert_eq!(mmse.prediction().dims(), &[3, 1, 16, 16]);
    Ok(())
}

#[test]
fn cli_train_then_predict() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let path = |name: &str| dir.path().join(name);

    let config = musplit_config(false)?;
    std::fs::write(path("config.json"), config.to_json_string()?)?;

    let dev = Device::Cpu;
    let target = Tensor::rand(0.2f32, 0.8, (6, 1, 16, 16), &dev)?;
    target.write_npy(path("target.npy"))?;
    target.write_npy(path("input.npy"))?;

    train::run(&train::TrainArgs {
        config: path("config.json"),
        input: path("input.npy"),
        target: path("target.npy"),
        out: path("model.safetensors"),
        trace: Some(path("trace.json")),
        epochs: 2,
        minibatch_size: 4,
        learning_rate: None,
        device: careamics_lvae::cli::ComputeDevice::Cpu,
        verbose: false,
    })?;

    let trace: serde_json::Value = serde_json::from_str(&std::fs::read_to_string(path("trace.json"))?)?;
    assert_eq!(trace["loss"].as_array().map(|a| a.len()), Some(2));

    // not a multiple of the downsampling factor
    let images = Tensor::rand(0f32, 1., (3, 1, 14, 18), &dev)?;
    images.write_npy(path("images.npy"))?;

    predict::run(&predict::PredictArgs {
        config: path("config.json"),
        weights: path("model.safetensors"),
        input: path("images.npy"),
        out: path("pred.npy"),
        logvar_out: None,
        mmse_count: 2,
        minibatch_size: 2,
        device: careamics_lvae::cli::ComputeDevice::Cpu,
        verbose: false,
    })?;

    let pred = Tensor::read_npy(path("pred.npy"))?;
    assert_eq!(pred.dims(), &[3, 1, 14, 18]);
    Ok(())
}

#[test]
fn training_resumes_at_the_configured_epoch() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let nm_path = dir.path().join("noise_model.npz");
    save_noise_model(&nm_path)?;

    // past the end of the KL ramp
    let config = denoisplit_config(&nm_path)?.updated(|raw| raw.loss_config.current_epoch = 4)?;
    let varmap = VarMap::new();
    let model = build(&config, &varmap)?;
    let mut data = patches(8)?;
    let mut loss_params = LvaeLossParameters::from_config(&config)?;
    assert_eq!(loss_params.current_epoch, 4);
    assert_eq!(loss_params.annealed_kl_weight(), loss_params.kl_weight);

    let trace = LvaeTrainer::new(&model, &varmap).train(
        &mut data,
        &mut loss_params,
        config.optimizer().name,
        config.lr_scheduler(),
        &train_config(&config, 2),
    )?;

    assert_eq!(trace.loss.len(), 2);
    assert_eq!(loss_params.current_epoch, 5);
    assert!(trace.kl_loss[0] > 0.);
    Ok(())
}

#[test]
fn cli_combined_loss_predicts_mean_and_logvar() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let path = |name: &str| dir.path().join(name);
    save_noise_model(&path("noise_model.npz"))?;

    let config = combined_config(&path("noise_model.npz"))?;
    std::fs::write(path("config.json"), config.to_json_string()?)?;

    let dev = Device::Cpu;
    let target = Tensor::rand(0.2f32, 0.8, (4, 1, 16, 16), &dev)?;
    target.write_npy(path("target.npy"))?;
    target.write_npy(path("input.npy"))?;

    train::run(&train::TrainArgs {
        config: path("config.json"),
        input: path("input.npy"),
        target: path("target.npy"),
        out: path("model.safetensors"),
        trace: None,
        epochs: 1,
        minibatch_size: 4,
        learning_rate: None,
        device: careamics_lvae::cli::ComputeDevice::Cpu,
        verbose: false,
    })?;

    predict::run(&predict::PredictArgs {
        config: path("config.json"),
        weights: path("model.safetensors"),
        input: path("input.npy"),
        out: path("pred.npy"),
        logvar_out: Some(path("logvar.npy")),
        mmse_count: 2,
        minibatch_size: 2,
        device: careamics_lvae::cli::ComputeDevice::Cpu,
        verbose: false,
    })?;

    let pred = Tensor::read_npy(path("pred.npy"))?;
    assert_eq!(pred.dims(), &[4, 1, 16, 16]);
    let logvar = Tensor::read_npy(path("logvar.npy"))?;
    assert_eq!(logvar.dims(), &[4, 1, 16, 16]);
    Ok(())
}
