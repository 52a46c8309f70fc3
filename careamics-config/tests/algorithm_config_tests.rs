use careamics_config::*;

fn lvae(output_channels: usize, predict_logvar: bool) -> ModelConfig {
    ModelConfig::Lvae(LvaeModelConfig {
        input_shape: vec![64, 64],
        z_dims: vec![32, 32, 32],
        output_channels,
        predict_logvar,
        ..Default::default()
    })
}

fn inline_nm() -> GaussianMixtureNmConfig {
    GaussianMixtureNmConfig {
        weight: Some(vec![vec![0.0, 1.0]; 3]),
        ..Default::default()
    }
}

fn noise_models(n: usize) -> MultiChannelNmConfig {
    MultiChannelNmConfig::new(vec![inline_nm(); n])
}

fn musplit(output_channels: usize) -> UncheckedAlgorithmConfig {
    let mut raw = AlgorithmConfig::builder(
        SupportedAlgorithm::Musplit,
        SupportedLoss::Musplit,
        lvae(output_channels, false),
    );
    raw.gaussian_likelihood = Some(GaussianLikelihoodConfig::default());
    raw
}

fn denoisplit(output_channels: usize, loss: SupportedLoss) -> UncheckedAlgorithmConfig {
    let mut raw =
        AlgorithmConfig::builder(SupportedAlgorithm::Denoisplit, loss, lvae(output_channels, false));
    raw.noise_model = Some(noise_models(output_channels));
    raw.noise_model_likelihood = Some(NmLikelihoodConfig::default());
    raw.gaussian_likelihood = Some(GaussianLikelihoodConfig::default());
    raw
}

#[test]
fn channel_count_must_match_noise_models() {
    for output_channels in 1..=3 {
        for n_models in 1..=3 {
            let mut raw = musplit(output_channels);
            raw.noise_model = Some(noise_models(n_models));
            let result = AlgorithmConfig::try_from(raw);
            if output_channels == n_models {
                assert!(result.is_ok(), "{} vs {}", output_channels, n_models);
            } else {
                assert!(matches!(
                    result,
                    Err(ConfigError::ChannelNoiseModelMismatch { .. })
                ));
            }
        }
    }
}

#[test]
fn musplit_only_with_musplit_loss() {
    for loss in [SupportedLoss::Denoisplit, SupportedLoss::DenoisplitMusplit] {
        let mut raw = denoisplit(1, loss);
        raw.algorithm = SupportedAlgorithm::Musplit;
        assert!(matches!(
            AlgorithmConfig::try_from(raw),
            Err(ConfigError::LossAlgorithmMismatch { .. })
        ));
    }
    AlgorithmConfig::try_from(musplit(2)).unwrap();
}

#[test]
fn denoisplit_loss_pairing() {
    AlgorithmConfig::try_from(denoisplit(2, SupportedLoss::Denoisplit)).unwrap();
    AlgorithmConfig::try_from(denoisplit(2, SupportedLoss::DenoisplitMusplit)).unwrap();

    let mut raw = musplit(1);
    raw.algorithm = SupportedAlgorithm::Denoisplit;
    assert!(matches!(
        AlgorithmConfig::try_from(raw),
        Err(ConfigError::LossAlgorithmMismatch { .. })
    ));
}

#[test]
fn custom_algorithm_accepts_any_loss() {
    for loss in SupportedLoss::ALL {
        let mut raw = denoisplit(1, *loss);
        raw.algorithm = SupportedAlgorithm::Custom;
        AlgorithmConfig::try_from(raw).unwrap();
    }
}

#[test]
fn predict_logvar_must_agree() {
    let mut raw = musplit(1);
    raw.model = lvae(1, true);
    assert!(matches!(
        AlgorithmConfig::try_from(raw.clone()),
        Err(ConfigError::PredictLogvarMismatch {
            model: true,
            likelihood: false
        })
    ));

    raw.gaussian_likelihood = Some(GaussianLikelihoodConfig {
        predict_logvar: true,
        ..Default::default()
    });
    AlgorithmConfig::try_from(raw).unwrap();
}

#[test]
fn denoisplit_rejects_predicted_logvar() {
    let mut raw = denoisplit(1, SupportedLoss::Denoisplit);
    raw.model = lvae(1, true);
    raw.gaussian_likelihood = Some(GaussianLikelihoodConfig {
        predict_logvar: true,
        ..Default::default()
    });
    assert!(AlgorithmConfig::try_from(raw).is_err());
}

#[test]
fn missing_components() {
    let mut raw = denoisplit(1, SupportedLoss::Denoisplit);
    raw.noise_model = None;
    assert!(matches!(
        AlgorithmConfig::try_from(raw),
        Err(ConfigError::MissingComponent { .. })
    ));

    let mut raw = musplit(1);
    raw.gaussian_likelihood = None;
    assert!(matches!(
        AlgorithmConfig::try_from(raw),
        Err(ConfigError::MissingComponent { .. })
    ));
}

#[test]
fn malformed_hierarchy_is_a_configuration_error() {
    let mut raw = musplit(1);
    raw.model = ModelConfig::Lvae(LvaeModelConfig {
        z_dims: vec![64],
        ..Default::default()
    });
    assert!(matches!(
        AlgorithmConfig::try_from(raw),
        Err(ConfigError::InvalidArchitecture(_))
    ));
}

#[test]
fn failed_update_leaves_config_untouched() {
    let mut cfg = AlgorithmConfig::try_from(musplit(2)).unwrap();
    let before = cfg.clone();

    let err = cfg.set_loss(SupportedLoss::Denoisplit).unwrap_err();
    assert!(matches!(err, ConfigError::LossAlgorithmMismatch { .. }));
    assert_eq!(cfg, before);

    let err = cfg.set_noise_model(Some(noise_models(3))).unwrap_err();
    assert!(matches!(err, ConfigError::ChannelNoiseModelMismatch { .. }));
    assert_eq!(cfg, before);
}

#[test]
fn atomic_multi_field_update() {
    let mut cfg = AlgorithmConfig::try_from(musplit(1)).unwrap();

    // switching to predicted log-variance needs both fields at once
    cfg.update(|raw| {
        raw.model = lvae(1, true);
        raw.gaussian_likelihood = Some(GaussianLikelihoodConfig {
            predict_logvar: true,
            ..Default::default()
        });
    })
    .unwrap();
    assert!(cfg.model().predict_logvar());

    assert!(cfg.set_model(lvae(1, false)).is_err());
    assert!(cfg.model().predict_logvar());
}

#[test]
fn json_round_trip() {
    let cfg = AlgorithmConfig::try_from(denoisplit(2, SupportedLoss::DenoisplitMusplit)).unwrap();
    let json = cfg.to_json_string().unwrap();
    let back = AlgorithmConfig::from_json_str(&json).unwrap();
    assert_eq!(cfg, back);
}

#[test]
fn invalid_json_is_rejected_at_deserialization() {
    let json = r#"{
        "algorithm": "musplit",
        "loss": "denoisplit",
        "model": {"architecture": "LVAE"},
        "gaussian_likelihood": {}
    }"#;
    let err = AlgorithmConfig::from_json_str(json).unwrap_err();
    assert!(err.to_string().contains("musplit"));
}

#[test]
fn from_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("algorithm.json");
    let cfg = AlgorithmConfig::try_from(musplit(1)).unwrap();
    std::fs::write(&path, cfg.to_json_string().unwrap()).unwrap();
    assert_eq!(AlgorithmConfig::from_json_file(&path).unwrap(), cfg);

    let missing = AlgorithmConfig::from_json_file(&dir.path().join("nope.json"));
    assert!(matches!(missing, Err(ConfigError::Io { .. })));
}
