use std::sync::OnceLock;

static LOGGER: OnceLock<bool> = OnceLock::new();

/// Install `env_logger` once per process; `verbose` raises the default
/// level to `info` unless `RUST_LOG` says otherwise.
///
/// Returns whether this call did the installation. Later calls, or a
/// `log::Log` already installed by an embedder, leave things as they are.
pub fn init_logger(verbose: bool) -> bool {
    let mut performed = false;
    LOGGER.get_or_init(|| {
        let mut builder = env_logger::Builder::new();
        if verbose {
            builder.filter_level(log::LevelFilter::Info);
        } else {
            builder.filter_level(log::LevelFilter::Warn);
        }
        builder.parse_default_env();
        performed = builder.try_init().is_ok();
        performed
    });
    performed
}
