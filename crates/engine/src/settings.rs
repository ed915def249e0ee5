//! Layered settings loading
//!
//! Built-in defaults, then an optional TOML/JSON/YAML file, then `KIMP__*`
//! environment variables, e.g. `KIMP__POLLING__TICKER_INTERVAL_MS=5000` or
//! `KIMP__INSTRUMENTS=BTCUSDT,ETHUSDT`.

use config::{Config, Environment, File, Source};
use std::env;

use kimp_core::EngineConfig;

use crate::error::EngineResult;

/// Names the settings file
pub const CONFIG_PATH_ENV: &str = "KIMP_CONFIG";
pub const DEFAULT_CONFIG_PATH: &str = "kimp.toml";
pub const ENV_PREFIX: &str = "KIMP";

/// Load from the process environment and the file named by `KIMP_CONFIG`.
/// A missing file is not an error. Validation happens in `PriceEngine::from_config`.
pub fn load() -> EngineResult<EngineConfig> {
    let path = env::var(CONFIG_PATH_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
    load_from(File::with_name(&path).required(false), environment())
}

/// Defaults, then `file`, then `env`, each layer overriding the previous one
pub fn load_from<F, E>(file: F, env: E) -> EngineResult<EngineConfig>
where
    F: Source + Send + Sync + 'static,
    E: Source + Send + Sync + 'static,
{
    let config = Config::builder()
        .add_source(Config::try_from(&EngineConfig::default())?)
        .add_source(file)
        .add_source(env)
        .build()?
        .try_deserialize()?;
    Ok(config)
}

fn environment() -> Environment {
    Environment::with_prefix(ENV_PREFIX)
        .separator("__")
        .try_parsing(true)
        .list_separator(",")
        .with_list_parse_key("instruments")
        .with_list_parse_key("endpoints.fx_urls")
}
