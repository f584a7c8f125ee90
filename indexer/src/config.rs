use serde::Deserialize;
use serde_with::{serde_as, DisplayFromStr};
use tracing::level_filters::LevelFilter;

/// Process-level settings, read from the environment. Engine settings come
/// from `INDEXER_`-prefixed variables separately.
#[serde_as]
#[derive(Deserialize, Debug, Clone)]
pub struct CliConfig {
    #[serde_as(as = "DisplayFromStr")]
    #[serde(default = "default_rust_log")]
    pub rust_log: LevelFilter,
    /// Height the simulated source chain starts out at.
    #[serde(default = "default_sim_head")]
    pub sim_head: u64,
    /// Interval at which the simulated source appends a block.
    #[serde(default = "default_sim_block_interval_ms")]
    pub sim_block_interval_ms: u64,
}

fn default_rust_log() -> LevelFilter {
    LevelFilter::INFO
}

fn default_sim_head() -> u64 {
    5_000
}

fn default_sim_block_interval_ms() -> u64 {
    250
}

pub fn get_cli_config() -> anyhow::Result<CliConfig> {
    Ok(envy::from_env::<CliConfig>()?)
}
