use std::num::NonZeroUsize;
use std::time::Duration;

use anyhow::Result;
use config::Config;

#[derive(Clone, Debug, serde::Deserialize, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub struct ChainConfig {
    pub block_cache_size: usize,
    pub number_cache_size: usize,
    pub future_cache_size: usize,
    pub bad_cache_size: usize,
    pub max_future_secs: u64,
    pub future_tick_secs: u64,
    pub event_capacity: usize,
}

impl ChainConfig {
    pub fn try_load(config: &Config) -> Result<Self> {
        let full_config = Config::builder()
            .add_source(config::File::from_str(
                include_str!("../config.default.toml"),
                config::FileFormat::Toml,
            ))
            .add_source(config.clone())
            .build()?;
        Ok(full_config.try_deserialize()?)
    }

    pub fn future_tick(&self) -> Duration {
        Duration::from_secs(self.future_tick_secs.max(1))
    }
}

impl Default for ChainConfig {
    fn default() -> Self {
        Self {
            block_cache_size: 256,
            number_cache_size: 2048,
            future_cache_size: 256,
            bad_cache_size: 10,
            max_future_secs: 30,
            future_tick_secs: 5,
            event_capacity: 256,
        }
    }
}

pub(crate) fn capacity(size: usize) -> NonZeroUsize {
    NonZeroUsize::new(size).unwrap_or(NonZeroUsize::MIN)
}
