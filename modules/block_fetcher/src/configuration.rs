use std::time::Duration;

use anyhow::Result;
use config::Config;

#[derive(Clone, Debug, serde::Deserialize, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub struct FetcherConfig {
    /// Outstanding announcements allowed per peer
    pub hash_limit: usize,
    /// Queued pushed blocks allowed per peer
    pub block_limit: usize,
    /// How far ahead of our head a block may be and still be kept
    pub max_queue_dist: u64,
    /// How far behind our head a block may be and still be kept
    pub max_uncle_dist: u64,
    pub arrive_timeout_ms: u64,
    pub gather_slack_ms: u64,
    pub fetch_timeout_ms: u64,
    pub channel_capacity: usize,
}

impl FetcherConfig {
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

    /// Time an announcement waits for more announcers before we fetch it
    pub fn gather_delay(&self) -> Duration {
        Duration::from_millis(self.arrive_timeout_ms.saturating_sub(self.gather_slack_ms))
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_millis(self.fetch_timeout_ms)
    }
}

impl Default for FetcherConfig {
    fn default() -> Self {
        Self {
            hash_limit: 256,
            block_limit: 64,
            max_queue_dist: 32,
            max_uncle_dist: 7,
            arrive_timeout_ms: 500,
            gather_slack_ms: 100,
            fetch_timeout_ms: 5000,
            channel_capacity: 256,
        }
    }
}
