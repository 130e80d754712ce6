//! Explicit configuration record for the analyzer binary.
//!
//! Every component takes what it needs through its constructor; nothing
//! reads global state. The binary builds one of these from the
//! environment.

use std::time::Duration;

use serde::Deserialize;

use crate::scheduler::{SchedulerSettings, DEFAULT_MAKEUP_DAYS};

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct AnalyzerSettings {
    pub listen_addr: String,
    /// Seconds between scheduler passes.
    pub scheduler_interval_secs: u64,
    pub makeup_days: u32,
    pub day_index_lower_bound: u32,
    /// Path to the JSON registry of metrics, encodings and report
    /// configs.
    pub registry_path: Option<String>,
    /// Connection string for the Postgres store; the in-memory store is
    /// used when absent.
    pub database_url: Option<String>,
}

impl Default for AnalyzerSettings {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:3000".to_string(),
            scheduler_interval_secs: 60 * 17,
            makeup_days: DEFAULT_MAKEUP_DAYS,
            day_index_lower_bound: 0,
            registry_path: None,
            database_url: None,
        }
    }
}

impl AnalyzerSettings {
    /// Reads settings from `TALLY_`-prefixed environment variables,
    /// falling back to the defaults. A `.env` file is honored when
    /// present.
    pub fn from_env() -> Self {
        let _ = dotenvy::dotenv();
        let defaults = Self::default();
        Self {
            listen_addr: env_var("TALLY_LISTEN_ADDR").unwrap_or(defaults.listen_addr),
            scheduler_interval_secs: env_parsed("TALLY_SCHEDULER_INTERVAL_SECS")
                .unwrap_or(defaults.scheduler_interval_secs),
            makeup_days: env_parsed("TALLY_MAKEUP_DAYS").unwrap_or(defaults.makeup_days),
            day_index_lower_bound: env_parsed("TALLY_DAY_INDEX_LOWER_BOUND")
                .unwrap_or(defaults.day_index_lower_bound),
            registry_path: env_var("TALLY_REGISTRY_PATH"),
            database_url: env_var("DATABASE_URL"),
        }
    }

    pub fn scheduler_settings(&self) -> SchedulerSettings {
        SchedulerSettings {
            sleep_interval: Duration::from_secs(self.scheduler_interval_secs),
            makeup_days: self.makeup_days,
            day_index_lower_bound: self.day_index_lower_bound,
        }
    }
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|value| !value.is_empty())
}

fn env_parsed<T: std::str::FromStr>(name: &str) -> Option<T> {
    env_var(name).and_then(|value| value.parse().ok())
}
