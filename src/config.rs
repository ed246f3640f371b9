use std::path::{Path, PathBuf};
use std::time::Duration;
use serde::Deserialize;
use crate::core::Result;
use crate::utils::{RetryBudgets, RetryPolicy};

mod duration_secs {
    use std::time::Duration;
    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        u64::deserialize(deserializer).map(Duration::from_secs)
    }
}

mod duration_millis {
    use std::time::Duration;
    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

/// Scheduler, retry and housekeeping parameters of the upload queue.
#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct QueueConfig {
    /// Upper bound on items in `uploading` at once
    pub concurrent_limit: usize,
    /// Re-admit connectivity-paused items when the network returns
    pub auto_resume: bool,
    /// Admission is refused above this storage usage, in percent
    pub quota_warning_threshold: f64,
    #[serde(rename = "retry_base_delay_ms", with = "duration_millis")]
    pub retry_base_delay: Duration,
    #[serde(rename = "retry_max_delay_secs", with = "duration_secs")]
    pub retry_max_delay: Duration,
    pub retry_budgets: RetryBudgets,
    /// Size tolerance of the existing-media heuristic, as a fraction
    pub duplicate_size_tolerance: f64,
    /// Samples kept by the speed estimator
    pub progress_window: usize,
    #[serde(rename = "quota_refresh_interval_secs", with = "duration_secs")]
    pub quota_refresh_interval: Duration,
    pub history_retention_days: u32,
    pub event_capacity: usize,
    pub command_capacity: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            concurrent_limit: 3,
            auto_resume: true,
            quota_warning_threshold: 90.0,
            retry_base_delay: Duration::from_secs(1),
            retry_max_delay: Duration::from_secs(300),
            retry_budgets: RetryBudgets::default(),
            duplicate_size_tolerance: 0.01,
            progress_window: 20,
            quota_refresh_interval: Duration::from_secs(60),
            history_retention_days: 30,
            event_capacity: 256,
            command_capacity: 100,
        }
    }
}

impl QueueConfig {
    pub fn with_concurrent_limit(mut self, limit: usize) -> Self {
        self.concurrent_limit = limit.max(1);
        self
    }

    pub fn with_retry_delays(mut self, base: Duration, max: Duration) -> Self {
        self.retry_base_delay = base;
        self.retry_max_delay = max;
        self
    }

    pub fn with_retry_budgets(mut self, budgets: RetryBudgets) -> Self {
        self.retry_budgets = budgets;
        self
    }

    pub fn with_auto_resume(mut self, auto_resume: bool) -> Self {
        self.auto_resume = auto_resume;
        self
    }

    pub fn with_quota_warning_threshold(mut self, threshold: f64) -> Self {
        self.quota_warning_threshold = threshold;
        self
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.retry_budgets, self.retry_base_delay, self.retry_max_delay)
    }
}

/// Settings of the command-line uploader, read from `config.toml`.
#[derive(Deserialize, Debug, Clone)]
pub struct AppConfig {
    /// Upload endpoint of the media server
    pub endpoint: String,
    /// Base URL of the registration API, defaults to `endpoint`
    #[serde(default)]
    pub api_base: Option<String>,
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,
    /// Zero means unlimited
    #[serde(default)]
    pub storage_quota_bytes: u64,
    /// Files enqueued on start
    #[serde(default)]
    pub files: Vec<PathBuf>,
    #[serde(default = "default_context_type")]
    pub context_type: String,
    #[serde(default)]
    pub context_id: String,
    #[serde(default)]
    pub set_id: Option<String>,
    #[serde(default)]
    pub queue: QueueConfig,
}

fn default_state_dir() -> PathBuf {
    PathBuf::from(".upload-queue")
}

fn default_context_type() -> String {
    "collection".to_string()
}

impl AppConfig {
    pub fn from_toml(contents: &str) -> Result<Self> {
        Ok(toml::from_str(contents)?)
    }

    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let contents = tokio::fs::read_to_string(path).await?;
        Self::from_toml(&contents)
    }

    pub fn api_base(&self) -> &str {
        self.api_base.as_deref().unwrap_or(&self.endpoint)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_defaults() {
        let config = QueueConfig::default();
        assert_eq!(config.concurrent_limit, 3);
        assert!(config.auto_resume);
        assert_eq!(config.retry_budgets.server, 3);
        assert_eq!(config.retry_budgets.network, 5);
        assert_eq!(config.retry_policy().delay_for(1), Duration::from_secs(2));
    }

    #[test]
    fn test_load_app_config() {
        let config = AppConfig::from_toml(
            r#"
            endpoint = "https://media.example.com/upload"
            token = "secret"
            files = ["photos/a.jpg"]
            context_id = "col-1"

            [queue]
            concurrent_limit = 2
            retry_base_delay_ms = 250
            quota_refresh_interval_secs = 5

            [queue.retry_budgets]
            server = 4
            "#,
        )
        .unwrap();

        assert_eq!(config.api_base(), "https://media.example.com/upload");
        assert_eq!(config.context_type, "collection");
        assert_eq!(config.state_dir, PathBuf::from(".upload-queue"));
        assert_eq!(config.queue.concurrent_limit, 2);
        assert_eq!(config.queue.retry_base_delay, Duration::from_millis(250));
        assert_eq!(config.queue.quota_refresh_interval, Duration::from_secs(5));
        assert_eq!(config.queue.retry_max_delay, Duration::from_secs(300));
        assert_eq!(config.queue.retry_budgets.server, 4);
        assert_eq!(config.queue.retry_budgets.network, 5);
    }

    #[test]
    fn test_invalid_config_is_an_error() {
        assert!(AppConfig::from_toml("endpoint = 3").is_err());
    }
}
