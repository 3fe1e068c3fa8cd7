use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::core::retention::RetentionPolicy;
use crate::core::throttle::{ThrottleConfig, ThrottleThresholds};
use crate::core::worker::WorkerConfig;
use crate::error::ConfigError;
use crate::utils;

/// Longest a single host sample may block before it counts as failed.
pub const MAX_SAMPLE_TIMEOUT_MS: u64 = 10_000;

/// Process-wide settings shared by the CLI and the admin API.
///
/// Every field has an environment key; see [`Settings::from_env`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub disk_min_free_percent: f64,
    pub cpu_max_percent: f64,
    pub memory_max_percent: f64,
    pub hysteresis_margin: f64,
    pub recovery_samples: u32,
    pub max_consecutive_misses: u32,
    pub sample_interval_secs: u64,
    pub sample_timeout_ms: u64,
    pub disk_mount: String,
    pub retention_expired_days: u32,
    pub retention_stale_grace_days: u32,
    pub retention_archive_days: u32,
    pub scrape_interval_secs: u64,
    pub cleanup_interval_secs: u64,
    pub worker_concurrency: usize,
    pub worker_max_attempts: u32,
    pub worker_retry_delay_secs: u64,
    #[serde(skip_serializing)]
    pub tavily_api_key: Option<String>,
    pub tavily_endpoint: String,
    pub tavily_max_results: usize,
    pub tavily_search_depth: String,
    pub tavily_queries: String,
    pub tavily_queries_file: Option<String>,
    pub http_timeout_secs: u64,
    pub http_proxy: Option<String>,
    pub http_headers: String,
    pub admin_bind: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            disk_min_free_percent: 15.0,
            cpu_max_percent: 85.0,
            memory_max_percent: 85.0,
            hysteresis_margin: 2.0,
            recovery_samples: 2,
            max_consecutive_misses: 3,
            sample_interval_secs: 15,
            sample_timeout_ms: 2000,
            disk_mount: "/".to_string(),
            retention_expired_days: 30,
            retention_stale_grace_days: 7,
            retention_archive_days: 90,
            scrape_interval_secs: 6 * 60 * 60,
            cleanup_interval_secs: 24 * 60 * 60,
            worker_concurrency: 4,
            worker_max_attempts: 3,
            worker_retry_delay_secs: 300,
            tavily_api_key: None,
            tavily_endpoint: "https://api.tavily.com/search".to_string(),
            tavily_max_results: 25,
            tavily_search_depth: "basic".to_string(),
            tavily_queries: "remote rust developer jobs;remote backend engineer hiring canada"
                .to_string(),
            tavily_queries_file: None,
            http_timeout_secs: 45,
            http_proxy: None,
            http_headers: String::new(),
            admin_bind: "127.0.0.1:8000".to_string(),
        }
    }
}

impl Settings {
    /// Loads an optional `.env` file, then reads the process environment.
    pub fn load() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        Self::from_env()
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds settings from an arbitrary key lookup, starting from defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut s = Self::default();

        read(&lookup, "RESOURCE_DISK_MIN_FREE_PERCENT", &mut s.disk_min_free_percent)?;
        read(&lookup, "RESOURCE_CPU_MAX_PERCENT", &mut s.cpu_max_percent)?;
        read(&lookup, "RESOURCE_MEMORY_MAX_PERCENT", &mut s.memory_max_percent)?;
        read(&lookup, "RESOURCE_HYSTERESIS_MARGIN", &mut s.hysteresis_margin)?;
        read(&lookup, "RESOURCE_RECOVERY_SAMPLES", &mut s.recovery_samples)?;
        read(&lookup, "RESOURCE_MAX_CONSECUTIVE_MISSES", &mut s.max_consecutive_misses)?;
        read(&lookup, "RESOURCE_SAMPLE_INTERVAL_SECS", &mut s.sample_interval_secs)?;
        read(&lookup, "RESOURCE_SAMPLE_TIMEOUT_MS", &mut s.sample_timeout_ms)?;
        read(&lookup, "RESOURCE_DISK_MOUNT", &mut s.disk_mount)?;
        read(&lookup, "RETENTION_EXPIRED_DAYS", &mut s.retention_expired_days)?;
        read(&lookup, "RETENTION_STALE_GRACE_DAYS", &mut s.retention_stale_grace_days)?;
        read(&lookup, "RETENTION_ARCHIVE_DAYS", &mut s.retention_archive_days)?;
        read(&lookup, "SCRAPE_INTERVAL_SECS", &mut s.scrape_interval_secs)?;
        read(&lookup, "CLEANUP_INTERVAL_SECS", &mut s.cleanup_interval_secs)?;
        read(&lookup, "WORKER_CONCURRENCY", &mut s.worker_concurrency)?;
        read(&lookup, "WORKER_MAX_ATTEMPTS", &mut s.worker_max_attempts)?;
        read(&lookup, "WORKER_RETRY_DELAY_SECS", &mut s.worker_retry_delay_secs)?;
        read(&lookup, "TAVILY_ENDPOINT", &mut s.tavily_endpoint)?;
        read(&lookup, "TAVILY_MAX_RESULTS", &mut s.tavily_max_results)?;
        read(&lookup, "TAVILY_SEARCH_DEPTH", &mut s.tavily_search_depth)?;
        read(&lookup, "TAVILY_QUERIES", &mut s.tavily_queries)?;
        read(&lookup, "HTTP_TIMEOUT_SECS", &mut s.http_timeout_secs)?;
        read(&lookup, "HTTP_HEADERS", &mut s.http_headers)?;
        read(&lookup, "ADMIN_BIND", &mut s.admin_bind)?;
        s.tavily_api_key = non_empty(lookup("TAVILY_API_KEY"));
        s.tavily_queries_file = non_empty(lookup("TAVILY_QUERIES_FILE"));
        s.http_proxy = non_empty(lookup("SCRAPER_PROXY"));

        s.validate()?;
        Ok(s)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for (key, value) in [
            ("RESOURCE_DISK_MIN_FREE_PERCENT", self.disk_min_free_percent),
            ("RESOURCE_CPU_MAX_PERCENT", self.cpu_max_percent),
            ("RESOURCE_MEMORY_MAX_PERCENT", self.memory_max_percent),
        ] {
            if !(0.0..=100.0).contains(&value) {
                return Err(ConfigError::invalid(key, value, "must be a percentage in [0, 100]"));
            }
        }
        if !(0.0..50.0).contains(&self.hysteresis_margin) {
            return Err(ConfigError::invalid(
                "RESOURCE_HYSTERESIS_MARGIN",
                self.hysteresis_margin,
                "must be in [0, 50)",
            ));
        }
        if self.recovery_samples == 0 {
            return Err(ConfigError::invalid("RESOURCE_RECOVERY_SAMPLES", 0, "must be at least 1"));
        }
        if self.sample_interval_secs == 0 {
            return Err(ConfigError::invalid(
                "RESOURCE_SAMPLE_INTERVAL_SECS",
                0,
                "must be at least 1",
            ));
        }
        if !(1..=MAX_SAMPLE_TIMEOUT_MS).contains(&self.sample_timeout_ms) {
            return Err(ConfigError::invalid(
                "RESOURCE_SAMPLE_TIMEOUT_MS",
                self.sample_timeout_ms,
                format!("must be in [1, {}]", MAX_SAMPLE_TIMEOUT_MS),
            ));
        }
        if self.worker_concurrency == 0 {
            return Err(ConfigError::invalid("WORKER_CONCURRENCY", 0, "must be at least 1"));
        }
        if self.worker_max_attempts == 0 {
            return Err(ConfigError::invalid("WORKER_MAX_ATTEMPTS", 0, "must be at least 1"));
        }
        if url::Url::parse(&self.tavily_endpoint).is_err() {
            return Err(ConfigError::invalid(
                "TAVILY_ENDPOINT",
                &self.tavily_endpoint,
                "must be an absolute URL",
            ));
        }
        self.retention_policy().map(|_| ())
    }

    pub fn thresholds(&self) -> ThrottleThresholds {
        ThrottleThresholds {
            disk_min_free_percent: self.disk_min_free_percent,
            cpu_max_percent: self.cpu_max_percent,
            memory_max_percent: self.memory_max_percent,
            hysteresis_margin: self.hysteresis_margin,
        }
    }

    pub fn throttle_config(&self) -> ThrottleConfig {
        ThrottleConfig {
            thresholds: self.thresholds(),
            recovery_samples: self.recovery_samples,
            max_consecutive_misses: self.max_consecutive_misses,
        }
    }

    pub fn retention_policy(&self) -> Result<RetentionPolicy, ConfigError> {
        RetentionPolicy::with_windows(
            self.retention_expired_days,
            self.retention_stale_grace_days,
            self.retention_archive_days,
        )
    }

    pub fn worker_config(&self) -> WorkerConfig {
        WorkerConfig {
            concurrency: self.worker_concurrency,
            max_attempts: self.worker_max_attempts,
            retry_delay: Duration::from_secs(self.worker_retry_delay_secs),
        }
    }

    pub fn sample_interval(&self) -> Duration {
        Duration::from_secs(self.sample_interval_secs)
    }

    pub fn sample_timeout(&self) -> Duration {
        Duration::from_millis(self.sample_timeout_ms)
    }

    pub fn scrape_interval(&self) -> Duration {
        Duration::from_secs(self.scrape_interval_secs)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }

    /// Extra request headers from `HTTP_HEADERS` (`Name: value;...`).
    pub fn http_header_list(&self) -> Vec<(String, String)> {
        crate::http::parse_headers(&utils::split_list(&self.http_headers, ';'))
    }

    /// Search queries from `TAVILY_QUERIES_FILE` when set, else the inline list.
    pub fn search_queries(&self) -> std::io::Result<Vec<String>> {
        match self.tavily_queries_file {
            Some(ref path) => utils::read_lines(path),
            None => Ok(utils::split_list(&self.tavily_queries, ';')),
        }
    }
}

fn read<F, T>(lookup: &F, key: &'static str, target: &mut T) -> Result<(), ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    if let Some(raw) = lookup(key) {
        let raw = raw.trim();
        if raw.is_empty() {
            return Ok(());
        }
        *target = raw
            .parse()
            .map_err(|e: T::Err| ConfigError::invalid(key, raw, e.to_string()))?;
    }
    Ok(())
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}
