use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use figment::Figment;
use figment::providers::{Env, Format, Serialized, Toml};
use serde::{Deserialize, Serialize};

use crate::core::retry::RetryPolicy;
use crate::core::scheduler::QueueConfig;
use crate::core::transfer_engine::{CHUNK_SIZE, RouterConfig};

const CONFIG_FILE: &str = "shuttle.toml";
const ENV_PREFIX: &str = "SHUTTLE_";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    /// Base URL of the remote store API.
    pub endpoint: String,
    /// Bearer token for control-plane calls.
    pub token: Option<String>,
    pub concurrency: usize,
    pub chunk_parallelism: usize,
    /// Per-call timeout. Calls that upload a body get extra time for the
    /// body at `min_throughput_kib_per_sec`, so large files on slow links
    /// are not cut off after this many seconds.
    pub request_timeout_secs: u64,
    /// Slowest upload rate tolerated before a body upload times out. 0 means
    /// every call gets `request_timeout_secs` whatever its size.
    pub min_throughput_kib_per_sec: u64,
    pub retry_attempts: u32,
    pub retry_base_delay_ms: u64,
    pub retry_max_delay_ms: u64,
    pub retention_secs: u64,
    /// Files at or above this size use the chunked strategy.
    pub resumable_threshold_bytes: Option<u64>,
    pub progress_interval_ms: u64,
    pub simulation: bool,
    pub verbose: bool,
    pub json_logs: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://localhost:8080/api".to_string(),
            token: None,
            concurrency: 3,
            chunk_parallelism: 3,
            request_timeout_secs: 30,
            min_throughput_kib_per_sec: 256,
            retry_attempts: 3,
            retry_base_delay_ms: 500,
            retry_max_delay_ms: 10_000,
            retention_secs: 300,
            resumable_threshold_bytes: None,
            progress_interval_ms: 100,
            simulation: false,
            verbose: false,
            json_logs: false,
        }
    }
}

impl AppConfig {
    /// Defaults, then `shuttle.toml` (or `config_file`), then `SHUTTLE_*`
    /// environment variables, then whatever CLI flags were given.
    pub fn new<T: Serialize>(config_file: Option<&Path>, args: Option<&T>) -> Result<Self> {
        let file = config_file
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from(CONFIG_FILE));
        if config_file.is_some() && !file.exists() {
            anyhow::bail!("config file {} does not exist", file.display());
        }

        let mut figment = Figment::from(Serialized::defaults(AppConfig::default()))
            .merge(Toml::file(&file))
            .merge(Env::prefixed(ENV_PREFIX));

        if let Some(args) = args {
            figment = figment.merge(Serialized::defaults(args));
        }

        let config: AppConfig = figment.extract().context("Invalid configuration")?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.concurrency == 0 {
            anyhow::bail!("concurrency must be at least 1");
        }
        if self.chunk_parallelism == 0 {
            anyhow::bail!("chunk_parallelism must be at least 1");
        }
        if self.retry_attempts == 0 {
            anyhow::bail!("retry_attempts must be at least 1");
        }
        if !self.simulation && !self.endpoint.starts_with("http") {
            anyhow::bail!("endpoint must be an http(s) URL, got {:?}", self.endpoint);
        }
        Ok(())
    }

    pub fn queue_config(&self) -> QueueConfig {
        QueueConfig {
            concurrency: self.concurrency,
            retention: Duration::from_secs(self.retention_secs),
            ..Default::default()
        }
    }

    pub fn router_config(&self) -> RouterConfig {
        RouterConfig {
            request_timeout: Duration::from_secs(self.request_timeout_secs),
            min_throughput: self.min_throughput_kib_per_sec * 1024,
            chunk_size: CHUNK_SIZE,
            chunk_parallelism: self.chunk_parallelism,
            resumable_threshold: self.resumable_threshold_bytes,
            retry: RetryPolicy {
                max_attempts: self.retry_attempts,
                base_delay: Duration::from_millis(self.retry_base_delay_ms),
                max_delay: Duration::from_millis(self.retry_max_delay_ms),
                ..Default::default()
            },
            sample_interval: Duration::from_millis(self.progress_interval_ms),
        }
    }

    /// Effective configuration as TOML, token masked.
    pub fn to_toml_redacted(&self) -> Result<String> {
        let mut shown = self.clone();
        if shown.token.is_some() {
            shown.token = Some("<redacted>".to_string());
        }
        toml::to_string_pretty(&shown).context("Failed to serialize config")
    }
}
