//! `load_config`: builds the worker configuration from an optional YAML file
//! overlaid by environment variables.
//!
//! The YAML file holds static, non-secret settings. Credentials
//! (`AWS_ACCESS_KEY_ID`, `AWS_SECRET_ACCESS_KEY`, `TOKEN_ENC_KEY`) are read
//! from the environment only. Environment values win over the file.
//!
//! ```yaml
//! database_url: sqlite:///var/lib/bundle-worker/jobs.db
//! poll_interval_ms: 1000
//! heartbeat_interval_secs: 30
//! scratch_dir: /var/tmp/bundle-worker
//! source_api_base: https://api.github.com
//! toolchain:
//!   - [npm, ci]
//!   - [npm, run, build]
//! storage:
//!   endpoint: https://minio.internal:9000
//!   bucket: bundles
//!   region: us-east-1
//!   public_base_url: https://cdn.example.com
//! ```
//!
//! A missing required setting is a startup error naming the variable.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use bundle_worker_core::build_runner::Toolchain;
use bundle_worker_core::config::ProcessorConfig;
use bundle_worker_core::credentials::KEY_LEN;
use bundle_worker_core::store::s3::{default_region, S3Config};
use serde::Deserialize;
use tracing::{error, info};

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FileConfig {
    pub database_url: Option<String>,
    pub poll_interval_ms: Option<u64>,
    pub heartbeat_interval_secs: Option<u64>,
    pub scratch_dir: Option<PathBuf>,
    pub source_api_base: Option<String>,
    pub toolchain: Option<Vec<Vec<String>>>,
    pub storage: StorageSection,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StorageSection {
    pub endpoint: Option<String>,
    pub bucket: Option<String>,
    pub region: Option<String>,
    pub public_base_url: Option<String>,
}

/// Everything `bundle-worker run` needs.
pub struct WorkerConfig {
    pub database_url: String,
    pub processor: ProcessorConfig,
    pub storage: S3Config,
    pub token_key: Option<Vec<u8>>,
}

impl std::fmt::Debug for WorkerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerConfig")
            .field("database_url", &self.database_url)
            .field("processor", &self.processor)
            .field("storage", &self.storage)
            .field("token_key", &self.token_key.as_ref().map(|_| "***"))
            .finish()
    }
}

/// Read and parse the YAML file, or an empty config without one.
pub fn load_file(path: Option<&Path>) -> Result<FileConfig> {
    let Some(path) = path else {
        return Ok(FileConfig::default());
    };
    info!(config_path = ?path, "Loading configuration from file");
    let content = fs::read_to_string(path).map_err(|e| {
        error!(error = ?e, config_path = ?path, "Failed to read config file");
        anyhow!("Failed to read config file {path:?}: {e}")
    })?;
    serde_yaml::from_str(&content).map_err(|e| {
        error!(error = ?e, config_path = ?path, "Failed to parse config YAML");
        anyhow!("Failed to parse config YAML: {e}")
    })
}

/// Only the database location; enough for `enqueue` and `status`.
pub fn load_database_url(path: Option<&Path>) -> Result<String> {
    let file = load_file(path)?;
    required("DATABASE_URL", file.database_url)
}

/// The full worker configuration.
pub fn load_config(path: Option<&Path>) -> Result<WorkerConfig> {
    let file = load_file(path)?;

    let database_url = required("DATABASE_URL", file.database_url)?;

    let mut processor = ProcessorConfig::default();
    if let Some(ms) = parsed::<u64>("JOB_POLL_INTERVAL_MS")?.or(file.poll_interval_ms) {
        if ms == 0 {
            bail!("JOB_POLL_INTERVAL_MS must be greater than zero");
        }
        processor.poll_interval = Duration::from_millis(ms);
    }
    if let Some(secs) = parsed::<u64>("HEARTBEAT_INTERVAL_SECS")?.or(file.heartbeat_interval_secs)
    {
        if secs == 0 {
            bail!("HEARTBEAT_INTERVAL_SECS must be greater than zero");
        }
        processor.heartbeat_interval = Duration::from_secs(secs);
    }
    if let Some(dir) = env_var("BUILD_TMP_DIR").map(PathBuf::from).or(file.scratch_dir) {
        processor.scratch_dir = dir;
    }
    if let Some(base) = env_var("SOURCE_API_BASE").or(file.source_api_base) {
        processor.source_api_base = base;
    }
    if let Some(steps) = file.toolchain {
        if steps.is_empty() || steps.iter().any(|step| step.is_empty()) {
            bail!("toolchain must list at least one non-empty command");
        }
        processor.toolchain = Toolchain { steps };
    }

    let storage = S3Config {
        endpoint: required("S3_ENDPOINT", file.storage.endpoint)?,
        bucket: required("S3_BUCKET", file.storage.bucket)?,
        region: env_var("S3_REGION")
            .or(file.storage.region)
            .unwrap_or_else(default_region),
        public_base_url: required("S3_PUBLIC_BASE_URL", file.storage.public_base_url)?,
        access_key_id: required("AWS_ACCESS_KEY_ID", None)?,
        secret_access_key: required("AWS_SECRET_ACCESS_KEY", None)?,
    };

    let token_key = match env_var("TOKEN_ENC_KEY") {
        Some(key) if key.len() != KEY_LEN => {
            bail!("TOKEN_ENC_KEY must be {KEY_LEN} bytes, got {}", key.len())
        }
        Some(key) => Some(key.into_bytes()),
        None => None,
    };

    Ok(WorkerConfig {
        database_url,
        processor,
        storage,
        token_key,
    })
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn required(name: &str, from_file: Option<String>) -> Result<String> {
    env_var(name)
        .or(from_file.filter(|v| !v.trim().is_empty()))
        .ok_or_else(|| anyhow!("missing required setting {name}"))
}

fn parsed<T>(name: &str) -> Result<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    env_var(name)
        .map(|raw| raw.parse::<T>().with_context(|| format!("invalid {name}: {raw:?}")))
        .transpose()
}
