use std::path::PathBuf;
use std::time::Duration;

use tracing::{debug, info};

use crate::build_runner::Toolchain;
use crate::download::DEFAULT_API_BASE;

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(1000);
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Runtime settings of a [`JobProcessor`](crate::processor::JobProcessor).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessorConfig {
    pub poll_interval: Duration,
    pub heartbeat_interval: Duration,
    /// Parent of the per-job `job-<id>` working directories.
    pub scratch_dir: PathBuf,
    pub source_api_base: String,
    pub toolchain: Toolchain,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            scratch_dir: std::env::temp_dir(),
            source_api_base: DEFAULT_API_BASE.to_string(),
            toolchain: Toolchain::default(),
        }
    }
}

impl ProcessorConfig {
    pub fn trace_loaded(&self) {
        info!(
            poll_interval_ms = self.poll_interval.as_millis() as u64,
            heartbeat_secs = self.heartbeat_interval.as_secs(),
            scratch_dir = %self.scratch_dir.display(),
            source_api_base = %self.source_api_base,
            "Loaded processor config"
        );
        debug!(?self, "Processor config (full debug)");
    }
}
