use std::sync::Arc;

use tracing::{info, warn};

use crate::contract::JobStore;

/// Appends human-readable lines to one job's log.
///
/// Log writes are best-effort: a store hiccup while recording progress is
/// reported through tracing and never fails the build itself.
#[derive(Clone)]
pub struct JobLog {
    store: Arc<dyn JobStore>,
    job_id: String,
}

impl JobLog {
    pub fn new(store: Arc<dyn JobStore>, job_id: impl Into<String>) -> Self {
        Self {
            store,
            job_id: job_id.into(),
        }
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub async fn push(&self, line: impl AsRef<str>) {
        let line = line.as_ref();
        info!(job_id = %self.job_id, "{line}");
        self.push_quiet(line).await;
    }

    /// Append without echoing through tracing; used for toolchain output
    /// that is already echoed by the caller.
    pub async fn push_quiet(&self, line: &str) {
        if let Err(e) = self.store.append_log(&self.job_id, line).await {
            warn!(job_id = %self.job_id, error = %e, "Failed to append job log line");
        }
    }
}
