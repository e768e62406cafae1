//! # contract: data model and ports of the build pipeline
//!
//! This module defines the records the worker mutates ([`BuildJob`] and the
//! version [`BuildState`]) and the three traits through which the
//! [`JobProcessor`](crate::processor::JobProcessor) reaches the outside world:
//!
//! - [`JobStore`]: the job/version record store with an atomic claim.
//! - [`CredentialStore`]: decrypted hosting-provider tokens per owning user.
//! - [`ObjectStore`]: key-addressed bucket storage for published bundles.
//!
//! ## Mocking & Testing
//! - All traits are annotated for `mockall` so consumers can generate
//!   deterministic mocks (`MockJobStore`, `MockObjectStore`, ...).
//!
//! ## Adding New Backends
//! - Implement the trait for your backend and hand it to the processor as an
//!   `Arc<dyn Trait>`. No component reaches for a global client handle.

use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[allow(unused_imports)]
use mockall::{automock, predicate::*};

use crate::error::{ObjectStoreError, StoreError};

/// Status of one build attempt.
///
/// Transitions are monotonic: `queued -> running -> {success, error}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Running,
    Success,
    Error,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Success => "success",
            JobStatus::Error => "error",
        }
    }

    pub fn is_terminal(&self) -> bool {
        match self {
            JobStatus::Queued | JobStatus::Running => false,
            JobStatus::Success | JobStatus::Error => true,
        }
    }

    /// Whether `self -> next` is a legal step of the job state machine.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        matches!(
            (self, next),
            (JobStatus::Queued, JobStatus::Running)
                | (JobStatus::Running, JobStatus::Success)
                | (JobStatus::Running, JobStatus::Error)
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(JobStatus::Queued),
            "running" => Ok(JobStatus::Running),
            "success" => Ok(JobStatus::Success),
            "error" => Ok(JobStatus::Error),
            other => Err(StoreError::Corrupt(format!("unknown job status {other:?}"))),
        }
    }
}

/// Build state mirrored onto the component version record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BuildState {
    None,
    Queued,
    Running,
    Ready,
    Error,
}

impl BuildState {
    pub fn as_str(&self) -> &'static str {
        match self {
            BuildState::None => "none",
            BuildState::Queued => "queued",
            BuildState::Running => "running",
            BuildState::Ready => "ready",
            BuildState::Error => "error",
        }
    }
}

impl From<JobStatus> for BuildState {
    fn from(status: JobStatus) -> Self {
        match status {
            JobStatus::Queued => BuildState::Queued,
            JobStatus::Running => BuildState::Running,
            JobStatus::Success => BuildState::Ready,
            JobStatus::Error => BuildState::Error,
        }
    }
}

impl fmt::Display for BuildState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BuildState {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "" | "none" => Ok(BuildState::None),
            "queued" => Ok(BuildState::Queued),
            "running" => Ok(BuildState::Running),
            "ready" => Ok(BuildState::Ready),
            "error" => Ok(BuildState::Error),
            other => Err(StoreError::Corrupt(format!("unknown build state {other:?}"))),
        }
    }
}

/// Where the source of a build lives on the hosting provider.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceCoordinates {
    pub owner: String,
    pub repo: String,
    /// Sub-directory within the repository to build; empty for the root.
    #[serde(default)]
    pub path: String,
    /// Branch or tag.
    #[serde(default)]
    pub reference: String,
    /// Optional pinned commit sha.
    #[serde(default)]
    pub commit: String,
}

impl SourceCoordinates {
    /// First non-empty of commit, reference, then `"main"`.
    pub fn selected_ref(&self) -> &str {
        [self.commit.as_str(), self.reference.as_str()]
            .into_iter()
            .find(|r| !r.is_empty())
            .unwrap_or("main")
    }
}

/// Descriptor of a successfully published bundle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    pub bundle_url: String,
}

/// One build attempt for a specific component version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildJob {
    pub id: String,
    pub component_id: String,
    /// Component slug, used in object keys.
    pub component: String,
    pub version: String,
    pub status: JobStatus,
    pub owner_id: String,
    pub source: SourceCoordinates,
    /// Append-only, ordered log lines.
    pub logs: Vec<String>,
    pub artifact: Option<Artifact>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
}

/// The data needed to queue a new build job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewBuildJob {
    pub component_id: String,
    pub component: String,
    pub version: String,
    pub owner_id: String,
    pub source: SourceCoordinates,
}

/// Object body and metadata as returned by [`ObjectStore::get`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredObject {
    pub body: Vec<u8>,
    pub content_type: Option<String>,
}

/// Mutable job-record store.
///
/// `claim_next` must be a single atomic find-and-transition so that two
/// workers polling the same store can never both own a job.
#[cfg_attr(any(test, feature = "test-export-mocks"), automock)]
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert a new job in state `queued`.
    async fn enqueue(&self, job: NewBuildJob) -> Result<BuildJob, StoreError>;

    /// Fetch a job including its full log.
    async fn get(&self, job_id: &str) -> Result<Option<BuildJob>, StoreError>;

    /// Atomically move one queued job to `running`, setting `started_at`.
    /// Returns `None` when no job is queued.
    async fn claim_next(&self) -> Result<Option<BuildJob>, StoreError>;

    /// Append one line to the job's log.
    async fn append_log(&self, job_id: &str, line: &str) -> Result<(), StoreError>;

    /// Finalize a running job as `success` with its artifact.
    async fn complete(&self, job_id: &str, artifact: Artifact) -> Result<(), StoreError>;

    /// Finalize a running job as `error`.
    async fn fail(&self, job_id: &str) -> Result<(), StoreError>;

    /// Number of jobs still waiting in `queued`.
    async fn count_queued(&self) -> Result<u64, StoreError>;

    /// Mirror a build outcome onto the component version record.
    async fn set_version_state(
        &self,
        component_id: &str,
        version: &str,
        state: BuildState,
        preview_url: Option<String>,
    ) -> Result<(), StoreError>;
}

/// Source of decrypted hosting-provider tokens, keyed by owning user.
#[cfg_attr(any(test, feature = "test-export-mocks"), automock)]
#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// The user's decrypted access token, or `None` if none is usable.
    async fn access_token(&self, owner_id: &str) -> Result<Option<String>, StoreError>;
}

/// Key-addressed object storage holding published bundles.
#[cfg_attr(any(test, feature = "test-export-mocks"), automock)]
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Upload `body` under `key` with an explicit content type.
    async fn put(&self, key: &str, body: Vec<u8>, content_type: &str)
        -> Result<(), ObjectStoreError>;

    /// Download an object; `None` when the key does not exist.
    async fn get(&self, key: &str) -> Result<Option<StoredObject>, ObjectStoreError>;

    /// Stored content type of an object without downloading its body.
    async fn content_type(&self, key: &str) -> Result<Option<String>, ObjectStoreError>;

    /// All keys under `prefix`.
    async fn list(&self, prefix: &str) -> Result<Vec<String>, ObjectStoreError>;

    /// Replace the stored content type of an existing object server-side.
    async fn set_content_type(&self, key: &str, content_type: &str)
        -> Result<(), ObjectStoreError>;

    /// Public URL under which `key` is served.
    fn public_url(&self, key: &str) -> String;
}
