//! Error types shared across the pipeline.
//!
//! Stage-specific errors live next to their stage ([`FetchError`],
//! [`BuildError`], [`PublishError`]); [`JobError`] is the single type every
//! stage converges on, and its `Display` output is what lands in the job log
//! after `ERROR: `.

use thiserror::Error;

pub use crate::build_runner::BuildError;
pub use crate::credentials::CipherError;
pub use crate::download::FetchError;
pub use crate::publish::PublishError;

/// Failures of the job/credential record store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlx(#[from] sqlx::Error),

    #[error("corrupt record: {0}")]
    Corrupt(String),

    #[error("job {job_id} cannot move to {to}: not running")]
    Transition { job_id: String, to: String },

    #[error("token cipher: {0}")]
    Cipher(#[from] CipherError),

    #[error("no token encryption key configured")]
    MissingKey,
}

/// Failures talking to the object store.
#[derive(Debug, Error)]
pub enum ObjectStoreError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("{method} {key} returned {status}: {body}")]
    Status {
        method: &'static str,
        key: String,
        status: u16,
        body: String,
    },

    #[error("malformed bucket listing: {0}")]
    Listing(String),

    #[error("invalid endpoint {0:?}")]
    Endpoint(String),
}

/// Terminal failure of one job. Never retried.
#[derive(Debug, Error)]
pub enum JobError {
    #[error("failed to prepare working directory: {0}")]
    Workspace(#[source] std::io::Error),

    #[error("download failed: {0}")]
    Download(#[source] FetchError),

    #[error("unzip failed: {0}")]
    Extract(#[source] FetchError),

    #[error("invalid path in repo: {0}")]
    InvalidPath(String),

    #[error(transparent)]
    Build(#[from] BuildError),

    #[error("upload failed: {0}")]
    Publish(#[from] PublishError),

    #[error("failed to record success: {0}")]
    Finalize(#[source] StoreError),
}
