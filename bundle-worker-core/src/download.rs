//! Source acquisition: download a repository archive at a ref and extract it.
//!
//! The hosting provider serves `GET {api_base}/repos/{owner}/{repo}/zipball/{ref}`.
//! Private repositories work when the owning user has a stored token; its
//! absence is not an error, the request is then made anonymously.

use std::fs::{self, File};
use std::io::{self, BufReader};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use reqwest::header::{ACCEPT, AUTHORIZATION, USER_AGENT};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::contract::{CredentialStore, SourceCoordinates};
use crate::error::JobError;

pub const DEFAULT_API_BASE: &str = "https://api.github.com";
const ARCHIVE_NAME: &str = "repo.zip";

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("zip download failed: {status} | {body}")]
    Status {
        status: reqwest::StatusCode,
        body: String,
    },

    #[error("{0}")]
    Io(#[from] io::Error),

    #[error("invalid archive: {0}")]
    Zip(#[from] zip::result::ZipError),

    #[error("archive is empty")]
    EmptyArchive,

    #[error("archive entry escapes destination: {0}")]
    UnsafeEntry(String),

    #[error("extraction task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Downloads and unpacks repository archives for a job.
#[derive(Clone)]
pub struct SourceFetcher {
    client: reqwest::Client,
    api_base: String,
    credentials: Arc<dyn CredentialStore>,
}

impl SourceFetcher {
    pub fn new(api_base: impl Into<String>, credentials: Arc<dyn CredentialStore>) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_base: api_base.into().trim_end_matches('/').to_string(),
            credentials,
        }
    }

    pub fn archive_url(&self, source: &SourceCoordinates) -> String {
        format!(
            "{}/repos/{}/{}/zipball/{}",
            self.api_base,
            source.owner,
            source.repo,
            source.selected_ref()
        )
    }

    /// Download the archive of `source` into `dest_dir`, returning its path.
    pub async fn download_archive(
        &self,
        dest_dir: &Path,
        source: &SourceCoordinates,
        owner_id: &str,
    ) -> Result<PathBuf, FetchError> {
        let url = self.archive_url(source);
        info!(url = %url, "Downloading repository archive");

        let mut request = self
            .client
            .get(&url)
            .header(ACCEPT, "application/vnd.github+json")
            .header(USER_AGENT, concat!("bundle-worker/", env!("CARGO_PKG_VERSION")));
        if let Some(token) = self.token_for(owner_id).await {
            request = request.header(AUTHORIZATION, format!("Bearer {token}"));
        }

        let mut response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(FetchError::Status { status, body });
        }

        tokio::fs::create_dir_all(dest_dir).await?;
        let archive_path = dest_dir.join(ARCHIVE_NAME);
        let mut out = tokio::fs::File::create(&archive_path).await?;
        let mut written = 0usize;
        while let Some(chunk) = response.chunk().await? {
            written += chunk.len();
            out.write_all(&chunk).await?;
        }
        out.flush().await?;
        debug!(path = %archive_path.display(), bytes = written, "Archive saved");
        Ok(archive_path)
    }

    async fn token_for(&self, owner_id: &str) -> Option<String> {
        if owner_id.is_empty() {
            return None;
        }
        match self.credentials.access_token(owner_id).await {
            Ok(token) => token.filter(|t| !t.is_empty()),
            Err(e) => {
                warn!(owner_id, error = %e, "Credential lookup failed, downloading anonymously");
                None
            }
        }
    }
}

/// Extract `archive` into `dest` off the async runtime; returns the archive's
/// single top-level directory.
pub async fn extract(archive: PathBuf, dest: PathBuf) -> Result<PathBuf, FetchError> {
    tokio::task::spawn_blocking(move || extract_blocking(&archive, &dest)).await?
}

/// Hosting providers prefix every entry with `<owner>-<repo>-<sha>/`; the
/// first entry's leading component names that directory.
pub fn extract_blocking(archive: &Path, dest: &Path) -> Result<PathBuf, FetchError> {
    let file = File::open(archive)?;
    let mut zip = zip::ZipArchive::new(BufReader::new(file))?;
    if zip.is_empty() {
        return Err(FetchError::EmptyArchive);
    }
    fs::create_dir_all(dest)?;

    let mut top_dir: Option<PathBuf> = None;
    for i in 0..zip.len() {
        let mut entry = zip.by_index(i)?;
        let rel = entry
            .enclosed_name()
            .ok_or_else(|| FetchError::UnsafeEntry(entry.name().to_string()))?;

        if top_dir.is_none() {
            if let Some(Component::Normal(first)) = rel.components().next() {
                top_dir = Some(dest.join(first));
            }
        }

        let out_path = dest.join(&rel);
        if entry.is_dir() {
            fs::create_dir_all(&out_path)?;
            continue;
        }
        if let Some(parent) = out_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut out = File::create(&out_path)?;
        io::copy(&mut entry, &mut out)?;
    }

    let top_dir = top_dir.ok_or(FetchError::EmptyArchive)?;
    info!(top_dir = %top_dir.display(), "Extracted archive");
    Ok(top_dir)
}

/// The directory to build: `path` beneath the extracted top directory.
pub fn resolve_working_dir(top_dir: &Path, path: &str) -> Result<PathBuf, JobError> {
    let trimmed = path.trim_matches('/');
    if trimmed.is_empty() {
        return Ok(top_dir.to_path_buf());
    }
    let rel = Path::new(trimmed);
    if !rel.components().all(|c| matches!(c, Component::Normal(_))) {
        return Err(JobError::InvalidPath(path.to_string()));
    }
    let working = top_dir.join(rel);
    if !working.is_dir() {
        return Err(JobError::InvalidPath(path.to_string()));
    }
    Ok(working)
}
