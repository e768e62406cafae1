//! Artifact publication.
//!
//! An output directory is uploaded under `components/<component>/<version>/`:
//! `assets/` recursively, other root files one level deep, and the rewritten
//! `index.html` last. Deeper files outside `assets/` are not published.

use std::io;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use reqwest::Url;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::build_runner::ENTRY_DOCUMENT;
use crate::content_type;
use crate::contract::ObjectStore;
use crate::error::ObjectStoreError;
use crate::rewrite::{self, RewriteError};

const ASSETS_DIR: &str = "assets";
const HTML: &str = "text/html";

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("output directory {} does not exist", .0.display())]
    NotADirectory(PathBuf),

    #[error("no index.html in {}", .0.display())]
    MissingEntry(PathBuf),

    #[error("failed to read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to rewrite index.html: {0}")]
    Rewrite(#[from] RewriteError),

    #[error("{key}: {source}")]
    Upload {
        key: String,
        #[source]
        source: ObjectStoreError,
    },
}

/// Where a file of the output directory goes, by its path relative to it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Placement {
    /// Under `assets/`, at any depth; holds the key suffix (`assets/...`).
    AssetFile(String),
    /// Directly in the output root; holds the file name.
    RootFile(String),
    /// Not uploaded by the file passes.
    Skip,
}

/// Classify an output-relative path.
///
/// The root `index.html` is skipped here because it is rewritten and uploaded
/// on its own after everything else.
pub fn classify(rel: &Path) -> Placement {
    let mut parts = Vec::new();
    for component in rel.components() {
        match component {
            Component::Normal(part) => match part.to_str() {
                Some(part) => parts.push(part),
                None => return Placement::Skip,
            },
            Component::CurDir => {}
            _ => return Placement::Skip,
        }
    }

    match parts.as_slice() {
        [] => Placement::Skip,
        [name] if *name == ENTRY_DOCUMENT => Placement::Skip,
        [name] => Placement::RootFile((*name).to_string()),
        [first, ..] if *first == ASSETS_DIR => Placement::AssetFile(parts.join("/")),
        _ => Placement::Skip,
    }
}

/// `components/<component>/<version>/`
pub fn bundle_prefix(component: &str, version: &str) -> String {
    format!("components/{component}/{version}/")
}

/// Public URL of `key` below `base`, never repeating the bucket segment.
///
/// A base without a scheme is treated as `http://`. When the base path
/// already is, or starts with, the bucket the key is joined directly;
/// otherwise the bucket is inserted.
pub fn public_url(base: &str, bucket: &str, key: &str) -> String {
    let key = key.trim_start_matches('/');
    let base = base.trim();
    let base = if base.starts_with("http://") || base.starts_with("https://") {
        base.to_string()
    } else {
        format!("http://{base}")
    };

    let Ok(mut url) = Url::parse(&base) else {
        let base = base.trim_end_matches('/');
        return if base.contains(bucket) {
            format!("{base}/{key}")
        } else {
            format!("{base}/{bucket}/{key}")
        };
    };

    let path = url.path().trim_matches('/').to_string();
    let bucket_in_base = path == bucket || path.starts_with(&format!("{bucket}/"));
    let segments: Vec<&str> = [path.as_str(), if bucket_in_base { "" } else { bucket }, key]
        .into_iter()
        .flat_map(|s| s.split('/'))
        .filter(|s| !s.is_empty())
        .collect();
    url.set_path(&format!("/{}", segments.join("/")));
    url.to_string()
}

/// Uploads output directories to an [`ObjectStore`].
#[derive(Clone)]
pub struct Publisher {
    store: Arc<dyn ObjectStore>,
}

impl Publisher {
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self { store }
    }

    /// Publish `out_dir` and return the public URL of its `index.html`.
    pub async fn publish(
        &self,
        component: &str,
        version: &str,
        out_dir: &Path,
    ) -> Result<String, PublishError> {
        if !out_dir.is_dir() {
            return Err(PublishError::NotADirectory(out_dir.to_path_buf()));
        }
        let index_path = out_dir.join(ENTRY_DOCUMENT);
        if !index_path.is_file() {
            return Err(PublishError::MissingEntry(out_dir.to_path_buf()));
        }

        // Rewritten up front so a bad document never leaves a partial upload.
        let original = read(&index_path).await?;
        let rewritten = rewrite::rewrite_document(&original, out_dir)?;
        if rewritten.changed {
            info!("Rewrote asset references in index.html");
        }
        let html = rewrite::ensure_doctype(rewritten.html);

        let prefix = bundle_prefix(component, version);
        info!(prefix = %prefix, out_dir = %out_dir.display(), "Publishing bundle");

        let assets = out_dir.join(ASSETS_DIR);
        let asset_files = if assets.is_dir() {
            walk_files(&assets).await.map_err(|source| PublishError::Read {
                path: assets.clone(),
                source,
            })?
        } else {
            Vec::new()
        };
        let root_files = list_files(out_dir).await.map_err(|source| PublishError::Read {
            path: out_dir.to_path_buf(),
            source,
        })?;

        let mut uploaded = 0usize;
        for path in asset_files.iter().chain(root_files.iter()) {
            let Ok(rel) = path.strip_prefix(out_dir) else {
                continue;
            };
            let suffix = match classify(rel) {
                Placement::AssetFile(suffix) | Placement::RootFile(suffix) => suffix,
                Placement::Skip => {
                    debug!(path = %rel.display(), "Skipping file");
                    continue;
                }
            };
            let body = read(path).await?;
            self.upload(&format!("{prefix}{suffix}"), body, content_type::resolve(rel))
                .await?;
            uploaded += 1;
        }

        let index_key = format!("{prefix}{ENTRY_DOCUMENT}");
        self.upload(&index_key, html, HTML).await?;
        uploaded += 1;

        let url = self.store.public_url(&index_key);
        info!(files = uploaded, url = %url, "Published bundle");
        Ok(url)
    }

    async fn upload(
        &self,
        key: &str,
        body: Vec<u8>,
        content_type: &str,
    ) -> Result<(), PublishError> {
        debug!(key, content_type, bytes = body.len(), "Uploading object");
        self.store
            .put(key, body, content_type)
            .await
            .map_err(|source| PublishError::Upload {
                key: key.to_string(),
                source,
            })?;
        self.ensure_content_type(key, content_type).await;
        Ok(())
    }

    /// Best-effort: some backends drop the content type of streamed uploads,
    /// so the stored value is checked and patched server-side when it differs.
    /// Returns whether a patch was issued. Errors are logged, never returned.
    pub async fn ensure_content_type(&self, key: &str, expected: &str) -> bool {
        let stored = match self.store.content_type(key).await {
            Ok(stored) => stored,
            Err(e) => {
                warn!(key, error = %e, "Could not read stored content type");
                return false;
            }
        };
        if stored
            .as_deref()
            .is_some_and(|ct| ct.eq_ignore_ascii_case(expected))
        {
            return false;
        }

        debug!(key, ?stored, expected, "Patching content type");
        if let Err(e) = self.store.set_content_type(key, expected).await {
            warn!(key, error = %e, "Failed to patch content type");
            return false;
        }
        true
    }
}

async fn read(path: &Path) -> Result<Vec<u8>, PublishError> {
    tokio::fs::read(path)
        .await
        .map_err(|source| PublishError::Read {
            path: path.to_path_buf(),
            source,
        })
}

/// Every regular file below `dir`, sorted.
async fn walk_files(dir: &Path) -> io::Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    let mut pending = vec![dir.to_path_buf()];
    while let Some(dir) = pending.pop() {
        let mut entries = tokio::fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let file_type = entry.file_type().await?;
            if file_type.is_dir() {
                pending.push(entry.path());
            } else if file_type.is_file() {
                files.push(entry.path());
            }
        }
    }
    files.sort();
    Ok(files)
}

/// Regular files directly inside `dir`, sorted.
async fn list_files(dir: &Path) -> io::Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    let mut entries = tokio::fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        if entry.file_type().await?.is_file() {
            files.push(entry.path());
        }
    }
    files.sort();
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_assets_recursively_and_root_shallowly() {
        assert_eq!(
            classify(Path::new("assets/a.css")),
            Placement::AssetFile("assets/a.css".into())
        );
        assert_eq!(
            classify(Path::new("assets/fonts/inter/x.woff2")),
            Placement::AssetFile("assets/fonts/inter/x.woff2".into())
        );
        assert_eq!(
            classify(Path::new("favicon.ico")),
            Placement::RootFile("favicon.ico".into())
        );
        assert_eq!(classify(Path::new("index.html")), Placement::Skip);
        assert_eq!(classify(Path::new("img/logo.png")), Placement::Skip);
        assert_eq!(classify(Path::new("../secret")), Placement::Skip);
        assert_eq!(classify(Path::new("")), Placement::Skip);
    }

    #[test]
    fn nested_index_is_an_asset() {
        assert_eq!(
            classify(Path::new("assets/index.html")),
            Placement::AssetFile("assets/index.html".into())
        );
    }

    #[test]
    fn public_url_inserts_bucket_once() {
        let key = "components/btn/1.0.0/index.html";
        assert_eq!(
            public_url("https://cdn.example.com", "bundles", key),
            "https://cdn.example.com/bundles/components/btn/1.0.0/index.html"
        );
        assert_eq!(
            public_url("https://cdn.example.com/bundles/", "bundles", key),
            "https://cdn.example.com/bundles/components/btn/1.0.0/index.html"
        );
        assert_eq!(
            public_url("localhost:9000", "bundles", &format!("/{key}")),
            "http://localhost:9000/bundles/components/btn/1.0.0/index.html"
        );
        assert_eq!(
            public_url("https://cdn.example.com/static", "bundles", key),
            "https://cdn.example.com/static/bundles/components/btn/1.0.0/index.html"
        );
        assert_eq!(
            public_url("https://cdn.example.com/bundles-eu", "bundles", key),
            "https://cdn.example.com/bundles-eu/bundles/components/btn/1.0.0/index.html"
        );
    }
}
