use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow, SqliteSynchronous,
};
use sqlx::{Row, SqlitePool};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::migrations::MIGRATIONS;
use crate::contract::{
    Artifact, BuildJob, BuildState, CredentialStore, JobStatus, JobStore, NewBuildJob,
    SourceCoordinates,
};
use crate::credentials::TokenCipher;
use crate::error::StoreError;

const JOB_COLUMNS: &str = "id, component_id, component, version, status, owner_id, \
    source_owner, source_repo, source_path, source_ref, source_commit, bundle_url, \
    created_at, updated_at, started_at, ended_at";

/// SQLite-backed [`JobStore`].
#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Connect using a `sqlite:` URL such as `DATABASE_URL`.
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let in_memory = url.contains(":memory:");
        let mut options = SqliteConnectOptions::from_str(url)?
            .create_if_missing(true)
            .busy_timeout(Duration::from_secs(30));
        if !in_memory {
            options = options
                .journal_mode(SqliteJournalMode::Wal)
                .synchronous(SqliteSynchronous::Normal);
        }
        // Every in-memory connection is its own database.
        let max_connections = if in_memory { 1 } else { 4 };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.run_migrations().await?;
        info!(url, "Job store opened");
        Ok(store)
    }

    /// Open (or create) a database file.
    pub async fn open_file(path: &Path) -> Result<Self, StoreError> {
        Self::connect(&format!("sqlite:{}", path.display())).await
    }

    /// Create an in-memory database (for testing).
    pub async fn in_memory() -> Result<Self, StoreError> {
        Self::connect("sqlite::memory:").await
    }

    /// Credential store sharing this database.
    pub fn credentials(&self, cipher: Option<TokenCipher>) -> SqliteCredentialStore {
        SqliteCredentialStore {
            pool: self.pool.clone(),
            cipher,
        }
    }

    async fn run_migrations(&self) -> Result<(), StoreError> {
        sqlx::query("CREATE TABLE IF NOT EXISTS _migrations (version INTEGER PRIMARY KEY)")
            .execute(&self.pool)
            .await?;
        let (current,): (i64,) =
            sqlx::query_as("SELECT COALESCE(MAX(version), 0) FROM _migrations")
                .fetch_one(&self.pool)
                .await?;

        for (i, migration) in MIGRATIONS.iter().enumerate() {
            let version = i as i64 + 1;
            if version <= current {
                continue;
            }
            sqlx::query(migration).execute(&self.pool).await?;
            sqlx::query("INSERT INTO _migrations (version) VALUES (?)")
                .bind(version)
                .execute(&self.pool)
                .await?;
            debug!(version, "Applied migration");
        }
        Ok(())
    }

    /// Current build state of a component version, if the record exists.
    pub async fn version(
        &self,
        component_id: &str,
        version: &str,
    ) -> Result<Option<VersionRecord>, StoreError> {
        let row = sqlx::query(
            "SELECT component_id, version, build_state, preview_url \
             FROM component_versions WHERE component_id = ? AND version = ?",
        )
        .bind(component_id)
        .bind(version)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| -> Result<VersionRecord, StoreError> {
            let state: String = row.try_get("build_state")?;
            Ok(VersionRecord {
                component_id: row.try_get("component_id")?,
                version: row.try_get("version")?,
                build_state: state.parse()?,
                preview_url: row.try_get("preview_url")?,
            })
        })
        .transpose()
    }

    async fn logs(&self, job_id: &str) -> Result<Vec<String>, StoreError> {
        let lines: Vec<(String,)> =
            sqlx::query_as("SELECT line FROM build_job_logs WHERE job_id = ? ORDER BY id")
                .bind(job_id)
                .fetch_all(&self.pool)
                .await?;
        Ok(lines.into_iter().map(|(line,)| line).collect())
    }

    async fn finish(
        &self,
        job_id: &str,
        to: JobStatus,
        bundle_url: Option<String>,
    ) -> Result<(), StoreError> {
        let transition_error = || StoreError::Transition {
            job_id: job_id.to_string(),
            to: to.to_string(),
        };
        let from = JobStatus::Running;
        if !from.can_transition_to(to) {
            return Err(transition_error());
        }

        let now = timestamp(Utc::now());
        let result = sqlx::query(
            "UPDATE build_jobs SET status = ?, bundle_url = COALESCE(?, bundle_url), \
             ended_at = ?, updated_at = ? WHERE id = ? AND status = ?",
        )
        .bind(to.as_str())
        .bind(bundle_url)
        .bind(&now)
        .bind(&now)
        .bind(job_id)
        .bind(from.as_str())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(transition_error());
        }
        Ok(())
    }
}

/// Build state of one component version.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct VersionRecord {
    pub component_id: String,
    pub version: String,
    pub build_state: BuildState,
    pub preview_url: Option<String>,
}

#[derive(Debug)]
struct JobRow {
    id: String,
    component_id: String,
    component: String,
    version: String,
    status: String,
    owner_id: String,
    source_owner: String,
    source_repo: String,
    source_path: String,
    source_ref: String,
    source_commit: String,
    bundle_url: Option<String>,
    created_at: String,
    updated_at: String,
    started_at: Option<String>,
    ended_at: Option<String>,
}

impl<'r> sqlx::FromRow<'r, SqliteRow> for JobRow {
    fn from_row(row: &'r SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            component_id: row.try_get("component_id")?,
            component: row.try_get("component")?,
            version: row.try_get("version")?,
            status: row.try_get("status")?,
            owner_id: row.try_get("owner_id")?,
            source_owner: row.try_get("source_owner")?,
            source_repo: row.try_get("source_repo")?,
            source_path: row.try_get("source_path")?,
            source_ref: row.try_get("source_ref")?,
            source_commit: row.try_get("source_commit")?,
            bundle_url: row.try_get("bundle_url")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
            started_at: row.try_get("started_at")?,
            ended_at: row.try_get("ended_at")?,
        })
    }
}

impl JobRow {
    fn into_job(self, logs: Vec<String>) -> Result<BuildJob, StoreError> {
        Ok(BuildJob {
            status: self.status.parse()?,
            created_at: parse_timestamp(&self.created_at)?,
            updated_at: parse_timestamp(&self.updated_at)?,
            started_at: self.started_at.as_deref().map(parse_timestamp).transpose()?,
            ended_at: self.ended_at.as_deref().map(parse_timestamp).transpose()?,
            artifact: self.bundle_url.map(|bundle_url| Artifact { bundle_url }),
            source: SourceCoordinates {
                owner: self.source_owner,
                repo: self.source_repo,
                path: self.source_path,
                reference: self.source_ref,
                commit: self.source_commit,
            },
            id: self.id,
            component_id: self.component_id,
            component: self.component,
            version: self.version,
            owner_id: self.owner_id,
            logs,
        })
    }
}

#[async_trait]
impl JobStore for SqliteStore {
    async fn enqueue(&self, job: NewBuildJob) -> Result<BuildJob, StoreError> {
        let id = Uuid::new_v4().to_string();
        let now = timestamp(Utc::now());
        sqlx::query(
            "INSERT INTO build_jobs (id, component_id, component, version, status, owner_id, \
             source_owner, source_repo, source_path, source_ref, source_commit, \
             created_at, updated_at) \
             VALUES (?, ?, ?, ?, 'queued', ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&id)
        .bind(&job.component_id)
        .bind(&job.component)
        .bind(&job.version)
        .bind(&job.owner_id)
        .bind(&job.source.owner)
        .bind(&job.source.repo)
        .bind(&job.source.path)
        .bind(&job.source.reference)
        .bind(&job.source.commit)
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await?;

        debug!(job_id = %id, component = %job.component, version = %job.version, "Enqueued job");
        self.get(&id)
            .await?
            .ok_or_else(|| StoreError::Corrupt(format!("job {id} vanished after insert")))
    }

    async fn get(&self, job_id: &str) -> Result<Option<BuildJob>, StoreError> {
        let row: Option<JobRow> =
            sqlx::query_as(&format!("SELECT {JOB_COLUMNS} FROM build_jobs WHERE id = ?"))
                .bind(job_id)
                .fetch_optional(&self.pool)
                .await?;
        match row {
            Some(row) => {
                let logs = self.logs(job_id).await?;
                row.into_job(logs).map(Some)
            }
            None => Ok(None),
        }
    }

    async fn claim_next(&self) -> Result<Option<BuildJob>, StoreError> {
        let now = timestamp(Utc::now());
        // Single statement: the status re-check makes the transition a
        // compare-and-swap even if two writers picked the same id.
        let row: Option<JobRow> = sqlx::query_as(&format!(
            "UPDATE build_jobs SET status = 'running', started_at = ?, updated_at = ? \
             WHERE id = (SELECT id FROM build_jobs WHERE status = 'queued' \
                         ORDER BY created_at, rowid LIMIT 1) \
               AND status = 'queued' \
             RETURNING {JOB_COLUMNS}"
        ))
        .bind(&now)
        .bind(&now)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => {
                let logs = self.logs(&row.id).await?;
                row.into_job(logs).map(Some)
            }
            None => Ok(None),
        }
    }

    async fn append_log(&self, job_id: &str, line: &str) -> Result<(), StoreError> {
        let now = timestamp(Utc::now());
        sqlx::query("INSERT INTO build_job_logs (job_id, line, created_at) VALUES (?, ?, ?)")
            .bind(job_id)
            .bind(line)
            .bind(&now)
            .execute(&self.pool)
            .await?;
        sqlx::query("UPDATE build_jobs SET updated_at = ? WHERE id = ?")
            .bind(&now)
            .bind(job_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn complete(&self, job_id: &str, artifact: Artifact) -> Result<(), StoreError> {
        self.finish(job_id, JobStatus::Success, Some(artifact.bundle_url))
            .await
    }

    async fn fail(&self, job_id: &str) -> Result<(), StoreError> {
        self.finish(job_id, JobStatus::Error, None).await
    }

    async fn count_queued(&self) -> Result<u64, StoreError> {
        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM build_jobs WHERE status = 'queued'")
                .fetch_one(&self.pool)
                .await?;
        Ok(count.max(0) as u64)
    }

    async fn set_version_state(
        &self,
        component_id: &str,
        version: &str,
        state: BuildState,
        preview_url: Option<String>,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO component_versions (component_id, version, build_state, preview_url, updated_at) \
             VALUES (?, ?, ?, ?, ?) \
             ON CONFLICT (component_id, version) DO UPDATE SET \
                build_state = excluded.build_state, \
                preview_url = COALESCE(excluded.preview_url, component_versions.preview_url), \
                updated_at = excluded.updated_at",
        )
        .bind(component_id)
        .bind(version)
        .bind(state.as_str())
        .bind(preview_url)
        .bind(timestamp(Utc::now()))
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

/// Per-user provider tokens, stored encrypted in the `users` table.
#[derive(Debug, Clone)]
pub struct SqliteCredentialStore {
    pool: SqlitePool,
    cipher: Option<TokenCipher>,
}

impl SqliteCredentialStore {
    /// Encrypt and store `token` for `owner_id`, creating the user row if needed.
    pub async fn put_user_token(&self, owner_id: &str, token: &str) -> Result<(), StoreError> {
        let cipher = self.cipher.as_ref().ok_or(StoreError::MissingKey)?;
        let sealed = cipher.encrypt(token)?;
        sqlx::query(
            "INSERT INTO users (id, access_token_enc) VALUES (?, ?) \
             ON CONFLICT (id) DO UPDATE SET access_token_enc = excluded.access_token_enc",
        )
        .bind(owner_id)
        .bind(sealed)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl CredentialStore for SqliteCredentialStore {
    async fn access_token(&self, owner_id: &str) -> Result<Option<String>, StoreError> {
        let sealed: Option<(Option<String>,)> =
            sqlx::query_as("SELECT access_token_enc FROM users WHERE id = ?")
                .bind(owner_id)
                .fetch_optional(&self.pool)
                .await?;
        let Some(sealed) = sealed.and_then(|(token,)| token).filter(|t| !t.is_empty()) else {
            return Ok(None);
        };
        let Some(cipher) = &self.cipher else {
            warn!(owner_id, "User has a stored token but no encryption key is configured");
            return Ok(None);
        };
        match cipher.decrypt(&sealed) {
            Ok(token) => Ok(Some(token)),
            Err(e) => {
                warn!(owner_id, error = %e, "Stored token could not be decrypted");
                Ok(None)
            }
        }
    }
}

fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn parse_timestamp(value: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(value)
        .map(|at| at.with_timezone(&Utc))
        .map_err(|e| StoreError::Corrupt(format!("bad timestamp {value:?}: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_job() -> NewBuildJob {
        NewBuildJob {
            component_id: "cmp-1".into(),
            component: "btn".into(),
            version: "1.0.0".into(),
            owner_id: "user-1".into(),
            source: SourceCoordinates {
                owner: "acme".into(),
                repo: "ui".into(),
                path: String::new(),
                reference: "main".into(),
                commit: String::new(),
            },
        }
    }

    #[tokio::test]
    async fn finish_rejects_non_terminal_targets() {
        let store = SqliteStore::in_memory().await.unwrap();
        let job = store.enqueue(new_job()).await.unwrap();
        store.claim_next().await.unwrap().unwrap();

        for to in [JobStatus::Queued, JobStatus::Running] {
            let err = store.finish(&job.id, to, None).await.unwrap_err();
            assert!(matches!(err, StoreError::Transition { .. }), "{err}");
        }
        let job = store.get(&job.id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Running);
    }
}
