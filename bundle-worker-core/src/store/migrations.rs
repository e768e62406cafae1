/// Inline SQL migrations, applied in order and tracked in `_migrations`.
///
/// `component_versions` and `users` are owned by the API layer; only the
/// columns this worker reads or writes are declared here.
pub const MIGRATIONS: &[&str] = &[
    // 1: jobs
    r#"
CREATE TABLE IF NOT EXISTS build_jobs (
    id TEXT PRIMARY KEY,
    component_id TEXT NOT NULL,
    component TEXT NOT NULL,
    version TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'queued'
        CHECK (status IN ('queued', 'running', 'success', 'error')),
    owner_id TEXT NOT NULL DEFAULT '',
    source_owner TEXT NOT NULL,
    source_repo TEXT NOT NULL,
    source_path TEXT NOT NULL DEFAULT '',
    source_ref TEXT NOT NULL DEFAULT '',
    source_commit TEXT NOT NULL DEFAULT '',
    bundle_url TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    started_at TEXT,
    ended_at TEXT
);
"#,
    r#"
CREATE INDEX IF NOT EXISTS idx_build_jobs_status ON build_jobs(status, created_at);
"#,
    // 2: job logs, ordered by rowid
    r#"
CREATE TABLE IF NOT EXISTS build_job_logs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    job_id TEXT NOT NULL REFERENCES build_jobs(id) ON DELETE CASCADE,
    line TEXT NOT NULL,
    created_at TEXT NOT NULL
);
"#,
    r#"
CREATE INDEX IF NOT EXISTS idx_build_job_logs_job ON build_job_logs(job_id, id);
"#,
    // 3: version build state
    r#"
CREATE TABLE IF NOT EXISTS component_versions (
    component_id TEXT NOT NULL,
    version TEXT NOT NULL,
    build_state TEXT NOT NULL DEFAULT 'none',
    preview_url TEXT,
    updated_at TEXT NOT NULL,
    PRIMARY KEY (component_id, version)
);
"#,
    // 4: users with encrypted provider tokens
    r#"
CREATE TABLE IF NOT EXISTS users (
    id TEXT PRIMARY KEY,
    access_token_enc TEXT
);
"#,
];
