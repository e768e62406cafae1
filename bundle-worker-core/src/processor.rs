//! # processor: claim queued jobs and drive them to a terminal state
//!
//! One [`JobProcessor`] handles at most one job at a time. Every poll tick
//! it atomically claims a queued job through [`JobStore::claim_next`] and
//! runs it to completion before polling again:
//!
//! 1. fetch: download and extract the repository archive ([`SourceFetcher`])
//! 2. build: run the toolchain and locate the output ([`BuildRunner`])
//! 3. annotate: insert component metadata into `index.html`
//! 4. publish: upload the bundle with rewritten references ([`Publisher`])
//! 5. finalize: job `success` + version `ready`, or job `error` + version `error`
//!
//! Any stage error ends the job through a single failure path. Nothing is
//! retried; a new job must be queued to try again.
//!
//! Cancellation is observed between polls only. A job in progress always
//! runs to its terminal state.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::time::{interval, interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::annotate::{self, ComponentMeta};
use crate::build_runner::{BuildRunner, ENTRY_DOCUMENT};
use crate::config::ProcessorConfig;
use crate::contract::{
    Artifact, BuildJob, BuildState, CredentialStore, JobStatus, JobStore, ObjectStore,
};
use crate::download::{self, SourceFetcher};
use crate::error::{JobError, StoreError};
use crate::job_log::JobLog;
use crate::publish::{bundle_prefix, Publisher};

pub struct JobProcessor {
    jobs: Arc<dyn JobStore>,
    objects: Arc<dyn ObjectStore>,
    fetcher: SourceFetcher,
    runner: BuildRunner,
    publisher: Publisher,
    config: ProcessorConfig,
}

impl JobProcessor {
    pub fn new(
        config: ProcessorConfig,
        jobs: Arc<dyn JobStore>,
        credentials: Arc<dyn CredentialStore>,
        objects: Arc<dyn ObjectStore>,
    ) -> Self {
        Self {
            fetcher: SourceFetcher::new(config.source_api_base.clone(), credentials),
            runner: BuildRunner::new(config.toolchain.clone()),
            publisher: Publisher::new(objects.clone()),
            jobs,
            objects,
            config,
        }
    }

    /// Atomically take one queued job, if any.
    pub async fn claim_next(&self) -> Result<Option<BuildJob>, StoreError> {
        self.jobs.claim_next().await
    }

    /// Poll until `cancel` fires.
    pub async fn run(&self, cancel: CancellationToken) {
        let mut poll = interval(self.config.poll_interval);
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let heartbeat_every = self.config.heartbeat_interval;
        let mut heartbeat = interval_at(Instant::now() + heartbeat_every, heartbeat_every);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            poll_interval_ms = self.config.poll_interval.as_millis() as u64,
            "Worker started"
        );
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = heartbeat.tick() => match self.jobs.count_queued().await {
                    Ok(queued) => info!(queued, "Heartbeat"),
                    Err(e) => warn!(error = %e, "Heartbeat could not count queued jobs"),
                },
                _ = poll.tick() => {
                    if let Err(e) = self.run_once().await {
                        warn!(error = %e, "Poll failed");
                    }
                }
            }
        }
        info!("Worker stopped");
    }

    /// Claim and process one job. `None` when the queue was empty.
    pub async fn run_once(&self) -> Result<Option<JobStatus>, StoreError> {
        match self.claim_next().await? {
            Some(job) => self.process(&job).await.map(Some),
            None => Ok(None),
        }
    }

    /// Drive a claimed (running) job to its terminal status.
    pub async fn process(&self, job: &BuildJob) -> Result<JobStatus, StoreError> {
        info!(
            job_id = %job.id,
            component = %job.component,
            version = %job.version,
            "Processing job"
        );
        let log = JobLog::new(self.jobs.clone(), job.id.clone());
        self.mirror_version(job, JobStatus::Running, None).await;

        let work_root = self.config.scratch_dir.join(format!("job-{}", job.id));
        let outcome = self.execute(job, &log, &work_root).await;
        let status = match outcome {
            Ok(bundle_url) => self.succeed(job, &log, bundle_url).await,
            Err(err) => self.fail(job, &log, err).await,
        };

        if let Err(e) = tokio::fs::remove_dir_all(&work_root).await {
            debug!(path = %work_root.display(), error = %e, "Scratch directory not removed");
        }
        status
    }

    async fn execute(
        &self,
        job: &BuildJob,
        log: &JobLog,
        work_root: &Path,
    ) -> Result<String, JobError> {
        log.push("picked by worker").await;
        prepare_workspace(work_root)
            .await
            .map_err(JobError::Workspace)?;

        log.push(format!(
            "downloading {}/{}@{}",
            job.source.owner,
            job.source.repo,
            job.source.selected_ref()
        ))
        .await;
        let archive = self
            .fetcher
            .download_archive(work_root, &job.source, &job.owner_id)
            .await
            .map_err(JobError::Download)?;

        log.push("extracting archive").await;
        let top_dir = download::extract(archive, work_root.to_path_buf())
            .await
            .map_err(JobError::Extract)?;
        let working = download::resolve_working_dir(&top_dir, &job.source.path)?;

        log.push("running build").await;
        let out_dir = self.runner.run(&working, log).await?;
        log.push(format!("build output: {}", display_relative(&out_dir, &top_dir)))
            .await;

        let index = out_dir.join(ENTRY_DOCUMENT);
        match annotate::annotate_file(&index, &ComponentMeta::from(job)).await {
            Ok(true) => log.push("annotated index.html with component metadata").await,
            Ok(false) => {
                log.push("[WARN] index.html has no </head>, metadata not inserted")
                    .await
            }
            Err(e) => {
                log.push(format!("[WARN] index.html annotation skipped: {e}"))
                    .await
            }
        }

        log.push("uploading bundle").await;
        let bundle_url = self
            .publisher
            .publish(&job.component, &job.version, &out_dir)
            .await?;
        log.push(format!("uploaded, bundle URL: {bundle_url}")).await;

        let prefix = bundle_prefix(&job.component, &job.version);
        match self.objects.list(&prefix).await {
            Ok(keys) => log.push(format!("{} objects under {prefix}", keys.len())).await,
            Err(e) => warn!(job_id = %job.id, error = %e, "Could not list published objects"),
        }
        Ok(bundle_url)
    }

    async fn succeed(
        &self,
        job: &BuildJob,
        log: &JobLog,
        bundle_url: String,
    ) -> Result<JobStatus, StoreError> {
        let artifact = Artifact {
            bundle_url: bundle_url.clone(),
        };
        if let Err(e) = self.jobs.complete(&job.id, artifact).await {
            return self.fail(job, log, JobError::Finalize(e)).await;
        }
        log.push("build complete").await;
        self.mirror_version(job, JobStatus::Success, Some(bundle_url))
            .await;
        Ok(JobStatus::Success)
    }

    /// The single failure path for every stage.
    async fn fail(
        &self,
        job: &BuildJob,
        log: &JobLog,
        err: JobError,
    ) -> Result<JobStatus, StoreError> {
        error!(job_id = %job.id, error = %err, "Job failed");
        log.push_quiet(&format!("ERROR: {err}")).await;
        let recorded = self.jobs.fail(&job.id).await;
        self.mirror_version(job, JobStatus::Error, None).await;
        recorded?;
        Ok(JobStatus::Error)
    }

    /// Version state is a derived mirror; a failed write is logged only.
    async fn mirror_version(&self, job: &BuildJob, status: JobStatus, preview_url: Option<String>) {
        let state = BuildState::from(status);
        if let Err(e) = self
            .jobs
            .set_version_state(&job.component_id, &job.version, state, preview_url)
            .await
        {
            warn!(
                job_id = %job.id,
                component_id = %job.component_id,
                version = %job.version,
                %state,
                error = %e,
                "Failed to update version build state"
            );
        }
    }
}

async fn prepare_workspace(work_root: &Path) -> std::io::Result<()> {
    match tokio::fs::remove_dir_all(work_root).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e),
    }
    tokio::fs::create_dir_all(work_root).await
}

fn display_relative(path: &Path, base: &Path) -> String {
    let rel: PathBuf = path
        .strip_prefix(base)
        .map(Path::to_path_buf)
        .unwrap_or_else(|_| path.to_path_buf());
    if rel.as_os_str().is_empty() {
        ".".to_string()
    } else {
        rel.display().to_string()
    }
}
