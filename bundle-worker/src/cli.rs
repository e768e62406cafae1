//! Command-line interface of `bundle-worker`.
//!
//! - `run`: poll the job store and process builds until shutdown.
//! - `enqueue`: queue a build for a component version.
//! - `status <job-id>`: print a job and its version state as JSON.
//!
//! Business logic lives in `bundle-worker-core`; this module only wires
//! configuration into adapters and routes subcommands.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use bundle_worker_core::contract::{BuildState, JobStore, NewBuildJob, SourceCoordinates};
use bundle_worker_core::credentials::TokenCipher;
use bundle_worker_core::processor::JobProcessor;
use bundle_worker_core::store::{S3ObjectStore, SqliteStore};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::load_config::{load_config, load_database_url};

/// Build worker for component bundles.
#[derive(Parser)]
#[clap(
    name = "bundle-worker",
    version,
    about = "Claim queued component builds, run them and publish static bundles"
)]
pub struct Cli {
    /// Optional YAML config file; environment variables take precedence
    #[clap(long, global = true)]
    pub config: Option<PathBuf>,

    #[clap(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Process queued jobs until SIGINT/SIGTERM
    Run,

    /// Queue a build job and mark its version as queued
    Enqueue {
        #[clap(long)]
        component_id: String,
        /// Component slug used in object keys
        #[clap(long)]
        component: String,
        #[clap(long)]
        version: String,
        /// Repository owner on the hosting provider
        #[clap(long)]
        owner: String,
        #[clap(long)]
        repo: String,
        /// Sub-directory of the repository to build
        #[clap(long, default_value = "")]
        path: String,
        /// Branch or tag
        #[clap(long = "ref", default_value = "")]
        reference: String,
        /// Pinned commit, preferred over --ref
        #[clap(long, default_value = "")]
        commit: String,
        /// User whose stored token authorizes the download
        #[clap(long, default_value = "")]
        owner_id: String,
    },

    /// Print a job as JSON
    Status { job_id: String },
}

#[derive(Serialize)]
struct StatusReport {
    job: bundle_worker_core::contract::BuildJob,
    version: Option<bundle_worker_core::store::VersionRecord>,
}

/// Async entrypoint shared by `main` and integration tests.
pub async fn run(cli: Cli, shutdown: CancellationToken) -> Result<()> {
    tracing::info!("trace_initialised");
    let config_path = cli.config.as_deref();

    match cli.command {
        Commands::Run => {
            let config = load_config(config_path)?;
            config.processor.trace_loaded();

            let store = SqliteStore::connect(&config.database_url)
                .await
                .context("failed to open job store")?;
            let cipher = config
                .token_key
                .as_deref()
                .map(TokenCipher::from_key)
                .transpose()
                .context("invalid TOKEN_ENC_KEY")?;
            if cipher.is_none() {
                tracing::warn!("TOKEN_ENC_KEY not set, private repositories cannot be fetched");
            }
            let credentials = store.credentials(cipher);
            let objects = S3ObjectStore::new(config.storage).context("invalid S3 settings")?;

            let processor = JobProcessor::new(
                config.processor,
                Arc::new(store),
                Arc::new(credentials),
                Arc::new(objects),
            );
            tracing::info!(command = "run", "Starting worker");
            processor.run(shutdown).await;
            Ok(())
        }
        Commands::Enqueue {
            component_id,
            component,
            version,
            owner,
            repo,
            path,
            reference,
            commit,
            owner_id,
        } => {
            let store = open_store(config_path).await?;
            let job = store
                .enqueue(NewBuildJob {
                    component_id,
                    component,
                    version,
                    owner_id,
                    source: SourceCoordinates {
                        owner,
                        repo,
                        path,
                        reference,
                        commit,
                    },
                })
                .await?;
            store
                .set_version_state(&job.component_id, &job.version, BuildState::Queued, None)
                .await?;
            tracing::info!(command = "enqueue", job_id = %job.id, "Job queued");
            println!("{}", job.id);
            Ok(())
        }
        Commands::Status { job_id } => {
            let store = open_store(config_path).await?;
            let job = store
                .get(&job_id)
                .await?
                .ok_or_else(|| anyhow!("job {job_id} not found"))?;
            let version = store.version(&job.component_id, &job.version).await?;
            println!(
                "{}",
                serde_json::to_string_pretty(&StatusReport { job, version })?
            );
            Ok(())
        }
    }
}

async fn open_store(config_path: Option<&std::path::Path>) -> Result<SqliteStore> {
    let url = load_database_url(config_path)?;
    SqliteStore::connect(&url)
        .await
        .context("failed to open job store")
}
