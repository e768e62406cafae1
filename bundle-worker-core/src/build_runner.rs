//! Build invocation with live log capture.
//!
//! When the working directory carries a package manifest the configured
//! toolchain steps run in order (by default `npm ci` then `npm run build`).
//! Every stdout/stderr line is echoed through tracing and appended to the job
//! log as `[tool] ...` or `[tool ERROR] ...`.

use std::io;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tracing::{debug, info};

use crate::job_log::JobLog;

pub const MANIFEST: &str = "package.json";
pub const ENTRY_DOCUMENT: &str = "index.html";

/// Output directories checked before the working root, in order.
const OUTPUT_DIRS: [&str; 2] = ["dist", "build"];

#[derive(Debug, Error)]
pub enum BuildError {
    #[error("empty build step in toolchain")]
    EmptyStep,

    #[error("failed to start command {step:?}: {source}")]
    Spawn {
        step: Vec<String>,
        #[source]
        source: io::Error,
    },

    #[error("failed to read output of {step:?}: {source}")]
    Output {
        step: Vec<String>,
        #[source]
        source: io::Error,
    },

    #[error("node build failed on {step:?}: {status}")]
    Failed { step: Vec<String>, status: ExitStatus },

    #[error("no build output found (need package.json+build or index.html)")]
    NoOutput,
}

/// Ordered argv steps run when a package manifest is present.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Toolchain {
    pub steps: Vec<Vec<String>>,
}

impl Default for Toolchain {
    fn default() -> Self {
        let step = |args: &[&str]| args.iter().map(|a| a.to_string()).collect();
        Self {
            steps: vec![step(&["npm", "ci"]), step(&["npm", "run", "build"])],
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct BuildRunner {
    toolchain: Toolchain,
}

impl BuildRunner {
    pub fn new(toolchain: Toolchain) -> Self {
        Self { toolchain }
    }

    /// Build `working` and return the directory to publish.
    pub async fn run(&self, working: &Path, log: &JobLog) -> Result<PathBuf, BuildError> {
        let has_manifest = working.join(MANIFEST).is_file();
        if has_manifest {
            for step in &self.toolchain.steps {
                run_step(step, working, log).await?;
            }
        } else if working.join(ENTRY_DOCUMENT).is_file() {
            debug!(path = %working.display(), "No package manifest, treating as static site");
        } else {
            return Err(BuildError::NoOutput);
        }
        discover_output(working)
    }
}

/// Pick the directory to publish: `dist/`, then `build/`, then the working
/// root when it holds the entry document.
pub fn discover_output(working: &Path) -> Result<PathBuf, BuildError> {
    if let Some(dir) = OUTPUT_DIRS
        .iter()
        .map(|name| working.join(name))
        .find(|dir| dir.is_dir())
    {
        return Ok(dir);
    }
    if working.join(ENTRY_DOCUMENT).is_file() {
        return Ok(working.to_path_buf());
    }
    Err(BuildError::NoOutput)
}

async fn run_step(step: &[String], working: &Path, log: &JobLog) -> Result<(), BuildError> {
    let (program, args) = step.split_first().ok_or(BuildError::EmptyStep)?;
    info!(job_id = log.job_id(), ?step, cwd = %working.display(), "Running build step");

    let mut child = Command::new(program)
        .args(args)
        .current_dir(working)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|source| BuildError::Spawn {
            step: step.to_vec(),
            source,
        })?;

    let stdout_tag = format!("[{program}]");
    let stderr_tag = format!("[{program} ERROR]");
    let stdout = child.stdout.take();
    let stderr = child.stderr.take();

    // Both pipes must be drained before waiting, or a fast-exiting process
    // can lose buffered output.
    let (out, err) = tokio::join!(
        drain(stdout, &stdout_tag, log),
        drain(stderr, &stderr_tag, log)
    );
    let output_error = |source| BuildError::Output {
        step: step.to_vec(),
        source,
    };
    out.map_err(output_error)?;
    err.map_err(output_error)?;

    let status = child.wait().await.map_err(|source| BuildError::Output {
        step: step.to_vec(),
        source,
    })?;
    if !status.success() {
        return Err(BuildError::Failed {
            step: step.to_vec(),
            status,
        });
    }
    Ok(())
}

async fn drain<R>(reader: Option<R>, tag: &str, log: &JobLog) -> io::Result<()>
where
    R: AsyncRead + Unpin,
{
    let Some(reader) = reader else {
        return Ok(());
    };
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        if reader.read_until(b'\n', &mut buf).await? == 0 {
            return Ok(());
        }
        let line = String::from_utf8_lossy(&buf);
        let line = line.trim_end();
        if line.is_empty() {
            continue;
        }
        info!(target: "bundle_worker::build", job_id = log.job_id(), "{tag} {line}");
        log.push_quiet(&format!("{tag} {line}")).await;
    }
}
