//! Repository acquisition: reuse a local checkout or shallow-clone a URL.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use tracing::{debug, info, instrument};

use crate::io::process::{ProcessRequest, run_bounded};

/// Directory name of the clone inside a run directory.
pub const CLONE_DIR_NAME: &str = "repo";

const CLONE_TIMEOUT: Duration = Duration::from_secs(600);
const CLONE_OUTPUT_LIMIT: usize = 64 * 1024;

/// Where analysis and remediation get their checkout from.
pub trait RepoSource {
    /// Existing local directory as-is, otherwise a fresh clone under `run_dir`.
    fn acquire(&self, input: &str, run_dir: &Path) -> Result<PathBuf> {
        let local = Path::new(input);
        if local.is_dir() {
            let path = local
                .canonicalize()
                .with_context(|| format!("resolve repo path {input}"))?;
            debug!(path = %path.display(), "using local repository");
            return Ok(path);
        }
        let target = run_dir.join(CLONE_DIR_NAME);
        self.clone_fresh(input, &target)?;
        Ok(target)
    }

    /// Always materialize a new copy at `target`, even for local inputs.
    fn clone_fresh(&self, input: &str, target: &Path) -> Result<()>;
}

/// `git clone --depth 1`.
#[derive(Debug, Clone, Copy, Default)]
pub struct GitCloneSource;

impl RepoSource for GitCloneSource {
    #[instrument(skip_all, fields(input = %input, target = %target.display()))]
    fn clone_fresh(&self, input: &str, target: &Path) -> Result<()> {
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create clone parent {}", parent.display()))?;
        }
        info!("cloning repository");
        let mut cmd = Command::new("git");
        cmd.arg("clone").arg("--depth").arg("1").arg(input).arg(target);
        let output = run_bounded(
            cmd,
            &ProcessRequest {
                timeout: CLONE_TIMEOUT,
                output_limit_bytes: CLONE_OUTPUT_LIMIT,
                ..ProcessRequest::default()
            },
        )
        .with_context(|| format!("run git clone {input}"))?;
        if output.timed_out {
            bail!("git clone {input} timed out after {}s", CLONE_TIMEOUT.as_secs());
        }
        if !output.status.success() {
            bail!(
                "git clone {input} failed ({:?}): {}",
                output.status.code(),
                output.stderr_lossy().trim()
            );
        }
        Ok(())
    }
}
