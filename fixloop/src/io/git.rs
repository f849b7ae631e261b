//! Git adapter for repository source acquisition.
//!
//! Remote sources are cloned into a fresh directory under `repos_dir`; an
//! existing clone is never reused or overwritten.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tracing::{info, instrument, warn};

use crate::io::process::run_command_with_timeout;

/// Obtains a local working copy for a remote repository.
pub trait SourceAcquirer {
    /// Clone `remote` into a fresh directory named after `name` and return its path.
    fn acquire(&self, remote: &str, name: &str, timeout: Duration) -> Result<PathBuf>;
}

/// Wrapper for executing git commands in a working directory.
#[derive(Debug, Clone)]
pub struct Git {
    workdir: PathBuf,
}

impl Git {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
        }
    }

    /// Return the current HEAD short SHA.
    pub fn head_short_sha(&self, len: usize) -> Result<String> {
        let arg = format!("--short={len}");
        let out = self.run_capture(&["rev-parse", &arg, "HEAD"])?;
        Ok(out.trim().to_string())
    }

    fn run_capture(&self, args: &[&str]) -> Result<String> {
        let output = self.run_checked(args)?;
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    fn run_checked(&self, args: &[&str]) -> Result<Output> {
        let output = self.run(args)?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow!("git {} failed: {}", args.join(" "), stderr.trim()));
        }
        Ok(output)
    }

    fn run(&self, args: &[&str]) -> Result<Output> {
        Command::new("git")
            .args(args)
            .current_dir(&self.workdir)
            .output()
            .with_context(|| format!("spawn git {}", args.join(" ")))
    }
}

/// Return `parent/name_<n>` for the first `n >= 1` that does not exist yet.
pub fn allocate_unique_dir(parent: &Path, name: &str) -> PathBuf {
    let mut n = 1u32;
    loop {
        let candidate = parent.join(format!("{name}_{n}"));
        if !candidate.exists() {
            return candidate;
        }
        n += 1;
    }
}

/// Clones remotes with the `git` binary.
#[derive(Debug, Clone)]
pub struct GitAcquirer {
    pub repos_dir: PathBuf,
    pub output_limit_bytes: usize,
}

impl SourceAcquirer for GitAcquirer {
    #[instrument(skip_all, fields(remote = %remote, timeout_secs = timeout.as_secs()))]
    fn acquire(&self, remote: &str, name: &str, timeout: Duration) -> Result<PathBuf> {
        fs::create_dir_all(&self.repos_dir)
            .with_context(|| format!("create repos dir {}", self.repos_dir.display()))?;
        let dest = allocate_unique_dir(&self.repos_dir, name);
        info!(remote, dest = %dest.display(), "cloning repository");

        let mut cmd = Command::new("git");
        cmd.arg("clone").arg("--quiet").arg(remote).arg(&dest);
        let output = run_command_with_timeout(cmd, None, timeout, self.output_limit_bytes)
            .context("run git clone")?;
        output.ensure_finished("git clone", timeout)?;
        if !output.status.success() {
            warn!(exit_code = output.exit_code(), "git clone failed");
            return Err(anyhow!(
                "git clone {remote} failed: {}",
                output.stderr_text().trim()
            ));
        }
        Ok(dest)
    }
}
