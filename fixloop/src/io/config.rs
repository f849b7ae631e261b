//! Pipeline configuration loaded from `fixloop.toml`.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Default config file name, looked up in the current directory.
pub const DEFAULT_CONFIG_FILE: &str = "fixloop.toml";

/// Pipeline configuration (TOML).
///
/// Missing fields default to values suitable for a local docker host.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PipelineConfig {
    /// Root directory for per-run artifacts (summary, logs, change logs).
    pub artifacts_dir: PathBuf,

    /// Directory that receives fresh clones of remote repositories.
    pub repos_dir: PathBuf,

    /// Structured test report location, relative to the working copy.
    pub report_path: String,

    /// Total wall-clock budget for one pipeline run.
    pub run_timeout_secs: u64,

    pub clone_timeout_secs: u64,
    pub build_timeout_secs: u64,
    pub test_timeout_secs: u64,
    pub fix_timeout_secs: u64,

    /// Truncate captured stdout/stderr beyond this many bytes per stream.
    pub output_limit_bytes: usize,

    pub docker: DockerConfig,
    pub fixer: FixerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct DockerConfig {
    /// Image used for build and test containers.
    pub image: String,
    /// Docker build context used when the image is missing.
    pub context_dir: PathBuf,
}

impl Default for DockerConfig {
    fn default() -> Self {
        Self {
            image: "ci-image".to_string(),
            context_dir: PathBuf::from("docker"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct FixerConfig {
    /// Agent command, extended with `--output-schema <path> --output-last-message <path> -`.
    pub command: Vec<String>,
    /// Propose one fix per suspected file concurrently.
    pub parallel: bool,
    /// Number of trailing test-log lines included in the prompt.
    pub log_tail_lines: usize,
}

impl Default for FixerConfig {
    fn default() -> Self {
        Self {
            command: vec![
                "codex".to_string(),
                "exec".to_string(),
                "--sandbox".to_string(),
                "read-only".to_string(),
                "--skip-git-repo-check".to_string(),
            ],
            parallel: false,
            log_tail_lines: 200,
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            artifacts_dir: PathBuf::from(".fixloop/runs"),
            repos_dir: PathBuf::from("repos"),
            report_path: "test-report.xml".to_string(),
            run_timeout_secs: 4 * 60 * 60,
            clone_timeout_secs: 10 * 60,
            build_timeout_secs: 30 * 60,
            test_timeout_secs: 30 * 60,
            fix_timeout_secs: 30 * 60,
            output_limit_bytes: 1_000_000,
            docker: DockerConfig::default(),
            fixer: FixerConfig::default(),
        }
    }
}

impl PipelineConfig {
    pub fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("run_timeout_secs", self.run_timeout_secs),
            ("clone_timeout_secs", self.clone_timeout_secs),
            ("build_timeout_secs", self.build_timeout_secs),
            ("test_timeout_secs", self.test_timeout_secs),
            ("fix_timeout_secs", self.fix_timeout_secs),
        ] {
            if value == 0 {
                return Err(anyhow!("{name} must be > 0"));
            }
        }
        if self.output_limit_bytes == 0 {
            return Err(anyhow!("output_limit_bytes must be > 0"));
        }
        let report = Path::new(&self.report_path);
        if self.report_path.trim().is_empty() || report.is_absolute() {
            return Err(anyhow!(
                "report_path must be a non-empty path relative to the working copy"
            ));
        }
        if self.docker.image.trim().is_empty() {
            return Err(anyhow!("docker.image must not be empty"));
        }
        if self.fixer.command.is_empty() || self.fixer.command[0].trim().is_empty() {
            return Err(anyhow!("fixer.command must be a non-empty array"));
        }
        Ok(())
    }

    pub fn run_timeout(&self) -> Duration {
        Duration::from_secs(self.run_timeout_secs)
    }

    pub fn clone_timeout(&self) -> Duration {
        Duration::from_secs(self.clone_timeout_secs)
    }

    pub fn build_timeout(&self) -> Duration {
        Duration::from_secs(self.build_timeout_secs)
    }

    pub fn test_timeout(&self) -> Duration {
        Duration::from_secs(self.test_timeout_secs)
    }

    pub fn fix_timeout(&self) -> Duration {
        Duration::from_secs(self.fix_timeout_secs)
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `PipelineConfig::default()`.
pub fn load_config(path: &Path) -> Result<PipelineConfig> {
    if !path.exists() {
        debug!(path = %path.display(), "config missing, using defaults");
        let cfg = PipelineConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: PipelineConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("validate {}", path.display()))?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &PipelineConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    let parent = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("toml.tmp");
    fs::write(&tmp_path, buf)
        .with_context(|| format!("write temp config {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace config {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_missing_returns_default() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cfg = load_config(&temp.path().join("missing.toml")).expect("load");
        assert_eq!(cfg, PipelineConfig::default());
    }

    #[test]
    fn write_then_load_round_trips() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("fixloop.toml");
        let cfg = PipelineConfig {
            report_path: "build/junit.xml".to_string(),
            fixer: FixerConfig {
                parallel: true,
                ..FixerConfig::default()
            },
            ..PipelineConfig::default()
        };
        write_config(&path, &cfg).expect("write");
        let loaded = load_config(&path).expect("load");
        assert_eq!(loaded, cfg);
    }

    #[test]
    fn partial_file_keeps_defaults() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("fixloop.toml");
        fs::write(&path, "test_timeout_secs = 60\n[docker]\nimage = \"py-ci\"\n").expect("write");

        let cfg = load_config(&path).expect("load");
        assert_eq!(cfg.test_timeout(), Duration::from_secs(60));
        assert_eq!(cfg.docker.image, "py-ci");
        assert_eq!(cfg.docker.context_dir, PathBuf::from("docker"));
        assert_eq!(cfg.build_timeout_secs, PipelineConfig::default().build_timeout_secs);
    }

    #[test]
    fn rejects_invalid_values() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("fixloop.toml");
        fs::write(&path, "build_timeout_secs = 0\n").expect("write");
        let err = load_config(&path).unwrap_err();
        assert!(format!("{err:#}").contains("build_timeout_secs must be > 0"));

        let cfg = PipelineConfig {
            report_path: "/abs/report.xml".to_string(),
            ..PipelineConfig::default()
        };
        assert!(cfg.validate().is_err());

        let cfg = PipelineConfig {
            fixer: FixerConfig {
                command: Vec::new(),
                ..FixerConfig::default()
            },
            ..PipelineConfig::default()
        };
        assert!(cfg.validate().is_err());
    }
}
