//! Per-run artifact directory: summary, stage logs, fix inputs and change logs.
//!
//! Layout under `<artifacts_dir>/<repo>_<n>/`:
//!
//! ```text
//! summary.json
//! logs/build-<attempt>.log
//! logs/test-<attempt>-<try>.log
//! fixes/attempt-<n>/        prompt, agent output and agent log
//! patches/attempt-<n>.diff
//! ```

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Serialize;

use crate::core::types::{BuildResult, TestRunResult};
use crate::io::git::allocate_unique_dir;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunPaths {
    pub dir: PathBuf,
    pub summary_path: PathBuf,
    pub logs_dir: PathBuf,
}

impl RunPaths {
    pub fn new(dir: &Path) -> Self {
        Self {
            dir: dir.to_path_buf(),
            summary_path: dir.join("summary.json"),
            logs_dir: dir.join("logs"),
        }
    }

    pub fn build_log(&self, attempt: u32) -> PathBuf {
        self.logs_dir.join(format!("build-{attempt}.log"))
    }

    pub fn test_log(&self, attempt: u32, try_number: u32) -> PathBuf {
        self.logs_dir
            .join(format!("test-{attempt}-{try_number}.log"))
    }

    pub fn fix_dir(&self, attempt: u32) -> PathBuf {
        self.dir.join("fixes").join(format!("attempt-{attempt}"))
    }
}

/// Create a fresh run directory `<artifacts_dir>/<name>_<n>`.
pub fn create_run_dir(artifacts_dir: &Path, name: &str) -> Result<RunPaths> {
    fs::create_dir_all(artifacts_dir)
        .with_context(|| format!("create artifacts dir {}", artifacts_dir.display()))?;
    loop {
        let dir = allocate_unique_dir(artifacts_dir, name);
        match fs::create_dir(&dir) {
            Ok(()) => {
                let paths = RunPaths::new(&dir);
                fs::create_dir_all(&paths.logs_dir)
                    .with_context(|| format!("create {}", paths.logs_dir.display()))?;
                return Ok(paths);
            }
            // Another run claimed the same suffix; take the next one.
            Err(err) if err.kind() == ErrorKind::AlreadyExists => continue,
            Err(err) => {
                return Err(err).with_context(|| format!("create run dir {}", dir.display()));
            }
        }
    }
}

pub fn write_build_log(paths: &RunPaths, attempt: u32, build: &BuildResult) -> Result<PathBuf> {
    let path = paths.build_log(attempt);
    let kinds: Vec<&str> = build.project_kinds.iter().map(|k| k.as_str()).collect();
    let header = format!(
        "exit_code: {}\nproject_kinds: {}\n",
        build.exit_code,
        kinds.join(",")
    );
    write_streams(&path, &header, &build.stdout, &build.stderr)?;
    Ok(path)
}

pub fn write_test_log(
    paths: &RunPaths,
    attempt: u32,
    try_number: u32,
    run: &TestRunResult,
) -> Result<PathBuf> {
    let path = paths.test_log(attempt, try_number);
    let header = format!("exit_code: {}\n", run.exit_code);
    write_streams(&path, &header, &run.stdout, &run.stderr)?;
    Ok(path)
}

pub fn write_summary<T: Serialize>(paths: &RunPaths, summary: &T) -> Result<()> {
    let mut buf = serde_json::to_string_pretty(summary).context("serialize run summary")?;
    buf.push('\n');
    fs::write(&paths.summary_path, buf)
        .with_context(|| format!("write {}", paths.summary_path.display()))
}

/// Last `lines` lines of `text`, joined with `\n`.
pub fn tail_lines(text: &str, lines: usize) -> String {
    let all: Vec<&str> = text.lines().collect();
    let start = all.len().saturating_sub(lines);
    all[start..].join("\n")
}

fn write_streams(path: &Path, header: &str, stdout: &str, stderr: &str) -> Result<()> {
    let mut buf = String::with_capacity(header.len() + stdout.len() + stderr.len() + 32);
    buf.push_str(header);
    buf.push_str("=== stdout ===\n");
    buf.push_str(stdout);
    buf.push_str("\n=== stderr ===\n");
    buf.push_str(stderr);
    fs::write(path, buf).with_context(|| format!("write {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::ProjectKind;

    #[test]
    fn run_paths_are_stable() {
        let paths = RunPaths::new(Path::new("/runs/widget_1"));
        assert_eq!(paths.summary_path, Path::new("/runs/widget_1/summary.json"));
        assert_eq!(paths.build_log(2), Path::new("/runs/widget_1/logs/build-2.log"));
        assert_eq!(
            paths.test_log(2, 3),
            Path::new("/runs/widget_1/logs/test-2-3.log")
        );
        assert_eq!(
            paths.fix_dir(1),
            Path::new("/runs/widget_1/fixes/attempt-1")
        );
    }

    #[test]
    fn run_dirs_never_collide() {
        let temp = tempfile::tempdir().expect("tempdir");
        let first = create_run_dir(temp.path(), "widget").expect("create");
        let second = create_run_dir(temp.path(), "widget").expect("create");

        assert_eq!(first.dir, temp.path().join("widget_1"));
        assert_eq!(second.dir, temp.path().join("widget_2"));
        assert!(second.logs_dir.is_dir());
    }

    #[test]
    fn writes_logs_and_summary() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = create_run_dir(temp.path(), "widget").expect("create");
        let build = BuildResult {
            exit_code: 0,
            stdout: "built".to_string(),
            stderr: String::new(),
            project_kinds: [ProjectKind::Python].into_iter().collect(),
        };
        let log = write_build_log(&paths, 1, &build).expect("build log");
        let text = fs::read_to_string(log).expect("read");
        assert!(text.contains("project_kinds: python"));
        assert!(text.contains("built"));

        let run = TestRunResult {
            exit_code: 1,
            stdout: "1 failed".to_string(),
            stderr: String::new(),
        };
        write_test_log(&paths, 1, 1, &run).expect("test log");
        assert!(paths.test_log(1, 1).is_file());

        write_summary(&paths, &serde_json::json!({"status": "success"})).expect("summary");
        let summary: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(&paths.summary_path).expect("read"))
                .expect("json");
        assert_eq!(summary["status"], "success");
    }
}
