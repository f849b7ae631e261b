//! Applying proposed fixes to the working copy and recording change logs.

use std::fs;
use std::path::{Component, Path, PathBuf};

use anyhow::{Context, Result, bail};
use serde::Serialize;
use similar::TextDiff;
use tracing::{debug, info, instrument, warn};

use crate::core::types::FixSet;

/// Before/after content of one applied fix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileChange {
    pub path: String,
    /// Prior content; empty when the file did not exist.
    pub before: String,
    pub after: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SkippedFix {
    pub path: String,
    pub reason: String,
}

/// Outcome of one ApplyPatch stage.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApplyReport {
    pub applied: Vec<FileChange>,
    pub skipped: Vec<SkippedFix>,
}

impl ApplyReport {
    pub fn applied_paths(&self) -> Vec<String> {
        self.applied.iter().map(|c| c.path.clone()).collect()
    }
}

/// Write every fix into `workdir`, replacing whole files byte for byte.
///
/// A fix that cannot be written (unsafe path, I/O error) is logged and skipped;
/// the remaining fixes are still applied.
#[instrument(skip_all, fields(workdir = %workdir.display(), fixes = fixes.len()))]
pub fn apply_fixes(workdir: &Path, fixes: &FixSet) -> ApplyReport {
    let mut report = ApplyReport::default();
    for (path, content) in fixes {
        match apply_one(workdir, path, content) {
            Ok(change) => {
                debug!(path, "applied fix");
                report.applied.push(change);
            }
            Err(err) => {
                let reason = format!("{err:#}");
                warn!(path, %reason, "failed to apply fix");
                report.skipped.push(SkippedFix {
                    path: path.clone(),
                    reason,
                });
            }
        }
    }
    info!(
        applied = report.applied.len(),
        skipped = report.skipped.len(),
        "fixes applied"
    );
    report
}

fn apply_one(workdir: &Path, path: &str, content: &str) -> Result<FileChange> {
    let relative = safe_relative_path(path).map_err(anyhow::Error::msg)?;
    let target = workdir.join(&relative);
    ensure_inside(workdir, &target)?;
    let before = match fs::read(&target) {
        Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
        Err(_) => String::new(),
    };
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create directory {}", parent.display()))?;
    }
    fs::write(&target, content).with_context(|| format!("write {}", target.display()))?;
    Ok(FileChange {
        path: path.to_string(),
        before,
        after: content.to_string(),
    })
}

/// Reject targets that resolve outside `workdir` through a symlink.
///
/// Checks the closest existing ancestor before any directory is created, and
/// refuses to write through a symlinked file.
fn ensure_inside(workdir: &Path, target: &Path) -> Result<()> {
    let root = workdir
        .canonicalize()
        .with_context(|| format!("resolve working copy {}", workdir.display()))?;
    if fs::symlink_metadata(target).is_ok_and(|meta| meta.file_type().is_symlink()) {
        bail!("refusing to write through symlink {}", target.display());
    }
    let Some(anchor) = target.ancestors().skip(1).find(|p| p.exists()) else {
        bail!("no existing parent for {}", target.display());
    };
    let resolved = anchor
        .canonicalize()
        .with_context(|| format!("resolve {}", anchor.display()))?;
    if !resolved.starts_with(&root) {
        bail!(
            "{} resolves outside the working copy ({})",
            target.display(),
            resolved.display()
        );
    }
    Ok(())
}

/// Lexically normalize a repository-relative path, rejecting absolute paths and `..`.
pub fn safe_relative_path(path: &str) -> Result<PathBuf, String> {
    let mut out = PathBuf::new();
    for component in Path::new(path).components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::CurDir => {}
            Component::ParentDir => return Err(format!("path escapes working copy: {path}")),
            Component::RootDir | Component::Prefix(_) => {
                return Err(format!("absolute path not allowed: {path}"));
            }
        }
    }
    if out.as_os_str().is_empty() {
        return Err(format!("empty fix path: '{path}'"));
    }
    Ok(out)
}

/// Unified diff of every change in one attempt.
pub fn render_changelog(attempt: u32, changes: &[FileChange]) -> String {
    let mut buf = format!("# fix attempt {attempt}\n");
    for change in changes {
        let diff = TextDiff::from_lines(&change.before, &change.after);
        let old_header = format!("a/{}", change.path);
        let new_header = format!("b/{}", change.path);
        buf.push_str(
            &diff
                .unified_diff()
                .context_radius(3)
                .header(&old_header, &new_header)
                .to_string(),
        );
    }
    buf
}

/// Write the change log for `attempt` to `run_dir/patches/attempt-<n>.diff`.
pub fn write_changelog(run_dir: &Path, attempt: u32, changes: &[FileChange]) -> Result<PathBuf> {
    let dir = run_dir.join("patches");
    fs::create_dir_all(&dir).with_context(|| format!("create {}", dir.display()))?;
    let path = dir.join(format!("attempt-{attempt}.diff"));
    fs::write(&path, render_changelog(attempt, changes))
        .with_context(|| format!("write change log {}", path.display()))?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixes(entries: &[(&str, &str)]) -> FixSet {
        entries
            .iter()
            .map(|(p, c)| (p.to_string(), c.to_string()))
            .collect()
    }

    #[test]
    fn writes_exact_content_and_creates_dirs() {
        let temp = tempfile::tempdir().expect("tempdir");
        fs::write(temp.path().join("calc.py"), "old\n").expect("write");

        let report = apply_fixes(
            temp.path(),
            &fixes(&[("calc.py", "new\r\nno trailing newline"), ("pkg/new.py", "x = 1\n")]),
        );

        assert!(report.skipped.is_empty());
        assert_eq!(report.applied_paths(), vec!["calc.py", "pkg/new.py"]);
        assert_eq!(
            fs::read_to_string(temp.path().join("calc.py")).expect("read"),
            "new\r\nno trailing newline"
        );
        assert_eq!(
            fs::read_to_string(temp.path().join("pkg/new.py")).expect("read"),
            "x = 1\n"
        );
        assert_eq!(report.applied[0].before, "old\n");
        assert_eq!(report.applied[1].before, "");
    }

    #[test]
    fn unsafe_paths_are_skipped_not_fatal() {
        let temp = tempfile::tempdir().expect("tempdir");
        let report = apply_fixes(
            temp.path(),
            &fixes(&[("../escape.py", "x"), ("/etc/passwd", "x"), ("ok.py", "y")]),
        );

        assert_eq!(report.applied_paths(), vec!["ok.py"]);
        assert_eq!(report.skipped.len(), 2);
        assert!(!temp.path().parent().expect("parent").join("escape.py").exists());
    }

    #[cfg(unix)]
    #[test]
    fn symlinks_out_of_the_working_copy_are_skipped() {
        use std::os::unix::fs::symlink;

        let temp = tempfile::tempdir().expect("tempdir");
        let repo = temp.path().join("repo");
        let outside = temp.path().join("outside");
        fs::create_dir(&repo).expect("mkdir");
        fs::create_dir(&outside).expect("mkdir");
        fs::write(outside.join("secret.py"), "keep\n").expect("write");
        symlink(&outside, repo.join("linked")).expect("symlink dir");
        symlink(outside.join("secret.py"), repo.join("secret.py")).expect("symlink file");

        let report = apply_fixes(
            &repo,
            &fixes(&[
                ("linked/new.py", "x"),
                ("linked/deep/new.py", "x"),
                ("secret.py", "x"),
                ("inside/ok.py", "y"),
            ]),
        );

        assert_eq!(report.applied_paths(), vec!["inside/ok.py"]);
        assert_eq!(report.skipped.len(), 3);
        assert!(!outside.join("new.py").exists());
        assert!(!outside.join("deep").exists());
        assert_eq!(
            fs::read_to_string(outside.join("secret.py")).expect("read"),
            "keep\n"
        );
    }

    #[test]
    fn safe_relative_path_normalizes() {
        assert_eq!(
            safe_relative_path("./src/calc.py"),
            Ok(PathBuf::from("src/calc.py"))
        );
        assert!(safe_relative_path("src/../../x").is_err());
        assert!(safe_relative_path("").is_err());
        assert!(safe_relative_path(".").is_err());
    }

    #[test]
    fn changelog_is_a_unified_diff() {
        let temp = tempfile::tempdir().expect("tempdir");
        let changes = vec![FileChange {
            path: "calc.py".to_string(),
            before: "def add(a, b):\n    return a - b\n".to_string(),
            after: "def add(a, b):\n    return a + b\n".to_string(),
        }];

        let path = write_changelog(temp.path(), 2, &changes).expect("write");
        assert!(path.ends_with("patches/attempt-2.diff"));
        let text = fs::read_to_string(&path).expect("read");
        assert!(text.starts_with("# fix attempt 2\n"));
        assert!(text.contains("--- a/calc.py"));
        assert!(text.contains("+++ b/calc.py"));
        assert!(text.contains("-    return a - b"));
        assert!(text.contains("+    return a + b"));
    }

    #[test]
    fn new_file_diff_is_all_additions() {
        let text = render_changelog(
            1,
            &[FileChange {
                path: "new.py".to_string(),
                before: String::new(),
                after: "x = 1\n".to_string(),
            }],
        );
        assert!(text.contains("+x = 1"));
        assert!(!text.contains("\n-x"));
    }
}
