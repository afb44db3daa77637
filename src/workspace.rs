//! Run directory management: the per-output-dir lock and staging of the
//! student submission into the directory the playbook runs from.

use anyhow::{Context, Result, bail};
use labspec::LabSpec;
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use crate::paths;

const LOCK_FILE: &str = ".hammer.lock";

/// Submission directories copied wholesale when present
const SUBMISSION_DIRS: [&str; 3] = ["roles", "templates", "files"];

/// An output directory owned by one grading run.
///
/// Holding a `RunDir` holds the lock; dropping it releases the lock.
#[derive(Debug)]
pub struct RunDir {
    root: PathBuf,
    lock: PathBuf,
}

impl RunDir {
    /// Create `root` if needed and take its lock.
    pub fn acquire(root: &Path) -> Result<Self> {
        fs::create_dir_all(root)
            .with_context(|| format!("Could not create {}", root.display()))?;
        let lock = root.join(LOCK_FILE);
        let mut file = match OpenOptions::new().write(true).create_new(true).open(&lock) {
            Ok(f) => f,
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                let holder = fs::read_to_string(&lock).unwrap_or_default();
                bail!(
                    "{} is in use by another grading run ({}); remove {} if that run is gone",
                    root.display(),
                    holder.trim(),
                    lock.display()
                );
            }
            Err(e) => {
                return Err(e).with_context(|| format!("Could not create {}", lock.display()));
            }
        };
        writeln!(file, "pid {} since {}", std::process::id(), chrono::Utc::now().to_rfc3339())?;
        log::debug!("Acquired {}", lock.display());
        Ok(Self {
            root: root.to_path_buf(),
            lock,
        })
    }

    pub fn path(&self) -> &Path {
        &self.root
    }

    /// Where the submission is staged and the playbook runs
    pub fn work_dir(&self) -> PathBuf {
        self.root.join("work")
    }

    /// Converge logs, one per phase
    pub fn logs_dir(&self) -> PathBuf {
        self.root.join("logs")
    }
}

impl Drop for RunDir {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.lock) {
            log::warn!("Could not remove {}: {e}", self.lock.display());
        }
    }
}

/// Copy the parts of a submission the playbook needs into `dest`.
///
/// `dest` is emptied first. Files the spec provides are copied from
/// `spec_dir` on top of the submission. Returns the number of files copied.
pub fn stage_submission(spec: &LabSpec, spec_dir: &Path, submission: &Path, dest: &Path) -> Result<usize> {
    check_submission(spec, submission)?;

    if dest.exists() {
        fs::remove_dir_all(dest).with_context(|| format!("Could not clear {}", dest.display()))?;
    }
    fs::create_dir_all(dest)?;

    let ep = &spec.entrypoints;
    let mut copied = copy_file(&submission.join(&ep.playbook_path), &dest.join(&ep.playbook_path))?;
    for dir in SUBMISSION_DIRS {
        let src = submission.join(dir);
        if src.is_dir() {
            copied += copy_tree(&src, &dest.join(dir))?;
        }
    }
    for file in &ep.required_files {
        let target = dest.join(file);
        if !target.exists() {
            copied += copy_file(&submission.join(file), &target)?;
        }
    }
    for provided in &ep.provided_files {
        let src = paths::relative_to(spec_dir, &provided.source);
        copied += copy_file(&src, &dest.join(&provided.destination))
            .with_context(|| format!("Provided file {} is missing", src.display()))?;
    }

    log::info!("Staged {copied} file(s) from {} into {}", submission.display(), dest.display());
    Ok(copied)
}

/// Every missing entrypoint, reported at once.
fn check_submission(spec: &LabSpec, submission: &Path) -> Result<()> {
    if !submission.is_dir() {
        bail!("Submission {} is not a directory", submission.display());
    }
    let ep = &spec.entrypoints;
    let mut missing = Vec::new();
    if !submission.join(&ep.playbook_path).is_file() {
        missing.push(format!("playbook {}", ep.playbook_path));
    }
    for role in &ep.required_roles {
        if !submission.join("roles").join(role).is_dir() {
            missing.push(format!("role {role}"));
        }
    }
    for file in &ep.required_files {
        if !submission.join(file).exists() {
            missing.push(format!("file {file}"));
        }
    }
    if missing.is_empty() {
        Ok(())
    } else {
        bail!("Submission is missing: {}", missing.join(", "))
    }
}

fn copy_file(src: &Path, dest: &Path) -> Result<usize> {
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::copy(src, dest).with_context(|| format!("Could not copy {}", src.display()))?;
    Ok(1)
}

fn copy_tree(src: &Path, dest: &Path) -> Result<usize> {
    let mut copied = 0;
    for entry in WalkDir::new(src).follow_links(false) {
        let entry = entry.context("Failed to read directory entry")?;
        let rel = entry.path().strip_prefix(src).unwrap_or(entry.path());
        let target = dest.join(rel);
        let file_type = entry.file_type();
        if file_type.is_dir() {
            fs::create_dir_all(&target)?;
        } else if file_type.is_file() {
            copied += copy_file(entry.path(), &target)?;
        } else {
            log::warn!("Skipping {} (not a regular file)", entry.path().display());
        }
    }
    Ok(copied)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const SPEC: &str = include_str!("../demos/web_lab.yaml");

    fn submission() -> TempDir {
        let dir = TempDir::new().unwrap();
        let root = dir.path();
        fs::write(root.join("site.yml"), "- hosts: all\n").unwrap();
        fs::create_dir_all(root.join("roles/webserver/tasks")).unwrap();
        fs::write(root.join("roles/webserver/tasks/main.yml"), "---\n").unwrap();
        fs::create_dir_all(root.join("templates")).unwrap();
        fs::write(root.join("templates/app.conf.j2"), "listen {{ http_port }};\n").unwrap();
        fs::write(root.join("README.md"), "notes").unwrap();
        dir
    }

    #[test]
    fn test_stage_copies_entrypoints_only() {
        let spec = LabSpec::from_yaml_str(SPEC).unwrap();
        let src = submission();
        let out = TempDir::new().unwrap();
        let dest = out.path().join("work");

        let copied = stage_submission(&spec, src.path(), src.path(), &dest).unwrap();

        assert_eq!(copied, 3);
        assert!(dest.join("site.yml").is_file());
        assert!(dest.join("roles/webserver/tasks/main.yml").is_file());
        assert!(dest.join("templates/app.conf.j2").is_file());
        assert!(!dest.join("README.md").exists());
    }

    #[test]
    fn test_stage_clears_previous_run() {
        let spec = LabSpec::from_yaml_str(SPEC).unwrap();
        let src = submission();
        let out = TempDir::new().unwrap();
        let dest = out.path().join("work");
        fs::create_dir_all(&dest).unwrap();
        fs::write(dest.join("stale.yml"), "old").unwrap();

        stage_submission(&spec, src.path(), src.path(), &dest).unwrap();
        assert!(!dest.join("stale.yml").exists());
    }

    #[test]
    fn test_missing_entrypoints_reported_together() {
        let spec = LabSpec::from_yaml_str(SPEC).unwrap();
        let src = TempDir::new().unwrap();
        let out = TempDir::new().unwrap();

        let err = stage_submission(&spec, src.path(), src.path(), &out.path().join("work")).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("playbook site.yml"));
        assert!(msg.contains("role webserver"));
        assert!(msg.contains("file templates/app.conf.j2"));
    }

    #[test]
    fn test_lock_excludes_second_run() {
        let out = TempDir::new().unwrap();
        let first = RunDir::acquire(out.path()).unwrap();
        let err = RunDir::acquire(out.path()).unwrap_err();
        assert!(err.to_string().contains("in use by another grading run"));

        drop(first);
        assert!(RunDir::acquire(out.path()).is_ok());
    }

    #[test]
    fn test_run_dir_layout() {
        let out = TempDir::new().unwrap();
        let run = RunDir::acquire(out.path()).unwrap();
        assert_eq!(run.path(), out.path());
        assert_eq!(run.work_dir(), out.path().join("work"));
        assert_eq!(run.logs_dir(), out.path().join("logs"));
    }
}
