//! The single background worker that owns every repository mutation.
//!
//! Exactly one worker task exists per process.  It drains the rendezvous
//! queue one job at a time: shallow-clone the target branch into a fresh
//! UUID-named directory, apply the patch from the job's byte source, push,
//! and remove the directory.  A failed step is terminal for that job only;
//! the worker logs it and moves on to the next job.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::git::{git_apply_mailbox, git_clone_shallow, git_push};
use crate::job::{Job, JobReceiver};

// ---------------------------------------------------------------------------
// Job steps
// ---------------------------------------------------------------------------

/// The pipeline step a job failed in, for log context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    Clone,
    Apply,
    Push,
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Clone => write!(f, "clone"),
            Self::Apply => write!(f, "apply"),
            Self::Push => write!(f, "push"),
        }
    }
}

/// A job-terminal failure: which step died, and why.
#[derive(Debug)]
struct StepError {
    step: Step,
    source: anyhow::Error,
}

impl StepError {
    fn at(step: Step) -> impl FnOnce(anyhow::Error) -> Self {
        move |source| Self { step, source }
    }
}

// ---------------------------------------------------------------------------
// Worker loop
// ---------------------------------------------------------------------------

/// Drain the queue until every sender is gone.
///
/// Jobs are processed strictly in hand-off order; job N+1 is not received
/// before job N has settled.
pub async fn run_worker(config: Arc<Config>, queue: JobReceiver) {
    while let Ok(job) = queue.recv_async().await {
        let repository = job.repository.clone();
        let branch = job.branch.clone();
        let started = Instant::now();

        match process_job(&config, job).await {
            Ok(()) => {
                info!(
                    %repository,
                    %branch,
                    elapsed = ?started.elapsed(),
                    "patch job complete"
                );
            }
            Err(e) => {
                error!(
                    %repository,
                    %branch,
                    step = %e.step,
                    elapsed = ?started.elapsed(),
                    error = %format!("{:#}", e.source),
                    "patch job failed"
                );
            }
        }
    }

    info!("job queue closed, worker exiting");
}

/// Apply one job end-to-end: clone, apply, push.
///
/// The working-directory guard is created before the clone, so partial
/// state is removed no matter where this returns — or panics.
#[instrument(skip_all, fields(repository = %job.repository, branch = %job.branch))]
async fn process_job(config: &Config, job: Job) -> Result<(), StepError> {
    let Job {
        repository,
        branch,
        patch,
    } = job;
    let program = &config.git.program;
    let root = Path::new(&config.worker.workdir_root);

    let workdir = WorkDir::new(root);

    let clone_started = Instant::now();
    git_clone_shallow(program, root, &repository, &branch, workdir.name())
        .await
        .context("failed to clone repository")
        .map_err(StepError::at(Step::Clone))?;
    info!(elapsed = ?clone_started.elapsed(), "repository cloned");

    git_apply_mailbox(program, workdir.path(), patch)
        .await
        .context("failed to apply patch")
        .map_err(StepError::at(Step::Apply))?;
    info!("patch applied");

    let push_started = Instant::now();
    git_push(program, workdir.path())
        .await
        .context("failed to push changes")
        .map_err(StepError::at(Step::Push))?;
    info!(elapsed = ?push_started.elapsed(), "changes pushed");

    Ok(())
}

// ---------------------------------------------------------------------------
// Working directory guard
// ---------------------------------------------------------------------------

/// Scope guard for one job's working directory.
///
/// The directory itself is created by `git clone`; the guard exists from
/// before that point and removes whatever is on disk when it drops, so
/// success, a failed step, and a panic all release the directory.
struct WorkDir {
    path: PathBuf,
    name: String,
}

impl WorkDir {
    fn new(root: &Path) -> Self {
        let name = Uuid::new_v4().to_string();
        Self {
            path: root.join(&name),
            name,
        }
    }

    /// The collision-resistant directory name, as handed to `git clone`.
    fn name(&self) -> &str {
        &self.name
    }

    fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for WorkDir {
    fn drop(&mut self) {
        if !self.path.exists() {
            // The clone never created it.
            return;
        }
        if let Err(e) = std::fs::remove_dir_all(&self.path) {
            warn!(
                path = %self.path.display(),
                error = %e,
                "failed to remove working directory"
            );
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{job_queue, PatchSource};
    use bytes::Bytes;
    use std::os::unix::fs::PermissionsExt;
    use std::time::Duration;

    const PATCH: &[u8] = b"From 0123abcd Mon Sep 17 00:00:00 2001\nSubject: [PATCH] x\n";

    /// A recording stand-in for git: appends each argv to `calls.log`,
    /// creates the destination directory on `clone` (as git would),
    /// captures `am` stdin into `applied.patch`, and fails any clone of
    /// the branch named `bad`.
    fn install_fake_git(dir: &Path) -> String {
        let log = dir.join("calls.log");
        let applied = dir.join("applied.patch");
        let body = format!(
            r#"echo "$@" >> {log}
if [ "$1" = "clone" ] && [ "$6" = "bad" ]; then exit 1; fi
if [ "$1" = "clone" ]; then
    last=""
    for arg in "$@"; do last="$arg"; done
    mkdir -p "$last"
    if [ -e fail-push ]; then touch "$last/fail-push"; fi
fi
if [ "$1" = "am" ]; then cat > {applied}; else cat > /dev/null; fi
if [ "$1" = "push" ] && [ -e fail-push ]; then exit 1; fi
exit 0"#,
            log = log.display(),
            applied = applied.display(),
        );
        let path = dir.join("fake-git");
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path.to_str().unwrap().to_string()
    }

    fn test_config(dir: &Path) -> Arc<Config> {
        let mut config = Config::default();
        config.git.program = install_fake_git(dir);
        config.worker.workdir_root = dir.to_str().unwrap().to_string();
        Arc::new(config)
    }

    fn test_job(branch: &str) -> Job {
        Job {
            repository: "https://example.test/r.git".into(),
            branch: branch.into(),
            patch: PatchSource::Buffered(Bytes::from_static(PATCH)),
        }
    }

    fn calls(dir: &Path) -> Vec<String> {
        std::fs::read_to_string(dir.join("calls.log"))
            .unwrap_or_default()
            .lines()
            .map(str::to_string)
            .collect()
    }

    /// Directory entries left behind, minus the fixture files.
    fn leftover_dirs(dir: &Path) -> Vec<PathBuf> {
        std::fs::read_dir(dir)
            .unwrap()
            .filter_map(|e| {
                let path = e.unwrap().path();
                path.is_dir().then_some(path)
            })
            .collect()
    }

    #[tokio::test]
    async fn process_job_runs_clone_apply_push_and_cleans_up() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());

        process_job(&config, test_job("main")).await.unwrap();

        let calls = calls(dir.path());
        assert_eq!(calls.len(), 3);
        assert!(
            calls[0].starts_with("clone --quiet --depth 1 --branch main https://example.test/r.git "),
            "got: {}",
            calls[0]
        );
        assert_eq!(calls[1], "am --quiet -");
        assert_eq!(calls[2], "push --quiet");

        // The UUID directory name is the clone's final argument.
        let name = calls[0].rsplit(' ').next().unwrap();
        assert!(Uuid::parse_str(name).is_ok(), "got: {name}");

        assert_eq!(std::fs::read(dir.path().join("applied.patch")).unwrap(), PATCH);
        assert!(leftover_dirs(dir.path()).is_empty());
    }

    #[tokio::test]
    async fn clone_failure_skips_later_steps() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());

        let err = process_job(&config, test_job("bad")).await.unwrap_err();
        assert_eq!(err.step, Step::Clone);

        let calls = calls(dir.path());
        assert_eq!(calls.len(), 1);
        assert!(leftover_dirs(dir.path()).is_empty());
    }

    #[tokio::test]
    async fn push_failure_still_removes_the_working_directory() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        // The fake tool copies this marker into the clone and fails the
        // push when it is present there.
        std::fs::write(dir.path().join("fail-push"), b"").unwrap();

        let err = process_job(&config, test_job("main")).await.unwrap_err();
        assert_eq!(err.step, Step::Push);

        assert!(leftover_dirs(dir.path()).is_empty());
    }

    #[tokio::test]
    async fn worker_continues_after_a_failed_job() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let (tx, rx) = job_queue();

        let worker = tokio::spawn(run_worker(config, rx));

        tx.send_async(test_job("bad")).await.unwrap();
        tx.send_async(test_job("main")).await.unwrap();
        drop(tx);
        worker.await.unwrap();

        let calls = calls(dir.path());
        // Failed job: clone only.  Next job: full clone/apply/push run.
        assert_eq!(calls.len(), 4);
        assert!(calls[0].contains("--branch bad"));
        assert!(calls[1].contains("--branch main"));
        assert_eq!(calls[2], "am --quiet -");
        assert_eq!(calls[3], "push --quiet");
        assert!(leftover_dirs(dir.path()).is_empty());
    }

    #[tokio::test]
    async fn jobs_run_strictly_in_hand_off_order() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let (tx, rx) = job_queue();

        let worker = tokio::spawn(run_worker(config, rx));
        for branch in ["one", "two", "three"] {
            tx.send_async(test_job(branch)).await.unwrap();
        }
        drop(tx);
        worker.await.unwrap();

        let clones: Vec<String> = calls(dir.path())
            .into_iter()
            .filter(|line| line.starts_with("clone"))
            .collect();
        assert_eq!(clones.len(), 3);
        assert!(clones[0].contains("--branch one"));
        assert!(clones[1].contains("--branch two"));
        assert!(clones[2].contains("--branch three"));
    }

    #[test]
    fn workdir_guard_ignores_a_directory_that_never_appeared() {
        let dir = tempfile::tempdir().unwrap();
        let guard = WorkDir::new(dir.path());
        let path = guard.path().to_path_buf();
        drop(guard);
        assert!(!path.exists());
        // Removal of a populated directory.
        let guard = WorkDir::new(dir.path());
        std::fs::create_dir_all(guard.path().join("nested")).unwrap();
        std::fs::write(guard.path().join("nested/file"), b"x").unwrap();
        let path = guard.path().to_path_buf();
        drop(guard);
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn worker_exits_when_the_queue_closes() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let (tx, rx) = job_queue();
        let worker = tokio::spawn(run_worker(config, rx));
        drop(tx);
        tokio::time::timeout(Duration::from_secs(5), worker)
            .await
            .expect("worker did not exit")
            .unwrap();
    }
}
