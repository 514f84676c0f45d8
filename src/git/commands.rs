//! Git command wrappers using [`tokio::process::Command`].
//!
//! Every invocation is quiet (`--quiet` directly after the subcommand) so
//! that a successful run produces no informational output.  Stdout and
//! stderr are inherited from the host process: the tool's diagnostics go
//! straight to the operator, and the driver judges an invocation only by
//! its exit status.

use std::path::Path;
use std::process::Stdio;

use anyhow::{bail, Context, Result};
use tokio::process::Command;
use tracing::{debug, instrument};

use crate::job::PatchSource;

// ---------------------------------------------------------------------------
// Argument assembly
// ---------------------------------------------------------------------------

/// Argument vector for one invocation: `<subcommand> --quiet <extra...>`.
fn git_args(subcommand: &str, extra: &[&str]) -> Vec<String> {
    let mut args = Vec::with_capacity(extra.len() + 2);
    args.push(subcommand.to_string());
    args.push("--quiet".to_string());
    args.extend(extra.iter().map(|s| (*s).to_string()));
    args
}

// ---------------------------------------------------------------------------
// Driver
// ---------------------------------------------------------------------------

/// Run one subcommand of `program` to completion.
///
/// When `workdir` is `None` the child runs in the process's own working
/// directory.  When `stdin` is given, the source is copied in full and the
/// pipe closed before the wait begins, so the child always observes
/// end-of-input; with no source the pipe is closed immediately after
/// spawn.  Succeeds iff the child exits with status zero.
#[instrument(skip(stdin, extra), fields(%program))]
pub async fn run_git(
    program: &str,
    workdir: Option<&Path>,
    subcommand: &str,
    stdin: Option<PatchSource>,
    extra: &[&str],
) -> Result<()> {
    let mut cmd = Command::new(program);
    cmd.args(git_args(subcommand, extra));
    if let Some(dir) = workdir {
        cmd.current_dir(dir);
    }
    cmd.stdin(Stdio::piped());

    let mut child = cmd
        .spawn()
        .with_context(|| format!("failed to spawn {program} {subcommand}"))?;

    let mut pipe = child
        .stdin
        .take()
        .with_context(|| format!("failed to open stdin of {program} {subcommand}"))?;

    if let Some(source) = stdin {
        let written = source
            .copy_to(&mut pipe)
            .await
            .with_context(|| format!("failed to stream patch to {program} {subcommand}"))?;
        debug!(bytes = written, "copied byte source to child stdin");
    }
    // EOF must precede the wait.
    drop(pipe);

    let status = child
        .wait()
        .await
        .with_context(|| format!("failed to wait on {program} {subcommand}"))?;

    if !status.success() {
        bail!("{program} {subcommand} failed (status {status})");
    }

    debug!("child exited cleanly");
    Ok(())
}

// ---------------------------------------------------------------------------
// Clone
// ---------------------------------------------------------------------------

/// `git clone --quiet --depth 1 --branch <branch> <repository> <dest>`,
/// run from `root`.
pub async fn git_clone_shallow(
    program: &str,
    root: &Path,
    repository: &str,
    branch: &str,
    dest: &str,
) -> Result<()> {
    run_git(
        program,
        Some(root),
        "clone",
        None,
        &["--depth", "1", "--branch", branch, repository, dest],
    )
    .await
}

// ---------------------------------------------------------------------------
// Apply
// ---------------------------------------------------------------------------

/// `git am --quiet -` inside `workdir`, with the patch bytes on stdin.
pub async fn git_apply_mailbox(program: &str, workdir: &Path, patch: PatchSource) -> Result<()> {
    run_git(program, Some(workdir), "am", Some(patch), &["-"]).await
}

// ---------------------------------------------------------------------------
// Push
// ---------------------------------------------------------------------------

/// `git push --quiet` inside `workdir`.  The remote and credentials are
/// whatever the clone configured.
pub async fn git_push(program: &str, workdir: &Path) -> Result<()> {
    run_git(program, Some(workdir), "push", None, &[]).await
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
