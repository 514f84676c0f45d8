//! Subprocess driver for the version-control tool.
//!
//! All repository mutation shells out to the system `git` binary using
//! `tokio::process::Command` for non-blocking execution.  Credential
//! handling (helpers, SSH agents, tokens in the remote URL) is inherited
//! from the host environment; nothing here injects or interprets it.

pub mod commands;

pub use commands::{git_apply_mailbox, git_clone_shallow, git_push};
