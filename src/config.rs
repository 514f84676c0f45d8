use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

/// Service configuration.
///
/// Every field has a default, so the service runs without a config file at
/// all; a YAML file supplied via `--config` overrides selectively.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub intake: IntakeConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
    #[serde(default)]
    pub git: GitConfig,
}

// ---------------------------------------------------------------------------
// HTTP listener
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct HttpConfig {
    /// TCP port for the HTTP listener.  The `PORT` environment variable
    /// (or `--port`) takes precedence over this value.
    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_port() -> u16 {
    8080
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
        }
    }
}

// ---------------------------------------------------------------------------
// Intake limits
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct IntakeConfig {
    /// Hard ceiling on the multipart request body, in bytes.
    #[serde(default = "default_max_form_bytes")]
    pub max_form_bytes: usize,
    /// Hard ceiling on a URL-fetched patch, in bytes.  Enforced both from
    /// `Content-Length` at intake and while streaming the body, so a
    /// chunked response cannot bypass it.
    #[serde(default = "default_max_remote_patch_bytes")]
    pub max_remote_patch_bytes: u64,
}

fn default_max_form_bytes() -> usize {
    5_000_000
}

fn default_max_remote_patch_bytes() -> u64 {
    50_000_000
}

impl Default for IntakeConfig {
    fn default() -> Self {
        Self {
            max_form_bytes: default_max_form_bytes(),
            max_remote_patch_bytes: default_max_remote_patch_bytes(),
        }
    }
}

// ---------------------------------------------------------------------------
// Worker
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct WorkerConfig {
    /// Directory under which per-job working directories are created.
    /// Defaults to the process's current working directory.
    #[serde(default = "default_workdir_root")]
    pub workdir_root: String,
}

fn default_workdir_root() -> String {
    ".".to_string()
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            workdir_root: default_workdir_root(),
        }
    }
}

// ---------------------------------------------------------------------------
// Git tool
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct GitConfig {
    /// Name or path of the version-control binary to invoke.  Resolved
    /// through `PATH`; credentials are whatever the host environment
    /// provides.
    #[serde(default = "default_program")]
    pub program: String,
}

fn default_program() -> String {
    "git".to_string()
}

impl Default for GitConfig {
    fn default() -> Self {
        Self {
            program: default_program(),
        }
    }
}

// ---------------------------------------------------------------------------
// Loader
// ---------------------------------------------------------------------------

/// Load and validate a [`Config`] from a YAML file at `path`.
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config> {
    let path = path.as_ref();
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file: {}", path.display()))?;
    let config: Config = serde_yaml::from_str(&contents)
        .with_context(|| format!("failed to parse config file: {}", path.display()))?;
    validate_config(&config)?;
    Ok(config)
}

/// Basic sanity checks that cannot be expressed purely with serde.
pub fn validate_config(config: &Config) -> Result<()> {
    anyhow::ensure!(
        config.intake.max_form_bytes > 0,
        "intake.max_form_bytes must be positive"
    );
    anyhow::ensure!(
        config.intake.max_remote_patch_bytes > 0,
        "intake.max_remote_patch_bytes must be positive"
    );
    anyhow::ensure!(
        !config.worker.workdir_root.is_empty(),
        "worker.workdir_root must not be empty"
    );
    anyhow::ensure!(
        !config.git.program.is_empty(),
        "git.program must not be empty"
    );
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
