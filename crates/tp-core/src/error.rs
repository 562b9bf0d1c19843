use std::path::PathBuf;
use thiserror::Error;

/// Typed failures surfaced by the interception engine.
///
/// Callers receive these wrapped in `anyhow::Error` with operation context;
/// `downcast_ref::<Error>()` recovers the variant.
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid table '{0}': expected one of nat, mangle, raw")]
    InvalidTable(String),

    #[error("chain name cannot be empty")]
    EmptyName,

    #[error("failed to find executable {name}")]
    ExecutableNotFound { name: String },

    #[error("unmet requirements: {} not available", .missing.join(", "))]
    UnmetRequirements { missing: Vec<String> },

    #[error("{}", command_failure(.path, .status, .stderr))]
    CommandFailed {
        path: PathBuf,
        status: String,
        code: Option<i32>,
        signal: Option<i32>,
        stderr: String,
    },

    #[error("{path} failed after {attempts} attempts")]
    RestoreFailed { path: PathBuf, attempts: usize },

    #[error(
        "applying rules failed ({apply}) and restoring the backup {backup} failed as well ({restore}); \
         the packet filter state is uncertain"
    )]
    RollbackFailed {
        apply: String,
        restore: String,
        backup: PathBuf,
    },

    #[error(
        "transparent proxy rules detected, but expected comments are missing. Cleanup cannot \
         proceed safely without comments to identify rules. Please remove the transparent \
         proxy rules manually"
    )]
    UnsafeCleanup,

    #[error("invalid exclusion '{rule}': {reason}")]
    InvalidExclusion { rule: String, reason: String },

    #[error("incorrect definition of virtual network '{0}': expected <iface>:<cidr>")]
    InvalidVnet(String),

    #[error("invalid IP address '{0}': expected <ip> or <ip>/<prefix>")]
    InvalidAddress(String),

    #[error("user '{0}' does not exist")]
    UnknownUser(String),

    #[error("root user is required for this operation")]
    NotRoot,

    #[error("no {fs} filesystem mounted at or below {path}")]
    MountMissing { fs: String, path: PathBuf },

    #[error("found multiple {fs} mounts: {}", .mounts.join(", "))]
    MountAmbiguous { fs: String, mounts: Vec<String> },

    #[error("mount {path} is read-only")]
    MountReadOnly { path: PathBuf },

    #[error("instance IP is not configured and environment variable {0} is empty")]
    MissingInstanceIp(String),
}

impl Error {
    /// True for a process killed by SIGSEGV, however the shell reported it.
    pub fn is_segfault(&self) -> bool {
        match self {
            Error::CommandFailed {
                code,
                signal,
                stderr,
                ..
            } => *signal == Some(11) || *code == Some(139) || stderr.contains("Segmentation fault"),
            _ => false,
        }
    }
}

fn command_failure(path: &std::path::Path, status: &str, stderr: &str) -> String {
    let lines: Vec<&str> = stderr
        .trim()
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .collect();

    if lines.is_empty() {
        format!("{}: {}", path.display(), status)
    } else {
        format!("{}: {}: {}", path.display(), status, lines.join(", "))
    }
}
