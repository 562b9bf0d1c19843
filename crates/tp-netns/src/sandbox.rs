use nix::mount::{MsFlags, mount};
use nix::sched::{CloneFlags, setns, unshare};
use std::fs::File;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use thiserror::Error;
use tokio::sync::oneshot;

pub const XTABLES_LOCK_PATH: &str = "/run/xtables.lock";
pub const XTABLES_LOCKFILE_ENV: &str = "XTABLES_LOCKFILE";
pub const NSSWITCH_CONF_PATH: &str = "/etc/nsswitch.conf";

/// Target of a sandboxed invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SandboxConfig {
    pub netns_path: PathBuf,
}

impl SandboxConfig {
    pub fn new(netns_path: impl Into<PathBuf>) -> Self {
        Self {
            netns_path: netns_path.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum SandboxError {
    /// The wrapped command never ran.
    #[error("setup sandbox: {0}")]
    Setup(String),

    #[error("failed to run {path} inside the sandbox: {source}")]
    Command {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("sandbox thread exited without reporting a result")]
    Disconnected,
}

impl SandboxError {
    pub fn is_setup(&self) -> bool {
        matches!(self, SandboxError::Setup(_))
    }
}

/// Run `path args..` on a fresh OS thread that has its own mount namespace
/// and has joined the target network namespace.
///
/// The thread is never reused: it exits after reporting through the oneshot
/// channel, taking the modified namespaces with it.
pub async fn run_sandboxed(
    config: &SandboxConfig,
    path: &Path,
    args: &[String],
) -> Result<Output, SandboxError> {
    let (tx, rx) = oneshot::channel();
    let config = config.clone();
    let path = path.to_path_buf();
    let args = args.to_vec();

    std::thread::Builder::new()
        .name("tproxy-sandbox".to_string())
        .spawn(move || {
            let result = enter(&config).and_then(|sandbox| sandbox.run(&path, &args));
            let _ = tx.send(result);
        })
        .map_err(|e| SandboxError::Setup(format!("failed to spawn sandbox thread: {}", e)))?;

    rx.await.map_err(|_| SandboxError::Disconnected)?
}

struct Sandbox {
    lock_file: tempfile::NamedTempFile,
}

impl Sandbox {
    fn run(self, path: &Path, args: &[String]) -> Result<Output, SandboxError> {
        Command::new(path)
            .args(args)
            .env(XTABLES_LOCKFILE_ENV, self.lock_file.path())
            .output()
            .map_err(|source| SandboxError::Command {
                path: path.to_path_buf(),
                source,
            })
    }
}

fn enter(config: &SandboxConfig) -> Result<Sandbox, SandboxError> {
    let netns = File::open(&config.netns_path)
        .map_err(|e| setup_error(&format!("open {}", config.netns_path.display()), e))?;

    unshare(CloneFlags::CLONE_NEWNS).map_err(|e| setup_error("unshare mount namespace", e))?;

    setns(&netns, CloneFlags::CLONE_NEWNET)
        .map_err(|e| setup_error("switch network namespace", e))?;

    // Keep the bind mounts below inside this namespace.
    mount(
        None::<&str>,
        "/",
        None::<&str>,
        MsFlags::MS_PRIVATE | MsFlags::MS_REC,
        None::<&str>,
    )
    .map_err(|e| setup_error("remount / as private", e))?;

    let lock_file = tempfile::Builder::new()
        .prefix("xtables-")
        .suffix(".lock")
        .tempfile()
        .map_err(|e| setup_error("create lock file", e))?;

    // Older binaries ignore XTABLES_LOCKFILE and always use the fixed path.
    if Path::new(XTABLES_LOCK_PATH).exists() {
        bind_mount(lock_file.path(), Path::new(XTABLES_LOCK_PATH), true)?;
    }

    if Path::new(NSSWITCH_CONF_PATH).exists() {
        bind_mount(Path::new("/dev/null"), Path::new(NSSWITCH_CONF_PATH), false)?;
    }

    Ok(Sandbox { lock_file })
}

fn bind_mount(source: &Path, target: &Path, read_only: bool) -> Result<(), SandboxError> {
    let context = format!("bind mount {} over {}", source.display(), target.display());

    mount(
        Some(source),
        target,
        None::<&str>,
        MsFlags::MS_BIND,
        None::<&str>,
    )
    .map_err(|e| setup_error(&context, e))?;

    if read_only {
        mount(
            None::<&str>,
            target,
            None::<&str>,
            MsFlags::MS_BIND | MsFlags::MS_REMOUNT | MsFlags::MS_RDONLY,
            None::<&str>,
        )
        .map_err(|e| setup_error(&format!("{} read-only", context), e))?;
    }

    Ok(())
}

pub(crate) fn setup_error(step: &str, err: impl std::fmt::Display) -> SandboxError {
    SandboxError::Setup(format!("{}: {}", step, err))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_missing_namespace_is_a_setup_failure() {
        let config = SandboxConfig::new("/nonexistent/netns/tproxy-test");
        let err = run_sandboxed(&config, Path::new("/bin/true"), &[])
            .await
            .expect_err("namespace does not exist");

        assert!(err.is_setup(), "unexpected error: {}", err);
        assert!(err.to_string().starts_with("setup sandbox: open /nonexistent"));
    }

    #[test]
    fn test_command_errors_are_not_setup_failures() {
        let err = SandboxError::Command {
            path: PathBuf::from("/usr/sbin/iptables"),
            source: std::io::Error::from(std::io::ErrorKind::NotFound),
        };
        assert!(!err.is_setup());
        assert!(!SandboxError::Disconnected.is_setup());
    }
}
