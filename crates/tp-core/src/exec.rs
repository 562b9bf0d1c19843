use crate::error::Error;
use anyhow::{Context, Result};
use std::os::unix::process::ExitStatusExt;
use std::path::Path;
use std::process::Output;
use tp_netns::{SandboxConfig, SandboxError, run_sandboxed};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
}

/// Run a resolved binary by path, capturing stdout and stderr separately.
///
/// With a sandbox the command runs inside the target namespaces; when the
/// sandbox cannot be set up the command runs directly with a warning.
pub async fn exec_cmd(
    path: &Path,
    args: &[String],
    sandbox: Option<&SandboxConfig>,
) -> Result<CommandOutput> {
    tracing::debug!("executing {} {}", path.display(), args.join(" "));

    let output = match sandbox {
        Some(sandbox) => match run_sandboxed(sandbox, path, args).await {
            Ok(output) => output,
            Err(SandboxError::Setup(reason)) => {
                tracing::warn!(
                    "[tproxy] unable to enter sandbox ({}), running {} without it",
                    reason,
                    path.display()
                );
                run_direct(path, args).await?
            }
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("Failed to execute {}", path.display()));
            }
        },
        None => run_direct(path, args).await?,
    };

    into_result(path, output)
}

async fn run_direct(path: &Path, args: &[String]) -> Result<Output> {
    tokio::process::Command::new(path)
        .args(args)
        .kill_on_drop(true)
        .output()
        .await
        .with_context(|| format!("Failed to execute {}", path.display()))
}

fn into_result(path: &Path, output: Output) -> Result<CommandOutput> {
    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();

    if !output.status.success() {
        return Err(Error::CommandFailed {
            path: path.to_path_buf(),
            status: output.status.to_string(),
            code: output.status.code(),
            signal: output.status.signal(),
            stderr,
        }
        .into());
    }

    Ok(CommandOutput { stdout, stderr })
}
