use anyhow::{Context, Result};
use std::io::Write;
use std::path::Path;
use tempfile::NamedTempFile;
use tp_core::*;

/// Applies rendered rules through the resolved `*-restore` binary of one
/// address family.
pub struct RestoreManager<'a> {
    cfg: &'a InitializedConfigIPvX,
}

impl<'a> RestoreManager<'a> {
    pub fn new(cfg: &'a InitializedConfigIPvX) -> Self {
        Self { cfg }
    }

    /// Apply on top of the existing rules (`--noflush`), retrying on failure.
    pub async fn restore(&self, rules: &str) -> Result<String> {
        let file = self.write_rules_file(rules, None)?;
        self.restore_file(file.path(), false).await
    }

    /// Replace the tables named in `rules`. With `restore_on_error` the
    /// previous state is saved first and reapplied when the new rules fail.
    pub async fn restore_with_flush(&self, rules: &str, restore_on_error: bool) -> Result<String> {
        let backup = if restore_on_error {
            Some(self.backup().await?)
        } else {
            None
        };

        let file = self.write_rules_file(rules, None)?;
        let apply_err = match self.restore_file(file.path(), true).await {
            Ok(output) => return Ok(output),
            Err(err) => err,
        };

        let Some(backup) = backup else {
            return Err(apply_err);
        };

        let logger = &self.cfg.logger;
        logger.warn(format!(
            "restoring the previous rules from {}",
            backup.path().display()
        ));

        match self.exec_restore(&[&path_arg(backup.path())]).await {
            Ok(_) => Err(apply_err.context("rules could not be applied, the previous rules were restored")),
            Err(restore_err) => {
                let backup_path = match backup.keep() {
                    Ok((_, path)) => path,
                    Err(err) => err.file.path().to_path_buf(),
                };
                Err(Error::RollbackFailed {
                    apply: format!("{:#}", apply_err),
                    restore: format!("{:#}", restore_err),
                    backup: backup_path,
                }
                .into())
            }
        }
    }

    /// Validate without applying (`--test`).
    pub async fn restore_test(&self, rules: &str) -> Result<String> {
        let file = self.write_rules_file(rules, None)?;
        let path = path_arg(file.path());

        match self.exec_restore(&[FLAG_TEST, &path]).await {
            Ok(output) => Ok(output.stdout),
            Err(err) if self.is_known_test_segfault(&err) => {
                self.cfg.logger.warn(format!(
                    "{} crashed while validating rules, which is a known issue of some \
                     nf_tables builds; continuing without validation",
                    self.cfg.executables.restore.path.display()
                ));
                Ok(String::new())
            }
            Err(err) => Err(err).context("rules are not valid"),
        }
    }

    pub async fn save(&self) -> Result<String> {
        let save = &self.cfg.executables.save;
        let output = save
            .exec(&[])
            .await
            .with_context(|| format!("failed to save current rules with {}", save.path.display()))?;
        Ok(output.stdout)
    }

    async fn backup(&self) -> Result<NamedTempFile> {
        let current = self.save().await?;
        let timestamp = chrono::Local::now().format("%Y-%m-%d-%H%M%S").to_string();
        let backup = self.write_rules_file(&current, Some(&timestamp))?;
        tracing::debug!("saved current rules to {}", backup.path().display());
        Ok(backup)
    }

    async fn restore_file(&self, path: &Path, flush: bool) -> Result<String> {
        let path = path_arg(path);
        let mut args: Vec<&str> = vec![];
        if !flush {
            args.push(FLAG_NO_FLUSH);
        }
        args.push(&path);

        let logger = &self.cfg.logger;
        let attempts = self.cfg.retry.attempts();
        let mut last_err = None;

        for attempt in 1..=attempts {
            logger.set_try(attempt);

            match self.exec_restore(&args).await {
                Ok(output) => {
                    logger.reset_try();
                    return Ok(output.stdout);
                }
                Err(err) => {
                    logger.error_try("failed to apply rules", &err);
                    last_err = Some(err);
                }
            }

            if attempt < attempts {
                tokio::time::sleep(self.cfg.retry.sleep_between_retries).await;
            }
        }

        logger.reset_try();
        let err = last_err.unwrap_or_else(|| anyhow::anyhow!("no restore attempt was made"));
        Err(err.context(Error::RestoreFailed {
            path: self.cfg.executables.restore.path.clone(),
            attempts,
        }))
    }

    async fn exec_restore(&self, args: &[&str]) -> Result<CommandOutput> {
        let restore = &self.cfg.executables.restore;
        tracing::debug!("running {}", restore.command_line(args));
        restore.exec(args).await
    }

    fn is_known_test_segfault(&self, err: &anyhow::Error) -> bool {
        self.cfg.executables.mode == IptablesMode::Nft
            && err
                .downcast_ref::<Error>()
                .map(Error::is_segfault)
                .unwrap_or(false)
    }

    /// `<prefix>-rules.[<timestamp>.]XXXXXX.txt[.backup]` in the temp dir.
    fn write_rules_file(&self, rules: &str, timestamp: Option<&str>) -> Result<NamedTempFile> {
        let prefix = match timestamp {
            Some(ts) => format!("{}.{}.", self.cfg.executables.rules_file_prefix(), ts),
            None => format!("{}.", self.cfg.executables.rules_file_prefix()),
        };
        let suffix = if timestamp.is_some() {
            ".txt.backup"
        } else {
            ".txt"
        };

        let mut file = tempfile::Builder::new()
            .prefix(&prefix)
            .suffix(suffix)
            .tempfile()
            .context("failed to create rules file")?;
        file.write_all(rules.as_bytes())
            .and_then(|_| file.flush())
            .with_context(|| format!("failed to write rules to {}", file.path().display()))?;
        Ok(file)
    }
}

fn path_arg(path: &Path) -> String {
    path.display().to_string()
}
