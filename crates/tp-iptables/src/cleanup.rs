use crate::restore::RestoreManager;
use crate::save::parse_save_output;
use anyhow::{Context, Result};
use similar::{ChangeTag, TextDiff};
use tp_core::{Error, InitializedConfig, InitializedConfigIPvX};

/// Remove the rules of every processed address family.
pub async fn cleanup(cfg: &InitializedConfig) -> Result<String> {
    let mut outputs = Vec::new();

    for ipvx in cfg.families() {
        let output = cleanup_ipvx(ipvx)
            .await
            .with_context(|| format!("failed to clean up {} rules", ipvx.family))?;
        if !output.is_empty() {
            outputs.push(output);
        }
    }

    Ok(outputs.join("\n"))
}

/// Save, drop everything this system added, validate, then flush-restore
/// the remainder. Returns the text that was (or in dry-run, would be)
/// restored, or an empty string when nothing had to be done.
pub async fn cleanup_ipvx(cfg: &InitializedConfigIPvX) -> Result<String> {
    let logger = &cfg.logger;
    let manager = RestoreManager::new(cfg);
    let name_prefix = cfg.redirect.name_prefix.as_str();
    let comment_prefix = cfg.comment.prefix.as_str();

    let current = manager.save().await?;
    let has_prefix = contains_marker(&current, name_prefix);
    let has_comment = contains_marker(&current, comment_prefix);

    if !has_prefix && !has_comment {
        logger.info(format!("no transparent proxy {} rules found", cfg.family));
        return Ok(String::new());
    }

    if has_prefix && !has_comment {
        return Err(Error::UnsafeCleanup.into());
    }

    let cleaned = filter_rules(&current, name_prefix, comment_prefix);
    log_summary(cfg, &current, &cleaned);

    if cfg.dry_run {
        logger.info(format!("dry-run: {} rules after cleanup:", cfg.family));
        logger.info_raw(&cleaned);
        logger.info_raw(render_diff(&current, &cleaned));
        return Ok(cleaned);
    }

    manager
        .restore_test(&cleaned)
        .await
        .context("cleaned rules failed validation")?;
    manager.restore_with_flush(&cleaned, true).await?;

    logger.info(format!("transparent proxy {} rules removed", cfg.family));
    Ok(cleaned)
}

/// Drop lines carrying either marker and all `#` comment lines.
pub fn filter_rules(saved: &str, name_prefix: &str, comment_prefix: &str) -> String {
    let kept: Vec<&str> = saved
        .lines()
        .filter(|line| !line.trim_start().starts_with('#'))
        .filter(|line| !contains_marker(line, name_prefix) && !contains_marker(line, comment_prefix))
        .collect();

    if kept.is_empty() {
        return String::new();
    }
    format!("{}\n", kept.join("\n"))
}

fn contains_marker(text: &str, marker: &str) -> bool {
    !marker.is_empty() && text.contains(marker)
}

fn log_summary(cfg: &InitializedConfigIPvX, current: &str, cleaned: &str) {
    match (parse_save_output(current), parse_save_output(cleaned)) {
        (Ok(before), Ok(after)) => {
            let count = |tables: &[crate::save::SavedTable]| -> (usize, usize) {
                tables
                    .iter()
                    .fold((0, 0), |(c, r), t| (c + t.chains.len(), r + t.rules.len()))
            };
            let (chains_before, rules_before) = count(&before);
            let (chains_after, rules_after) = count(&after);
            tracing::debug!(
                "{}: removing {} chains and {} rules",
                cfg.family,
                chains_before.saturating_sub(chains_after),
                rules_before.saturating_sub(rules_after)
            );
        }
        (Err(err), _) | (_, Err(err)) => {
            tracing::debug!("unable to summarize {} cleanup: {:#}", cfg.family, err);
        }
    }
}

fn render_diff(current: &str, cleaned: &str) -> String {
    let diff = TextDiff::from_lines(current, cleaned);
    let mut output = String::new();

    for change in diff.iter_all_changes() {
        let sign = match change.tag() {
            ChangeTag::Delete => '-',
            ChangeTag::Insert => '+',
            ChangeTag::Equal => ' ',
        };
        output.push(sign);
        output.push_str(change.value());
    }

    output
}
