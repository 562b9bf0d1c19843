use crate::builder::build_iptables_for_restore;
use crate::restore::RestoreManager;
use anyhow::{Context, Result};
use tp_core::{InitializedConfig, InitializedConfigIPvX};

/// Install the redirection rules for IPv4 and, when initialized, IPv6.
///
/// Families are processed one after the other. The outputs of the
/// individual families are joined by a newline.
pub async fn setup(cfg: &InitializedConfig) -> Result<String> {
    let mut outputs = Vec::new();

    for ipvx in cfg.families() {
        let output = setup_ipvx(ipvx)
            .await
            .with_context(|| format!("failed to set up {} rules", ipvx.family))?;
        if !output.is_empty() {
            outputs.push(output);
        }
    }

    Ok(outputs.join("\n"))
}

/// Render and apply one family's rules. In dry-run the rendered rules are
/// returned without touching the system.
pub async fn setup_ipvx(cfg: &InitializedConfigIPvX) -> Result<String> {
    let logger = &cfg.logger;
    let rules = build_iptables_for_restore(cfg)?;

    if rules.is_empty() {
        logger.info(format!("no {} rules to apply", cfg.family));
        return Ok(String::new());
    }

    if cfg.dry_run {
        logger.info(format!("dry-run: {} rules that would be applied:", cfg.family));
        logger.info_raw(&rules);
        return Ok(rules);
    }

    tracing::debug!("{} rules:\n{}", cfg.family, rules);
    let output = RestoreManager::new(cfg).restore(&rules).await?;
    logger.info(format!(
        "{} rules applied with {}",
        cfg.family,
        cfg.executables.restore.path.display()
    ));

    Ok(output)
}
