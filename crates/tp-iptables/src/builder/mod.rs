pub mod mangle;
pub mod nat;
pub mod raw;

pub use mangle::*;
pub use nat::*;
pub use raw::*;

use crate::parameters::{Parameter, comment};
use anyhow::{Context, Result};
use tp_core::InitializedConfigIPvX;

/// Render raw, nat and mangle, in that order, as `iptables-restore` input.
/// Empty tables are left out.
pub fn build_iptables_for_restore(cfg: &InitializedConfigIPvX) -> Result<String> {
    let tables = [
        build_raw_table(cfg).context("failed to build raw table")?,
        build_nat_table(cfg).context("failed to build nat table")?,
        build_mangle_table(cfg).context("failed to build mangle table")?,
    ];

    let rendered: Vec<String> = tables
        .iter()
        .map(|table| table.build_for_restore(cfg.verbose))
        .filter(|block| !block.is_empty())
        .collect();

    if rendered.is_empty() {
        return Ok(String::new());
    }

    let separator = if cfg.verbose { "\n\n" } else { "\n" };
    Ok(format!("{}\n", rendered.join(separator)))
}

/// `-m comment --comment "<prefix>/<text>"` when rule comments are enabled.
pub(crate) fn rule_comment(cfg: &InitializedConfigIPvX, text: &str) -> Option<Parameter> {
    cfg.comment
        .enabled
        .then(|| comment(format!("{}/{}", cfg.comment.prefix, text)))
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::Arc;
    use tp_core::*;

    /// Per-family config over assumed binaries, with comments off unless
    /// the caller turns them back on.
    pub fn ipvx(cfg: &Config, family: IpFamily) -> InitializedConfigIPvX {
        ipvx_with(cfg, family, InitializedExecutables::assumed(family, IptablesMode::Nft), &[])
    }

    pub fn ipvx_with(
        cfg: &Config,
        family: IpFamily,
        executables: InitializedExecutables,
        nameservers: &[std::net::IpAddr],
    ) -> InitializedConfigIPvX {
        let mut cfg = cfg.clone();
        cfg.comment.disabled = true;
        InitializedConfigIPvX::new(
            &cfg,
            family,
            executables,
            "lo",
            "5678",
            nameservers,
            Arc::new(Logger::default()),
        )
        .expect("valid config")
    }
}
