//! Transparent traffic interception for a sidecar proxy.
//!
//! [`setup`] and [`cleanup`] resolve the host facts a [`Config`] needs and
//! dispatch to the packet-filter backend or, with `ebpf.enabled`, to the
//! kernel-program backend.

use anyhow::{Context, Result};

pub use tp_core::{Config, Error, InitializedConfig};

/// Install interception. Returns the captured tool output, or the rules
/// that would be applied in dry-run.
pub async fn setup(cfg: &Config) -> Result<String> {
    let initialized = cfg
        .initialize()
        .await
        .context("failed to initialize the transparent proxy configuration")?;

    if initialized.ebpf.enabled {
        tracing::debug!("setting up the eBPF backend");
        return tp_ebpf::setup(&initialized).await.context("eBPF setup failed");
    }

    tp_iptables::setup(&initialized)
        .await
        .context("iptables setup failed")
}

/// Remove interception installed by [`setup`].
pub async fn cleanup(cfg: &Config) -> Result<String> {
    let initialized = cfg
        .initialize()
        .await
        .context("failed to initialize the transparent proxy configuration")?;

    if initialized.ebpf.enabled {
        tracing::debug!("cleaning up the eBPF backend");
        return tp_ebpf::cleanup(&initialized)
            .await
            .context("eBPF cleanup failed");
    }

    tp_iptables::cleanup(&initialized)
        .await
        .context("iptables cleanup failed")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_ebpf_dry_run_cleanup_lists_pinned_paths() {
        let mut cfg = Config::default();
        cfg.dry_run = true;
        cfg.ebpf.enabled = true;
        cfg.ebpf.bpffs_path = "/run/test/bpf".into();

        let output = cleanup(&cfg).await.expect("dry-run cleanup");
        assert!(output.lines().all(|l| l.starts_with("/run/test/bpf/")));
        assert!(output.contains("/run/test/bpf/connect"));
    }
}
