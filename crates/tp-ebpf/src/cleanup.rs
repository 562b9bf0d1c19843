use crate::mounts::{BPF_FS, find_mount, read_mountinfo};
use crate::programs::Programs;
use crate::setup::require_root;
use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use tp_core::InitializedConfig;

pub async fn cleanup(cfg: &InitializedConfig) -> Result<String> {
    cleanup_with(cfg, &Programs::default()).await
}

/// Remove the pinned objects of every program. Never mounts anything.
pub async fn cleanup_with(cfg: &InitializedConfig, programs: &Programs) -> Result<String> {
    let logger = &cfg.logger;

    if cfg.dry_run {
        let paths = programs
            .iter()
            .flat_map(|p| p.pinned_paths(&cfg.ebpf.bpffs_path))
            .map(|p| p.display().to_string())
            .collect::<Vec<_>>()
            .join("\n");
        logger.info("dry-run: pinned eBPF objects that would be removed:");
        logger.info_raw(&paths);
        return Ok(paths);
    }

    require_root()?;

    let mounts = read_mountinfo()?;
    let bpffs = find_mount(&mounts, BPF_FS, &cfg.ebpf.bpffs_path)
        .context("cannot clean up eBPF programs")?;

    let removed = remove_pinned(programs, &bpffs)?;
    logger.info(format!(
        "removed {} pinned eBPF objects from {}",
        removed.len(),
        bpffs.display()
    ));

    Ok(removed
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join("\n"))
}

/// Delete each program's pinned paths under `bpffs`; absent paths are skipped.
pub fn remove_pinned(programs: &Programs, bpffs: &Path) -> Result<Vec<PathBuf>> {
    let mut removed = Vec::new();

    for path in programs.iter().flat_map(|p| p.pinned_paths(bpffs)) {
        let result = match std::fs::symlink_metadata(&path) {
            Ok(meta) if meta.is_dir() => std::fs::remove_dir_all(&path),
            Ok(_) => std::fs::remove_file(&path),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!("{} already removed", path.display());
                continue;
            }
            Err(err) => Err(err),
        };

        result.with_context(|| format!("failed to remove {}", path.display()))?;
        removed.push(path);
    }

    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remove_pinned_tolerates_missing_paths() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(dir.path().join("connect"), b"").expect("pin file");
        std::fs::create_dir(dir.path().join("tc")).expect("pin dir");
        std::fs::write(dir.path().join("tc").join("ingress"), b"").expect("nested pin");
        std::fs::write(dir.path().join("unrelated"), b"").expect("foreign file");

        let removed = remove_pinned(&Programs::default(), dir.path()).expect("cleanup");
        assert_eq!(removed, vec![dir.path().join("connect"), dir.path().join("tc")]);

        assert!(!dir.path().join("connect").exists());
        assert!(!dir.path().join("tc").exists());
        assert!(dir.path().join("unrelated").exists());

        let removed = remove_pinned(&Programs::default(), dir.path()).expect("second run");
        assert!(removed.is_empty());
    }
}
