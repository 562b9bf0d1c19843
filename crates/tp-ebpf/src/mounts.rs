use anyhow::{Context, Result};
use nix::mount::{MsFlags, mount};
use std::path::{Path, PathBuf};
use tp_core::Error;

pub const MOUNTINFO_PATH: &str = "/proc/self/mountinfo";
pub const CGROUP2_FS: &str = "cgroup2";
pub const BPF_FS: &str = "bpf";

/// One line of `/proc/<pid>/mountinfo`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountEntry {
    pub mount_point: PathBuf,
    pub fs_type: String,
    pub source: String,
    pub options: Vec<String>,
}

impl MountEntry {
    pub fn is_read_only(&self) -> bool {
        self.options.iter().any(|o| o == "ro")
    }
}

/// Parse mountinfo text. Malformed lines are skipped.
///
/// Format: `id parent major:minor root mount-point options [optional..] - fstype source super-options`
pub fn parse_mountinfo(text: &str) -> Vec<MountEntry> {
    text.lines().filter_map(parse_mountinfo_line).collect()
}

fn parse_mountinfo_line(line: &str) -> Option<MountEntry> {
    let (head, tail) = line.split_once(" - ")?;
    let head: Vec<&str> = head.split_whitespace().collect();
    let mut tail = tail.split_whitespace();

    if head.len() < 6 {
        return None;
    }

    Some(MountEntry {
        mount_point: PathBuf::from(unescape(head[4])),
        options: head[5].split(',').map(str::to_string).collect(),
        fs_type: tail.next()?.to_string(),
        source: tail.next().unwrap_or_default().to_string(),
    })
}

// mountinfo escapes space, tab, newline and backslash as \ooo.
fn unescape(field: &str) -> String {
    let bytes = field.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;

    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 3 < bytes.len() {
            let octal = std::str::from_utf8(&bytes[i + 1..i + 4]).ok();
            if let Some(value) = octal.and_then(|o| u8::from_str_radix(o, 8).ok()) {
                out.push(value);
                i += 4;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }

    String::from_utf8_lossy(&out).to_string()
}

pub fn read_mountinfo() -> Result<Vec<MountEntry>> {
    let text = std::fs::read_to_string(MOUNTINFO_PATH)
        .with_context(|| format!("failed to read {}", MOUNTINFO_PATH))?;
    Ok(parse_mountinfo(&text))
}

/// Locate the single writable mount of `fs_type`.
///
/// A mount exactly at `preferred` wins over other mounts of the same type.
pub fn find_mount(entries: &[MountEntry], fs_type: &str, preferred: &Path) -> Result<PathBuf> {
    let matches: Vec<&MountEntry> = entries.iter().filter(|e| e.fs_type == fs_type).collect();

    let entry = match matches.iter().find(|e| e.mount_point == preferred) {
        Some(entry) => *entry,
        None => match matches.as_slice() {
            [] => {
                return Err(Error::MountMissing {
                    fs: fs_type.to_string(),
                    path: preferred.to_path_buf(),
                }
                .into());
            }
            [entry] => *entry,
            many => {
                return Err(Error::MountAmbiguous {
                    fs: fs_type.to_string(),
                    mounts: many
                        .iter()
                        .map(|e| e.mount_point.display().to_string())
                        .collect(),
                }
                .into());
            }
        },
    };

    if entry.is_read_only() {
        return Err(Error::MountReadOnly {
            path: entry.mount_point.clone(),
        }
        .into());
    }

    Ok(entry.mount_point.clone())
}

/// Like [`find_mount`], but mounts `fs_type` at `target` when no mount
/// exists and `target` is missing or an empty directory.
pub fn ensure_mount(entries: &[MountEntry], fs_type: &str, target: &Path) -> Result<PathBuf> {
    match find_mount(entries, fs_type, target) {
        Ok(path) => Ok(path),
        Err(err) if is_missing(&err) => {
            if !is_empty_or_missing(target)? {
                return Err(err).with_context(|| {
                    format!(
                        "refusing to mount {} over non-empty directory {}",
                        fs_type,
                        target.display()
                    )
                });
            }

            std::fs::create_dir_all(target)
                .with_context(|| format!("failed to create {}", target.display()))?;
            mount(
                Some(fs_type),
                target,
                Some(fs_type),
                MsFlags::empty(),
                None::<&str>,
            )
            .with_context(|| format!("failed to mount {} at {}", fs_type, target.display()))?;

            tracing::info!("[tproxy] mounted {} at {}", fs_type, target.display());
            Ok(target.to_path_buf())
        }
        Err(err) => Err(err),
    }
}

fn is_missing(err: &anyhow::Error) -> bool {
    matches!(err.downcast_ref::<Error>(), Some(Error::MountMissing { .. }))
}

fn is_empty_or_missing(path: &Path) -> Result<bool> {
    match std::fs::read_dir(path) {
        Ok(mut entries) => Ok(entries.next().is_none()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(true),
        Err(err) => Err(err).with_context(|| format!("failed to read {}", path.display())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MOUNTINFO: &str = "\
22 28 0:21 / /proc rw,nosuid,nodev,noexec,relatime shared:12 - proc proc rw
30 28 0:26 / /sys/fs/cgroup rw,nosuid,nodev,noexec,relatime shared:9 - cgroup2 cgroup2 rw,nsdelegate
35 28 0:30 / /sys/fs/bpf rw,nosuid,nodev,noexec,relatime shared:15 - bpf bpf rw,mode=700
91 30 0:44 / /run/tproxy/bpf rw,relatime - bpf none rw
92 28 0:45 / /mnt/with\\040space ro,relatime - ext4 /dev/sda1 ro
broken line
";

    #[test]
    fn test_parse_mountinfo() {
        let entries = parse_mountinfo(MOUNTINFO);
        assert_eq!(entries.len(), 5);

        assert_eq!(entries[1].mount_point, PathBuf::from("/sys/fs/cgroup"));
        assert_eq!(entries[1].fs_type, "cgroup2");
        assert!(!entries[1].is_read_only());

        assert_eq!(entries[4].mount_point, PathBuf::from("/mnt/with space"));
        assert_eq!(entries[4].source, "/dev/sda1");
        assert!(entries[4].is_read_only());
    }

    #[test]
    fn test_find_single_mount() {
        let entries = parse_mountinfo(MOUNTINFO);
        let path = find_mount(&entries, CGROUP2_FS, Path::new("/cgroup")).expect("one cgroup2 mount");
        assert_eq!(path, PathBuf::from("/sys/fs/cgroup"));
    }

    #[test]
    fn test_preferred_mount_resolves_ambiguity() {
        let entries = parse_mountinfo(MOUNTINFO);
        let path = find_mount(&entries, BPF_FS, Path::new("/run/tproxy/bpf")).expect("preferred");
        assert_eq!(path, PathBuf::from("/run/tproxy/bpf"));

        let err = find_mount(&entries, BPF_FS, Path::new("/elsewhere")).expect_err("two bpf mounts");
        match err.downcast_ref::<Error>() {
            Some(Error::MountAmbiguous { mounts, .. }) => assert_eq!(mounts.len(), 2),
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_missing_and_read_only_mounts() {
        let entries = parse_mountinfo(MOUNTINFO);

        let err = find_mount(&entries, "tmpfs", Path::new("/tmp")).expect_err("no tmpfs");
        assert!(is_missing(&err));

        let err = find_mount(&entries, "ext4", Path::new("/mnt")).expect_err("read-only");
        assert!(matches!(err.downcast_ref::<Error>(), Some(Error::MountReadOnly { .. })));
    }

    #[test]
    fn test_ensure_mount_refuses_non_empty_target() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(dir.path().join("keep"), b"data").expect("write");

        let err = ensure_mount(&[], BPF_FS, dir.path()).expect_err("must not mount over files");
        assert!(is_missing(&err));
        assert!(dir.path().join("keep").exists());
    }

    #[test]
    fn test_empty_or_missing() {
        let dir = tempfile::tempdir().expect("tempdir");
        assert!(is_empty_or_missing(dir.path()).expect("readable"));
        assert!(is_empty_or_missing(&dir.path().join("absent")).expect("missing is fine"));
    }
}
