use anyhow::{Context, Result};
use std::io::Write;
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};

/// Mode of materialized program binaries.
pub const PROGRAM_MODE: u32 = 0o744;

/// Read-only lookup of program binaries by name.
pub trait BlobSource {
    fn read(&self, name: &str) -> Result<Vec<u8>>;
}

/// Blobs stored as files named after the program in one directory.
#[derive(Debug, Clone)]
pub struct DirectorySource {
    root: PathBuf,
}

impl DirectorySource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl BlobSource for DirectorySource {
    fn read(&self, name: &str) -> Result<Vec<u8>> {
        let path = self.root.join(name);
        std::fs::read(&path)
            .with_context(|| format!("failed to read program {} from {}", name, path.display()))
    }
}

/// Write the blob `name` into `dir` and return the executable's path.
pub fn materialize(source: &dyn BlobSource, name: &str, dir: &Path) -> Result<PathBuf> {
    let blob = source.read(name)?;
    std::fs::create_dir_all(dir).with_context(|| format!("failed to create {}", dir.display()))?;

    let path = dir.join(name);
    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(PROGRAM_MODE)
        .open(&path)
        .with_context(|| format!("failed to create {}", path.display()))?;
    file.write_all(&blob)
        .with_context(|| format!("failed to write {}", path.display()))?;

    // An existing file keeps its old mode through open().
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(PROGRAM_MODE))
        .with_context(|| format!("failed to set permissions on {}", path.display()))?;

    Ok(path)
}
