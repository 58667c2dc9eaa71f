//! Durable file primitives.
//!
//! All state that must survive a crash goes through [`durable_write`]:
//! write to a temp file, fsync, then rename over the target. Readers either
//! see the old snapshot or the new one, never a torn write.

use anyhow::{Context, Result};
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

/// Atomically replace `path` with `bytes`.
pub fn durable_write(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory {:?}", parent))?;
        }
    }

    let tmp = path.with_extension("tmp");
    {
        let mut file = File::create(&tmp)
            .with_context(|| format!("Failed to create temp file {:?}", tmp))?;
        file.write_all(bytes)
            .with_context(|| format!("Failed to write temp file {:?}", tmp))?;
        file.sync_all()
            .with_context(|| format!("Failed to fsync {:?}", tmp))?;
    }

    fs::rename(&tmp, path)
        .with_context(|| format!("Failed to rename {:?} -> {:?}", tmp, path))?;
    Ok(())
}

/// Cross-process exclusion for the durable files.
///
/// Acquiring creates the lock file with `create_new`, so a second agent
/// instance pointed at the same data directory fails fast instead of
/// corrupting state. The file is removed on drop.
pub struct ProcessLock {
    path: PathBuf,
}

impl ProcessLock {
    /// Acquire the lock, failing if another live process holds it.
    pub fn acquire(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let mut file = match OpenOptions::new().write(true).create_new(true).open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                anyhow::bail!(
                    "lock file {:?} already exists - another agent instance may be running \
                     (remove it manually if the previous run crashed)",
                    path
                );
            }
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to create lock file {:?}", path))
            }
        };

        writeln!(file, "{}", std::process::id())?;
        Ok(Self {
            path: path.to_path_buf(),
        })
    }
}

impl Drop for ProcessLock {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_durable_write_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");

        durable_write(&path, b"{\"v\":1}").unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"{\"v\":1}");

        // Overwrite leaves no temp file behind
        durable_write(&path, b"{\"v\":2}").unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"{\"v\":2}");
        assert!(!path.with_extension("tmp").exists());
    }

    #[test]
    fn test_process_lock_excludes_second_holder() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agent.lock");

        let lock = ProcessLock::acquire(&path).unwrap();
        assert!(ProcessLock::acquire(&path).is_err());

        drop(lock);
        assert!(ProcessLock::acquire(&path).is_ok());
    }
}
