//! Setup document persistence — atomic, locked, mode 600.
//!
//! `ConfigStore` is the only mutation path for the on-disk document. Every
//! write goes through `update`: load, mutate in memory, serialize the whole
//! document, write to an exclusively-created temp file in the same
//! directory, fsync, rename over the target. A crash mid-write leaves
//! either the previous or the next fully-valid document, never a mix.

use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};

use crate::domain::config::{SCHEMA_VERSION, SetupDocument};
use crate::domain::error::ConfigError;

/// Store for the setup document at `~/.vpnforge/setup.json`.
pub struct ConfigStore {
    path: PathBuf,
}

impl ConfigStore {
    /// Create a store using the default path.
    ///
    /// # Errors
    ///
    /// Returns an error if the home directory cannot be determined.
    pub fn new() -> Result<Self> {
        let home =
            dirs::home_dir().ok_or_else(|| anyhow::anyhow!("cannot determine home directory"))?;
        Ok(Self::with_path(home.join(".vpnforge").join("setup.json")))
    }

    /// Create a store with an explicit path (used in tests).
    #[must_use]
    pub fn with_path(path: PathBuf) -> Self {
        Self { path }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[must_use]
    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Load the document, failing if it does not exist.
    ///
    /// # Errors
    ///
    /// `ConfigError::NotFound` if there is no document,
    /// `ConfigError::Corrupt` if it cannot be parsed,
    /// `ConfigError::UnsupportedVersion` if it was written by a newer build.
    pub fn load(&self) -> Result<SetupDocument> {
        if !self.path.exists() {
            return Err(ConfigError::NotFound.into());
        }
        let content = std::fs::read_to_string(&self.path)
            .with_context(|| format!("reading {}", self.path.display()))?;
        parse_document(&content)
    }

    /// Load the document, creating and persisting a default one if missing.
    ///
    /// # Errors
    ///
    /// Same as `load` for an existing document; write errors for a new one.
    pub fn load_or_init(&self) -> Result<SetupDocument> {
        if self.path.exists() {
            return self.load();
        }
        let doc = SetupDocument::default();
        let _lock = LockGuard::acquire(&self.path)?;
        self.write_atomic(&doc)?;
        Ok(doc)
    }

    /// Read-modify-write the document under the advisory lock.
    ///
    /// `mutate` receives the current document (default if none exists yet).
    /// The store detects external modification between load and write by
    /// comparing content checksums, and refuses to clobber it.
    ///
    /// # Errors
    ///
    /// Lock contention, parse errors, concurrent modification, and I/O
    /// errors, all carrying `ConfigError` in the chain.
    pub fn update<F>(&self, mutate: F) -> Result<SetupDocument>
    where
        F: FnOnce(&mut SetupDocument),
    {
        let _lock = LockGuard::acquire(&self.path)?;

        let loaded_checksum = self.disk_checksum()?;
        let mut doc = if self.path.exists() {
            self.load()?
        } else {
            SetupDocument::default()
        };

        mutate(&mut doc);

        // An external writer that ignores the lock would be clobbered
        // silently without this check.
        let current_checksum = self.disk_checksum()?;
        if current_checksum != loaded_checksum {
            return Err(ConfigError::ConcurrentModification {
                expected: loaded_checksum.unwrap_or_default(),
                found: current_checksum.unwrap_or_default(),
            }
            .into());
        }

        self.write_atomic(&doc)?;
        Ok(doc)
    }

    /// Remove the document (used by tests and a future `reset` command).
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be removed.
    pub fn clear(&self) -> Result<()> {
        if self.path.exists() {
            std::fs::remove_file(&self.path)
                .with_context(|| format!("removing {}", self.path.display()))?;
        }
        Ok(())
    }

    fn disk_checksum(&self) -> Result<Option<String>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let bytes = std::fs::read(&self.path)
            .with_context(|| format!("reading {}", self.path.display()))?;
        let digest = Sha256::digest(&bytes);
        Ok(Some(format!("{digest:x}")))
    }

    fn write_atomic(&self, doc: &SetupDocument) -> Result<()> {
        let parent = self
            .path
            .parent()
            .ok_or_else(|| anyhow::anyhow!("document path has no parent directory"))?;
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating directory {}", parent.display()))?;

        let content = serde_json::to_string_pretty(doc).context("serializing setup document")?;

        // NamedTempFile opens with O_EXCL and a unique suffix in the target
        // directory, so the rename below stays on one filesystem.
        let mut temp = tempfile::NamedTempFile::new_in(parent)
            .with_context(|| format!("creating temp file in {}", parent.display()))?;
        temp.write_all(content.as_bytes())
            .context("writing setup document")?;
        temp.as_file().sync_all().context("syncing setup document")?;

        // rollback_data may reference sensitive snapshots; owner-only before
        // the document becomes visible under its final name.
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            temp.as_file()
                .set_permissions(std::fs::Permissions::from_mode(0o600))
                .context("setting permissions on setup document")?;
        }

        temp.persist(&self.path)
            .with_context(|| format!("finalizing {}", self.path.display()))?;
        Ok(())
    }
}

fn parse_document(content: &str) -> Result<SetupDocument> {
    let doc: SetupDocument = serde_json::from_str(content)
        .map_err(|e| ConfigError::Corrupt(e.to_string()))
        .context("parsing setup document")?;
    if doc.version > SCHEMA_VERSION {
        return Err(ConfigError::UnsupportedVersion {
            found: doc.version,
            supported: SCHEMA_VERSION,
        }
        .into());
    }
    Ok(doc)
}

/// Advisory lock: an exclusively-created `.lock` file next to the document,
/// holding the owner's PID. Removed on drop. A second invocation fails fast
/// instead of blocking; a lock whose recorded holder is no longer alive is
/// reclaimed, since a killed process never reaches `Drop`.
struct LockGuard {
    path: PathBuf,
}

impl LockGuard {
    fn acquire(document_path: &Path) -> Result<Self> {
        let path = document_path.with_extension("json.lock");
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating directory {}", parent.display()))?;
        }
        match Self::try_create(&path) {
            Ok(guard) => Ok(guard),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                let holder_pid = std::fs::read_to_string(&path)
                    .ok()
                    .and_then(|s| s.trim().parse::<i32>().ok());
                let holder = holder_pid
                    .map_or_else(|| "unknown pid".to_string(), |pid| format!("pid {pid}"));
                // An unparseable holder is treated as live; only a provably
                // dead PID releases the lock.
                if let Some(pid) = holder_pid
                    && !process_alive(pid)
                {
                    let _ = std::fs::remove_file(&path);
                    return Self::try_create(&path)
                        .map_err(|_| anyhow::Error::from(ConfigError::Locked { holder }));
                }
                Err(ConfigError::Locked { holder }.into())
            }
            Err(e) => {
                Err(anyhow::Error::from(e).context(format!("creating lock {}", path.display())))
            }
        }
    }

    fn try_create(path: &Path) -> std::io::Result<Self> {
        let mut file = std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)?;
        let _ = writeln!(file, "{}", std::process::id());
        Ok(Self {
            path: path.to_path_buf(),
        })
    }
}

/// Signal-0 liveness check. `EPERM` still means a live process; only
/// `ESRCH` means the PID is gone.
#[cfg(unix)]
fn process_alive(pid: i32) -> bool {
    !matches!(
        nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid), None),
        Err(nix::errno::Errno::ESRCH)
    )
}

#[cfg(not(unix))]
fn process_alive(_pid: i32) -> bool {
    true
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}
