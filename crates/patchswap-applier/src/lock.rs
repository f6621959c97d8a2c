use anyhow::{Context, Result};
use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

use patchswap_core::UpdateError;

/// Answers whether some other process currently holds a directory.
pub trait LockProbe: Send + Sync {
    fn is_held(&self, root: &Path) -> Result<bool>;
}

/// Probes the sentinel file the running application keeps locked inside its
/// install directory. A missing sentinel means nobody holds the directory.
#[derive(Debug, Clone)]
pub struct SentinelLockProbe {
    sentinel: String,
}

impl SentinelLockProbe {
    pub fn new(sentinel: impl Into<String>) -> Self {
        Self {
            sentinel: sentinel.into(),
        }
    }
}

impl LockProbe for SentinelLockProbe {
    fn is_held(&self, root: &Path) -> Result<bool> {
        let path = root.join(&self.sentinel);
        if !path.exists() {
            return Ok(false);
        }
        let acquired = match open_exclusive(&path, false) {
            Ok(Some(file)) => {
                drop(file);
                true
            }
            Ok(None) => false,
            Err(err) if err.kind() == io::ErrorKind::NotFound => true,
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("failed probing lock sentinel: {}", path.display()));
            }
        };
        Ok(!acquired)
    }
}

/// Holds a directory's sentinel lock until dropped. The application side of
/// the protocol, also used by the CLI `probe-lock --hold` mode.
#[derive(Debug)]
pub struct DirectoryLock {
    path: PathBuf,
    _file: File,
}

impl DirectoryLock {
    pub fn acquire(root: &Path, sentinel: &str) -> Result<Self> {
        fs::create_dir_all(root).with_context(|| format!("failed to create {}", root.display()))?;
        let path = root.join(sentinel);
        match open_exclusive(&path, true)
            .with_context(|| format!("failed to open lock sentinel: {}", path.display()))?
        {
            Some(file) => Ok(Self { path, _file: file }),
            None => Err(UpdateError::LockContention(path.display().to_string()).into()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Opens `path` and takes a non-blocking exclusive lock on it. `Ok(None)`
/// means another handle already owns the lock.
#[cfg(unix)]
fn open_exclusive(path: &Path, create: bool) -> io::Result<Option<File>> {
    use std::os::unix::io::AsRawFd;

    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(create)
        .truncate(false)
        .open(path)?;
    // SAFETY: the descriptor is owned by `file` and stays open for the call.
    let result = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
    if result == 0 {
        return Ok(Some(file));
    }
    let err = io::Error::last_os_error();
    if err.kind() == io::ErrorKind::WouldBlock || err.raw_os_error() == Some(libc::EWOULDBLOCK) {
        return Ok(None);
    }
    Err(err)
}

#[cfg(windows)]
fn open_exclusive(path: &Path, create: bool) -> io::Result<Option<File>> {
    use std::os::windows::fs::OpenOptionsExt;

    const ERROR_SHARING_VIOLATION: i32 = 32;
    match OpenOptions::new()
        .read(true)
        .write(true)
        .create(create)
        .truncate(false)
        .share_mode(0)
        .open(path)
    {
        Ok(file) => Ok(Some(file)),
        Err(err) if err.raw_os_error() == Some(ERROR_SHARING_VIOLATION) => Ok(None),
        Err(err) => Err(err),
    }
}

#[cfg(not(any(unix, windows)))]
fn open_exclusive(path: &Path, create: bool) -> io::Result<Option<File>> {
    OpenOptions::new()
        .read(true)
        .write(true)
        .create(create)
        .truncate(false)
        .open(path)
        .map(Some)
}
