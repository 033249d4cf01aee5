//! Low-level filesystem helpers: exclusive lock files, free-space
//! probing and directory durability

use anyhow::{Context, Result, anyhow};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;

/// Tries to take an exclusive advisory lock on `path`, creating the file
/// if needed.
///
/// Returns `Ok(None)` when the lock is held by another process. The lock
/// is released when the returned file handle is dropped.
#[cfg(unix)]
pub(crate) fn try_lock_file(path: &Path) -> Result<Option<File>> {
    use std::io;
    use std::os::unix::io::AsRawFd;

    let mut file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(false)
        .open(path)
        .with_context(|| format!("cannot open lock file {}", path.display()))?;

    let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
    if rc != 0 {
        let err = io::Error::last_os_error();
        if err.kind() == io::ErrorKind::WouldBlock {
            return Ok(None);
        }
        return Err(err).with_context(|| format!("cannot lock {}", path.display()));
    }

    // Record the owning pid so operators can tell who holds the storage.
    file.set_len(0)?;
    writeln!(file, "{}", std::process::id())
        .with_context(|| format!("cannot write pid to {}", path.display()))?;
    Ok(Some(file))
}

#[cfg(not(unix))]
pub(crate) fn try_lock_file(path: &Path) -> Result<Option<File>> {
    // No flock outside unix; fall back to create_new so a stale lock file
    // requires manual removal.
    match OpenOptions::new().create_new(true).write(true).open(path) {
        Ok(file) => Ok(Some(file)),
        Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => Ok(None),
        Err(err) => Err(err).with_context(|| format!("cannot create lock file {}", path.display())),
    }
}

/// Returns the number of bytes available to unprivileged users on the
/// filesystem holding `path`.
#[cfg(unix)]
pub(crate) fn free_disk_space(path: &Path) -> Result<u64> {
    use std::ffi::CString;
    use std::os::unix::ffi::OsStrExt;

    let cpath = CString::new(path.as_os_str().as_bytes())
        .with_context(|| format!("path {} contains NUL", path.display()))?;
    let mut out: libc::statvfs = unsafe { std::mem::zeroed() };
    let rc = unsafe { libc::statvfs(cpath.as_ptr(), &mut out) };
    if rc != 0 {
        return Err(anyhow!(std::io::Error::last_os_error()))
            .with_context(|| format!("statvfs failed for {}", path.display()));
    }
    Ok(out.f_bavail as u64 * out.f_frsize as u64)
}

#[cfg(not(unix))]
pub(crate) fn free_disk_space(_path: &Path) -> Result<u64> {
    Ok(u64::MAX)
}

/// Fsyncs a directory so that entry creation/removal inside it survives
/// a crash.
pub(crate) fn fsync_dir(path: &Path) -> Result<()> {
    let dir = File::open(path).with_context(|| format!("cannot open dir {}", path.display()))?;
    dir.sync_all()
        .with_context(|| format!("cannot fsync dir {}", path.display()))
}
