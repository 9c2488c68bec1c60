//! Daemon-side singleton enforcement: bind-then-lock.
//!
//! The bind is the fast authoritative test — the kernel refuses a second
//! bind on the same path. The file lock closes the remaining race where two
//! daemons both observe an unlinked stale socket and both win the bind.

use std::path::{Path, PathBuf};

use fs2::FileExt;
use thiserror::Error;
use tokio::net::UnixListener;

#[derive(Debug, Error)]
pub enum SingletonError {
    #[error("another daemon already owns {0}")]
    AlreadyRunning(PathBuf),
    #[error("failed to bind socket at {0}: {1}")]
    BindFailed(PathBuf, std::io::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Held for the daemon process lifetime. Dropping releases the advisory lock
/// (the OS releases it on fd close regardless, this makes it explicit) and
/// unlinks the socket and lock files.
pub struct SingletonGuard {
    pub listener: UnixListener,
    socket_path: PathBuf,
    lock_path: PathBuf,
    _lock_file: std::fs::File,
}

impl Drop for SingletonGuard {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self._lock_file);
        let _ = std::fs::remove_file(&self.socket_path);
        let _ = std::fs::remove_file(&self.lock_path);
    }
}

fn lock_path_for(socket_path: &Path) -> PathBuf {
    let mut p = socket_path.to_path_buf();
    let stem = p
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| "daemon".to_string());
    p.set_file_name(format!("{stem}.lock"));
    p
}

/// Attempt to become the sole owner of `socket_path`. On success returns a
/// guard holding the bound listener and the lock. On "another daemon already
/// owns this socket" the caller should treat it as success-and-exit (
/// step 2/4), not as a hard failure — `SingletonError::AlreadyRunning`
/// distinguishes that case from genuine startup failures.
pub async fn bind_singleton(socket_path: &Path) -> Result<SingletonGuard, SingletonError> {
    if let Some(parent) = socket_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let listener = match UnixListener::bind(socket_path) {
        Ok(l) => l,
        Err(e) if e.kind() == std::io::ErrorKind::AddrInUse => {
            return Err(SingletonError::AlreadyRunning(socket_path.to_path_buf()));
        }
        Err(e) if is_stale_socket(socket_path, &e) => {
            // Socket file exists but nothing is listening; unlink and retry once.
            std::fs::remove_file(socket_path)?;
            UnixListener::bind(socket_path)
                .map_err(|e| SingletonError::BindFailed(socket_path.to_path_buf(), e))?
        }
        Err(e) => return Err(SingletonError::BindFailed(socket_path.to_path_buf(), e)),
    };

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let _ = std::fs::set_permissions(socket_path, std::fs::Permissions::from_mode(0o600));
    }

    let lock_path = lock_path_for(socket_path);
    let lock_file = std::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(false)
        .open(&lock_path)?;

    if lock_file.try_lock_exclusive().is_err() {
        // Lost the race: someone else holds the lock. Drop the listener and
        // report "already running" so the caller exits with success.
        drop(listener);
        return Err(SingletonError::AlreadyRunning(socket_path.to_path_buf()));
    }

    use std::io::Write;
    let mut lock_file = lock_file;
    lock_file.set_len(0)?;
    writeln!(lock_file, "{}", std::process::id())?;

    Ok(SingletonGuard {
        listener,
        socket_path: socket_path.to_path_buf(),
        lock_path,
        _lock_file: lock_file,
    })
}

/// A bind failing with `AddrInUse` on a path that has no live peer reads as
/// `ConnectionRefused` on most platforms once something tries to connect, but
/// on bind itself the kernel already tells us via `AddrInUse`; a genuinely
/// stale socket file instead surfaces as `AddrInUse` too on Linux (the inode
/// exists) so we probe by attempting to connect.
fn is_stale_socket(socket_path: &Path, bind_err: &std::io::Error) -> bool {
    if bind_err.kind() != std::io::ErrorKind::AddrInUse {
        return false;
    }
    match std::os::unix::net::UnixStream::connect(socket_path) {
        Ok(_) => false,
        Err(e) => matches!(
            e.kind(),
            std::io::ErrorKind::ConnectionRefused | std::io::ErrorKind::NotFound
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn binds_a_fresh_socket() {
        let dir = tempfile::tempdir().unwrap();
        let sock = dir.path().join("d.sock");
        let guard = bind_singleton(&sock).await.unwrap();
        assert!(sock.exists());
        drop(guard);
        assert!(!sock.exists());
    }

    #[tokio::test]
    async fn second_bind_reports_already_running() {
        let dir = tempfile::tempdir().unwrap();
        let sock = dir.path().join("d.sock");
        let _first = bind_singleton(&sock).await.unwrap();
        let second = bind_singleton(&sock).await;
        assert!(matches!(second, Err(SingletonError::AlreadyRunning(_))));
    }

    #[tokio::test]
    async fn stale_socket_file_is_reclaimed() {
        let dir = tempfile::tempdir().unwrap();
        let sock = dir.path().join("d.sock");
        // Leave behind a socket file with nothing listening.
        {
            let _l = std::os::unix::net::UnixListener::bind(&sock).unwrap();
        }
        assert!(sock.exists());
        let guard = bind_singleton(&sock).await;
        assert!(guard.is_ok());
    }
}
