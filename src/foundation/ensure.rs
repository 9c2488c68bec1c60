//! Client-side `Ensure`: guarantee a daemon is dialable at a socket
//! path, spawning it if necessary. Takes no client-side lock — daemon-side
//! singleton enforcement resolves any race between concurrent spawners.

use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::net::UnixStream;

const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Describes how to start the daemon that should be listening at `socket`.
pub struct Ensure<'a> {
    pub socket: &'a Path,
    pub exe: PathBuf,
    pub args: Vec<String>,
    pub timeout: Duration,
}

/// True if a classified connection-level error suggests the daemon is gone
/// (crashed, idle-shut-down, or never started) rather than an application
/// error. Prefers typed `io::ErrorKind` matching over string matching, per
/// richer typed errors where the underlying transport offers them.
pub fn is_connection_error(err: &std::io::Error) -> bool {
    matches!(
        err.kind(),
        std::io::ErrorKind::ConnectionRefused
            | std::io::ErrorKind::NotFound
            | std::io::ErrorKind::BrokenPipe
    )
}

async fn dial(socket: &Path) -> bool {
    UnixStream::connect(socket).await.is_ok()
}

/// Run the Ensure contract: fast-path dial, spawn detached child, poll.
pub async fn ensure_daemon(spec: Ensure<'_>) -> anyhow::Result<()> {
    if dial(spec.socket).await {
        return Ok(());
    }

    let exe = spec.exe.clone();
    let args = spec.args.clone();
    tokio::task::spawn_blocking(move || {
        let mut cmd = std::process::Command::new(exe);
        cmd.args(&args)
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null());
        #[cfg(unix)]
        {
            // New process group so the daemon survives the client's exit / signals.
            use std::os::unix::process::CommandExt;
            unsafe {
                cmd.pre_exec(|| {
                    libc_setsid();
                    Ok(())
                });
            }
        }
        cmd.spawn()
    })
    .await??;

    let deadline = tokio::time::Instant::now() + spec.timeout;
    loop {
        tokio::time::sleep(POLL_INTERVAL).await;
        if dial(spec.socket).await {
            return Ok(());
        }
        if tokio::time::Instant::now() >= deadline {
            anyhow::bail!(
                "daemon failed to start within {:?} (socket: {})",
                spec.timeout,
                spec.socket.display()
            );
        }
    }
}

/// Minimal `setsid(2)` shim so we don't pull in a whole process-group crate
/// for one syscall used only to detach the spawned daemon.
unsafe fn libc_setsid() {
    extern "C" {
        fn setsid() -> i32;
    }
    let _ = setsid();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_connection_refused_as_transient() {
        let e = std::io::Error::from(std::io::ErrorKind::ConnectionRefused);
        assert!(is_connection_error(&e));
    }

    #[test]
    fn classifies_not_found_as_transient() {
        let e = std::io::Error::from(std::io::ErrorKind::NotFound);
        assert!(is_connection_error(&e));
    }

    #[test]
    fn does_not_classify_invalid_data_as_transient() {
        let e = std::io::Error::from(std::io::ErrorKind::InvalidData);
        assert!(!is_connection_error(&e));
    }
}
