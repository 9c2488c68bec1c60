//! Branch Watcher: watches a worktree's `HEAD` file and reports
//! branch-identity changes. HEAD parsing follows three rules:
//!   - `ref: refs/heads/<name>` → `<name>`
//!   - a 40-character hex string (detached HEAD pointing at a raw commit) →
//!     the [`crate::git::DETACHED_SENTINEL`]
//!   - anything else → the trimmed raw content

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::git::DETACHED_SENTINEL;

const POLL_INTERVAL: Duration = Duration::from_millis(200);

type Callback = Arc<dyn Fn(String) + Send + Sync>;

/// Parse `.git/HEAD` contents into a branch identity per the three rules
/// above.
pub fn parse_head(contents: &str) -> String {
    let trimmed = contents.trim();
    if let Some(rest) = trimmed.strip_prefix("ref:") {
        let rest = rest.trim();
        if let Some(name) = rest.strip_prefix("refs/heads/") {
            return name.to_string();
        }
        return rest.to_string();
    }
    if trimmed.len() == 40 && trimmed.chars().all(|c| c.is_ascii_hexdigit()) {
        return DETACHED_SENTINEL.to_string();
    }
    trimmed.to_string()
}

/// Watches one worktree's `HEAD` file, invoking `on_change` whenever the
/// parsed branch identity differs from the previously observed one.
/// Callback panics are caught so one bad subscriber can't take down the
/// watch loop.
pub struct BranchWatcher {
    cancel: CancellationToken,
    task: Option<tokio::task::JoinHandle<()>>,
    stopped: Arc<AtomicBool>,
    _watcher: Option<RecommendedWatcher>,
}

impl BranchWatcher {
    pub fn start(worktree_root: PathBuf, on_change: Callback) -> anyhow::Result<Self> {
        let head_path = worktree_root.join(".git").join("HEAD");
        let cancel = CancellationToken::new();
        let stopped = Arc::new(AtomicBool::new(false));

        let current = Arc::new(Mutex::new(read_branch(&head_path)));
        if let Some(initial) = current.lock().unwrap().clone() {
            invoke_safely(&on_change, initial);
        }

        let (tx, mut rx) = mpsc::unbounded_channel::<()>();
        let watcher = if let Some(git_dir) = head_path.parent() {
            let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
                if res.is_ok() {
                    let _ = tx.send(());
                }
            })?;
            // Watch the `.git` directory rather than the file directly: some
            // git implementations replace HEAD via rename rather than
            // in-place write, which a direct file watch can miss.
            watcher.watch(git_dir, RecursiveMode::NonRecursive)?;
            Some(watcher)
        } else {
            None
        };

        let cancel_for_task = cancel.clone();
        let current_for_task = current.clone();
        let head_path_for_task = head_path.clone();
        let task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(POLL_INTERVAL);
            loop {
                tokio::select! {
                    _ = cancel_for_task.cancelled() => break,
                    maybe = rx.recv() => {
                        if maybe.is_none() {
                            break;
                        }
                        check_for_change(&head_path_for_task, &current_for_task, &on_change);
                    }
                    _ = interval.tick() => {
                        check_for_change(&head_path_for_task, &current_for_task, &on_change);
                    }
                }
            }
        });

        Ok(Self {
            cancel,
            task: Some(task),
            stopped,
            _watcher: watcher,
        })
    }

    /// Idempotent: a second `stop` call is a no-op.
    pub async fn stop(&mut self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

fn read_branch(head_path: &Path) -> Option<String> {
    std::fs::read_to_string(head_path).ok().map(|s| parse_head(&s))
}

fn check_for_change(head_path: &Path, current: &Arc<Mutex<Option<String>>>, on_change: &Callback) {
    let Some(branch) = read_branch(head_path) else { return };
    let mut guard = current.lock().unwrap();
    if guard.as_deref() != Some(branch.as_str()) {
        *guard = Some(branch.clone());
        drop(guard);
        invoke_safely(on_change, branch);
    }
}

fn invoke_safely(on_change: &Callback, branch: String) {
    if let Err(panic) = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| on_change(branch))) {
        tracing::error!("branch watcher callback panicked: {:?}", panic);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_local_branch_ref() {
        assert_eq!(parse_head("ref: refs/heads/main\n"), "main");
        assert_eq!(parse_head("ref: refs/heads/feature/x\n"), "feature/x");
    }

    #[test]
    fn parses_detached_commit_sentinel() {
        let sha = "a".repeat(40);
        assert_eq!(parse_head(&sha), DETACHED_SENTINEL);
    }

    #[test]
    fn falls_back_to_raw_trimmed_content() {
        assert_eq!(parse_head("  weird-state  \n"), "weird-state");
    }

    #[tokio::test]
    async fn stop_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join(".git")).unwrap();
        std::fs::write(dir.path().join(".git").join("HEAD"), "ref: refs/heads/main\n").unwrap();

        let mut watcher = BranchWatcher::start(dir.path().to_path_buf(), Arc::new(|_| {})).unwrap();
        watcher.stop().await;
        watcher.stop().await;
    }
}
