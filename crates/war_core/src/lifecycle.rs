//! Cooperative shutdown plumbing shared by every long-lived task.
//!
//! - [`CancelToken`] - hierarchical cancellation signal. Cancelling a parent
//!   cancels every child created from it; cancelling a child leaves the
//!   parent untouched.
//! - [`TaskTracker`] - records spawned task handles so an owner can wait for
//!   all of them with a bound.

use std::future::Future;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::error::{Result, WarError};

struct TokenInner {
    flag: watch::Sender<bool>,
    children: Mutex<Vec<Weak<TokenInner>>>,
}

impl TokenInner {
    fn new() -> Arc<Self> {
        let (flag, _) = watch::channel(false);
        Arc::new(Self {
            flag,
            children: Mutex::new(Vec::new()),
        })
    }

    /// Returns true only for the call that performed the transition.
    fn cancel(&self) -> bool {
        let children = {
            // Flip the flag under the children lock so `child()` never
            // registers against a parent that is mid-cancel.
            let mut children = self.children.lock();
            if self.flag.send_replace(true) {
                return false;
            }
            std::mem::take(&mut *children)
        };
        for child in children.iter().filter_map(Weak::upgrade) {
            child.cancel();
        }
        true
    }
}

/// Hierarchical, idempotent cancellation signal.
#[derive(Clone)]
pub struct CancelToken {
    inner: Arc<TokenInner>,
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelToken")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

impl CancelToken {
    /// Create a new root token.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: TokenInner::new(),
        }
    }

    /// Create a child token that is cancelled whenever `self` is.
    #[must_use]
    pub fn child(&self) -> Self {
        let child = Self::new();
        let mut children = self.inner.children.lock();
        if *self.inner.flag.borrow() {
            drop(children);
            child.inner.cancel();
        } else {
            children.retain(|c| c.strong_count() > 0);
            children.push(Arc::downgrade(&child.inner));
        }
        child
    }

    /// Cancel this token and all of its descendants.
    ///
    /// Returns `true` for exactly one caller, no matter how many race.
    pub fn cancel(&self) -> bool {
        self.inner.cancel()
    }

    /// Whether cancellation has been requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        *self.inner.flag.borrow()
    }

    /// Resolves once the token is cancelled.
    pub async fn cancelled(&self) {
        let mut rx = self.inner.flag.subscribe();
        // The sender lives as long as `self`, so this cannot observe a close.
        let _ = rx.wait_for(|cancelled| *cancelled).await;
    }
}

/// Tracks spawned tasks so their owner can await them on shutdown.
#[derive(Clone, Default)]
pub struct TaskTracker {
    handles: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl std::fmt::Debug for TaskTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskTracker")
            .field("tracked", &self.handles.lock().len())
            .finish()
    }
}

impl TaskTracker {
    /// Create an empty tracker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawn a task on the current runtime and track it.
    pub fn spawn<F>(&self, future: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(future);
        let mut handles = self.handles.lock();
        handles.retain(|h| !h.is_finished());
        handles.push(handle);
    }

    /// Number of tracked tasks that have not finished yet.
    #[must_use]
    pub fn active(&self) -> usize {
        self.handles.lock().iter().filter(|h| !h.is_finished()).count()
    }

    /// Wait for every tracked task to finish, bounded by `timeout`.
    ///
    /// Tasks spawned while waiting are picked up too. On timeout the
    /// remaining tasks keep running detached; the caller decides whether
    /// that is fatal.
    pub async fn wait(&self, timeout: Duration) -> Result<()> {
        let drain = async {
            loop {
                let batch: Vec<_> = std::mem::take(&mut *self.handles.lock());
                if batch.is_empty() {
                    break;
                }
                for result in futures::future::join_all(batch).await {
                    if let Err(e) = result {
                        if e.is_panic() {
                            tracing::error!("tracked task panicked: {}", e);
                        }
                    }
                }
            }
        };
        tokio::time::timeout(timeout, drain)
            .await
            .map_err(|_| WarError::timeout("waiting for tasks to finish", timeout))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_cancel_propagates_to_children() {
        let root = CancelToken::new();
        let child = root.child();
        let grandchild = child.child();

        assert!(!grandchild.is_cancelled());
        assert!(root.cancel());
        assert!(child.is_cancelled());
        assert!(grandchild.is_cancelled());
        grandchild.cancelled().await;
    }

    #[tokio::test]
    async fn test_child_cancel_leaves_parent() {
        let root = CancelToken::new();
        let child = root.child();
        child.cancel();
        assert!(child.is_cancelled());
        assert!(!root.is_cancelled());
    }

    #[test]
    fn test_child_of_cancelled_parent_starts_cancelled() {
        let root = CancelToken::new();
        root.cancel();
        assert!(root.child().is_cancelled());
    }

    #[test]
    fn test_cancel_reports_first_caller_only() {
        let token = CancelToken::new();
        let winners = AtomicUsize::new(0);
        std::thread::scope(|s| {
            for _ in 0..16 {
                s.spawn(|| {
                    if token.cancel() {
                        winners.fetch_add(1, Ordering::SeqCst);
                    }
                });
            }
        });
        assert_eq!(winners.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_tracker_waits_for_tasks() {
        let tracker = TaskTracker::new();
        let done = Arc::new(AtomicUsize::new(0));
        for _ in 0..4 {
            let done = Arc::clone(&done);
            tracker.spawn(async move {
                tokio::task::yield_now().await;
                done.fetch_add(1, Ordering::SeqCst);
            });
        }
        tracker.wait(Duration::from_secs(1)).await.unwrap();
        assert_eq!(done.load(Ordering::SeqCst), 4);
        assert_eq!(tracker.active(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_tracker_times_out() {
        let tracker = TaskTracker::new();
        tracker.spawn(async {
            tokio::time::sleep(Duration::from_secs(60)).await;
        });
        let err = tracker.wait(Duration::from_millis(50)).await.unwrap_err();
        assert!(matches!(err, WarError::Timeout { .. }));
    }
}
