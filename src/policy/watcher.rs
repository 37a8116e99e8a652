//! Filesystem watching over the policy directories. A watcher is two
//! cooperating tasks joined by a shutdown latch: the change task turns
//! relevant events into policy reloads, and the close task tears the notify
//! watcher down when the latch fires, which closes the event channel and
//! ends the change task.
//!
//! At most one watcher is live in the process-wide cell. Replacement starts
//! the successor first and closes the predecessor only once the successor is
//! watching, so the directories are never silently unwatched; concurrent
//! publishers settle by compare-and-swap, and the loser closes the watcher
//! it just created.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use arc_swap::ArcSwapOption;
use notify::event::{EventKind, ModifyKind};
use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::{mpsc, Notify};

use crate::policy::errors::PolicyError;
use crate::policy::loader;
use crate::settings;

static ACTIVE_WATCHER: ArcSwapOption<PolicyWatcher> = ArcSwapOption::const_empty();

pub struct PolicyWatcher {
    /// Dropped by the close task; `None` once closed.
    inner: Mutex<Option<RecommendedWatcher>>,
    shutdown: Notify,
    closed: AtomicBool,
}

impl PolicyWatcher {
    /// Signal the close task. Idempotent: the underlying watcher is closed
    /// exactly once no matter how many times this is called.
    pub fn close(&self) {
        if self
            .closed
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            self.shutdown.notify_one();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    #[cfg(test)]
    pub(crate) fn inner_taken(&self) -> bool {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .is_none()
    }
}

/// `Chmod`-style metadata events are common and never change policy content.
fn is_relevant(kind: &EventKind) -> bool {
    match kind {
        EventKind::Create(_) | EventKind::Remove(_) => true,
        EventKind::Modify(ModifyKind::Metadata(_)) => false,
        EventKind::Modify(_) => true,
        _ => false,
    }
}

/// Create a watcher over the configured directories and start its two tasks.
/// The watcher is live (events flowing) when this returns; publication into
/// the active cell is the caller's move.
pub fn watch_policies() -> Result<Arc<PolicyWatcher>, PolicyError> {
    let settings = settings::active();

    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut inner = notify::recommended_watcher(move |event: notify::Result<notify::Event>| {
        let _ = tx.send(event);
    })
    .map_err(|e| PolicyError::Watch(e.to_string()))?;

    for directory in &settings.policy.directories {
        inner
            .watch(Path::new(directory), RecursiveMode::NonRecursive)
            .map_err(|e| PolicyError::Watch(format!("unable to watch `{directory}`: {e}")))?;
    }
    tracing::info!(directories = ?settings.policy.directories, "Policy watcher started");

    let watcher = Arc::new(PolicyWatcher {
        inner: Mutex::new(Some(inner)),
        shutdown: Notify::new(),
        closed: AtomicBool::new(false),
    });

    tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            match event {
                Ok(event) if is_relevant(&event.kind) => {
                    tracing::info!(paths = ?event.paths, "Policy file change detected");
                    if let Err(error) = loader::load_policies().await {
                        tracing::error!(%error, "Unable to reload policies");
                    }
                }
                Ok(_) => {}
                Err(error) => tracing::error!(%error, "Error in policy watcher"),
            }
        }
        tracing::debug!("Policy watcher event channel closed");
    });

    let close_handle = watcher.clone();
    tokio::spawn(async move {
        close_handle.shutdown.notified().await;
        close_handle
            .inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        tracing::debug!("Policy watcher closed");
    });

    Ok(watcher)
}

pub fn active() -> Option<Arc<PolicyWatcher>> {
    ACTIVE_WATCHER.load().as_ref().cloned()
}

/// Publish `new` in place of `expected`. Returns whether this caller won;
/// on a lost race the freshly created watcher must be closed by the caller.
pub fn swap_active(
    expected: &Option<Arc<PolicyWatcher>>,
    new: Option<Arc<PolicyWatcher>>,
) -> bool {
    let previous = ACTIVE_WATCHER.compare_and_swap(expected, new);
    let previous_ptr = previous.as_ref().map(Arc::as_ptr);
    previous_ptr == expected.as_ref().map(Arc::as_ptr)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_kind_filtering() {
        use notify::event::{CreateKind, DataChange, MetadataKind, ModifyKind, RemoveKind, RenameMode};

        assert!(is_relevant(&EventKind::Create(CreateKind::File)));
        assert!(is_relevant(&EventKind::Remove(RemoveKind::File)));
        assert!(is_relevant(&EventKind::Modify(ModifyKind::Data(
            DataChange::Content
        ))));
        assert!(is_relevant(&EventKind::Modify(ModifyKind::Name(
            RenameMode::Both
        ))));
        assert!(!is_relevant(&EventKind::Modify(ModifyKind::Metadata(
            MetadataKind::Permissions
        ))));
        assert!(!is_relevant(&EventKind::Access(
            notify::event::AccessKind::Read
        )));
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let _guard = settings::TEST_LOCK.lock().unwrap_or_else(|p| p.into_inner());
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("allow.kdl"),
            r#"policy "allow_all" { default result="allow" message="ok"; }"#,
        )
        .unwrap();
        let mut settings = settings::Settings::default();
        settings.policy.directories = vec![dir.path().to_string_lossy().to_string()];
        // The watcher reads directories from the active snapshot.
        settings::publish_for_tests(settings);

        let watcher = watch_policies();
        let Ok(watcher) = watcher else {
            // Sandboxed environments without inotify cannot run this test.
            return;
        };

        assert!(!watcher.is_closed());
        watcher.close();
        watcher.close();
        watcher.close();
        assert!(watcher.is_closed());

        // Give the close task a moment to drop the notify watcher.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(watcher.inner_taken());
    }

    #[test]
    fn test_swap_active_loser_detected() {
        // Start from a known-empty cell.
        ACTIVE_WATCHER.store(None);

        let a = Arc::new(PolicyWatcher {
            inner: Mutex::new(None),
            shutdown: Notify::new(),
            closed: AtomicBool::new(false),
        });
        let b = Arc::new(PolicyWatcher {
            inner: Mutex::new(None),
            shutdown: Notify::new(),
            closed: AtomicBool::new(false),
        });

        let empty = None;
        assert!(swap_active(&empty, Some(a.clone())));
        // A competing publisher that still expects the empty cell loses.
        assert!(!swap_active(&empty, Some(b.clone())));
        assert!(Arc::ptr_eq(&active().unwrap(), &a));

        let current = active();
        assert!(swap_active(&current, Some(b.clone())));
        assert!(Arc::ptr_eq(&active().unwrap(), &b));

        ACTIVE_WATCHER.store(None);
    }
}
