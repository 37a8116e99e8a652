//! Graceful shutdown: a process-wide single-shot latch that fans out to
//! registered cleanup hooks. The first `shutdown` call wins; hooks run
//! concurrently with a deadline, and waiting callers are released when the
//! hooks finish or the deadline expires, whichever comes first.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{LazyLock, Mutex};
use std::time::Duration;

use tokio::sync::watch;
use tokio_util::task::TaskTracker;

const HOOK_DEADLINE: Duration = Duration::from_secs(1);

type Hook = Box<dyn FnOnce() + Send + 'static>;

struct Coordinator {
    started: AtomicBool,
    hooks: Mutex<HashMap<String, Hook>>,
    tracker: TaskTracker,
    done_tx: watch::Sender<bool>,
    done_rx: watch::Receiver<bool>,
}

static COORDINATOR: LazyLock<Coordinator> = LazyLock::new(|| {
    let (done_tx, done_rx) = watch::channel(false);
    Coordinator {
        started: AtomicBool::new(false),
        hooks: Mutex::new(HashMap::new()),
        tracker: TaskTracker::new(),
        done_tx,
        done_rx,
    }
});

/// Register a cleanup to run on shutdown. If shutdown has already started,
/// the hook runs immediately as a tracked background task.
pub fn on_shutdown(key: &str, hook: impl FnOnce() + Send + 'static) {
    let coordinator = &*COORDINATOR;
    if coordinator.started.load(Ordering::SeqCst) {
        coordinator.tracker.spawn(async move { hook() });
        return;
    }
    coordinator
        .hooks
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .insert(key.to_string(), Box::new(hook));
}

/// Remove a previously registered hook. No-op once shutdown has started.
pub fn remove_shutdown_hook(key: &str) {
    COORDINATOR
        .hooks
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .remove(key);
}

/// Begin shutting down. Returns true if and only if this call started the
/// shutdown; later callers get false and nothing else happens. All
/// registered hooks are launched concurrently; hooks still running at the
/// deadline are abandoned with a warning rather than holding up exit.
pub fn shutdown(reason: &str, level: tracing::Level) -> bool {
    let coordinator = &*COORDINATOR;
    if coordinator.started.swap(true, Ordering::SeqCst) {
        return false;
    }

    match level {
        tracing::Level::ERROR => tracing::error!(reason, "Shutting down"),
        tracing::Level::WARN => tracing::warn!(reason, "Shutting down"),
        _ => tracing::info!(reason, "Shutting down"),
    }

    let hooks: Vec<(String, Hook)> = coordinator
        .hooks
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .drain()
        .collect();
    for (key, hook) in hooks {
        tracing::debug!(key, "Executing shutdown hook");
        coordinator.tracker.spawn(async move { hook() });
    }
    coordinator.tracker.close();

    tokio::spawn(async {
        let coordinator = &*COORDINATOR;
        if tokio::time::timeout(HOOK_DEADLINE, coordinator.tracker.wait())
            .await
            .is_err()
        {
            tracing::warn!(
                timeout_seconds = HOOK_DEADLINE.as_secs_f64(),
                "Shutdown hooks did not complete before timeout; exiting anyway"
            );
        }
        let _ = coordinator.done_tx.send(true);
    });

    true
}

/// Block until shutdown has been signaled and the hooks have run (or timed
/// out). Returns immediately once that has happened.
pub async fn wait_for_shutdown() {
    let mut done = COORDINATOR.done_rx.clone();
    if *done.borrow() {
        return;
    }
    // The sender lives in the static coordinator, so this cannot fail.
    let _ = done.changed().await;
}
