//! Timeout reaper: spawned once, when `close()` puts a connection into
//! CLOSING, to bound how long the worker can sit blocked waiting for the
//! peer's CLOSE echo. If the worker finishes first it wakes the reaper
//! early via `Notify`; otherwise the reaper forces the teardown itself once
//! `TIMEOUT_MS` elapses.

use std::sync::Arc;
use std::time::Duration;

use crate::registry::Slot;

const TIMEOUT_MS: u64 = 500;

/// Spawns the reaper for `slot` and records the join handle on the slot so
/// the worker can join it during teardown.
pub(crate) fn spawn(slot: Arc<Slot>) {
    let handle = tokio::spawn(async move {
        tokio::select! {
            _ = slot.state_changed.notified() => {
                // The worker is already tearing the connection down; nothing
                // further to do here.
            }
            _ = tokio::time::sleep(Duration::from_millis(TIMEOUT_MS)) => {
                slot.finalize_close().await;
            }
        }
    });
    *slot
        .reaper
        .lock()
        .expect("slot reaper mutex poisoned") = Some(handle);
}

/// Signals the reaper (if one was spawned) and waits for it to finish. Safe
/// to call even if no reaper exists for this connection.
pub(crate) async fn join_if_spawned(slot: &Slot) {
    let handle = slot
        .reaper
        .lock()
        .expect("slot reaper mutex poisoned")
        .take();
    if let Some(handle) = handle {
        slot.state_changed.notify_waiters();
        let _ = handle.await;
    }
}
