//! The connection registry: a fixed-capacity slot table plus the opaque
//! handle ids the application sees. Slot assignment is a brief, non-awaiting
//! critical section guarded by a plain `std::sync::Mutex`; per-slot state
//! that is touched while awaiting I/O lives behind `tokio::sync::Mutex`.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::{Mutex as AsyncMutex, Notify};
use tokio::task::JoinHandle;

/// Opaque, process-wide unique identifier for a live connection. Never reused
/// for a different connection; stable until `on_close` returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionHandle(u64);

impl fmt::Display for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Connecting,
    Open,
    Closing,
    Closed,
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct PingState {
    pub current_ping_id: i64,
    pub last_pong_id: i64,
}

impl Default for PingState {
    fn default() -> Self {
        Self {
            current_ping_id: -1,
            last_pong_id: -1,
        }
    }
}

/// All per-connection state living behind one table entry.
pub(crate) struct Slot {
    pub(crate) handle: ConnectionHandle,
    pub(crate) listen_port: u16,
    pub(crate) remote_addr: String,
    pub(crate) remote_port: u16,
    pub(crate) write: AsyncMutex<Option<OwnedWriteHalf>>,
    /// Mirrors SO_SNDTIMEO: bounds how long a single write to this
    /// connection may block before the send path gives up on it.
    pub(crate) send_timeout: Option<std::time::Duration>,
    pub(crate) state: std::sync::Mutex<ConnState>,
    pub(crate) state_changed: Notify,
    pub(crate) ping: std::sync::Mutex<PingState>,
    pub(crate) reaper: std::sync::Mutex<Option<JoinHandle<()>>>,
    pub(crate) context: std::sync::Mutex<Option<Box<dyn Any + Send + Sync>>>,
}

impl Slot {
    pub(crate) fn get_state(&self) -> ConnState {
        *self.state.lock().expect("slot state mutex poisoned")
    }

    pub(crate) fn set_state(&self, new_state: ConnState) {
        *self.state.lock().expect("slot state mutex poisoned") = new_state;
    }

    /// Moves the slot to CLOSED exactly once, dropping the write half so
    /// further sends fail fast. Idempotent: safe to call from both the
    /// worker's teardown path and the timeout reaper.
    pub(crate) async fn finalize_close(&self) {
        {
            let mut state = self.state.lock().expect("slot state mutex poisoned");
            if *state == ConnState::Closed {
                return;
            }
            *state = ConnState::Closed;
        }
        self.write.lock().await.take();
        self.state_changed.notify_waiters();
    }
}

/// Fixed-capacity table of live connections. `assign` and `release` are the
/// only operations that touch the slot table's structure; everything else
/// resolves a handle to a slot and then operates on that slot directly.
pub(crate) struct Registry {
    capacity: usize,
    slots: std::sync::Mutex<Vec<Option<Arc<Slot>>>>,
    handles: std::sync::Mutex<HashMap<ConnectionHandle, usize>>,
    next_handle: AtomicU64,
}

impl Registry {
    pub(crate) fn new(capacity: usize) -> Self {
        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, || None);
        Self {
            capacity,
            slots: std::sync::Mutex::new(slots),
            handles: std::sync::Mutex::new(HashMap::with_capacity(capacity)),
            next_handle: AtomicU64::new(1),
        }
    }

    pub(crate) fn capacity(&self) -> usize {
        self.capacity
    }

    /// Finds a free slot, assigns a fresh handle and installs the write half.
    /// Returns `None` if every slot is occupied (caller must close the socket).
    pub(crate) fn assign(
        &self,
        write: OwnedWriteHalf,
        listen_port: u16,
        remote_addr: String,
        remote_port: u16,
        send_timeout: Option<std::time::Duration>,
    ) -> Option<(ConnectionHandle, Arc<Slot>)> {
        let mut slots = self.slots.lock().expect("registry slots mutex poisoned");
        let index = slots.iter().position(|slot| slot.is_none())?;

        // The id counter is a separate, lower-ranked piece of state (an atomic,
        // per the lock-ordering rule: id-counter -> registry -> per-slot).
        let handle = ConnectionHandle(self.next_handle.fetch_add(1, Ordering::Relaxed));

        let slot = Arc::new(Slot {
            handle,
            listen_port,
            remote_addr,
            remote_port,
            write: AsyncMutex::new(Some(write)),
            send_timeout,
            state: std::sync::Mutex::new(ConnState::Connecting),
            state_changed: Notify::new(),
            ping: std::sync::Mutex::new(PingState::default()),
            reaper: std::sync::Mutex::new(None),
            context: std::sync::Mutex::new(None),
        });

        slots[index] = Some(slot.clone());
        self.handles
            .lock()
            .expect("registry handles mutex poisoned")
            .insert(handle, index);

        Some((handle, slot))
    }

    pub(crate) fn get(&self, handle: ConnectionHandle) -> Option<Arc<Slot>> {
        let index = *self
            .handles
            .lock()
            .expect("registry handles mutex poisoned")
            .get(&handle)?;
        self.slots
            .lock()
            .expect("registry slots mutex poisoned")
            .get(index)
            .cloned()
            .flatten()
    }

    pub(crate) fn release(&self, handle: ConnectionHandle) {
        let mut handles = self.handles.lock().expect("registry handles mutex poisoned");
        if let Some(index) = handles.remove(&handle) {
            let mut slots = self.slots.lock().expect("registry slots mutex poisoned");
            slots[index] = None;
        }
    }

    /// Snapshots every OPEN slot bound to `listen_port` under the registry
    /// lock, then releases it before the caller sends anything. This
    /// resolves the open question about broadcast/registry-lock interaction
    /// in favor of not holding the registry mutex across per-connection
    /// sends; see DESIGN.md for the rationale. Delivery order across
    /// recipients is consequently unspecified, as the specification allows.
    pub(crate) fn broadcast_targets(&self, listen_port: u16) -> Vec<Arc<Slot>> {
        self.slots
            .lock()
            .expect("registry slots mutex poisoned")
            .iter()
            .flatten()
            .filter(|slot| slot.listen_port == listen_port && slot.get_state() == ConnState::Open)
            .cloned()
            .collect()
    }
}
