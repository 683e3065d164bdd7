// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Thread-safe one-to-many event primitive (§4.G).
//!
//! Grounded on `apollo::cyber::base::Signal` (`original_source/cyber/base/signal.h`):
//! a signal owns its slots; a connection handle holds only a plain id and a
//! back-reference, never ownership, so the handle/signal graph has no
//! cycles (§9 "Cyclic structures").
//!
//! `emit` snapshots connected slots under the lock (cloning their `Arc`, so
//! a concurrent disconnect can never leave a dangling callback), invokes
//! them with the lock released, then sweeps disconnected slots under the
//! *same* lock that guards `connect`/`disconnect` — resolving the Open
//! Question in spec §9: the original's `ClearDisconnectedSlots` re-acquires
//! its mutex for the sweep, so this crate does the same rather than racing
//! an unlocked sweep against a concurrent `disconnect`.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

type Callback<Args> = dyn Fn(Args) + Send + Sync;

struct Slot<Args> {
    id: u64,
    callback: Arc<Callback<Args>>,
    connected: Arc<AtomicBool>,
}

/// Handle returned by [`Signal::connect`]. Cheap to copy; disconnecting
/// through an already-disconnected handle is a no-op.
#[derive(Clone)]
pub struct Connection {
    id: u64,
    connected: Arc<AtomicBool>,
}

impl Connection {
    /// Whether the underlying slot is still connected.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }
}

/// A thread-safe one-to-many event carrying `Args` on each emission.
pub struct Signal<Args> {
    slots: Mutex<Vec<Slot<Args>>>,
    next_id: AtomicU64,
}

impl<Args> Default for Signal<Args> {
    fn default() -> Self {
        Self {
            slots: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(0),
        }
    }
}

impl<Args: Clone> Signal<Args> {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a callback, returning a handle that can later disconnect it.
    pub fn connect<F>(&self, callback: F) -> Connection
    where
        F: Fn(Args) + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let connected = Arc::new(AtomicBool::new(true));
        let handle = Connection {
            id,
            connected: connected.clone(),
        };
        self.slots.lock().push(Slot {
            id,
            callback: Arc::new(callback),
            connected,
        });
        handle
    }

    /// Disconnect a previously connected slot. Returns `true` if it was
    /// found (and thus actually connected at the time of the call).
    pub fn disconnect(&self, conn: &Connection) -> bool {
        let mut slots = self.slots.lock();
        let Some(slot) = slots.iter().find(|s| s.id == conn.id) else {
            return false;
        };
        slot.connected.store(false, Ordering::Release);
        slots.retain(|s| s.connected.load(Ordering::Acquire));
        true
    }

    /// Disconnect every slot.
    pub fn disconnect_all(&self) {
        let mut slots = self.slots.lock();
        for slot in slots.iter() {
            slot.connected.store(false, Ordering::Release);
        }
        slots.clear();
    }

    /// Number of currently connected slots.
    #[must_use]
    pub fn slot_count(&self) -> usize {
        self.slots.lock().len()
    }

    /// Invoke every connected slot with a clone of `args`, without holding
    /// the internal lock across user code, then sweep disconnected slots.
    pub fn emit(&self, args: Args) {
        let local: Vec<_> = {
            let slots = self.slots.lock();
            slots
                .iter()
                .filter(|s| s.connected.load(Ordering::Acquire))
                .map(|s| s.callback.clone())
                .collect()
        };

        for callback in &local {
            callback(args.clone());
        }

        let mut slots = self.slots.lock();
        slots.retain(|s| s.connected.load(Ordering::Acquire));
    }
}
