//! Tile lifecycle events
//!
//! Two ways to listen:
//! - [`EventBus::on`] registers a synchronous callback for one event kind. Each
//!   callback runs inside its own panic boundary, so a broken subscriber is logged
//!   and skipped instead of unwinding into the queue.
//! - [`EventBus::subscribe`] hands out a broadcast receiver carrying every event,
//!   for async consumers. Slow receivers lag and lose the oldest events.

use fxhash::FxHashMap as HashMap;
use std::any::Any;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::broadcast;

use super::types::Tile;

/// Capacity of the broadcast channel behind [`EventBus::subscribe`]
const EVENT_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TileEventKind {
    Requested,
    Loaded,
    Failed,
    Cancelled,
}

impl TileEventKind {
    pub const ALL: [TileEventKind; 4] = [
        TileEventKind::Requested,
        TileEventKind::Loaded,
        TileEventKind::Failed,
        TileEventKind::Cancelled,
    ];

    /// Event name as seen by layers: `tileRequested`, `tileLoaded`, ...
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Requested => "tileRequested",
            Self::Loaded => "tileLoaded",
            Self::Failed => "tileFailed",
            Self::Cancelled => "tileCancelled",
        }
    }
}

impl fmt::Display for TileEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An event with a snapshot of the tile it concerns
pub struct TileEvent<T> {
    pub kind: TileEventKind,
    pub tile: Tile<T>,
}

impl<T> Clone for TileEvent<T> {
    fn clone(&self) -> Self {
        Self {
            kind: self.kind,
            tile: self.tile.clone(),
        }
    }
}

impl<T> fmt::Debug for TileEvent<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TileEvent")
            .field("kind", &self.kind)
            .field("tile", &self.tile)
            .finish()
    }
}

/// Handle returned by [`EventBus::on`], used to unsubscribe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

type Listener<T> = Arc<dyn Fn(&Tile<T>) + Send + Sync>;

/// Publish/subscribe channel for tile events
pub struct EventBus<T> {
    listeners: Mutex<HashMap<TileEventKind, Vec<(ListenerId, Listener<T>)>>>,
    next_id: AtomicU64,
    sender: broadcast::Sender<TileEvent<T>>,
}

impl<T: Send + Sync + 'static> Default for EventBus<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Send + Sync + 'static> EventBus<T> {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            listeners: Mutex::new(HashMap::default()),
            next_id: AtomicU64::new(1),
            sender,
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<TileEventKind, Vec<(ListenerId, Listener<T>)>>> {
        self.listeners.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn on<F>(&self, kind: TileEventKind, listener: F) -> ListenerId
    where
        F: Fn(&Tile<T>) + Send + Sync + 'static,
    {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.lock()
            .entry(kind)
            .or_default()
            .push((id, Arc::new(listener)));
        id
    }

    /// Remove a listener. Returns false if it was not registered for `kind`.
    pub fn off(&self, kind: TileEventKind, id: ListenerId) -> bool {
        let mut listeners = self.lock();
        let Some(registered) = listeners.get_mut(&kind) else {
            return false;
        };
        let before = registered.len();
        registered.retain(|(listener_id, _)| *listener_id != id);
        before != registered.len()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TileEvent<T>> {
        self.sender.subscribe()
    }

    pub fn listener_count(&self, kind: TileEventKind) -> usize {
        self.lock().get(&kind).map(Vec::len).unwrap_or(0)
    }

    /// Deliver an event to every listener of `kind` and to broadcast subscribers.
    ///
    /// Listeners run without the registry lock held, so they may call back into the
    /// queue (including `on`/`off`).
    pub fn emit(&self, kind: TileEventKind, tile: &Tile<T>) {
        let listeners: Vec<Listener<T>> = self
            .lock()
            .get(&kind)
            .map(|registered| registered.iter().map(|(_, l)| Arc::clone(l)).collect())
            .unwrap_or_default();

        for listener in listeners {
            if let Err(panic) = catch_unwind(AssertUnwindSafe(|| listener(tile))) {
                log::error!(
                    "{} listener panicked for tile {}: {}",
                    kind,
                    tile.id,
                    panic_message(&*panic)
                );
            }
        }

        if self.sender.receiver_count() > 0 {
            // Only fails when every receiver has been dropped in the meantime
            let _ = self.sender.send(TileEvent {
                kind,
                tile: tile.clone(),
            });
        }
    }

    /// Drop every callback listener. Broadcast receivers see the channel close once
    /// the bus itself is dropped.
    pub fn clear(&self) {
        self.lock().clear();
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message
    } else {
        "non-string panic payload"
    }
}
