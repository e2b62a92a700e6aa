//! Tile queue: the coordinate→tile map, priority waves and completion-order eviction
//!
//! The queue owns every live tile record and drives a [`RequestDispatcher`] with
//! them. Work is processed in waves by a single background loop per queue: each
//! wave takes all PENDING tiles, orders them by descending priority (insertion
//! order on ties), dispatches them together and waits for every one to settle
//! before looking for more. A tile added mid-wave is picked up by the next wave.
//!
//! Loaded tiles are cached until the live tile count exceeds
//! `max_cache_size`, at which point the oldest-completed loaded tiles are evicted.

use fxhash::FxHashMap as HashMap;
use lru::LruCache;
use serde::Serialize;
use std::cmp::Reverse;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::runtime::Handle;
use tokio::sync::broadcast;

use super::dispatcher::{DispatcherStats, RequestDispatcher};
use super::events::{EventBus, ListenerId, TileEvent, TileEventKind};
use super::source::TileSource;
use super::types::{RequestId, SharedTile, Tile, TileRequest, TileState};
use crate::core::config::{DispatcherConfig, TileQueueConfig};
use crate::core::geo::TileCoord;
use crate::runtime::{current_handle, spawn_on, AsyncHandle};
use crate::traits::{TileLayerClient, TileLoadFn};
use crate::{Result, TileError};

/// Per-state tile counts
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TileCounts {
    pub total: usize,
    pub pending: usize,
    pub loading: usize,
    pub loaded: usize,
    pub failed: usize,
    pub cancelled: usize,
}

/// Dispatcher statistics merged with the queue's per-state counts
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct QueueStats {
    pub requests: DispatcherStats,
    pub tiles: TileCounts,
}

/// Diagnostic overview of a queue
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueueInfo {
    pub tiles: TileCounts,
    pub active_requests: usize,
    pub queued_requests: usize,
    pub processing: bool,
    pub max_concurrent: usize,
    pub cache_capacity: usize,
    pub lru_enabled: bool,
    pub priority_enabled: bool,
    pub disposed: bool,
}

/// Outcome of [`TileQueue::sync_layer`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LayerSync {
    /// Wanted tiles handed to `add_tile` (new or coalesced)
    pub requested: usize,
    /// Queued tiles dropped because the layer no longer wants them
    pub removed: usize,
}

/// Listener registrations made by [`TileQueue::attach_layer`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayerAttachment {
    pub layer_id: String,
    loaded: ListenerId,
    failed: ListenerId,
}

struct QueueState<T> {
    tiles: HashMap<String, SharedTile<T>>,
    /// Ids of LOADED tiles, least recently completed first
    completed: LruCache<String, ()>,
    next_sequence: u64,
}

struct QueueInner<T> {
    config: TileQueueConfig,
    dispatcher: RequestDispatcher<T>,
    state: Mutex<QueueState<T>>,
    events: EventBus<T>,
    processing: AtomicBool,
    disposed: AtomicBool,
    runtime: Option<Handle>,
    worker: Mutex<Option<Box<dyn AsyncHandle>>>,
}

/// Priority-ordered tile scheduler with a completion-order cache
///
/// Cloning is cheap and yields another handle to the same queue.
pub struct TileQueue<T = Vec<u8>> {
    inner: Arc<QueueInner<T>>,
}

impl<T> Clone for TileQueue<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Send + Sync + 'static> TileQueue<T> {
    /// Create a queue that runs its processing loop on the current tokio runtime.
    ///
    /// Outside a runtime the queue is still created, but adding tiles fails with
    /// [`TileError::NoRuntime`]; use [`TileQueue::with_runtime`] there.
    pub fn new(config: TileQueueConfig, load_fn: impl TileLoadFn<T> + 'static) -> Result<Self> {
        Self::build(config, load_fn, current_handle().ok())
    }

    /// Create a queue that spawns its processing loop on `runtime`
    pub fn with_runtime(
        config: TileQueueConfig,
        load_fn: impl TileLoadFn<T> + 'static,
        runtime: Handle,
    ) -> Result<Self> {
        Self::build(config, load_fn, Some(runtime))
    }

    fn build(
        config: TileQueueConfig,
        load_fn: impl TileLoadFn<T> + 'static,
        runtime: Option<Handle>,
    ) -> Result<Self> {
        config.validate()?;
        let dispatcher = RequestDispatcher::new(DispatcherConfig::from(&config), load_fn);

        Ok(Self {
            inner: Arc::new(QueueInner {
                config,
                dispatcher,
                state: Mutex::new(QueueState {
                    tiles: HashMap::default(),
                    completed: LruCache::unbounded(),
                    next_sequence: 0,
                }),
                events: EventBus::new(),
                processing: AtomicBool::new(false),
                disposed: AtomicBool::new(false),
                runtime,
                worker: Mutex::new(None),
            }),
        })
    }

    pub fn config(&self) -> &TileQueueConfig {
        &self.inner.config
    }

    /// Request a tile.
    ///
    /// If the coordinate is already tracked, its priority is raised to
    /// `max(existing, priority)` and the record is otherwise left alone. Otherwise a
    /// PENDING tile is created, `tileRequested` is emitted and the processing loop
    /// is started if it is idle. Returns a snapshot of the record.
    pub fn add_tile(
        &self,
        coord: TileCoord,
        url: impl Into<String>,
        priority: impl Into<i32>,
    ) -> Result<Tile<T>> {
        let inner = &self.inner;
        if inner.is_disposed() {
            return Err(TileError::Disposed);
        }
        if !coord.is_valid() {
            return Err(TileError::InvalidCoordinates(coord.key()));
        }
        if inner.runtime.is_none() {
            return Err(TileError::NoRuntime);
        }

        let priority = priority.into();
        let id = coord.key();
        let created = {
            let mut state = inner.state();
            if let Some(existing) = state.tiles.get(&id) {
                return Ok(existing.update(|tile| {
                    tile.priority = tile.priority.max(priority);
                    tile.clone()
                }));
            }

            let mut tile = Tile::new(coord, url, priority);
            tile.sequence = state.next_sequence;
            state.next_sequence += 1;
            let snapshot = tile.clone();
            state.tiles.insert(id, SharedTile::new(tile));
            snapshot
        };

        log::debug!("queued tile {} (priority {})", created.id, created.priority);
        inner.events.emit(TileEventKind::Requested, &created);
        inner.evict();
        inner.maybe_start();
        Ok(created)
    }

    /// Add several tiles, stopping at the first rejected one
    pub fn add_tiles(&self, requests: impl IntoIterator<Item = TileRequest>) -> Result<Vec<Tile<T>>> {
        requests
            .into_iter()
            .map(|request| self.add_tile(request.coord, request.url, request.priority))
            .collect()
    }

    /// Request a tile whose url is built by `source`
    pub fn add_tile_from_source(
        &self,
        source: &dyn TileSource,
        coord: TileCoord,
        priority: impl Into<i32>,
    ) -> Result<Tile<T>> {
        self.add_tile(coord, source.url(coord), priority)
    }

    /// Cancel any in-flight request for the tile and forget it. No event is emitted.
    pub fn remove_tile(&self, id: &str) -> bool {
        let removed = {
            let mut state = self.inner.state();
            let removed = state.tiles.remove_entry(id);
            if let Some((key, _)) = &removed {
                state.completed.pop(key);
            }
            removed
        };

        match removed {
            Some((_, tile)) => {
                self.inner.cancel_quietly(&tile);
                log::debug!("removed tile {}", id);
                true
            }
            None => false,
        }
    }

    pub fn remove_tiles<I, S>(&self, ids: I) -> usize
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        ids.into_iter()
            .filter(|id| self.remove_tile(id.as_ref()))
            .count()
    }

    /// Cancel a PENDING or LOADING tile, leaving it CANCELLED in the map.
    ///
    /// Emits exactly one `tileCancelled` on success. Returns false for unknown ids
    /// and for tiles that already settled.
    pub fn cancel_tile(&self, id: &str) -> bool {
        let Some(tile) = self.inner.lookup(id) else {
            return false;
        };
        if !self.inner.cancel_quietly(&tile) {
            return false;
        }

        log::debug!("cancelled tile {}", id);
        self.inner.events.emit(TileEventKind::Cancelled, &tile.snapshot());
        true
    }

    /// Cancel everything and empty the map
    pub fn clear(&self) {
        self.inner.clear();
    }

    pub fn get_tile(&self, id: &str) -> Option<Tile<T>> {
        self.inner.lookup(id).map(|tile| tile.snapshot())
    }

    pub fn get_tile_by_coord(&self, coord: TileCoord) -> Option<Tile<T>> {
        self.get_tile(&coord.key())
    }

    pub fn has_tile(&self, id: &str) -> bool {
        self.inner.state().tiles.contains_key(id)
    }

    /// Every tracked tile, in insertion order
    pub fn get_all_tiles(&self) -> Vec<Tile<T>> {
        self.inner.tiles_where(|_| true)
    }

    pub fn get_pending_tiles(&self) -> Vec<Tile<T>> {
        self.inner.tiles_where(|state| state == TileState::Pending)
    }

    pub fn get_loading_tiles(&self) -> Vec<Tile<T>> {
        self.inner.tiles_where(|state| state == TileState::Loading)
    }

    pub fn get_loaded_tiles(&self) -> Vec<Tile<T>> {
        self.inner.tiles_where(|state| state == TileState::Loaded)
    }

    pub fn get_failed_tiles(&self) -> Vec<Tile<T>> {
        self.inner.tiles_where(|state| state == TileState::Failed)
    }

    /// Re-queue FAILED tiles whose `retry_count` is below `max_retries`.
    ///
    /// Each re-queued tile is reset to PENDING with `retry_count = 0`, a fresh
    /// request id and no `last_error`. Returns how many were re-queued.
    pub fn retry_failed_tiles(&self) -> usize {
        let max_retries = self.inner.config.max_retries;
        let requeued = {
            let state = self.inner.state();
            state
                .tiles
                .values()
                .filter(|tile| {
                    tile.update(|tile| {
                        if tile.state != TileState::Failed || tile.retry_count >= max_retries {
                            return false;
                        }
                        tile.state = TileState::Pending;
                        tile.retry_count = 0;
                        tile.request_id = RequestId::next();
                        tile.last_error = None;
                        true
                    })
                })
                .count()
        };

        if requeued > 0 {
            log::info!("re-queued {} failed tiles", requeued);
            self.inner.maybe_start();
        }
        requeued
    }

    pub fn stats(&self) -> QueueStats {
        QueueStats {
            requests: self.inner.dispatcher.stats(),
            tiles: self.inner.counts(),
        }
    }

    pub fn info(&self) -> QueueInfo {
        let inner = &self.inner;
        QueueInfo {
            tiles: inner.counts(),
            active_requests: inner.dispatcher.active_count(),
            queued_requests: inner.dispatcher.queue_length(),
            processing: self.is_processing(),
            max_concurrent: inner.config.max_concurrent,
            cache_capacity: inner.config.max_cache_size,
            lru_enabled: inner.config.enable_lru,
            priority_enabled: inner.config.enable_priority,
            disposed: inner.is_disposed(),
        }
    }

    /// Whether the processing loop is running
    pub fn is_processing(&self) -> bool {
        self.inner.processing.load(Ordering::SeqCst)
    }

    pub fn reset_stats(&self) {
        self.inner.dispatcher.reset_stats();
    }

    /// Register a callback for one event kind
    pub fn on<F>(&self, kind: TileEventKind, listener: F) -> ListenerId
    where
        F: Fn(&Tile<T>) + Send + Sync + 'static,
    {
        self.inner.events.on(kind, listener)
    }

    pub fn off(&self, kind: TileEventKind, id: ListenerId) -> bool {
        self.inner.events.off(kind, id)
    }

    /// Receive every event on an async channel
    pub fn subscribe(&self) -> broadcast::Receiver<TileEvent<T>> {
        self.inner.events.subscribe()
    }

    /// Route settled tiles to `layer`'s `on_tile_loaded` / `on_tile_failed`.
    ///
    /// The layer sees every tile the queue settles; layers sharing a queue filter
    /// by id.
    pub fn attach_layer(&self, layer: Arc<dyn TileLayerClient<T>>) -> LayerAttachment {
        let on_loaded = Arc::clone(&layer);
        let loaded = self.on(TileEventKind::Loaded, move |tile| on_loaded.on_tile_loaded(tile));
        let on_failed = Arc::clone(&layer);
        let failed = self.on(TileEventKind::Failed, move |tile| on_failed.on_tile_failed(tile));

        LayerAttachment {
            layer_id: layer.layer_id().to_string(),
            loaded,
            failed,
        }
    }

    pub fn detach_layer(&self, attachment: &LayerAttachment) {
        self.off(TileEventKind::Loaded, attachment.loaded);
        self.off(TileEventKind::Failed, attachment.failed);
    }

    /// Bring the queue in line with the tiles `layer` currently wants.
    ///
    /// Wanted tiles are added (or have their priority raised); PENDING and LOADING
    /// tiles outside the wanted set are removed. Meant for a queue serving a single
    /// layer.
    pub fn sync_layer(&self, layer: &dyn TileLayerClient<T>) -> Result<LayerSync> {
        let wanted = layer.wanted_tiles();
        let wanted_ids: fxhash::FxHashSet<String> =
            wanted.iter().map(|request| request.coord.key()).collect();

        let requested = self.add_tiles(wanted)?.len();
        let stale: Vec<String> = self
            .inner
            .tiles_where(|state| state.is_active())
            .into_iter()
            .map(|tile| tile.id)
            .filter(|id| !wanted_ids.contains(id))
            .collect();
        let removed = self.remove_tiles(&stale);

        log::debug!(
            "synced layer {}: {} requested, {} removed",
            layer.layer_id(),
            requested,
            removed
        );
        Ok(LayerSync { requested, removed })
    }

    /// Clear the queue, drop every listener and shut the dispatcher down
    pub fn dispose(&self) {
        let inner = &self.inner;
        if inner.disposed.swap(true, Ordering::SeqCst) {
            return;
        }

        inner.clear();
        inner.events.clear();
        inner.dispatcher.dispose();
        if let Some(worker) = inner.worker().take() {
            worker.cancel();
        }
        inner.processing.store(false, Ordering::SeqCst);
        log::info!("tile queue disposed");
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.is_disposed()
    }
}

impl<T: Send + Sync + 'static> QueueInner<T> {
    fn state(&self) -> MutexGuard<'_, QueueState<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn worker(&self) -> MutexGuard<'_, Option<Box<dyn AsyncHandle>>> {
        self.worker.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    fn lookup(&self, id: &str) -> Option<SharedTile<T>> {
        self.state().tiles.get(id).cloned()
    }

    fn tiles_where(&self, keep: impl Fn(TileState) -> bool) -> Vec<Tile<T>> {
        let mut tiles: Vec<Tile<T>> = self
            .state()
            .tiles
            .values()
            .map(SharedTile::snapshot)
            .filter(|tile| keep(tile.state))
            .collect();
        tiles.sort_by_key(|tile| tile.sequence);
        tiles
    }

    fn counts(&self) -> TileCounts {
        let state = self.state();
        let mut counts = TileCounts {
            total: state.tiles.len(),
            ..TileCounts::default()
        };
        for tile in state.tiles.values() {
            match tile.state() {
                TileState::Pending => counts.pending += 1,
                TileState::Loading => counts.loading += 1,
                TileState::Loaded => counts.loaded += 1,
                TileState::Failed => counts.failed += 1,
                TileState::Cancelled => counts.cancelled += 1,
            }
        }
        counts
    }

    fn has_pending(&self) -> bool {
        self.state()
            .tiles
            .values()
            .any(|tile| tile.state() == TileState::Pending)
    }

    /// Cancel a tile without emitting anything. A PENDING tile the dispatcher has
    /// not seen yet is marked CANCELLED here so its wave skips it.
    fn cancel_quietly(&self, tile: &SharedTile<T>) -> bool {
        let (was_pending, request_id) = tile.update(|tile| {
            let pending = tile.state == TileState::Pending;
            if pending {
                tile.state = TileState::Cancelled;
            }
            (pending, tile.request_id)
        });
        let in_flight = self.dispatcher.cancel(request_id);
        was_pending || in_flight
    }

    fn clear(&self) {
        let tiles: Vec<SharedTile<T>> = {
            let mut state = self.state();
            state.completed.clear();
            state.tiles.drain().map(|(_, tile)| tile).collect()
        };
        for tile in &tiles {
            self.cancel_quietly(tile);
        }
        let stragglers = self.dispatcher.cancel_all();
        log::debug!(
            "cleared {} tiles ({} untracked requests cancelled)",
            tiles.len(),
            stragglers
        );
    }

    /// Evict the oldest-completed LOADED tiles while the map is over capacity
    fn evict(&self) -> usize {
        if !self.config.enable_lru {
            return 0;
        }

        let mut state = self.state();
        let mut evicted = 0;
        while state.tiles.len() > self.config.max_cache_size {
            let Some((id, ())) = state.completed.pop_lru() else {
                break;
            };
            let loaded = state
                .tiles
                .get(&id)
                .is_some_and(|tile| tile.state() == TileState::Loaded);
            if loaded {
                state.tiles.remove(&id);
                evicted += 1;
                log::debug!("evicted tile {}", id);
            }
        }
        evicted
    }

    /// Start the processing loop unless it is already running
    fn maybe_start(self: &Arc<Self>) {
        if self.is_disposed() {
            return;
        }
        let Some(runtime) = &self.runtime else {
            return;
        };
        // Held across the flag swap so the stored handle is always the live loop
        let mut worker = self.worker();
        if self
            .processing
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }

        let inner = Arc::clone(self);
        *worker = Some(spawn_on(runtime, async move { inner.run().await }));
    }

    async fn run(self: Arc<Self>) {
        loop {
            while !self.is_disposed() {
                let wave = self.next_wave();
                if wave.is_empty() {
                    break;
                }
                log::debug!("dispatching wave of {} tiles", wave.len());
                futures::future::join_all(wave.iter().map(|tile| self.dispatch_one(tile))).await;
            }

            self.processing.store(false, Ordering::SeqCst);
            // A tile added after the last wave was selected but before the flag
            // cleared would otherwise wait for the next add_tile
            if self.is_disposed() || !self.has_pending() {
                break;
            }
            if self
                .processing
                .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                .is_err()
            {
                break;
            }
        }
    }

    /// All PENDING tiles, highest priority first, insertion order on ties
    fn next_wave(&self) -> Vec<SharedTile<T>> {
        let mut pending: Vec<(i32, u64, SharedTile<T>)> = self
            .state()
            .tiles
            .values()
            .filter_map(|tile| {
                tile.read(|t| (t.state == TileState::Pending).then_some((t.priority, t.sequence)))
                    .map(|(priority, sequence)| (priority, sequence, tile.clone()))
            })
            .collect();

        if self.config.enable_priority {
            pending.sort_by_key(|(priority, sequence, _)| (Reverse(*priority), *sequence));
        } else {
            pending.sort_by_key(|(_, sequence, _)| *sequence);
        }
        pending.into_iter().map(|(_, _, tile)| tile).collect()
    }

    async fn dispatch_one(&self, tile: &SharedTile<T>) {
        match self.dispatcher.request(tile).await {
            Ok(()) => {
                if self.record_completion(tile) {
                    self.events.emit(TileEventKind::Loaded, &tile.snapshot());
                    self.evict();
                }
            }
            Err(TileError::Disposed) => {}
            Err(error) if error.is_cancelled() => {}
            Err(error) => {
                let snapshot = tile.update(|t| {
                    if t.state != TileState::Cancelled {
                        t.state = TileState::Failed;
                        t.last_error = Some(error.clone());
                    }
                    t.clone()
                });
                if snapshot.state == TileState::Failed && self.is_tracked(tile) {
                    self.events.emit(TileEventKind::Failed, &snapshot);
                }
            }
        }
    }

    fn is_tracked(&self, tile: &SharedTile<T>) -> bool {
        let id = tile.read(|t| t.id.clone());
        self.state()
            .tiles
            .get(&id)
            .is_some_and(|tracked| tracked.same_record(tile))
    }

    /// Note a freshly LOADED tile in the completion order. False if the tile was
    /// removed from the map while it loaded.
    fn record_completion(&self, tile: &SharedTile<T>) -> bool {
        let id = tile.read(|t| t.id.clone());
        let mut state = self.state();
        let tracked = state
            .tiles
            .get(&id)
            .is_some_and(|tracked| tracked.same_record(tile));
        if tracked {
            state.completed.put(id, ());
        }
        tracked
    }
}
