//! Request dispatcher: bounded concurrency, timeout, retry with backoff and
//! cancellation for individual tile requests
//!
//! The dispatcher is priority-agnostic. Requests wait for a concurrency slot in
//! arrival order (a fair semaphore); ordering work is the queue's job. A request
//! holds its slot from the first attempt until it settles, backoff included, so a
//! tile is LOADING exactly while it occupies a slot.
//!
//! Cancellation is cooperative. [`RequestDispatcher::cancel`] marks the tile
//! CANCELLED and releases its slot right away; the in-flight load future is
//! dropped at its next poll, and a result that still arrives for a cancelled
//! request is discarded.

use futures::FutureExt;
use fxhash::FxHashMap as HashMap;
use serde::Serialize;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::stats::{LoadStats, StatsAggregator};
use super::types::{RequestId, SharedTile, TileState};
use crate::core::config::DispatcherConfig;
use crate::runtime::async_delay;
use crate::traits::TileLoadFn;
use crate::{Result, TileError};

/// Aggregate statistics merged with the live request counts
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct DispatcherStats {
    #[serde(flatten)]
    pub load: LoadStats,
    /// Requests holding a concurrency slot
    pub active: usize,
    /// Requests waiting for a slot
    pub queued: usize,
}

/// Bookkeeping for one registered request
struct InFlight<T> {
    tile: SharedTile<T>,
    token: CancellationToken,
    /// Present while the request holds a concurrency slot
    permit: Option<OwnedSemaphorePermit>,
    /// Distinguishes this registration from a later one with the same id
    generation: u64,
}

struct DispatchTable<T> {
    requests: HashMap<RequestId, InFlight<T>>,
    next_generation: u64,
}

/// Executes tile loads through an injected [`TileLoadFn`]
pub struct RequestDispatcher<T> {
    config: DispatcherConfig,
    load_fn: Arc<dyn TileLoadFn<T>>,
    slots: Arc<Semaphore>,
    table: Mutex<DispatchTable<T>>,
    stats: Mutex<StatsAggregator>,
    disposed: AtomicBool,
}

impl<T: Send + Sync + 'static> RequestDispatcher<T> {
    pub fn new(config: DispatcherConfig, load_fn: impl TileLoadFn<T> + 'static) -> Self {
        let max_concurrent = config.max_concurrent.max(1);
        let stats = StatsAggregator::new(config.max_load_time_samples);

        Self {
            config,
            load_fn: Arc::new(load_fn),
            slots: Arc::new(Semaphore::new(max_concurrent)),
            table: Mutex::new(DispatchTable {
                requests: HashMap::default(),
                next_generation: 0,
            }),
            stats: Mutex::new(stats),
            disposed: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    fn table(&self) -> MutexGuard<'_, DispatchTable<T>> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn stats_mut(&self) -> MutexGuard<'_, StatsAggregator> {
        self.stats.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run one logical request for `tile` to completion.
    ///
    /// Resolves once the tile is LOADED. Returns `Err(TileError::Cancelled)` if the
    /// request was cancelled, and the last load or timeout error once retries are
    /// exhausted (the tile is then FAILED). Registering a request id that is already
    /// in flight fails immediately with `TileError::DuplicateRequest`.
    pub async fn request(&self, tile: &SharedTile<T>) -> Result<()> {
        if self.disposed.load(Ordering::SeqCst) {
            return Err(TileError::Disposed);
        }

        let request_id = tile.request_id();
        let token = CancellationToken::new();
        let generation = self.register(request_id, tile, &token)?;
        let _guard = RequestGuard {
            dispatcher: self,
            request_id,
            generation,
        };
        let started = Instant::now();
        self.stats_mut().record_request_start();

        let permit = tokio::select! {
            biased;
            _ = token.cancelled() => return Err(TileError::Cancelled(request_id)),
            permit = Arc::clone(&self.slots).acquire_owned() => {
                permit.map_err(|_| TileError::Disposed)?
            }
        };
        if !self.start_loading(request_id, generation, permit) {
            return Err(TileError::Cancelled(request_id));
        }

        let mut retry = 0;
        loop {
            let attempt = AssertUnwindSafe(self.load_fn.load(tile.snapshot())).catch_unwind();
            let outcome = tokio::select! {
                biased;
                _ = token.cancelled() => return Err(TileError::Cancelled(request_id)),
                outcome = tokio::time::timeout(self.config.request_timeout, attempt) => outcome,
            };

            let error = match outcome {
                Ok(Ok(Ok(data))) => {
                    return self.complete_success(request_id, generation, data, started);
                }
                Ok(Ok(Err(e))) => TileError::Load(e.to_string()),
                Ok(Err(_panic)) => TileError::Load("load function panicked".to_string()),
                Err(_elapsed) => TileError::Timeout(self.config.request_timeout),
            };

            if retry >= self.config.max_retries {
                return Err(self.complete_failure(request_id, generation, error));
            }

            retry += 1;
            let delay = self.config.backoff_delay(retry);
            log::warn!(
                "tile request {} attempt {} failed: {}; retrying in {:?}",
                request_id,
                retry,
                error,
                delay
            );

            tokio::select! {
                biased;
                _ = token.cancelled() => return Err(TileError::Cancelled(request_id)),
                _ = async_delay(delay) => {}
            }

            if !self.begin_retry(request_id, generation, retry) {
                return Err(TileError::Cancelled(request_id));
            }
        }
    }

    fn register(
        &self,
        request_id: RequestId,
        tile: &SharedTile<T>,
        token: &CancellationToken,
    ) -> Result<u64> {
        let mut table = self.table();
        if table.requests.contains_key(&request_id) {
            return Err(TileError::DuplicateRequest(request_id));
        }
        // Cancelled before it ever reached the gate
        if tile.state() == TileState::Cancelled {
            return Err(TileError::Cancelled(request_id));
        }

        let generation = table.next_generation;
        table.next_generation += 1;
        table.requests.insert(
            request_id,
            InFlight {
                tile: tile.clone(),
                token: token.clone(),
                permit: None,
                generation,
            },
        );
        log::debug!("registered tile request {}", request_id);
        Ok(generation)
    }

    /// Store the slot permit and mark the tile LOADING, unless the request was
    /// cancelled while it waited.
    fn start_loading(
        &self,
        request_id: RequestId,
        generation: u64,
        permit: OwnedSemaphorePermit,
    ) -> bool {
        let mut table = self.table();
        let Some(entry) = table
            .requests
            .get_mut(&request_id)
            .filter(|entry| entry.generation == generation)
        else {
            return false;
        };

        entry.permit = Some(permit);
        entry.tile.update(|tile| tile.state = TileState::Loading);
        true
    }

    fn begin_retry(&self, request_id: RequestId, generation: u64, retry: u32) -> bool {
        let table = self.table();
        match table.requests.get(&request_id) {
            Some(entry) if entry.generation == generation => {
                entry.tile.update(|tile| tile.retry_count = retry);
                true
            }
            _ => false,
        }
    }

    /// Take the entry out of the table if it still belongs to this registration.
    /// `None` means the request was cancelled and its outcome must be discarded.
    fn take_entry(
        table: &mut DispatchTable<T>,
        request_id: RequestId,
        generation: u64,
    ) -> Option<InFlight<T>> {
        match table.requests.get(&request_id) {
            Some(entry) if entry.generation == generation => table.requests.remove(&request_id),
            _ => None,
        }
    }

    fn complete_success(
        &self,
        request_id: RequestId,
        generation: u64,
        data: T,
        started: Instant,
    ) -> Result<()> {
        let mut table = self.table();
        let Some(entry) = Self::take_entry(&mut table, request_id, generation) else {
            log::debug!("discarding late result for cancelled request {}", request_id);
            return Err(TileError::Cancelled(request_id));
        };

        let elapsed = started.elapsed();
        entry.tile.update(|tile| {
            tile.state = TileState::Loaded;
            tile.data = Some(Arc::new(data));
            tile.load_time = Some(elapsed);
            tile.last_error = None;
            tile.completed_at = Some(Instant::now());
        });

        let mut stats = self.stats_mut();
        stats.record_success();
        stats.record_load_time(elapsed.as_secs_f64() * 1000.0);
        log::debug!("tile request {} loaded in {:?}", request_id, elapsed);
        Ok(())
    }

    fn complete_failure(
        &self,
        request_id: RequestId,
        generation: u64,
        error: TileError,
    ) -> TileError {
        let mut table = self.table();
        let Some(entry) = Self::take_entry(&mut table, request_id, generation) else {
            return TileError::Cancelled(request_id);
        };

        entry.tile.update(|tile| {
            tile.state = TileState::Failed;
            tile.last_error = Some(error.clone());
        });
        self.stats_mut().record_failed();
        log::error!("tile request {} failed: {}", request_id, error);
        error
    }

    /// Cancel an active or slot-waiting request.
    ///
    /// The tile becomes CANCELLED and the request's slot, if it holds one, is free
    /// for the next waiter before this returns. Returns false for unknown ids.
    pub fn cancel(&self, request_id: RequestId) -> bool {
        let mut table = self.table();
        let Some(entry) = table.requests.remove(&request_id) else {
            return false;
        };
        self.cancel_entry(request_id, entry);
        true
    }

    fn cancel_entry(&self, request_id: RequestId, entry: InFlight<T>) {
        entry.token.cancel();
        entry.tile.update(|tile| tile.state = TileState::Cancelled);
        self.stats_mut().record_cancelled();
        log::debug!("cancelled tile request {}", request_id);
        // Dropping the entry returns its permit to the semaphore
        drop(entry);
    }

    /// Cancel every id that is in flight; returns how many were
    pub fn cancel_batch(&self, request_ids: &[RequestId]) -> usize {
        request_ids.iter().filter(|id| self.cancel(**id)).count()
    }

    pub fn cancel_all(&self) -> usize {
        let mut table = self.table();
        let entries: Vec<_> = table.requests.drain().collect();
        let count = entries.len();
        for (request_id, entry) in entries {
            self.cancel_entry(request_id, entry);
        }
        count
    }

    /// Requests currently holding a concurrency slot
    pub fn active_count(&self) -> usize {
        self.table()
            .requests
            .values()
            .filter(|entry| entry.permit.is_some())
            .count()
    }

    /// Requests registered but still waiting for a slot
    pub fn queue_length(&self) -> usize {
        self.table()
            .requests
            .values()
            .filter(|entry| entry.permit.is_none())
            .count()
    }

    pub fn is_requesting(&self, request_id: RequestId) -> bool {
        self.table().requests.contains_key(&request_id)
    }

    pub fn stats(&self) -> DispatcherStats {
        let (active, queued) = {
            let table = self.table();
            let active = table
                .requests
                .values()
                .filter(|entry| entry.permit.is_some())
                .count();
            (active, table.requests.len() - active)
        };

        DispatcherStats {
            load: self.stats_mut().stats(),
            active,
            queued,
        }
    }

    pub fn reset_stats(&self) {
        self.stats_mut().reset();
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    /// Cancel everything and refuse further requests
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        let cancelled = self.cancel_all();
        self.slots.close();
        log::info!("request dispatcher disposed ({} requests cancelled)", cancelled);
    }

    /// A request future dropped before it settled counts as cancelled
    fn abandon(&self, request_id: RequestId, generation: u64) {
        let mut table = self.table();
        if let Some(entry) = Self::take_entry(&mut table, request_id, generation) {
            log::debug!("tile request {} abandoned before settling", request_id);
            self.cancel_entry(request_id, entry);
        }
    }
}

/// Removes a request's bookkeeping if its future is dropped mid-flight
struct RequestGuard<'a, T: Send + Sync + 'static> {
    dispatcher: &'a RequestDispatcher<T>,
    request_id: RequestId,
    generation: u64,
}

impl<T: Send + Sync + 'static> Drop for RequestGuard<'_, T> {
    fn drop(&mut self) {
        self.dispatcher.abandon(self.request_id, self.generation);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::geo::TileCoord;
    use crate::tiles::types::Tile;
    use crate::BoxError;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use tokio::sync::Notify;

    fn config(max_concurrent: usize, max_retries: u32) -> DispatcherConfig {
        DispatcherConfig {
            max_concurrent,
            max_retries,
            retry_delay_base: Duration::from_millis(50),
            retry_delay_max: Duration::from_millis(1000),
            request_timeout: Duration::from_millis(500),
            max_load_time_samples: 100,
        }
    }

    fn shared(x: u32) -> SharedTile<String> {
        SharedTile::new(Tile::new(
            TileCoord::new(x, 0, 10),
            format!("http://x/10/{}/0.png", x),
            0,
        ))
    }

    /// Loader failing the first `failures` attempts, then returning "ok"
    fn flaky(
        failures: usize,
        attempts: Arc<AtomicUsize>,
    ) -> impl TileLoadFn<String> + 'static {
        move |_tile: Tile<String>| {
            let attempt = attempts.fetch_add(1, Ordering::SeqCst) + 1;
            async move {
                if attempt <= failures {
                    Err::<String, BoxError>(format!("attempt {} failed", attempt).into())
                } else {
                    Ok("ok".to_string())
                }
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_successful_request_loads_tile() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let dispatcher = RequestDispatcher::new(config(4, 3), flaky(0, attempts.clone()));
        let tile = shared(1);

        dispatcher.request(&tile).await.unwrap();

        let snapshot = tile.snapshot();
        assert_eq!(snapshot.state, TileState::Loaded);
        assert_eq!(snapshot.data.as_deref().map(String::as_str), Some("ok"));
        assert!(snapshot.load_time.is_some());
        assert_eq!(snapshot.retry_count, 0);

        let stats = dispatcher.stats();
        assert_eq!((stats.load.total, stats.load.success), (1, 1));
        assert_eq!((stats.active, stats.queued), (0, 0));
        assert!(!dispatcher.is_requesting(snapshot.request_id));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_with_exponential_backoff() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let dispatcher = RequestDispatcher::new(config(4, 2), flaky(2, attempts.clone()));
        let tile = shared(2);

        let started = Instant::now();
        dispatcher.request(&tile).await.unwrap();
        let elapsed = started.elapsed();

        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        let snapshot = tile.snapshot();
        assert_eq!(snapshot.state, TileState::Loaded);
        assert_eq!(snapshot.retry_count, 2);
        // 50ms before the first retry, 100ms before the second
        assert!(elapsed >= Duration::from_millis(150), "{:?}", elapsed);
        assert!(snapshot.load_time.unwrap() >= Duration::from_millis(150));
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_retries_fail_once() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let dispatcher = RequestDispatcher::new(config(4, 3), flaky(usize::MAX, attempts.clone()));
        let tile = shared(3);

        let err = dispatcher.request(&tile).await.unwrap_err();

        assert_eq!(err, TileError::Load("attempt 4 failed".to_string()));
        assert_eq!(attempts.load(Ordering::SeqCst), 4);
        let snapshot = tile.snapshot();
        assert_eq!(snapshot.state, TileState::Failed);
        assert_eq!(snapshot.retry_count, 3);
        assert_eq!(snapshot.last_error, Some(err));

        let stats = dispatcher.stats().load;
        assert_eq!((stats.total, stats.success, stats.failed), (1, 0, 1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_counts_as_failed_attempt() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = attempts.clone();
        let dispatcher = RequestDispatcher::new(config(1, 1), move |_tile: Tile<String>| {
            counter.fetch_add(1, Ordering::SeqCst);
            async move {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok::<_, BoxError>("too late".to_string())
            }
        });
        let tile = shared(4);

        let err = dispatcher.request(&tile).await.unwrap_err();

        assert_eq!(err, TileError::Timeout(Duration::from_millis(500)));
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
        assert_eq!(tile.state(), TileState::Failed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_panicking_loader_is_a_load_failure() {
        let dispatcher = RequestDispatcher::new(config(1, 0), |_tile: Tile<String>| async move {
            if true {
                panic!("loader bug");
            }
            Ok::<_, BoxError>(String::new())
        });
        let tile = shared(5);

        let err = dispatcher.request(&tile).await.unwrap_err();
        assert!(matches!(err, TileError::Load(_)));
        assert_eq!(tile.state(), TileState::Failed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrency_never_exceeds_bound() {
        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let (current, max_seen) = (in_flight.clone(), peak.clone());
        let dispatcher = Arc::new(RequestDispatcher::new(
            config(2, 0),
            move |_tile: Tile<String>| {
                let current = current.clone();
                let max_seen = max_seen.clone();
                async move {
                    let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                    max_seen.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    current.fetch_sub(1, Ordering::SeqCst);
                    Ok::<_, BoxError>("ok".to_string())
                }
            },
        ));

        let tiles: Vec<_> = (0..6).map(shared).collect();
        let handles: Vec<_> = tiles
            .iter()
            .cloned()
            .map(|tile| {
                let dispatcher = dispatcher.clone();
                tokio::spawn(async move { dispatcher.request(&tile).await })
            })
            .collect();

        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(dispatcher.active_count(), 2);
        assert_eq!(dispatcher.queue_length(), 4);
        let loading = tiles
            .iter()
            .filter(|tile| tile.state() == TileState::Loading)
            .count();
        assert_eq!(loading, 2);

        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        assert_eq!(peak.load(Ordering::SeqCst), 2);
        assert_eq!(dispatcher.stats().load.success, 6);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slots_are_granted_in_arrival_order() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let log = order.clone();
        let dispatcher = Arc::new(RequestDispatcher::new(
            config(1, 0),
            move |tile: Tile<String>| {
                log.lock().unwrap().push(tile.coord.x);
                async move {
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    Ok::<_, BoxError>("ok".to_string())
                }
            },
        ));

        let mut handles = Vec::new();
        for x in [7, 3, 9, 1] {
            let dispatcher = dispatcher.clone();
            let tile = shared(x);
            handles.push(tokio::spawn(async move { dispatcher.request(&tile).await }));
            tokio::task::yield_now().await;
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert_eq!(*order.lock().unwrap(), vec![7, 3, 9, 1]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_mid_load_discards_late_result() {
        let release = Arc::new(Notify::new());
        let finished = Arc::new(AtomicBool::new(false));
        let (gate, done) = (release.clone(), finished.clone());
        let dispatcher = Arc::new(RequestDispatcher::new(
            config(1, 3),
            move |_tile: Tile<String>| {
                let gate = gate.clone();
                let done = done.clone();
                async move {
                    gate.notified().await;
                    done.store(true, Ordering::SeqCst);
                    Ok::<_, BoxError>("late".to_string())
                }
            },
        ));
        let tile = shared(8);
        let request_id = tile.request_id();

        let handle = {
            let dispatcher = dispatcher.clone();
            let tile = tile.clone();
            tokio::spawn(async move { dispatcher.request(&tile).await })
        };
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(tile.state(), TileState::Loading);

        assert!(dispatcher.cancel(request_id));
        assert_eq!(tile.state(), TileState::Cancelled);
        assert_eq!(dispatcher.active_count(), 0);
        release.notify_waiters();

        let result = handle.await.unwrap();
        assert_eq!(result, Err(TileError::Cancelled(request_id)));
        assert_eq!(tile.state(), TileState::Cancelled);
        assert!(tile.snapshot().data.is_none());
        assert!(!finished.load(Ordering::SeqCst));

        let stats = dispatcher.stats().load;
        assert_eq!((stats.cancelled, stats.success, stats.failed), (1, 0, 0));
        assert!(!dispatcher.cancel(request_id));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_waiting_request_frees_its_place() {
        let release = Arc::new(Notify::new());
        let gate = release.clone();
        let dispatcher = Arc::new(RequestDispatcher::new(
            config(1, 0),
            move |_tile: Tile<String>| {
                let gate = gate.clone();
                async move {
                    gate.notified().await;
                    Ok::<_, BoxError>("ok".to_string())
                }
            },
        ));

        let tiles: Vec<_> = (0..3).map(shared).collect();
        let mut handles = Vec::new();
        for tile in &tiles {
            let dispatcher = dispatcher.clone();
            let tile = tile.clone();
            handles.push(tokio::spawn(async move { dispatcher.request(&tile).await }));
            tokio::task::yield_now().await;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!((dispatcher.active_count(), dispatcher.queue_length()), (1, 2));

        assert!(dispatcher.cancel(tiles[1].request_id()));
        assert_eq!(tiles[1].state(), TileState::Cancelled);
        assert_eq!(dispatcher.queue_length(), 1);

        // Finish the first load; the third request takes the slot
        release.notify_waiters();
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(tiles[0].state(), TileState::Loaded);
        assert_eq!(tiles[2].state(), TileState::Loading);

        release.notify_waiters();
        let results: Vec<_> = futures::future::join_all(handles)
            .await
            .into_iter()
            .map(|r| r.unwrap())
            .collect();
        assert!(results[0].is_ok());
        assert!(matches!(results[1], Err(TileError::Cancelled(_))));
        assert!(results[2].is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_batch_and_all() {
        let dispatcher = Arc::new(RequestDispatcher::new(
            config(1, 0),
            |_tile: Tile<String>| async move {
                std::future::pending::<()>().await;
                Ok::<_, BoxError>(String::new())
            },
        ));
        let tiles: Vec<_> = (0..4).map(shared).collect();
        for tile in &tiles {
            let dispatcher = dispatcher.clone();
            let tile = tile.clone();
            tokio::spawn(async move { dispatcher.request(&tile).await });
        }
        tokio::time::sleep(Duration::from_millis(1)).await;

        let unknown = RequestId::next();
        let batch = [tiles[0].request_id(), tiles[1].request_id(), unknown];
        assert_eq!(dispatcher.cancel_batch(&batch), 2);
        assert_eq!(dispatcher.cancel_all(), 2);
        assert!(tiles.iter().all(|t| t.state() == TileState::Cancelled));
        assert_eq!(dispatcher.stats().load.cancelled, 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_registration_is_rejected() {
        let dispatcher = Arc::new(RequestDispatcher::new(
            config(1, 0),
            |_tile: Tile<String>| async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                Ok::<_, BoxError>(String::new())
            },
        ));
        let tile = shared(1);
        let first = {
            let dispatcher = dispatcher.clone();
            let tile = tile.clone();
            tokio::spawn(async move { dispatcher.request(&tile).await })
        };
        tokio::task::yield_now().await;

        let err = dispatcher.request(&tile).await.unwrap_err();
        assert_eq!(err, TileError::DuplicateRequest(tile.request_id()));
        assert!(first.await.unwrap().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_dispose_cancels_and_refuses_new_work() {
        let dispatcher = Arc::new(RequestDispatcher::new(
            config(2, 0),
            |_tile: Tile<String>| async move {
                std::future::pending::<()>().await;
                Ok::<_, BoxError>(String::new())
            },
        ));
        let tile = shared(1);
        let handle = {
            let dispatcher = dispatcher.clone();
            let tile = tile.clone();
            tokio::spawn(async move { dispatcher.request(&tile).await })
        };
        tokio::task::yield_now().await;

        dispatcher.dispose();
        assert!(dispatcher.is_disposed());
        assert!(matches!(handle.await.unwrap(), Err(TileError::Cancelled(_))));
        assert_eq!(tile.state(), TileState::Cancelled);

        let late = shared(2);
        assert_eq!(dispatcher.request(&late).await, Err(TileError::Disposed));
        assert_eq!(late.state(), TileState::Pending);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_request_future_releases_slot() {
        let dispatcher = Arc::new(RequestDispatcher::new(
            config(1, 0),
            |_tile: Tile<String>| async move {
                std::future::pending::<()>().await;
                Ok::<_, BoxError>(String::new())
            },
        ));
        let tile = shared(1);
        let handle = {
            let dispatcher = dispatcher.clone();
            let tile = tile.clone();
            tokio::spawn(async move { dispatcher.request(&tile).await })
        };
        tokio::task::yield_now().await;
        assert_eq!(dispatcher.active_count(), 1);

        handle.abort();
        let _ = handle.await;
        assert_eq!(dispatcher.active_count(), 0);
        assert_eq!(tile.state(), TileState::Cancelled);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_stats() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let dispatcher = RequestDispatcher::new(config(1, 0), flaky(0, attempts));
        dispatcher.request(&shared(1)).await.unwrap();
        assert_eq!(dispatcher.stats().load.success, 1);

        dispatcher.reset_stats();
        assert_eq!(dispatcher.stats(), DispatcherStats::default());
    }
}
