//! Core data types for the tile scheduler

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;

use crate::core::geo::TileCoord;
use crate::TileError;

/// Global counter handing out request ids
static REQUEST_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Correlates a tile with one logical dispatcher request
///
/// Stable across the retries of one request; a tile re-queued through
/// [`TileQueue::retry_failed_tiles`](crate::tiles::TileQueue::retry_failed_tiles)
/// gets a fresh one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RequestId(u64);

impl RequestId {
    pub fn next() -> Self {
        Self(REQUEST_COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "req-{}", self.0)
    }
}

/// Lifecycle of a tile
///
/// ```text
/// PENDING --dispatch--> LOADING --success--> LOADED
///                       LOADING --retries exhausted--> FAILED
/// PENDING | LOADING --cancel--> CANCELLED
/// FAILED --retry_failed_tiles--> PENDING
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TileState {
    Pending,
    Loading,
    Loaded,
    Failed,
    Cancelled,
}

impl TileState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Loading => "loading",
            Self::Loaded => "loaded",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    /// PENDING or LOADING
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Pending | Self::Loading)
    }
}

impl fmt::Display for TileState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Named priority levels (higher number = higher priority)
///
/// Any `i32` is a valid priority; these are the levels layers use by convention.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum TilePriority {
    /// Background/low priority
    Background = 1,
    /// Prefetch tiles for predicted movement
    Prefetch = 10,
    /// One ring around visible area
    Adjacent = 50,
    /// Currently visible tiles (highest priority)
    Visible = 100,
}

impl From<TilePriority> for i32 {
    fn from(priority: TilePriority) -> Self {
        priority as i32
    }
}

/// What a caller asks the queue for: a coordinate, where to fetch it, how urgently
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TileRequest {
    pub coord: TileCoord,
    pub url: String,
    pub priority: i32,
}

impl TileRequest {
    pub fn new(coord: TileCoord, url: impl Into<String>, priority: impl Into<i32>) -> Self {
        Self {
            coord,
            url: url.into(),
            priority: priority.into(),
        }
    }
}

/// A tile record
///
/// `T` is the opaque payload produced by the load function. Records handed out by
/// the queue are snapshots; the live record sits behind a [`SharedTile`].
pub struct Tile<T = Vec<u8>> {
    /// Canonical `"z/x/y"` id
    pub id: String,
    pub coord: TileCoord,
    pub url: String,
    pub state: TileState,
    pub priority: i32,
    /// Retries performed by the current request
    pub retry_count: u32,
    pub request_id: RequestId,
    pub data: Option<Arc<T>>,
    /// Total time from request start to success, across all attempts
    pub load_time: Option<Duration>,
    pub last_error: Option<TileError>,
    /// Insertion order, used to break priority ties
    pub(crate) sequence: u64,
    /// When the tile reached LOADED
    pub(crate) completed_at: Option<Instant>,
}

impl<T> Tile<T> {
    pub fn new(coord: TileCoord, url: impl Into<String>, priority: i32) -> Self {
        Self {
            id: coord.key(),
            coord,
            url: url.into(),
            state: TileState::Pending,
            priority,
            retry_count: 0,
            request_id: RequestId::next(),
            data: None,
            load_time: None,
            last_error: None,
            sequence: 0,
            completed_at: None,
        }
    }

    pub fn is_loaded(&self) -> bool {
        self.state == TileState::Loaded
    }

    pub fn completed_at(&self) -> Option<Instant> {
        self.completed_at
    }
}

impl<T> Clone for Tile<T> {
    fn clone(&self) -> Self {
        Self {
            id: self.id.clone(),
            coord: self.coord,
            url: self.url.clone(),
            state: self.state,
            priority: self.priority,
            retry_count: self.retry_count,
            request_id: self.request_id,
            data: self.data.clone(),
            load_time: self.load_time,
            last_error: self.last_error.clone(),
            sequence: self.sequence,
            completed_at: self.completed_at,
        }
    }
}

impl<T> fmt::Debug for Tile<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tile")
            .field("id", &self.id)
            .field("url", &self.url)
            .field("state", &self.state)
            .field("priority", &self.priority)
            .field("retry_count", &self.retry_count)
            .field("request_id", &self.request_id)
            .field("has_data", &self.data.is_some())
            .field("load_time", &self.load_time)
            .field("last_error", &self.last_error)
            .finish()
    }
}

/// A live tile record shared between the queue and the dispatcher
pub struct SharedTile<T = Vec<u8>>(Arc<Mutex<Tile<T>>>);

impl<T> SharedTile<T> {
    pub fn new(tile: Tile<T>) -> Self {
        Self(Arc::new(Mutex::new(tile)))
    }

    // Every critical section leaves the record consistent, so a poisoned lock is
    // still safe to use.
    fn lock(&self) -> MutexGuard<'_, Tile<T>> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Copy of the current record
    pub fn snapshot(&self) -> Tile<T> {
        self.lock().clone()
    }

    pub fn read<R>(&self, f: impl FnOnce(&Tile<T>) -> R) -> R {
        f(&self.lock())
    }

    pub fn update<R>(&self, f: impl FnOnce(&mut Tile<T>) -> R) -> R {
        f(&mut self.lock())
    }

    pub fn state(&self) -> TileState {
        self.lock().state
    }

    pub fn request_id(&self) -> RequestId {
        self.lock().request_id
    }

    /// Whether both handles point at the same record
    pub fn same_record(&self, other: &SharedTile<T>) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl<T> Clone for SharedTile<T> {
    fn clone(&self) -> Self {
        Self(Arc::clone(&self.0))
    }
}

impl<T> fmt::Debug for SharedTile<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&*self.lock(), f)
    }
}
