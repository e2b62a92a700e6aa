//! # maplet-tiles
//!
//! The tile-fetch scheduler of the maplet map engine.
//!
//! Layers hand the scheduler the tiles they want (by `z/x/y`, url and priority);
//! it turns that stream into a bounded set of concurrent fetches with priority
//! ordering, retry with exponential backoff, cancellation, a size-bounded recency
//! cache of loaded tiles and latency telemetry (p50/p95/p99).
//!
//! Fetching itself is injected: the queue calls a caller-supplied
//! [`TileLoadFn`](traits::TileLoadFn) and treats the payload as opaque.
//!
//! ```ignore
//! use maplet_tiles::prelude::*;
//!
//! let queue = TileQueue::new(TileQueueConfig::default(), |tile: Tile<Vec<u8>>| async move {
//!     fetch_bytes(&tile.url).await
//! })?;
//!
//! queue.add_tile(TileCoord::new(0, 0, 0), "https://tile.example/0/0/0.png", TilePriority::Visible)?;
//! ```

pub mod core;
pub mod prelude;
pub mod runtime;
pub mod tiles;
pub mod traits;

// Re-export public API
pub use crate::core::{
    config::{DispatcherConfig, TileQueueConfig},
    geo::TileCoord,
};

pub use crate::tiles::{
    dispatcher::{DispatcherStats, RequestDispatcher},
    events::{ListenerId, TileEvent, TileEventKind},
    queue::{QueueInfo, QueueStats, TileCounts, TileQueue},
    source::{OpenStreetMapSource, TileSource, UrlTemplateSource},
    stats::{LoadStats, StatsAggregator},
    types::{RequestId, SharedTile, Tile, TilePriority, TileRequest, TileState},
};

pub use crate::traits::{TileLayerClient, TileLoadFn};

/// Result type used throughout the library
pub type Result<T> = std::result::Result<T, TileError>;

/// Error type returned by load functions
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Common error types
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TileError {
    #[error("Load error: {0}")]
    Load(String),

    #[error("Request timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("Request {0} was cancelled")]
    Cancelled(RequestId),

    #[error("Request {0} is already in flight")]
    DuplicateRequest(RequestId),

    #[error("Tile scheduler has been disposed")]
    Disposed,

    #[error("No async runtime available to run the tile queue")]
    NoRuntime,

    #[error("Invalid coordinates: {0}")]
    InvalidCoordinates(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl TileError {
    /// Whether this error ends a request without counting as a load failure
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled(_))
    }
}

/// Error type alias for convenience
pub type Error = TileError;

/// Initialise `env_logger` for binaries and tests. Safe to call more than once.
#[cfg(feature = "debug")]
pub fn init_logging() {
    let _ = env_logger::builder().is_test(cfg!(test)).try_init();
}
