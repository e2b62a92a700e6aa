pub mod dispatcher;
pub mod events;
pub mod queue;
pub mod source;
pub mod stats;
pub mod types;

// Re-exports for convenience
pub use dispatcher::{DispatcherStats, RequestDispatcher};
pub use events::{EventBus, ListenerId, TileEvent, TileEventKind};
pub use queue::{LayerAttachment, LayerSync, QueueInfo, QueueStats, TileCounts, TileQueue};
pub use source::{OpenStreetMapSource, TileSource, UrlTemplateSource};
pub use stats::{LoadStats, StatsAggregator};
pub use types::{RequestId, SharedTile, Tile, TilePriority, TileRequest, TileState};
