//! Prelude module for common scheduler types and traits
//!
//! This module re-exports the most commonly used types, traits, and functions
//! for easy importing with `use maplet_tiles::prelude::*;`

pub use crate::core::{
    config::{DispatcherConfig, TileQueueConfig},
    geo::TileCoord,
};

pub use crate::tiles::{
    dispatcher::{DispatcherStats, RequestDispatcher},
    events::{ListenerId, TileEvent, TileEventKind},
    queue::{QueueInfo, QueueStats, TileCounts, TileQueue},
    source::{OpenStreetMapSource, TileSource, UrlTemplateSource},
    stats::LoadStats,
    types::{RequestId, Tile, TilePriority, TileRequest, TileState},
};

pub use crate::traits::{TileLayerClient, TileLoadFn};

pub use crate::{BoxError, Error as TileQueueError, Result, TileError};

pub use std::{sync::Arc, time::Duration};
