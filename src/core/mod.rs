pub mod config;
pub mod geo;

pub use config::{DispatcherConfig, TileQueueConfig};
pub use geo::TileCoord;
