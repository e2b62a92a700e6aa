//! Seams between the scheduler and the rest of the map engine
//!
//! - [`TileLoadFn`] is the only collaborator the scheduler consumes: it turns a
//!   tile into a payload. Any `Fn(Tile<T>) -> impl Future<Output = Result<T, _>>`
//!   closure qualifies.
//! - [`TileLayerClient`] is the capability a layer implements to be driven by a
//!   [`TileQueue`](crate::tiles::TileQueue). The queue works against this trait
//!   instead of probing layers for optional methods.

use async_trait::async_trait;
use std::future::Future;

use crate::tiles::types::{Tile, TileRequest};
use crate::BoxError;

/// Fetch strategy injected into the dispatcher
#[async_trait]
pub trait TileLoadFn<T>: Send + Sync {
    /// Produce the payload for `tile`. A rejection is retried per the retry policy.
    async fn load(&self, tile: Tile<T>) -> Result<T, BoxError>;
}

#[async_trait]
impl<T, F, Fut> TileLoadFn<T> for F
where
    T: Send + Sync + 'static,
    F: Fn(Tile<T>) -> Fut + Send + Sync,
    Fut: Future<Output = Result<T, BoxError>> + Send + 'static,
{
    async fn load(&self, tile: Tile<T>) -> Result<T, BoxError> {
        (self)(tile).await
    }
}

/// A layer whose visible-tile set is served by a tile queue
///
/// Visibility math stays with the layer: it reports the tiles it currently wants
/// and is told when they settle.
pub trait TileLayerClient<T>: Send + Sync {
    fn layer_id(&self) -> &str;

    /// Tiles the layer needs right now
    fn wanted_tiles(&self) -> Vec<TileRequest>;

    fn on_tile_loaded(&self, _tile: &Tile<T>) {}

    fn on_tile_failed(&self, _tile: &Tile<T>) {}
}
