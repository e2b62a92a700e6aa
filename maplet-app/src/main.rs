use maplet_tiles::prelude::{
    BoxError, OpenStreetMapSource, Tile, TileCoord, TileEventKind, TilePriority, TileQueue,
    TileQueueConfig,
};
use std::time::{Duration, Instant};

/// Headless tile scheduler demo
///
/// Requests a zoom-3 grid of OpenStreetMap tiles against a simulated tile server
/// with variable latency and a few broken tiles, then prints the queue statistics.
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    maplet_tiles::init_logging();

    let config = match std::env::var("MAPLET_TILES_CONFIG") {
        Ok(json) => TileQueueConfig::from_json_str(&json)?,
        Err(_) => TileQueueConfig {
            retry_delay_base_ms: 50,
            retry_delay_max_ms: 400,
            request_timeout_ms: 500,
            max_cache_size: 48,
            ..TileQueueConfig::default()
        },
    };
    log::info!("starting with {:?}", config);

    let queue = TileQueue::new(config, simulated_server)?;
    queue.on(TileEventKind::Loaded, |tile| {
        log::info!(
            "loaded {} in {:?} ({} retries)",
            tile.id,
            tile.load_time.unwrap_or_default(),
            tile.retry_count
        );
    });
    queue.on(TileEventKind::Failed, |tile| {
        if let Some(error) = &tile.last_error {
            log::warn!("gave up on {}: {}", tile.id, error);
        }
    });

    let source = OpenStreetMapSource::new();
    let zoom = 3;
    let side = 1u32 << zoom;
    let center = side / 2;
    let started = Instant::now();

    for x in 0..side {
        for y in 0..side {
            let ring = x.abs_diff(center).max(y.abs_diff(center));
            let priority = match ring {
                0..=1 => TilePriority::Visible,
                2 => TilePriority::Adjacent,
                3 => TilePriority::Prefetch,
                _ => TilePriority::Background,
            };
            queue.add_tile_from_source(&source, TileCoord::new(x, y, zoom), priority)?;
        }
    }

    // Panning away: the far corner is no longer needed
    let dropped = queue.remove_tiles(["3/0/0", "3/0/1", "3/1/0"]);
    log::info!("dropped {} tiles that scrolled out of view", dropped);

    tokio::select! {
        _ = wait_until_idle(&queue) => {}
        _ = tokio::signal::ctrl_c() => {
            log::info!("interrupted");
        }
    }

    let requeued = queue.retry_failed_tiles();
    if requeued > 0 {
        wait_until_idle(&queue).await;
    }

    println!("finished in {:?}", started.elapsed());
    println!("{}", serde_json::to_string_pretty(&queue.stats())?);
    println!("{}", serde_json::to_string_pretty(&queue.info())?);

    queue.dispose();
    Ok(())
}

/// Stand-in for a tile server: latency grows with distance from the origin,
/// every 13th tile fails on its first attempt and tile 3/7/7 never succeeds.
async fn simulated_server(tile: Tile<Vec<u8>>) -> Result<Vec<u8>, BoxError> {
    let coord = tile.coord;
    let latency = 20 + u64::from((coord.x * 7 + coord.y * 11) % 60);
    tokio::time::sleep(Duration::from_millis(latency)).await;

    if coord.x == 7 && coord.y == 7 {
        return Err(format!("{} returned 404", tile.url).into());
    }
    if (coord.x + coord.y * 8) % 13 == 0 && tile.retry_count == 0 {
        return Err(format!("{} reset the connection", tile.url).into());
    }

    Ok(tile.url.into_bytes())
}

async fn wait_until_idle(queue: &TileQueue<Vec<u8>>) {
    while queue.is_processing() {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use maplet_tiles::prelude::TileLoadFn;

    fn loader<L: TileLoadFn<Vec<u8>>>(load_fn: L) -> L {
        load_fn
    }

    #[tokio::test]
    async fn test_simulated_server_serves_and_fails() {
        let server = loader(simulated_server);

        let ok = Tile::new(TileCoord::new(1, 2, 3), "http://tiles/3/1/2.png", 0);
        assert_eq!(server.load(ok).await.unwrap(), b"http://tiles/3/1/2.png");

        let missing = Tile::new(TileCoord::new(7, 7, 3), "http://tiles/3/7/7.png", 0);
        let error = server.load(missing).await.unwrap_err();
        assert!(error.to_string().contains("404"));

        // 3/0/0 drops its first attempt only
        let mut flaky = Tile::new(TileCoord::new(0, 0, 3), "http://tiles/3/0/0.png", 0);
        assert!(server.load(flaky.clone()).await.is_err());
        flaky.retry_count = 1;
        assert!(server.load(flaky).await.is_ok());
    }
}
