//! Tile cache backend and the cache key hierarchy.
//!
//! Keys compose as `<prefix>.layer.<layer>.infra_<version>.<view>.tile/<z>/<x>/<y>`
//! and the three functions below are the only approved way to build them:
//! the same composition serves both writing and invalidating, so the two
//! can never disagree. Full invalidation lists keys by prefix; the prefix
//! patterns always end at a `.` boundary so that `infra_v1` never sweeps
//! `infra_v12` keys.
//!
//! Two backends: a Redis pool for multi-instance deployments, and an
//! in-process map for single-instance ones and for tests. Redis mode has no
//! local tier in front, since bounded invalidation has to take effect
//! across instances as soon as the delete returns.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use deadpool_redis::Pool;
use once_cell::sync::Lazy;
use redis::AsyncCommands;
use regex::Regex;

use crate::error::Error;
use crate::tiles::Tile;

/// Grammar for caller-supplied infra versions. The token is opaque but it
/// participates in key patterns used for pattern deletion, so it must not
/// carry pattern metacharacters.
static VERSION: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9_.-]+$").expect("version regex"));

pub fn check_version(version: &str) -> Result<(), Error> {
    if VERSION.is_match(version) {
        Ok(())
    } else {
        Err(Error::InvalidVersion(version.to_string()))
    }
}

/// Key prefix covering every cached tile of one layer and infra version.
pub fn layer_prefix(prefix: &str, layer: &str, infra: &str) -> String {
    format!("{prefix}.layer.{layer}.infra_{infra}")
}

/// Key prefix covering one view of a layer.
pub fn view_prefix(prefix: &str, layer: &str, infra: &str, view: &str) -> String {
    format!("{}.{view}", layer_prefix(prefix, layer, infra))
}

/// The cache key of a single rendered tile.
pub fn tile_key(prefix: &str, layer: &str, infra: &str, view: &str, tile: Tile) -> String {
    format!(
        "{}.tile/{}/{}/{}",
        view_prefix(prefix, layer, infra, view),
        tile.zoom,
        tile.x,
        tile.y
    )
}

/// A locally cached tile with its expiry.
#[derive(Clone, Debug)]
pub struct CachedTile {
    data: Vec<u8>,
    cached_at: Instant,
    ttl: Duration,
}

impl CachedTile {
    fn is_expired(&self) -> bool {
        self.cached_at.elapsed() > self.ttl
    }
}

/// The key-value store rendered tiles live in.
#[derive(Clone)]
pub enum TileCache {
    /// Single-instance: in-process map only.
    Local(Arc<DashMap<String, CachedTile>>),

    /// Multi-instance: shared Redis.
    Redis(Pool),
}

impl TileCache {
    pub fn new_local() -> Self {
        TileCache::Local(Arc::new(DashMap::new()))
    }

    pub fn new_redis(pool: Pool) -> Self {
        TileCache::Redis(pool)
    }

    pub async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, Error> {
        match self {
            TileCache::Local(map) => {
                if let Some(entry) = map.get(key) {
                    if !entry.is_expired() {
                        return Ok(Some(entry.data.clone()));
                    }
                    drop(entry);
                    map.remove(key);
                }
                Ok(None)
            }
            TileCache::Redis(pool) => {
                let mut conn = pool.get().await?;
                let data: Option<Vec<u8>> = conn.get(key).await?;
                Ok(data)
            }
        }
    }

    pub async fn set(&self, key: &str, data: Vec<u8>, ttl: Duration) -> Result<(), Error> {
        match self {
            TileCache::Local(map) => {
                map.insert(
                    key.to_string(),
                    CachedTile {
                        data,
                        cached_at: Instant::now(),
                        ttl,
                    },
                );
                Ok(())
            }
            TileCache::Redis(pool) => {
                let mut conn = pool.get().await?;
                let _: () = conn.set_ex(key, data, ttl.as_secs()).await?;
                Ok(())
            }
        }
    }

    /// Deletes a batch of keys in one round trip. Empty batches are a no-op
    /// and never an error.
    pub async fn delete_many(&self, keys: Vec<String>) -> Result<(), Error> {
        if keys.is_empty() {
            return Ok(());
        }
        match self {
            TileCache::Local(map) => {
                for key in &keys {
                    map.remove(key);
                }
                Ok(())
            }
            TileCache::Redis(pool) => {
                let mut conn = pool.get().await?;
                let _: () = conn.del(keys).await?;
                Ok(())
            }
        }
    }

    /// Lists every key starting with `prefix`.
    pub async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, Error> {
        match self {
            TileCache::Local(map) => Ok(map
                .iter()
                .map(|entry| entry.key().clone())
                .filter(|key| key.starts_with(prefix))
                .collect()),
            TileCache::Redis(pool) => {
                let mut conn = pool.get().await?;
                let keys: Vec<String> = conn.keys(format!("{prefix}*")).await?;
                Ok(keys)
            }
        }
    }

    /// Liveness check for the health probe.
    pub async fn ping(&self) -> Result<(), Error> {
        match self {
            TileCache::Local(_) => Ok(()),
            TileCache::Redis(pool) => {
                let mut conn = pool.get().await?;
                let _: String = redis::cmd("PING").query_async(&mut conn).await?;
                Ok(())
            }
        }
    }
}

/// Bounded invalidation: deletes exactly the tile keys for the given
/// per-view tile sets, batched into a single round trip.
pub async fn invalidate_tiles(
    cache: &TileCache,
    prefix: &str,
    layer: &str,
    infra: &str,
    affected: &HashMap<String, HashSet<Tile>>,
) -> Result<(), Error> {
    let keys: Vec<String> = affected
        .iter()
        .flat_map(|(view, tiles)| {
            tiles
                .iter()
                .map(move |tile| tile_key(prefix, layer, infra, view, *tile))
        })
        .collect();
    let count = keys.len();
    cache.delete_many(keys).await?;
    tracing::debug!(layer, infra, tiles = count, "bounded invalidation");
    Ok(())
}

/// Full invalidation: drops every key under a layer prefix, or under one
/// view's prefix when `view` is given.
pub async fn invalidate_full(
    cache: &TileCache,
    prefix: &str,
    layer: &str,
    infra: &str,
    view: Option<&str>,
) -> Result<(), Error> {
    let prefix = match view {
        Some(view) => format!("{}.", view_prefix(prefix, layer, infra, view)),
        None => format!("{}.", layer_prefix(prefix, layer, infra)),
    };
    let keys = cache.keys_with_prefix(&prefix).await?;
    let count = keys.len();
    cache.delete_many(keys).await?;
    tracing::info!(layer, infra, keys = count, "full invalidation");
    Ok(())
}
