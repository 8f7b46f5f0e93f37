//! # Railtile
//!
//! Map tile serving and cache invalidation for railway infrastructure geometry.
//!
//! ## Current features
//!
//! Given a PostGIS database holding geo-referenced railway objects and a
//! declarative registry of layers and views, this crate renders Mapbox Vector
//! Tiles on demand, caches them per infrastructure version in Redis (or an
//! in-process map for single-instance deployments), and invalidates exactly
//! the cached tiles whose content changed when writers push new geometry:
//! either a whole layer/view at once, or only the tiles intersecting a
//! bounding box.
//!
//! ## Known limitations
//!
//! The focus is on rendering from a single PostGIS database; the per-layer
//! table schemas are owned by the writing application and are not managed
//! here. Geometry is assumed to be stored in EPSG:4326, and tiles are
//! addressed in the usual XYZ slippy-map scheme.
//!
//! The trait-based design allows for further extensibility, so additional
//! tile source backends can be added in the future.

#![deny(warnings)]

// TODO: remove once async fn in traits become stable
use async_trait::async_trait;

use sqlx::PgPool;

use crate::error::Error;

/// A source that can render a vector tile for one view of one layer.
///
/// Implementations are expected to scope the render to a single
/// infrastructure version, so tiles from distinct snapshots never mix.
#[async_trait]
pub trait TileSource: Sized {
    /// Renders the Mapbox vector tile for a slippy map tile in XYZ format.
    async fn render_mvt(
        &self,
        pool: &PgPool,
        zoom: u64,
        x: u64,
        y: u64,
        infra: &str,
    ) -> Result<Vec<u8>, Error>;
}

pub mod cache;
pub mod config;
pub mod error;
pub mod mercator;
pub mod mvt;
pub mod push;
pub mod server;
pub mod tiles;
