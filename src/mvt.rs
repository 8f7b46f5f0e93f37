//! Vector tile query construction and the cache-through serving path.
//!
//! One query per (layer, view, tile): the view's geometry column is clipped
//! to the tile envelope with `ST_AsMVTGeom`, the configured fields and joins
//! are projected around it, and the rows are folded into a single MVT blob
//! with `ST_AsMVT`. The envelope corners and the infra version are bind
//! parameters; every other fragment of the query text comes from the
//! registry validated at startup, never from request input.

use std::time::Duration;

use async_trait::async_trait;
use futures::TryStreamExt;
use sqlx::{PgPool, Row};

use crate::cache::{self, TileCache};
use crate::config::{Layer, View, FEATURE_ID};
use crate::error::Error;
use crate::mercator;
use crate::tiles::Tile;
use crate::TileSource;

/// MVT extent in tile-internal coordinates.
const EXTENT: u32 = 4096;
/// Clip buffer around the tile envelope, in extent units.
const BUFFER: u32 = 64;

/// One view of one layer, ready to render tiles.
pub struct TileQuery<'a> {
    pub layer: &'a Layer,
    pub view: &'a View,
}

impl TileQuery<'_> {
    /// Builds the parameterized tile query.
    ///
    /// `$1..$4` are the envelope corners (west, south, east, north in
    /// degrees), `$5` is the infra version. Multi-geometry collections are
    /// excluded since the tile format cannot represent them.
    fn prepared_statement_sql(&self) -> String {
        let envelope = "ST_MakeEnvelope($1, $2, $3, $4, 4326)";
        let fields: String = self
            .view
            .fields
            .iter()
            .map(|field| format!(", {field}"))
            .collect();
        let joins = self.view.joins.join(" ");

        format!(
            "SELECT ST_AsMVT(tile, '{name}', {EXTENT}, 'mvt_geom') FROM (\
             SELECT ST_AsMVTGeom({geom}, {envelope}, {EXTENT}, {BUFFER}) AS mvt_geom, \
             {id_field} AS {FEATURE_ID}{fields} \
             FROM {table} {joins} \
             WHERE {geom} && {envelope} \
             AND infra_id = $5 \
             AND GeometryType({geom}) != 'GEOMETRYCOLLECTION'\
             ) AS tile WHERE mvt_geom IS NOT NULL",
            name = self.layer.name,
            geom = self.view.on_field,
            id_field = self.layer.id_field,
            table = self.layer.table_name,
        )
    }
}

#[async_trait]
impl TileSource for TileQuery<'_> {
    async fn render_mvt(
        &self,
        pool: &PgPool,
        zoom: u64,
        x: u64,
        y: u64,
        infra: &str,
    ) -> Result<Vec<u8>, Error> {
        let bounds = mercator::tile_bbox(zoom, x, y);
        let sql = self.prepared_statement_sql();

        // One consistent snapshot per tile, even with concurrent writers.
        let mut tx = pool.begin().await?;
        sqlx::query("SET TRANSACTION ISOLATION LEVEL REPEATABLE READ READ ONLY")
            .execute(&mut *tx)
            .await?;

        let query = sqlx::query(&sql)
            .bind(bounds.0 .0)
            .bind(bounds.0 .1)
            .bind(bounds.1 .0)
            .bind(bounds.1 .1)
            .bind(infra);

        let mut raw_tile: Vec<u8> = Vec::new();
        {
            let mut stream = query.fetch(&mut *tx);
            while let Some(row) = stream.try_next().await? {
                if let Some(chunk) = row.try_get::<Option<Vec<u8>>, _>(0)? {
                    raw_tile.extend_from_slice(&chunk);
                }
            }
        }
        tx.commit().await?;

        Ok(raw_tile)
    }
}

/// Serves one tile through the cache: probe, render on miss, store under the
/// view's cache duration. Empty tiles are cached too, so sparse areas do not
/// hit the database on every read.
pub async fn fetch_tile(
    pool: &PgPool,
    cache: &TileCache,
    prefix: &str,
    layer: &Layer,
    view: &View,
    tile: Tile,
    infra: &str,
) -> Result<Vec<u8>, Error> {
    let key = cache::tile_key(prefix, &layer.name, infra, &view.name, tile);

    if let Some(data) = cache.get(&key).await? {
        tracing::debug!(%key, "tile cache hit");
        return Ok(data);
    }

    let source = TileQuery { layer, view };
    let data = source
        .render_mvt(pool, tile.zoom, tile.x, tile.y, infra)
        .await?;
    cache
        .set(&key, data.clone(), Duration::from_secs(view.cache_duration))
        .await?;
    tracing::debug!(%key, bytes = data.len(), "tile cache miss, rendered");

    Ok(data)
}
