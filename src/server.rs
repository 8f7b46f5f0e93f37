//! HTTP surface: a thin dispatcher over the registry, the tile renderer,
//! the cache, and the push pipeline.
//!
//! Handlers share one immutable [`AppState`]; the only mutable state they
//! touch lives behind the pooled store and cache connections, which are
//! checked out per request and released on every exit path.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use clap::Parser;
use serde::Deserialize;
use serde_json::{json, Value};
use sqlx::PgPool;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use crate::cache::{self, TileCache};
use crate::config::LayerSet;
use crate::error::Error;
use crate::mvt;
use crate::push::{self, Record};
use crate::tiles::{affected_tiles, BoundingBox, Tile};

const MVT_CONTENT_TYPE: &str = "application/vnd.mapbox-vector-tile";

/// Runtime settings, from CLI flags or the environment.
#[derive(Parser, Debug, Clone)]
#[command(name = "railtile", version, about)]
pub struct Settings {
    /// Path to the layer registry YAML.
    #[arg(long, env = "RAILTILE_CONFIG", default_value = "railtile.yml")]
    pub config: PathBuf,

    #[arg(long, env = "RAILTILE_ADDR", default_value = "0.0.0.0:7000")]
    pub listen_addr: String,

    #[arg(long, env = "DATABASE_URL")]
    pub database_url: String,

    /// Redis URL; when absent tiles are cached in-process.
    #[arg(long, env = "REDIS_URL")]
    pub redis_url: Option<String>,

    /// Namespace prepended to every cache key.
    #[arg(long, env = "RAILTILE_CACHE_PREFIX", default_value = "railtile")]
    pub cache_prefix: String,

    /// Public base URL advertised in tile-source metadata.
    #[arg(long, env = "RAILTILE_ROOT_URL", default_value = "http://localhost:7000")]
    pub root_url: String,

    #[arg(long, env = "RAILTILE_MAX_ZOOM", default_value_t = 18)]
    pub max_zoom: u64,

    /// Per-request deadline, in seconds.
    #[arg(long, env = "RAILTILE_REQUEST_TIMEOUT", default_value_t = 30)]
    pub request_timeout: u64,
}

/// Everything a request handler needs. Immutable after startup.
pub struct AppState {
    pub layers: LayerSet,
    pub pool: PgPool,
    pub cache: TileCache,
    pub settings: Settings,
}

#[allow(deprecated)]
pub fn app(state: Arc<AppState>) -> Router {
    let timeout = Duration::from_secs(state.settings.request_timeout);
    Router::new()
        .route("/health", get(health))
        .route("/info", get(info))
        .route("/layer/{layer}/mvt/{view}", get(view_metadata))
        .route("/tile/{layer}/{view}/{z}/{x}/{y}", get(tile))
        .route("/layer/{layer}/invalidate", post(invalidate_layer))
        .route("/layer/{layer}/invalidate_bbox", post(invalidate_bbox))
        .route("/push/{layer}/insert", post(insert_batch))
        .layer(TraceLayer::new_for_http())
        .layer(TimeoutLayer::new(timeout))
        .with_state(state)
}

#[derive(Debug, Deserialize)]
struct InfraParams {
    infra: String,
}

#[derive(Debug, Deserialize)]
struct VersionParams {
    version: String,
}

#[derive(Debug, Deserialize)]
struct FullInvalidationParams {
    infra: String,
    view: Option<String>,
}

/// One bounded-invalidation request item.
#[derive(Debug, Deserialize)]
pub struct BoundedInvalidation {
    pub view: String,
    pub bbox: BoundingBox,
}

/// Exercises both stores with a trivial call each.
async fn health(State(state): State<Arc<AppState>>) -> Result<StatusCode, Error> {
    sqlx::query_scalar::<_, i32>("SELECT 1")
        .fetch_one(&state.pool)
        .await?;
    state.cache.ping().await?;
    Ok(StatusCode::OK)
}

/// The serialized registry, for client discovery.
async fn info(State(state): State<Arc<AppState>>) -> Json<Value> {
    let mut layers = serde_json::Map::new();
    for layer in &state.layers.layers {
        let mut fields = serde_json::Map::new();
        for field in &layer.fields {
            fields.insert(field.name.clone(), json!(field.kind.name()));
        }
        let views: Vec<&str> = layer.views.iter().map(|v| v.name.as_str()).collect();
        layers.insert(
            layer.name.clone(),
            json!({
                "id_field": layer.id_field,
                "attribution": layer.attribution,
                "fields": fields,
                "views": views,
            }),
        );
    }
    Json(json!({ "name": state.layers.name, "layers": layers }))
}

/// Tile-source metadata for client map libraries.
async fn view_metadata(
    Path((layer, view)): Path<(String, String)>,
    Query(params): Query<InfraParams>,
    State(state): State<Arc<AppState>>,
) -> Result<Json<Value>, Error> {
    cache::check_version(&params.infra)?;
    let layer = state.layers.layer(&layer)?;
    let view = layer.view(&view)?;

    let mut promote_id = serde_json::Map::new();
    promote_id.insert(layer.name.clone(), json!(layer.id_field));
    let template = format!(
        "{}/tile/{}/{}/{{z}}/{{x}}/{{y}}?infra={}",
        state.settings.root_url, layer.name, view.name, params.infra
    );

    Ok(Json(json!({
        "type": "vector",
        "name": layer.name,
        "promoteId": promote_id,
        "scheme": "xyz",
        "tiles": [template],
        "attribution": layer.attribution.clone().unwrap_or_default(),
        "minzoom": 0,
        "maxzoom": state.settings.max_zoom,
    })))
}

/// Binary vector-tile payload; zero-feature tiles are a 200 like any other.
#[tracing::instrument(skip(state))]
async fn tile(
    Path((layer, view, zoom, x, y)): Path<(String, String, u64, u64, u64)>,
    Query(params): Query<InfraParams>,
    State(state): State<Arc<AppState>>,
) -> Result<impl IntoResponse, Error> {
    cache::check_version(&params.infra)?;
    let layer = state.layers.layer(&layer)?;
    let view = layer.view(&view)?;

    if zoom > state.settings.max_zoom {
        return Err(Error::TileOutOfBounds { zoom, x, y });
    }
    let side = 1u64 << zoom;
    if x >= side || y >= side {
        return Err(Error::TileOutOfBounds { zoom, x, y });
    }

    let data = mvt::fetch_tile(
        &state.pool,
        &state.cache,
        &state.settings.cache_prefix,
        layer,
        view,
        Tile { zoom, x, y },
        &params.infra,
    )
    .await?;
    Ok(([(header::CONTENT_TYPE, MVT_CONTENT_TYPE)], data))
}

/// Full invalidation of a layer, or of one view when `view` is given.
async fn invalidate_layer(
    Path(layer): Path<String>,
    Query(params): Query<FullInvalidationParams>,
    State(state): State<Arc<AppState>>,
) -> Result<StatusCode, Error> {
    cache::check_version(&params.infra)?;
    let layer = state.layers.layer(&layer)?;
    let view = match &params.view {
        Some(name) => Some(layer.view(name)?.name.as_str()),
        None => None,
    };
    cache::invalidate_full(
        &state.cache,
        &state.settings.cache_prefix,
        &layer.name,
        &params.infra,
        view,
    )
    .await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Bounded invalidation: one tile set per view, merged across body items.
#[tracing::instrument(skip(state, body))]
async fn invalidate_bbox(
    Path(layer): Path<String>,
    Query(params): Query<InfraParams>,
    State(state): State<Arc<AppState>>,
    Json(body): Json<Vec<BoundedInvalidation>>,
) -> Result<StatusCode, Error> {
    cache::check_version(&params.infra)?;
    let layer = state.layers.layer(&layer)?;

    let mut affected: HashMap<String, HashSet<Tile>> = HashMap::new();
    for item in &body {
        let view = layer.view(&item.view)?;
        let tiles = affected_tiles(state.settings.max_zoom, &item.bbox)?;
        affected.entry(view.name.clone()).or_default().extend(tiles);
    }

    cache::invalidate_tiles(
        &state.cache,
        &state.settings.cache_prefix,
        &layer.name,
        &params.infra,
        &affected,
    )
    .await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Validates and stores a batch of records, then invalidates the tiles the
/// batch touched.
#[tracing::instrument(skip(state, records))]
async fn insert_batch(
    Path(layer): Path<String>,
    Query(params): Query<VersionParams>,
    State(state): State<Arc<AppState>>,
    Json(records): Json<Vec<Record>>,
) -> Result<StatusCode, Error> {
    cache::check_version(&params.version)?;
    let layer = state.layers.layer(&layer)?;
    push::push_batch(
        &state.pool,
        &state.cache,
        &state.settings.cache_prefix,
        state.settings.max_zoom,
        layer,
        &params.version,
        &records,
    )
    .await?;
    Ok(StatusCode::CREATED)
}
