//! Error taxonomy for the tile engine.
//!
//! `ConfigError` is fatal and only produced while loading the layer registry
//! at startup. `Error` covers request-time failures and maps onto HTTP status
//! codes: unknown names become 404, bad payloads become 400, and unreachable
//! stores become 503 rather than being retried or papered over with stale
//! data.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;

use crate::tiles::BoundingBox;

/// A problem in the layer registry, detected at load time.
///
/// The process must not start with a registry that fails validation.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("could not read layer configuration: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid YAML in layer configuration: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("invalid identifier '{name}' for {context}")]
    InvalidIdentifier { context: String, name: String },
    #[error("duplicate layer '{0}'")]
    DuplicateLayer(String),
    #[error("duplicate view '{view}' on layer '{layer}'")]
    DuplicateView { layer: String, view: String },
    #[error("duplicate field '{field}' in '{scope}'")]
    DuplicateField { scope: String, field: String },
    #[error("field 'id' in view '{0}' collides with the generated feature id")]
    ReservedField(String),
    #[error("view '{view}' references undeclared field '{field}'")]
    UndeclaredField { view: String, field: String },
    #[error("on_field '{field}' of view '{view}' is not a geometry field")]
    NotGeometry { view: String, field: String },
    #[error("id_field '{field}' of layer '{layer}' is not a declared field")]
    UnknownIdField { layer: String, field: String },
    #[error("view '{0}' has a zero cache duration")]
    ZeroCacheDuration(String),
}

/// A request-time failure.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("layer '{0}' not found")]
    LayerNotFound(String),
    #[error("view '{view}' not found on layer '{layer}'")]
    ViewNotFound { layer: String, view: String },
    #[error("unknown field '{field}', expected one of: {}", .valid.join(", "))]
    UnknownField { field: String, valid: Vec<String> },
    #[error("missing mandatory field '{field}'")]
    MissingField { field: String },
    #[error("field '{field}' expects a {expected} value")]
    InvalidValue { field: String, expected: &'static str },
    #[error("field '{field}' does not hold a usable GeoJSON geometry")]
    MalformedGeometry { field: String },
    #[error("invalid bounding box {0:?}")]
    InvalidBoundingBox(BoundingBox),
    #[error("invalid infra version '{0}'")]
    InvalidVersion(String),
    #[error("tile {zoom}/{x}/{y} is outside the tiling scheme")]
    TileOutOfBounds { zoom: u64, x: u64, y: u64 },
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("cache error: {0}")]
    Cache(#[from] redis::RedisError),
    #[error("cache pool error: {0}")]
    CachePool(#[from] deadpool_redis::PoolError),
}

impl Error {
    pub fn status(&self) -> StatusCode {
        match self {
            Error::LayerNotFound(_) | Error::ViewNotFound { .. } => StatusCode::NOT_FOUND,
            Error::UnknownField { .. }
            | Error::MissingField { .. }
            | Error::InvalidValue { .. }
            | Error::MalformedGeometry { .. }
            | Error::InvalidBoundingBox(_)
            | Error::InvalidVersion(_)
            | Error::TileOutOfBounds { .. } => StatusCode::BAD_REQUEST,
            Error::Database(_) | Error::Cache(_) | Error::CachePool(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.status();
        if status == StatusCode::SERVICE_UNAVAILABLE {
            tracing::warn!(error = %self, "upstream store unavailable");
        }
        let body = Json(serde_json::json!({ "message": self.to_string() }));
        (status, body).into_response()
    }
}
