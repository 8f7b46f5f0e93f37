use std::sync::Arc;

use clap::Parser;
use sqlx::postgres::PgPoolOptions;
use tracing_subscriber::EnvFilter;

use railtile::cache::TileCache;
use railtile::config::LayerSet;
use railtile::server::{app, AppState, Settings};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let settings = Settings::parse();

    // An invalid registry must keep the process from starting at all.
    let layers = match LayerSet::from_file(&settings.config) {
        Ok(layers) => layers,
        Err(e) => {
            eprintln!("configuration error: {e}");
            std::process::exit(2);
        }
    };
    tracing::info!(
        config = %settings.config.display(),
        layers = layers.layers.len(),
        "layer registry loaded"
    );

    let pool = PgPoolOptions::new()
        .max_connections(16)
        .connect(&settings.database_url)
        .await?;

    let cache = match &settings.redis_url {
        Some(url) => {
            let pool = deadpool_redis::Config::from_url(url)
                .create_pool(Some(deadpool_redis::Runtime::Tokio1))?;
            tracing::info!("tile cache: redis");
            TileCache::new_redis(pool)
        }
        None => {
            tracing::info!("tile cache: in-process");
            TileCache::new_local()
        }
    };

    let addr = settings.listen_addr.clone();
    let state = Arc::new(AppState {
        layers,
        pool,
        cache,
        settings,
    });

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!(%addr, "listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}
