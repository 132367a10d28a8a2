mod image;

use axum::{
    Router,
    extract::DefaultBodyLimit,
    routing::{post, put},
};
use imgvault::prelude::*;
use std::{error::Error, sync::Arc};
use tokio::{net::TcpListener, signal};
use tower_http::{services::ServeDir, trace::TraceLayer};
use tracing_subscriber::EnvFilter;

#[derive(Clone)]
pub struct AppState {
    pub images: Arc<ImageController<Bucket>>,
}

/// Builds the HTTP routes. A local bucket is also served read-only under `/blobs`.
pub fn router(state: AppState, max_upload_bytes: usize) -> Router {
    let blob_root = match state.images.storage() {
        Bucket::Local(bucket) => Some(bucket.root().clone()),
        Bucket::Gcs(_) => None,
    };

    let app = Router::new()
        .route("/images", post(image::post_image).get(image::get_images))
        .route(
            "/images/{id}",
            put(image::put_image).delete(image::delete_image),
        )
        .layer(DefaultBodyLimit::max(max_upload_bytes))
        .with_state(state);

    let app = match blob_root {
        Some(root) => app.nest_service("/blobs", ServeDir::new(root)),
        None => app,
    };

    app.layer(TraceLayer::new_for_http())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,tower_http=info")),
        )
        .init();

    let config = Config::from_env()?;

    let db = Database::connect(&config.database_url, config.database_max_connections).await?;
    let bucket = Bucket::from_config(&config.storage)?;

    let mut images = ImageController::new(bucket, db).with_replace_order(config.replace_order);
    if config.serialize_writes {
        images = images.with_record_locks();
    }

    let state = AppState {
        images: Arc::new(images),
    };
    let app = router(state, config.max_upload_bytes);

    let listener = TcpListener::bind(config.bind_addr).await?;
    tracing::info!(
        addr = %config.bind_addr,
        replace_order = %config.replace_order,
        serialize_writes = config.serialize_writes,
        "listening"
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("server stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!("failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("shutdown signal received");
}
