use anyhow::Result;
use axum::{
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod api;
mod auth;
mod cache;
mod config;
mod error;
mod navigator;
mod retry;
mod session;
mod storage;
mod types;

use crate::{
    api::SpotifyApi,
    config::Config,
    session::AuthSession,
    storage::{FileStorage, MemoryStorage, Storage},
};

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub session: Arc<AuthSession>,
    pub api: Arc<SpotifyApi>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "valentine_spotify=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = Arc::new(Config::from_env()?);
    info!("Starting Spotify authorization companion");

    let storage_path = config
        .storage_path
        .clone()
        .or_else(FileStorage::default_path)
        .ok_or_else(|| anyhow::anyhow!("No data directory; set STORAGE_PATH"))?;
    let token_storage: Arc<dyn Storage> = Arc::new(FileStorage::open(&storage_path)?);
    info!("Tokens will be persisted to: {}", storage_path.display());

    let http_client = reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(30))
        .build()?;

    // The verifier only has to outlive one round trip to Spotify.
    let session = Arc::new(AuthSession::new(
        config.clone(),
        http_client.clone(),
        token_storage,
        Arc::new(MemoryStorage::new()),
    ));
    let api = Arc::new(
        SpotifyApi::new(session.clone(), http_client, &config.api_base_url)
            .with_cache_ttl(config.cache_ttl),
    );

    let app_state = AppState {
        config,
        session,
        api,
    };

    let addr = app_state.config.server_address();
    let app = router(app_state);

    info!("Listening on {}", addr);
    println!("\n💘 Valentine Spotify companion");
    println!("==============================");
    println!("Log in:  http://{}/auth/login", addr);
    println!("Status:  http://{}/auth/status", addr);
    println!("Search:  http://{}/api/search?q=love\n", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

fn router(state: AppState) -> Router {
    Router::new()
        // Auth routes
        .route("/auth/login", get(auth::login))
        .route("/auth/logout", post(auth::logout))
        .route("/auth/status", get(auth::status))
        .route("/callback", get(auth::callback))
        .route("/callback/fragment", post(auth::callback_fragment))
        // Catalogue routes
        .route("/api/search", get(api::search_handler))
        .route("/api/featured", get(api::featured_handler))
        .route("/api/playlists/:id/tracks", get(api::playlist_tracks_handler))
        .route("/api/previews", get(api::previews_handler))
        // Health check
        .route("/health", get(health_check))
        .route("/", get(root_handler))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

async fn health_check() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

async fn root_handler() -> impl IntoResponse {
    axum::Json(serde_json::json!({
        "service": "Valentine Spotify companion",
        "status": "running",
        "endpoints": {
            "login": "/auth/login",
            "status": "/auth/status",
            "search": "/api/search?q=",
            "previews": "/api/previews",
            "health": "/health"
        }
    }))
}
