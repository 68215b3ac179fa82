use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::Router;
use axum::routing::{delete, get, post};
use hcache_core::CacheManager;
use tower_http::trace::TraceLayer;

use crate::bootstrap::build_cache_manager;
use crate::config::AppConfig;
use crate::handlers;

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<CacheManager>,
    pub started_at: Instant,
}

impl AppState {
    pub fn new(manager: Arc<CacheManager>) -> Self {
        Self {
            manager,
            started_at: Instant::now(),
        }
    }
}

pub fn build_app(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(handlers::healthz))
        .route("/metrics", get(handlers::metrics))
        .route("/api/cache", delete(handlers::clear_all))
        .route("/api/cache/names", get(handlers::cache_names))
        .route("/api/cache/stats", get(handlers::all_stats))
        .route("/api/cache/{name}", delete(handlers::clear_cache))
        .route("/api/cache/{name}/stats", get(handlers::cache_stats))
        .route("/api/cache/{name}/stats/reset", post(handlers::reset_stats))
        .route(
            "/api/cache/{name}/stats/hard-reset",
            post(handlers::hard_reset_stats),
        )
        .route("/api/cache/{name}/keys/{key}", delete(handlers::evict_key))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub struct HCacheServer {
    addr: SocketAddr,
    app: Router,
    manager: Arc<CacheManager>,
}

pub struct ServerBuilder {
    addr: SocketAddr,
    config: AppConfig,
}

impl Default for ServerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ServerBuilder {
    pub fn new() -> Self {
        let cfg = AppConfig::default();
        Self {
            addr: cfg.addr(),
            config: cfg,
        }
    }

    pub fn with_addr(mut self, addr: SocketAddr) -> Self {
        self.addr = addr;
        self
    }

    pub fn with_config(mut self, cfg: AppConfig) -> Self {
        self.addr = cfg.addr();
        self.config = cfg;
        self
    }

    pub async fn build(self) -> anyhow::Result<HCacheServer> {
        let manager = build_cache_manager(&self.config).await?;
        let app = build_app(AppState::new(Arc::clone(&manager)));

        Ok(HCacheServer {
            addr: self.addr,
            app,
            manager,
        })
    }
}

impl HCacheServer {
    pub fn manager(&self) -> &Arc<CacheManager> {
        &self.manager
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = tokio::net::TcpListener::bind(self.addr).await?;
        tracing::info!("listening on {}", self.addr);
        axum::serve(listener, self.app)
            .with_graceful_shutdown(shutdown_signal())
            .await?;
        self.manager.shutdown();
        Ok(())
    }
}

async fn shutdown_signal() {
    // Wait for Ctrl+C
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("shutdown signal received");
}
