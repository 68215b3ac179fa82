//! # hcache-server
//!
//! Administrative HTTP service for HCache: health, Prometheus metrics, cache
//! statistics, and cache eviction.

pub mod bootstrap;
pub mod config;
pub mod error;
pub mod handlers;
pub mod metrics;
pub mod observability;
pub mod server;

pub use bootstrap::build_cache_manager;
pub use config::AppConfig;
pub use error::ApiError;
pub use observability::{apply_logging_level, init_tracing, shutdown_tracing};
pub use server::{AppState, HCacheServer, ServerBuilder, build_app};
