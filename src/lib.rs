pub mod analysis;
pub mod analytics_db;
pub mod auth;
pub mod config;
pub mod error;
pub mod handlers;
pub mod istat_client;
pub mod metadata_db;
pub mod middleware;
pub mod models;
pub mod odata;
pub mod query_builder;
pub mod query_cache;
pub mod rate_limiter;
pub mod repository;
pub mod sdmx;

use std::sync::Arc;

use analysis::AnalysisService;
use auth::AuthService;
use config::AppConfig;
use istat_client::IstatClient;
use rate_limiter::RateLimiter;
use repository::UnifiedRepository;

#[derive(Clone)]
pub struct AppState {
    pub repo: Arc<UnifiedRepository>,
    pub auth: Arc<AuthService>,
    pub rate_limiter: Arc<RateLimiter>,
    pub istat: Arc<IstatClient>,
    pub analysis: Arc<AnalysisService>,
    pub config: Arc<AppConfig>,
}
