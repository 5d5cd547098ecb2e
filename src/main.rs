use axum::http::HeaderValue;
use axum::http::header::CONTENT_TYPE;
use axum::{
    Router,
    routing::{get, post},
};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::compression::CompressionLayer;
use tower_http::cors::{Any, CorsLayer};
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use osservatorio_api::analysis::AnalysisService;
use osservatorio_api::analytics_db::AnalyticsDb;
use osservatorio_api::auth::AuthService;
use osservatorio_api::config::AppConfig;
use osservatorio_api::error::ApiError;
use osservatorio_api::istat_client::IstatClient;
use osservatorio_api::metadata_db::MetadataDb;
use osservatorio_api::models::auth::Scope;
use osservatorio_api::query_cache::QueryCache;
use osservatorio_api::rate_limiter::RateLimiter;
use osservatorio_api::repository::UnifiedRepository;
use osservatorio_api::{AppState, handlers, middleware};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new("osservatorio_api=debug,tower_http=debug")
        }))
        .init();

    let config_path =
        std::env::var("OSV_CONFIG").unwrap_or_else(|_| "./osservatorio.toml".to_string());
    let mut config = AppConfig::load(&config_path)?;
    if let Ok(secret) = std::env::var("JWT_SECRET_KEY") {
        config.auth.jwt_secret_key = Some(secret);
    }
    let config = Arc::new(config);

    let metadata_db_path =
        std::env::var("OSV_METADATA_DB").unwrap_or_else(|_| "./osservatorio.db".to_string());
    let metadata = Arc::new(MetadataDb::open(&metadata_db_path)?);
    tracing::info!("metadata db opened at {metadata_db_path}");

    let clickhouse_url =
        std::env::var("CLICKHOUSE_URL").unwrap_or_else(|_| "http://localhost:8123".to_string());
    let clickhouse_db = std::env::var("CLICKHOUSE_DATABASE").unwrap_or_else(|_| "istat".to_string());
    let clickhouse_user = std::env::var("CLICKHOUSE_USER").unwrap_or_else(|_| "default".to_string());
    let clickhouse_password = std::env::var("CLICKHOUSE_PASSWORD").unwrap_or_default();
    let analytics = AnalyticsDb::new(
        &clickhouse_url,
        &clickhouse_db,
        &clickhouse_user,
        &clickhouse_password,
    );
    // lazy connection: tolerate a cold analytics store at boot
    if let Err(e) = analytics.ensure_schema().await {
        tracing::warn!("analytics schema not ready yet (will retry on first write): {e}");
    }

    let cache = Arc::new(QueryCache::new(
        config.cache.cache_default_ttl_seconds,
        config.cache.cache_max_size,
    ));
    let repo = Arc::new(UnifiedRepository::new(metadata.clone(), analytics, cache));

    let auth = Arc::new(AuthService::new(
        metadata.clone(),
        config.auth.jwt_secret_key.clone(),
        config.auth.jwt_access_token_expire_minutes,
        config.auth.rate_limit_default,
    ));
    bootstrap_admin_key(&auth);

    let rate_limiter = Arc::new(RateLimiter::new(metadata.clone()));
    let istat = Arc::new(IstatClient::new(&config.istat, config.analysis.max_xml_size_bytes)?);
    let analysis = Arc::new(AnalysisService::new(
        metadata.clone(),
        &config.istat.upstream_base_url,
        config.analysis.clone(),
    )?);

    let state = AppState {
        repo: repo.clone(),
        auth,
        rate_limiter,
        istat,
        analysis,
        config: config.clone(),
    };

    // periodic maintenance: cache sweep, expired windows and revocations
    {
        let repo = repo.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(std::time::Duration::from_secs(300));
            loop {
                interval.tick().await;
                repo.run_maintenance();
            }
        });
    }

    let protected = Router::new()
        // Datasets
        .route("/datasets", get(handlers::datasets::list_datasets))
        .route("/datasets/{id}", get(handlers::datasets::get_dataset))
        .route("/datasets/{id}/timeseries", get(handlers::datasets::get_timeseries))
        // Auth administration
        .route("/auth/token", post(handlers::auth_keys::create_token))
        .route("/auth/keys", get(handlers::auth_keys::list_keys))
        // Usage analytics
        .route("/analytics/usage", get(handlers::usage::usage_analytics))
        // OData v4 surface
        .route("/odata", get(handlers::odata::service_document))
        .route("/odata/", get(handlers::odata::service_document))
        .route("/odata/$metadata", get(handlers::odata::metadata_document))
        .route("/odata/Datasets", get(handlers::odata::datasets))
        .route("/odata/Observations", get(handlers::odata::observation_set))
        .route("/odata/Territories", get(handlers::odata::territories))
        .route("/odata/Measures", get(handlers::odata::measures))
        // Dataflow analysis
        .route("/api/analysis/dataflow", post(handlers::analysis::analyze_dataflow))
        .route(
            "/api/analysis/dataflow/upload",
            post(handlers::analysis::upload_and_analyze),
        )
        .route("/api/analysis/dataflow/bulk", post(handlers::analysis::bulk_analyze))
        .route(
            "/api/analysis/rules",
            get(handlers::analysis::list_rules).post(handlers::analysis::create_rule),
        )
        .route(
            "/api/analysis/rules/{rule_id}",
            axum::routing::put(handlers::analysis::update_rule)
                .delete(handlers::analysis::delete_rule),
        )
        // Ingestion client
        .route("/api/istat/status", get(handlers::istat::status))
        .route("/api/istat/dataflows", get(handlers::istat::dataflows))
        .route("/api/istat/dataset/{id}", get(handlers::istat::dataset))
        .route("/api/istat/sync/{id}", post(handlers::istat::sync))
        // inner → outer: audit, rate limit, authentication
        .layer(axum::middleware::from_fn_with_state(state.clone(), middleware::audit_request))
        .layer(axum::middleware::from_fn_with_state(state.clone(), middleware::rate_limit))
        .layer(axum::middleware::from_fn_with_state(state.clone(), middleware::authenticate));

    let app = Router::new()
        .route("/health", get(handlers::health::health))
        .merge(protected)
        .fallback(fallback)
        // overall request budget; upstream calls carry their own timeouts
        .layer(TimeoutLayer::new(std::time::Duration::from_secs(30)))
        .layer(axum::middleware::from_fn(middleware::process_time))
        .layer(CompressionLayer::new())
        .layer(cors_layer(&config))
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let port: u16 = std::env::var("OSV_PORT").ok().and_then(|p| p.parse().ok()).unwrap_or(8000);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    tracing::info!("osservatorio-api listening on {addr}");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

/// First boot on an empty store: issue the initial admin key and print it
/// once so the operator can mint tokens.
fn bootstrap_admin_key(auth: &AuthService) {
    if !auth.list_keys().map(|keys| keys.is_empty()).unwrap_or(false) {
        return;
    }
    match auth.create_key("bootstrap-admin", &[Scope::Admin], None, None) {
        Ok(created) => {
            tracing::warn!(
                "no API keys found; created bootstrap admin key (store it now, it will not be \
                 shown again): {}",
                created.api_key
            );
            if let Ok(record) = auth.verify_key(&created.api_key) {
                match auth.mint_token(&record) {
                    Ok(token) => tracing::warn!(
                        "initial admin bearer token (expires in {}s): {}",
                        token.expires_in,
                        token.access_token
                    ),
                    Err(e) => tracing::error!("failed to mint bootstrap token: {e}"),
                }
            }
        }
        Err(e) => tracing::error!("failed to bootstrap admin key: {e}"),
    }
}

fn cors_layer(config: &AppConfig) -> CorsLayer {
    let origins = &config.cors.cors_allowed_origins;
    if origins.iter().any(|o| o == "*") {
        CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any)
    } else {
        let parsed: Vec<HeaderValue> = origins.iter().filter_map(|o| o.parse().ok()).collect();
        CorsLayer::new()
            .allow_origin(parsed)
            .allow_methods(Any)
            .allow_headers([CONTENT_TYPE, axum::http::header::AUTHORIZATION])
    }
}

async fn fallback() -> ApiError {
    ApiError::not_found("resource not found")
}
