use axum::Json;
use axum::extract::State;
use serde_json::{Value, json};

use crate::AppState;

/// Liveness plus per-component status. Unauthenticated; store failures are
/// reported in the payload, never as an error response.
pub async fn health(State(state): State<AppState>) -> Json<Value> {
    let system = state.repo.get_system_status().await;
    let istat = state.istat.get_status();

    let metadata_ok = system["metadata"]["status"] == "ok";
    let analytics_ok = system["analytics"]["status"] == "ok";
    let status = if metadata_ok && analytics_ok { "healthy" } else { "degraded" };

    Json(json!({
        "status": status,
        "version": env!("CARGO_PKG_VERSION"),
        "components": {
            "metadata": system["metadata"],
            "analytics": system["analytics"],
            "cache": system["cache"],
            "istat_client": istat,
        },
        "timestamp": system["timestamp"],
    }))
}
