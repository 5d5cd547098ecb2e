use axum::Json;
use axum::extract::{Extension, State};
use serde_json::{Value, json};

use crate::AppState;
use crate::error::ApiResult;
use crate::models::auth::{AuthContext, CreateKeyRequest};

/// POST /auth/token — create an API key and mint its first bearer token.
/// The plaintext key appears in this response and nowhere else.
pub async fn create_token(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    Json(request): Json<CreateKeyRequest>,
) -> ApiResult<Json<Value>> {
    let created = state.auth.create_key(
        &request.name,
        &request.scopes,
        request.rate_limit,
        request.expires_in_days,
    )?;
    let record = state
        .repo
        .metadata()
        .get_api_key(created.id)?
        .ok_or_else(|| crate::error::ApiError::internal("key vanished after create"))?;
    let token = state.auth.mint_token(&record)?;

    tracing::info!(
        "api key '{}' (id={}) created by key:{}",
        created.name,
        created.id,
        ctx.api_key_id
    );
    Ok(Json(json!({
        "api_key": created,
        "token": token,
    })))
}

/// GET /auth/keys — key metadata only, no plaintext and no hashes.
pub async fn list_keys(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    let keys = state.auth.list_keys()?;
    let total = keys.len();
    Ok(Json(json!({
        "keys": keys,
        "total_count": total,
    })))
}
