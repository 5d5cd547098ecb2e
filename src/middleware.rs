use axum::extract::{MatchedPath, Request, State};
use axum::http::header;
use axum::middleware::Next;
use axum::response::Response;
use std::time::Instant;

use crate::AppState;
use crate::error::ApiError;
use crate::models::audit::AuditEvent;
use crate::models::auth::{AuthContext, Scope, split_scopes};

/// Scope required for each route template. `admin` implies everything, so
/// only the minimum scope is listed.
pub fn required_scope(method: &str, route: &str) -> Scope {
    match (method, route) {
        ("POST", "/auth/token") | ("GET", "/auth/keys") | ("GET", "/analytics/usage") => {
            Scope::Admin
        }
        ("POST", "/api/analysis/rules")
        | ("PUT", "/api/analysis/rules/{rule_id}")
        | ("DELETE", "/api/analysis/rules/{rule_id}")
        | ("POST", "/api/istat/sync/{id}") => Scope::Write,
        _ => Scope::Read,
    }
}

fn route_template(req: &Request) -> String {
    req.extensions()
        .get::<MatchedPath>()
        .map(|p| p.as_str().to_string())
        .unwrap_or_else(|| req.uri().path().to_string())
}

/// Always-on timing header (milliseconds).
pub async fn process_time(req: Request, next: Next) -> Response {
    let started = Instant::now();
    let mut response = next.run(req).await;
    let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
    if let Ok(value) = format!("{elapsed_ms:.2}").parse() {
        response.headers_mut().insert("X-Process-Time", value);
    }
    response
}

/// Bearer authentication plus scope authorization. On success an
/// `AuthContext` is attached to the request extensions.
pub async fn authenticate(
    State(state): State<AppState>,
    mut req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let token = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .ok_or_else(|| ApiError::unauthorized("missing bearer token"))?;

    let claims = state.auth.verify_token(token)?;
    let api_key_id: i64 = claims
        .sub
        .parse()
        .map_err(|_| ApiError::unauthorized("invalid or expired token"))?;

    // the key behind the token must still exist and be active
    let key = state
        .repo
        .metadata()
        .get_api_key(api_key_id)?
        .filter(|k| k.is_active)
        .ok_or_else(|| ApiError::unauthorized("invalid or expired token"))?;

    let ctx = AuthContext {
        api_key_id,
        api_key_name: claims.api_key_name.clone(),
        scopes: split_scopes(&claims.scope),
        rate_limit: key.rate_limit,
        jti: claims.jti.clone(),
    };

    let scope = required_scope(req.method().as_str(), &route_template(&req));
    if !ctx.has_scope(scope) {
        return Err(ApiError::forbidden(format!(
            "scope '{}' required for this endpoint",
            scope.as_str()
        )));
    }

    req.extensions_mut().insert(ctx);
    Ok(next.run(req).await)
}

/// Per-key sliding-window limiting; runs after authentication. Allowed
/// responses carry the rate headers, denials return 429 with the same triad.
pub async fn rate_limit(
    State(state): State<AppState>,
    req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let Some(ctx) = req.extensions().get::<AuthContext>().cloned() else {
        return Err(ApiError::unauthorized("missing bearer token"));
    };
    let endpoint = route_template(&req);
    let decision = state.rate_limiter.check(ctx.api_key_id, &endpoint, ctx.rate_limit)?;
    if !decision.allowed {
        return Err(decision.deny_error());
    }

    let mut response = next.run(req).await;
    let headers = response.headers_mut();
    if let Ok(v) = decision.limit.to_string().parse() {
        headers.insert("X-RateLimit-Limit", v);
    }
    if let Ok(v) = decision.remaining.to_string().parse() {
        headers.insert("X-RateLimit-Remaining", v);
    }
    if let Ok(v) = decision.reset_epoch.to_string().parse() {
        headers.insert("X-RateLimit-Reset", v);
    }
    Ok(response)
}

/// Request audit trail: one entry per authenticated request, with timing and
/// outcome.
pub async fn audit_request(State(state): State<AppState>, req: Request, next: Next) -> Response {
    let started = Instant::now();
    let method = req.method().to_string();
    let endpoint = route_template(&req);
    let user_id = req
        .extensions()
        .get::<AuthContext>()
        .map(|ctx| format!("key:{}", ctx.api_key_id));
    let client_ip = req
        .headers()
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.split(',').next().unwrap_or(v).trim().to_string());
    let user_agent = req
        .headers()
        .get(header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    let response = next.run(req).await;

    let status = response.status();
    let mut event = AuditEvent {
        user_id,
        action: format!("{method} {endpoint}"),
        resource_type: "http_request".to_string(),
        resource_id: Some(endpoint),
        details: None,
        success: !status.is_client_error() && !status.is_server_error(),
        error_message: (!status.is_success()).then(|| status.to_string()),
        execution_time_ms: Some(started.elapsed().as_millis() as i64),
        client_ip,
        user_agent,
    };
    if event.error_message.is_some() && event.success {
        event.error_message = None;
    }
    if let Err(err) = state.repo.metadata().insert_audit(&event) {
        tracing::warn!("failed to audit request: {err}");
    }
    response
}
