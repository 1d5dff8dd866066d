//! HTTP surface over a [`RateLimiter`]: health, metrics, admin endpoints and
//! an admission middleware for application routes.

use axum::{
    extract::{MatchedPath, Path, Query, Request, State},
    http::{HeaderMap, HeaderName, HeaderValue, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Json, Response},
    routing::{delete, get, post, put},
    Router,
};
use prometheus::TextEncoder;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tracing::{error, warn};

use crate::{
    error::RateLimitError,
    limiter::{BlockStatus, Decision, RateLimitHeaders, RateLimiter, RequestContext},
    store::UsagePeriod,
};

pub const TENANT_HEADER: &str = "x-tenant-id";

#[derive(Clone)]
pub struct AppState {
    pub limiter: Arc<RateLimiter>,
}

/// Admin and observability routes
pub fn router(limiter: Arc<RateLimiter>) -> Router {
    Router::new()
        .route("/healthcheck", get(health_check))
        .route("/metrics", get(metrics_handler))
        .route("/v1/check/:tenant_id", post(check))
        .route("/v1/tenants/:tenant_id/usage", get(usage_stats))
        .route("/v1/tenants/:tenant_id/limits", put(update_limits).get(tenant_limits))
        .route("/v1/tenants/:tenant_id/limits/headers", get(limit_headers))
        .route("/v1/tenants/:tenant_id/window", delete(reset_window))
        .route(
            "/v1/tenants/:tenant_id/block",
            get(block_status).post(block).delete(unblock),
        )
        .with_state(AppState { limiter })
}

/// Put application routes behind tenant blocking and rate limiting.
///
/// The tenant comes from the `X-Tenant-Id` header and the matched route
/// template (falling back to the request path) is the endpoint. Exactly one check runs per request; its decision supplies
/// the response headers.
pub fn rate_limited(routes: Router, limiter: Arc<RateLimiter>) -> Router {
    routes.layer(middleware::from_fn_with_state(
        AppState { limiter },
        enforce_rate_limit,
    ))
}

async fn enforce_rate_limit(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let Some(tenant_id) = tenant_from_headers(request.headers()) else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "Missing or invalid X-Tenant-Id header" })),
        )
            .into_response();
    };

    // the route template, so every resource under one route shares a window
    let endpoint = request
        .extensions()
        .get::<MatchedPath>()
        .map(|matched| matched.as_str().to_string())
        .unwrap_or_else(|| request.uri().path().to_string());
    let ctx = request_context(request.headers());

    match admit(&state.limiter, tenant_id, Some(&endpoint), &ctx).await {
        Ok(Admit::Blocked(status)) => (StatusCode::FORBIDDEN, Json(status)).into_response(),
        Ok(Admit::Decided(decision)) if !decision.allowed => decision_response(decision),
        Ok(Admit::Decided(decision)) => {
            let mut response = next.run(request).await;
            apply_headers(response.headers_mut(), &decision.headers());
            response
        }
        Err(err) => err.into_response(),
    }
}

enum Admit {
    Blocked(BlockStatus),
    Decided(Decision),
}

async fn admit(
    limiter: &RateLimiter,
    tenant_id: u64,
    endpoint: Option<&str>,
    ctx: &RequestContext,
) -> Result<Admit, ApiError> {
    let status = limiter.is_blocked(tenant_id).await?;
    if status.blocked {
        warn!(tenant_id, "Rejecting request from blocked tenant");
        return Ok(Admit::Blocked(status));
    }
    Ok(Admit::Decided(limiter.check_limit(tenant_id, endpoint, ctx).await?))
}

fn decision_response(decision: Decision) -> Response {
    let code = if decision.allowed {
        StatusCode::OK
    } else {
        StatusCode::TOO_MANY_REQUESTS
    };
    let mut headers = HeaderMap::new();
    apply_headers(&mut headers, &decision.headers());
    (code, headers, Json(decision)).into_response()
}

fn apply_headers(headers: &mut HeaderMap, values: &RateLimitHeaders) {
    for (name, value) in values.to_pairs() {
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(&value),
        ) {
            headers.insert(name, value);
        }
    }
}

fn tenant_from_headers(headers: &HeaderMap) -> Option<u64> {
    headers
        .get(TENANT_HEADER)?
        .to_str()
        .ok()?
        .trim()
        .parse()
        .ok()
        .filter(|id| *id > 0)
}

fn request_context(headers: &HeaderMap) -> RequestContext {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(str::to_string)
    };

    let ip_address = header("x-forwarded-for")
        .and_then(|forwarded| forwarded.split(',').next().map(|ip| ip.trim().to_string()))
        .or_else(|| header("x-real-ip"));

    RequestContext {
        ip_address,
        user_agent: header("user-agent"),
    }
}

#[derive(Debug, Deserialize)]
struct EndpointQuery {
    endpoint: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PeriodQuery {
    period: Option<String>,
}

#[derive(Debug, Deserialize)]
struct LimitsBody {
    hourly_limit: u64,
    burst_allowance: u64,
}

#[derive(Debug, Deserialize)]
struct BlockBody {
    reason: String,
}

async fn check(
    State(state): State<AppState>,
    Path(tenant_id): Path<u64>,
    Query(query): Query<EndpointQuery>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let ctx = request_context(&headers);
    match admit(&state.limiter, tenant_id, query.endpoint.as_deref(), &ctx).await? {
        Admit::Blocked(status) => Ok((StatusCode::FORBIDDEN, Json(status)).into_response()),
        Admit::Decided(decision) => Ok(decision_response(decision)),
    }
}

async fn usage_stats(
    State(state): State<AppState>,
    Path(tenant_id): Path<u64>,
    Query(query): Query<PeriodQuery>,
) -> Result<Response, ApiError> {
    let period = query
        .period
        .as_deref()
        .map(UsagePeriod::parse)
        .unwrap_or_default();
    let stats = state.limiter.usage_stats(tenant_id, period).await?;
    Ok(Json(stats).into_response())
}

async fn tenant_limits(
    State(state): State<AppState>,
    Path(tenant_id): Path<u64>,
) -> Result<Response, ApiError> {
    let limits = state.limiter.tenant_limits(tenant_id).await?;
    Ok(Json(limits).into_response())
}

async fn update_limits(
    State(state): State<AppState>,
    Path(tenant_id): Path<u64>,
    Json(body): Json<LimitsBody>,
) -> Result<Response, ApiError> {
    let updated = state
        .limiter
        .update_limits(tenant_id, body.hourly_limit, body.burst_allowance)
        .await?;
    let code = if updated { StatusCode::OK } else { StatusCode::NOT_FOUND };
    Ok((code, Json(json!({ "updated": updated }))).into_response())
}

async fn limit_headers(
    State(state): State<AppState>,
    Path(tenant_id): Path<u64>,
    Query(query): Query<EndpointQuery>,
) -> Result<Response, ApiError> {
    let values = state
        .limiter
        .rate_limit_headers(tenant_id, query.endpoint.as_deref())
        .await?;
    let mut headers = HeaderMap::new();
    apply_headers(&mut headers, &values);
    Ok((headers, Json(values)).into_response())
}

async fn reset_window(
    State(state): State<AppState>,
    Path(tenant_id): Path<u64>,
    Query(query): Query<EndpointQuery>,
) -> Result<Response, ApiError> {
    let reset = state
        .limiter
        .reset_limit(tenant_id, query.endpoint.as_deref())
        .await?;
    Ok(Json(json!({ "reset": reset })).into_response())
}

async fn block_status(
    State(state): State<AppState>,
    Path(tenant_id): Path<u64>,
) -> Result<Response, ApiError> {
    Ok(Json(state.limiter.is_blocked(tenant_id).await?).into_response())
}

async fn block(
    State(state): State<AppState>,
    Path(tenant_id): Path<u64>,
    Json(body): Json<BlockBody>,
) -> Result<Response, ApiError> {
    let blocked = state.limiter.block_tenant(tenant_id, &body.reason).await?;
    Ok(Json(json!({ "blocked": blocked })).into_response())
}

async fn unblock(
    State(state): State<AppState>,
    Path(tenant_id): Path<u64>,
) -> Result<Response, ApiError> {
    let unblocked = state.limiter.unblock_tenant(tenant_id).await?;
    Ok(Json(json!({ "unblocked": unblocked })).into_response())
}

async fn health_check(State(state): State<AppState>) -> Result<Json<serde_json::Value>, StatusCode> {
    match state.limiter.health_check().await {
        Ok(()) => Ok(Json(json!({
            "status": "healthy",
            "timestamp": chrono::Utc::now().to_rfc3339()
        }))),
        Err(e) => {
            warn!("Health check failed: {}", e);
            Err(StatusCode::SERVICE_UNAVAILABLE)
        }
    }
}

async fn metrics_handler(State(state): State<AppState>) -> Result<String, StatusCode> {
    let encoder = TextEncoder::new();
    let metric_families = state.limiter.metrics().registry().gather();

    match encoder.encode_to_string(&metric_families) {
        Ok(metrics) => Ok(metrics),
        Err(_) => Err(StatusCode::INTERNAL_SERVER_ERROR),
    }
}

/// Maps limiter errors onto HTTP statuses
pub struct ApiError(RateLimitError);

impl From<RateLimitError> for ApiError {
    fn from(err: RateLimitError) -> Self {
        ApiError(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            RateLimitError::InvalidTenant(_) | RateLimitError::InvalidLimits(_) => {
                StatusCode::BAD_REQUEST
            }
            err if err.is_collaborator_failure() => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };

        if status.is_server_error() {
            error!("Request failed: {}", self.0);
        }

        (status, Json(json!({ "error": self.0.to_string() }))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tenant_header_parsing() {
        let mut headers = HeaderMap::new();
        assert_eq!(tenant_from_headers(&headers), None);

        headers.insert(TENANT_HEADER, HeaderValue::from_static(" 42 "));
        assert_eq!(tenant_from_headers(&headers), Some(42));

        headers.insert(TENANT_HEADER, HeaderValue::from_static("0"));
        assert_eq!(tenant_from_headers(&headers), None);

        headers.insert(TENANT_HEADER, HeaderValue::from_static("shop"));
        assert_eq!(tenant_from_headers(&headers), None);
    }

    #[test]
    fn test_request_context_from_headers() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", HeaderValue::from_static("198.51.100.7, 10.0.0.1"));
        headers.insert("x-real-ip", HeaderValue::from_static("10.0.0.1"));
        headers.insert("user-agent", HeaderValue::from_static("register/1.0"));

        let ctx = request_context(&headers);
        assert_eq!(ctx.ip_address.as_deref(), Some("198.51.100.7"));
        assert_eq!(ctx.user_agent.as_deref(), Some("register/1.0"));

        headers.remove("x-forwarded-for");
        assert_eq!(request_context(&headers).ip_address.as_deref(), Some("10.0.0.1"));
        assert_eq!(request_context(&HeaderMap::new()), RequestContext::default());
    }

    #[test]
    fn test_apply_headers() {
        let mut headers = HeaderMap::new();
        apply_headers(
            &mut headers,
            &RateLimitHeaders {
                limit: 5,
                remaining: 0,
                reset_at: 1_767_229_200,
            },
        );
        assert_eq!(headers["x-ratelimit-limit"], "5");
        assert_eq!(headers["x-ratelimit-remaining"], "0");
        assert_eq!(headers["x-ratelimit-reset"], "1767229200");
    }

    #[test]
    fn test_error_status_mapping() {
        let response = ApiError(RateLimitError::InvalidTenant(0)).into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = ApiError(RateLimitError::Cache("down".to_string())).into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

        let response = ApiError(RateLimitError::Service("bug".to_string())).into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
