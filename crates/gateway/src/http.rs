use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::{MatchedPath, Request, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;
use sqlgate_auth::{Authenticator, Principal, TokenAuthenticator};
use sqlgate_contracts::{ErrorBody, ErrorCode};
use sqlgate_ledger::PgSessionStore;
use sqlgate_model::build_models;
use sqlx::postgres::PgPoolOptions;
use ulid::Ulid;

use crate::catalog::{PgSchemaLoader, SchemaCatalog};
use crate::config::{GatewayConfig, StartupError};
use crate::executor::PgExecutor;
use crate::permissions::{AccessResolver, PgPermissionSource};
use crate::pipeline::{Pipeline, PipelineDeps, PipelineSettings, RequestIds};
use crate::rate_limit::TurnLimiter;
use crate::sessions::SessionManager;

mod chat;
mod schema;
mod sessions;

pub const REQUEST_ID_HEADER: &str = "x-sqlgate-request-id";
pub const TRACE_ID_HEADER: &str = "x-sqlgate-trace-id";

const RATE_LIMIT_MAX_KEYS: usize = 16_384;
const DB_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const READY_CHECK_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Clone)]
pub struct AppState {
    pipeline: Pipeline,
    authenticator: Authenticator,
    limiter: TurnLimiter,
}

impl AppState {
    pub fn new(pipeline: Pipeline, authenticator: Authenticator, limiter: TurnLimiter) -> Self {
        Self {
            pipeline,
            authenticator,
            limiter,
        }
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }
}

type ApiError = (StatusCode, Json<ErrorResponse>);

/// Connects every backing service named by `config` and returns the state the
/// router runs on. Starts the idle-session sweeper.
pub async fn build_state(config: &GatewayConfig) -> Result<AppState, StartupError> {
    let authenticator = match config.auth_mode {
        sqlgate_auth::AuthMode::Local => Authenticator::Local,
        sqlgate_auth::AuthMode::Token => {
            let secret = config.auth_token_secret.as_deref().ok_or_else(|| StartupError {
                code: "ERR_MISSING_CONFIG",
                message: "SQLGATE_AUTH_TOKEN_SECRET is required for token auth".to_string(),
            })?;
            Authenticator::Token(TokenAuthenticator::new(secret, 30).map_err(|err| StartupError {
                code: "ERR_INVALID_CONFIG",
                message: err.message,
            })?)
        }
    };

    let store = PgSessionStore::connect_and_migrate(
        &config.store_db_url,
        config.db_pool_max,
        config.store_write_timeout(),
    )
    .await
    .map_err(|err| StartupError {
        code: "ERR_STORE_UNAVAILABLE",
        message: format!("failed to initialize session store: {}", err),
    })?;

    let pool = tokio::time::timeout(
        DB_CONNECT_TIMEOUT,
        PgPoolOptions::new()
            .min_connections(config.db_pool_min)
            .max_connections(config.db_pool_max)
            .connect(&config.db_url),
    )
    .await
    .map_err(|_| StartupError {
        code: "ERR_DB_UNAVAILABLE",
        message: "timed out connecting to the target database".to_string(),
    })?
    .map_err(|_| StartupError {
        code: "ERR_DB_UNAVAILABLE",
        message: "failed to initialize target database pool".to_string(),
    })?;

    let models = build_models(&config.model).map_err(|err| StartupError {
        code: "ERR_MODEL_UNAVAILABLE",
        message: format!("failed to initialize model provider: {}", err),
    })?;

    let lookup_timeout = config.query_timeout();
    let sessions = SessionManager::new(
        Arc::new(store),
        config.session_idle_timeout(),
        config.max_history,
    );
    let catalog = Arc::new(SchemaCatalog::new(
        Arc::new(PgSchemaLoader::new(
            pool.clone(),
            config.schema_name.clone(),
            lookup_timeout,
        )),
        config.schema_cache_ttl(),
    ));
    let access = AccessResolver::new(
        Arc::new(PgPermissionSource::new(pool.clone(), lookup_timeout)),
        config.admin_role.clone(),
    );

    sessions.spawn_sweeper(Duration::from_secs(config.session_sweep_interval_secs));

    let pipeline = Pipeline::new(
        PipelineSettings::from_config(config),
        PipelineDeps {
            sessions,
            catalog,
            access,
            models,
            executor: Arc::new(PgExecutor::new(pool, config.schema_name.clone())),
        },
    );

    let limiter = if config.rate_limit_turns_per_window == 0 {
        TurnLimiter::disabled()
    } else {
        TurnLimiter::new(
            Duration::from_secs(config.rate_limit_window_secs.max(1)),
            config.rate_limit_turns_per_window,
            RATE_LIMIT_MAX_KEYS,
        )
    };

    Ok(AppState::new(pipeline, authenticator, limiter))
}

pub async fn router(config: GatewayConfig) -> Result<Router, StartupError> {
    Ok(app(build_state(&config).await?))
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics))
        .route("/v1/chat", post(chat::chat))
        .route("/v1/chat/confirm", post(chat::confirm))
        .route("/v1/schema", get(schema::get_schema))
        .route("/v1/schema/refresh", post(schema::refresh_schema))
        .route("/v1/sessions", post(sessions::create_session))
        .route(
            "/v1/sessions/{session_id}",
            get(sessions::get_session).delete(sessions::terminate_session),
        )
        .route("/v1/sessions/{session_id}/reset", post(sessions::reset_session))
        .layer(middleware::from_fn(track_http))
        .with_state(state)
}

async fn track_http(request: Request, next: Next) -> Response {
    let started = Instant::now();
    let route = request
        .extensions()
        .get::<MatchedPath>()
        .map(|path| path.as_str().to_string())
        .unwrap_or_else(|| "unmatched".to_string());
    let method = request.method().as_str().to_string();

    let response = next.run(request).await;
    crate::metrics::observe_http_request(
        &route,
        &method,
        response.status().as_u16(),
        started.elapsed(),
    );
    response
}

async fn healthz() -> &'static str {
    "ok"
}

#[derive(Debug, Serialize)]
struct ReadyzResponse {
    status: &'static str,
    checks: BTreeMap<&'static str, bool>,
}

async fn readyz(State(state): State<AppState>) -> impl IntoResponse {
    let mut checks = BTreeMap::new();

    let store_ready = tokio::time::timeout(
        READY_CHECK_TIMEOUT,
        state.pipeline.sessions().store().ping(),
    )
    .await
    .is_ok_and(|res| res.is_ok());
    checks.insert("store", store_ready);

    let database_ready = tokio::time::timeout(READY_CHECK_TIMEOUT, state.pipeline.executor().ping())
        .await
        .unwrap_or(false);
    checks.insert("database", database_ready);

    let all_ready = checks.values().all(|ok| *ok);
    let status = if all_ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status,
        Json(ReadyzResponse {
            status: if all_ready { "ready" } else { "not_ready" },
            checks,
        }),
    )
}

async fn metrics() -> impl IntoResponse {
    match crate::metrics::render() {
        Ok((body, content_type)) => {
            let mut headers = HeaderMap::new();
            if let Ok(value) = HeaderValue::from_str(content_type.as_str()) {
                headers.insert(header::CONTENT_TYPE, value);
            }
            (headers, body).into_response()
        }
        Err(_) => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
    }
}

fn extract_principal(state: &AppState, headers: &HeaderMap) -> Result<Principal, ApiError> {
    state.authenticator.authenticate(headers).map_err(|err| {
        let code = match err.code {
            "AUTH_REQUIRED" => ErrorCode::AuthRequired,
            _ => ErrorCode::AuthInvalid,
        };
        json_error(StatusCode::UNAUTHORIZED, code, err.message, false)
    })
}

fn request_ids(headers: &HeaderMap) -> RequestIds {
    RequestIds {
        request_id: extract_request_id(headers),
        trace_id: extract_trace_id(headers),
    }
}

fn extract_request_id(headers: &HeaderMap) -> String {
    headers
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim())
        .filter(|v| !v.is_empty())
        .and_then(sanitize_request_id)
        .unwrap_or_else(|| Ulid::new().to_string())
}

fn extract_trace_id(headers: &HeaderMap) -> String {
    headers
        .get(TRACE_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim())
        .filter(|v| !v.is_empty())
        .and_then(|v| v.parse::<Ulid>().ok())
        .map(|u| u.to_string())
        .unwrap_or_else(|| Ulid::new().to_string())
}

fn sanitize_request_id(raw: &str) -> Option<String> {
    const MAX_LEN: usize = 64;
    let mut out = String::with_capacity(raw.len().min(MAX_LEN));

    for ch in raw.chars() {
        if out.len() >= MAX_LEN {
            break;
        }
        if ch.is_ascii_alphanumeric() || matches!(ch, '-' | '_' | '.') {
            out.push(ch);
        }
    }

    (!out.is_empty()).then_some(out)
}

fn correlation_headers(ids: &RequestIds) -> HeaderMap {
    let mut headers = HeaderMap::new();
    if let Ok(value) = HeaderValue::from_str(&ids.request_id) {
        headers.insert(REQUEST_ID_HEADER, value);
    }
    if let Ok(value) = HeaderValue::from_str(&ids.trace_id) {
        headers.insert(TRACE_ID_HEADER, value);
    }
    headers
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    code: ErrorCode,
    message: String,
    retryable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    detail: Option<serde_json::Value>,
}

fn json_error(
    status: StatusCode,
    code: ErrorCode,
    message: impl Into<String>,
    retryable: bool,
) -> ApiError {
    (
        status,
        Json(ErrorResponse {
            code,
            message: message.into(),
            retryable,
            detail: None,
        }),
    )
}

fn invalid_params(message: impl Into<String>) -> ApiError {
    json_error(StatusCode::BAD_REQUEST, ErrorCode::InvalidParams, message, false)
}

/// Maps a caller-facing code to its HTTP error response.
fn code_error(code: ErrorCode) -> ApiError {
    let body = ErrorBody::from_code(code);
    let (status, retryable) = match code {
        ErrorCode::SessionNotFound | ErrorCode::PipelineNotFound => (StatusCode::NOT_FOUND, false),
        ErrorCode::SessionExpired => (StatusCode::GONE, false),
        ErrorCode::PipelineInProgress => (StatusCode::CONFLICT, true),
        ErrorCode::InvalidParams => (StatusCode::BAD_REQUEST, false),
        ErrorCode::AuthRequired | ErrorCode::AuthInvalid => (StatusCode::UNAUTHORIZED, false),
        ErrorCode::PermissionDenied => (StatusCode::FORBIDDEN, false),
        ErrorCode::RateLimited => (StatusCode::TOO_MANY_REQUESTS, true),
        ErrorCode::StoreUnavailable | ErrorCode::SchemaUnavailable => {
            (StatusCode::SERVICE_UNAVAILABLE, true)
        }
        _ => (StatusCode::INTERNAL_SERVER_ERROR, false),
    };
    json_error(status, body.code, body.message, retryable)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_ids_are_sanitized() {
        assert_eq!(
            sanitize_request_id("req 42/<script>").as_deref(),
            Some("req42script")
        );
        assert_eq!(sanitize_request_id("   "), None);
        assert_eq!(sanitize_request_id(&"a".repeat(100)).map(|s| s.len()), Some(64));
    }

    #[test]
    fn trace_ids_must_be_ulids() {
        let trace = Ulid::new().to_string();
        let mut headers = HeaderMap::new();
        headers.insert(TRACE_ID_HEADER, HeaderValue::from_str(&trace).unwrap());
        assert_eq!(extract_trace_id(&headers), trace);

        headers.insert(TRACE_ID_HEADER, HeaderValue::from_static("not-a-ulid"));
        let fresh = extract_trace_id(&headers);
        assert_ne!(fresh, "not-a-ulid");
        assert!(fresh.parse::<Ulid>().is_ok());
    }

    #[test]
    fn codes_map_to_statuses() {
        assert_eq!(code_error(ErrorCode::SessionNotFound).0, StatusCode::NOT_FOUND);
        assert_eq!(code_error(ErrorCode::PipelineNotFound).0, StatusCode::NOT_FOUND);
        assert_eq!(code_error(ErrorCode::SessionExpired).0, StatusCode::GONE);
        assert_eq!(code_error(ErrorCode::PipelineInProgress).0, StatusCode::CONFLICT);
        let (status, Json(body)) = code_error(ErrorCode::StoreUnavailable);
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert!(body.retryable);
        assert_eq!(code_error(ErrorCode::Internal).0, StatusCode::INTERNAL_SERVER_ERROR);
    }
}
