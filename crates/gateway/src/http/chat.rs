use std::convert::Infallible;

use axum::Json;
use axum::body::Body;
use axum::extract::State;
use axum::extract::rejection::JsonRejection;
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use futures::StreamExt;
use serde::Deserialize;
use sqlgate_contracts::ErrorCode;
use sqlgate_contracts::canonical::normalize_question;
use tokio_stream::wrappers::ReceiverStream;
use tracing::Instrument;

use super::{
    ApiError, AppState, code_error, correlation_headers, extract_principal, invalid_params,
    json_error, request_ids,
};
use crate::pipeline::{ConfirmRequest, ConfirmResponse, EventSink, TurnRequest};

pub(super) const NDJSON_CONTENT_TYPE: &str = "application/x-ndjson";
const MAX_QUESTION_CHARS: usize = 4_000;
const STREAM_BUFFER: usize = 32;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub(super) struct ChatRequest {
    question: String,
    #[serde(default)]
    session_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub(super) struct ConfirmBody {
    session_id: String,
    pipeline_id: String,
    approved: bool,
    #[serde(default)]
    modified_query: Option<String>,
}

/// Starts a turn and streams its events as NDJSON. The turn runs on its own
/// task; dropping the response body cancels it at the next await point.
pub(super) async fn chat(
    State(state): State<AppState>,
    headers: HeaderMap,
    req: Result<Json<ChatRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    let principal = extract_principal(&state, &headers)?;
    let Json(req) = req.map_err(|_| invalid_params("body must be JSON {question, sessionId?}"))?;

    let question = normalize_question(&req.question);
    if question.is_empty() {
        return Err(invalid_params("question must be non-empty"));
    }
    if question.chars().count() > MAX_QUESTION_CHARS {
        return Err(invalid_params(format!(
            "question must be at most {} characters",
            MAX_QUESTION_CHARS
        )));
    }
    let session_id = req
        .session_id
        .map(|id| id.trim().to_string())
        .filter(|id| !id.is_empty());

    if let Err(retry_after) = state.limiter.try_acquire(&principal.principal_id) {
        let (status, Json(mut body)) = json_error(
            StatusCode::TOO_MANY_REQUESTS,
            ErrorCode::RateLimited,
            ErrorCode::RateLimited.default_message(),
            true,
        );
        body.detail = Some(serde_json::json!({
            "retryAfterSecs": retry_after.as_secs().max(1),
        }));
        return Err((status, Json(body)));
    }

    let ids = request_ids(&headers);
    let mut response_headers = correlation_headers(&ids);
    response_headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static(NDJSON_CONTENT_TYPE),
    );

    let (sink, rx) = EventSink::channel(STREAM_BUFFER);
    let pipeline = state.pipeline.clone();
    tokio::spawn(
        async move {
            pipeline
                .run_turn(
                    principal,
                    TurnRequest {
                        question,
                        session_id,
                    },
                    ids,
                    sink,
                )
                .await
        }
        .in_current_span(),
    );

    let lines = ReceiverStream::new(rx).map(|event| Ok::<_, Infallible>(event.to_line()));
    Ok((response_headers, Body::from_stream(lines)).into_response())
}

pub(super) async fn confirm(
    State(state): State<AppState>,
    headers: HeaderMap,
    req: Result<Json<ConfirmBody>, JsonRejection>,
) -> Result<(HeaderMap, Json<ConfirmResponse>), ApiError> {
    let principal = extract_principal(&state, &headers)?;
    let Json(req) = req.map_err(|_| {
        invalid_params("body must be JSON {sessionId, pipelineId, approved, modifiedQuery?}")
    })?;
    if req.session_id.trim().is_empty() || req.pipeline_id.trim().is_empty() {
        return Err(invalid_params("sessionId and pipelineId must be non-empty"));
    }
    if req
        .modified_query
        .as_deref()
        .is_some_and(|q| q.trim().is_empty())
    {
        return Err(invalid_params("modifiedQuery must be non-empty when present"));
    }

    let ids = request_ids(&headers);
    let response_headers = correlation_headers(&ids);
    let response = state
        .pipeline
        .resume(
            &principal,
            ConfirmRequest {
                session_id: req.session_id.trim().to_string(),
                pipeline_id: req.pipeline_id.trim().to_string(),
                approved: req.approved,
                modified_query: req.modified_query,
            },
            ids,
        )
        .await
        .map_err(code_error)?;

    Ok((response_headers, Json(response)))
}
