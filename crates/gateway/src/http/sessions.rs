use axum::Json;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use serde::Serialize;
use sqlgate_contracts::{
    ErrorCode, HistoryMessage, PipelineOutcome, PipelineRun, PipelineStatus, Session,
    SessionStatus,
};

use super::{ApiError, AppState, code_error, extract_principal, json_error};
use crate::sessions::SessionError;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct CreateSessionResponse {
    session_id: String,
    status: SessionStatus,
    created_at: i64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct TerminateSessionResponse {
    session_id: String,
    status: SessionStatus,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct PendingPipelineView {
    pipeline_id: String,
    status: PipelineStatus,
    question: String,
    attempt: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    sql: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    explanation: Option<String>,
}

impl From<&PipelineRun> for PendingPipelineView {
    fn from(run: &PipelineRun) -> Self {
        Self {
            pipeline_id: run.id.clone(),
            status: run.status,
            question: run.question.clone(),
            attempt: run.attempt,
            sql: run.candidate_query.clone(),
            explanation: run.explanation.clone(),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct FinishedRunView {
    pipeline_id: String,
    status: PipelineStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    error_code: Option<ErrorCode>,
    finished_at: i64,
}

impl From<&PipelineOutcome> for FinishedRunView {
    fn from(outcome: &PipelineOutcome) -> Self {
        Self {
            pipeline_id: outcome.pipeline_id.clone(),
            status: outcome.status,
            error_code: outcome.error.as_ref().map(|e| e.code),
            finished_at: outcome.finished_at_ms,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct SessionView {
    session_id: String,
    status: SessionStatus,
    roles: Vec<String>,
    created_at: i64,
    last_activity_at: i64,
    history: Vec<HistoryMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pending_pipeline: Option<PendingPipelineView>,
    finished_runs: Vec<FinishedRunView>,
}

impl From<Session> for SessionView {
    fn from(session: Session) -> Self {
        Self {
            pending_pipeline: session.pending_pipeline.as_ref().map(Into::into),
            finished_runs: session.finished_runs.iter().map(Into::into).collect(),
            session_id: session.id,
            status: session.status,
            roles: session.roles,
            created_at: session.created_at,
            last_activity_at: session.last_activity_at,
            history: session.history,
        }
    }
}

fn session_error(err: SessionError) -> ApiError {
    if let SessionError::Store(store) = &err {
        tracing::error!(error = %store, "session store unavailable");
    }
    code_error(err.code())
}

pub(super) async fn create_session(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<(StatusCode, Json<CreateSessionResponse>), ApiError> {
    let principal = extract_principal(&state, &headers)?;
    let session = state
        .pipeline
        .sessions()
        .create(&principal)
        .await
        .map_err(|err| {
            tracing::error!(error = %err, "failed to create session");
            json_error(
                StatusCode::SERVICE_UNAVAILABLE,
                ErrorCode::StoreUnavailable,
                ErrorCode::StoreUnavailable.default_message(),
                true,
            )
        })?;

    Ok((
        StatusCode::CREATED,
        Json(CreateSessionResponse {
            session_id: session.id,
            status: session.status,
            created_at: session.created_at,
        }),
    ))
}

pub(super) async fn get_session(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(session_id): Path<String>,
) -> Result<Json<SessionView>, ApiError> {
    let principal = extract_principal(&state, &headers)?;
    let session = state
        .pipeline
        .sessions()
        .get(&principal, &session_id)
        .await
        .map_err(session_error)?;
    Ok(Json(session.into()))
}

pub(super) async fn terminate_session(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(session_id): Path<String>,
) -> Result<Json<TerminateSessionResponse>, ApiError> {
    let principal = extract_principal(&state, &headers)?;
    let session = state
        .pipeline
        .sessions()
        .terminate(&principal, &session_id)
        .await
        .map_err(session_error)?;
    tracing::info!(session_id = %session.id, "session terminated");

    Ok(Json(TerminateSessionResponse {
        session_id: session.id,
        status: session.status,
    }))
}

pub(super) async fn reset_session(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(session_id): Path<String>,
) -> Result<Json<SessionView>, ApiError> {
    let principal = extract_principal(&state, &headers)?;
    let session = state
        .pipeline
        .sessions()
        .reset(&principal, &session_id)
        .await
        .map_err(session_error)?;
    Ok(Json(session.into()))
}
