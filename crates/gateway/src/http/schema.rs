use axum::Json;
use axum::extract::State;
use axum::http::HeaderMap;
use serde::Serialize;
use sqlgate_contracts::{ErrorCode, SchemaSnapshot, TableAccess};

use super::{ApiError, AppState, code_error, extract_principal};
use crate::catalog;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct SchemaResponse {
    #[serde(flatten)]
    snapshot: SchemaSnapshot,
    prompt_text: String,
}

impl From<SchemaSnapshot> for SchemaResponse {
    fn from(snapshot: SchemaSnapshot) -> Self {
        Self {
            prompt_text: catalog::prompt_text(&snapshot),
            snapshot,
        }
    }
}

async fn caller_access(state: &AppState, headers: &HeaderMap) -> Result<TableAccess, ApiError> {
    let principal = extract_principal(state, headers)?;
    state
        .pipeline
        .access()
        .resolve(&principal.roles)
        .await
        .map_err(|err| {
            tracing::error!(error = %err, "permission lookup failed");
            code_error(ErrorCode::SchemaUnavailable)
        })
}

/// The catalog as the caller is allowed to see it.
pub(super) async fn get_schema(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<SchemaResponse>, ApiError> {
    let access = caller_access(&state, &headers).await?;
    let snapshot = state
        .pipeline
        .catalog()
        .get_schema(&access)
        .await
        .map_err(|err| {
            tracing::error!(error = %err, "schema unavailable");
            code_error(ErrorCode::SchemaUnavailable)
        })?;
    Ok(Json(snapshot.into()))
}

pub(super) async fn refresh_schema(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<SchemaResponse>, ApiError> {
    let access = caller_access(&state, &headers).await?;
    let snapshot = state.pipeline.catalog().refresh().await.map_err(|err| {
        tracing::error!(error = %err, "schema refresh failed");
        code_error(ErrorCode::SchemaUnavailable)
    })?;
    tracing::info!(version = %snapshot.version, tables = snapshot.tables.len(), "schema refreshed");
    Ok(Json(snapshot.filter(&access).into()))
}
