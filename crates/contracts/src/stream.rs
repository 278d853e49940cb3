use serde::{Deserialize, Serialize};

use crate::{ErrorCode, ExecutionResult, PipelineStatus};

/// One line of the streaming turn protocol. `Done` is always the final line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    #[serde(rename_all = "camelCase")]
    Session { session_id: String },
    #[serde(rename_all = "camelCase")]
    Status {
        value: PipelineStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    QueryPreview { sql: String, explanation: String },
    #[serde(rename_all = "camelCase")]
    ConfirmRequired {
        pipeline_id: String,
        sql: String,
        explanation: String,
        message: String,
    },
    #[serde(rename_all = "camelCase")]
    Result { data: ExecutionResult },
    #[serde(rename_all = "camelCase")]
    Error { code: ErrorCode, message: String },
    #[serde(rename_all = "camelCase")]
    Done { awaiting_approval: bool },
}

impl StreamEvent {
    pub fn status(value: PipelineStatus) -> Self {
        StreamEvent::Status {
            value,
            message: None,
        }
    }

    pub fn status_with(value: PipelineStatus, message: impl Into<String>) -> Self {
        StreamEvent::Status {
            value,
            message: Some(message.into()),
        }
    }

    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        StreamEvent::Error {
            code,
            message: message.into(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            StreamEvent::Session { .. } => "session",
            StreamEvent::Status { .. } => "status",
            StreamEvent::QueryPreview { .. } => "query_preview",
            StreamEvent::ConfirmRequired { .. } => "confirm_required",
            StreamEvent::Result { .. } => "result",
            StreamEvent::Error { .. } => "error",
            StreamEvent::Done { .. } => "done",
        }
    }

    /// Serializes to a single NDJSON line including the trailing newline.
    pub fn to_line(&self) -> String {
        let mut line = serde_json::to_string(self).unwrap_or_else(|_| {
            r#"{"type":"error","code":"INTERNAL","message":"internal error"}"#.to_string()
        });
        line.push('\n');
        line
    }
}
