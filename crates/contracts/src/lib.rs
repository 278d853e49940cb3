use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

pub mod canonical;
pub mod schema;
pub mod session;
pub mod stream;

pub use schema::{ColumnInfo, ForeignKeyRef, SchemaSnapshot, TableAccess, TableInfo};
pub use session::{HistoryMessage, MessageRole, Session, SessionStatus};
pub use stream::StreamEvent;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    PermissionDenied,
    DangerousQuery,
    UnknownReference,
    SemanticRejection,
    AmbiguousQuestion,
    GenerationFailed,
    SessionExpired,
    ExecutionTimeout,
    ExecutionConnectionLost,
    ExecutionError,
    SchemaUnavailable,
    SessionNotFound,
    PipelineNotFound,
    PipelineInProgress,
    InvalidParams,
    AuthRequired,
    AuthInvalid,
    RateLimited,
    StoreUnavailable,
    Internal,
}

impl ErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::PermissionDenied => "PERMISSION_DENIED",
            ErrorCode::DangerousQuery => "DANGEROUS_QUERY",
            ErrorCode::UnknownReference => "UNKNOWN_REFERENCE",
            ErrorCode::SemanticRejection => "SEMANTIC_REJECTION",
            ErrorCode::AmbiguousQuestion => "AMBIGUOUS_QUESTION",
            ErrorCode::GenerationFailed => "GENERATION_FAILED",
            ErrorCode::SessionExpired => "SESSION_EXPIRED",
            ErrorCode::ExecutionTimeout => "EXECUTION_TIMEOUT",
            ErrorCode::ExecutionConnectionLost => "EXECUTION_CONNECTION_LOST",
            ErrorCode::ExecutionError => "EXECUTION_ERROR",
            ErrorCode::SchemaUnavailable => "SCHEMA_UNAVAILABLE",
            ErrorCode::SessionNotFound => "SESSION_NOT_FOUND",
            ErrorCode::PipelineNotFound => "PIPELINE_NOT_FOUND",
            ErrorCode::PipelineInProgress => "PIPELINE_IN_PROGRESS",
            ErrorCode::InvalidParams => "INVALID_PARAMS",
            ErrorCode::AuthRequired => "AUTH_REQUIRED",
            ErrorCode::AuthInvalid => "AUTH_INVALID",
            ErrorCode::RateLimited => "RATE_LIMITED",
            ErrorCode::StoreUnavailable => "STORE_UNAVAILABLE",
            ErrorCode::Internal => "INTERNAL",
        }
    }

    /// System failures are incidents and get logged with full context; the rest
    /// are expected outcomes of a conversation.
    pub fn is_system_failure(self) -> bool {
        matches!(
            self,
            ErrorCode::SchemaUnavailable
                | ErrorCode::ExecutionError
                | ErrorCode::ExecutionConnectionLost
                | ErrorCode::StoreUnavailable
                | ErrorCode::Internal
        )
    }

    pub fn default_message(self) -> &'static str {
        match self {
            ErrorCode::PermissionDenied => {
                "you do not have permission to access the data this question needs"
            }
            ErrorCode::DangerousQuery => "the generated query contains a data-modifying statement",
            ErrorCode::UnknownReference => {
                "the generated query references a table or column that does not exist"
            }
            ErrorCode::SemanticRejection => "the generated query was judged unsafe to run",
            ErrorCode::AmbiguousQuestion => {
                "the question refers to earlier context that is not available; please restate it"
            }
            ErrorCode::GenerationFailed => {
                "a safe query could not be generated for this question; please rephrase it"
            }
            ErrorCode::SessionExpired => "the session has expired; start a new conversation",
            ErrorCode::ExecutionTimeout => {
                "the query took too long to run; try narrowing the question"
            }
            ErrorCode::ExecutionConnectionLost => {
                "the database connection was lost while running the query"
            }
            ErrorCode::ExecutionError => "the database could not run the query",
            ErrorCode::SchemaUnavailable => "database schema information is unavailable",
            ErrorCode::SessionNotFound => "session not found",
            ErrorCode::PipelineNotFound => "no pending query with this id",
            ErrorCode::PipelineInProgress => "this query is already being executed",
            ErrorCode::InvalidParams => "invalid request",
            ErrorCode::AuthRequired => "authentication required",
            ErrorCode::AuthInvalid => "invalid credentials",
            ErrorCode::RateLimited => "too many requests",
            ErrorCode::StoreUnavailable => "session storage is unavailable",
            ErrorCode::Internal => "internal error",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: ErrorCode,
    pub message: String,
}

impl ErrorBody {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn from_code(code: ErrorCode) -> Self {
        Self::new(code, code.default_message())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStatus {
    Generating,
    Validating,
    AwaitingApproval,
    Executing,
    Completed,
    Failed,
    Cancelled,
}

impl PipelineStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            PipelineStatus::Generating => "generating",
            PipelineStatus::Validating => "validating",
            PipelineStatus::AwaitingApproval => "awaiting_approval",
            PipelineStatus::Executing => "executing",
            PipelineStatus::Completed => "completed",
            PipelineStatus::Failed => "failed",
            PipelineStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            PipelineStatus::Completed | PipelineStatus::Failed | PipelineStatus::Cancelled
        )
    }

    fn may_move_to(self, next: PipelineStatus) -> bool {
        use PipelineStatus::*;
        match self {
            Generating => matches!(next, Validating | Failed | Cancelled),
            Validating => matches!(next, Generating | AwaitingApproval | Failed | Cancelled),
            AwaitingApproval => matches!(next, Executing | Cancelled),
            Executing => matches!(next, Completed | Failed),
            Completed | Failed | Cancelled => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateKind {
    Keyword,
    Structural,
    Semantic,
}

impl GateKind {
    pub fn as_str(self) -> &'static str {
        match self {
            GateKind::Keyword => "keyword",
            GateKind::Structural => "structural",
            GateKind::Semantic => "semantic",
        }
    }

    pub fn rejection_code(self) -> ErrorCode {
        match self {
            GateKind::Keyword => ErrorCode::DangerousQuery,
            GateKind::Structural => ErrorCode::UnknownReference,
            GateKind::Semantic => ErrorCode::SemanticRejection,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GateFailure {
    pub gate: GateKind,
    pub reason: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvalidTransition {
    pub from: PipelineStatus,
    pub to: PipelineStatus,
}

impl std::fmt::Display for InvalidTransition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "pipeline cannot move from {} to {}",
            self.from.as_str(),
            self.to.as_str()
        )
    }
}

impl std::error::Error for InvalidTransition {}

/// What the generator loop does after a gate rejected the candidate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    Retry { hint: String },
    Exhausted,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineRun {
    pub id: String,
    pub session_id: String,
    pub question: String,
    pub status: PipelineStatus,
    pub attempt: u32,
    pub max_attempts: u32,
    #[serde(default)]
    pub candidate_query: Option<String>,
    #[serde(default)]
    pub explanation: Option<String>,
    #[serde(default)]
    pub referenced_tables: Vec<String>,
    #[serde(default)]
    pub gate_failures: Vec<GateFailure>,
    #[serde(default)]
    pub schema_version: Option<String>,
    pub created_at_ms: i64,
}

impl PipelineRun {
    pub fn new(
        id: impl Into<String>,
        session_id: impl Into<String>,
        question: impl Into<String>,
        max_attempts: u32,
    ) -> Self {
        Self {
            id: id.into(),
            session_id: session_id.into(),
            question: question.into(),
            status: PipelineStatus::Generating,
            attempt: 1,
            max_attempts: max_attempts.max(1),
            candidate_query: None,
            explanation: None,
            referenced_tables: Vec::new(),
            gate_failures: Vec::new(),
            schema_version: None,
            created_at_ms: unix_epoch_ms_now(),
        }
    }

    pub fn transition(&mut self, next: PipelineStatus) -> Result<(), InvalidTransition> {
        if !self.status.may_move_to(next) {
            return Err(InvalidTransition {
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        Ok(())
    }

    /// Records a gate rejection of the current candidate and advances the bounded
    /// attempt counter. `attempt` never passes `max_attempts`: the rejection on the
    /// last attempt moves the run to `failed` instead.
    pub fn record_gate_failure(
        &mut self,
        gate: GateKind,
        reason: impl Into<String>,
    ) -> Result<RetryDecision, InvalidTransition> {
        let reason = reason.into();
        self.gate_failures.push(GateFailure {
            gate,
            reason: reason.clone(),
        });

        if self.attempt < self.max_attempts {
            self.transition(PipelineStatus::Generating)?;
            self.attempt += 1;
            self.candidate_query = None;
            self.explanation = None;
            self.referenced_tables.clear();
            Ok(RetryDecision::Retry {
                hint: format!("{} gate rejected the previous query: {}", gate.as_str(), reason),
            })
        } else {
            self.transition(PipelineStatus::Failed)?;
            Ok(RetryDecision::Exhausted)
        }
    }

    pub fn last_gate_failure(&self) -> Option<&GateFailure> {
        self.gate_failures.last()
    }

    pub fn await_approval(
        &mut self,
        sql: String,
        explanation: String,
        referenced_tables: Vec<String>,
    ) -> Result<(), InvalidTransition> {
        self.transition(PipelineStatus::AwaitingApproval)?;
        self.candidate_query = Some(sql);
        self.explanation = Some(explanation);
        self.referenced_tables = referenced_tables;
        Ok(())
    }
}

/// Terminal record of a run, kept on the session so a replayed resume call can
/// be answered without executing again.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineOutcome {
    pub pipeline_id: String,
    pub status: PipelineStatus,
    pub attempt: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<ExecutionResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
    pub finished_at_ms: i64,
}

impl PipelineOutcome {
    pub fn from_run(
        run: &PipelineRun,
        result: Option<ExecutionResult>,
        error: Option<ErrorBody>,
    ) -> Self {
        Self {
            pipeline_id: run.id.clone(),
            status: run.status,
            attempt: run.attempt,
            result,
            error,
            finished_at_ms: unix_epoch_ms_now(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultColumn {
    pub name: String,
    pub data_type: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionResult {
    pub rows: Vec<serde_json::Map<String, serde_json::Value>>,
    pub total_row_count: u64,
    pub returned_row_count: u64,
    pub columns: Vec<ResultColumn>,
    pub is_truncated: bool,
    pub execution_time_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
}

impl ExecutionResult {
    /// Builds a result from up to `max_rows + 1` fetched rows. The extra row only
    /// signals that more data exists and is dropped.
    pub fn from_fetched(
        mut rows: Vec<serde_json::Map<String, serde_json::Value>>,
        columns: Vec<ResultColumn>,
        max_rows: usize,
        total_row_count: Option<u64>,
        elapsed: Duration,
    ) -> Self {
        let fetched = rows.len();
        let is_truncated = fetched > max_rows;
        if is_truncated {
            rows.truncate(max_rows);
        }
        let returned_row_count = rows.len() as u64;
        let total_row_count = total_row_count
            .unwrap_or(fetched as u64)
            .max(fetched as u64);

        Self {
            rows,
            total_row_count,
            returned_row_count,
            columns,
            is_truncated,
            execution_time_ms: elapsed.as_millis().min(u64::MAX as u128) as u64,
            error: None,
        }
    }
}

pub fn unix_epoch_ms_now() -> i64 {
    let duration = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO);
    duration.as_millis().min(i64::MAX as u128) as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(n: i64) -> serde_json::Map<String, serde_json::Value> {
        let mut map = serde_json::Map::new();
        map.insert("n".to_string(), serde_json::json!(n));
        map
    }

    #[test]
    fn attempt_never_exceeds_max_attempts() {
        let mut run = PipelineRun::new("p1", "s1", "orders last week", 3);

        for expected_attempt in 2..=3 {
            run.transition(PipelineStatus::Validating).unwrap();
            let decision = run
                .record_gate_failure(GateKind::Keyword, "contains DELETE")
                .unwrap();
            assert!(matches!(decision, RetryDecision::Retry { .. }));
            assert_eq!(run.attempt, expected_attempt);
            assert_eq!(run.status, PipelineStatus::Generating);
        }

        run.transition(PipelineStatus::Validating).unwrap();
        let decision = run
            .record_gate_failure(GateKind::Semantic, "unsafe")
            .unwrap();
        assert_eq!(decision, RetryDecision::Exhausted);
        assert_eq!(run.attempt, 3);
        assert_eq!(run.status, PipelineStatus::Failed);
        assert_eq!(run.gate_failures.len(), 3);
    }

    #[test]
    fn retry_hint_carries_the_rejection_reason() {
        let mut run = PipelineRun::new("p1", "s1", "q", 3);
        run.transition(PipelineStatus::Validating).unwrap();
        let RetryDecision::Retry { hint } = run
            .record_gate_failure(GateKind::Structural, "unknown table 'ordrs'")
            .unwrap()
        else {
            panic!("expected a retry");
        };
        assert!(hint.contains("unknown table 'ordrs'"));
        assert!(hint.starts_with("structural"));
    }

    #[test]
    fn executing_requires_awaiting_approval_first() {
        let mut run = PipelineRun::new("p1", "s1", "q", 3);
        let err = run.transition(PipelineStatus::Executing).unwrap_err();
        assert_eq!(err.from, PipelineStatus::Generating);

        run.transition(PipelineStatus::Validating).unwrap();
        assert!(run.transition(PipelineStatus::Executing).is_err());

        run.await_approval("SELECT 1".to_string(), "one".to_string(), Vec::new())
            .unwrap();
        run.transition(PipelineStatus::Executing).unwrap();
        run.transition(PipelineStatus::Completed).unwrap();
        assert!(run.transition(PipelineStatus::Cancelled).is_err());
    }

    #[test]
    fn single_attempt_budget_fails_on_first_rejection() {
        let mut run = PipelineRun::new("p1", "s1", "q", 0);
        assert_eq!(run.max_attempts, 1);
        run.transition(PipelineStatus::Validating).unwrap();
        assert_eq!(
            run.record_gate_failure(GateKind::Keyword, "DROP").unwrap(),
            RetryDecision::Exhausted
        );
    }

    #[test]
    fn truncation_keeps_exactly_max_rows() {
        let rows = (0..6).map(row).collect::<Vec<_>>();
        let result = ExecutionResult::from_fetched(rows, Vec::new(), 5, Some(42), Duration::ZERO);
        assert!(result.is_truncated);
        assert_eq!(result.rows.len(), 5);
        assert_eq!(result.returned_row_count, 5);
        assert_eq!(result.total_row_count, 42);
    }

    #[test]
    fn small_results_are_not_truncated() {
        let rows = (0..5).map(row).collect::<Vec<_>>();
        let result = ExecutionResult::from_fetched(rows, Vec::new(), 10, None, Duration::ZERO);
        assert!(!result.is_truncated);
        assert_eq!(result.total_row_count, 5);
        assert_eq!(result.returned_row_count, 5);
    }

    #[test]
    fn execution_result_serializes_camel_case() {
        let result = ExecutionResult::from_fetched(Vec::new(), Vec::new(), 1, None, Duration::ZERO);
        let value = serde_json::to_value(&result).unwrap();
        assert!(value.get("isTruncated").is_some());
        assert!(value.get("totalRowCount").is_some());
        assert!(value.get("error").is_none());
    }

    #[test]
    fn error_codes_serialize_screaming_snake() {
        let body = ErrorBody::from_code(ErrorCode::ExecutionTimeout);
        let value = serde_json::to_value(&body).unwrap();
        assert_eq!(value["code"], "EXECUTION_TIMEOUT");
        assert!(ErrorCode::SchemaUnavailable.is_system_failure());
        assert!(!ErrorCode::DangerousQuery.is_system_failure());
    }
}
