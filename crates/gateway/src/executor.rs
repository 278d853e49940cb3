use std::collections::HashSet;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use sqlgate_contracts::{ErrorBody, ErrorCode, ExecutionResult, ResultColumn};
use sqlgate_guard::statement_body;
use sqlx::{Column, Executor, PgPool, Statement, TypeInfo};
use tracing::Instrument;

/// Added to the statement timeout before the client gives up on its own.
const CLIENT_BACKSTOP: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecutionLimits {
    pub timeout: Duration,
    pub max_rows: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    Timeout,
    ConnectionLost,
    Error,
}

impl FailureKind {
    pub fn code(self) -> ErrorCode {
        match self {
            FailureKind::Timeout => ErrorCode::ExecutionTimeout,
            FailureKind::ConnectionLost => ErrorCode::ExecutionConnectionLost,
            FailureKind::Error => ErrorCode::ExecutionError,
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            FailureKind::Timeout => "timeout",
            FailureKind::ConnectionLost => "connection_lost",
            FailureKind::Error => "error",
        }
    }
}

/// `message` is internal detail for logs; callers only ever see `kind`.
#[derive(Debug, Clone)]
pub struct ExecutionFailure {
    pub kind: FailureKind,
    pub message: String,
}

impl ExecutionFailure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn error_body(&self) -> ErrorBody {
        ErrorBody::from_code(self.kind.code())
    }
}

impl std::fmt::Display for ExecutionFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind.as_str(), self.message)
    }
}

impl std::error::Error for ExecutionFailure {}

impl From<sqlx::Error> for ExecutionFailure {
    fn from(value: sqlx::Error) -> Self {
        ExecutionFailure::new(classify(&value), value.to_string())
    }
}

#[async_trait]
pub trait SqlExecutor: Send + Sync {
    async fn execute(
        &self,
        sql: &str,
        limits: ExecutionLimits,
    ) -> Result<ExecutionResult, ExecutionFailure>;

    async fn ping(&self) -> bool;
}

/// Runs `sql` inside an `executor.run` span and records the outcome metric.
pub async fn execute_traced(
    executor: &dyn SqlExecutor,
    pipeline_id: &str,
    sql: &str,
    limits: ExecutionLimits,
) -> Result<ExecutionResult, ExecutionFailure> {
    let span = tracing::info_span!(
        "executor.run",
        pipeline_id = %pipeline_id,
        max_rows = limits.max_rows as u64,
        timeout_ms = limits.timeout.as_millis() as u64,
        rows = tracing::field::Empty,
        truncated = tracing::field::Empty,
        latency_ms = tracing::field::Empty,
        outcome = tracing::field::Empty,
    );
    let started = Instant::now();

    async move {
        tracing::debug!(sql = %sql, "executing approved query");
        let result = executor.execute(sql, limits).await;
        tracing::Span::current().record("latency_ms", started.elapsed().as_millis() as u64);

        match &result {
            Ok(data) => {
                tracing::Span::current().record("rows", data.returned_row_count);
                tracing::Span::current().record("truncated", data.is_truncated);
                tracing::Span::current().record("outcome", "ok");
                crate::metrics::observe_execution("ok");
            }
            Err(failure) => {
                tracing::Span::current().record("outcome", failure.kind.as_str());
                crate::metrics::observe_execution(failure.kind.as_str());
                match failure.kind {
                    FailureKind::Timeout => {
                        tracing::warn!(error = %failure.message, "query exceeded the statement timeout")
                    }
                    FailureKind::ConnectionLost | FailureKind::Error => {
                        tracing::error!(error = %failure.message, "query execution failed")
                    }
                }
            }
        }
        result
    }
    .instrument(span)
    .await
}

/// Executes approved queries in a read-only, time-bounded transaction that is
/// always rolled back. Unqualified names resolve in `schema_name` only.
#[derive(Clone)]
pub struct PgExecutor {
    pool: PgPool,
    schema_name: String,
}

impl PgExecutor {
    pub fn new(pool: PgPool, schema_name: impl Into<String>) -> Self {
        Self {
            pool,
            schema_name: schema_name.into(),
        }
    }

    async fn run(&self, sql: &str, limits: ExecutionLimits) -> Result<ExecutionResult, ExecutionFailure> {
        let started = Instant::now();
        let body = statement_body(sql).map_err(|err| {
            ExecutionFailure::new(FailureKind::Error, format!("statement could not be tokenized: {}", err))
        })?;
        let timeout_str = format!("{}ms", limits.timeout.as_millis().max(1));

        let mut tx = self.pool.begin().await?;
        sqlx::query("SET TRANSACTION READ ONLY")
            .execute(&mut *tx)
            .await?;
        sqlx::query("SELECT set_config('statement_timeout', $1, true)")
            .bind(&timeout_str)
            .execute(&mut *tx)
            .await?;
        sqlx::query("SELECT set_config('search_path', $1, true)")
            .bind(quote_ident(&self.schema_name))
            .execute(&mut *tx)
            .await?;

        let statement = (&mut *tx).prepare(body.as_str()).await?;
        let names = unique_column_names(statement.columns().iter().map(|c| c.name()));
        let columns = statement
            .columns()
            .iter()
            .zip(&names)
            .map(|(column, name)| ResultColumn {
                name: name.clone(),
                data_type: data_type_label(column.type_info().name()).to_string(),
            })
            .collect::<Vec<_>>();

        let raw_rows = sqlx::query_scalar::<_, Option<String>>(&fetch_sql(&body, limits.max_rows.saturating_add(1)))
            .fetch_all(&mut *tx)
            .await?;

        let mut rows = Vec::with_capacity(raw_rows.len());
        for raw in raw_rows {
            rows.push(row_from_values(&names, raw.as_deref())?);
        }

        let total = if rows.len() > limits.max_rows {
            match sqlx::query_scalar::<_, i64>(&count_sql(&body))
                .fetch_one(&mut *tx)
                .await
            {
                Ok(count) => Some(count.max(0) as u64),
                Err(err) => {
                    tracing::warn!(error = %err, "row count for truncated result failed");
                    None
                }
            }
        } else {
            None
        };

        if let Err(err) = tx.rollback().await {
            tracing::debug!(error = %err, "read-only transaction rollback failed");
        }

        Ok(ExecutionResult::from_fetched(
            rows,
            columns,
            limits.max_rows,
            total,
            started.elapsed(),
        ))
    }
}

#[async_trait]
impl SqlExecutor for PgExecutor {
    async fn execute(
        &self,
        sql: &str,
        limits: ExecutionLimits,
    ) -> Result<ExecutionResult, ExecutionFailure> {
        tokio::time::timeout(limits.timeout + CLIENT_BACKSTOP, self.run(sql, limits))
            .await
            .map_err(|_| {
                ExecutionFailure::new(FailureKind::Timeout, "client-side backstop elapsed")
            })?
    }

    async fn ping(&self) -> bool {
        tokio::time::timeout(
            Duration::from_secs(2),
            sqlx::query("SELECT 1").execute(&self.pool),
        )
        .await
        .is_ok_and(|res| res.is_ok())
    }
}

pub fn classify(err: &sqlx::Error) -> FailureKind {
    match err {
        sqlx::Error::Database(db) => match db.code().as_deref() {
            Some("57014") => FailureKind::Timeout,
            Some(code) if code.starts_with("08") || code == "57P01" => FailureKind::ConnectionLost,
            _ => FailureKind::Error,
        },
        sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed => FailureKind::ConnectionLost,
        _ => FailureKind::Error,
    }
}

/// Coarse type family reported to callers for a database type name.
pub fn data_type_label(db_type: &str) -> &'static str {
    match db_type.to_ascii_uppercase().as_str() {
        "BOOL" | "BOOLEAN" => "boolean",
        "INT2" | "INT4" | "INT8" | "SMALLINT" | "INTEGER" | "BIGINT" | "OID" => "integer",
        "NUMERIC" | "FLOAT4" | "FLOAT8" | "REAL" | "DOUBLE PRECISION" | "MONEY" => "numeric",
        "TEXT" | "VARCHAR" | "BPCHAR" | "CHAR" | "NAME" | "CITEXT" => "text",
        "TIMESTAMP" | "TIMESTAMPTZ" => "timestamp",
        "DATE" => "date",
        "TIME" | "TIMETZ" => "time",
        "JSON" | "JSONB" => "json",
        "UUID" => "uuid",
        _ => "unknown",
    }
}

/// Each row comes back as a JSON array of its values in column order, so
/// duplicate output names never collapse. The body sits on its own lines so a
/// comment inside it cannot swallow the wrapper.
fn fetch_sql(body: &str, limit: usize) -> String {
    format!(
        "SELECT (SELECT json_agg(e.value ORDER BY e.ord) \
         FROM json_each(row_to_json(q)) WITH ORDINALITY AS e(key, value, ord))::text \
         FROM (\n{}\n) AS q LIMIT {}",
        body, limit
    )
}

fn count_sql(body: &str) -> String {
    format!("SELECT count(*) FROM (\n{}\n) AS q", body)
}

/// Output names with repeats suffixed (`id`, `id_2`, ...) so every column
/// keeps its own key in a row object.
fn unique_column_names<'a>(names: impl Iterator<Item = &'a str>) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for name in names {
        let mut candidate = name.to_string();
        let mut n = 2;
        while !seen.insert(candidate.clone()) {
            candidate = format!("{}_{}", name, n);
            n += 1;
        }
        out.push(candidate);
    }
    out
}

fn row_from_values(
    names: &[String],
    raw: Option<&str>,
) -> Result<serde_json::Map<String, serde_json::Value>, ExecutionFailure> {
    let values = match raw {
        Some(raw) => serde_json::from_str::<Vec<serde_json::Value>>(raw)
            .map_err(|err| ExecutionFailure::new(FailureKind::Error, err.to_string()))?,
        None => Vec::new(),
    };
    if values.len() != names.len() {
        return Err(ExecutionFailure::new(
            FailureKind::Error,
            format!("row has {} values for {} columns", values.len(), names.len()),
        ));
    }
    Ok(names.iter().cloned().zip(values).collect())
}

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn type_labels_cover_common_families() {
        assert_eq!(data_type_label("INT8"), "integer");
        assert_eq!(data_type_label("timestamptz"), "timestamp");
        assert_eq!(data_type_label("VARCHAR"), "text");
        assert_eq!(data_type_label("NUMERIC"), "numeric");
        assert_eq!(data_type_label("JSONB"), "json");
        assert_eq!(data_type_label("INT4[]"), "unknown");
    }

    #[test]
    fn pool_and_io_failures_are_connection_loss() {
        assert_eq!(classify(&sqlx::Error::PoolTimedOut), FailureKind::ConnectionLost);
        assert_eq!(classify(&sqlx::Error::PoolClosed), FailureKind::ConnectionLost);
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset");
        assert_eq!(classify(&sqlx::Error::Io(io)), FailureKind::ConnectionLost);
        assert_eq!(classify(&sqlx::Error::RowNotFound), FailureKind::Error);
    }

    #[test]
    fn failure_body_never_carries_driver_text() {
        let failure = ExecutionFailure::new(FailureKind::Error, "relation \"x\" does not exist");
        let body = failure.error_body();
        assert_eq!(body.code, ErrorCode::ExecutionError);
        assert!(!body.message.contains("relation"));
        assert_eq!(FailureKind::Timeout.code(), ErrorCode::ExecutionTimeout);
    }

    #[test]
    fn wrapped_query_survives_trailing_comments() {
        let body = statement_body("SELECT * FROM orders -- biggest orders first").unwrap();
        let wrapped = fetch_sql(&body, 11);
        assert!(wrapped.contains("FROM (\nSELECT * FROM orders\n) AS q LIMIT 11"));
        assert!(!wrapped.contains("--"));

        let body = statement_body("SELECT 1; -- x").unwrap();
        assert_eq!(count_sql(&body), "SELECT count(*) FROM (\nSELECT 1\n) AS q");
    }

    #[test]
    fn inner_comments_cannot_reach_the_wrapper() {
        let body = statement_body("SELECT id -- the key\nFROM orders;").unwrap();
        let wrapped = fetch_sql(&body, 5);
        let after_comment = wrapped.split("-- the key").nth(1).unwrap();
        assert!(after_comment.starts_with("\nFROM orders\n) AS q LIMIT 5"));
    }

    #[test]
    fn duplicate_output_names_keep_every_value() {
        let names = unique_column_names(["id", "id", "total", "id_2"].into_iter());
        assert_eq!(names, vec!["id", "id_2", "total", "id_2_2"]);

        let row = row_from_values(&names[..2], Some("[1, 7]")).unwrap();
        assert_eq!(row.len(), 2);
        assert_eq!(row["id"], serde_json::json!(1));
        assert_eq!(row["id_2"], serde_json::json!(7));
    }

    #[test]
    fn rows_without_columns_and_mismatched_rows() {
        assert!(row_from_values(&[], None).unwrap().is_empty());
        let err = row_from_values(&["a".to_string()], Some("[1, 2]")).unwrap_err();
        assert_eq!(err.kind, FailureKind::Error);
    }

    #[test]
    fn search_path_names_are_quoted() {
        assert_eq!(quote_ident("analytics"), "\"analytics\"");
        assert_eq!(quote_ident("we\"ird"), "\"we\"\"ird\"");
    }
}
