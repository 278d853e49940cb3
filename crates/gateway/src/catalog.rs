use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt::Write as _;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use sqlgate_contracts::{
    ColumnInfo, ForeignKeyRef, SchemaSnapshot, TableAccess, TableInfo, unix_epoch_ms_now,
};
use sqlx::{PgPool, Row};
use tokio::sync::{Mutex, RwLock};
use tracing::Instrument;

#[derive(Debug)]
pub enum CatalogError {
    Timeout,
    Database(sqlx::Error),
}

impl std::fmt::Display for CatalogError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CatalogError::Timeout => write!(f, "schema load timed out"),
            CatalogError::Database(err) => write!(f, "schema load failed: {}", err),
        }
    }
}

impl std::error::Error for CatalogError {}

impl From<sqlx::Error> for CatalogError {
    fn from(value: sqlx::Error) -> Self {
        CatalogError::Database(value)
    }
}

#[async_trait]
pub trait SchemaLoader: Send + Sync {
    /// Reads the complete table/column metadata. Never returns a partial snapshot.
    async fn load(&self) -> Result<SchemaSnapshot, CatalogError>;
}

struct Cached {
    snapshot: Arc<SchemaSnapshot>,
    loaded_at: Instant,
}

/// Process-wide schema cache. One full snapshot is cached regardless of role
/// and filtered per call. Readers see either the old or the new `Arc`, never a
/// half-built snapshot.
pub struct SchemaCatalog {
    loader: Arc<dyn SchemaLoader>,
    ttl: Duration,
    cached: RwLock<Option<Cached>>,
    reload: Mutex<()>,
}

impl SchemaCatalog {
    pub fn new(loader: Arc<dyn SchemaLoader>, ttl: Duration) -> Self {
        Self {
            loader,
            ttl,
            cached: RwLock::new(None),
            reload: Mutex::new(()),
        }
    }

    /// The full, unfiltered snapshot, loading it when missing or stale.
    pub async fn snapshot(&self) -> Result<Arc<SchemaSnapshot>, CatalogError> {
        if let Some(snapshot) = self.fresh().await {
            return Ok(snapshot);
        }

        let _guard = self.reload.lock().await;
        if let Some(snapshot) = self.fresh().await {
            return Ok(snapshot);
        }
        self.load_and_store().await
    }

    /// The view a caller with `access` may read.
    pub async fn get_schema(&self, access: &TableAccess) -> Result<SchemaSnapshot, CatalogError> {
        Ok(self.snapshot().await?.filter(access))
    }

    /// Forces a reload. Concurrent callers share one load: a refresh that
    /// finds a snapshot loaded after it started reuses that snapshot.
    pub async fn refresh(&self) -> Result<Arc<SchemaSnapshot>, CatalogError> {
        let requested_at = Instant::now();
        let _guard = self.reload.lock().await;

        if let Some(cached) = self.cached.read().await.as_ref()
            && cached.loaded_at >= requested_at
        {
            return Ok(cached.snapshot.clone());
        }
        self.load_and_store().await
    }

    async fn fresh(&self) -> Option<Arc<SchemaSnapshot>> {
        let cached = self.cached.read().await;
        cached
            .as_ref()
            .filter(|c| c.loaded_at.elapsed() < self.ttl)
            .map(|c| c.snapshot.clone())
    }

    async fn load_and_store(&self) -> Result<Arc<SchemaSnapshot>, CatalogError> {
        let span = tracing::info_span!(
            "schema.load",
            tables = tracing::field::Empty,
            version = tracing::field::Empty,
            latency_ms = tracing::field::Empty,
            outcome = tracing::field::Empty,
        );
        let started = Instant::now();

        async move {
            let result = self.loader.load().await;
            tracing::Span::current().record("latency_ms", started.elapsed().as_millis() as u64);

            match result {
                Ok(snapshot) => {
                    tracing::Span::current().record("tables", snapshot.tables.len() as u64);
                    tracing::Span::current().record("version", snapshot.version.as_str());
                    tracing::Span::current().record("outcome", "ok");
                    crate::metrics::observe_schema_load("ok");

                    let snapshot = Arc::new(snapshot);
                    *self.cached.write().await = Some(Cached {
                        snapshot: snapshot.clone(),
                        loaded_at: Instant::now(),
                    });
                    Ok(snapshot)
                }
                Err(err) => {
                    tracing::Span::current().record("outcome", "error");
                    crate::metrics::observe_schema_load("error");
                    tracing::error!(error = %err, "schema catalog load failed");
                    Err(err)
                }
            }
        }
        .instrument(span)
        .await
    }
}

/// Markdown rendering of a (filtered) snapshot, as given to the model.
pub fn prompt_text(snapshot: &SchemaSnapshot) -> String {
    if snapshot.tables.is_empty() {
        return "(no tables are available)".to_string();
    }

    let mut out = String::new();
    for (idx, table) in snapshot.tables.iter().enumerate() {
        if idx > 0 {
            out.push('\n');
        }
        let _ = writeln!(out, "### {}", table.name);
        if let Some(description) = table.description.as_deref() {
            let _ = writeln!(out, "{}", description);
        }
        let _ = writeln!(out, "Estimated rows: {}", table.estimated_row_count.max(0));
        out.push('\n');
        out.push_str("| column | type | nullable | key | description |\n");
        out.push_str("|---|---|---|---|---|\n");
        for column in &table.columns {
            let key = match (&column.foreign_key, column.is_primary_key) {
                (Some(fk), true) => format!("PK, FK -> {}.{}", fk.table, fk.column),
                (Some(fk), false) => format!("FK -> {}.{}", fk.table, fk.column),
                (None, true) => "PK".to_string(),
                (None, false) => String::new(),
            };
            let _ = writeln!(
                out,
                "| {} | {} | {} | {} | {} |",
                column.name,
                column.data_type,
                if column.nullable { "yes" } else { "no" },
                key,
                column
                    .description
                    .as_deref()
                    .unwrap_or("")
                    .replace('|', "\\|")
                    .replace('\n', " "),
            );
        }
    }
    out
}

/// Reads the catalog of one database schema through `information_schema` and
/// `pg_catalog`.
#[derive(Clone)]
pub struct PgSchemaLoader {
    pool: PgPool,
    schema_name: String,
    timeout: Duration,
}

impl PgSchemaLoader {
    pub fn new(pool: PgPool, schema_name: impl Into<String>, timeout: Duration) -> Self {
        Self {
            pool,
            schema_name: schema_name.into(),
            timeout,
        }
    }

    async fn read(&self) -> Result<SchemaSnapshot, CatalogError> {
        let schema = self.schema_name.as_str();

        let column_rows = sqlx::query(
            "SELECT c.table_name::text AS table_name, \
                    c.column_name::text AS column_name, \
                    c.data_type::text AS data_type, \
                    (c.is_nullable = 'YES') AS nullable \
             FROM information_schema.columns c \
             JOIN information_schema.tables t \
               ON c.table_schema = t.table_schema AND c.table_name = t.table_name \
             WHERE c.table_schema::text = $1 AND t.table_type = 'BASE TABLE' \
             ORDER BY c.table_name, c.ordinal_position",
        )
        .bind(schema)
        .fetch_all(&self.pool)
        .await?;

        let table_rows = sqlx::query(
            "SELECT cl.relname::text AS table_name, \
                    obj_description(cl.oid, 'pg_class') AS description, \
                    GREATEST(cl.reltuples, 0)::bigint AS estimated_row_count \
             FROM pg_catalog.pg_class cl \
             JOIN pg_catalog.pg_namespace n ON n.oid = cl.relnamespace \
             WHERE n.nspname = $1 AND cl.relkind IN ('r', 'p')",
        )
        .bind(schema)
        .fetch_all(&self.pool)
        .await?;

        let comment_rows = sqlx::query(
            "SELECT cl.relname::text AS table_name, \
                    a.attname::text AS column_name, \
                    col_description(cl.oid, a.attnum) AS description \
             FROM pg_catalog.pg_class cl \
             JOIN pg_catalog.pg_namespace n ON n.oid = cl.relnamespace \
             JOIN pg_catalog.pg_attribute a ON a.attrelid = cl.oid \
             WHERE n.nspname = $1 AND cl.relkind IN ('r', 'p') \
               AND a.attnum > 0 AND NOT a.attisdropped \
               AND col_description(cl.oid, a.attnum) IS NOT NULL",
        )
        .bind(schema)
        .fetch_all(&self.pool)
        .await?;

        let pk_rows = sqlx::query(
            "SELECT kcu.table_name::text AS table_name, kcu.column_name::text AS column_name \
             FROM information_schema.table_constraints tc \
             JOIN information_schema.key_column_usage kcu \
               ON tc.constraint_name = kcu.constraint_name \
              AND tc.table_schema = kcu.table_schema \
             WHERE tc.constraint_type = 'PRIMARY KEY' AND tc.table_schema::text = $1",
        )
        .bind(schema)
        .fetch_all(&self.pool)
        .await?;

        let fk_rows = sqlx::query(
            "SELECT kcu.table_name::text AS table_name, \
                    kcu.column_name::text AS column_name, \
                    ccu.table_name::text AS referenced_table, \
                    ccu.column_name::text AS referenced_column \
             FROM information_schema.table_constraints tc \
             JOIN information_schema.key_column_usage kcu \
               ON tc.constraint_name = kcu.constraint_name \
              AND tc.table_schema = kcu.table_schema \
             JOIN information_schema.constraint_column_usage ccu \
               ON ccu.constraint_name = tc.constraint_name \
              AND ccu.table_schema = tc.table_schema \
             WHERE tc.constraint_type = 'FOREIGN KEY' AND tc.table_schema::text = $1",
        )
        .bind(schema)
        .fetch_all(&self.pool)
        .await?;

        let mut table_meta = HashMap::new();
        for row in table_rows {
            let name: String = row.try_get("table_name")?;
            let description: Option<String> = row.try_get("description")?;
            let estimated: i64 = row.try_get("estimated_row_count")?;
            table_meta.insert(name, (description, estimated.max(0)));
        }

        let mut column_comments = HashMap::new();
        for row in comment_rows {
            let table: String = row.try_get("table_name")?;
            let column: String = row.try_get("column_name")?;
            let description: Option<String> = row.try_get("description")?;
            if let Some(description) = description {
                column_comments.insert((table, column), description);
            }
        }

        let mut primary_keys = HashSet::new();
        for row in pk_rows {
            let table: String = row.try_get("table_name")?;
            let column: String = row.try_get("column_name")?;
            primary_keys.insert((table, column));
        }

        let mut foreign_keys = HashMap::new();
        for row in fk_rows {
            let table: String = row.try_get("table_name")?;
            let column: String = row.try_get("column_name")?;
            foreign_keys.insert(
                (table, column),
                ForeignKeyRef {
                    table: row.try_get("referenced_table")?,
                    column: row.try_get("referenced_column")?,
                },
            );
        }

        let mut tables: BTreeMap<String, Vec<ColumnInfo>> = BTreeMap::new();
        for row in column_rows {
            let table: String = row.try_get("table_name")?;
            let name: String = row.try_get("column_name")?;
            let key = (table.clone(), name.clone());
            let column = ColumnInfo {
                data_type: row.try_get("data_type")?,
                nullable: row.try_get::<Option<bool>, _>("nullable")?.unwrap_or(true),
                is_primary_key: primary_keys.contains(&key),
                foreign_key: foreign_keys.remove(&key),
                description: column_comments.remove(&key),
                name,
            };
            tables.entry(table).or_default().push(column);
        }

        let tables = tables
            .into_iter()
            .map(|(name, columns)| {
                let (description, estimated_row_count) =
                    table_meta.remove(&name).unwrap_or((None, 0));
                TableInfo {
                    name,
                    columns,
                    estimated_row_count,
                    description,
                }
            })
            .collect::<Vec<_>>();

        Ok(SchemaSnapshot::new(tables, unix_epoch_ms_now()).with_schema_name(schema))
    }
}

#[async_trait]
impl SchemaLoader for PgSchemaLoader {
    async fn load(&self) -> Result<SchemaSnapshot, CatalogError> {
        tokio::time::timeout(self.timeout, self.read())
            .await
            .map_err(|_| CatalogError::Timeout)?
    }
}

/// Loader over a fixed table list, for tests and offline development.
pub struct StaticSchemaLoader {
    tables: Vec<TableInfo>,
}

impl StaticSchemaLoader {
    pub fn new(tables: Vec<TableInfo>) -> Self {
        Self { tables }
    }
}

#[async_trait]
impl SchemaLoader for StaticSchemaLoader {
    async fn load(&self) -> Result<SchemaSnapshot, CatalogError> {
        Ok(SchemaSnapshot::new(self.tables.clone(), unix_epoch_ms_now()))
    }
}
