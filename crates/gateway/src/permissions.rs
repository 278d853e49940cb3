use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use sqlgate_contracts::TableAccess;
use sqlx::PgPool;

#[derive(Debug)]
pub enum PermissionError {
    Timeout,
    Database(sqlx::Error),
}

impl std::fmt::Display for PermissionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PermissionError::Timeout => write!(f, "permission lookup timed out"),
            PermissionError::Database(err) => write!(f, "permission lookup failed: {}", err),
        }
    }
}

impl std::error::Error for PermissionError {}

impl From<sqlx::Error> for PermissionError {
    fn from(value: sqlx::Error) -> Self {
        PermissionError::Database(value)
    }
}

/// Role to readable-table reference data. Never written by the pipeline.
#[async_trait]
pub trait PermissionSource: Send + Sync {
    /// Union of the tables any of `roles` may read.
    async fn readable_tables(&self, roles: &[String]) -> Result<BTreeSet<String>, PermissionError>;
}

pub struct PgPermissionSource {
    pool: PgPool,
    timeout: Duration,
}

impl PgPermissionSource {
    pub fn new(pool: PgPool, timeout: Duration) -> Self {
        Self { pool, timeout }
    }
}

#[async_trait]
impl PermissionSource for PgPermissionSource {
    async fn readable_tables(&self, roles: &[String]) -> Result<BTreeSet<String>, PermissionError> {
        if roles.is_empty() {
            return Ok(BTreeSet::new());
        }

        let query = sqlx::query_scalar::<_, String>(
            "SELECT DISTINCT tp.table_name::text \
             FROM table_permissions tp \
             JOIN roles r ON tp.role_id = r.id \
             WHERE r.name = ANY($1) AND tp.can_read = TRUE",
        )
        .bind(roles.to_vec())
        .fetch_all(&self.pool);

        let tables = tokio::time::timeout(self.timeout, query)
            .await
            .map_err(|_| PermissionError::Timeout)??;
        Ok(tables.into_iter().collect())
    }
}

/// Fixed role map, for tests and offline development.
#[derive(Debug, Clone, Default)]
pub struct StaticPermissions {
    by_role: HashMap<String, BTreeSet<String>>,
}

impl StaticPermissions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn grant<I, S>(mut self, role: &str, tables: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.by_role
            .entry(role.to_string())
            .or_default()
            .extend(tables.into_iter().map(Into::into));
        self
    }
}

#[async_trait]
impl PermissionSource for StaticPermissions {
    async fn readable_tables(&self, roles: &[String]) -> Result<BTreeSet<String>, PermissionError> {
        Ok(roles
            .iter()
            .filter_map(|role| self.by_role.get(role))
            .flatten()
            .cloned()
            .collect())
    }
}

/// Turns a caller's roles into the table view the pipeline works against.
#[derive(Clone)]
pub struct AccessResolver {
    source: Arc<dyn PermissionSource>,
    admin_role: String,
}

impl AccessResolver {
    pub fn new(source: Arc<dyn PermissionSource>, admin_role: impl Into<String>) -> Self {
        Self {
            source,
            admin_role: admin_role.into(),
        }
    }

    pub fn is_admin(&self, roles: &[String]) -> bool {
        roles
            .iter()
            .any(|role| role.eq_ignore_ascii_case(&self.admin_role))
    }

    pub async fn resolve(&self, roles: &[String]) -> Result<TableAccess, PermissionError> {
        if self.is_admin(roles) {
            return Ok(TableAccess::All);
        }
        Ok(TableAccess::only(self.source.readable_tables(roles).await?))
    }
}

/// The first of `tables` that `access` does not allow.
pub fn first_denied<'a>(access: &TableAccess, tables: &'a [String]) -> Option<&'a str> {
    tables
        .iter()
        .map(String::as_str)
        .find(|table| !access.allows(table))
}
