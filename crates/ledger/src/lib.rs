use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use sqlgate_contracts::{Session, SessionStatus};
use sqlx::Row;
use sqlx::postgres::PgPoolOptions;

#[derive(Debug)]
pub enum StoreError {
    Timeout,
    /// Optimistic update lost the race more times than allowed.
    Conflict,
    Sqlx(sqlx::Error),
    Serialization(serde_json::Error),
    Corrupt(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::Timeout => write!(f, "session store operation timed out"),
            StoreError::Conflict => write!(f, "session was modified concurrently"),
            StoreError::Sqlx(err) => write!(f, "session store sql error: {}", err),
            StoreError::Serialization(err) => {
                write!(f, "session store serialization error: {}", err)
            }
            StoreError::Corrupt(what) => write!(f, "session store row is corrupt: {}", what),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<sqlx::Error> for StoreError {
    fn from(value: sqlx::Error) -> Self {
        StoreError::Sqlx(value)
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(value: serde_json::Error) -> Self {
        StoreError::Serialization(value)
    }
}

/// Durable session state. Every write after `create` is a compare-and-swap on
/// `Session::revision`, which gives single-writer-per-session semantics across
/// processes without holding locks across a model or database call.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Inserts a new session and returns it with its first revision.
    async fn create(&self, session: Session) -> Result<Session, StoreError>;

    async fn load(&self, session_id: &str) -> Result<Option<Session>, StoreError>;

    /// Writes `session` only if the stored revision still equals
    /// `session.revision`. On success the revision is advanced in place.
    async fn compare_and_swap(&self, session: &mut Session) -> Result<bool, StoreError>;

    /// Marks active sessions idle since before `cutoff_ms` as expired.
    async fn expire_idle(&self, cutoff_ms: i64) -> Result<u64, StoreError>;

    async fn ping(&self) -> Result<(), StoreError>;
}

/// What a read-modify-write step decided to do with the loaded session.
pub enum Change<T> {
    Write(T),
    Discard(T),
}

/// Loads `session_id`, applies `apply` and writes the result back, retrying
/// from a fresh read when another writer got there first. Returns `None` when
/// the session does not exist.
pub async fn modify_session<T, F>(
    store: &dyn SessionStore,
    session_id: &str,
    max_attempts: usize,
    mut apply: F,
) -> Result<Option<(Session, T)>, StoreError>
where
    F: FnMut(&mut Session) -> Change<T> + Send,
    T: Send,
{
    for attempt in 1..=max_attempts.max(1) {
        let Some(mut session) = store.load(session_id).await? else {
            return Ok(None);
        };
        match apply(&mut session) {
            Change::Discard(value) => return Ok(Some((session, value))),
            Change::Write(value) => {
                if store.compare_and_swap(&mut session).await? {
                    return Ok(Some((session, value)));
                }
                tracing::debug!(session_id, attempt, "session revision conflict, retrying");
            }
        }
    }
    Err(StoreError::Conflict)
}

#[derive(Clone)]
pub struct PgSessionStore {
    pool: sqlx::PgPool,
    write_timeout: Duration,
}

impl PgSessionStore {
    pub async fn connect(
        db_url: &str,
        max_connections: u32,
        write_timeout: Duration,
    ) -> Result<Self, StoreError> {
        let pool = tokio::time::timeout(
            Duration::from_secs(2),
            PgPoolOptions::new()
                .max_connections(max_connections.max(1))
                .connect(db_url),
        )
        .await
        .map_err(|_| StoreError::Timeout)??;

        Ok(Self {
            pool,
            write_timeout,
        })
    }

    pub async fn connect_and_migrate(
        db_url: &str,
        max_connections: u32,
        write_timeout: Duration,
    ) -> Result<Self, StoreError> {
        let store = Self::connect(db_url, max_connections, write_timeout).await?;
        store.migrate().await?;
        Ok(store)
    }

    pub fn from_pool(pool: sqlx::PgPool, write_timeout: Duration) -> Self {
        Self {
            pool,
            write_timeout,
        }
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        tokio::time::timeout(Duration::from_secs(10), migrate(&self.pool))
            .await
            .map_err(|_| StoreError::Timeout)??;
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

struct SessionColumns {
    roles: serde_json::Value,
    history: serde_json::Value,
    pending: Option<serde_json::Value>,
    finished: serde_json::Value,
}

impl SessionColumns {
    fn encode(session: &Session) -> Result<Self, StoreError> {
        Ok(Self {
            roles: serde_json::to_value(&session.roles)?,
            history: serde_json::to_value(&session.history)?,
            pending: session
                .pending_pipeline
                .as_ref()
                .map(serde_json::to_value)
                .transpose()?,
            finished: serde_json::to_value(&session.finished_runs)?,
        })
    }
}

fn session_from_row(row: &sqlx::postgres::PgRow) -> Result<Session, StoreError> {
    let status: String = row.try_get("status")?;
    let status = SessionStatus::parse(&status)
        .ok_or_else(|| StoreError::Corrupt(format!("unknown status {:?}", status)))?;
    let pending: Option<serde_json::Value> = row.try_get("pending_json")?;

    Ok(Session {
        id: row.try_get("session_id")?,
        principal_id: row.try_get("principal_id")?,
        roles: serde_json::from_value(row.try_get("roles_json")?)?,
        status,
        created_at: row.try_get("created_at_ms")?,
        last_activity_at: row.try_get("last_activity_ms")?,
        history: serde_json::from_value(row.try_get("history_json")?)?,
        pending_pipeline: pending.map(serde_json::from_value).transpose()?,
        finished_runs: serde_json::from_value(row.try_get("finished_json")?)?,
        revision: row.try_get("revision")?,
    })
}

#[async_trait]
impl SessionStore for PgSessionStore {
    async fn create(&self, mut session: Session) -> Result<Session, StoreError> {
        let columns = SessionColumns::encode(&session)?;
        session.revision = 1;

        tokio::time::timeout(
            self.write_timeout,
            sqlx::query(
                "INSERT INTO sqlgate_sessions (session_id, principal_id, roles_json, status, created_at_ms, last_activity_ms, history_json, pending_json, finished_json, revision) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)",
            )
            .bind(&session.id)
            .bind(&session.principal_id)
            .bind(&columns.roles)
            .bind(session.status.as_str())
            .bind(session.created_at)
            .bind(session.last_activity_at)
            .bind(&columns.history)
            .bind(&columns.pending)
            .bind(&columns.finished)
            .bind(session.revision)
            .execute(&self.pool),
        )
        .await
        .map_err(|_| StoreError::Timeout)??;

        Ok(session)
    }

    async fn load(&self, session_id: &str) -> Result<Option<Session>, StoreError> {
        let row = tokio::time::timeout(
            self.write_timeout,
            sqlx::query(
                "SELECT session_id, principal_id, roles_json, status, created_at_ms, last_activity_ms, history_json, pending_json, finished_json, revision FROM sqlgate_sessions WHERE session_id = $1",
            )
            .bind(session_id)
            .fetch_optional(&self.pool),
        )
        .await
        .map_err(|_| StoreError::Timeout)??;

        row.as_ref().map(session_from_row).transpose()
    }

    async fn compare_and_swap(&self, session: &mut Session) -> Result<bool, StoreError> {
        let columns = SessionColumns::encode(session)?;

        let result = tokio::time::timeout(
            self.write_timeout,
            sqlx::query(
                "UPDATE sqlgate_sessions SET roles_json = $1, status = $2, last_activity_ms = $3, history_json = $4, pending_json = $5, finished_json = $6, revision = revision + 1, updated_at = now() WHERE session_id = $7 AND revision = $8",
            )
            .bind(&columns.roles)
            .bind(session.status.as_str())
            .bind(session.last_activity_at)
            .bind(&columns.history)
            .bind(&columns.pending)
            .bind(&columns.finished)
            .bind(&session.id)
            .bind(session.revision)
            .execute(&self.pool),
        )
        .await
        .map_err(|_| StoreError::Timeout)??;

        if result.rows_affected() == 1 {
            session.revision += 1;
            return Ok(true);
        }
        Ok(false)
    }

    async fn expire_idle(&self, cutoff_ms: i64) -> Result<u64, StoreError> {
        let result = tokio::time::timeout(
            self.write_timeout,
            sqlx::query(
                "UPDATE sqlgate_sessions SET status = 'expired', revision = revision + 1, updated_at = now() WHERE status = 'active' AND last_activity_ms < $1",
            )
            .bind(cutoff_ms)
            .execute(&self.pool),
        )
        .await
        .map_err(|_| StoreError::Timeout)??;

        Ok(result.rows_affected())
    }

    async fn ping(&self) -> Result<(), StoreError> {
        tokio::time::timeout(
            self.write_timeout,
            sqlx::query("SELECT 1").execute(&self.pool),
        )
        .await
        .map_err(|_| StoreError::Timeout)??;
        Ok(())
    }
}

/// Process-local store for tests and single-instance development runs.
#[derive(Default)]
pub struct MemorySessionStore {
    sessions: Mutex<HashMap<String, Session>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, Session>>, StoreError> {
        self.sessions
            .lock()
            .map_err(|_| StoreError::Corrupt("memory store lock poisoned".to_string()))
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn create(&self, mut session: Session) -> Result<Session, StoreError> {
        session.revision = 1;
        let mut sessions = self.lock()?;
        if sessions.contains_key(&session.id) {
            return Err(StoreError::Conflict);
        }
        sessions.insert(session.id.clone(), session.clone());
        Ok(session)
    }

    async fn load(&self, session_id: &str) -> Result<Option<Session>, StoreError> {
        Ok(self.lock()?.get(session_id).cloned())
    }

    async fn compare_and_swap(&self, session: &mut Session) -> Result<bool, StoreError> {
        let mut sessions = self.lock()?;
        let Some(stored) = sessions.get_mut(&session.id) else {
            return Ok(false);
        };
        if stored.revision != session.revision {
            return Ok(false);
        }
        session.revision += 1;
        *stored = session.clone();
        Ok(true)
    }

    async fn expire_idle(&self, cutoff_ms: i64) -> Result<u64, StoreError> {
        let mut expired = 0;
        for session in self.lock()?.values_mut() {
            if session.status == SessionStatus::Active && session.last_activity_at < cutoff_ms {
                session.status = SessionStatus::Expired;
                session.revision += 1;
                expired += 1;
            }
        }
        Ok(expired)
    }

    async fn ping(&self) -> Result<(), StoreError> {
        self.lock().map(|_| ())
    }
}

pub async fn migrate(pool: &sqlx::PgPool) -> Result<(), sqlx::Error> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlgate_contracts::HistoryMessage;

    fn session(id: &str) -> Session {
        Session::new(id, "alice", vec!["viewer".to_string()], 1_000)
    }

    #[tokio::test]
    async fn memory_store_rejects_stale_revisions() {
        let store = MemorySessionStore::new();
        let created = store.create(session("s1")).await.unwrap();
        assert_eq!(created.revision, 1);

        let mut a = store.load("s1").await.unwrap().unwrap();
        let mut b = a.clone();

        a.touch(2_000);
        assert!(store.compare_and_swap(&mut a).await.unwrap());
        assert_eq!(a.revision, 2);

        b.touch(3_000);
        assert!(!store.compare_and_swap(&mut b).await.unwrap());
        assert_eq!(
            store.load("s1").await.unwrap().unwrap().last_activity_at,
            2_000
        );
    }

    #[tokio::test]
    async fn modify_session_retries_and_reports_missing() {
        let store = MemorySessionStore::new();
        store.create(session("s1")).await.unwrap();

        let mut calls = 0;
        let updated = modify_session(&store, "s1", 3, |s| {
            calls += 1;
            s.append_history(HistoryMessage::user("hello", 5_000), 10);
            Change::Write(s.history.len())
        })
        .await
        .unwrap()
        .unwrap();
        assert_eq!(updated.1, 1);
        assert_eq!(updated.0.revision, 2);
        assert_eq!(calls, 1);

        let missing = modify_session(&store, "nope", 3, |_| Change::Write(()))
            .await
            .unwrap();
        assert!(missing.is_none());

        let discarded = modify_session(&store, "s1", 3, |_| Change::Discard("kept"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(discarded.1, "kept");
        assert_eq!(store.load("s1").await.unwrap().unwrap().revision, 2);
    }

    #[tokio::test]
    async fn memory_store_expires_only_idle_active_sessions() {
        let store = MemorySessionStore::new();
        store.create(session("idle")).await.unwrap();
        let mut fresh = session("fresh");
        fresh.last_activity_at = 9_000;
        store.create(fresh).await.unwrap();
        let mut gone = session("gone");
        gone.status = SessionStatus::Terminated;
        store.create(gone).await.unwrap();

        assert_eq!(store.expire_idle(5_000).await.unwrap(), 1);
        assert_eq!(
            store.load("idle").await.unwrap().unwrap().status,
            SessionStatus::Expired
        );
        assert_eq!(
            store.load("gone").await.unwrap().unwrap().status,
            SessionStatus::Terminated
        );
    }
}
