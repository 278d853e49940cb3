use std::sync::Arc;
use std::time::{Duration, Instant};

use sqlgate_auth::Principal;
use sqlgate_contracts::{
    ErrorCode, HistoryMessage, Session, SessionStatus, unix_epoch_ms_now,
};
use sqlgate_ledger::{Change, SessionStore, StoreError, modify_session};
use tracing::Instrument;
use ulid::Ulid;

/// Optimistic write attempts before a session update gives up.
pub const CAS_ATTEMPTS: usize = 5;

#[derive(Debug)]
pub enum SessionError {
    NotFound,
    Expired,
    Store(StoreError),
}

impl SessionError {
    pub fn code(&self) -> ErrorCode {
        match self {
            SessionError::NotFound => ErrorCode::SessionNotFound,
            SessionError::Expired => ErrorCode::SessionExpired,
            SessionError::Store(_) => ErrorCode::StoreUnavailable,
        }
    }
}

impl std::fmt::Display for SessionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionError::NotFound => write!(f, "session not found"),
            SessionError::Expired => write!(f, "session expired"),
            SessionError::Store(err) => write!(f, "{}", err),
        }
    }
}

impl std::error::Error for SessionError {}

impl From<StoreError> for SessionError {
    fn from(value: StoreError) -> Self {
        SessionError::Store(value)
    }
}

enum Access {
    Usable,
    Missing,
    Expired,
}

/// Session lifecycle on top of a [`SessionStore`]: ownership, lazy expiry and
/// get-or-create for chat turns.
#[derive(Clone)]
pub struct SessionManager {
    store: Arc<dyn SessionStore>,
    idle_timeout: Duration,
    max_history: usize,
}

impl SessionManager {
    pub fn new(store: Arc<dyn SessionStore>, idle_timeout: Duration, max_history: usize) -> Self {
        Self {
            store,
            idle_timeout,
            max_history,
        }
    }

    pub fn store(&self) -> &dyn SessionStore {
        self.store.as_ref()
    }

    pub fn idle_timeout(&self) -> Duration {
        self.idle_timeout
    }

    pub fn max_history(&self) -> usize {
        self.max_history
    }

    pub async fn create(&self, principal: &Principal) -> Result<Session, StoreError> {
        let session_id = Ulid::new().to_string();
        let span = tracing::info_span!(
            "session.create",
            session_id = %session_id,
            principal_id = %principal.principal_id,
            latency_ms = tracing::field::Empty,
            outcome = tracing::field::Empty,
        );
        let started = Instant::now();

        async move {
            let session = Session::new(
                session_id,
                principal.principal_id.clone(),
                principal.roles.clone(),
                unix_epoch_ms_now(),
            );
            let result = self.store.create(session).await;
            tracing::Span::current().record("latency_ms", started.elapsed().as_millis() as u64);
            tracing::Span::current().record("outcome", if result.is_ok() { "ok" } else { "error" });
            result
        }
        .instrument(span)
        .await
    }

    /// Loads an owned, active session. An idle session is marked expired on
    /// the way out.
    pub async fn get(&self, principal: &Principal, session_id: &str) -> Result<Session, SessionError> {
        let now = unix_epoch_ms_now();
        let idle_timeout = self.idle_timeout;
        let updated = modify_session(self.store(), session_id, CAS_ATTEMPTS, |session| {
            match self.classify(session, principal) {
                Access::Missing => Change::Discard(Access::Missing),
                Access::Expired => Change::Discard(Access::Expired),
                Access::Usable => {
                    if session.expire_if_idle(now, idle_timeout) {
                        Change::Write(Access::Expired)
                    } else {
                        Change::Discard(Access::Usable)
                    }
                }
            }
        })
        .await?;

        match updated {
            None => Err(SessionError::NotFound),
            Some((_, Access::Missing)) => Err(SessionError::NotFound),
            Some((_, Access::Expired)) => Err(SessionError::Expired),
            Some((session, Access::Usable)) => Ok(session),
        }
    }

    /// The session a chat turn runs in: `requested` when it is usable,
    /// otherwise a fresh one.
    pub async fn open_for_turn(
        &self,
        principal: &Principal,
        requested: Option<&str>,
    ) -> Result<Session, StoreError> {
        if let Some(session_id) = requested {
            match self.get(principal, session_id).await {
                Ok(session) => return Ok(session),
                Err(SessionError::Store(err)) => return Err(err),
                Err(SessionError::NotFound) | Err(SessionError::Expired) => {
                    tracing::info!(
                        requested_session_id = %session_id,
                        "requested session is not usable, starting a new one"
                    );
                }
            }
        }
        self.create(principal).await
    }

    /// Marks the session terminated. Terminating twice reports not found.
    pub async fn terminate(
        &self,
        principal: &Principal,
        session_id: &str,
    ) -> Result<Session, SessionError> {
        let updated = modify_session(self.store(), session_id, CAS_ATTEMPTS, |session| {
            if session.principal_id != principal.principal_id
                || session.status == SessionStatus::Terminated
            {
                return Change::Discard(false);
            }
            session.status = SessionStatus::Terminated;
            session.pending_pipeline = None;
            Change::Write(true)
        })
        .await?;

        match updated {
            Some((session, true)) => Ok(session),
            _ => Err(SessionError::NotFound),
        }
    }

    /// Clears history, the pending run and finished runs of an active session.
    pub async fn reset(&self, principal: &Principal, session_id: &str) -> Result<Session, SessionError> {
        let now = unix_epoch_ms_now();
        let idle_timeout = self.idle_timeout;
        let updated = modify_session(self.store(), session_id, CAS_ATTEMPTS, |session| {
            match self.classify(session, principal) {
                Access::Missing => Change::Discard(Access::Missing),
                Access::Expired => Change::Discard(Access::Expired),
                Access::Usable => {
                    if session.expire_if_idle(now, idle_timeout) {
                        return Change::Write(Access::Expired);
                    }
                    session.reset();
                    session.touch(now);
                    Change::Write(Access::Usable)
                }
            }
        })
        .await?;

        match updated {
            None | Some((_, Access::Missing)) => Err(SessionError::NotFound),
            Some((_, Access::Expired)) => Err(SessionError::Expired),
            Some((session, Access::Usable)) => Ok(session),
        }
    }

    pub async fn touch(&self, session_id: &str) -> Result<bool, StoreError> {
        let now = unix_epoch_ms_now();
        let updated = modify_session(self.store(), session_id, CAS_ATTEMPTS, |session| {
            session.touch(now);
            Change::Write(())
        })
        .await?;
        Ok(updated.is_some())
    }

    pub async fn append_history(
        &self,
        session_id: &str,
        message: HistoryMessage,
    ) -> Result<bool, StoreError> {
        let max_history = self.max_history;
        let updated = modify_session(self.store(), session_id, CAS_ATTEMPTS, |session| {
            session.append_history(message.clone(), max_history);
            session.touch(message.created_at);
            Change::Write(())
        })
        .await?;
        Ok(updated.is_some())
    }

    /// Expires every active session idle past the timeout.
    pub async fn sweep(&self) -> Result<u64, StoreError> {
        let idle_ms = self.idle_timeout.as_millis().min(i64::MAX as u128) as i64;
        let cutoff = unix_epoch_ms_now().saturating_sub(idle_ms);
        self.store.expire_idle(cutoff).await
    }

    /// Runs [`SessionManager::sweep`] every `interval` until the runtime shuts
    /// down. A zero interval disables the sweep.
    pub fn spawn_sweeper(&self, interval: Duration) -> Option<tokio::task::JoinHandle<()>> {
        if interval.is_zero() {
            return None;
        }
        let manager = self.clone();
        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                match manager.sweep().await {
                    Ok(0) => {}
                    Ok(expired) => tracing::info!(expired, "expired idle sessions"),
                    Err(err) => tracing::warn!(error = %err, "session sweep failed"),
                }
            }
        }))
    }

    fn classify(&self, session: &Session, principal: &Principal) -> Access {
        if session.principal_id != principal.principal_id {
            return Access::Missing;
        }
        match session.status {
            SessionStatus::Terminated => Access::Missing,
            SessionStatus::Expired => Access::Expired,
            SessionStatus::Active => Access::Usable,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlgate_ledger::MemorySessionStore;

    fn principal(id: &str) -> Principal {
        Principal {
            principal_id: id.to_string(),
            roles: vec!["viewer".to_string()],
        }
    }

    fn manager(idle: Duration) -> (Arc<MemorySessionStore>, SessionManager) {
        let store = Arc::new(MemorySessionStore::new());
        let manager = SessionManager::new(store.clone(), idle, 3);
        (store, manager)
    }

    #[tokio::test]
    async fn sessions_are_private_to_their_principal() {
        let (_, manager) = manager(Duration::from_secs(60));
        let session = manager.create(&principal("alice")).await.unwrap();

        assert!(manager.get(&principal("alice"), &session.id).await.is_ok());
        assert!(matches!(
            manager.get(&principal("mallory"), &session.id).await,
            Err(SessionError::NotFound)
        ));
        assert!(matches!(
            manager.terminate(&principal("mallory"), &session.id).await,
            Err(SessionError::NotFound)
        ));
    }

    #[tokio::test]
    async fn idle_sessions_expire_on_read() {
        let (store, manager) = manager(Duration::from_secs(60));
        let session = manager.create(&principal("alice")).await.unwrap();

        let mut stale = store.load(&session.id).await.unwrap().unwrap();
        stale.last_activity_at -= 61_000;
        assert!(store.compare_and_swap(&mut stale).await.unwrap());

        assert!(matches!(
            manager.get(&principal("alice"), &session.id).await,
            Err(SessionError::Expired)
        ));
        let stored = store.load(&session.id).await.unwrap().unwrap();
        assert_eq!(stored.status, SessionStatus::Expired);
    }

    #[tokio::test]
    async fn turn_on_unusable_session_starts_fresh() {
        let (_, manager) = manager(Duration::from_secs(60));
        let alice = principal("alice");
        let original = manager.create(&alice).await.unwrap();
        manager.terminate(&alice, &original.id).await.unwrap();

        let opened = manager.open_for_turn(&alice, Some(&original.id)).await.unwrap();
        assert_ne!(opened.id, original.id);

        let again = manager.open_for_turn(&alice, Some(&opened.id)).await.unwrap();
        assert_eq!(again.id, opened.id);

        let fresh = manager.open_for_turn(&alice, Some("no-such-session")).await.unwrap();
        assert_ne!(fresh.id, opened.id);
    }

    #[tokio::test]
    async fn history_is_capped_and_reset_clears_it() {
        let (_, manager) = manager(Duration::from_secs(60));
        let alice = principal("alice");
        let session = manager.create(&alice).await.unwrap();
        for i in 0..5 {
            manager
                .append_history(&session.id, HistoryMessage::user(format!("q{i}"), unix_epoch_ms_now()))
                .await
                .unwrap();
        }
        let loaded = manager.get(&alice, &session.id).await.unwrap();
        assert_eq!(
            loaded.history.iter().map(|m| m.content.as_str()).collect::<Vec<_>>(),
            vec!["q2", "q3", "q4"]
        );

        let reset = manager.reset(&alice, &session.id).await.unwrap();
        assert!(reset.history.is_empty());
    }

    #[tokio::test]
    async fn sweep_expires_idle_sessions() {
        let (store, manager) = manager(Duration::from_secs(60));
        let session = manager.create(&principal("alice")).await.unwrap();
        let mut stale = store.load(&session.id).await.unwrap().unwrap();
        stale.last_activity_at -= 120_000;
        assert!(store.compare_and_swap(&mut stale).await.unwrap());

        assert_eq!(manager.sweep().await.unwrap(), 1);
        assert_eq!(manager.sweep().await.unwrap(), 0);
    }
}
