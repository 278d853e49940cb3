use std::time::Duration;

use sqlgate_contracts::{HistoryMessage, PipelineRun, PipelineStatus, Session, SessionStatus};
use sqlgate_ledger::{Change, PgSessionStore, SessionStore, modify_session};

fn test_db_url() -> Option<String> {
    std::env::var("SQLGATE_TEST_DB_URL")
        .ok()
        .or_else(|| std::env::var("DATABASE_URL").ok())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn schema_db_url(base: &str, schema: &str) -> String {
    let separator = if base.contains('?') { "&" } else { "?" };
    format!("{base}{separator}options=-csearch_path%3D{schema}")
}

struct TestSchema {
    name: String,
    admin: sqlx::PgPool,
    url: String,
}

impl TestSchema {
    async fn create(db_url: &str) -> Self {
        let name = format!("sqlgate_test_{}", ulid::Ulid::new()).to_lowercase();
        let admin = sqlx::postgres::PgPoolOptions::new()
            .max_connections(1)
            .connect(db_url)
            .await
            .expect("DB connect should succeed");
        sqlx::query(&format!("CREATE SCHEMA {}", name))
            .execute(&admin)
            .await
            .expect("create schema should succeed");
        let url = schema_db_url(db_url, &name);
        Self { name, admin, url }
    }

    async fn drop(self) {
        let _ = sqlx::query(&format!("DROP SCHEMA {} CASCADE", self.name))
            .execute(&self.admin)
            .await;
        self.admin.close().await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn migrations_apply_idempotently_and_constrain_status() {
    let Some(db_url) = test_db_url() else {
        eprintln!("skipping DB migration test; set SQLGATE_TEST_DB_URL to enable");
        return;
    };
    let schema = TestSchema::create(&db_url).await;

    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(1)
        .connect(&schema.url)
        .await
        .expect("DB connect should succeed");

    sqlgate_ledger::migrate(&pool)
        .await
        .expect("migrations should apply");
    sqlgate_ledger::migrate(&pool)
        .await
        .expect("migrations should be idempotent");

    let err = sqlx::query(
        "INSERT INTO sqlgate_sessions (session_id, principal_id, status, created_at_ms, last_activity_ms) VALUES ('s1', 'alice', 'paused', 0, 0)",
    )
    .execute(&pool)
    .await
    .expect_err("unknown status must be rejected");
    assert!(
        format!("{err:?}").contains("check"),
        "expected check constraint violation, got: {err:?}"
    );

    pool.close().await;
    schema.drop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn pg_store_round_trips_and_enforces_revisions() {
    let Some(db_url) = test_db_url() else {
        eprintln!("skipping session store test; set SQLGATE_TEST_DB_URL to enable");
        return;
    };
    let schema = TestSchema::create(&db_url).await;

    let store = PgSessionStore::connect_and_migrate(&schema.url, 2, Duration::from_secs(2))
        .await
        .expect("store init should succeed");

    let created = store
        .create(Session::new("s1", "alice", vec!["viewer".to_string()], 1_000))
        .await
        .expect("create should succeed");
    assert_eq!(created.revision, 1);

    let (updated, _) = modify_session(&store, "s1", 3, |s| {
        s.append_history(HistoryMessage::user("how many orders?", 2_000), 10);
        let mut run = PipelineRun::new("p1", "s1", "how many orders?", 3);
        run.transition(PipelineStatus::Validating).expect("validating");
        run.await_approval(
            "SELECT count(*) FROM orders".to_string(),
            "Counts orders.".to_string(),
            vec!["orders".to_string()],
        )
        .expect("awaiting approval");
        s.pending_pipeline = Some(run);
        s.touch(2_000);
        Change::Write(())
    })
    .await
    .expect("modify should succeed")
    .expect("session exists");
    assert_eq!(updated.revision, 2);

    let loaded = store
        .load("s1")
        .await
        .expect("load should succeed")
        .expect("session exists");
    assert_eq!(loaded, updated);
    assert_eq!(
        loaded.pending_pipeline.as_ref().map(|r| r.status),
        Some(PipelineStatus::AwaitingApproval)
    );

    let mut stale = created.clone();
    stale.touch(3_000);
    assert!(
        !store
            .compare_and_swap(&mut stale)
            .await
            .expect("cas should run")
    );

    assert!(store.load("missing").await.expect("load").is_none());

    assert_eq!(store.expire_idle(2_001).await.expect("expire"), 1);
    let expired = store.load("s1").await.expect("load").expect("exists");
    assert_eq!(expired.status, SessionStatus::Expired);
    assert_eq!(expired.revision, 3);

    store.ping().await.expect("ping should succeed");
    store.close().await;
    schema.drop().await;
}
