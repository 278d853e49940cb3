//! In-process gateway for scenario tests: real router and HTTP, in-memory
//! session store, scripted model and a counting executor.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use axum::Router;
use serde_json::Value;
use sqlgate_auth::Authenticator;
use sqlgate_contracts::{ColumnInfo, ExecutionResult, ForeignKeyRef, ResultColumn, TableInfo};
use sqlgate_gateway::catalog::{SchemaCatalog, StaticSchemaLoader};
use sqlgate_gateway::executor::{
    ExecutionFailure, ExecutionLimits, FailureKind, SqlExecutor,
};
use sqlgate_gateway::http::{AppState, app};
use sqlgate_gateway::permissions::{AccessResolver, StaticPermissions};
use sqlgate_gateway::pipeline::{Pipeline, PipelineDeps, PipelineSettings};
use sqlgate_gateway::rate_limit::TurnLimiter;
use sqlgate_gateway::sessions::SessionManager;
use sqlgate_ledger::MemorySessionStore;
use sqlgate_model::{ModelSet, PromptPurpose, ScriptedModel};
use tokio::net::TcpListener;
use tokio::sync::oneshot;

pub const VIEWER: &str = "analyst";

/// Executor double that counts invocations and returns `rows` rows after
/// `delay`. A delay past the statement timeout fails as a timeout.
pub struct CountingExecutor {
    calls: AtomicUsize,
    rows: usize,
    delay: Duration,
}

impl CountingExecutor {
    pub fn new(rows: usize) -> Self {
        Self {
            calls: AtomicUsize::new(0),
            rows,
            delay: Duration::ZERO,
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SqlExecutor for CountingExecutor {
    async fn execute(
        &self,
        _sql: &str,
        limits: ExecutionLimits,
    ) -> Result<ExecutionResult, ExecutionFailure> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if tokio::time::timeout(limits.timeout, tokio::time::sleep(self.delay))
            .await
            .is_err()
        {
            return Err(ExecutionFailure::new(
                FailureKind::Timeout,
                "canceling statement due to statement timeout",
            ));
        }

        let fetched = self.rows.min(limits.max_rows + 1);
        let rows = (0..fetched)
            .map(|i| {
                let mut row = serde_json::Map::new();
                row.insert("id".to_string(), serde_json::json!(i + 1));
                row.insert("total".to_string(), serde_json::json!(format!("{}.00", 10 * (i + 1))));
                row
            })
            .collect();
        let columns = vec![
            ResultColumn {
                name: "id".to_string(),
                data_type: "integer".to_string(),
            },
            ResultColumn {
                name: "total".to_string(),
                data_type: "numeric".to_string(),
            },
        ];
        let total = (self.rows > limits.max_rows).then_some(self.rows as u64);
        Ok(ExecutionResult::from_fetched(
            rows,
            columns,
            limits.max_rows,
            total,
            self.delay,
        ))
    }

    async fn ping(&self) -> bool {
        true
    }
}

fn column(name: &str, data_type: &str) -> ColumnInfo {
    ColumnInfo {
        name: name.to_string(),
        data_type: data_type.to_string(),
        nullable: name != "id",
        is_primary_key: name == "id",
        foreign_key: None,
        description: None,
    }
}

/// `orders` and `customers` are readable by [`VIEWER`]; `salaries` is not.
pub fn shop_tables() -> Vec<TableInfo> {
    let mut customer_id = column("customer_id", "integer");
    customer_id.foreign_key = Some(ForeignKeyRef {
        table: "customers".to_string(),
        column: "id".to_string(),
    });
    vec![
        TableInfo {
            name: "customers".to_string(),
            columns: vec![
                column("id", "integer"),
                column("name", "text"),
                column("region", "text"),
            ],
            estimated_row_count: 250,
            description: Some("Registered customers".to_string()),
        },
        TableInfo {
            name: "orders".to_string(),
            columns: vec![
                column("id", "integer"),
                customer_id,
                column("total", "numeric"),
                column("status", "text"),
                column("created_at", "timestamp"),
            ],
            estimated_row_count: 12_000,
            description: None,
        },
        TableInfo {
            name: "salaries".to_string(),
            columns: vec![column("id", "integer"), column("amount", "numeric")],
            estimated_row_count: 40,
            description: Some("Employee pay".to_string()),
        },
    ]
}

pub fn default_settings() -> PipelineSettings {
    PipelineSettings {
        max_attempts: 3,
        limits: ExecutionLimits {
            timeout: Duration::from_millis(500),
            max_rows: 100,
        },
        semantic_gate_enabled: true,
        permission_precheck_enabled: false,
        auto_approve: false,
    }
}

pub struct TestGateway {
    pub addr: SocketAddr,
    pub client: reqwest::Client,
    pub model: Arc<ScriptedModel>,
    pub executor: Arc<CountingExecutor>,
    shutdown: Option<oneshot::Sender<()>>,
    task: tokio::task::JoinHandle<()>,
}

impl TestGateway {
    /// Starts a gateway on an ephemeral port. Audit prompts answer `SAFE`
    /// unless `model` queues something else.
    pub async fn start(
        settings: PipelineSettings,
        model: ScriptedModel,
        executor: CountingExecutor,
    ) -> Self {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();

        let model = Arc::new(model.fallback(PromptPurpose::Audit, "SAFE"));
        let executor = Arc::new(executor);
        let pipeline = Pipeline::new(
            settings,
            PipelineDeps {
                sessions: SessionManager::new(
                    Arc::new(MemorySessionStore::new()),
                    Duration::from_secs(30 * 60),
                    10,
                ),
                catalog: Arc::new(SchemaCatalog::new(
                    Arc::new(StaticSchemaLoader::new(shop_tables())),
                    Duration::from_secs(3600),
                )),
                access: AccessResolver::new(
                    Arc::new(StaticPermissions::new().grant(VIEWER, ["orders", "customers"])),
                    "admin",
                ),
                models: ModelSet::uniform(model.clone()),
                executor: executor.clone(),
            },
        );
        let state = AppState::new(pipeline, Authenticator::Local, TurnLimiter::disabled());

        let (addr, shutdown, task) = spawn_server(app(state)).await;
        Self {
            addr,
            client: reqwest::Client::new(),
            model,
            executor,
            shutdown: Some(shutdown),
            task,
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    pub fn request(&self, method: reqwest::Method, path: &str, principal: &str) -> reqwest::RequestBuilder {
        self.client
            .request(method, self.url(path))
            .header("x-sqlgate-principal-id", principal)
            .header("x-sqlgate-roles", VIEWER)
    }

    /// Runs one chat turn and returns its NDJSON events in order.
    pub async fn chat(&self, principal: &str, question: &str, session_id: Option<&str>) -> Vec<Value> {
        let mut body = serde_json::json!({ "question": question });
        if let Some(session_id) = session_id {
            body["sessionId"] = Value::String(session_id.to_string());
        }
        let response = self
            .request(reqwest::Method::POST, "/v1/chat", principal)
            .json(&body)
            .send()
            .await
            .expect("chat request should succeed");
        assert_eq!(response.status().as_u16(), 200);
        assert_eq!(
            response
                .headers()
                .get("content-type")
                .and_then(|v| v.to_str().ok()),
            Some("application/x-ndjson")
        );

        let text = response.text().await.expect("chat stream should be readable");
        text.lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| serde_json::from_str(line).expect("each line should be JSON"))
            .collect()
    }

    pub async fn confirm(
        &self,
        principal: &str,
        session_id: &str,
        pipeline_id: &str,
        approved: bool,
    ) -> (u16, Value) {
        let response = self
            .request(reqwest::Method::POST, "/v1/chat/confirm", principal)
            .json(&serde_json::json!({
                "sessionId": session_id,
                "pipelineId": pipeline_id,
                "approved": approved,
            }))
            .send()
            .await
            .expect("confirm request should succeed");
        let status = response.status().as_u16();
        (status, response.json().await.expect("confirm body should be JSON"))
    }

    pub async fn get_json(&self, path: &str, principal: &str) -> (u16, Value) {
        let response = self
            .request(reqwest::Method::GET, path, principal)
            .send()
            .await
            .expect("request should succeed");
        let status = response.status().as_u16();
        (status, response.json().await.expect("body should be JSON"))
    }

    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        let _ = self.task.await;
    }
}

async fn spawn_server(app: Router) -> (SocketAddr, oneshot::Sender<()>, tokio::task::JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind should succeed");
    let addr = listener.local_addr().expect("local_addr should succeed");

    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let handle = tokio::spawn(async move {
        let _ = axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            })
            .await;
    });

    (addr, shutdown_tx, handle)
}

/// Events of one kind, in stream order.
pub fn events_of<'a>(events: &'a [Value], kind: &str) -> Vec<&'a Value> {
    events
        .iter()
        .filter(|e| e.get("type").and_then(Value::as_str) == Some(kind))
        .collect()
}

pub fn event_kinds(events: &[Value]) -> Vec<String> {
    events
        .iter()
        .filter_map(|e| e.get("type").and_then(Value::as_str).map(str::to_string))
        .collect()
}
