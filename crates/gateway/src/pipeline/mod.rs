//! Question-to-result orchestration.
//!
//! A chat turn generates and validates a candidate query, then suspends it on
//! the session as `awaiting_approval`. A later, independent resume call loads
//! that persisted run and either cancels or executes it. Nothing here keeps
//! authoritative state in memory between the two.

pub mod generator;
pub mod precheck;


use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use serde::Serialize;
use sqlgate_auth::Principal;
use sqlgate_contracts::{
    ErrorBody, ErrorCode, ExecutionResult, GateFailure, GateKind, HistoryMessage,
    InvalidTransition, PipelineOutcome, PipelineRun, PipelineStatus, RetryDecision, SchemaSnapshot,
    SessionStatus, StreamEvent, TableInfo, unix_epoch_ms_now,
};
use sqlgate_guard::{keyword, semantic, structural};
use sqlgate_ledger::{Change, modify_session};
use sqlgate_model::{LanguageModel, ModelError, ModelSet, Prompt};
use tokio::sync::mpsc;
use tracing::Instrument;
use ulid::Ulid;

use crate::catalog::{self, SchemaCatalog};
use crate::config::GatewayConfig;
use crate::executor::{ExecutionLimits, SqlExecutor, execute_traced};
use crate::format;
use crate::permissions::{self, AccessResolver};
use crate::sessions::{CAS_ATTEMPTS, SessionManager};

use self::generator::{Candidate, Generation, GenerationInput};

const CANCELLED_NOTE: &str = "The query was cancelled.";
const CONFIRM_MESSAGE: &str = "Review the query above and approve it to run it against the database.";

#[derive(Debug, Clone, Copy)]
pub struct PipelineSettings {
    pub max_attempts: u32,
    pub limits: ExecutionLimits,
    pub semantic_gate_enabled: bool,
    pub permission_precheck_enabled: bool,
    pub auto_approve: bool,
}

impl PipelineSettings {
    pub fn from_config(config: &GatewayConfig) -> Self {
        Self {
            max_attempts: config.max_generation_attempts,
            limits: ExecutionLimits {
                timeout: config.query_timeout(),
                max_rows: config.max_result_rows,
            },
            semantic_gate_enabled: config.semantic_gate_enabled,
            permission_precheck_enabled: config.permission_precheck_enabled,
            auto_approve: config.auto_approve,
        }
    }
}

pub struct PipelineDeps {
    pub sessions: SessionManager,
    pub catalog: Arc<SchemaCatalog>,
    pub access: AccessResolver,
    pub models: ModelSet,
    pub executor: Arc<dyn SqlExecutor>,
}

#[derive(Debug, Clone)]
pub struct RequestIds {
    pub request_id: String,
    pub trace_id: String,
}

#[derive(Debug, Clone)]
pub struct TurnRequest {
    pub question: String,
    pub session_id: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ConfirmRequest {
    pub session_id: String,
    pub pipeline_id: String,
    pub approved: bool,
    /// Caller's edit of the proposed query; it replaces the candidate only
    /// after clearing the deterministic gates again.
    pub modified_query: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfirmResponse {
    pub success: bool,
    pub pipeline_id: String,
    pub status: PipelineStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<ExecutionResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
}

impl From<PipelineOutcome> for ConfirmResponse {
    fn from(outcome: PipelineOutcome) -> Self {
        Self {
            success: outcome.error.is_none(),
            pipeline_id: outcome.pipeline_id,
            status: outcome.status,
            result: outcome.result,
            error: outcome.error,
        }
    }
}

/// The caller went away; the turn stops at the next await point.
#[derive(Debug)]
pub struct Disconnected;

/// Ordered event channel for one chat turn.
pub struct EventSink {
    tx: mpsc::Sender<StreamEvent>,
}

impl EventSink {
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<StreamEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }

    pub async fn emit(&self, event: StreamEvent) -> Result<(), Disconnected> {
        self.tx.send(event).await.map_err(|_| Disconnected)
    }

    /// Races `fut` against the receiver being dropped.
    pub async fn guard<F: Future>(&self, fut: F) -> Result<F::Output, Disconnected> {
        tokio::select! {
            biased;
            _ = self.tx.closed() => Err(Disconnected),
            out = fut => Ok(out),
        }
    }
}

/// Counts model calls by purpose and outcome.
struct MeteredModel {
    inner: Arc<dyn LanguageModel>,
}

#[async_trait]
impl LanguageModel for MeteredModel {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn generate(&self, prompt: &Prompt) -> Result<String, ModelError> {
        let result = self.inner.generate(prompt).await;
        crate::metrics::observe_model_call(
            prompt.purpose.as_str(),
            if result.is_ok() { "ok" } else { "error" },
        );
        result
    }
}

enum Stop {
    Failed(ErrorBody),
    Disconnected,
}

impl From<Disconnected> for Stop {
    fn from(_: Disconnected) -> Self {
        Stop::Disconnected
    }
}

impl From<InvalidTransition> for Stop {
    fn from(err: InvalidTransition) -> Self {
        tracing::error!(error = %err, "pipeline state machine violation");
        Stop::Failed(ErrorBody::from_code(ErrorCode::Internal))
    }
}

enum Advance {
    Suspended,
    Executed(Result<ExecutionResult, ErrorBody>),
}

enum Attempt {
    Passed(Candidate, Vec<String>),
    Rejected(GateKind, String),
}

enum Claim {
    Replay(PipelineOutcome),
    Reject(ErrorCode),
    Cancel(PipelineRun),
    Execute(PipelineRun),
}

struct Inner {
    settings: PipelineSettings,
    sessions: SessionManager,
    catalog: Arc<SchemaCatalog>,
    access: AccessResolver,
    models: ModelSet,
    executor: Arc<dyn SqlExecutor>,
}

#[derive(Clone)]
pub struct Pipeline {
    inner: Arc<Inner>,
}

impl Pipeline {
    pub fn new(settings: PipelineSettings, deps: PipelineDeps) -> Self {
        let models = ModelSet {
            chat: Arc::new(MeteredModel {
                inner: deps.models.chat,
            }),
            fast: Arc::new(MeteredModel {
                inner: deps.models.fast,
            }),
        };
        Self {
            inner: Arc::new(Inner {
                settings,
                sessions: deps.sessions,
                catalog: deps.catalog,
                access: deps.access,
                models,
                executor: deps.executor,
            }),
        }
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.inner.settings
    }

    pub fn sessions(&self) -> &SessionManager {
        &self.inner.sessions
    }

    pub fn catalog(&self) -> &SchemaCatalog {
        &self.inner.catalog
    }

    pub fn access(&self) -> &AccessResolver {
        &self.inner.access
    }

    pub fn executor(&self) -> &dyn SqlExecutor {
        self.inner.executor.as_ref()
    }

    /// Runs one chat turn, writing its events to `sink`. The last event is
    /// always `done` unless the caller disconnected.
    pub async fn run_turn(
        &self,
        principal: Principal,
        request: TurnRequest,
        ids: RequestIds,
        sink: EventSink,
    ) {
        let span = tracing::info_span!(
            "chat.turn",
            request_id = %ids.request_id,
            trace_id = %ids.trace_id,
            principal_id = %principal.principal_id,
            session_id = tracing::field::Empty,
            pipeline_id = tracing::field::Empty,
            attempt = tracing::field::Empty,
            latency_ms = tracing::field::Empty,
            outcome = tracing::field::Empty,
        );
        let started = Instant::now();

        async move {
            let outcome = self.turn(&principal, request, &sink).await;
            tracing::Span::current().record("latency_ms", started.elapsed().as_millis() as u64);
            tracing::Span::current().record("outcome", outcome);
        }
        .instrument(span)
        .await
    }

    async fn turn(&self, principal: &Principal, request: TurnRequest, sink: &EventSink) -> &'static str {
        let session = match self
            .inner
            .sessions
            .open_for_turn(principal, request.session_id.as_deref())
            .await
        {
            Ok(session) => session,
            Err(err) => {
                tracing::error!(error = %err, "session store unavailable");
                let body = ErrorBody::from_code(ErrorCode::StoreUnavailable);
                let _ = sink.emit(StreamEvent::error(body.code, body.message)).await;
                let _ = sink
                    .emit(StreamEvent::Done {
                        awaiting_approval: false,
                    })
                    .await;
                return "store_unavailable";
            }
        };
        tracing::Span::current().record("session_id", session.id.as_str());

        if sink
            .emit(StreamEvent::Session {
                session_id: session.id.clone(),
            })
            .await
            .is_err()
        {
            return "disconnected";
        }

        let mut run = PipelineRun::new(
            Ulid::new().to_string(),
            session.id.clone(),
            request.question.trim(),
            self.inner.settings.max_attempts,
        );
        tracing::Span::current().record("pipeline_id", run.id.as_str());

        let history = match self.begin_turn(&session.id, &run).await {
            Ok(history) => history,
            Err(body) => {
                let _ = sink.emit(StreamEvent::error(body.code, body.message)).await;
                let _ = sink
                    .emit(StreamEvent::Done {
                        awaiting_approval: false,
                    })
                    .await;
                return "store_unavailable";
            }
        };

        let advanced = match sink.emit(StreamEvent::status(PipelineStatus::Generating)).await {
            Ok(()) => self.advance(principal, &session.id, &mut run, &history, sink).await,
            Err(Disconnected) => Err(Stop::Disconnected),
        };
        tracing::Span::current().record("attempt", run.attempt);

        match advanced {
            Ok(Advance::Suspended) => "awaiting_approval",
            Ok(Advance::Executed(outcome)) => {
                let record = self.finalize(&session.id, &mut run, outcome).await;
                let status = record.status;
                match (record.result, record.error) {
                    (_, Some(error)) => {
                        let _ = sink.emit(StreamEvent::error(error.code, error.message)).await;
                    }
                    (Some(data), None) => {
                        let _ = sink.emit(StreamEvent::Result { data }).await;
                    }
                    (None, None) => {}
                }
                let _ = sink.emit(StreamEvent::status(status)).await;
                let _ = sink
                    .emit(StreamEvent::Done {
                        awaiting_approval: false,
                    })
                    .await;
                status.as_str()
            }
            Err(Stop::Failed(body)) => {
                self.record_failure(&session.id, &mut run, body.clone()).await;
                let _ = sink.emit(StreamEvent::error(body.code, body.message)).await;
                let _ = sink.emit(StreamEvent::status(PipelineStatus::Failed)).await;
                let _ = sink
                    .emit(StreamEvent::Done {
                        awaiting_approval: false,
                    })
                    .await;
                "failed"
            }
            Err(Stop::Disconnected) => {
                self.abandon(&session.id, &mut run).await;
                "disconnected"
            }
        }
    }

    /// Supersedes a pending run and appends the question. Returns the history
    /// as it was before this turn.
    async fn begin_turn(
        &self,
        session_id: &str,
        run: &PipelineRun,
    ) -> Result<Vec<HistoryMessage>, ErrorBody> {
        let now = unix_epoch_ms_now();
        let max_history = self.inner.sessions.max_history();
        let updated = modify_session(
            self.inner.sessions.store(),
            session_id,
            CAS_ATTEMPTS,
            |session| {
                let prior = session.history.clone();
                let mut superseded = None;
                if let Some(mut pending) = session.pending_pipeline.take() {
                    if pending.status == PipelineStatus::AwaitingApproval
                        && pending.transition(PipelineStatus::Cancelled).is_ok()
                    {
                        session.record_outcome(PipelineOutcome::from_run(&pending, None, None));
                        superseded = Some(pending.id);
                    } else {
                        session.pending_pipeline = Some(pending);
                    }
                }
                session.append_history(HistoryMessage::user(run.question.clone(), now), max_history);
                session.touch(now);
                Change::Write((prior, superseded))
            },
        )
        .await;

        match updated {
            Ok(Some((_, (prior, superseded)))) => {
                if let Some(pipeline_id) = superseded {
                    tracing::info!(superseded_pipeline_id = %pipeline_id, "pending query superseded by a new question");
                    crate::metrics::observe_pipeline_outcome(PipelineStatus::Cancelled.as_str(), "");
                }
                Ok(prior)
            }
            Ok(None) => Err(ErrorBody::from_code(ErrorCode::SessionNotFound)),
            Err(err) => {
                tracing::error!(error = %err, "failed to record question on session");
                Err(ErrorBody::from_code(ErrorCode::StoreUnavailable))
            }
        }
    }

    async fn advance(
        &self,
        principal: &Principal,
        session_id: &str,
        run: &mut PipelineRun,
        history: &[HistoryMessage],
        sink: &EventSink,
    ) -> Result<Advance, Stop> {
        let settings = self.inner.settings;

        let access = sink
            .guard(self.inner.access.resolve(&principal.roles))
            .await?
            .map_err(|err| {
                tracing::error!(error = %err, "permission lookup failed");
                Stop::Failed(ErrorBody::from_code(ErrorCode::SchemaUnavailable))
            })?;
        let full = sink.guard(self.inner.catalog.snapshot()).await?.map_err(|err| {
            tracing::error!(error = %err, "schema unavailable for turn");
            Stop::Failed(ErrorBody::from_code(ErrorCode::SchemaUnavailable))
        })?;
        let schema = full.filter(&access);
        run.schema_version = Some(schema.version.clone());

        if settings.permission_precheck_enabled && !self.inner.access.is_admin(&principal.roles) {
            let (accessible, inaccessible): (Vec<&TableInfo>, Vec<&TableInfo>) =
                full.tables.iter().partition(|t| access.allows(&t.name));
            if !inaccessible.is_empty()
                && sink
                    .guard(precheck::needs_inaccessible(
                        self.inner.models.fast.as_ref(),
                        &run.question,
                        &accessible,
                        &inaccessible,
                    ))
                    .await?
            {
                tracing::info!("question needs tables outside the caller's view");
                return Err(Stop::Failed(ErrorBody::from_code(ErrorCode::PermissionDenied)));
            }
        }

        let schema_text = catalog::prompt_text(&schema);
        let mut hint: Option<String> = None;
        let (candidate, tables) = loop {
            let span = tracing::info_span!(
                "pipeline.attempt",
                pipeline_id = %run.id,
                attempt = run.attempt,
                outcome = tracing::field::Empty,
            );
            let step = self
                .attempt(run, &schema, &schema_text, history, hint.as_deref(), sink)
                .instrument(span.clone())
                .await?;

            match step {
                Attempt::Passed(candidate, tables) => {
                    span.record("outcome", "pass");
                    break (candidate, tables);
                }
                Attempt::Rejected(gate, reason) => {
                    span.record("outcome", gate.as_str());
                    crate::metrics::observe_gate_rejection(gate.as_str());
                    tracing::info!(
                        pipeline_id = %run.id,
                        attempt = run.attempt,
                        gate = gate.as_str(),
                        reason = %reason,
                        "candidate query rejected"
                    );
                    match run.record_gate_failure(gate, reason)? {
                        RetryDecision::Retry { hint: next } => {
                            hint = Some(next);
                            sink.emit(StreamEvent::status_with(
                                PipelineStatus::Generating,
                                format!("retrying (attempt {} of {})", run.attempt, run.max_attempts),
                            ))
                            .await?;
                        }
                        RetryDecision::Exhausted => {
                            return Err(Stop::Failed(exhaustion_error(run)));
                        }
                    }
                }
            }
        };

        sink.emit(StreamEvent::QueryPreview {
            sql: candidate.sql.clone(),
            explanation: candidate.explanation.clone(),
        })
        .await?;
        run.await_approval(candidate.sql, candidate.explanation, tables)?;

        if settings.auto_approve {
            sink.emit(StreamEvent::status(PipelineStatus::Executing)).await?;
            run.transition(PipelineStatus::Executing)?;
            return Ok(Advance::Executed(self.execute_approved(principal, run).await));
        }

        self.suspend(session_id, run).await?;
        crate::metrics::observe_pipeline_outcome(PipelineStatus::AwaitingApproval.as_str(), "");

        let _ = sink.emit(StreamEvent::status(PipelineStatus::AwaitingApproval)).await;
        let _ = sink
            .emit(StreamEvent::ConfirmRequired {
                pipeline_id: run.id.clone(),
                sql: run.candidate_query.clone().unwrap_or_default(),
                explanation: run.explanation.clone().unwrap_or_default(),
                message: CONFIRM_MESSAGE.to_string(),
            })
            .await;
        let _ = sink
            .emit(StreamEvent::Done {
                awaiting_approval: true,
            })
            .await;
        Ok(Advance::Suspended)
    }

    async fn attempt(
        &self,
        run: &mut PipelineRun,
        schema: &SchemaSnapshot,
        schema_text: &str,
        history: &[HistoryMessage],
        hint: Option<&str>,
        sink: &EventSink,
    ) -> Result<Attempt, Stop> {
        let input = GenerationInput {
            question: &run.question,
            history,
            schema_text,
            attempt: run.attempt,
            hint,
        };
        let generation = sink
            .guard(generator::generate(self.inner.models.chat.as_ref(), &input))
            .await?;

        let candidate = match generation {
            Ok(Generation::Candidate(candidate)) => candidate,
            Ok(Generation::Ambiguous(reason)) => {
                tracing::info!(reason = %reason, "question refers to unavailable context");
                return Err(Stop::Failed(ErrorBody::from_code(ErrorCode::AmbiguousQuestion)));
            }
            Err(err) => {
                tracing::warn!(error = %err, "query generation failed");
                return Err(Stop::Failed(ErrorBody::from_code(ErrorCode::GenerationFailed)));
            }
        };
        tracing::debug!(sql = %candidate.sql, "candidate query generated");

        run.transition(PipelineStatus::Validating)?;
        run.candidate_query = Some(candidate.sql.clone());
        run.explanation = Some(candidate.explanation.clone());
        sink.emit(StreamEvent::status(PipelineStatus::Validating)).await?;

        let keyword = keyword::check(&candidate.sql);
        if !keyword.ok {
            return Ok(Attempt::Rejected(
                GateKind::Keyword,
                keyword.reason_or_default().to_string(),
            ));
        }

        let structural = structural::check(&candidate.sql, schema);
        if !structural.ok {
            return Ok(Attempt::Rejected(
                GateKind::Structural,
                structural.reason_or_default().to_string(),
            ));
        }

        let auditor = self
            .inner
            .settings
            .semantic_gate_enabled
            .then(|| self.inner.models.chat.as_ref());
        let semantic = sink
            .guard(semantic::check(auditor, &candidate.sql, &candidate.explanation))
            .await?;
        if !semantic.ok {
            return Ok(Attempt::Rejected(
                GateKind::Semantic,
                semantic.reason_or_default().to_string(),
            ));
        }

        Ok(Attempt::Passed(candidate, structural.referenced_tables))
    }

    /// Persists the run as the session's pending pipeline.
    async fn suspend(&self, session_id: &str, run: &PipelineRun) -> Result<(), Stop> {
        let now = unix_epoch_ms_now();
        let updated = modify_session(
            self.inner.sessions.store(),
            session_id,
            CAS_ATTEMPTS,
            |session| match session.status {
                SessionStatus::Active => {
                    session.pending_pipeline = Some(run.clone());
                    session.touch(now);
                    Change::Write(None)
                }
                SessionStatus::Expired => Change::Discard(Some(ErrorCode::SessionExpired)),
                SessionStatus::Terminated => Change::Discard(Some(ErrorCode::SessionNotFound)),
            },
        )
        .await;

        match updated {
            Ok(Some((_, None))) => Ok(()),
            Ok(Some((_, Some(code)))) => Err(Stop::Failed(ErrorBody::from_code(code))),
            Ok(None) => Err(Stop::Failed(ErrorBody::from_code(ErrorCode::SessionNotFound))),
            Err(err) => {
                tracing::error!(error = %err, "failed to persist pending query");
                Err(Stop::Failed(ErrorBody::from_code(ErrorCode::StoreUnavailable)))
            }
        }
    }

    /// Resumes a suspended run. Replaying a finished run returns its recorded
    /// outcome without executing again.
    pub async fn resume(
        &self,
        principal: &Principal,
        request: ConfirmRequest,
        ids: RequestIds,
    ) -> Result<ConfirmResponse, ErrorCode> {
        let span = tracing::info_span!(
            "confirm.resume",
            request_id = %ids.request_id,
            trace_id = %ids.trace_id,
            principal_id = %principal.principal_id,
            session_id = %request.session_id,
            pipeline_id = %request.pipeline_id,
            approved = request.approved,
            latency_ms = tracing::field::Empty,
            outcome = tracing::field::Empty,
        );
        let started = Instant::now();

        async move {
            let result = self.resume_inner(principal, &request).await;
            tracing::Span::current().record("latency_ms", started.elapsed().as_millis() as u64);
            match &result {
                Ok(response) => tracing::Span::current().record("outcome", response.status.as_str()),
                Err(code) => tracing::Span::current().record("outcome", code.as_str()),
            };
            result
        }
        .instrument(span)
        .await
    }

    async fn resume_inner(
        &self,
        principal: &Principal,
        request: &ConfirmRequest,
    ) -> Result<ConfirmResponse, ErrorCode> {
        let now = unix_epoch_ms_now();
        let idle_timeout = self.inner.sessions.idle_timeout();
        let max_history = self.inner.sessions.max_history();

        let claimed = modify_session(
            self.inner.sessions.store(),
            &request.session_id,
            CAS_ATTEMPTS,
            |session| {
                if session.principal_id != principal.principal_id
                    || session.status == SessionStatus::Terminated
                {
                    return Change::Discard(Claim::Reject(ErrorCode::SessionNotFound));
                }
                if session.status == SessionStatus::Expired {
                    return Change::Discard(Claim::Reject(ErrorCode::SessionExpired));
                }
                if session.expire_if_idle(now, idle_timeout) {
                    return Change::Write(Claim::Reject(ErrorCode::SessionExpired));
                }
                if let Some(outcome) = session.finished_run(&request.pipeline_id) {
                    return Change::Discard(Claim::Replay(outcome.clone()));
                }

                let Some(pending) = session
                    .pending_pipeline
                    .as_ref()
                    .filter(|p| p.id == request.pipeline_id)
                else {
                    return Change::Discard(Claim::Reject(ErrorCode::PipelineNotFound));
                };
                if pending.status == PipelineStatus::Executing {
                    return Change::Discard(Claim::Reject(ErrorCode::PipelineInProgress));
                }

                let mut run = pending.clone();
                if !request.approved {
                    if run.transition(PipelineStatus::Cancelled).is_err() {
                        return Change::Discard(Claim::Reject(ErrorCode::PipelineNotFound));
                    }
                    session.pending_pipeline = None;
                    session.record_outcome(PipelineOutcome::from_run(&run, None, None));
                    session.append_history(
                        HistoryMessage::assistant(CANCELLED_NOTE, run.candidate_query.clone(), now),
                        max_history,
                    );
                    session.touch(now);
                    return Change::Write(Claim::Cancel(run));
                }

                if run.transition(PipelineStatus::Executing).is_err() {
                    return Change::Discard(Claim::Reject(ErrorCode::PipelineNotFound));
                }
                session.pending_pipeline = Some(run.clone());
                session.touch(now);
                Change::Write(Claim::Execute(run))
            },
        )
        .await
        .map_err(|err| {
            tracing::error!(error = %err, "failed to load session for resume");
            ErrorCode::StoreUnavailable
        })?;

        let Some((_, claim)) = claimed else {
            return Err(ErrorCode::SessionNotFound);
        };

        match claim {
            Claim::Replay(outcome) => {
                tracing::info!(status = outcome.status.as_str(), "replaying finished query");
                Ok(outcome.into())
            }
            Claim::Reject(code) => {
                tracing::info!(code = code.as_str(), "resume rejected");
                Err(code)
            }
            Claim::Cancel(run) => {
                tracing::info!("query cancelled by the caller");
                crate::metrics::observe_pipeline_outcome(PipelineStatus::Cancelled.as_str(), "");
                Ok(ConfirmResponse {
                    success: true,
                    pipeline_id: run.id,
                    status: run.status,
                    result: None,
                    error: None,
                })
            }
            Claim::Execute(mut run) => {
                let outcome = match request.modified_query.as_deref() {
                    Some(edited) => match self.accept_edit(principal, &mut run, edited).await {
                        Ok(()) => self.execute_approved(principal, &run).await,
                        Err(error) => Err(error),
                    },
                    None => self.execute_approved(principal, &run).await,
                };
                Ok(self
                    .finalize(&request.session_id, &mut run, outcome)
                    .await
                    .into())
            }
        }
    }

    /// Runs an edited query through the keyword and structural gates and the
    /// deterministic semantic rules against the caller's current view. On
    /// success the edit becomes the run's candidate.
    async fn accept_edit(
        &self,
        principal: &Principal,
        run: &mut PipelineRun,
        edited: &str,
    ) -> Result<(), ErrorBody> {
        let access = self
            .inner
            .access
            .resolve(&principal.roles)
            .await
            .map_err(|err| {
                tracing::error!(error = %err, "permission lookup failed for edited query");
                ErrorBody::from_code(ErrorCode::SchemaUnavailable)
            })?;
        let full = self.inner.catalog.snapshot().await.map_err(|err| {
            tracing::error!(error = %err, "schema unavailable for edited query");
            ErrorBody::from_code(ErrorCode::SchemaUnavailable)
        })?;
        let schema = full.filter(&access);

        let keyword = keyword::check(edited);
        if !keyword.ok {
            return Err(edit_rejected(GateKind::Keyword, keyword.reason_or_default()));
        }
        let structural = structural::check(edited, &schema);
        if !structural.ok {
            return Err(edit_rejected(GateKind::Structural, structural.reason_or_default()));
        }
        if let Some(reason) = semantic::prefilter(edited) {
            return Err(edit_rejected(GateKind::Semantic, &reason));
        }

        tracing::info!(
            tables = ?structural.referenced_tables,
            "edited query accepted"
        );
        run.candidate_query = Some(edited.trim().to_string());
        run.referenced_tables = structural.referenced_tables;
        Ok(())
    }

    /// Re-checks the caller's access to every referenced table, then runs the
    /// approved query.
    async fn execute_approved(
        &self,
        principal: &Principal,
        run: &PipelineRun,
    ) -> Result<ExecutionResult, ErrorBody> {
        let access = self
            .inner
            .access
            .resolve(&principal.roles)
            .await
            .map_err(|err| {
                tracing::error!(error = %err, "permission re-check failed to load");
                ErrorBody::from_code(ErrorCode::ExecutionError)
            })?;
        if let Some(table) = permissions::first_denied(&access, &run.referenced_tables) {
            tracing::warn!(table = %table, "permission re-check denied an approved query");
            return Err(ErrorBody::from_code(ErrorCode::PermissionDenied));
        }

        let Some(sql) = run.candidate_query.as_deref().filter(|s| !s.trim().is_empty()) else {
            tracing::error!("approved run has no candidate query");
            return Err(ErrorBody::from_code(ErrorCode::Internal));
        };

        execute_traced(
            self.inner.executor.as_ref(),
            &run.id,
            sql,
            self.inner.settings.limits,
        )
        .await
        .map_err(|failure| failure.error_body())
    }

    /// Moves an executing run to its terminal status and records it on the
    /// session.
    async fn finalize(
        &self,
        session_id: &str,
        run: &mut PipelineRun,
        outcome: Result<ExecutionResult, ErrorBody>,
    ) -> PipelineOutcome {
        let (result, error) = match outcome {
            Ok(result) => (Some(result), None),
            Err(error) => (None, Some(error)),
        };
        let next = if error.is_none() {
            PipelineStatus::Completed
        } else {
            PipelineStatus::Failed
        };
        if let Err(err) = run.transition(next) {
            tracing::error!(error = %err, "pipeline state machine violation");
        }

        let summary = match (&result, &error) {
            (_, Some(error)) => error.message.clone(),
            (Some(result), None) => format::result_markdown(result),
            (None, None) => String::new(),
        };
        let record = PipelineOutcome::from_run(run, result, error);
        self.record_terminal(session_id, &record, summary, run.candidate_query.clone())
            .await;
        record
    }

    async fn record_failure(&self, session_id: &str, run: &mut PipelineRun, error: ErrorBody) {
        if !run.status.is_terminal()
            && let Err(err) = run.transition(PipelineStatus::Failed)
        {
            tracing::error!(error = %err, "pipeline state machine violation");
        }
        let summary = error.message.clone();
        let record = PipelineOutcome::from_run(run, None, Some(error));
        self.record_terminal(session_id, &record, summary, run.candidate_query.clone())
            .await;
    }

    /// The caller disconnected before execution: the run ends as cancelled.
    async fn abandon(&self, session_id: &str, run: &mut PipelineRun) {
        if run.transition(PipelineStatus::Cancelled).is_err() {
            tracing::warn!(status = run.status.as_str(), "disconnected run could not be cancelled");
            return;
        }
        tracing::info!(pipeline_id = %run.id, "caller disconnected, query cancelled");
        let record = PipelineOutcome::from_run(run, None, None);
        self.record_terminal(session_id, &record, CANCELLED_NOTE.to_string(), None)
            .await;
    }

    async fn record_terminal(
        &self,
        session_id: &str,
        record: &PipelineOutcome,
        summary: String,
        sql: Option<String>,
    ) {
        let code = record.error.as_ref().map(|e| e.code);
        crate::metrics::observe_pipeline_outcome(
            record.status.as_str(),
            code.map(ErrorCode::as_str).unwrap_or(""),
        );
        match code {
            Some(code) if code.is_system_failure() => {
                tracing::error!(pipeline_id = %record.pipeline_id, code = code.as_str(), "query failed")
            }
            Some(code) => {
                tracing::info!(pipeline_id = %record.pipeline_id, code = code.as_str(), "query failed")
            }
            None => {
                tracing::info!(pipeline_id = %record.pipeline_id, status = record.status.as_str(), "query finished")
            }
        }

        let now = unix_epoch_ms_now();
        let max_history = self.inner.sessions.max_history();
        let updated = modify_session(
            self.inner.sessions.store(),
            session_id,
            CAS_ATTEMPTS,
            |session| {
                if session
                    .pending_pipeline
                    .as_ref()
                    .is_some_and(|p| p.id == record.pipeline_id)
                {
                    session.pending_pipeline = None;
                }
                session.record_outcome(record.clone());
                session.append_history(
                    HistoryMessage::assistant(summary.clone(), sql.clone(), now),
                    max_history,
                );
                session.touch(now);
                Change::Write(())
            },
        )
        .await;

        match updated {
            Ok(Some(_)) => {}
            Ok(None) => tracing::warn!(session_id, "session vanished before the outcome was recorded"),
            Err(err) => tracing::error!(error = %err, "failed to record query outcome"),
        }
    }
}

/// Caller-facing wording for a gate rejection.
pub fn gate_message(failure: &GateFailure) -> String {
    match failure.gate {
        GateKind::Semantic => semantic::user_message(&failure.reason).to_string(),
        gate => format!(
            "{}: {}",
            gate.rejection_code().default_message(),
            failure.reason
        ),
    }
}

fn edit_rejected(gate: GateKind, reason: &str) -> ErrorBody {
    tracing::info!(gate = gate.as_str(), reason, "edited query rejected");
    let failure = GateFailure {
        gate,
        reason: reason.to_string(),
    };
    ErrorBody::new(gate.rejection_code(), gate_message(&failure))
}

/// With a single attempt the gate's own code surfaces; otherwise the run
/// failed to produce a safe query at all.
fn exhaustion_error(run: &PipelineRun) -> ErrorBody {
    let Some(failure) = run.last_gate_failure() else {
        return ErrorBody::from_code(ErrorCode::GenerationFailed);
    };
    let detail = gate_message(failure);
    if run.max_attempts <= 1 {
        return ErrorBody::new(failure.gate.rejection_code(), detail);
    }
    ErrorBody::new(
        ErrorCode::GenerationFailed,
        format!(
            "{} (last check: {})",
            ErrorCode::GenerationFailed.default_message(),
            detail
        ),
    )
}
