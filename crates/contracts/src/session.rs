use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{PipelineOutcome, PipelineRun};

/// Terminal runs kept per session for resume replay.
pub const MAX_FINISHED_RUNS: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Active,
    Expired,
    Terminated,
}

impl SessionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            SessionStatus::Active => "active",
            SessionStatus::Expired => "expired",
            SessionStatus::Terminated => "terminated",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "active" => Some(SessionStatus::Active),
            "expired" => Some(SessionStatus::Expired),
            "terminated" => Some(SessionStatus::Terminated),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryMessage {
    pub role: MessageRole,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sql: Option<String>,
    pub created_at: i64,
}

impl HistoryMessage {
    pub fn user(content: impl Into<String>, now_ms: i64) -> Self {
        Self {
            role: MessageRole::User,
            content: content.into(),
            sql: None,
            created_at: now_ms,
        }
    }

    pub fn assistant(content: impl Into<String>, sql: Option<String>, now_ms: i64) -> Self {
        Self {
            role: MessageRole::Assistant,
            content: content.into(),
            sql,
            created_at: now_ms,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub id: String,
    pub principal_id: String,
    pub roles: Vec<String>,
    pub status: SessionStatus,
    pub created_at: i64,
    pub last_activity_at: i64,
    #[serde(default)]
    pub history: Vec<HistoryMessage>,
    #[serde(default)]
    pub pending_pipeline: Option<PipelineRun>,
    #[serde(default)]
    pub finished_runs: Vec<PipelineOutcome>,
    /// Bumped by the store on every successful write; used for compare-and-swap.
    #[serde(default)]
    pub revision: i64,
}

impl Session {
    pub fn new(
        id: impl Into<String>,
        principal_id: impl Into<String>,
        roles: Vec<String>,
        now_ms: i64,
    ) -> Self {
        Self {
            id: id.into(),
            principal_id: principal_id.into(),
            roles,
            status: SessionStatus::Active,
            created_at: now_ms,
            last_activity_at: now_ms,
            history: Vec::new(),
            pending_pipeline: None,
            finished_runs: Vec::new(),
            revision: 0,
        }
    }

    pub fn is_idle_expired(&self, now_ms: i64, idle_timeout: Duration) -> bool {
        let idle_ms = idle_timeout.as_millis().min(i64::MAX as u128) as i64;
        now_ms.saturating_sub(self.last_activity_at) > idle_ms
    }

    /// Applies the lazy expiry check. Returns true when the status changed.
    pub fn expire_if_idle(&mut self, now_ms: i64, idle_timeout: Duration) -> bool {
        if self.status == SessionStatus::Active && self.is_idle_expired(now_ms, idle_timeout) {
            self.status = SessionStatus::Expired;
            return true;
        }
        false
    }

    pub fn touch(&mut self, now_ms: i64) {
        self.last_activity_at = self.last_activity_at.max(now_ms);
    }

    /// Appends to the bounded history, evicting the oldest entries first.
    pub fn append_history(&mut self, message: HistoryMessage, max_history: usize) {
        self.history.push(message);
        let cap = max_history.max(1);
        if self.history.len() > cap {
            let overflow = self.history.len() - cap;
            self.history.drain(..overflow);
        }
    }

    pub fn record_outcome(&mut self, outcome: PipelineOutcome) {
        self.finished_runs
            .retain(|o| o.pipeline_id != outcome.pipeline_id);
        self.finished_runs.push(outcome);
        if self.finished_runs.len() > MAX_FINISHED_RUNS {
            let overflow = self.finished_runs.len() - MAX_FINISHED_RUNS;
            self.finished_runs.drain(..overflow);
        }
    }

    pub fn finished_run(&self, pipeline_id: &str) -> Option<&PipelineOutcome> {
        self.finished_runs
            .iter()
            .find(|o| o.pipeline_id == pipeline_id)
    }

    pub fn reset(&mut self) {
        self.history.clear();
        self.pending_pipeline = None;
        self.finished_runs.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{PipelineStatus, PipelineRun};

    #[test]
    fn history_evicts_oldest_first() {
        let mut session = Session::new("s", "p", vec!["viewer".to_string()], 0);
        for i in 0..12 {
            session.append_history(HistoryMessage::user(format!("q{i}"), i), 10);
        }
        assert_eq!(session.history.len(), 10);
        assert_eq!(session.history[0].content, "q2");
        assert_eq!(session.history[9].content, "q11");
    }

    #[test]
    fn idle_expiry_is_strictly_after_timeout() {
        let mut session = Session::new("s", "p", Vec::new(), 1_000);
        let timeout = Duration::from_secs(60);
        assert!(!session.is_idle_expired(61_000, timeout));
        assert!(session.is_idle_expired(61_001, timeout));

        assert!(session.expire_if_idle(61_001, timeout));
        assert_eq!(session.status, SessionStatus::Expired);
        assert!(!session.expire_if_idle(200_000, timeout));
    }

    #[test]
    fn touch_never_moves_activity_backwards() {
        let mut session = Session::new("s", "p", Vec::new(), 5_000);
        session.touch(4_000);
        assert_eq!(session.last_activity_at, 5_000);
        session.touch(9_000);
        assert_eq!(session.last_activity_at, 9_000);
    }

    #[test]
    fn finished_runs_are_bounded_and_replace_duplicates() {
        let mut session = Session::new("s", "p", Vec::new(), 0);
        for i in 0..(MAX_FINISHED_RUNS + 4) {
            let mut run = PipelineRun::new(format!("p{i}"), "s", "q", 3);
            run.status = PipelineStatus::Cancelled;
            session.record_outcome(crate::PipelineOutcome::from_run(&run, None, None));
        }
        assert_eq!(session.finished_runs.len(), MAX_FINISHED_RUNS);
        assert!(session.finished_run("p0").is_none());
        assert!(session.finished_run("p19").is_some());

        let mut again = PipelineRun::new("p19", "s", "q", 3);
        again.status = PipelineStatus::Failed;
        session.record_outcome(crate::PipelineOutcome::from_run(&again, None, None));
        assert_eq!(session.finished_runs.len(), MAX_FINISHED_RUNS);
        assert_eq!(
            session.finished_run("p19").unwrap().status,
            PipelineStatus::Failed
        );
    }
}
