use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use crate::{LanguageModel, ModelError, Prompt, PromptPurpose};

/// Offline model used when `SQLGATE_MODEL_PROVIDER=mock`. Answers every
/// purpose with a fixed, gate-passing reply.
#[derive(Debug, Clone, Copy, Default)]
pub struct DevModel;

#[async_trait]
impl LanguageModel for DevModel {
    fn name(&self) -> &str {
        "dev-mock"
    }

    async fn generate(&self, prompt: &Prompt) -> Result<String, ModelError> {
        let text = match prompt.purpose {
            PromptPurpose::Generate => {
                "SQL:\n```sql\nSELECT 1 AS ok\n```\nExplanation: Returns a constant row."
            }
            PromptPurpose::Audit => "SAFE",
            PromptPurpose::PermissionCheck => "NO",
        };
        Ok(text.to_string())
    }
}

#[derive(Debug, Clone)]
enum Scripted {
    Reply(String),
    Fail,
}

#[derive(Default)]
struct ScriptState {
    queues: HashMap<PromptPurpose, VecDeque<Scripted>>,
    fallbacks: HashMap<PromptPurpose, String>,
    calls: Vec<Prompt>,
}

/// Test double that plays back queued replies per purpose and records every
/// prompt it receives. When a queue is empty the purpose's fallback is used,
/// otherwise the call fails with [`ModelError::Empty`].
#[derive(Default)]
pub struct ScriptedModel {
    state: Mutex<ScriptState>,
    delay: Option<Duration>,
}

impl ScriptedModel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reply(self, purpose: PromptPurpose, text: impl Into<String>) -> Self {
        self.push(purpose, Scripted::Reply(text.into()));
        self
    }

    /// Queues a failed call (surfaces as a 503 from the provider).
    pub fn fail(self, purpose: PromptPurpose) -> Self {
        self.push(purpose, Scripted::Fail);
        self
    }

    pub fn fallback(self, purpose: PromptPurpose, text: impl Into<String>) -> Self {
        if let Ok(mut state) = self.state.lock() {
            state.fallbacks.insert(purpose, text.into());
        }
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn calls(&self) -> Vec<Prompt> {
        self.state
            .lock()
            .map(|state| state.calls.clone())
            .unwrap_or_default()
    }

    pub fn call_count(&self, purpose: PromptPurpose) -> usize {
        self.state
            .lock()
            .map(|state| state.calls.iter().filter(|p| p.purpose == purpose).count())
            .unwrap_or(0)
    }

    fn push(&self, purpose: PromptPurpose, entry: Scripted) {
        if let Ok(mut state) = self.state.lock() {
            state.queues.entry(purpose).or_default().push_back(entry);
        }
    }

    fn next(&self, prompt: &Prompt) -> Result<String, ModelError> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| ModelError::NotConfigured("scripted model lock poisoned"))?;
        state.calls.push(prompt.clone());

        let queued = state
            .queues
            .get_mut(&prompt.purpose)
            .and_then(VecDeque::pop_front);
        match queued {
            Some(Scripted::Reply(text)) => Ok(text),
            Some(Scripted::Fail) => Err(ModelError::BadStatus(503)),
            None => state
                .fallbacks
                .get(&prompt.purpose)
                .cloned()
                .ok_or(ModelError::Empty),
        }
    }
}

#[async_trait]
impl LanguageModel for ScriptedModel {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn generate(&self, prompt: &Prompt) -> Result<String, ModelError> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.next(prompt)
    }
}
