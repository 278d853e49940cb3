use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::{ClientSettings, LanguageModel, ModelError, Prompt};

const API_VERSION: &str = "2023-06-01";

pub struct AnthropicModel {
    http: reqwest::Client,
    settings: ClientSettings,
}

#[derive(Serialize)]
struct MessagesRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    temperature: f32,
    system: &'a str,
    messages: [UserMessage<'a>; 1],
}

#[derive(Serialize)]
struct UserMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Deserialize)]
struct MessagesResponse {
    #[serde(default)]
    content: Vec<ContentBlock>,
}

#[derive(Deserialize)]
struct ContentBlock {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    text: Option<String>,
}

impl AnthropicModel {
    pub(crate) fn new(http: reqwest::Client, settings: ClientSettings) -> Self {
        Self { http, settings }
    }
}

#[async_trait]
impl LanguageModel for AnthropicModel {
    fn name(&self) -> &str {
        &self.settings.model
    }

    async fn generate(&self, prompt: &Prompt) -> Result<String, ModelError> {
        let request = MessagesRequest {
            model: &self.settings.model,
            max_tokens: self.settings.max_tokens,
            temperature: self.settings.temperature,
            system: &prompt.system,
            messages: [UserMessage {
                role: "user",
                content: &prompt.user,
            }],
        };

        let resp = self
            .http
            .post(format!("{}/messages", self.settings.base_url))
            .header("x-api-key", &self.settings.api_key)
            .header("anthropic-version", API_VERSION)
            .json(&request)
            .send()
            .await?;

        if !resp.status().is_success() {
            return Err(ModelError::BadStatus(resp.status().as_u16()));
        }

        let body = resp
            .json::<MessagesResponse>()
            .await
            .map_err(|_| ModelError::InvalidResponse)?;

        let text = body
            .content
            .into_iter()
            .filter(|block| block.kind == "text")
            .filter_map(|block| block.text)
            .collect::<Vec<_>>()
            .join("");

        if text.is_empty() {
            return Err(ModelError::Empty);
        }
        Ok(text)
    }
}
