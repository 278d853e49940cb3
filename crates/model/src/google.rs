use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::{ClientSettings, LanguageModel, ModelError, Prompt};

pub struct GoogleModel {
    http: reqwest::Client,
    settings: ClientSettings,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateRequest<'a> {
    system_instruction: Content<'a>,
    contents: [Content<'a>; 1],
    generation_config: GenerationConfig,
}

#[derive(Serialize)]
struct Content<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    role: Option<&'static str>,
    parts: [Part<'a>; 1],
}

#[derive(Serialize)]
struct Part<'a> {
    text: &'a str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    temperature: f32,
    max_output_tokens: u32,
}

#[derive(Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Deserialize)]
struct Candidate {
    #[serde(default)]
    content: Option<CandidateContent>,
}

#[derive(Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<CandidatePart>,
}

#[derive(Deserialize)]
struct CandidatePart {
    #[serde(default)]
    text: Option<String>,
}

impl GoogleModel {
    pub(crate) fn new(http: reqwest::Client, settings: ClientSettings) -> Self {
        Self { http, settings }
    }
}

#[async_trait]
impl LanguageModel for GoogleModel {
    fn name(&self) -> &str {
        &self.settings.model
    }

    async fn generate(&self, prompt: &Prompt) -> Result<String, ModelError> {
        let request = GenerateRequest {
            system_instruction: Content {
                role: None,
                parts: [Part {
                    text: &prompt.system,
                }],
            },
            contents: [Content {
                role: Some("user"),
                parts: [Part { text: &prompt.user }],
            }],
            generation_config: GenerationConfig {
                temperature: self.settings.temperature,
                max_output_tokens: self.settings.max_tokens,
            },
        };

        // The key goes in a header so it never shows up in logged URLs.
        let resp = self
            .http
            .post(format!(
                "{}/models/{}:generateContent",
                self.settings.base_url, self.settings.model
            ))
            .header("x-goog-api-key", &self.settings.api_key)
            .json(&request)
            .send()
            .await?;

        if !resp.status().is_success() {
            return Err(ModelError::BadStatus(resp.status().as_u16()));
        }

        let body = resp
            .json::<GenerateResponse>()
            .await
            .map_err(|_| ModelError::InvalidResponse)?;

        let text = body
            .candidates
            .into_iter()
            .next()
            .and_then(|c| c.content)
            .map(|c| {
                c.parts
                    .into_iter()
                    .filter_map(|p| p.text)
                    .collect::<Vec<_>>()
                    .join("")
            })
            .unwrap_or_default();

        if text.is_empty() {
            return Err(ModelError::Empty);
        }
        Ok(text)
    }
}
