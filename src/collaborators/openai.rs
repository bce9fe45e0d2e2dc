use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use super::{GenerationError, GenerationService};
use crate::readings::Prompt;

// OpenAI-compatible chat completions (works against Ollama's /v1 too)
pub struct OpenAiGenerator {
    client: Client,
    url: String,
    api_key: Option<String>,
    model: String,
    max_tokens: u32,
    temperature: f32,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: [ChatMessage<'a>; 2],
    max_tokens: u32,
    temperature: f32,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

impl OpenAiGenerator {
    pub fn new(
        client: Client,
        url: &str,
        api_key: Option<String>,
        model: &str,
        max_tokens: u32,
        temperature: f32,
    ) -> Self {
        Self {
            client,
            url: url.trim_end_matches('/').to_string(),
            api_key,
            model: model.to_string(),
            max_tokens,
            temperature,
        }
    }
}

// first non-blank completion, trimmed
fn extract_reading(body: ChatResponse) -> Result<String, GenerationError> {
    body.choices
        .into_iter()
        .filter_map(|c| c.message.content)
        .map(|content| content.trim().to_string())
        .find(|content| !content.is_empty())
        .ok_or(GenerationError::Empty)
}

#[async_trait]
impl GenerationService for OpenAiGenerator {
    async fn generate(&self, prompt: &Prompt) -> Result<String, GenerationError> {
        let request = ChatRequest {
            model: &self.model,
            messages: [
                ChatMessage {
                    role: "system",
                    content: &prompt.system,
                },
                ChatMessage {
                    role: "user",
                    content: &prompt.user,
                },
            ],
            max_tokens: self.max_tokens,
            temperature: self.temperature,
        };

        let mut builder = self
            .client
            .post(format!("{}/v1/chat/completions", self.url))
            .json(&request);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }

        let res = builder
            .send()
            .await
            .map_err(|e| {
                GenerationError::Upstream(format!("Request failed: {}", e.without_url()))
            })?;

        if !res.status().is_success() {
            return Err(GenerationError::Upstream(format!(
                "Provider returned status {}",
                res.status().as_u16()
            )));
        }

        let body = res
            .json::<ChatResponse>()
            .await
            .map_err(|e| GenerationError::Upstream(format!("Parse Error: {}", e)))?;

        extract_reading(body)
    }
}
