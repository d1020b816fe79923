//! The reconstruction provider: a language model asked to reassemble obfuscated addresses.
use async_trait::async_trait;
use reqwest::header;
use serde::{Deserialize, Serialize};

use crate::error::ReconstructionError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconstructionRequest {
    pub system_prompt: String,
    pub user_text: String,
    pub model: String,
}

/// The provider's answer, one entry per line of text.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconstructionResponse {
    pub lines: Vec<String>,
}

impl ReconstructionResponse {
    pub fn from_text(text: &str) -> Self {
        Self {
            lines: text
                .lines()
                .map(str::trim)
                .filter(|line| !line.is_empty())
                .map(String::from)
                .collect(),
        }
    }
}

/// Timeouts are enforced by the caller, implementations may take as long as they like.
#[async_trait]
pub trait ReconstructionProvider: Send + Sync {
    async fn complete(
        &self,
        request: ReconstructionRequest,
    ) -> Result<ReconstructionResponse, ReconstructionError>;
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: [ChatMessage<'a>; 2],
    temperature: f32,
}

#[derive(Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Deserialize)]
struct ChatChoiceMessage {
    content: Option<String>,
}

/// Talks to an OpenAI compatible chat completion endpoint.
pub struct ChatCompletionProvider {
    client: reqwest::Client,
    url: reqwest::Url,
    api_key: String,
}

impl ChatCompletionProvider {
    pub fn new(
        client: reqwest::Client,
        base_url: &str,
        api_key: &str,
    ) -> Result<Self, url::ParseError> {
        let url = reqwest::Url::parse(&format!(
            "{}/chat/completions",
            base_url.trim_end_matches('/')
        ))?;

        Ok(Self {
            client,
            url,
            api_key: api_key.to_owned(),
        })
    }
}

#[async_trait]
impl ReconstructionProvider for ChatCompletionProvider {
    async fn complete(
        &self,
        request: ReconstructionRequest,
    ) -> Result<ReconstructionResponse, ReconstructionError> {
        let body = ChatCompletionRequest {
            model: &request.model,
            messages: [
                ChatMessage {
                    role: "system",
                    content: &request.system_prompt,
                },
                ChatMessage {
                    role: "user",
                    content: &request.user_text,
                },
            ],
            temperature: 0.0,
        };

        let response = self
            .client
            .post(self.url.clone())
            .header(header::AUTHORIZATION, format!("Bearer {}", self.api_key))
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(ReconstructionError::StatusError(status));
        }

        let completion: ChatCompletionResponse = response
            .json()
            .await
            .map_err(|e| ReconstructionError::MalformedResponse(e.to_string()))?;

        let content = completion
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .ok_or_else(|| ReconstructionError::MalformedResponse("no choices".to_owned()))?;

        Ok(ReconstructionResponse::from_text(&content))
    }
}
