//! LLM worker
//!
//! Answer service backed by an OpenAI-compatible `/v1/chat/completions` endpoint,
//! typically a local llama-server.

use crate::answer_service::{AnswerService, GeneratedAnswer};
use crate::config::Config;
use crate::context_engine::ContextBundle;
use crate::error::ServiceError;
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info};

#[derive(Debug, Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage>,
    max_tokens: u32,
    temperature: f32,
    stream: bool,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: Option<ChatMessage>,
}

pub struct HttpAnswerService {
    completions_url: String,
    model: String,
    api_key: Option<String>,
    max_tokens: u32,
    temperature: f32,
    timeout: Duration,
    http_client: reqwest::Client,
}

impl HttpAnswerService {
    pub fn new(config: &Config) -> Self {
        info!("Answer service backend: {}", config.service_url);
        Self {
            completions_url: config.completions_url(),
            model: config.service_model.clone(),
            api_key: config.service_api_key.clone(),
            max_tokens: config.service_max_tokens,
            temperature: config.service_temperature,
            timeout: config.service_timeout,
            http_client: reqwest::Client::builder()
                .timeout(config.service_timeout)
                .build()
                .unwrap_or_default(),
        }
    }

    fn request_body<'a>(&'a self, query: &str, context: &ContextBundle) -> ChatCompletionRequest<'a> {
        ChatCompletionRequest {
            model: &self.model,
            messages: vec![
                ChatMessage {
                    role: "system".to_string(),
                    content: context.render_prompt(),
                },
                ChatMessage {
                    role: "user".to_string(),
                    content: query.to_string(),
                },
            ],
            max_tokens: self.max_tokens,
            temperature: self.temperature,
            stream: false,
        }
    }

    fn transport_error(&self, e: reqwest::Error) -> ServiceError {
        if e.is_timeout() {
            ServiceError::Timeout(self.timeout)
        } else {
            ServiceError::Network(e.to_string())
        }
    }
}

fn status_error(status: StatusCode, body: String) -> ServiceError {
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => ServiceError::Auth(format!("{}: {}", status, body)),
        StatusCode::TOO_MANY_REQUESTS => ServiceError::QuotaExceeded(body),
        _ => ServiceError::Network(format!("backend returned {}: {}", status, body)),
    }
}

#[async_trait]
impl AnswerService for HttpAnswerService {
    async fn generate(&self, query: &str, context: &ContextBundle) -> Result<GeneratedAnswer, ServiceError> {
        debug!("Requesting answer ({} context items)", context.items.len());

        let mut request = self
            .http_client
            .post(&self.completions_url)
            .json(&self.request_body(query, context));
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await.map_err(|e| self.transport_error(e))?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(status_error(status, body));
        }

        let body = response.text().await.map_err(|e| self.transport_error(e))?;
        let completion: ChatCompletionResponse = serde_json::from_str(&body)
            .map_err(|e| ServiceError::InvalidResponse(format!("failed to parse completion: {}", e)))?;

        let text = completion
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message)
            .map(|m| m.content.trim().to_string())
            .filter(|t| !t.is_empty())
            .ok_or_else(|| ServiceError::InvalidResponse("completion has no content".to_string()))?;

        Ok(GeneratedAnswer { text, confidence: None })
    }

    fn source_tag(&self) -> String {
        format!("llm:{}", self.model)
    }
}
