//! LLM Adapter
//! Mission: One chat-completion surface over OpenAI-compatible providers

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::{Duration, Instant};
use tracing::debug;

use crate::error::{CoreError, CoreResult};
use crate::models::ModelConfig;

/// Minimum deadline handed to a provider regardless of scan interval.
const MIN_TIMEOUT: Duration = Duration::from_secs(30);
/// Headroom reserved for the rest of the tick after the LLM call.
const TICK_HEADROOM: Duration = Duration::from_secs(10);

/// The single operation the decision pipeline needs.
#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn complete(&self, system_prompt: &str, user_prompt: &str) -> CoreResult<String>;
}

/// Deadline for one completion given the agent's scan interval.
pub fn completion_timeout(scan_interval: Duration) -> Duration {
    scan_interval
        .checked_sub(TICK_HEADROOM)
        .unwrap_or(MIN_TIMEOUT)
        .max(MIN_TIMEOUT)
}

/// OpenAI-compatible chat client. Provider presets resolve the base URL
/// when the config leaves it blank.
pub struct HttpLlmClient {
    http: reqwest::Client,
    api_key: String,
    base_url: String,
    model: String,
    timeout: Duration,
}

impl HttpLlmClient {
    pub fn from_model_config(
        http: reqwest::Client,
        cfg: &ModelConfig,
        timeout: Duration,
    ) -> CoreResult<Self> {
        if cfg.api_key.is_empty() {
            return Err(CoreError::Config(format!(
                "model config {} has no api key",
                cfg.id
            )));
        }
        let base_url = if !cfg.base_url.is_empty() {
            cfg.base_url.trim_end_matches('/').to_string()
        } else {
            match cfg.provider.to_ascii_lowercase().as_str() {
                "deepseek" => "https://api.deepseek.com/v1".to_string(),
                "qwen" => "https://dashscope.aliyuncs.com/compatible-mode/v1".to_string(),
                other => {
                    return Err(CoreError::Config(format!(
                        "provider {other} needs an explicit base_url"
                    )))
                }
            }
        };
        Ok(Self {
            http,
            api_key: cfg.api_key.clone(),
            base_url,
            model: cfg.model_name.clone(),
            timeout,
        })
    }
}

#[async_trait]
impl LlmClient for HttpLlmClient {
    async fn complete(&self, system_prompt: &str, user_prompt: &str) -> CoreResult<String> {
        let start = Instant::now();
        let req = ChatCompletionRequest {
            model: self.model.clone(),
            messages: vec![
                ChatMessage {
                    role: "system".to_string(),
                    content: system_prompt.to_string(),
                },
                ChatMessage {
                    role: "user".to_string(),
                    content: user_prompt.to_string(),
                },
            ],
            temperature: Some(0.2),
            max_tokens: Some(4096),
        };

        let resp = self
            .http
            .post(format!("{}/chat/completions", self.base_url))
            .timeout(self.timeout)
            .header(
                reqwest::header::AUTHORIZATION,
                format!("Bearer {}", self.api_key),
            )
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .json(&req)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    CoreError::Timeout(format!("llm call after {:?}", start.elapsed()))
                } else {
                    CoreError::from(e)
                }
            })?;

        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();

        if status.as_u16() == 401 || status.as_u16() == 403 {
            return Err(CoreError::Auth(format!("llm {status}")));
        }
        if status.as_u16() == 429 {
            return Err(CoreError::RateLimit(format!("llm {status}")));
        }
        if !status.is_success() {
            let snippet: String = body.chars().take(400).collect();
            return Err(CoreError::Provider(format!("llm {status}: {snippet}")));
        }

        let parsed: ChatCompletionResponse = serde_json::from_str(&body)
            .map_err(|e| CoreError::Provider(format!("llm json parse: {e}")))?;
        let content = parsed
            .choices
            .first()
            .and_then(|c| c.message.as_ref())
            .map(|m| m.content.clone())
            .unwrap_or_default();

        debug!(
            model = %self.model,
            latency_ms = start.elapsed().as_millis() as u64,
            "completion returned"
        );
        Ok(content)
    }
}

#[derive(Debug, Clone, Serialize)]
struct ChatCompletionRequest {
    model: String,
    messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
}

#[derive(Debug, Clone, Serialize)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Debug, Clone, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Clone, Deserialize)]
struct ChatChoice {
    message: Option<ChatMessageOut>,
}

#[derive(Debug, Clone, Deserialize)]
struct ChatMessageOut {
    content: String,
}

/// Scripted client for tests: pops queued responses, then holds.
pub struct MockLlm {
    responses: Mutex<VecDeque<CoreResult<String>>>,
}

impl Default for MockLlm {
    fn default() -> Self {
        Self::new()
    }
}

impl MockLlm {
    pub fn new() -> Self {
        Self {
            responses: Mutex::new(VecDeque::new()),
        }
    }

    pub fn push_response(&self, text: &str) {
        self.responses.lock().push_back(Ok(text.to_string()));
    }

    pub fn push_error(&self, err: CoreError) {
        self.responses.lock().push_back(Err(err));
    }
}

#[async_trait]
impl LlmClient for MockLlm {
    async fn complete(&self, _system_prompt: &str, _user_prompt: &str) -> CoreResult<String> {
        match self.responses.lock().pop_front() {
            Some(r) => r,
            None => Err(CoreError::Timeout("no scripted response".into())),
        }
    }
}
