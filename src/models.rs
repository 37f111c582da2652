use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub const HOSTED_TIMEOUT: Duration = Duration::from_secs(60);
pub const LOCAL_DAEMON_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct ModelRequest {
    pub model: String,
    pub system_prompt: String,
    pub user_input: String,
    pub temperature: f64,
    pub max_tokens: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct ModelResponse {
    pub content: String,
    pub model: String,
}

#[async_trait]
pub trait LanguageModel: Send + Sync {
    async fn generate(&self, req: &ModelRequest) -> anyhow::Result<ModelResponse>;
}

fn chat_messages(req: &ModelRequest) -> Vec<serde_json::Value> {
    vec![
        serde_json::json!({"role": "system", "content": req.system_prompt}),
        serde_json::json!({"role": "user", "content": req.user_input}),
    ]
}

#[derive(Clone)]
pub struct OpenAICompatible {
    pub base_url: String,
    pub api_key: Option<String>,
    pub timeout: Duration,
    client: reqwest::Client,
}

impl OpenAICompatible {
    pub fn new(base_url: impl Into<String>, api_key: Option<String>) -> Self {
        Self { base_url: base_url.into(), api_key, timeout: HOSTED_TIMEOUT, client: reqwest::Client::new() }
    }
}

#[derive(Debug, Serialize)]
struct OaiChatRequest<'a> {
    model: &'a str,
    messages: Vec<serde_json::Value>,
    temperature: f64,
    max_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct OaiChatResponse {
    choices: Vec<OaiChoice>,
    #[serde(default)]
    model: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OaiChoice { message: OaiMessage }

#[derive(Debug, Deserialize)]
struct OaiMessage { content: Option<String> }

#[async_trait]
impl LanguageModel for OpenAICompatible {
    async fn generate(&self, req: &ModelRequest) -> anyhow::Result<ModelResponse> {
        let url = format!("{}/chat/completions", self.base_url.trim_end_matches('/'));
        let body = OaiChatRequest {
            model: &req.model,
            messages: chat_messages(req),
            temperature: req.temperature,
            max_tokens: req.max_tokens,
        };
        let mut rb = self.client.post(url).timeout(self.timeout).json(&body);
        if let Some(key) = &self.api_key {
            rb = rb.bearer_auth(key);
        }
        let resp = rb.send().await?;
        if !resp.status().is_success() {
            anyhow::bail!("model call failed: {}", resp.status());
        }
        let v: OaiChatResponse = resp.json().await?;
        let content = v
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| anyhow::anyhow!("model response had no content"))?;
        Ok(ModelResponse { content, model: v.model.unwrap_or_else(|| req.model.clone()) })
    }
}

/// Chat client for a local Ollama-style daemon.
#[derive(Clone)]
pub struct OllamaChat {
    pub base_url: String,
    pub timeout: Duration,
    client: reqwest::Client,
}

impl OllamaChat {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self { base_url: base_url.into(), timeout: LOCAL_DAEMON_TIMEOUT, client: reqwest::Client::new() }
    }
}

#[derive(Debug, Serialize)]
struct OllamaChatRequest<'a> {
    model: &'a str,
    messages: Vec<serde_json::Value>,
    temperature: f64,
    options: OllamaOptions,
    stream: bool,
}

#[derive(Debug, Serialize)]
struct OllamaOptions { num_predict: u32, temperature: f64 }

#[derive(Debug, Deserialize)]
struct OllamaChatResponse { message: OllamaMessage }

#[derive(Debug, Deserialize)]
struct OllamaMessage { content: String }

#[async_trait]
impl LanguageModel for OllamaChat {
    async fn generate(&self, req: &ModelRequest) -> anyhow::Result<ModelResponse> {
        let url = format!("{}/api/chat", self.base_url.trim_end_matches('/'));
        let body = OllamaChatRequest {
            model: &req.model,
            messages: chat_messages(req),
            temperature: req.temperature,
            options: OllamaOptions { num_predict: req.max_tokens, temperature: req.temperature },
            stream: false,
        };
        let resp = self.client.post(url).timeout(self.timeout).json(&body).send().await?;
        if !resp.status().is_success() {
            anyhow::bail!("model call failed: {}", resp.status());
        }
        let v: OllamaChatResponse = resp.json().await?;
        Ok(ModelResponse { content: v.message.content, model: req.model.clone() })
    }
}
