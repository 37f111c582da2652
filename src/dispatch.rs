use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::models::{LanguageModel, OllamaChat, OpenAICompatible};
use crate::settings::BackendSettings;

pub const PROBE_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BackendKind {
    #[serde(rename = "openai")]
    HostedApi,
    #[serde(rename = "ollama")]
    LocalDaemon,
}

impl BackendKind {
    /// Probe order; the first available kind wins.
    pub const PRIORITY: [BackendKind; 2] = [BackendKind::HostedApi, BackendKind::LocalDaemon];

    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::HostedApi => "openai",
            BackendKind::LocalDaemon => "ollama",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Maps a logical model id onto the naming scheme of `kind`. Unknown ids pass through.
pub fn normalize_model_id(kind: BackendKind, logical: &str) -> String {
    match kind {
        BackendKind::HostedApi => logical.to_string(),
        BackendKind::LocalDaemon => match logical {
            "gpt-4" | "gpt-4o" => "llama3.1:latest".to_string(),
            "gpt-4o-mini" | "gpt-3.5-turbo" => "llama3.1:8b".to_string(),
            other => other.to_string(),
        },
    }
}

pub struct SelectedBackend {
    pub kind: BackendKind,
    pub model: Box<dyn LanguageModel>,
}

impl SelectedBackend {
    pub fn new(kind: BackendKind, model: Box<dyn LanguageModel>) -> Self {
        Self { kind, model }
    }

    pub fn resolve_model(&self, logical: &str) -> String {
        normalize_model_id(self.kind, logical)
    }
}

impl fmt::Debug for SelectedBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SelectedBackend").field("kind", &self.kind).finish_non_exhaustive()
    }
}

#[async_trait]
pub trait BackendResolver: Send + Sync {
    async fn select_backend(&self) -> Option<SelectedBackend>;
}

#[derive(Clone)]
pub struct Dispatcher {
    settings: BackendSettings,
    probe_timeout: Duration,
    client: reqwest::Client,
}

impl Dispatcher {
    pub fn new(settings: BackendSettings) -> Self {
        Self { settings, probe_timeout: PROBE_TIMEOUT, client: reqwest::Client::new() }
    }

    pub fn with_probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout = timeout;
        self
    }

    /// Capability check for one backend. Never errors; any failure means unavailable.
    pub async fn probe(&self, kind: BackendKind) -> bool {
        match kind {
            BackendKind::HostedApi => self.settings.openai_api_key.is_some(),
            BackendKind::LocalDaemon => {
                let url = format!("{}/api/tags", self.settings.ollama_base_url.trim_end_matches('/'));
                match self.client.get(&url).timeout(self.probe_timeout).send().await {
                    Ok(resp) if resp.status() == reqwest::StatusCode::OK => true,
                    Ok(resp) => {
                        tracing::debug!(url = url.as_str(), status = resp.status().as_u16(), "local daemon probe rejected");
                        false
                    }
                    Err(e) => {
                        tracing::debug!(url = url.as_str(), "local daemon probe failed: {e}");
                        false
                    }
                }
            }
        }
    }

    fn connect(&self, kind: BackendKind) -> SelectedBackend {
        let model: Box<dyn LanguageModel> = match kind {
            BackendKind::HostedApi => Box::new(OpenAICompatible::new(
                self.settings.openai_base_url.clone(),
                self.settings.openai_api_key.clone(),
            )),
            BackendKind::LocalDaemon => Box::new(OllamaChat::new(self.settings.ollama_base_url.clone())),
        };
        SelectedBackend::new(kind, model)
    }
}

#[async_trait]
impl BackendResolver for Dispatcher {
    async fn select_backend(&self) -> Option<SelectedBackend> {
        for kind in BackendKind::PRIORITY {
            if self.probe(kind).await {
                tracing::info!(backend = kind.as_str(), "selected generation backend");
                return Some(self.connect(kind));
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn settings(key: Option<&str>, ollama: &str) -> BackendSettings {
        BackendSettings {
            openai_api_key: key.map(str::to_string),
            openai_base_url: "https://api.openai.com/v1".into(),
            ollama_base_url: ollama.into(),
        }
    }

    #[test]
    fn normalization_is_identity_for_unmapped_and_hosted() {
        assert_eq!(normalize_model_id(BackendKind::LocalDaemon, "gpt-4"), "llama3.1:latest");
        assert_eq!(normalize_model_id(BackendKind::LocalDaemon, "gpt-4o"), "llama3.1:latest");
        assert_eq!(normalize_model_id(BackendKind::LocalDaemon, "gpt-3.5-turbo"), "llama3.1:8b");
        assert_eq!(normalize_model_id(BackendKind::LocalDaemon, "mistral:7b"), "mistral:7b");
        assert_eq!(normalize_model_id(BackendKind::LocalDaemon, ""), "");
        assert_eq!(normalize_model_id(BackendKind::HostedApi, "gpt-4"), "gpt-4");
    }

    #[test]
    fn backend_kind_serializes_as_backend_id() {
        assert_eq!(serde_json::to_string(&BackendKind::HostedApi).unwrap(), "\"openai\"");
        assert_eq!(serde_json::to_string(&BackendKind::LocalDaemon).unwrap(), "\"ollama\"");
    }

    #[tokio::test]
    async fn hosted_api_wins_when_key_is_configured() {
        // Unroutable daemon url: must not even be needed.
        let d = Dispatcher::new(settings(Some("sk-x"), "http://127.0.0.1:9"));
        let selected = d.select_backend().await.unwrap();
        assert_eq!(selected.kind, BackendKind::HostedApi);
    }

    #[tokio::test]
    async fn local_daemon_selected_when_health_check_passes() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/tags"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"models": []})))
            .mount(&server)
            .await;

        let d = Dispatcher::new(settings(None, &server.uri()));
        let selected = d.select_backend().await.unwrap();
        assert_eq!(selected.kind, BackendKind::LocalDaemon);
        assert_eq!(selected.resolve_model("gpt-4o-mini"), "llama3.1:8b");
    }

    #[tokio::test]
    async fn unhealthy_or_unreachable_daemon_is_unavailable() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/tags"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let d = Dispatcher::new(settings(None, &server.uri()));
        assert!(!d.probe(BackendKind::LocalDaemon).await);
        assert!(d.select_backend().await.is_none());

        let d = Dispatcher::new(settings(None, "http://127.0.0.1:9"));
        assert!(d.select_backend().await.is_none());
    }

    #[tokio::test]
    async fn slow_daemon_times_out_as_unavailable() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/tags"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(500)))
            .mount(&server)
            .await;

        let d = Dispatcher::new(settings(None, &server.uri())).with_probe_timeout(Duration::from_millis(50));
        assert!(!d.probe(BackendKind::LocalDaemon).await);
    }
}
