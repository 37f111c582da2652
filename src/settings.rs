use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use url::Url;

pub const DEFAULT_OPENAI_BASE_URL: &str = "https://api.openai.com/v1";
pub const DEFAULT_OLLAMA_BASE_URL: &str = "http://localhost:11434";
pub const DEFAULT_SESSION_LOG_PATH: &str = "data/session_tracking.jsonl";
pub const DEFAULT_REMOTE_LOG_PATH: &str = "logs/session_tracking.jsonl";
pub const DEFAULT_REMOTE_BRANCH: &str = "main";

pub const DEFAULT_MODEL: &str = "gpt-4";
pub const DEFAULT_TEMPERATURE: f64 = 0.7;
pub const DEFAULT_MAX_TOKENS: u32 = 500;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ModelParams {
    pub temperature: Option<f64>,
    pub max_tokens: Option<u32>,
}

/// Generation defaults at one configuration layer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct GenerationDefaults {
    pub model: Option<String>,
    pub model_params: Option<ModelParams>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EffectiveGeneration {
    pub model: String,
    pub temperature: f64,
    pub max_tokens: u32,
}

/// Resolves request over session over global, then the built-in defaults.
pub fn resolve_generation(
    global: &GenerationDefaults,
    session: &GenerationDefaults,
    request: &GenerationDefaults,
) -> EffectiveGeneration {
    let layers = [request, session, global];

    let model = layers
        .iter()
        .find_map(|l| l.model.clone())
        .unwrap_or_else(|| DEFAULT_MODEL.to_string());
    let temperature = layers
        .iter()
        .find_map(|l| l.model_params.as_ref().and_then(|p| p.temperature))
        .unwrap_or(DEFAULT_TEMPERATURE);
    let max_tokens = layers
        .iter()
        .find_map(|l| l.model_params.as_ref().and_then(|p| p.max_tokens))
        .unwrap_or(DEFAULT_MAX_TOKENS);

    EffectiveGeneration { model, temperature, max_tokens }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BackendSettings {
    pub openai_api_key: Option<String>,
    pub openai_base_url: String,
    pub ollama_base_url: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RemoteLogSettings {
    pub token: String,
    pub repo: String,
    pub path: String,
    pub branch: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub backends: BackendSettings,
    /// Global generation layer.
    pub generation: GenerationDefaults,
    pub remote_log: Option<RemoteLogSettings>,
    pub session_log_path: PathBuf,
}

impl Settings {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let backends = BackendSettings {
            openai_api_key: non_empty("OPENAI_API_KEY"),
            openai_base_url: valid_base_url("OPENAI_BASE_URL", non_empty("OPENAI_BASE_URL"), DEFAULT_OPENAI_BASE_URL),
            ollama_base_url: valid_base_url("OLLAMA_BASE_URL", non_empty("OLLAMA_BASE_URL"), DEFAULT_OLLAMA_BASE_URL),
        };

        let remote_log = match (non_empty("GITHUB_TOKEN"), non_empty("GITHUB_REPO")) {
            (Some(token), Some(repo)) => Some(RemoteLogSettings {
                token,
                repo,
                path: DEFAULT_REMOTE_LOG_PATH.into(),
                branch: DEFAULT_REMOTE_BRANCH.into(),
            }),
            _ => None,
        };

        let temperature = non_empty("GENERATION_TEMPERATURE")
            .and_then(|raw| parse_setting::<f64>("GENERATION_TEMPERATURE", &raw))
            .filter(|t| {
                let ok = t.is_finite() && *t >= 0.0;
                if !ok {
                    tracing::warn!(temperature = t, "ignoring negative GENERATION_TEMPERATURE");
                }
                ok
            });
        let max_tokens = non_empty("GENERATION_MAX_TOKENS").and_then(|raw| parse_setting::<u32>("GENERATION_MAX_TOKENS", &raw));
        let generation = GenerationDefaults {
            model: non_empty("GENERATION_MODEL"),
            model_params: (temperature.is_some() || max_tokens.is_some()).then_some(ModelParams { temperature, max_tokens }),
        };

        let session_log_path = non_empty("SESSION_LOG_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_SESSION_LOG_PATH));

        Self { backends, generation, remote_log, session_log_path }
    }
}

fn parse_setting<T: std::str::FromStr>(key: &str, raw: &str) -> Option<T> {
    match raw.trim().parse() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!(key, value = raw, "ignoring unparsable setting");
            None
        }
    }
}

fn valid_base_url(key: &str, value: Option<String>, default: &str) -> String {
    let Some(raw) = value else { return default.to_string() };
    match Url::parse(&raw) {
        Ok(u) if matches!(u.scheme(), "http" | "https") => raw.trim_end_matches('/').to_string(),
        _ => {
            tracing::warn!(key, value = raw.as_str(), "ignoring invalid base url, using default");
            default.to_string()
        }
    }
}
