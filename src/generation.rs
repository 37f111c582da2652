use std::collections::{BTreeMap, HashSet};
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::dispatch::{BackendKind, BackendResolver, Dispatcher};
use crate::error::GenerationError;
use crate::models::ModelRequest;
use crate::session::SessionContext;
use crate::settings::{EffectiveGeneration, GenerationDefaults, ModelParams, resolve_generation};
use crate::validators::{ValidationOutcome, Validator, run_validators};

pub const FALLBACK_RESPONSE: &str = "I apologize, but I encountered an error. Please try again.";

pub type ToneConfig = BTreeMap<String, f64>;

#[derive(Debug, Clone)]
pub struct GenerationRequest {
    system_prompt: String,
    user_input: String,
    tone_config: ToneConfig,
    overrides: GenerationDefaults,
    validators: Vec<Validator>,
    k: u32,
}

impl GenerationRequest {
    pub fn builder(system_prompt: impl Into<String>, user_input: impl Into<String>) -> GenerationRequestBuilder {
        GenerationRequestBuilder {
            system_prompt: system_prompt.into(),
            user_input: user_input.into(),
            tone_config: ToneConfig::new(),
            overrides: GenerationDefaults::default(),
            validators: Vec::new(),
            k: 1,
        }
    }

    pub fn system_prompt(&self) -> &str { &self.system_prompt }
    pub fn user_input(&self) -> &str { &self.user_input }
    pub fn tone_config(&self) -> &ToneConfig { &self.tone_config }
    pub fn validators(&self) -> &[Validator] { &self.validators }
    pub fn k(&self) -> u32 { self.k }

    /// Model settings set on this request; unset values come from lower layers.
    pub fn overrides(&self) -> &GenerationDefaults { &self.overrides }

    pub fn resolve(&self, global: &GenerationDefaults, session: &GenerationDefaults) -> EffectiveGeneration {
        resolve_generation(global, session, &self.overrides)
    }
}

#[derive(Debug, Clone)]
pub struct GenerationRequestBuilder {
    system_prompt: String,
    user_input: String,
    tone_config: ToneConfig,
    overrides: GenerationDefaults,
    validators: Vec<Validator>,
    k: u32,
}

impl GenerationRequestBuilder {
    pub fn tone_config(mut self, tone_config: ToneConfig) -> Self {
        self.tone_config = tone_config;
        self
    }

    pub fn tone(mut self, name: impl Into<String>, value: f64) -> Self {
        self.tone_config.insert(name.into(), value);
        self
    }

    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.overrides.model = Some(model.into());
        self
    }

    pub fn temperature(mut self, temperature: f64) -> Self {
        self.params().temperature = Some(temperature);
        self
    }

    pub fn max_tokens(mut self, max_tokens: u32) -> Self {
        self.params().max_tokens = Some(max_tokens);
        self
    }

    fn params(&mut self) -> &mut ModelParams {
        self.overrides.model_params.get_or_insert_with(ModelParams::default)
    }

    pub fn validator(mut self, validator: Validator) -> Self {
        self.validators.push(validator);
        self
    }

    pub fn validators(mut self, validators: impl IntoIterator<Item = Validator>) -> Self {
        self.validators.extend(validators);
        self
    }

    pub fn k(mut self, k: u32) -> Self {
        self.k = k;
        self
    }

    pub fn build(self) -> Result<GenerationRequest, GenerationError> {
        if self.k == 0 {
            return Err(GenerationError::InvalidRequest("k must be at least 1".into()));
        }
        if let Some(t) = self.overrides.model_params.as_ref().and_then(|p| p.temperature) {
            check_temperature(t)?;
        }
        if let Some((name, value)) = self.tone_config.iter().find(|(_, v)| !(0.0..=1.0).contains(*v)) {
            return Err(GenerationError::InvalidRequest(format!("tone parameter {name}={value} outside [0, 1]")));
        }
        let duplicate = {
            let mut seen = HashSet::new();
            self.validators.iter().map(Validator::name).find(|n| !seen.insert(*n)).map(str::to_string)
        };
        if let Some(name) = duplicate {
            return Err(GenerationError::InvalidRequest(format!("duplicate validator name {name}")));
        }

        Ok(GenerationRequest {
            system_prompt: self.system_prompt,
            user_input: self.user_input,
            tone_config: self.tone_config,
            overrides: self.overrides,
            validators: self.validators,
            k: self.k,
        })
    }
}

fn check_temperature(t: f64) -> Result<(), GenerationError> {
    if !t.is_finite() || t < 0.0 {
        return Err(GenerationError::InvalidRequest(format!("temperature {t} out of range")));
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationMetadata {
    pub generation_k: u32,
    pub selection_method: String,
    pub backend: BackendKind,
    pub model_name: String,
    #[serde(default)]
    pub resolved_model: String,
    pub temperature: f64,
    pub max_tokens: u32,
    pub tone_config_used: ToneConfig,
    pub validation_results: BTreeMap<String, ValidationOutcome>,
    pub generation_success: bool,
    pub generation_time_seconds: f64,
    #[serde(deserialize_with = "crate::session::legacy::timestamp")]
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl GenerationMetadata {
    pub fn all_validators_passed(&self) -> bool {
        self.validation_results.values().all(ValidationOutcome::passed)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct GenerationResult {
    pub response: String,
    pub metadata: GenerationMetadata,
}

pub struct Generator<R: BackendResolver = Dispatcher> {
    resolver: R,
    defaults: GenerationDefaults,
}

impl<R: BackendResolver> Generator<R> {
    pub fn new(resolver: R) -> Self {
        Self { resolver, defaults: GenerationDefaults::default() }
    }

    /// Global layer, used where neither the request nor the session sets a value.
    pub fn with_defaults(mut self, defaults: GenerationDefaults) -> Self {
        self.defaults = defaults;
        self
    }

    pub fn defaults(&self) -> &GenerationDefaults {
        &self.defaults
    }

    pub async fn generate(&self, request: &GenerationRequest) -> Result<GenerationResult, GenerationError> {
        self.generate_layered(request, &GenerationDefaults::default()).await
    }

    /// Generates with the session's defaults layered between the request and
    /// the global defaults, and records the metadata on `ctx`.
    pub async fn generate_for(
        &self,
        ctx: &mut SessionContext,
        request: &GenerationRequest,
    ) -> Result<GenerationResult, GenerationError> {
        let result = self.generate_layered(request, ctx.generation_defaults()).await?;
        ctx.record_generation(result.metadata.clone());
        Ok(result)
    }

    async fn generate_layered(
        &self,
        request: &GenerationRequest,
        session: &GenerationDefaults,
    ) -> Result<GenerationResult, GenerationError> {
        if request.k() > 1 {
            return Err(GenerationError::NotImplemented("k-best generation"));
        }
        let eff = request.resolve(&self.defaults, session);
        check_temperature(eff.temperature)?;
        let backend = self.resolver.select_backend().await.ok_or(GenerationError::NoBackendAvailable)?;
        let resolved_model = backend.resolve_model(&eff.model);

        let timestamp = Utc::now();
        let started = Instant::now();
        let call = ModelRequest {
            model: resolved_model.clone(),
            system_prompt: request.system_prompt().to_string(),
            user_input: request.user_input().to_string(),
            temperature: eff.temperature,
            max_tokens: eff.max_tokens,
        };
        let outcome = backend.model.generate(&call).await;
        let generation_time_seconds = started.elapsed().as_secs_f64();

        let (response, error_message) = match outcome {
            Ok(resp) => (resp.content, None),
            Err(e) => {
                tracing::warn!(backend = backend.kind.as_str(), model = resolved_model.as_str(), "generation failed: {e:#}");
                metrics::counter!("generation_failures_total").increment(1);
                let msg = format!("{e:#}");
                let msg = if msg.trim().is_empty() { "backend call failed".to_string() } else { msg };
                (FALLBACK_RESPONSE.to_string(), Some(msg))
            }
        };
        let generation_success = error_message.is_none();

        let validation_results = if generation_success {
            run_validators(request.validators(), &response)
        } else {
            BTreeMap::new()
        };

        Ok(GenerationResult {
            response,
            metadata: GenerationMetadata {
                generation_k: request.k(),
                selection_method: "single".into(),
                backend: backend.kind,
                model_name: eff.model,
                resolved_model,
                temperature: eff.temperature,
                max_tokens: eff.max_tokens,
                tone_config_used: request.tone_config().clone(),
                validation_results,
                generation_success,
                generation_time_seconds,
                timestamp,
                error_message,
            },
        })
    }

    pub async fn generate_k_best(&self, _request: &GenerationRequest, _k: u32) -> Result<GenerationResult, GenerationError> {
        Err(GenerationError::NotImplemented("k-best generation"))
    }
}

pub fn score_tone_match(_candidate: &str, _target: &ToneConfig) -> Result<f64, GenerationError> {
    Err(GenerationError::NotImplemented("tone-match scoring"))
}

pub fn score_fidelity(_candidate: &str, _validators: &[Validator]) -> Result<f64, GenerationError> {
    Err(GenerationError::NotImplemented("fidelity scoring"))
}
