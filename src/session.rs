use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::generation::GenerationMetadata;
use crate::settings::GenerationDefaults;

pub type JsonMap = serde_json::Map<String, serde_json::Value>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionStart {
    pub session_id: Uuid,
    pub user_id: Option<String>,
    pub app_name: Option<String>,
    pub preset_name: Option<String>,
    #[serde(default, deserialize_with = "legacy::or_default")]
    pub preset_config: JsonMap,
    #[serde(default, deserialize_with = "legacy::or_default")]
    pub metadata: JsonMap,
    #[serde(deserialize_with = "legacy::timestamp")]
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Interaction {
    pub session_id: Uuid,
    pub user_id: Option<String>,
    pub app_name: Option<String>,
    pub interaction_type: String,
    #[serde(default, deserialize_with = "legacy::or_default")]
    pub details: JsonMap,
    #[serde(deserialize_with = "legacy::timestamp")]
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionEnd {
    pub session_id: Uuid,
    pub participant_id: Option<String>,
    pub user_id: Option<String>,
    #[serde(alias = "app_version")]
    pub app_name: Option<String>,
    #[serde(default)]
    pub duration_seconds: f64,
    pub condition_label: Option<String>,
    pub anthropomorphism_level: Option<String>,
    #[serde(default, deserialize_with = "legacy::adaptation_flag")]
    pub personality_adaptation: Option<bool>,
    #[serde(default, deserialize_with = "legacy::or_default")]
    pub personality_traits: BTreeMap<String, f64>,
    #[serde(default, deserialize_with = "legacy::or_default")]
    pub base_preset: JsonMap,
    #[serde(default, deserialize_with = "legacy::or_default")]
    pub personality_adjustments: BTreeMap<String, f64>,
    #[serde(default, deserialize_with = "legacy::or_default")]
    pub final_tone_config: JsonMap,
    #[serde(default, deserialize_with = "legacy::generation_list")]
    pub generation_metadata: Vec<GenerationMetadata>,
    #[serde(default, deserialize_with = "legacy::or_default")]
    pub outcomes: BTreeMap<String, f64>,
    #[serde(default, deserialize_with = "legacy::feedback")]
    pub feedback: Option<String>,
    #[serde(deserialize_with = "legacy::timestamp")]
    pub timestamp: DateTime<Utc>,
}

/// One line of the session event log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SessionEvent {
    SessionStart(SessionStart),
    Interaction(Interaction),
    SessionEnd(SessionEnd),
}

impl SessionEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            SessionEvent::SessionStart(_) => "session_start",
            SessionEvent::Interaction(_) => "interaction",
            SessionEvent::SessionEnd(_) => "session_end",
        }
    }

    pub fn session_id(&self) -> Uuid {
        match self {
            SessionEvent::SessionStart(e) => e.session_id,
            SessionEvent::Interaction(e) => e.session_id,
            SessionEvent::SessionEnd(e) => e.session_id,
        }
    }

    pub fn user_id(&self) -> Option<&str> {
        match self {
            SessionEvent::SessionStart(e) => e.user_id.as_deref(),
            SessionEvent::Interaction(e) => e.user_id.as_deref(),
            SessionEvent::SessionEnd(e) => e.user_id.as_deref(),
        }
    }

    pub fn app_name(&self) -> Option<&str> {
        match self {
            SessionEvent::SessionStart(e) => e.app_name.as_deref(),
            SessionEvent::Interaction(e) => e.app_name.as_deref(),
            SessionEvent::SessionEnd(e) => e.app_name.as_deref(),
        }
    }

    /// Only start records carry a preset name.
    pub fn preset_name(&self) -> Option<&str> {
        match self {
            SessionEvent::SessionStart(e) => e.preset_name.as_deref(),
            _ => None,
        }
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            SessionEvent::SessionStart(e) => e.timestamp,
            SessionEvent::Interaction(e) => e.timestamp,
            SessionEvent::SessionEnd(e) => e.timestamp,
        }
    }

    pub fn to_line(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

/// Identity and progress of one logical session, passed explicitly to the tracker.
#[derive(Debug, Clone)]
pub struct SessionContext {
    session_id: Uuid,
    user_id: Option<String>,
    client_ip: Option<String>,
    started: Option<SessionStart>,
    generation_defaults: GenerationDefaults,
    generations: Vec<GenerationMetadata>,
}

impl Default for SessionContext {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionContext {
    pub fn new() -> Self {
        Self {
            session_id: Uuid::new_v4(),
            user_id: None,
            client_ip: None,
            started: None,
            generation_defaults: GenerationDefaults::default(),
            generations: Vec::new(),
        }
    }

    /// Model settings for this session, between the request and the global layer.
    pub fn with_generation_defaults(mut self, defaults: GenerationDefaults) -> Self {
        self.generation_defaults = defaults;
        self
    }

    pub fn generation_defaults(&self) -> &GenerationDefaults {
        &self.generation_defaults
    }

    /// User id will be derived from a hash of `ip` instead of generated.
    pub fn with_client_ip(mut self, ip: impl Into<String>) -> Self {
        self.client_ip = Some(ip.into());
        self
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    pub fn user_id(&mut self) -> &str {
        let ip = self.client_ip.as_deref();
        self.user_id.get_or_insert_with(|| match ip {
            Some(ip) => pseudonymous_user_id(ip),
            None => format!("user_{}", &Uuid::new_v4().simple().to_string()[..8]),
        })
    }

    pub fn set_user_id(&mut self, user_id: impl Into<String>) {
        self.user_id = Some(user_id.into());
    }

    pub fn started(&self) -> Option<&SessionStart> {
        self.started.as_ref()
    }

    pub(crate) fn mark_started(&mut self, start: SessionStart) {
        self.started = Some(start);
    }

    pub fn record_generation(&mut self, metadata: GenerationMetadata) {
        self.generations.push(metadata);
    }

    pub fn generations(&self) -> &[GenerationMetadata] {
        &self.generations
    }
}

/// Readers for records written by earlier loggers: offset-less timestamps,
/// `null` maps, a single metadata object, textual flags and object feedback.
pub(crate) mod legacy {
    use chrono::{DateTime, NaiveDateTime, Utc};
    use serde::de::Error;
    use serde::{Deserialize, Deserializer};
    use serde_json::Value;

    use crate::generation::GenerationMetadata;

    /// RFC 3339, or an ISO 8601 datetime without offset read as UTC.
    pub fn timestamp<'de, D: Deserializer<'de>>(d: D) -> Result<DateTime<Utc>, D::Error> {
        let raw = String::deserialize(d)?;
        if let Ok(ts) = DateTime::parse_from_rfc3339(&raw) {
            return Ok(ts.with_timezone(&Utc));
        }
        raw.parse::<NaiveDateTime>()
            .map(|naive| naive.and_utc())
            .map_err(|e| D::Error::custom(format!("invalid timestamp {raw:?}: {e}")))
    }

    pub fn or_default<'de, D, T>(d: D) -> Result<T, D::Error>
    where
        D: Deserializer<'de>,
        T: Default + Deserialize<'de>,
    {
        Ok(Option::<T>::deserialize(d)?.unwrap_or_default())
    }

    pub fn adaptation_flag<'de, D: Deserializer<'de>>(d: D) -> Result<Option<bool>, D::Error> {
        Ok(match Option::<Value>::deserialize(d)? {
            Some(Value::Bool(b)) => Some(b),
            Some(Value::String(s)) => match s.to_ascii_lowercase().as_str() {
                "enabled" | "true" | "yes" => Some(true),
                "disabled" | "false" | "no" => Some(false),
                _ => None,
            },
            _ => None,
        })
    }

    pub fn feedback<'de, D: Deserializer<'de>>(d: D) -> Result<Option<String>, D::Error> {
        Ok(match Option::<Value>::deserialize(d)? {
            None | Some(Value::Null) => None,
            Some(Value::String(s)) => Some(s),
            Some(Value::Object(m)) if m.is_empty() => None,
            Some(other) => Some(other.to_string()),
        })
    }

    pub fn generation_list<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<GenerationMetadata>, D::Error> {
        match Option::<Value>::deserialize(d)? {
            None | Some(Value::Null) => Ok(Vec::new()),
            Some(Value::Object(m)) if m.is_empty() => Ok(Vec::new()),
            Some(v @ Value::Array(_)) => serde_json::from_value(v).map_err(D::Error::custom),
            Some(v) => serde_json::from_value(v).map(|one| vec![one]).map_err(D::Error::custom),
        }
    }
}

pub fn pseudonymous_user_id(ip: &str) -> String {
    let digest = Sha256::digest(ip.as_bytes());
    hex::encode(digest)[..16].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_id_is_lazy_and_stable() {
        let mut ctx = SessionContext::new();
        let first = ctx.user_id().to_string();
        assert!(first.starts_with("user_"));
        assert_eq!(first.len(), "user_".len() + 8);
        assert_eq!(ctx.user_id(), first);
    }

    #[test]
    fn ip_derived_user_id_is_deterministic() {
        let mut a = SessionContext::new().with_client_ip("203.0.113.7");
        let mut b = SessionContext::new().with_client_ip("203.0.113.7");
        assert_eq!(a.user_id(), b.user_id());
        assert_eq!(a.user_id().len(), 16);
        assert_ne!(a.session_id(), b.session_id());
    }

    #[test]
    fn events_are_tagged_by_kind() {
        let ev = SessionEvent::Interaction(Interaction {
            session_id: Uuid::new_v4(),
            user_id: Some("user_1".into()),
            app_name: Some("app_adaptive".into()),
            interaction_type: "message_sent".into(),
            details: JsonMap::new(),
            timestamp: Utc::now(),
        });
        let v: serde_json::Value = serde_json::from_str(&ev.to_line().unwrap()).unwrap();
        assert_eq!(v["event"], "interaction");
        assert_eq!(v["interaction_type"], "message_sent");
        let back: SessionEvent = serde_json::from_value(v).unwrap();
        assert_eq!(back, ev);
    }

    #[test]
    fn reads_end_records_from_the_earlier_logger() {
        let line = r#"{"event": "session_end", "session_id": "0b5c9a52-4b1e-4c43-9f4e-3f0f2f6b8a11", "participant_id": null, "user_id": "user_1a2b3c4d", "timestamp": "2025-01-01T12:00:00.123456", "duration_seconds": 42.5, "condition_label": "HighA", "anthropomorphism_level": "high", "personality_adaptation": "enabled", "app_version": "app_adaptive.py", "personality_traits": {}, "base_preset": null, "personality_adjustments": {}, "final_tone_config": {"warmth": 0.7}, "generation_metadata": {"generation_k": 1, "selection_method": "single", "backend": "ollama", "model_name": "gpt-4", "temperature": 0.7, "max_tokens": 500, "tone_config_used": {"warmth": 0.7}, "validation_results": {"check_no_guarantees": true}, "generation_success": true, "generation_time_seconds": 1.2, "timestamp": "2025-01-01T11:59:58.000001"}, "outcomes": {}, "feedback": {}}"#;

        let SessionEvent::SessionEnd(end) = serde_json::from_str::<SessionEvent>(line).unwrap() else {
            panic!("expected session_end");
        };
        assert_eq!(end.app_name.as_deref(), Some("app_adaptive.py"));
        assert_eq!(end.timestamp.to_rfc3339(), "2025-01-01T12:00:00.123456+00:00");
        assert_eq!(end.personality_adaptation, Some(true));
        assert!(end.base_preset.is_empty());
        assert!(end.feedback.is_none());
        assert_eq!(end.generation_metadata.len(), 1);
        assert_eq!(end.generation_metadata[0].model_name, "gpt-4");
        assert_eq!(end.generation_metadata[0].resolved_model, "");
    }

    #[test]
    fn naive_timestamps_on_start_and_interaction_read_as_utc() {
        let start = r#"{"event": "session_start", "session_id": "0b5c9a52-4b1e-4c43-9f4e-3f0f2f6b8a11", "user_id": "user_1a2b3c4d", "app_name": "app.py", "preset_name": "LowA", "preset_config": {}, "timestamp": "2025-01-01T12:00:00", "metadata": {}}"#;
        let ev: SessionEvent = serde_json::from_str(start).unwrap();
        assert_eq!(ev.timestamp().to_rfc3339(), "2025-01-01T12:00:00+00:00");

        let bad = start.replace("2025-01-01T12:00:00", "yesterday");
        assert!(serde_json::from_str::<SessionEvent>(&bad).is_err());
    }
}
