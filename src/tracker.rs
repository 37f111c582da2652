use std::collections::BTreeMap;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::generation::GenerationMetadata;
use crate::session::{Interaction, JsonMap, SessionContext, SessionEnd, SessionEvent, SessionStart};
use crate::storage::EventLog;

#[derive(Debug, Clone, Default)]
pub struct SessionStartArgs {
    /// Defaults to the running executable's file name.
    pub app_name: Option<String>,
    pub preset_name: Option<String>,
    pub preset_config: JsonMap,
    /// Overrides the context's user id for the rest of the session.
    pub user_id: Option<String>,
    pub metadata: JsonMap,
}

#[derive(Debug, Clone, Default)]
pub struct SessionEndArgs {
    pub participant_id: Option<String>,
    pub outcomes: BTreeMap<String, f64>,
    pub feedback: Option<String>,
    pub personality_traits: BTreeMap<String, f64>,
    /// Defaults to the preset config recorded at session start.
    pub base_preset: Option<JsonMap>,
    pub personality_adjustments: BTreeMap<String, f64>,
    /// Defaults to the preset config recorded at session start.
    pub final_tone_config: Option<JsonMap>,
    /// Defaults to the preset name recorded at session start.
    pub condition_label: Option<String>,
    pub anthropomorphism_level: Option<String>,
    pub personality_adaptation: Option<bool>,
    /// Defaults to the generations recorded on the context.
    pub generation_metadata: Option<Vec<GenerationMetadata>>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionSummary {
    pub session_id: Uuid,
    pub user_id: Option<String>,
    pub app_name: Option<String>,
    pub preset_name: Option<String>,
    pub preset_config: JsonMap,
    pub start_time: DateTime<Utc>,
}

pub fn default_app_name() -> String {
    std::env::current_exe()
        .ok()
        .and_then(|p| p.file_name().map(|n| n.to_string_lossy().into_owned()))
        .unwrap_or_else(|| "unknown".to_string())
}

pub struct SessionTracker {
    log: EventLog,
}

impl SessionTracker {
    pub fn new(log: EventLog) -> Self {
        Self { log }
    }

    pub fn log(&self) -> &EventLog {
        &self.log
    }

    pub async fn track_session_start(&self, ctx: &mut SessionContext, args: SessionStartArgs) -> SessionEvent {
        if let Some(user_id) = args.user_id {
            ctx.set_user_id(user_id);
        }
        let start = SessionStart {
            session_id: ctx.session_id(),
            user_id: Some(ctx.user_id().to_string()),
            app_name: Some(args.app_name.unwrap_or_else(default_app_name)),
            preset_name: args.preset_name,
            preset_config: args.preset_config,
            metadata: args.metadata,
            timestamp: Utc::now(),
        };
        ctx.mark_started(start.clone());
        let event = SessionEvent::SessionStart(start);
        self.write(&event).await;
        event
    }

    /// Records an interaction, starting a bare session first if none was started.
    pub async fn track_interaction(
        &self,
        ctx: &mut SessionContext,
        interaction_type: impl Into<String>,
        details: JsonMap,
    ) -> SessionEvent {
        if ctx.started().is_none() {
            self.track_session_start(ctx, SessionStartArgs::default()).await;
        }
        let app_name = ctx.started().and_then(|s| s.app_name.clone());
        let event = SessionEvent::Interaction(Interaction {
            session_id: ctx.session_id(),
            user_id: Some(ctx.user_id().to_string()),
            app_name,
            interaction_type: interaction_type.into(),
            details,
            timestamp: Utc::now(),
        });
        self.write(&event).await;
        event
    }

    /// Records the end of the session. Returns `None` without writing if the
    /// session was never started.
    pub async fn track_session_end(&self, ctx: &mut SessionContext, args: SessionEndArgs) -> Option<SessionEvent> {
        let start = ctx.started()?.clone();
        let now = Utc::now();
        let duration_seconds = (now - start.timestamp).to_std().map(|d| d.as_secs_f64()).unwrap_or(0.0);

        let event = SessionEvent::SessionEnd(SessionEnd {
            session_id: ctx.session_id(),
            participant_id: args.participant_id,
            user_id: Some(ctx.user_id().to_string()),
            app_name: start.app_name,
            duration_seconds,
            condition_label: args.condition_label.or(start.preset_name),
            anthropomorphism_level: args.anthropomorphism_level,
            personality_adaptation: args.personality_adaptation,
            personality_traits: args.personality_traits,
            base_preset: args.base_preset.unwrap_or_else(|| start.preset_config.clone()),
            personality_adjustments: args.personality_adjustments,
            final_tone_config: args.final_tone_config.unwrap_or(start.preset_config),
            generation_metadata: args.generation_metadata.unwrap_or_else(|| ctx.generations().to_vec()),
            outcomes: args.outcomes,
            feedback: args.feedback,
            timestamp: now,
        });
        self.write(&event).await;
        Some(event)
    }

    pub fn session_summary(ctx: &SessionContext) -> Option<SessionSummary> {
        let start = ctx.started()?;
        Some(SessionSummary {
            session_id: ctx.session_id(),
            user_id: start.user_id.clone(),
            app_name: start.app_name.clone(),
            preset_name: start.preset_name.clone(),
            preset_config: start.preset_config.clone(),
            start_time: start.timestamp,
        })
    }

    async fn write(&self, event: &SessionEvent) {
        match self.log.append(event).await {
            Ok(sink) => tracing::debug!(sink, session_id = %event.session_id(), event = event.kind(), "event logged"),
            Err(e) => tracing::error!(session_id = %event.session_id(), event = event.kind(), "event lost, local log not writable: {e}"),
        }
    }
}

/// Convenience for a tracker writing only to a local file.
pub fn local_tracker(path: impl AsRef<Path>) -> SessionTracker {
    SessionTracker::new(EventLog::local_only(crate::storage::LocalFileSink::new(path)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::Dispatcher;
    use crate::error::GenerationError;
    use crate::generation::{GenerationRequest, Generator};
    use crate::settings::BackendSettings;
    use serde_json::json;
    use tempfile::tempdir;

    fn map(v: serde_json::Value) -> JsonMap {
        v.as_object().cloned().unwrap()
    }

    async fn written(tracker: &SessionTracker) -> Vec<SessionEvent> {
        let doc = tracker.log().read_all().await.unwrap();
        doc.lines().map(|l| serde_json::from_str(l).unwrap()).collect()
    }

    #[tokio::test]
    async fn start_interaction_end_share_one_session_id() {
        let dir = tempdir().unwrap();
        let tracker = local_tracker(dir.path().join("session_tracking.jsonl"));
        let mut ctx = SessionContext::new();

        tracker
            .track_session_start(
                &mut ctx,
                SessionStartArgs {
                    app_name: Some("app_adaptive".into()),
                    preset_name: Some("HighA".into()),
                    preset_config: map(json!({"warmth": 0.7})),
                    ..Default::default()
                },
            )
            .await;
        tracker.track_interaction(&mut ctx, "message_sent", map(json!({"topic": "loan"}))).await;
        let end = tracker
            .track_session_end(&mut ctx, SessionEndArgs { condition_label: Some("HighA_Adapted".into()), ..Default::default() })
            .await;
        assert!(end.is_some());

        let events = written(&tracker).await;
        assert_eq!(events.len(), 3);
        assert!(events.iter().all(|e| e.session_id() == ctx.session_id()));
        assert_eq!(events.iter().map(SessionEvent::kind).collect::<Vec<_>>(), ["session_start", "interaction", "session_end"]);
        let SessionEvent::SessionEnd(end) = &events[2] else { panic!("expected session_end") };
        assert!(end.duration_seconds >= 0.0);
        assert_eq!(end.condition_label.as_deref(), Some("HighA_Adapted"));
        assert_eq!(end.app_name.as_deref(), Some("app_adaptive"));
        assert_eq!(end.final_tone_config, map(json!({"warmth": 0.7})));
        assert_eq!(end.base_preset, map(json!({"warmth": 0.7})));
    }

    #[tokio::test]
    async fn end_without_start_writes_nothing() {
        let dir = tempdir().unwrap();
        let tracker = local_tracker(dir.path().join("log.jsonl"));
        let mut ctx = SessionContext::new();

        assert!(tracker.track_session_end(&mut ctx, SessionEndArgs::default()).await.is_none());
        assert!(written(&tracker).await.is_empty());
        assert!(SessionTracker::session_summary(&ctx).is_none());
    }

    #[tokio::test]
    async fn interaction_before_start_opens_a_session() {
        let dir = tempdir().unwrap();
        let tracker = local_tracker(dir.path().join("log.jsonl"));
        let mut ctx = SessionContext::new();

        tracker.track_interaction(&mut ctx, "button_clicked", JsonMap::new()).await;

        let events = written(&tracker).await;
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].kind(), "session_start");
        assert_eq!(events[0].user_id(), events[1].user_id());
    }

    #[tokio::test]
    async fn condition_defaults_to_preset_and_summary_reflects_start() {
        let dir = tempdir().unwrap();
        let tracker = local_tracker(dir.path().join("log.jsonl"));
        let mut ctx = SessionContext::new();
        tracker
            .track_session_start(
                &mut ctx,
                SessionStartArgs {
                    app_name: Some("app.py".into()),
                    preset_name: Some("LowA".into()),
                    user_id: Some("participant-7".into()),
                    ..Default::default()
                },
            )
            .await;

        let summary = SessionTracker::session_summary(&ctx).unwrap();
        assert_eq!(summary.preset_name.as_deref(), Some("LowA"));
        assert_eq!(summary.user_id.as_deref(), Some("participant-7"));

        let Some(SessionEvent::SessionEnd(end)) = tracker.track_session_end(&mut ctx, SessionEndArgs::default()).await else {
            panic!("expected session_end");
        };
        assert_eq!(end.condition_label.as_deref(), Some("LowA"));
        assert_eq!(end.user_id.as_deref(), Some("participant-7"));
    }

    #[tokio::test]
    async fn missing_backend_produces_no_log_entries() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("log.jsonl");
        let tracker = local_tracker(&path);
        let generator = Generator::new(Dispatcher::new(BackendSettings {
            openai_api_key: None,
            openai_base_url: "https://api.openai.com/v1".into(),
            ollama_base_url: "http://127.0.0.1:9".into(),
        }));
        let mut ctx = SessionContext::new();

        let req = GenerationRequest::builder("sys", "hi").build().unwrap();
        let err = generator.generate_for(&mut ctx, &req).await.unwrap_err();

        assert_eq!(err, GenerationError::NoBackendAvailable);
        assert!(ctx.generations().is_empty());
        assert!(written(&tracker).await.is_empty());
        assert!(!path.exists());
    }
}
