use async_trait::async_trait;

use crate::error::SinkError;
use crate::session::SessionEvent;
use crate::settings::Settings;

pub mod github;
pub mod local;
pub mod remote;

pub use github::GitHubContentsStore;
pub use local::LocalFileSink;
pub use remote::{DocumentStore, RemoteDocumentSink, RetryPolicy, VersionedDocument};

#[async_trait]
pub trait EventSink: Send + Sync {
    fn name(&self) -> &'static str;
    async fn append(&self, event: &SessionEvent) -> Result<(), SinkError>;
    /// Whole newline-delimited document held by this sink.
    async fn read_all(&self) -> Result<String, SinkError>;
}

/// Ranked sinks tried in order, with the local file always last.
pub struct EventLog {
    ranked: Vec<Box<dyn EventSink>>,
    fallback: LocalFileSink,
}

impl EventLog {
    pub fn new(ranked: Vec<Box<dyn EventSink>>, fallback: LocalFileSink) -> Self {
        Self { ranked, fallback }
    }

    pub fn local_only(fallback: LocalFileSink) -> Self {
        Self::new(Vec::new(), fallback)
    }

    pub fn from_settings(settings: &Settings) -> Self {
        let mut ranked: Vec<Box<dyn EventSink>> = Vec::new();
        if let Some(remote) = &settings.remote_log {
            let store = GitHubContentsStore::new(remote.clone());
            ranked.push(Box::new(RemoteDocumentSink::new(store, RetryPolicy::default())));
        }
        Self::new(ranked, LocalFileSink::new(&settings.session_log_path))
    }

    /// Writes `event` to exactly one sink and returns its name.
    ///
    /// Remote failures are logged and fall through to the local file; only a
    /// local write failure is returned.
    pub async fn append(&self, event: &SessionEvent) -> Result<&'static str, SinkError> {
        for sink in &self.ranked {
            match sink.append(event).await {
                Ok(()) => return Ok(sink.name()),
                Err(e) => {
                    tracing::warn!(
                        sink = sink.name(),
                        session_id = %event.session_id(),
                        event = event.kind(),
                        "event log append failed, falling back: {e}"
                    );
                    metrics::counter!("event_log_fallbacks_total").increment(1);
                }
            }
        }
        self.fallback.append(event).await?;
        Ok(self.fallback.name())
    }

    /// Concatenated documents of every readable sink, in rank order.
    pub async fn read_all(&self) -> Result<String, SinkError> {
        let mut out = String::new();
        for sink in &self.ranked {
            match sink.read_all().await {
                Ok(doc) => push_document(&mut out, &doc),
                Err(e) => tracing::warn!(sink = sink.name(), "skipping unreadable event log: {e}"),
            }
        }
        push_document(&mut out, &self.fallback.read_all().await?);
        Ok(out)
    }
}

/// Decodes a stored document; bytes that are not UTF-8 (a torn write) are
/// replaced so the remaining lines stay readable.
pub(crate) fn decode_document(bytes: Vec<u8>, source: &'static str) -> String {
    match String::from_utf8(bytes) {
        Ok(doc) => doc,
        Err(e) => {
            tracing::warn!(source, "event log contains invalid UTF-8, replacing damaged bytes");
            String::from_utf8_lossy(e.as_bytes()).into_owned()
        }
    }
}

fn push_document(out: &mut String, doc: &str) {
    if doc.is_empty() {
        return;
    }
    if !out.is_empty() && !out.ends_with('\n') {
        out.push('\n');
    }
    out.push_str(doc);
}
