//! Event log kept as one versioned document in a remote store.
//!
//! Appends are optimistic: read the document and its version token, add one
//! line, and write back conditioned on that token. A stale token means another
//! writer got there first, so the whole read-modify-write is retried under a
//! bounded [`RetryPolicy`]. Any other store failure is returned immediately.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use super::EventSink;
use crate::error::{SinkError, StoreError};
use crate::session::SessionEvent;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionedDocument {
    pub content: String,
    pub version: String,
}

#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Current document, or `None` if it does not exist yet.
    async fn get(&self) -> Result<Option<VersionedDocument>, StoreError>;

    /// Replaces the document if its version still equals `version`
    /// (`None` = create only if absent). Fails with [`StoreError::Conflict`] otherwise.
    async fn put(&self, content: &str, version: Option<&str>, message: &str) -> Result<(), StoreError>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { max_attempts: 3, base_backoff: Duration::from_millis(100), max_backoff: Duration::from_secs(2) }
    }
}

impl RetryPolicy {
    pub fn no_backoff(max_attempts: u32) -> Self {
        Self { max_attempts, base_backoff: Duration::ZERO, max_backoff: Duration::ZERO }
    }

    /// Only conflicts are retried, and only while attempts remain.
    pub fn should_retry(&self, err: &StoreError, attempt: u32) -> bool {
        err.is_conflict() && attempt < self.max_attempts
    }

    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
        self.base_backoff.saturating_mul(factor).min(self.max_backoff)
    }
}

pub struct RemoteDocumentSink<S: DocumentStore> {
    store: S,
    policy: RetryPolicy,
}

impl<S: DocumentStore> RemoteDocumentSink<S> {
    pub fn new(store: S, policy: RetryPolicy) -> Self {
        Self { store, policy }
    }

    pub fn store(&self) -> &S {
        &self.store
    }
}

fn with_line(existing: &str, line: &str) -> String {
    let mut out = String::with_capacity(existing.len() + line.len() + 2);
    out.push_str(existing);
    if !out.is_empty() && !out.ends_with('\n') {
        out.push('\n');
    }
    out.push_str(line);
    out.push('\n');
    out
}

#[async_trait]
impl<S: DocumentStore> EventSink for RemoteDocumentSink<S> {
    fn name(&self) -> &'static str {
        "remote_document"
    }

    async fn append(&self, event: &SessionEvent) -> Result<(), SinkError> {
        let line = event.to_line()?;
        let session_id = event.session_id().to_string();
        let message = format!("Log session: {}", &session_id[..8]);
        let max_attempts = self.policy.max_attempts.max(1);

        for attempt in 1..=max_attempts {
            let current = self.store.get().await?;
            let (content, version) = match &current {
                Some(doc) => (doc.content.as_str(), Some(doc.version.as_str())),
                None => ("", None),
            };
            match self.store.put(&with_line(content, &line), version, &message).await {
                Ok(()) => {
                    if attempt > 1 {
                        tracing::info!(attempt, session_id = session_id.as_str(), "remote log append succeeded after conflict");
                    }
                    return Ok(());
                }
                Err(e) if self.policy.should_retry(&e, attempt) => {
                    metrics::counter!("event_log_conflicts_total").increment(1);
                    tracing::warn!(attempt, max_attempts, session_id = session_id.as_str(), "remote log changed underneath append, retrying");
                    tokio::time::sleep(self.policy.backoff(attempt)).await;
                }
                Err(e) if e.is_conflict() => {
                    metrics::counter!("event_log_conflicts_total").increment(1);
                    return Err(SinkError::ConflictRetriesExhausted { attempts: attempt });
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(SinkError::ConflictRetriesExhausted { attempts: max_attempts })
    }

    async fn read_all(&self) -> Result<String, SinkError> {
        Ok(self.store.get().await?.map(|d| d.content).unwrap_or_default())
    }
}

/// In-process versioned store; versions are a monotonically increasing counter.
#[derive(Debug, Clone, Default)]
pub struct MemoryDocumentStore {
    inner: Arc<Mutex<Option<(String, u64)>>>,
}

impl MemoryDocumentStore {
    pub fn snapshot(&self) -> String {
        self.lock().as_ref().map(|(c, _)| c.clone()).unwrap_or_default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Option<(String, u64)>> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl DocumentStore for MemoryDocumentStore {
    async fn get(&self) -> Result<Option<VersionedDocument>, StoreError> {
        Ok(self
            .lock()
            .as_ref()
            .map(|(content, v)| VersionedDocument { content: content.clone(), version: v.to_string() }))
    }

    async fn put(&self, content: &str, version: Option<&str>, _message: &str) -> Result<(), StoreError> {
        let mut guard = self.lock();
        let current = guard.as_ref().map(|(_, v)| v.to_string());
        if current.as_deref() != version {
            return Err(StoreError::Conflict);
        }
        let next = guard.as_ref().map_or(1, |(_, v)| v + 1);
        *guard = Some((content.to_string(), next));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{Interaction, JsonMap};
    use chrono::Utc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Barrier;
    use uuid::Uuid;

    fn event(kind: &str) -> SessionEvent {
        SessionEvent::Interaction(Interaction {
            session_id: Uuid::new_v4(),
            user_id: None,
            app_name: Some("app_adaptive".into()),
            interaction_type: kind.into(),
            details: JsonMap::new(),
            timestamp: Utc::now(),
        })
    }

    /// Holds the first `gated` readers at a barrier after they read, so they
    /// all see the same version before anyone writes.
    struct Racing {
        inner: MemoryDocumentStore,
        barrier: Barrier,
        gated: usize,
        gets: AtomicUsize,
        conflicts: AtomicUsize,
    }

    impl Racing {
        fn new(gated: usize) -> Self {
            Self {
                inner: MemoryDocumentStore::default(),
                barrier: Barrier::new(gated),
                gated,
                gets: AtomicUsize::new(0),
                conflicts: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl DocumentStore for Racing {
        async fn get(&self) -> Result<Option<VersionedDocument>, StoreError> {
            let doc = self.inner.get().await?;
            if self.gets.fetch_add(1, Ordering::SeqCst) < self.gated {
                self.barrier.wait().await;
            }
            Ok(doc)
        }

        async fn put(&self, content: &str, version: Option<&str>, message: &str) -> Result<(), StoreError> {
            let res = self.inner.put(content, version, message).await;
            if matches!(res, Err(StoreError::Conflict)) {
                self.conflicts.fetch_add(1, Ordering::SeqCst);
            }
            res
        }
    }

    struct AlwaysConflict {
        gets: AtomicUsize,
    }

    #[async_trait]
    impl DocumentStore for AlwaysConflict {
        async fn get(&self) -> Result<Option<VersionedDocument>, StoreError> {
            self.gets.fetch_add(1, Ordering::SeqCst);
            Ok(Some(VersionedDocument { content: String::new(), version: "v".into() }))
        }
        async fn put(&self, _: &str, _: Option<&str>, _: &str) -> Result<(), StoreError> {
            Err(StoreError::Conflict)
        }
    }

    struct Unauthorized {
        gets: AtomicUsize,
    }

    #[async_trait]
    impl DocumentStore for Unauthorized {
        async fn get(&self) -> Result<Option<VersionedDocument>, StoreError> {
            self.gets.fetch_add(1, Ordering::SeqCst);
            Ok(None)
        }
        async fn put(&self, _: &str, _: Option<&str>, _: &str) -> Result<(), StoreError> {
            Err(StoreError::Unauthorized(403))
        }
    }

    #[tokio::test]
    async fn concurrent_appends_to_empty_log_are_both_kept() {
        let sink = RemoteDocumentSink::new(Racing::new(2), RetryPolicy::no_backoff(3));
        let (a, b) = (event("first"), event("second"));

        let (ra, rb) = tokio::join!(sink.append(&a), sink.append(&b));
        ra.unwrap();
        rb.unwrap();

        let doc = sink.store().inner.snapshot();
        let written: Vec<SessionEvent> = doc.lines().map(|l| serde_json::from_str(l).unwrap()).collect();
        assert_eq!(written.len(), 2);
        assert!(written.contains(&a));
        assert!(written.contains(&b));
        assert!(sink.store().conflicts.load(Ordering::SeqCst) >= 1);
    }

    #[tokio::test]
    async fn conflicts_are_retried_up_to_the_budget() {
        let sink = RemoteDocumentSink::new(AlwaysConflict { gets: AtomicUsize::new(0) }, RetryPolicy::no_backoff(3));

        let err = sink.append(&event("x")).await.unwrap_err();

        assert!(matches!(err, SinkError::ConflictRetriesExhausted { attempts: 3 }));
        assert_eq!(sink.store().gets.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn non_conflict_failures_are_not_retried() {
        let sink = RemoteDocumentSink::new(Unauthorized { gets: AtomicUsize::new(0) }, RetryPolicy::no_backoff(3));

        let err = sink.append(&event("x")).await.unwrap_err();

        assert!(matches!(err, SinkError::Unavailable(StoreError::Unauthorized(403))));
        assert_eq!(sink.store().gets.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn appends_onto_existing_content_without_trailing_newline() {
        let store = MemoryDocumentStore::default();
        store.put("{\"legacy\":true}", None, "seed").await.unwrap();
        let sink = RemoteDocumentSink::new(store.clone(), RetryPolicy::default());

        sink.append(&event("x")).await.unwrap();

        let doc = store.snapshot();
        assert_eq!(doc.lines().count(), 2);
        assert!(doc.ends_with('\n'));
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let p = RetryPolicy { max_attempts: 5, base_backoff: Duration::from_millis(100), max_backoff: Duration::from_millis(250) };
        assert_eq!(p.backoff(1), Duration::from_millis(100));
        assert_eq!(p.backoff(2), Duration::from_millis(200));
        assert_eq!(p.backoff(3), Duration::from_millis(250));
        assert!(p.should_retry(&StoreError::Conflict, 4));
        assert!(!p.should_retry(&StoreError::Conflict, 5));
        assert!(!p.should_retry(&StoreError::Unauthorized(401), 1));
    }
}
