//! Fire-and-forget audit log of mutating manager operations.
//!
//! [`AuditEmitter::log_event`] only pushes onto a bounded in-process queue and
//! never blocks or fails its caller. When the queue is full the oldest event
//! is dropped. A background task drains the queue into an [`AuditSink`];
//! delivery failures are logged locally and otherwise swallowed.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use crate::error::StoreError;
use crate::store::{to_document, RecordStore, Table};

/// Tag attached to every manager event.
pub const SECURITY_TAG: &str = "security";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    pub message: String,
    pub tags: Vec<String>,
    #[serde(with = "crate::models::timestamp")]
    pub time: Option<DateTime<Utc>>,
}

/// Destination for drained audit events.
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn deliver(&self, event: &AuditEvent) -> Result<(), StoreError>;
}

/// Writes events to the `audit` tracing target.
pub struct TracingAuditSink;

#[async_trait]
impl AuditSink for TracingAuditSink {
    async fn deliver(&self, event: &AuditEvent) -> Result<(), StoreError> {
        tracing::info!(
            target: "audit",
            event_type = %event.event_type,
            tags = ?event.tags,
            "{}",
            event.message
        );
        Ok(())
    }
}

/// Persists events into the `events` table.
pub struct StoreAuditSink {
    store: Arc<dyn RecordStore>,
}

impl StoreAuditSink {
    pub fn new(store: Arc<dyn RecordStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl AuditSink for StoreAuditSink {
    async fn deliver(&self, event: &AuditEvent) -> Result<(), StoreError> {
        self.store.insert(Table::Events, to_document(event)?).await?;
        Ok(())
    }
}

/// Delivers to several sinks; the first failure is reported after all ran.
pub struct FanoutAuditSink {
    sinks: Vec<Arc<dyn AuditSink>>,
}

impl FanoutAuditSink {
    pub fn new(sinks: Vec<Arc<dyn AuditSink>>) -> Self {
        Self { sinks }
    }
}

#[async_trait]
impl AuditSink for FanoutAuditSink {
    async fn deliver(&self, event: &AuditEvent) -> Result<(), StoreError> {
        let mut first_err = None;
        for sink in &self.sinks {
            if let Err(e) = sink.deliver(event).await {
                first_err.get_or_insert(e);
            }
        }
        first_err.map_or(Ok(()), Err)
    }
}

struct AuditQueue {
    events: Mutex<VecDeque<AuditEvent>>,
    capacity: usize,
    notify: Notify,
    closed: AtomicBool,
}

impl AuditQueue {
    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<AuditEvent>> {
        self.events.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Cheap, cloneable handle used by the managers.
#[derive(Clone)]
pub struct AuditEmitter {
    queue: Arc<AuditQueue>,
}

/// Owns the drain task; call [`AuditDrain::shutdown`] at process exit.
pub struct AuditDrain {
    queue: Arc<AuditQueue>,
    task: JoinHandle<()>,
}

impl AuditEmitter {
    /// Start the drain task on the current tokio runtime.
    pub fn spawn(sink: Arc<dyn AuditSink>, capacity: usize) -> (Self, AuditDrain) {
        let queue = Arc::new(AuditQueue {
            events: Mutex::new(VecDeque::with_capacity(capacity.min(4096))),
            capacity: capacity.max(1),
            notify: Notify::new(),
            closed: AtomicBool::new(false),
        });
        let task = tokio::spawn(drain(queue.clone(), sink));
        (
            Self {
                queue: queue.clone(),
            },
            AuditDrain { queue, task },
        )
    }

    pub fn log_event(&self, event_type: &str, subject: impl Into<String>, tags: &[&str]) {
        let event = AuditEvent {
            event_type: event_type.to_string(),
            message: subject.into(),
            tags: tags.iter().map(|t| t.to_string()).collect(),
            time: Some(Utc::now()),
        };
        crate::metrics::audit_event(event_type);

        let mut events = self.queue.lock();
        if events.len() >= self.queue.capacity {
            if let Some(dropped) = events.pop_front() {
                crate::metrics::audit_event_dropped();
                tracing::warn!(
                    event_type = %dropped.event_type,
                    "Audit queue full, dropped oldest event"
                );
            }
        }
        events.push_back(event);
        drop(events);
        self.queue.notify.notify_one();
    }

    /// Events accepted but not yet handed to the sink.
    pub fn pending(&self) -> usize {
        self.queue.lock().len()
    }
}

impl AuditDrain {
    /// Stop accepting wakeups, deliver what is queued, and wait for the task.
    pub async fn shutdown(self) {
        self.queue.closed.store(true, Ordering::SeqCst);
        self.queue.notify.notify_one();
        if let Err(e) = self.task.await {
            tracing::error!("Audit drain task failed: {e}");
        }
    }
}

async fn drain(queue: Arc<AuditQueue>, sink: Arc<dyn AuditSink>) {
    loop {
        let batch: Vec<AuditEvent> = queue.lock().drain(..).collect();
        if batch.is_empty() {
            if queue.closed.load(Ordering::SeqCst) {
                break;
            }
            queue.notify.notified().await;
            continue;
        }
        for event in &batch {
            if let Err(e) = sink.deliver(event).await {
                tracing::error!(
                    event_type = %event.event_type,
                    "Audit delivery failed: {e}"
                );
            }
        }
    }
}

/// Captures delivered events for assertions.
#[cfg(test)]
#[derive(Default)]
pub struct TestAuditSink {
    events: Mutex<Vec<AuditEvent>>,
}

#[cfg(test)]
impl TestAuditSink {
    pub fn events(&self) -> Vec<AuditEvent> {
        self.events.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn event_types(&self) -> Vec<String> {
        self.events().into_iter().map(|e| e.event_type).collect()
    }
}

#[cfg(test)]
#[async_trait]
impl AuditSink for TestAuditSink {
    async fn deliver(&self, event: &AuditEvent) -> Result<(), StoreError> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{Filter, MemoryStore};

    struct FailingSink;

    #[async_trait]
    impl AuditSink for FailingSink {
        async fn deliver(&self, _event: &AuditEvent) -> Result<(), StoreError> {
            Err(StoreError::Connection("sink offline".into()))
        }
    }

    #[tokio::test]
    async fn delivers_events_in_order_before_shutdown_returns() {
        let sink = Arc::new(TestAuditSink::default());
        let (emitter, drain) = AuditEmitter::spawn(sink.clone(), 16);

        emitter.log_event("add-project", "id=1, name=a", &[SECURITY_TAG]);
        emitter.log_event("delete-project", "id=1, name=a", &[SECURITY_TAG]);
        drain.shutdown().await;

        assert_eq!(sink.event_types(), vec!["add-project", "delete-project"]);
        assert_eq!(sink.events()[0].tags, vec!["security"]);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn full_queue_drops_oldest() {
        let sink = Arc::new(TestAuditSink::default());
        let (emitter, drain) = AuditEmitter::spawn(sink.clone(), 2);

        // The drain task cannot run until this task yields.
        emitter.log_event("e1", "", &[]);
        emitter.log_event("e2", "", &[]);
        emitter.log_event("e3", "", &[]);
        assert_eq!(emitter.pending(), 2);
        drain.shutdown().await;

        assert_eq!(sink.event_types(), vec!["e2", "e3"]);
    }

    #[tokio::test]
    async fn sink_failures_do_not_reach_the_caller() {
        let (emitter, drain) = AuditEmitter::spawn(Arc::new(FailingSink), 4);
        emitter.log_event("update-test", "id=t", &[SECURITY_TAG]);
        drain.shutdown().await;
        assert_eq!(emitter.pending(), 0);
    }

    #[tokio::test]
    async fn store_sink_persists_into_events_table() {
        let store = Arc::new(MemoryStore::new());
        let (emitter, drain) = AuditEmitter::spawn(Arc::new(StoreAuditSink::new(store.clone())), 4);
        emitter.log_event("add-test", "id=t1", &[SECURITY_TAG]);
        drain.shutdown().await;

        let docs = store.filter(Table::Events, &Filter::eq("type", "add-test")).await.unwrap();
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0]["message"], "id=t1");
    }
}
