//! Observer hooks for the task tree.
//!
//! Observers receive audit events, state snapshots, and run summaries. They
//! run on a dedicated pump task in emission order, one observer after another
//! in registration order. Errors and panics raised by an observer are logged
//! and discarded; they never reach the run being observed.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tasktree_observability::{emit_event, ObservabilityEvent, ProcessKind};
use tokio::sync::{mpsc, oneshot};

use crate::model::{now_ms, RunSummary};
use crate::snapshot::TaskTreeSnapshot;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventType {
    Enqueued,
    Deduped,
    QueueTrimmed,
    QueueTtlPruned,
    RunStart,
    StepStart,
    StepRetry,
    StepFinish,
    RunFinish,
}

impl AuditEventType {
    pub fn as_str(self) -> &'static str {
        match self {
            AuditEventType::Enqueued => "enqueued",
            AuditEventType::Deduped => "deduped",
            AuditEventType::QueueTrimmed => "queue_trimmed",
            AuditEventType::QueueTtlPruned => "queue_ttl_pruned",
            AuditEventType::RunStart => "run_start",
            AuditEventType::StepStart => "step_start",
            AuditEventType::StepRetry => "step_retry",
            AuditEventType::StepFinish => "step_finish",
            AuditEventType::RunFinish => "run_finish",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditLevel {
    #[default]
    Info,
    Warn,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEvent {
    pub event_type: AuditEventType,
    pub run_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    #[serde(default)]
    pub level: AuditLevel,
    pub at_ms: u64,
}

impl AuditEvent {
    pub fn new(event_type: AuditEventType, run_id: impl Into<String>) -> Self {
        Self {
            event_type,
            run_id: run_id.into(),
            stage: None,
            status: None,
            error: None,
            note: None,
            correlation_id: None,
            payload: None,
            level: AuditLevel::Info,
            at_ms: now_ms(),
        }
    }

    pub fn stage(mut self, stage: impl Into<String>) -> Self {
        self.stage = Some(stage.into());
        self
    }

    pub fn status(mut self, status: impl Into<String>) -> Self {
        self.status = Some(status.into());
        self
    }

    pub fn error(mut self, error: Option<String>) -> Self {
        self.error = error;
        self
    }

    pub fn note(mut self, note: Option<String>) -> Self {
        self.note = note;
        self
    }

    pub fn correlation_id(mut self, correlation_id: Option<String>) -> Self {
        self.correlation_id = correlation_id;
        self
    }

    pub fn payload(mut self, payload: Value) -> Self {
        self.payload = Some(payload);
        self
    }

    pub fn level(mut self, level: AuditLevel) -> Self {
        self.level = level;
        self
    }
}

/// Best-effort observer of task tree activity. All methods default to no-ops.
#[async_trait::async_trait]
pub trait TaskTreeObserver: Send + Sync {
    /// Name used when logging observer failures.
    fn name(&self) -> &str;

    async fn on_audit(&self, _event: &AuditEvent) -> anyhow::Result<()> {
        Ok(())
    }

    async fn on_state(&self, _snapshot: &TaskTreeSnapshot) -> anyhow::Result<()> {
        Ok(())
    }

    /// Called exactly once per finished run.
    async fn on_persist(&self, _summary: &RunSummary) -> anyhow::Result<()> {
        Ok(())
    }
}

#[derive(Debug)]
pub(crate) enum ObserverMessage {
    Audit(AuditEvent),
    State(TaskTreeSnapshot),
    Persist(RunSummary),
    /// Acknowledged once every earlier message has been delivered.
    Flush(oneshot::Sender<()>),
}

impl ObserverMessage {
    fn kind(&self) -> &'static str {
        match self {
            ObserverMessage::Audit(_) => "audit",
            ObserverMessage::State(_) => "state",
            ObserverMessage::Persist(_) => "persist",
            ObserverMessage::Flush(_) => "flush",
        }
    }
}

#[derive(Clone, Default)]
pub(crate) struct ObserverSet {
    observers: Vec<Arc<dyn TaskTreeObserver>>,
}

impl ObserverSet {
    pub(crate) fn new(observers: Vec<Arc<dyn TaskTreeObserver>>) -> Self {
        Self { observers }
    }

    pub(crate) async fn deliver(&self, message: &ObserverMessage) {
        for observer in &self.observers {
            let delivery = match message {
                ObserverMessage::Audit(event) => observer.on_audit(event),
                ObserverMessage::State(snapshot) => observer.on_state(snapshot),
                ObserverMessage::Persist(summary) => observer.on_persist(summary),
                ObserverMessage::Flush(_) => return,
            };
            match AssertUnwindSafe(delivery).catch_unwind().await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => tracing::debug!(
                    observer = observer.name(),
                    hook = message.kind(),
                    "observer error discarded: {err:#}"
                ),
                Err(_) => tracing::debug!(
                    observer = observer.name(),
                    hook = message.kind(),
                    "observer panic discarded"
                ),
            }
        }
    }

    /// Drain `rx` until every sender is gone.
    pub(crate) async fn pump(self, mut rx: mpsc::UnboundedReceiver<ObserverMessage>) {
        while let Some(message) = rx.recv().await {
            if let ObserverMessage::Flush(done) = message {
                let _ = done.send(());
                continue;
            }
            self.deliver(&message).await;
        }
    }
}

/// Forwards audit events to the structured `tasktree.obs` log target.
pub struct TracingObserver;

#[async_trait::async_trait]
impl TaskTreeObserver for TracingObserver {
    fn name(&self) -> &str {
        "tracing"
    }

    async fn on_audit(&self, event: &AuditEvent) -> anyhow::Result<()> {
        let level = match event.level {
            AuditLevel::Error => tracing::Level::ERROR,
            AuditLevel::Warn => tracing::Level::WARN,
            AuditLevel::Info => tracing::Level::INFO,
        };
        let detail = event
            .error
            .as_deref()
            .or(event.note.as_deref())
            .map(str::to_string)
            .or_else(|| event.payload.as_ref().map(Value::to_string));
        let code = event
            .payload
            .as_ref()
            .and_then(|payload| payload.get("code"))
            .and_then(Value::as_str);
        emit_event(
            level,
            ProcessKind::Worker,
            ObservabilityEvent {
                event: event.event_type.as_str(),
                component: "task_tree",
                correlation_id: event.correlation_id.as_deref(),
                run_id: Some(event.run_id.as_str()),
                stage: event.stage.as_deref(),
                status: event.status.as_deref(),
                error_code: code,
                detail: detail.as_deref(),
            },
        );
        Ok(())
    }
}
