//! Hook events and the `EventSink` capability.
//!
//! The hook dispatcher itself (scripts, webhooks) lives outside the
//! core; the control plane only emits [`HookEvent`] values into an
//! [`EventSink`]. Emission is always best-effort: sink failures are
//! logged and never propagate. Setting `STEROIDS_NO_HOOKS` disables
//! dispatch entirely.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Payload schema version carried by every event.
pub const PAYLOAD_VERSION: u32 = 1;

/// Event-specific body, discriminated by the `event` tag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum HookKind {
    #[serde(rename = "task.created")]
    TaskCreated { task_id: Uuid, title: String },
    #[serde(rename = "task.updated")]
    TaskUpdated {
        task_id: Uuid,
        from_status: String,
        to_status: String,
    },
    #[serde(rename = "task.completed")]
    TaskCompleted { task_id: Uuid },
    #[serde(rename = "task.failed")]
    TaskFailed { task_id: Uuid, reason: String },
    #[serde(rename = "section.completed")]
    SectionCompleted { section_id: String },
    #[serde(rename = "project.completed")]
    ProjectCompleted,
    #[serde(rename = "health.changed")]
    HealthChanged { failure_mode: String, task_id: Option<Uuid> },
    #[serde(rename = "health.critical")]
    HealthCritical { detail: String },
    #[serde(rename = "dispute.created")]
    DisputeCreated { task_id: Uuid },
    #[serde(rename = "dispute.resolved")]
    DisputeResolved { task_id: Uuid },
    #[serde(rename = "credit.exhausted")]
    CreditExhausted {
        provider: String,
        model: String,
        role: String,
    },
    #[serde(rename = "credit.resolved")]
    CreditResolved {
        provider: String,
        model: String,
        role: String,
        resolution: String,
    },
}

/// A versioned hook event envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HookEvent {
    pub version: u32,
    pub timestamp: DateTime<Utc>,
    pub project: String,
    #[serde(flatten)]
    pub kind: HookKind,
}

impl HookEvent {
    pub fn new(project: impl Into<String>, kind: HookKind) -> Self {
        Self {
            version: PAYLOAD_VERSION,
            timestamp: Utc::now(),
            project: project.into(),
            kind,
        }
    }

    /// The dotted event name (`task.completed`, `credit.exhausted`, ...).
    pub fn name(&self) -> &'static str {
        match self.kind {
            HookKind::TaskCreated { .. } => "task.created",
            HookKind::TaskUpdated { .. } => "task.updated",
            HookKind::TaskCompleted { .. } => "task.completed",
            HookKind::TaskFailed { .. } => "task.failed",
            HookKind::SectionCompleted { .. } => "section.completed",
            HookKind::ProjectCompleted => "project.completed",
            HookKind::HealthChanged { .. } => "health.changed",
            HookKind::HealthCritical { .. } => "health.critical",
            HookKind::DisputeCreated { .. } => "dispute.created",
            HookKind::DisputeResolved { .. } => "dispute.resolved",
            HookKind::CreditExhausted { .. } => "credit.exhausted",
            HookKind::CreditResolved { .. } => "credit.resolved",
        }
    }
}

/// Destination for hook events.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn emit(&self, event: &HookEvent) -> anyhow::Result<()>;
}

/// Emit an event through a sink, swallowing failures.
pub async fn emit_best_effort(sink: &dyn EventSink, event: HookEvent) {
    if std::env::var_os("STEROIDS_NO_HOOKS").is_some() {
        return;
    }
    if let Err(e) = sink.emit(&event).await {
        tracing::warn!(event = event.name(), error = %e, "hook emission failed (best-effort)");
    }
}

/// Sink that logs each event as a structured tracing record.
#[derive(Debug, Default, Clone)]
pub struct TracingSink;

#[async_trait]
impl EventSink for TracingSink {
    async fn emit(&self, event: &HookEvent) -> anyhow::Result<()> {
        let payload = serde_json::to_string(event)?;
        tracing::info!(event = event.name(), %payload, "hook event");
        Ok(())
    }
}

/// Sink that records events in memory, for tests.
#[derive(Debug, Default)]
pub struct RecordingSink {
    events: std::sync::Mutex<Vec<HookEvent>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<HookEvent> {
        self.events.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.events().iter().map(|e| e.name()).collect()
    }
}

#[async_trait]
impl EventSink for RecordingSink {
    async fn emit(&self, event: &HookEvent) -> anyhow::Result<()> {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(event.clone());
        Ok(())
    }
}
