//! Credit-exhaustion pause protocol.
//!
//! When a provider reports credit exhaustion the caller blocks here: an
//! incident is recorded, `credit.exhausted` fires, and the controller
//! polls the configuration until the affected role's provider or model
//! changes (or a stop signal fires). The heartbeat callback runs every
//! iteration so the paused runner keeps its locks and leases alive.

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use sqlx::SqlitePool;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use steroids_db::models::{FailureMode, ProviderRole};
use steroids_db::queries::incidents;

use crate::config::Config;
use crate::hooks::{EventSink, HookEvent, HookKind, emit_best_effort};

/// Default polling cadence.
pub const POLL_INTERVAL: Duration = Duration::from_secs(30);

/// Maximum stored length of the provider's error message.
pub const MESSAGE_CAP: usize = 200;

/// How a pause ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreditResolution {
    /// Once-mode: fail the invocation immediately, no polling.
    ImmediateFail,
    /// The role's provider or model changed while paused.
    ConfigChanged,
    /// The stop signal fired while paused.
    Stopped,
}

/// Result of a pause.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CreditPauseOutcome {
    pub resolved: bool,
    pub resolution: CreditResolution,
}

/// Keeps the paused runner's locks alive; invoked every poll iteration.
#[async_trait]
pub trait Heartbeat: Send + Sync {
    async fn beat(&self);
}

/// A no-op heartbeat for callers with nothing to keep alive.
pub struct NoHeartbeat;

#[async_trait]
impl Heartbeat for NoHeartbeat {
    async fn beat(&self) {}
}

/// Parameters describing the triggering failure.
#[derive(Debug, Clone)]
pub struct CreditPauseRequest {
    pub provider: String,
    pub model: String,
    pub role: ProviderRole,
    pub message: String,
    pub runner_id: Option<Uuid>,
    pub task_id: Option<Uuid>,
    /// Single-task CLI invocation: fail immediately instead of polling.
    pub once_mode: bool,
    /// Override for tests; production uses [`POLL_INTERVAL`].
    pub poll_interval: Option<Duration>,
}

/// Truncate the provider message for durable storage.
fn sanitize(message: &str) -> String {
    let trimmed = message.trim();
    let mut end = trimmed.len().min(MESSAGE_CAP);
    while end > 0 && !trimmed.is_char_boundary(end) {
        end -= 1;
    }
    trimmed[..end].to_string()
}

/// Block until the credit exhaustion is resolved.
///
/// `reload_config` is called once per iteration; the pause resolves as
/// soon as `ai.<role>.provider` or `ai.<role>.model` differs from the
/// triggering values.
pub async fn pause_until_resolved(
    pool: &SqlitePool,
    sink: &dyn EventSink,
    project_path: &str,
    request: CreditPauseRequest,
    reload_config: &(dyn Fn() -> Result<Config> + Send + Sync),
    cancel: &CancellationToken,
    heartbeat: &dyn Heartbeat,
) -> Result<CreditPauseOutcome> {
    let message = sanitize(&request.message);

    let incident = incidents::insert_incident(
        pool,
        request.task_id,
        request.runner_id,
        FailureMode::CreditExhaustion,
        &serde_json::json!({
            "provider": request.provider,
            "model": request.model,
            "role": request.role.to_string(),
            "message": message,
        }),
    )
    .await?;

    emit_best_effort(
        sink,
        HookEvent::new(
            project_path,
            HookKind::CreditExhausted {
                provider: request.provider.clone(),
                model: request.model.clone(),
                role: request.role.to_string(),
            },
        ),
    )
    .await;

    if request.once_mode {
        return Ok(CreditPauseOutcome {
            resolved: false,
            resolution: CreditResolution::ImmediateFail,
        });
    }

    let poll_interval = request.poll_interval.unwrap_or(POLL_INTERVAL);

    loop {
        if cancel.is_cancelled() {
            incidents::resolve_incident(pool, incident.id, "dismissed").await?;
            return Ok(CreditPauseOutcome {
                resolved: false,
                resolution: CreditResolution::Stopped,
            });
        }

        heartbeat.beat().await;

        match reload_config() {
            Ok(config) => {
                let current = config.ai.for_role(request.role);
                if current.provider != request.provider || current.model != request.model {
                    incidents::resolve_incident(pool, incident.id, "config_changed").await?;
                    emit_best_effort(
                        sink,
                        HookEvent::new(
                            project_path,
                            HookKind::CreditResolved {
                                provider: request.provider.clone(),
                                model: request.model.clone(),
                                role: request.role.to_string(),
                                resolution: "config_changed".to_string(),
                            },
                        ),
                    )
                    .await;
                    return Ok(CreditPauseOutcome {
                        resolved: true,
                        resolution: CreditResolution::ConfigChanged,
                    });
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "config reload failed during credit pause");
            }
        }

        tokio::select! {
            _ = tokio::time::sleep(poll_interval) => {}
            _ = cancel.cancelled() => {}
        }
    }
}
