//! The `ProviderInvoker` capability -- the adapter interface for LLM
//! command-line tools.
//!
//! Each concrete provider (Claude Code today) implements this trait.
//! The trait is object-safe so invokers can be stored as
//! `Arc<dyn ProviderInvoker>` in the [`ProviderRegistry`]. The registry
//! is process-wide state: installed once at startup, never mutated
//! afterwards.

pub mod claude;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

use steroids_db::models::{ProviderRole, TokenUsage};

/// Classified provider failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderErrorKind {
    RateLimit,
    AuthError,
    NetworkError,
    ModelNotFound,
    ContextExceeded,
    CreditExhaustion,
    SubprocessHung,
    Unknown,
}

/// Errors surfaced by an invoker before any subprocess output exists.
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("provider binary unavailable: {0}")]
    Unavailable(String),

    #[error("failed to spawn provider subprocess: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("provider io error: {0}")]
    Io(#[source] std::io::Error),
}

/// Which pipe produced an activity chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

/// One output chunk from a running invocation. Forwarded to the
/// invocation logger, which owns the file handles, and used to reset
/// the activity timeout.
#[derive(Debug, Clone)]
pub struct ActivityChunk {
    pub stream: OutputStream,
    pub line: String,
    pub at_ms: i64,
}

/// Request for one provider invocation.
pub struct InvokeRequest {
    pub prompt: String,
    pub model: String,
    pub cwd: PathBuf,
    pub role: ProviderRole,
    /// Activity timeout: the timer resets on every output chunk, so a
    /// slow-but-steady stream never trips it.
    pub timeout: Duration,
    pub stream_output: bool,
    /// Session to resume, when the provider supports it.
    pub resume_session_id: Option<String>,
    /// Isolated home directory for the provider's own state.
    pub provider_home: Option<PathBuf>,
    /// Activity channel; chunks are sent best-effort.
    pub activity: Option<mpsc::UnboundedSender<ActivityChunk>>,
}

/// Result of one provider invocation.
#[derive(Debug, Clone)]
pub struct InvokeOutcome {
    pub success: bool,
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub duration: Duration,
    pub timed_out: bool,
    pub session_id: Option<String>,
    pub token_usage: Option<TokenUsage>,
}

/// Adapter interface for invoking an LLM CLI tool.
#[async_trait]
pub trait ProviderInvoker: Send + Sync {
    /// Registry name for this provider (e.g. "claude").
    fn name(&self) -> &str;

    /// Default model when a role has none configured.
    fn default_model(&self) -> &str;

    /// Models this invoker knows about. The default is just the
    /// default model; adapters with a discovery mechanism override.
    fn list_models(&self) -> Vec<String> {
        vec![self.default_model().to_string()]
    }

    /// Run one blocking invocation to completion (or timeout).
    async fn invoke(&self, request: InvokeRequest) -> Result<InvokeOutcome, ProviderError>;

    /// Probe whether the provider binary is usable at all.
    async fn is_available(&self) -> bool;

    /// Classify a finished invocation's failure, if it failed.
    fn classify_result(&self, outcome: &InvokeOutcome) -> Option<ProviderErrorKind>;
}

// Compile-time assertion: the trait must stay object-safe.
const _: () = {
    fn _assert_object_safe(_: &dyn ProviderInvoker) {}
};

/// A collection of registered invokers, keyed by provider name.
#[derive(Default, Clone)]
pub struct ProviderRegistry {
    providers: HashMap<String, Arc<dyn ProviderInvoker>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an invoker under [`ProviderInvoker::name`]. Replaces
    /// any prior registration with the same name.
    pub fn register(&mut self, invoker: Arc<dyn ProviderInvoker>) {
        self.providers.insert(invoker.name().to_string(), invoker);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn ProviderInvoker>> {
        self.providers.get(name).cloned()
    }

    pub fn list(&self) -> Vec<&str> {
        self.providers.keys().map(|s| s.as_str()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }

    /// Install this registry as the process-wide singleton. Returns an
    /// error if one was already installed.
    pub fn install(self) -> anyhow::Result<()> {
        GLOBAL_REGISTRY
            .set(self)
            .map_err(|_| anyhow::anyhow!("provider registry already installed"))
    }

    /// The process-wide registry, if installed.
    pub fn global() -> Option<&'static ProviderRegistry> {
        GLOBAL_REGISTRY.get()
    }
}

impl std::fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderRegistry")
            .field("providers", &self.providers.keys().collect::<Vec<_>>())
            .finish()
    }
}

static GLOBAL_REGISTRY: OnceLock<ProviderRegistry> = OnceLock::new();

/// Shared keyword classifier for provider stderr/stdout text.
///
/// The order matters: credit exhaustion must win over the generic
/// rate-limit match because some providers word both alike.
pub fn classify_output_text(text: &str) -> Option<ProviderErrorKind> {
    let lower = text.to_lowercase();

    const CREDIT: &[&str] = &[
        "credit balance is too low",
        "insufficient credit",
        "out of credits",
        "billing hard limit",
        "payment required",
    ];
    const RATE: &[&str] = &["rate limit", "rate_limit", "429", "too many requests"];
    const AUTH: &[&str] = &[
        "unauthorized",
        "authentication",
        "invalid api key",
        "api key not found",
        "401",
        "403",
    ];
    const MODEL: &[&str] = &["model not found", "unknown model", "no such model"];
    const CONTEXT: &[&str] = &[
        "context length",
        "context_length_exceeded",
        "prompt is too long",
        "maximum context",
    ];
    const NETWORK: &[&str] = &[
        "network error",
        "connection refused",
        "connection reset",
        "econnreset",
        "enotfound",
        "etimedout",
        "dns",
    ];

    let matches = |needles: &[&str]| needles.iter().any(|n| lower.contains(n));

    if matches(CREDIT) {
        Some(ProviderErrorKind::CreditExhaustion)
    } else if matches(RATE) {
        Some(ProviderErrorKind::RateLimit)
    } else if matches(AUTH) {
        Some(ProviderErrorKind::AuthError)
    } else if matches(MODEL) {
        Some(ProviderErrorKind::ModelNotFound)
    } else if matches(CONTEXT) {
        Some(ProviderErrorKind::ContextExceeded)
    } else if matches(NETWORK) {
        Some(ProviderErrorKind::NetworkError)
    } else {
        None
    }
}
