//! Shared helpers for steroids-core integration tests: a scripted
//! provider invoker and context builders.
#![allow(dead_code)]

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use steroids_core::config::Config;
use steroids_core::gitops::CommandGit;
use steroids_core::hooks::RecordingSink;
use steroids_core::orchestration::OrchestrationContext;
use steroids_core::provider::{
    InvokeOutcome, InvokeRequest, ProviderError, ProviderErrorKind, ProviderInvoker,
    ProviderRegistry, classify_output_text,
};
use steroids_db::models::ProviderRole;
use steroids_test_utils::TestProjectStore;

/// One scripted provider response. Steps are consumed in invocation
/// order; the optional side effect runs in the invocation's cwd (the
/// stand-in for the agent editing the repo).
pub struct ScriptStep {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    pub side_effect: Option<Box<dyn Fn(&Path) + Send + Sync>>,
}

impl ScriptStep {
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            stdout: stdout.into(),
            stderr: String::new(),
            exit_code: 0,
            side_effect: None,
        }
    }

    pub fn fail(stderr: impl Into<String>) -> Self {
        Self {
            stdout: String::new(),
            stderr: stderr.into(),
            exit_code: 1,
            side_effect: None,
        }
    }

    pub fn with_effect(mut self, effect: impl Fn(&Path) + Send + Sync + 'static) -> Self {
        self.side_effect = Some(Box::new(effect));
        self
    }
}

/// Record of one invocation the fake received.
#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub role: ProviderRole,
    pub prompt: String,
    pub model: String,
}

/// A provider invoker that replays a script and records every call.
pub struct ScriptedInvoker {
    name: String,
    script: Mutex<VecDeque<ScriptStep>>,
    pub calls: Mutex<Vec<RecordedCall>>,
}

impl ScriptedInvoker {
    pub fn new(steps: Vec<ScriptStep>) -> Self {
        Self {
            name: "claude".to_string(),
            script: Mutex::new(steps.into()),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn recorded(&self) -> Vec<RecordedCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn remaining(&self) -> usize {
        self.script.lock().unwrap().len()
    }
}

#[async_trait]
impl ProviderInvoker for ScriptedInvoker {
    fn name(&self) -> &str {
        &self.name
    }

    fn default_model(&self) -> &str {
        "scripted-model"
    }

    async fn invoke(&self, request: InvokeRequest) -> Result<InvokeOutcome, ProviderError> {
        self.calls.lock().unwrap().push(RecordedCall {
            role: request.role,
            prompt: request.prompt.clone(),
            model: request.model.clone(),
        });

        let step = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| panic!("scripted invoker ran out of steps (role {})", request.role));

        if let Some(ref effect) = step.side_effect {
            effect(&request.cwd);
        }

        Ok(InvokeOutcome {
            success: step.exit_code == 0,
            exit_code: Some(step.exit_code),
            stdout: step.stdout,
            stderr: step.stderr,
            duration: Duration::from_millis(5),
            timed_out: false,
            session_id: None,
            token_usage: None,
        })
    }

    async fn is_available(&self) -> bool {
        true
    }

    fn classify_result(&self, outcome: &InvokeOutcome) -> Option<ProviderErrorKind> {
        if outcome.success {
            return None;
        }
        if outcome.timed_out {
            return Some(ProviderErrorKind::SubprocessHung);
        }
        classify_output_text(&outcome.stderr)
            .or_else(|| classify_output_text(&outcome.stdout))
            .or(Some(ProviderErrorKind::Unknown))
    }
}

/// Build an orchestration context over a project store, a scripted
/// invoker, and a working directory (usually a temp git repo).
pub fn make_context(
    store: &TestProjectStore,
    invoker: Arc<ScriptedInvoker>,
    workdir: PathBuf,
    sink: Arc<RecordingSink>,
) -> OrchestrationContext {
    let mut registry = ProviderRegistry::new();
    registry.register(invoker);

    let mut config = Config::default();
    config.ai.coder.model = "scripted-model".to_string();
    config.ai.reviewer.model = "scripted-model".to_string();
    config.ai.orchestrator.model = "scripted-model".to_string();

    OrchestrationContext {
        pool: store.pool.clone(),
        paths: store.paths.clone(),
        config,
        registry: Arc::new(registry),
        git: Arc::new(CommandGit::new()),
        sink,
        cancel: CancellationToken::new(),
        lease: None,
        workdir,
    }
}
