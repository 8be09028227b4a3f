//! Claude Code invoker.
//!
//! Shells `claude -p --output-format stream-json` as a subprocess.
//! Stdout and stderr are drained on independent tasks so neither pipe
//! can back-pressure the child; every line resets the activity timeout
//! and is forwarded on the request's activity channel. Session ids and
//! token usage are parsed out of the stream-json lines.

use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use steroids_db::models::TokenUsage;

use super::{
    ActivityChunk, InvokeOutcome, InvokeRequest, OutputStream, ProviderError, ProviderErrorKind,
    ProviderInvoker, classify_output_text,
};

/// Grace period between SIGTERM and SIGKILL.
const KILL_GRACE: Duration = Duration::from_secs(5);

/// Invoker for the `claude` CLI.
#[derive(Debug, Clone)]
pub struct ClaudeCliInvoker {
    binary_path: String,
    default_model: String,
}

impl ClaudeCliInvoker {
    /// Create an invoker that finds `claude` on `$PATH`.
    pub fn new(default_model: impl Into<String>) -> Self {
        Self {
            binary_path: "claude".to_string(),
            default_model: default_model.into(),
        }
    }

    /// Use a custom binary path (tests, non-standard installs).
    pub fn with_binary(path: impl Into<String>, default_model: impl Into<String>) -> Self {
        Self {
            binary_path: path.into(),
            default_model: default_model.into(),
        }
    }
}

/// Fields harvested from one stream-json line.
#[derive(Debug, Default)]
struct ParsedLine {
    session_id: Option<String>,
    token_usage: Option<TokenUsage>,
}

/// Extract session id and token usage from a stream-json line. Lines
/// that are not JSON (plain stderr noise) parse to an empty result.
fn parse_stream_json_line(line: &str) -> ParsedLine {
    let mut parsed = ParsedLine::default();
    let Ok(v) = serde_json::from_str::<serde_json::Value>(line) else {
        return parsed;
    };

    if let Some(sid) = v.get("session_id").and_then(|s| s.as_str()) {
        parsed.session_id = Some(sid.to_string());
    }

    let usage = v
        .get("usage")
        .or_else(|| v.get("message").and_then(|m| m.get("usage")));
    if let Some(usage) = usage {
        let input_tokens = usage
            .get("input_tokens")
            .and_then(|n| n.as_u64())
            .unwrap_or(0);
        let output_tokens = usage
            .get("output_tokens")
            .and_then(|n| n.as_u64())
            .unwrap_or(0);
        if input_tokens > 0 || output_tokens > 0 {
            parsed.token_usage = Some(TokenUsage {
                input_tokens,
                output_tokens,
            });
        }
    }

    parsed
}

/// Terminate a child: SIGTERM, wait [`KILL_GRACE`], then SIGKILL.
async fn kill_with_grace(child: &mut Child) {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        // SAFETY: pid is a valid id of a child we spawned.
        let ret = unsafe { libc::kill(pid as i32, libc::SIGTERM) };
        if ret != 0 {
            warn!(pid, "SIGTERM failed, proceeding to SIGKILL");
        }
    }

    match tokio::time::timeout(KILL_GRACE, child.wait()).await {
        Ok(Ok(_status)) => {
            debug!("subprocess exited after SIGTERM");
        }
        _ => {
            debug!("subprocess did not exit after SIGTERM, sending SIGKILL");
            let _ = child.kill().await;
        }
    }
}

/// Spawn a line reader for one pipe, feeding the shared chunk channel.
fn spawn_reader<R>(reader: R, stream: OutputStream, tx: mpsc::Sender<ActivityChunk>)
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    let chunk = ActivityChunk {
                        stream,
                        line,
                        at_ms: Utc::now().timestamp_millis(),
                    };
                    if tx.send(chunk).await.is_err() {
                        break;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    warn!(error = %e, "error reading provider output");
                    break;
                }
            }
        }
    });
}

#[async_trait]
impl ProviderInvoker for ClaudeCliInvoker {
    fn name(&self) -> &str {
        "claude"
    }

    fn default_model(&self) -> &str {
        &self.default_model
    }

    async fn invoke(&self, request: InvokeRequest) -> Result<InvokeOutcome, ProviderError> {
        let started = Instant::now();

        let mut cmd = Command::new(&self.binary_path);
        cmd.arg("-p")
            .arg("--output-format")
            .arg("stream-json")
            .arg("--verbose")
            .arg("--model")
            .arg(&request.model);

        if let Some(ref session) = request.resume_session_id {
            cmd.arg("--resume").arg(session);
        }

        cmd.current_dir(&request.cwd);

        if let Some(ref home) = request.provider_home {
            std::fs::create_dir_all(home).map_err(ProviderError::Io)?;
            cmd.env("HOME", home);
        }

        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ProviderError::Unavailable(self.binary_path.clone())
            } else {
                ProviderError::Spawn(e)
            }
        })?;

        // The prompt goes in on stdin; closing it starts processing.
        if let Some(mut stdin) = child.stdin.take() {
            if let Err(e) = stdin.write_all(request.prompt.as_bytes()).await {
                warn!(error = %e, "failed to write prompt to provider stdin");
            }
            drop(stdin);
        }

        // Independent drains for each pipe so neither can block the child.
        let (tx, mut rx) = mpsc::channel::<ActivityChunk>(64);
        if let Some(stdout) = child.stdout.take() {
            spawn_reader(stdout, OutputStream::Stdout, tx.clone());
        }
        if let Some(stderr) = child.stderr.take() {
            spawn_reader(stderr, OutputStream::Stderr, tx.clone());
        }
        drop(tx);

        let mut stdout = String::new();
        let mut stderr = String::new();
        let mut session_id = request.resume_session_id.clone();
        let mut token_usage: Option<TokenUsage> = None;
        let mut timed_out = false;

        // Activity-based timeout: the sleep is re-armed on every chunk,
        // so only silence kills the subprocess.
        loop {
            tokio::select! {
                chunk = rx.recv() => {
                    let Some(chunk) = chunk else { break };
                    match chunk.stream {
                        OutputStream::Stdout => {
                            let parsed = parse_stream_json_line(&chunk.line);
                            if let Some(sid) = parsed.session_id {
                                session_id = Some(sid);
                            }
                            if let Some(usage) = parsed.token_usage {
                                token_usage = Some(usage);
                            }
                            stdout.push_str(&chunk.line);
                            stdout.push('\n');
                        }
                        OutputStream::Stderr => {
                            stderr.push_str(&chunk.line);
                            stderr.push('\n');
                        }
                    }
                    if let Some(ref activity) = request.activity {
                        let _ = activity.send(chunk);
                    }
                }
                _ = tokio::time::sleep(request.timeout) => {
                    warn!(
                        timeout_ms = request.timeout.as_millis() as u64,
                        "provider silent past activity timeout, killing"
                    );
                    timed_out = true;
                    kill_with_grace(&mut child).await;
                    break;
                }
            }
        }

        let exit_code = if timed_out {
            child.try_wait().ok().flatten().and_then(|s| s.code())
        } else {
            match tokio::time::timeout(KILL_GRACE, child.wait()).await {
                Ok(Ok(status)) => status.code(),
                Ok(Err(e)) => return Err(ProviderError::Io(e)),
                Err(_elapsed) => {
                    // Pipes closed but the process lingers.
                    timed_out = true;
                    kill_with_grace(&mut child).await;
                    None
                }
            }
        };

        let success = !timed_out && exit_code == Some(0);

        Ok(InvokeOutcome {
            success,
            exit_code,
            stdout,
            stderr,
            duration: started.elapsed(),
            timed_out,
            session_id,
            token_usage,
        })
    }

    async fn is_available(&self) -> bool {
        let probe = Command::new(&self.binary_path)
            .arg("--version")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .status();

        match tokio::time::timeout(Duration::from_secs(10), probe).await {
            Ok(Ok(status)) => status.success(),
            _ => false,
        }
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
