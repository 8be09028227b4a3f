//! Verdict parsing and the reviewer policy engine.
//!
//! All provider output interpretation lives here: the post-coder judge
//! JSON, the keyword fallback on raw coder output, the post-reviewer
//! decision token, the multi-reviewer policy engine, the coordinator
//! contract, and batch verdict lists. Decision tokens must be explicit;
//! sentiment-based inference is forbidden.

use serde::Deserialize;
use uuid::Uuid;

// -----------------------------------------------------------------------
// JSON extraction
// -----------------------------------------------------------------------

/// Find the first balanced JSON object or array embedded in free text.
///
/// Providers wrap their verdicts in prose and markdown fences; this
/// scans for the first `{`/`[` and returns the balanced slice (string
/// escapes respected).
pub fn extract_json(text: &str) -> Option<&str> {
    let bytes = text.as_bytes();
    let start = text.find(['{', '['])?;
    let open = bytes[start];
    let close = if open == b'{' { b'}' } else { b']' };

    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (offset, &b) in bytes[start..].iter().enumerate() {
        if in_string {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_string = false;
            }
            continue;
        }
        match b {
            b'"' => in_string = true,
            _ if b == open => depth += 1,
            _ if b == close => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..=start + offset]);
                }
            }
            _ => {}
        }
    }
    None
}

// -----------------------------------------------------------------------
// Post-coder judge
// -----------------------------------------------------------------------

/// Action decided by the post-coder judge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CoderAction {
    Submit,
    Retry,
    StageCommitSubmit,
    Error,
}

/// Parsed post-coder verdict.
#[derive(Debug, Clone, Deserialize)]
pub struct PostCoderVerdict {
    pub action: CoderAction,
    #[serde(default)]
    pub next_status: Option<String>,
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
}

impl PostCoderVerdict {
    pub fn submits(&self) -> bool {
        matches!(
            self.action,
            CoderAction::Submit | CoderAction::StageCommitSubmit
        )
    }
}

/// Parse the orchestrator's post-coder verdict out of its output.
/// Returns `None` when no valid verdict JSON is present.
pub fn parse_post_coder_verdict(text: &str) -> Option<PostCoderVerdict> {
    let json = extract_json(text)?;
    serde_json::from_str(json).ok()
}

/// Keyword fallback applied to the coder's own stdout when the judge
/// produced no parseable verdict (or verdicted `error`).
///
/// The fallback *refuses to submit* whenever a negating phrase is
/// present -- even alongside completion language -- and submits only on
/// an unambiguous completion signal.
pub fn fallback_coder_submits(coder_stdout: &str) -> bool {
    const NEGATING: &[&str] = &[
        "not done",
        "not complete",
        "not finished",
        "still working",
        "in progress",
        "error",
        "failed",
        "cannot",
        "unable to",
        "blocked",
        "todo",
    ];
    const COMPLETION: &[&str] = &[
        "task complete",
        "task is complete",
        "implementation complete",
        "all done",
        "work is done",
        "finished implementing",
        "committed the changes",
        "changes are committed",
        "all tests pass",
    ];

    let lower = coder_stdout.to_lowercase();
    if NEGATING.iter().any(|n| lower.contains(n)) {
        return false;
    }
    COMPLETION.iter().any(|c| lower.contains(c))
}

// -----------------------------------------------------------------------
// Post-reviewer judge
// -----------------------------------------------------------------------

/// Reviewer decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReviewDecision {
    Approve,
    Reject,
    Dispute,
    Skip,
    Unclear,
}

impl std::fmt::Display for ReviewDecision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Approve => "approve",
            Self::Reject => "reject",
            Self::Dispute => "dispute",
            Self::Skip => "skip",
            Self::Unclear => "unclear",
        };
        f.write_str(s)
    }
}

/// Parse an explicit decision token.
///
/// Accepted forms (case-insensitive, markdown emphasis stripped):
/// `DECISION: APPROVE`, `DECISION - APPROVE`, `DECISION=APPROVE`,
/// `FINAL DECISION: APPROVE`. A JSON body with a `decision` field also
/// counts. Anything short of an explicit token is `Unclear`.
pub fn parse_decision_token(text: &str) -> ReviewDecision {
    if let Some(json) = extract_json(text) {
        #[derive(Deserialize)]
        struct JsonDecision {
            decision: String,
        }
        if let Ok(parsed) = serde_json::from_str::<JsonDecision>(json) {
            if let Some(decision) = decision_word(&parsed.decision) {
                return decision;
            }
        }
    }

    for line in text.lines() {
        let cleaned: String = line
            .chars()
            .filter(|c| !matches!(c, '*' | '`' | '#' | '_'))
            .collect();
        let upper = cleaned.trim().to_uppercase();

        let Some(idx) = upper.find("DECISION") else {
            continue;
        };
        let rest = upper[idx + "DECISION".len()..]
            .trim_start_matches([' ', ':', '-', '='])
            .trim();
        let word = rest.split_whitespace().next().unwrap_or("");
        if let Some(decision) = decision_word(word) {
            return decision;
        }
    }

    ReviewDecision::Unclear
}

fn decision_word(word: &str) -> Option<ReviewDecision> {
    let word = word.trim_matches(|c: char| !c.is_ascii_alphabetic());
    match word.to_uppercase().as_str() {
        "APPROVE" | "APPROVED" => Some(ReviewDecision::Approve),
        "REJECT" | "REJECTED" => Some(ReviewDecision::Reject),
        "DISPUTE" | "DISPUTED" => Some(ReviewDecision::Dispute),
        "SKIP" | "SKIPPED" => Some(ReviewDecision::Skip),
        _ => None,
    }
}

// -----------------------------------------------------------------------
// Multi-reviewer policy engine
// -----------------------------------------------------------------------

/// One reviewer's verdict, as parsed from its invocation.
#[derive(Debug, Clone)]
pub struct ReviewerVerdict {
    pub decision: ReviewDecision,
    pub notes: String,
    pub provider: String,
    pub model: String,
}

/// Combined outcome of a reviewer panel.
#[derive(Debug, Clone)]
pub struct CombinedReview {
    pub decision: ReviewDecision,
    /// Rejection notes to record. With two or more rejections the
    /// orchestrator merges these into a single checklist downstream.
    pub rejection_notes: Vec<String>,
}

/// Apply the panel policy:
/// all approve -> approve; any reject -> reject; any dispute with no
/// reject -> dispute; all skip -> skip; anything else (mixed
/// approve/skip, any unclear) -> unclear.
pub fn combine_reviews(verdicts: &[ReviewerVerdict]) -> CombinedReview {
    if verdicts.is_empty() {
        return CombinedReview {
            decision: ReviewDecision::Unclear,
            rejection_notes: Vec::new(),
        };
    }

    let rejection_notes: Vec<String> = verdicts
        .iter()
        .filter(|v| v.decision == ReviewDecision::Reject)
        .map(|v| v.notes.clone())
        .collect();

    let count = |d: ReviewDecision| verdicts.iter().filter(|v| v.decision == d).count();

    let decision = if !rejection_notes.is_empty() {
        ReviewDecision::Reject
    } else if count(ReviewDecision::Dispute) > 0 {
        ReviewDecision::Dispute
    } else if count(ReviewDecision::Skip) == verdicts.len() {
        ReviewDecision::Skip
    } else if count(ReviewDecision::Approve) == verdicts.len() {
        ReviewDecision::Approve
    } else {
        ReviewDecision::Unclear
    };

    CombinedReview {
        decision,
        rejection_notes,
    }
}

// -----------------------------------------------------------------------
// Coordinator
// -----------------------------------------------------------------------

/// Coordinator decision after repeated rejections. The coordinator is
/// not allowed to escalate -- it must pick one of these.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CoordinatorAction {
    GuideCoder,
    OverrideReviewer,
    NarrowScope,
}

/// Parsed coordinator response.
#[derive(Debug, Clone)]
pub struct CoordinatorVerdict {
    pub action: CoordinatorAction,
    /// Guidance injected into the coder's next prompt; capped at 500
    /// words.
    pub guidance: String,
}

/// Maximum guidance length in words.
pub const MAX_GUIDANCE_WORDS: usize = 500;

/// Parse the coordinator's response: JSON `{action, guidance}`.
pub fn parse_coordinator_verdict(text: &str) -> Option<CoordinatorVerdict> {
    #[derive(Deserialize)]
    struct Raw {
        action: CoordinatorAction,
        #[serde(default)]
        guidance: String,
    }

    let json = extract_json(text)?;
    let raw: Raw = serde_json::from_str(json).ok()?;

    let words: Vec<&str> = raw.guidance.split_whitespace().collect();
    let guidance = if words.len() > MAX_GUIDANCE_WORDS {
        words[..MAX_GUIDANCE_WORDS].join(" ")
    } else {
        raw.guidance.trim().to_string()
    };

    Some(CoordinatorVerdict {
        action: raw.action,
        guidance,
    })
}

/// Whether the recent rejection notes repeat the same complaint.
///
/// Takes the last three notes and compares them pairwise with a
/// normalized-token Jaccard similarity; a mean of 0.6 or above counts
/// as repeating.
pub fn rejections_repeat(notes: &[String]) -> bool {
    if notes.len() < 2 {
        return false;
    }
    let recent: Vec<&String> = notes.iter().rev().take(3).collect();

    let tokens = |s: &str| -> std::collections::HashSet<String> {
        s.to_lowercase()
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| t.len() > 2)
            .map(|t| t.to_string())
            .collect()
    };

    let mut total = 0.0;
    let mut pairs = 0usize;
    for i in 0..recent.len() {
        for j in (i + 1)..recent.len() {
            let a = tokens(recent[i]);
            let b = tokens(recent[j]);
            let union = a.union(&b).count();
            if union == 0 {
                continue;
            }
            let intersection = a.intersection(&b).count();
            total += intersection as f64 / union as f64;
            pairs += 1;
        }
    }

    pairs > 0 && total / pairs as f64 >= 0.6
}

// -----------------------------------------------------------------------
// Batch verdicts
// -----------------------------------------------------------------------

/// One per-task decision out of a batch judge response.
#[derive(Debug, Clone, Deserialize)]
pub struct BatchItemVerdict {
    pub task_id: Uuid,
    #[serde(deserialize_with = "deserialize_decision")]
    pub decision: ReviewDecision,
    #[serde(default)]
    pub notes: Option<String>,
}

fn deserialize_decision<'de, D: serde::Deserializer<'de>>(
    deserializer: D,
) -> Result<ReviewDecision, D::Error> {
    let raw = String::deserialize(deserializer)?;
    decision_word(&raw).ok_or_else(|| serde::de::Error::custom(format!("bad decision {raw:?}")))
}

/// Parse a batch verdict list. Tasks absent from the response come back
/// as `Unclear` so they are re-reviewed rather than guessed at.
pub fn parse_batch_verdicts(text: &str, expected: &[Uuid]) -> Vec<(Uuid, ReviewDecision, Option<String>)> {
    let parsed: Vec<BatchItemVerdict> = extract_json(text)
        .and_then(|json| serde_json::from_str(json).ok())
        .unwrap_or_default();

    expected
        .iter()
        .map(|&task_id| {
            parsed
                .iter()
                .find(|v| v.task_id == task_id)
                .map(|v| (task_id, v.decision, v.notes.clone()))
                .unwrap_or((task_id, ReviewDecision::Unclear, None))
        })
        .collect()
}

// -----------------------------------------------------------------------
// Tests
// -----------------------------------------------------------------------
