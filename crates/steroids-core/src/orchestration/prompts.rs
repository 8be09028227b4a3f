//! Prompt builders for the coder, reviewer, orchestrator, and
//! coordinator invocations.

use steroids_db::models::{RejectionEntry, Task};

/// Context assembled for a coder invocation.
#[derive(Debug, Default)]
pub struct CoderContext<'a> {
    /// Resuming an earlier session: only send the delta.
    pub resuming: bool,
    pub rejections: &'a [RejectionEntry],
    /// Coordinator guidance to inject, if any.
    pub guidance: Option<&'a str>,
}

pub fn build_coder_prompt(task: &Task, ctx: &CoderContext<'_>) -> String {
    let mut prompt = String::new();

    if ctx.resuming {
        prompt.push_str(&format!(
            "Continue working on the task: {}\n\n\
             You already have context from the previous session; pick up where you left off.\n",
            task.title
        ));
    } else {
        prompt.push_str(&format!(
            "You are the coder. Implement the following task in this repository:\n\n\
             Task: {}\n",
            task.title
        ));
        if let Some(ref file) = task.file_path {
            prompt.push_str(&format!("Relevant file: {file}\n"));
        }
    }

    if !ctx.rejections.is_empty() {
        prompt.push_str("\nThis task was previously rejected by review:\n");
        for rejection in ctx.rejections {
            prompt.push_str(&format!(
                "  {}. {}\n",
                rejection.rejection_number, rejection.notes
            ));
        }
        prompt.push_str("Address every point above before submitting again.\n");
    }

    if let Some(guidance) = ctx.guidance {
        prompt.push_str(&format!("\nCoordinator guidance:\n{guidance}\n"));
    }

    prompt.push_str(
        "\nWhen done, commit your work with a message containing the task title, \
         then summarize what you changed.\n",
    );
    prompt
}

pub fn build_post_coder_judge_prompt(task: &Task, coder_output: &str, git_status: &str) -> String {
    format!(
        "You are the orchestrator judging a coder's attempt.\n\n\
         Task: {title}\n\n\
         Git status after the attempt:\n{git_status}\n\n\
         Coder output (may be truncated):\n{output}\n\n\
         Respond with ONLY a JSON object:\n\
         {{\"action\": \"submit\" | \"retry\" | \"stage_commit_submit\" | \"error\", \
         \"next_status\": null, \"metadata\": {{}}}}\n\
         Use \"submit\" only when the work is committed and complete; \
         \"stage_commit_submit\" when the work is complete but not yet committed; \
         \"retry\" when the coder should try again.",
        title = task.title,
        git_status = git_status,
        output = truncate(coder_output, 16_000),
    )
}

/// Context assembled for a reviewer invocation.
#[derive(Debug, Default)]
pub struct ReviewContext<'a> {
    pub diff: &'a str,
    pub changed_files: &'a [String],
    pub rejections: &'a [RejectionEntry],
    pub submission_note: Option<&'a str>,
}

pub fn build_reviewer_prompt(task: &Task, ctx: &ReviewContext<'_>) -> String {
    let mut prompt = format!(
        "You are the reviewer. Review the commit under review for this task.\n\n\
         Task: {}\n\nChanged files:\n",
        task.title
    );
    for file in ctx.changed_files {
        prompt.push_str(&format!("  - {file}\n"));
    }
    prompt.push_str(&format!("\nDiff:\n{}\n", truncate(ctx.diff, 48_000)));

    if let Some(note) = ctx.submission_note {
        prompt.push_str(&format!("\nCoder's submission note:\n{note}\n"));
    }

    if !ctx.rejections.is_empty() {
        prompt.push_str("\nPrior rejections of this task:\n");
        for rejection in ctx.rejections {
            prompt.push_str(&format!(
                "  {}. {}\n",
                rejection.rejection_number, rejection.notes
            ));
        }
    }

    prompt.push_str(
        "\nEnd your review with exactly one line:\n\
         DECISION: APPROVE | REJECT | DISPUTE | SKIP\n\
         On REJECT, list the concrete problems first.\n",
    );
    prompt
}

pub fn build_post_reviewer_judge_prompt(task: &Task, reviewer_output: &str) -> String {
    format!(
        "You are the orchestrator extracting the final review decision.\n\n\
         Task: {title}\n\n\
         Reviewer output:\n{output}\n\n\
         Respond with ONLY a JSON object: \
         {{\"decision\": \"approve\" | \"reject\" | \"dispute\" | \"skip\" | \"unclear\", \
         \"notes\": \"...\"}}\n\
         The decision must come from an explicit statement in the reviewer output; \
         if there is none, answer \"unclear\".",
        title = task.title,
        output = truncate(reviewer_output, 24_000),
    )
}

/// Prompt for merging multiple rejection note sets into one checklist.
pub fn build_merge_rejections_prompt(task: &Task, notes: &[String]) -> String {
    let mut prompt = format!(
        "Multiple reviewers rejected the task \"{}\". \
         Merge their notes into a single deduplicated checklist, one item per line.\n\n",
        task.title
    );
    for (i, note) in notes.iter().enumerate() {
        prompt.push_str(&format!("Reviewer {} notes:\n{}\n\n", i + 1, note));
    }
    prompt
}

pub fn build_coordinator_prompt(task: &Task, rejections: &[RejectionEntry]) -> String {
    let mut prompt = format!(
        "You are the coordinator. The task \"{}\" has been rejected {} times and the \
         rejections repeat the same complaint. Decide how to break the loop.\n\n\
         Rejection history:\n",
        task.title,
        rejections.len()
    );
    for rejection in rejections {
        prompt.push_str(&format!(
            "  {}. {}\n",
            rejection.rejection_number, rejection.notes
        ));
    }
    prompt.push_str(
        "\nRespond with ONLY a JSON object:\n\
         {\"action\": \"guide_coder\" | \"override_reviewer\" | \"narrow_scope\", \
         \"guidance\": \"under 500 words\"}\n\
         You must pick one of the three actions; escalating is not an option.\n",
    );
    prompt
}

/// Conflict-resolution prompt for the merge engine's coder phase.
pub fn build_conflict_coder_prompt(
    commit_message: &str,
    conflicted_files: &[String],
    patch: &str,
) -> String {
    let mut prompt = format!(
        "A cherry-pick stopped on conflicts. Resolve them.\n\n\
         Commit being applied:\n{commit_message}\n\nConflicted files:\n"
    );
    for file in conflicted_files {
        prompt.push_str(&format!("  - {file}\n"));
    }
    prompt.push_str(&format!(
        "\nIntended patch:\n{}\n\n\
         Edit the conflicted files to resolve every conflict, stage the result with \
         `git add`, and leave NO conflict markers. Do not run `git cherry-pick --continue`; \
         do not create a commit.\n",
        truncate(patch, 48_000)
    ));
    prompt
}

pub fn build_conflict_reviewer_prompt(commit_message: &str, staged_diff: &str) -> String {
    format!(
        "Review this staged conflict resolution for the commit:\n{commit_message}\n\n\
         Staged diff:\n{diff}\n\n\
         Answer with exactly one line: DECISION: APPROVE or DECISION: REJECT.",
        diff = truncate(staged_diff, 48_000),
    )
}

/// Batch variant: one coder prompt covering a whole section.
pub fn build_batch_coder_prompt(section_name: &str, tasks: &[Task]) -> String {
    let mut prompt = format!(
        "You are the coder. Implement ALL of the following tasks from section \
         \"{section_name}\", committing each separately with a message containing its title.\n\n"
    );
    for task in tasks {
        prompt.push_str(&format!("  - [{}] {}\n", task.id, task.title));
    }
    prompt.push_str("\nSummarize per task what you changed.\n");
    prompt
}

/// Batch variant: one reviewer prompt covering a whole section.
pub fn build_batch_reviewer_prompt(section_name: &str, tasks: &[Task]) -> String {
    let mut prompt = format!(
        "You are the reviewer. The coder just delivered the following tasks from section \
         \"{section_name}\"; each has its own commit whose message contains the task title. \
         Review each commit.\n\n"
    );
    for task in tasks {
        prompt.push_str(&format!("  - [{}] {}\n", task.id, task.title));
    }
    prompt.push_str(
        "\nFor every task, state its id and an explicit decision line:\n\
         DECISION: APPROVE | REJECT | DISPUTE | SKIP\n",
    );
    prompt
}

/// Batch variant: the orchestrator extracts per-task decisions.
pub fn build_batch_judge_prompt(tasks: &[Task], reviewer_output: &str) -> String {
    let mut prompt = String::from(
        "You are the orchestrator extracting per-task review decisions.\n\nTasks:\n",
    );
    for task in tasks {
        prompt.push_str(&format!("  - {} => {}\n", task.id, task.title));
    }
    prompt.push_str(&format!(
        "\nReviewer output:\n{}\n\n\
         Respond with ONLY a JSON array, one entry per task:\n\
         [{{\"task_id\": \"<uuid>\", \"decision\": \"approve|reject|dispute|skip|unclear\", \
         \"notes\": \"...\"}}]\n",
        truncate(reviewer_output, 24_000)
    ));
    prompt
}

fn truncate(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use uuid::Uuid;

    fn task(title: &str) -> Task {
        Task {
            id: Uuid::new_v4(),
            title: title.to_string(),
            status: steroids_db::models::TaskStatus::InProgress,
            section_id: None,
            position: 0,
            priority: 50,
            rejection_count: 0,
            failure_count: 0,
            source_file: None,
            file_path: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn rejection(n: i64, notes: &str) -> RejectionEntry {
        RejectionEntry {
            id: n,
            task_id: Uuid::nil(),
            rejection_number: n,
            notes: notes.to_string(),
            reviewer_provider: "claude".into(),
            reviewer_model: "m".into(),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn coder_prompt_carries_rejections_and_guidance() {
        let t = task("add parser");
        let rejections = vec![rejection(1, "tests missing")];
        let prompt = build_coder_prompt(
            &t,
            &CoderContext {
                resuming: false,
                rejections: &rejections,
                guidance: Some("add coverage for parse()"),
            },
        );
        assert!(prompt.contains("add parser"));
        assert!(prompt.contains("tests missing"));
        assert!(prompt.contains("add coverage for parse()"));
    }

    #[test]
    fn resume_prompt_is_a_delta() {
        let t = task("add parser");
        let prompt = build_coder_prompt(
            &t,
            &CoderContext {
                resuming: true,
                ..Default::default()
            },
        );
        assert!(prompt.contains("Continue working"));
        assert!(!prompt.contains("You are the coder."));
    }

    #[test]
    fn reviewer_prompt_demands_decision_token() {
        let t = task("add parser");
        let files = vec!["src/parse.rs".to_string()];
        let prompt = build_reviewer_prompt(
            &t,
            &ReviewContext {
                diff: "diff --git ...",
                changed_files: &files,
                rejections: &[],
                submission_note: Some("implemented the core"),
            },
        );
        assert!(prompt.contains("DECISION: APPROVE | REJECT | DISPUTE | SKIP"));
        assert!(prompt.contains("src/parse.rs"));
        assert!(prompt.contains("implemented the core"));
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        let s = "aé".repeat(10);
        let cut = truncate(&s, 3);
        assert!(cut.len() <= 3);
        assert!(s.starts_with(cut));
    }
}
