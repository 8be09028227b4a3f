//! Integration tests for the orchestration loop: the full
//! coder/judge/reviewer/judge cycle over a real temp git repository
//! with a scripted provider.

mod common;

use std::sync::Arc;

use common::{ScriptStep, ScriptedInvoker, make_context};

use steroids_core::hooks::RecordingSink;
use steroids_core::orchestration::{OrchestrationError, TaskOutcome, run_task};
use steroids_db::models::{ProviderRole, TaskStatus};
use steroids_db::queries::{audit, sections, tasks};
use steroids_test_utils::{TestRepo, create_project_store, git};

async fn seed_task(
    pool: &sqlx::SqlitePool,
    title: &str,
) -> steroids_db::models::Task {
    let section = steroids_db::models::section_id("PLAN.md", "core");
    sections::upsert_section(pool, &section, "core", 0, 50, Some("PLAN.md"))
        .await
        .unwrap();
    tasks::insert_task(pool, title, Some(&section), 0, 50, Some("PLAN.md"), None)
        .await
        .unwrap()
}

fn coder_commits(title: &str) -> ScriptStep {
    let title = title.to_string();
    ScriptStep::ok("Implementation complete and committed the changes.").with_effect(move |cwd| {
        std::fs::write(cwd.join("feature.rs"), "pub fn feature() {}\n").unwrap();
        git(cwd, &["add", "-A"]);
        git(cwd, &["commit", "-m", &title]);
    })
}

#[tokio::test]
async fn happy_path_completes_task_and_fires_hooks_once() {
    let store = create_project_store().await;
    let repo = TestRepo::new();
    let task = seed_task(&store.pool, "add feature module").await;

    let invoker = Arc::new(ScriptedInvoker::new(vec![
        // Coder writes a commit.
        coder_commits("add feature module"),
        // Post-coder judge: submit.
        ScriptStep::ok(r#"{"action": "submit", "metadata": {"note": "added feature()"}}"#),
        // Reviewer approves with an explicit token.
        ScriptStep::ok("Looks correct.\nDECISION: APPROVE"),
    ]));
    let sink = Arc::new(RecordingSink::new());
    let ctx = make_context(&store, Arc::clone(&invoker), repo.path.clone(), Arc::clone(&sink));

    let outcome = run_task(&ctx, task.id).await.unwrap();
    assert_eq!(outcome, TaskOutcome::Completed);

    let task = tasks::get_task(&store.pool, task.id).await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Completed);

    // Audit trail walks pending -> in_progress -> review -> completed.
    let trail = audit::list_audit_for_task(&store.pool, task.id).await.unwrap();
    let statuses: Vec<(TaskStatus, TaskStatus)> =
        trail.iter().map(|e| (e.from_status, e.to_status)).collect();
    assert_eq!(
        statuses,
        vec![
            (TaskStatus::Pending, TaskStatus::InProgress),
            (TaskStatus::InProgress, TaskStatus::Review),
            (TaskStatus::Review, TaskStatus::Completed),
        ]
    );

    // Submission note recorded from the judge metadata.
    let note = audit::latest_submission_note(&store.pool, task.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(note.notes, "added feature()");

    // task.completed fired exactly once, in lifecycle order.
    let names = sink.names();
    assert_eq!(
        names.iter().filter(|n| **n == "task.completed").count(),
        1
    );
    let updated_idx = names.iter().position(|n| *n == "task.updated").unwrap();
    let completed_idx = names.iter().position(|n| *n == "task.completed").unwrap();
    assert!(updated_idx < completed_idx);

    assert_eq!(invoker.remaining(), 0, "all scripted steps consumed");
}

#[tokio::test]
async fn rejection_records_entry_and_returns_to_in_progress() {
    let store = create_project_store().await;
    let repo = TestRepo::new();
    let task = seed_task(&store.pool, "add parser").await;

    let invoker = Arc::new(ScriptedInvoker::new(vec![
        coder_commits("add parser"),
        ScriptStep::ok(r#"{"action": "submit"}"#),
        ScriptStep::ok("The tests are missing.\nDECISION: REJECT"),
    ]));
    let sink = Arc::new(RecordingSink::new());
    let ctx = make_context(&store, invoker, repo.path.clone(), sink);

    let outcome = run_task(&ctx, task.id).await.unwrap();
    assert_eq!(outcome, TaskOutcome::Rejected { rejection_number: 1 });

    let task = tasks::get_task(&store.pool, task.id).await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::InProgress);
    assert_eq!(task.rejection_count, 1);

    let rejections = audit::list_rejections_for_task(&store.pool, task.id)
        .await
        .unwrap();
    assert_eq!(rejections.len(), 1);
    assert!(rejections[0].notes.contains("tests are missing"));
}

#[tokio::test]
async fn coordinator_guidance_reaches_next_coder_prompt() {
    let store = create_project_store().await;
    let repo = TestRepo::new();
    let task = seed_task(&store.pool, "add parser").await;

    // Three identical rejections on record: the coordinator kicks in.
    sqlx::query("UPDATE tasks SET rejection_count = 3, status = 'in_progress' WHERE id = $1")
        .bind(task.id)
        .execute(&store.pool)
        .await
        .unwrap();
    for n in 1..=3 {
        sqlx::query(
            "INSERT INTO rejections \
                 (task_id, rejection_number, notes, reviewer_provider, reviewer_model, created_at) \
             VALUES ($1, $2, 'tests missing', 'claude', 'm', $3)",
        )
        .bind(task.id)
        .bind(n)
        .bind(chrono::Utc::now())
        .execute(&store.pool)
        .await
        .unwrap();
    }

    let invoker = Arc::new(ScriptedInvoker::new(vec![
        // Coordinator decides to guide the coder.
        ScriptStep::ok(r#"{"action": "guide_coder", "guidance": "add coverage for parse()"}"#),
        coder_commits("add parser"),
        ScriptStep::ok(r#"{"action": "submit"}"#),
        ScriptStep::ok("DECISION: APPROVE"),
    ]));
    let sink = Arc::new(RecordingSink::new());
    let ctx = make_context(&store, Arc::clone(&invoker), repo.path.clone(), sink);

    let outcome = run_task(&ctx, task.id).await.unwrap();
    assert_eq!(outcome, TaskOutcome::Completed);

    let calls = invoker.recorded();
    // Call 0 is the coordinator (orchestrator role), call 1 the coder.
    assert_eq!(calls[0].role, ProviderRole::Orchestrator);
    assert_eq!(calls[1].role, ProviderRole::Coder);
    assert!(
        calls[1].prompt.contains("add coverage for parse()"),
        "coder prompt must carry the coordinator guidance"
    );
    // Rejection history rides along too.
    assert!(calls[1].prompt.contains("tests missing"));
}

#[tokio::test]
async fn rejection_cap_forces_dispute() {
    let store = create_project_store().await;
    let repo = TestRepo::new();
    let task = seed_task(&store.pool, "add parser").await;

    // At the cap, in review: the next cycle must dispute regardless of
    // the panel's answer.
    sqlx::query("UPDATE tasks SET rejection_count = 15, status = 'review' WHERE id = $1")
        .bind(task.id)
        .execute(&store.pool)
        .await
        .unwrap();
    // The review transition the invariant requires.
    sqlx::query(
        "INSERT INTO audit_log (task_id, from_status, to_status, actor, created_at) \
         VALUES ($1, 'in_progress', 'review', 'coder', $2)",
    )
    .bind(task.id)
    .bind(chrono::Utc::now())
    .execute(&store.pool)
    .await
    .unwrap();

    let invoker = Arc::new(ScriptedInvoker::new(vec![
        // Reviewer tries to reject again; the cap overrides it.
        ScriptStep::ok("Still bad.\nDECISION: REJECT"),
    ]));
    let sink = Arc::new(RecordingSink::new());
    let ctx = make_context(&store, invoker, repo.path.clone(), Arc::clone(&sink));

    let outcome = run_task(&ctx, task.id).await.unwrap();
    assert_eq!(outcome, TaskOutcome::Disputed);

    let task = tasks::get_task(&store.pool, task.id).await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Disputed);
    assert_eq!(task.rejection_count, 15, "count never exceeds the cap");
    assert!(sink.names().contains(&"dispute.created"));
}

#[tokio::test]
async fn unclear_decision_stays_in_review() {
    let store = create_project_store().await;
    let repo = TestRepo::new();
    let task = seed_task(&store.pool, "add parser").await;

    let invoker = Arc::new(ScriptedInvoker::new(vec![
        coder_commits("add parser"),
        ScriptStep::ok(r#"{"action": "submit"}"#),
        // Reviewer rambles without a token...
        ScriptStep::ok("Interesting work, some thoughts below."),
        // ...and the post-reviewer judge cannot extract one either.
        ScriptStep::ok(r#"{"decision": "unclear"}"#),
    ]));
    let sink = Arc::new(RecordingSink::new());
    let ctx = make_context(&store, invoker, repo.path.clone(), sink);

    let outcome = run_task(&ctx, task.id).await.unwrap();
    assert_eq!(outcome, TaskOutcome::StayedInReview);

    let task = tasks::get_task(&store.pool, task.id).await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Review, "re-reviewed next cycle");
}

#[tokio::test]
async fn judge_parse_failure_falls_back_and_refuses_on_negation() {
    let store = create_project_store().await;
    let repo = TestRepo::new();
    let task = seed_task(&store.pool, "add parser").await;

    let invoker = Arc::new(ScriptedInvoker::new(vec![
        // Coder reports an error; no commit.
        ScriptStep::ok("I hit an error and the work is not done."),
        // Judge output is garbage, forcing the keyword fallback.
        ScriptStep::ok("I could not decide, sorry!"),
    ]));
    let sink = Arc::new(RecordingSink::new());
    let ctx = make_context(&store, invoker, repo.path.clone(), sink);

    let outcome = run_task(&ctx, task.id).await.unwrap();
    assert_eq!(outcome, TaskOutcome::NotSubmitted);

    let task = tasks::get_task(&store.pool, task.id).await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::InProgress);
    assert_eq!(task.failure_count, 1);
}

#[tokio::test]
async fn credit_exhaustion_surfaces_for_the_pause_controller() {
    let store = create_project_store().await;
    let repo = TestRepo::new();
    let task = seed_task(&store.pool, "add parser").await;

    let invoker = Arc::new(ScriptedInvoker::new(vec![ScriptStep::fail(
        "Your credit balance is too low",
    )]));
    let sink = Arc::new(RecordingSink::new());
    let ctx = make_context(&store, invoker, repo.path.clone(), sink);

    let result = run_task(&ctx, task.id).await;
    match result {
        Err(OrchestrationError::CreditExhausted { role, .. }) => {
            assert_eq!(role, ProviderRole::Coder);
        }
        other => panic!("expected CreditExhausted, got {other:?}"),
    }
}

#[tokio::test]
async fn stage_commit_submit_commits_the_worktree() {
    let store = create_project_store().await;
    let repo = TestRepo::new();
    let task = seed_task(&store.pool, "add staged feature").await;
    let head_before = repo.head_sha();

    let invoker = Arc::new(ScriptedInvoker::new(vec![
        // Coder edits but forgets to commit.
        ScriptStep::ok("Implementation complete.").with_effect(|cwd| {
            std::fs::write(cwd.join("staged.rs"), "pub fn staged() {}\n").unwrap();
        }),
        ScriptStep::ok(r#"{"action": "stage_commit_submit"}"#),
        ScriptStep::ok("DECISION: APPROVE"),
    ]));
    let sink = Arc::new(RecordingSink::new());
    let ctx = make_context(&store, invoker, repo.path.clone(), sink);

    let outcome = run_task(&ctx, task.id).await.unwrap();
    assert_eq!(outcome, TaskOutcome::Completed);
    assert_ne!(repo.head_sha(), head_before, "the loop committed the work");
}

#[tokio::test]
async fn batch_mode_applies_per_task_verdicts() {
    use steroids_core::orchestration::run_section_batch;

    let store = create_project_store().await;
    let repo = TestRepo::new();

    let section = steroids_db::models::section_id("PLAN.md", "batch");
    sections::upsert_section(&store.pool, &section, "batch", 0, 50, Some("PLAN.md"))
        .await
        .unwrap();
    let task_a = tasks::insert_task(&store.pool, "batch alpha", Some(&section), 0, 50, None, None)
        .await
        .unwrap();
    let task_b = tasks::insert_task(&store.pool, "batch beta", Some(&section), 1, 50, None, None)
        .await
        .unwrap();

    let batch_judge = format!(
        r#"[{{"task_id": "{}", "decision": "approve"}},
            {{"task_id": "{}", "decision": "reject", "notes": "beta lacks tests"}}]"#,
        task_a.id, task_b.id
    );

    let invoker = Arc::new(ScriptedInvoker::new(vec![
        // One coder invocation covers the whole section; it commits
        // each task separately and reports a submit verdict.
        ScriptStep::ok(r#"All tasks delivered. {"action": "submit"}"#).with_effect(|cwd| {
            for (file, title) in [("alpha.rs", "batch alpha"), ("beta.rs", "batch beta")] {
                std::fs::write(cwd.join(file), "pub fn it() {}\n").unwrap();
                git(cwd, &["add", "-A"]);
                git(cwd, &["commit", "-m", title]);
            }
        }),
        // One reviewer invocation for everything submitted.
        ScriptStep::ok("alpha looks good, beta lacks tests"),
        // The batch judge extracts a per-task verdict list.
        ScriptStep::ok(batch_judge),
    ]));
    let sink = Arc::new(RecordingSink::new());
    let ctx = make_context(&store, Arc::clone(&invoker), repo.path.clone(), sink);

    let results = run_section_batch(&ctx, &section).await.unwrap();
    assert_eq!(results.len(), 2);
    assert_eq!(invoker.remaining(), 0);

    let a = tasks::get_task(&store.pool, task_a.id).await.unwrap().unwrap();
    assert_eq!(a.status, TaskStatus::Completed);

    let b = tasks::get_task(&store.pool, task_b.id).await.unwrap().unwrap();
    assert_eq!(b.status, TaskStatus::InProgress);
    assert_eq!(b.rejection_count, 1);
    let rejections = audit::list_rejections_for_task(&store.pool, task_b.id)
        .await
        .unwrap();
    assert_eq!(rejections.len(), 1);
    assert!(rejections[0].notes.contains("beta lacks tests"));
}

#[tokio::test]
async fn invocations_are_recorded_with_terminal_status() {
    let store = create_project_store().await;
    let repo = TestRepo::new();
    let task = seed_task(&store.pool, "add parser").await;

    let invoker = Arc::new(ScriptedInvoker::new(vec![
        coder_commits("add parser"),
        ScriptStep::ok(r#"{"action": "submit"}"#),
        ScriptStep::ok("DECISION: APPROVE"),
    ]));
    let sink = Arc::new(RecordingSink::new());
    let ctx = make_context(&store, invoker, repo.path.clone(), sink);

    run_task(&ctx, task.id).await.unwrap();

    let rows: Vec<(String, String)> = sqlx::query_as(
        "SELECT role, status FROM invocations WHERE task_id = $1",
    )
    .bind(task.id)
    .fetch_all(&store.pool)
    .await
    .unwrap();
    assert_eq!(rows.len(), 3);
    assert!(rows.iter().all(|(_, status)| status == "completed"));
    let mut roles: Vec<&str> = rows.iter().map(|(role, _)| role.as_str()).collect();
    roles.sort();
    assert_eq!(roles, vec!["coder", "orchestrator", "reviewer"]);
}
