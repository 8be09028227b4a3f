//! Integration tests for the parallel merge engine over real git
//! worktrees.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{ScriptStep, ScriptedInvoker, make_context};
use uuid::Uuid;

use steroids_core::hooks::RecordingSink;
use steroids_core::merge::{MergeError, MergeOutcome, MergeParams, run_merge};
use steroids_db::models::{MergeItemStatus, TaskStatus, WorkstreamStatus};
use steroids_db::queries::{merge_progress, tasks, workstreams as ws_db};
use steroids_test_utils::{
    TestGlobalStore, TestProjectStore, TestRepo, create_global_store, create_project_store, git,
};

struct MergeFixture {
    repo: TestRepo,
    global: TestGlobalStore,
    project: TestProjectStore,
    session_id: Uuid,
    worktree_base: tempfile::TempDir,
}

impl MergeFixture {
    async fn new() -> Self {
        let repo = TestRepo::new();
        let global = create_global_store().await;
        let project = create_project_store().await;
        let session = ws_db::insert_session(
            &global.pool,
            &project.project_root().to_string_lossy(),
            "main",
        )
        .await
        .unwrap();
        Self {
            repo,
            global,
            project,
            session_id: session.id,
            worktree_base: tempfile::tempdir().unwrap(),
        }
    }

    async fn add_workstream(&self, name: &str, min_position: i64) -> (Uuid, std::path::PathBuf) {
        let clone = self
            .repo
            .add_worktree(self.worktree_base.path(), name, &format!("ws-{name}"));
        let ws = ws_db::insert_workstream(
            &self.global.pool,
            self.session_id,
            &clone.to_string_lossy(),
            min_position,
            &[],
        )
        .await
        .unwrap();
        (ws.id, clone)
    }

    fn params(&self, invoker: Arc<ScriptedInvoker>) -> MergeParams {
        let sink = Arc::new(RecordingSink::new());
        let ctx = make_context(&self.project, invoker, self.repo.path.clone(), sink);
        MergeParams {
            ctx,
            global_pool: self.global.pool.clone(),
            session_id: self.session_id,
            integration_branch: "main".to_string(),
            holder_id: Uuid::new_v4(),
            workspace_root: None,
            validation_command: None,
            cleanup_on_success: false,
            backoff_unit: Duration::from_millis(1),
        }
    }
}

#[tokio::test]
async fn clean_merge_applies_all_commits_in_order() {
    let fixture = MergeFixture::new().await;
    let (ws1, clone1) = fixture.add_workstream("w1", 0).await;
    let (_ws2, clone2) = fixture.add_workstream("w2", 1).await;

    TestRepo::commit_file_in(&clone1, "a.txt", "alpha\n", "add alpha");
    TestRepo::commit_file_in(&clone1, "b.txt", "beta\n", "add beta");
    TestRepo::commit_file_in(&clone2, "c.txt", "gamma\n", "add gamma");

    let invoker = Arc::new(ScriptedInvoker::new(vec![]));
    let params = fixture.params(invoker);

    let outcome = run_merge(&params).await.unwrap();
    assert_eq!(
        outcome,
        MergeOutcome {
            applied: 3,
            skipped: 0,
            conflicts_resolved: 0
        }
    );

    for file in ["a.txt", "b.txt", "c.txt"] {
        assert!(fixture.repo.path.join(file).exists(), "{file} merged");
    }

    // Checkpoints recorded for every position of w1.
    let rows = merge_progress::list_for_workstream(
        &fixture.project.pool,
        fixture.session_id,
        ws1,
    )
    .await
    .unwrap();
    assert_eq!(rows.len(), 2);
    assert!(rows.iter().all(|r| r.status == MergeItemStatus::Applied));

    let session = ws_db::get_session(&fixture.global.pool, fixture.session_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(session.status, WorkstreamStatus::Completed);
}

#[tokio::test]
async fn rerun_is_idempotent_over_applied_prefix() {
    let fixture = MergeFixture::new().await;
    let (_ws, clone) = fixture.add_workstream("w1", 0).await;
    TestRepo::commit_file_in(&clone, "a.txt", "alpha\n", "add alpha");

    let params = fixture.params(Arc::new(ScriptedInvoker::new(vec![])));
    let first = run_merge(&params).await.unwrap();
    assert_eq!(first.applied, 1);
    let head_after_first = fixture.repo.head_sha();

    // Reset workstream status so the engine re-walks it.
    let ws_rows = ws_db::list_for_session(&fixture.global.pool, fixture.session_id)
        .await
        .unwrap();
    sqlx::query("UPDATE workstreams SET status = 'pending', runner_id = NULL WHERE id = $1")
        .bind(ws_rows[0].id)
        .execute(&fixture.global.pool)
        .await
        .unwrap();

    let second = run_merge(&params).await.unwrap();
    assert_eq!(second.applied, 0, "no additional cherry-picks for the applied prefix");
    assert_eq!(fixture.repo.head_sha(), head_after_first);
}

#[tokio::test]
async fn conflict_cycle_resolves_with_coder_and_reviewer() {
    let fixture = MergeFixture::new().await;

    // Shared file committed on main first.
    fixture
        .repo
        .commit_file("shared.txt", "base\n", "add shared");

    let (ws1, clone) = fixture.add_workstream("w1", 0).await;
    // The workstream edits the shared file...
    TestRepo::commit_file_in(&clone, "shared.txt", "workstream change\n", "edit shared ws");
    // ...and main diverges on the same line.
    fixture
        .repo
        .commit_file("shared.txt", "main change\n", "edit shared main");

    let invoker = Arc::new(ScriptedInvoker::new(vec![
        // Conflict coder: resolve and stage, no markers left.
        ScriptStep::ok("resolved the conflict").with_effect(|cwd| {
            std::fs::write(cwd.join("shared.txt"), "merged change\n").unwrap();
            git(cwd, &["add", "shared.txt"]);
        }),
        // Conflict reviewer: explicit token.
        ScriptStep::ok("DECISION: APPROVE"),
    ]));
    let params = fixture.params(Arc::clone(&invoker));

    let outcome = run_merge(&params).await.unwrap();
    assert_eq!(outcome.conflicts_resolved, 1);

    let merged = std::fs::read_to_string(fixture.repo.path.join("shared.txt")).unwrap();
    assert_eq!(merged, "merged change\n");

    // Checkpoint shows applied with the conflict task attached.
    let rows = merge_progress::list_for_workstream(
        &fixture.project.pool,
        fixture.session_id,
        ws1,
    )
    .await
    .unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].status, MergeItemStatus::Applied);
    let conflict_task_id = rows[0].conflict_task_id.expect("conflict task recorded");

    let task = tasks::get_task(&fixture.project.pool, conflict_task_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(task.status, TaskStatus::Completed);
    assert!(task.title.contains("merge conflict"));

    // Conflict bookkeeping cleared on success.
    let ws = ws_db::get_workstream(&fixture.global.pool, ws1).await.unwrap().unwrap();
    assert_eq!(ws.conflict_attempts, 0);
}

#[tokio::test]
async fn conflict_attempt_limit_blocks_the_session() {
    let fixture = MergeFixture::new().await;

    fixture.repo.commit_file("shared.txt", "base\n", "add shared");
    let (ws1, clone) = fixture.add_workstream("w1", 0).await;
    TestRepo::commit_file_in(&clone, "shared.txt", "workstream change\n", "edit shared ws");
    fixture
        .repo
        .commit_file("shared.txt", "main change\n", "edit shared main");

    // Six cycles of coder-stages / reviewer-rejects before the cap
    // trips on the seventh attempt record.
    let mut steps = Vec::new();
    for _ in 0..6 {
        steps.push(ScriptStep::ok("staged a resolution").with_effect(|cwd| {
            std::fs::write(cwd.join("shared.txt"), "attempted fix\n").unwrap();
            git(cwd, &["add", "shared.txt"]);
        }));
        steps.push(ScriptStep::ok("DECISION: REJECT"));
    }
    let params = fixture.params(Arc::new(ScriptedInvoker::new(steps)));

    let result = run_merge(&params).await;
    assert!(
        matches!(result, Err(MergeError::ConflictAttemptLimit { workstream_id }) if workstream_id == ws1)
    );

    let ws = ws_db::get_workstream(&fixture.global.pool, ws1).await.unwrap().unwrap();
    assert_eq!(ws.status, WorkstreamStatus::Failed);
    let session = ws_db::get_session(&fixture.global.pool, fixture.session_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(session.status, WorkstreamStatus::BlockedConflict);
}

#[tokio::test]
async fn validation_gate_failure_preserves_state() {
    let fixture = MergeFixture::new().await;
    let (ws1, clone) = fixture.add_workstream("w1", 0).await;
    TestRepo::commit_file_in(&clone, "a.txt", "alpha\n", "add alpha");

    let mut params = fixture.params(Arc::new(ScriptedInvoker::new(vec![])));
    params.validation_command = Some("exit 3".to_string());

    let result = run_merge(&params).await;
    assert!(matches!(
        result,
        Err(MergeError::ValidationFailed { exit_code: Some(3), .. })
    ));

    // The applied checkpoint survives for the retry.
    let rows = merge_progress::list_for_workstream(
        &fixture.project.pool,
        fixture.session_id,
        ws1,
    )
    .await
    .unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].status, MergeItemStatus::Applied);

    // The workstream was not marked completed.
    let ws = ws_db::get_workstream(&fixture.global.pool, ws1).await.unwrap().unwrap();
    assert_ne!(ws.status, WorkstreamStatus::Completed);
}

#[tokio::test]
async fn dirty_integration_worktree_is_refused() {
    let fixture = MergeFixture::new().await;
    let (_ws, clone) = fixture.add_workstream("w1", 0).await;
    TestRepo::commit_file_in(&clone, "a.txt", "alpha\n", "add alpha");

    // Uncommitted droppings in the integration worktree.
    std::fs::write(fixture.repo.path.join("README.md"), "# dirty\n").unwrap();

    let params = fixture.params(Arc::new(ScriptedInvoker::new(vec![])));
    let result = run_merge(&params).await;
    assert!(matches!(result, Err(MergeError::DirtyWorktree)));
}
