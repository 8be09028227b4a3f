//! Versioned schema definitions for the global and project stores.
//!
//! Each store tracks its schema version in `PRAGMA user_version`. A
//! migration step is a batch of DDL applied inside one transaction;
//! steps are applied strictly in order. The pool takes a point-in-time
//! backup of the database file before applying any step (see
//! [`crate::pool::run_migrations`]).

/// One migration step: everything inside runs in a single transaction.
#[derive(Debug, Clone, Copy)]
pub struct Migration {
    /// The `user_version` after this step is applied (1-indexed).
    pub version: i64,
    /// Batch of DDL statements.
    pub sql: &'static str,
}

/// Schema for the global store (`~/.steroids/steroids.db`).
pub const GLOBAL_MIGRATIONS: &[Migration] = &[Migration {
    version: 1,
    sql: r#"
CREATE TABLE projects (
    path        TEXT PRIMARY KEY,
    name        TEXT NOT NULL,
    enabled     INTEGER NOT NULL DEFAULT 1,
    created_at  TEXT NOT NULL
);

CREATE TABLE runners (
    id               TEXT PRIMARY KEY,
    status           TEXT NOT NULL CHECK (status IN ('idle', 'running', 'stopped')),
    pid              INTEGER,
    project_path     TEXT NOT NULL,
    current_task_id  TEXT,
    started_at       TEXT NOT NULL,
    heartbeat_at     TEXT NOT NULL
);

CREATE INDEX idx_runners_project ON runners (project_path, status);

CREATE TABLE parallel_sessions (
    id               TEXT PRIMARY KEY,
    project_path     TEXT NOT NULL,
    integration_branch TEXT NOT NULL,
    status           TEXT NOT NULL CHECK
        (status IN ('pending', 'running', 'completed', 'failed', 'blocked_conflict')),
    created_at       TEXT NOT NULL
);

CREATE TABLE workstreams (
    id                  TEXT PRIMARY KEY,
    session_id          TEXT NOT NULL REFERENCES parallel_sessions (id),
    clone_path          TEXT NOT NULL,
    runner_id           TEXT,
    claim_generation    INTEGER NOT NULL DEFAULT 0,
    status              TEXT NOT NULL CHECK
        (status IN ('pending', 'running', 'completed', 'failed', 'blocked_conflict')),
    lease_expires_at    TEXT,
    conflict_attempts   INTEGER NOT NULL DEFAULT 0,
    next_retry_at       TEXT,
    last_reconcile_action TEXT,
    last_reconciled_at  TEXT,
    min_position        INTEGER NOT NULL DEFAULT 0,
    sections            TEXT NOT NULL DEFAULT '[]'
);

CREATE INDEX idx_workstreams_session ON workstreams (session_id);

CREATE TABLE merge_locks (
    session_id  TEXT PRIMARY KEY REFERENCES parallel_sessions (id),
    holder_id   TEXT NOT NULL,
    generation  INTEGER NOT NULL DEFAULT 0,
    expires_at  TEXT NOT NULL
);
"#,
}];

/// Schema for a project store (`<project>/.steroids/steroids.db`).
pub const PROJECT_MIGRATIONS: &[Migration] = &[Migration {
    version: 1,
    sql: r#"
CREATE TABLE sections (
    id          TEXT PRIMARY KEY,
    name        TEXT NOT NULL,
    position    INTEGER NOT NULL,
    priority    INTEGER NOT NULL DEFAULT 50 CHECK (priority BETWEEN 0 AND 100),
    skipped     INTEGER NOT NULL DEFAULT 0,
    source_file TEXT,
    created_at  TEXT NOT NULL
);

CREATE TABLE section_dependencies (
    section_id            TEXT NOT NULL REFERENCES sections (id),
    depends_on_section_id TEXT NOT NULL REFERENCES sections (id),
    UNIQUE (section_id, depends_on_section_id)
);

CREATE TABLE tasks (
    id              TEXT PRIMARY KEY,
    title           TEXT NOT NULL,
    status          TEXT NOT NULL DEFAULT 'pending' CHECK (status IN
        ('pending', 'in_progress', 'review', 'completed', 'disputed', 'skipped', 'failed')),
    section_id      TEXT REFERENCES sections (id),
    position        INTEGER NOT NULL DEFAULT 0,
    priority        INTEGER NOT NULL DEFAULT 50,
    rejection_count INTEGER NOT NULL DEFAULT 0 CHECK (rejection_count BETWEEN 0 AND 15),
    failure_count   INTEGER NOT NULL DEFAULT 0,
    source_file     TEXT,
    file_path       TEXT,
    created_at      TEXT NOT NULL,
    updated_at      TEXT NOT NULL
);

CREATE INDEX idx_tasks_section ON tasks (section_id, status);

CREATE TABLE task_locks (
    task_id     TEXT PRIMARY KEY REFERENCES tasks (id),
    runner_id   TEXT NOT NULL,
    expires_at  TEXT NOT NULL
);

CREATE TABLE audit_log (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    task_id     TEXT NOT NULL REFERENCES tasks (id),
    from_status TEXT NOT NULL,
    to_status   TEXT NOT NULL,
    actor       TEXT NOT NULL CHECK (actor IN
        ('coder', 'reviewer', 'orchestrator', 'coordinator', 'operator')),
    notes       TEXT,
    created_at  TEXT NOT NULL
);

CREATE INDEX idx_audit_task ON audit_log (task_id, id);

CREATE TABLE rejections (
    id                INTEGER PRIMARY KEY AUTOINCREMENT,
    task_id           TEXT NOT NULL REFERENCES tasks (id),
    rejection_number  INTEGER NOT NULL,
    notes             TEXT NOT NULL,
    reviewer_provider TEXT NOT NULL,
    reviewer_model    TEXT NOT NULL,
    created_at        TEXT NOT NULL,
    UNIQUE (task_id, rejection_number)
);

CREATE TABLE submission_notes (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    task_id     TEXT NOT NULL REFERENCES tasks (id),
    notes       TEXT NOT NULL,
    created_at  TEXT NOT NULL
);

CREATE TABLE invocations (
    id                       TEXT PRIMARY KEY,
    task_id                  TEXT REFERENCES tasks (id),
    role                     TEXT NOT NULL CHECK (role IN ('coder', 'reviewer', 'orchestrator')),
    provider                 TEXT NOT NULL,
    model                    TEXT NOT NULL,
    prompt                   TEXT NOT NULL,
    started_at_ms            INTEGER NOT NULL,
    completed_at_ms          INTEGER,
    last_activity_at_ms      INTEGER,
    status                   TEXT NOT NULL DEFAULT 'running' CHECK (status IN
        ('running', 'completed', 'failed', 'timeout')),
    exit_code                INTEGER,
    duration_ms              INTEGER,
    stdout                   TEXT,
    stderr                   TEXT,
    success                  INTEGER,
    timed_out                INTEGER,
    session_id               TEXT,
    resumed_from_session_id  TEXT,
    invocation_mode          TEXT NOT NULL DEFAULT 'fresh' CHECK
        (invocation_mode IN ('fresh', 'resume')),
    token_usage              TEXT,
    rejection_number         INTEGER
);

CREATE INDEX idx_invocations_task ON invocations (task_id, role, status);

CREATE TABLE incidents (
    id           TEXT PRIMARY KEY,
    task_id      TEXT,
    runner_id    TEXT,
    failure_mode TEXT NOT NULL CHECK (failure_mode IN
        ('orphaned_task', 'hanging_invocation', 'zombie_runner',
         'dead_runner', 'db_inconsistency', 'credit_exhaustion')),
    detected_at  TEXT NOT NULL,
    resolved_at  TEXT,
    resolution   TEXT,
    details      TEXT NOT NULL DEFAULT '{}',
    created_at   TEXT NOT NULL
);

CREATE INDEX idx_incidents_detected ON incidents (detected_at);

CREATE TABLE merge_progress (
    session_id        TEXT NOT NULL,
    workstream_id     TEXT NOT NULL,
    position          INTEGER NOT NULL,
    commit_sha        TEXT NOT NULL,
    status            TEXT NOT NULL CHECK (status IN ('applied', 'skipped', 'conflict')),
    conflict_task_id  TEXT,
    applied_commit_sha TEXT,
    UNIQUE (session_id, workstream_id, position)
);
"#,
}];
