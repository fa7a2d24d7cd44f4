//! Versioned schema. Append a new `Migration` for any table change;
//! never edit an applied migration.

pub struct Migration {
    pub version: i64,
    pub name: &'static str,
    pub sql: &'static str,
}

pub const MIGRATIONS: &[Migration] = &[Migration {
    version: 1,
    name: "initial schema",
    sql: r#"
    CREATE TABLE sessions (
        id TEXT PRIMARY KEY,
        name TEXT NOT NULL,
        prompt TEXT NOT NULL,
        repo_root TEXT NOT NULL,
        base_branch TEXT NOT NULL,
        branch_name TEXT NOT NULL,
        worktree_path TEXT NOT NULL,
        status TEXT NOT NULL,
        mode TEXT NOT NULL,
        script_command TEXT,
        model_override TEXT,
        thread_id TEXT,
        created_at TEXT NOT NULL,
        last_run_at TEXT,
        batch_run_id TEXT REFERENCES batch_runs(id),
        UNIQUE (repo_root, branch_name)
    );

    CREATE TABLE iterations (
        id TEXT PRIMARY KEY,
        session_id TEXT NOT NULL REFERENCES sessions(id) ON DELETE CASCADE,
        started_at TEXT NOT NULL,
        ended_at TEXT,
        commit_sha TEXT,
        changed_files INTEGER NOT NULL DEFAULT 0,
        exit_code INTEGER,
        test_result TEXT,
        prompt_tokens INTEGER,
        completion_tokens INTEGER,
        total_tokens INTEGER,
        model TEXT,
        agent_version TEXT,
        command_line TEXT,
        output TEXT
    );

    CREATE TABLE tool_calls (
        id TEXT PRIMARY KEY,
        session_id TEXT NOT NULL REFERENCES sessions(id) ON DELETE CASCADE,
        iteration_id TEXT NOT NULL REFERENCES iterations(id) ON DELETE CASCADE,
        ts TEXT NOT NULL,
        tool_name TEXT NOT NULL,
        arguments TEXT NOT NULL,
        success INTEGER NOT NULL,
        duration_ms INTEGER,
        message_id TEXT
    );

    CREATE TABLE threads (
        id TEXT PRIMARY KEY,
        session_id TEXT NOT NULL REFERENCES sessions(id) ON DELETE CASCADE,
        created_at TEXT NOT NULL
    );

    CREATE TABLE thread_messages (
        id TEXT PRIMARY KEY,
        thread_id TEXT NOT NULL REFERENCES threads(id) ON DELETE CASCADE,
        idx INTEGER NOT NULL,
        role TEXT NOT NULL,
        content TEXT NOT NULL,
        created_at TEXT NOT NULL,
        UNIQUE (thread_id, idx)
    );

    CREATE TABLE follow_up_prompts (
        id TEXT PRIMARY KEY,
        session_id TEXT NOT NULL REFERENCES sessions(id) ON DELETE CASCADE,
        prompt TEXT NOT NULL,
        created_at TEXT NOT NULL
    );

    CREATE TABLE batch_runs (
        id TEXT PRIMARY KEY,
        defaults_json TEXT NOT NULL,
        concurrency INTEGER NOT NULL,
        created_at TEXT NOT NULL,
        status TEXT NOT NULL
    );

    CREATE TABLE batch_items (
        id TEXT PRIMARY KEY,
        run_id TEXT NOT NULL REFERENCES batch_runs(id) ON DELETE CASCADE,
        repo_path TEXT NOT NULL,
        prompt TEXT NOT NULL,
        status TEXT NOT NULL,
        session_id TEXT,
        started_at TEXT,
        finished_at TEXT,
        commit_sha TEXT,
        token_total INTEGER,
        tool_call_count INTEGER NOT NULL DEFAULT 0,
        error TEXT
    );

    CREATE INDEX idx_iterations_session ON iterations(session_id, started_at);
    CREATE INDEX idx_tool_calls_session ON tool_calls(session_id);
    CREATE INDEX idx_tool_calls_iteration ON tool_calls(iteration_id);
    CREATE INDEX idx_thread_messages_thread ON thread_messages(thread_id, idx);
    CREATE INDEX idx_batch_items_run ON batch_items(run_id);
    "#,
}];
