/// Append-only schema history. Never rewrite an entry; add a new version.
pub(crate) const MIGRATIONS: &[(i64, &str)] = &[
    (
        1,
        "
        CREATE TABLE messages (
            id TEXT PRIMARY KEY,
            channel TEXT NOT NULL,
            direction TEXT NOT NULL,
            external_id TEXT,
            sender TEXT NOT NULL,
            recipients TEXT NOT NULL DEFAULT '[]',
            subject TEXT,
            body TEXT NOT NULL,
            metadata TEXT NOT NULL DEFAULT '{}',
            status TEXT NOT NULL DEFAULT 'new',
            task_id TEXT,
            thread_id TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        CREATE TABLE tasks (
            id TEXT PRIMARY KEY,
            task_type TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'pending',
            priority TEXT NOT NULL DEFAULT 'normal',
            payload TEXT NOT NULL DEFAULT '{}',
            source_channel TEXT,
            source_message_id TEXT,
            agent_id TEXT,
            conductor_id TEXT,
            result TEXT,
            retry_count INTEGER NOT NULL DEFAULT 0,
            max_retries INTEGER NOT NULL DEFAULT 3,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            completed_at TEXT
        );

        CREATE TABLE sessions (
            id TEXT PRIMARY KEY,
            agent_id TEXT NOT NULL,
            task_id TEXT NOT NULL,
            container_id TEXT,
            status TEXT NOT NULL DEFAULT 'starting',
            started_at TEXT NOT NULL,
            stopped_at TEXT
        );

        CREATE INDEX idx_messages_status ON messages(status, created_at);
        CREATE INDEX idx_messages_thread ON messages(thread_id, created_at);
        CREATE INDEX idx_tasks_status ON tasks(status, priority, created_at);
        CREATE INDEX idx_sessions_task ON sessions(task_id);
        ",
    ),
    (
        2,
        "
        CREATE TABLE drafts (
            id TEXT PRIMARY KEY,
            task_id TEXT NOT NULL,
            source_message_id TEXT,
            channel TEXT NOT NULL,
            recipients TEXT NOT NULL DEFAULT '[]',
            cc TEXT NOT NULL DEFAULT '[]',
            subject TEXT NOT NULL DEFAULT '',
            body TEXT NOT NULL,
            original_body TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'pending_review',
            priority TEXT NOT NULL DEFAULT 'normal',
            conductor_notes TEXT,
            quality_score INTEGER,
            quality_notes TEXT,
            auto_approve_match TEXT,
            reviewed_by TEXT,
            reviewed_at TEXT,
            sent_at TEXT,
            external_draft_id TEXT,
            metadata TEXT NOT NULL DEFAULT '{}',
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        CREATE TABLE corrections (
            id TEXT PRIMARY KEY,
            draft_id TEXT NOT NULL,
            task_id TEXT NOT NULL,
            original_body TEXT NOT NULL,
            edited_body TEXT NOT NULL,
            edited_subject TEXT,
            change_type TEXT NOT NULL,
            feedback TEXT,
            created_at TEXT NOT NULL
        );

        CREATE TABLE feedback (
            id TEXT PRIMARY KEY,
            task_id TEXT,
            draft_id TEXT,
            rating TEXT NOT NULL,
            comment TEXT,
            created_at TEXT NOT NULL
        );

        CREATE INDEX idx_drafts_status ON drafts(status, priority, created_at);
        CREATE INDEX idx_corrections_draft ON corrections(draft_id);
        CREATE INDEX idx_corrections_created ON corrections(created_at);
        ",
    ),
    (
        3,
        "
        CREATE TABLE prompt_versions (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            content TEXT NOT NULL,
            version INTEGER NOT NULL,
            active INTEGER NOT NULL DEFAULT 0,
            activated_at TEXT,
            created_at TEXT NOT NULL,
            metrics TEXT
        );

        CREATE TABLE approval_rules (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL UNIQUE,
            enabled INTEGER NOT NULL DEFAULT 1,
            criteria TEXT NOT NULL DEFAULT '{}',
            created_at TEXT NOT NULL
        );

        CREATE UNIQUE INDEX idx_prompt_versions_name_version
            ON prompt_versions(name, version);
        CREATE INDEX idx_prompt_versions_active ON prompt_versions(name, active);
        ",
    ),
];
