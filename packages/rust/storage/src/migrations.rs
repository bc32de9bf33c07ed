//! SQL migration definitions for the docpipe database.
//!
//! Migrations are applied in order on database open. Each migration has a
//! version number and a batch of SQL statements.

/// A database migration with a version and SQL statements.
pub(crate) struct Migration {
    pub version: u32,
    pub description: &'static str,
    pub sql: &'static str,
}

/// All migrations, in ascending version order.
pub(crate) fn all_migrations() -> Vec<Migration> {
    vec![
        Migration {
            version: 1,
            description: "Initial schema: queues, queue_messages, blobs, documents",
            sql: r#"
-- Schema version tracking
CREATE TABLE IF NOT EXISTS schema_migrations (
    version    INTEGER PRIMARY KEY,
    applied_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- Named queues (request and dead-letter)
CREATE TABLE IF NOT EXISTS queues (
    name       TEXT PRIMARY KEY,
    created_at TEXT NOT NULL
);

-- Messages; seq gives FIFO order within a queue
CREATE TABLE IF NOT EXISTS queue_messages (
    seq           INTEGER PRIMARY KEY AUTOINCREMENT,
    id            TEXT NOT NULL UNIQUE,
    queue_name    TEXT NOT NULL REFERENCES queues(name) ON DELETE CASCADE,
    body          TEXT NOT NULL,
    dequeue_count INTEGER NOT NULL DEFAULT 0,
    pop_receipt   TEXT,
    visible_at    INTEGER NOT NULL,
    inserted_at   TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_queue_messages_visible
    ON queue_messages(queue_name, visible_at, seq);

-- Blob storage keyed by work-item container
CREATE TABLE IF NOT EXISTS blobs (
    container  TEXT NOT NULL,
    name       TEXT NOT NULL,
    data       BLOB NOT NULL,
    size       INTEGER NOT NULL,
    updated_at TEXT NOT NULL,
    PRIMARY KEY (container, name)
);

-- JSON document collections
CREATE TABLE IF NOT EXISTS documents (
    collection TEXT NOT NULL,
    id         TEXT NOT NULL,
    body       TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    PRIMARY KEY (collection, id)
);

CREATE INDEX IF NOT EXISTS idx_documents_collection ON documents(collection);

INSERT OR IGNORE INTO schema_migrations (version) VALUES (1);
"#,
        },
    ]
}
