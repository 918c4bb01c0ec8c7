use rusqlite_migration::{Migrations, M};

/// Define all schema migrations.
/// Uses SQLite user_version pragma for tracking, so no migration table is needed.
pub fn migrations() -> Migrations<'static> {
    Migrations::new(vec![
        M::up(
            "-- Migration 1: Conversations and messages

CREATE TABLE conversations (
    id TEXT PRIMARY KEY,
    tenant_id TEXT NOT NULL,
    kind TEXT NOT NULL CHECK (kind IN ('direct', 'group', 'business')),
    title TEXT,
    created_by TEXT NOT NULL,
    created_at TEXT NOT NULL,
    last_message_at TEXT
);
CREATE INDEX idx_conversations_tenant ON conversations(tenant_id);

CREATE TABLE conversation_members (
    conversation_id TEXT NOT NULL,
    user_id TEXT NOT NULL,
    joined_at TEXT NOT NULL,
    last_read_message_id TEXT,
    PRIMARY KEY (conversation_id, user_id),
    FOREIGN KEY (conversation_id) REFERENCES conversations(id) ON DELETE CASCADE
);
CREATE INDEX idx_conversation_members_user ON conversation_members(user_id);

CREATE TABLE messages (
    id TEXT PRIMARY KEY,
    conversation_id TEXT NOT NULL,
    sender_id TEXT NOT NULL,
    content TEXT NOT NULL,
    created_at TEXT NOT NULL,
    edited_at TEXT,
    deleted INTEGER NOT NULL DEFAULT 0,
    FOREIGN KEY (conversation_id) REFERENCES conversations(id) ON DELETE CASCADE
);
CREATE INDEX idx_messages_conversation ON messages(conversation_id, created_at);
",
        ),
        M::up(
            "-- Migration 2: Scheduled broadcasts

CREATE TABLE broadcasts (
    id TEXT PRIMARY KEY,
    tenant_id TEXT NOT NULL,
    created_by TEXT NOT NULL,
    content TEXT NOT NULL,
    status TEXT NOT NULL CHECK (status IN ('scheduled', 'sending', 'sent', 'failed', 'cancelled')),
    scheduled_at INTEGER NOT NULL,
    sent_at INTEGER,
    failure_reason TEXT,
    created_at TEXT NOT NULL
);
CREATE INDEX idx_broadcasts_status ON broadcasts(status, scheduled_at);

CREATE TABLE broadcast_recipients (
    broadcast_id TEXT NOT NULL,
    user_id TEXT NOT NULL,
    PRIMARY KEY (broadcast_id, user_id),
    FOREIGN KEY (broadcast_id) REFERENCES broadcasts(id) ON DELETE CASCADE
);
",
        ),
        M::up(
            "-- Migration 3: Shared coordination store (presence keys, job queue, locks)
-- These tables stand in for a networked key/value store; every server process
-- pointed at the same database file shares them.

CREATE TABLE kv_store (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL,
    expires_at_ms INTEGER
);
CREATE INDEX idx_kv_store_expiry ON kv_store(expires_at_ms);

CREATE TABLE schedule_queue (
    member TEXT PRIMARY KEY,
    fire_at INTEGER NOT NULL
);
CREATE INDEX idx_schedule_queue_fire_at ON schedule_queue(fire_at);

CREATE TABLE scheduler_locks (
    name TEXT PRIMARY KEY,
    holder TEXT NOT NULL,
    expires_at_ms INTEGER NOT NULL
);
",
        ),
    ])
}
