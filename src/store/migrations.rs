//! Mirror schema migrations.
//!
//! The applied version is recorded in `schema_version`; pending migrations
//! run strictly in ascending order, each inside its own transaction, so a
//! failure leaves the mirror at the previous version. Statements are
//! idempotent: tables and indexes use `IF NOT EXISTS`, and `ADD COLUMN`
//! steps tolerate the duplicate-column error SQLite reports on re-run.

use sqlx::sqlite::SqlitePool;

use super::StoreError;

/// Schema version the code expects after `run` completes.
pub const SCHEMA_VERSION: i64 = 7;

const FTS_TRIGGER_AI: &str =
    "CREATE TRIGGER IF NOT EXISTS messages_fts_ai AFTER INSERT ON messages BEGIN
        INSERT INTO messages_fts(rowid, subject, sender_name, sender_email, body_text)
        VALUES (new.rowid, new.subject, new.sender_name, new.sender_email, new.body_text);
    END";
const FTS_TRIGGER_AD: &str =
    "CREATE TRIGGER IF NOT EXISTS messages_fts_ad AFTER DELETE ON messages BEGIN
        INSERT INTO messages_fts(messages_fts, rowid, subject, sender_name, sender_email, body_text)
        VALUES ('delete', old.rowid, old.subject, old.sender_name, old.sender_email, old.body_text);
    END";
const FTS_TRIGGER_AU: &str =
    "CREATE TRIGGER IF NOT EXISTS messages_fts_au AFTER UPDATE ON messages BEGIN
        INSERT INTO messages_fts(messages_fts, rowid, subject, sender_name, sender_email, body_text)
        VALUES ('delete', old.rowid, old.subject, old.sender_name, old.sender_email, old.body_text);
        INSERT INTO messages_fts(rowid, subject, sender_name, sender_email, body_text)
        VALUES (new.rowid, new.subject, new.sender_name, new.sender_email, new.body_text);
    END";

/// Triggers that keep the external-content FTS index in sync with
/// `messages`. Bulk imports drop these, rebuild once, and recreate them.
pub(crate) const FTS_TRIGGERS: &[&str] = &[FTS_TRIGGER_AI, FTS_TRIGGER_AD, FTS_TRIGGER_AU];

pub(crate) const DROP_FTS_TRIGGERS: &[&str] = &[
    "DROP TRIGGER IF EXISTS messages_fts_ai",
    "DROP TRIGGER IF EXISTS messages_fts_ad",
    "DROP TRIGGER IF EXISTS messages_fts_au",
];

const MIGRATION_1: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS messages (
        id TEXT PRIMARY KEY,
        apple_rowid INTEGER,
        message_id TEXT,
        mailbox_id INTEGER,
        mailbox_name TEXT,
        account_id TEXT,
        subject TEXT,
        sender_name TEXT,
        sender_email TEXT,
        date_sent INTEGER,
        date_received INTEGER,
        is_read INTEGER NOT NULL DEFAULT 0,
        is_flagged INTEGER NOT NULL DEFAULT 0,
        is_deleted INTEGER NOT NULL DEFAULT 0,
        has_attachments INTEGER NOT NULL DEFAULT 0,
        file_path TEXT,
        body_text TEXT,
        body_html TEXT,
        export_path TEXT,
        synced_at INTEGER,
        updated_at INTEGER
    )",
    "CREATE TABLE IF NOT EXISTS recipients (
        message_id TEXT NOT NULL REFERENCES messages(id) ON DELETE CASCADE,
        kind TEXT NOT NULL,
        name TEXT,
        email TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS attachments (
        message_id TEXT NOT NULL REFERENCES messages(id) ON DELETE CASCADE,
        filename TEXT,
        mime_type TEXT,
        size_bytes INTEGER NOT NULL DEFAULT 0,
        content_id TEXT,
        is_inline INTEGER NOT NULL DEFAULT 0
    )",
    "CREATE TABLE IF NOT EXISTS mailboxes (
        id INTEGER PRIMARY KEY,
        account_id TEXT,
        name TEXT NOT NULL,
        url TEXT,
        parent_id INTEGER,
        message_count INTEGER NOT NULL DEFAULT 0,
        unread_count INTEGER NOT NULL DEFAULT 0,
        synced_at INTEGER
    )",
    "CREATE TABLE IF NOT EXISTS sync_status (
        key TEXT PRIMARY KEY,
        value TEXT NOT NULL,
        updated_at INTEGER NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_messages_apple_rowid ON messages(apple_rowid)",
    "CREATE INDEX IF NOT EXISTS idx_messages_message_id ON messages(message_id)",
    "CREATE INDEX IF NOT EXISTS idx_messages_date_received ON messages(date_received)",
    "CREATE INDEX IF NOT EXISTS idx_messages_mailbox_id ON messages(mailbox_id)",
    "CREATE INDEX IF NOT EXISTS idx_recipients_message_id ON recipients(message_id)",
    "CREATE INDEX IF NOT EXISTS idx_attachments_message_id ON attachments(message_id)",
    "CREATE VIRTUAL TABLE IF NOT EXISTS messages_fts USING fts5(
        subject,
        sender_name,
        sender_email,
        body_text,
        content='messages',
        content_rowid='rowid',
        tokenize='porter unicode61'
    )",
    FTS_TRIGGER_AI,
    FTS_TRIGGER_AD,
    FTS_TRIGGER_AU,
];

const MIGRATION_2: &[&str] = &[
    "ALTER TABLE messages ADD COLUMN mailbox_status TEXT NOT NULL DEFAULT 'inbox'",
    "ALTER TABLE messages ADD COLUMN pending_sync_action TEXT",
    "ALTER TABLE messages ADD COLUMN last_known_mailbox_id INTEGER",
    "CREATE INDEX IF NOT EXISTS idx_messages_mailbox_status ON messages(mailbox_status)",
    "CREATE INDEX IF NOT EXISTS idx_messages_pending_action ON messages(pending_sync_action)",
];

const MIGRATION_3: &[&str] = &[
    "ALTER TABLE messages ADD COLUMN in_reply_to TEXT",
    "ALTER TABLE messages ADD COLUMN threading_references TEXT",
    "CREATE INDEX IF NOT EXISTS idx_messages_in_reply_to ON messages(in_reply_to)",
];

const MIGRATION_4: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS threads (
        id TEXT PRIMARY KEY,
        subject TEXT,
        participant_count INTEGER NOT NULL DEFAULT 1,
        message_count INTEGER NOT NULL DEFAULT 0,
        first_message_date INTEGER,
        last_message_date INTEGER,
        created_at INTEGER,
        updated_at INTEGER
    )",
    "ALTER TABLE messages ADD COLUMN thread_id TEXT",
    "CREATE INDEX IF NOT EXISTS idx_messages_thread_id ON messages(thread_id)",
    "CREATE INDEX IF NOT EXISTS idx_threads_last_date ON threads(last_message_date)",
];

const MIGRATION_5: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS thread_messages (
        thread_id TEXT NOT NULL REFERENCES threads(id) ON DELETE CASCADE,
        message_id TEXT NOT NULL REFERENCES messages(id) ON DELETE CASCADE,
        added_at INTEGER NOT NULL,
        PRIMARY KEY (thread_id, message_id)
    )",
    "CREATE INDEX IF NOT EXISTS idx_thread_messages_message ON thread_messages(message_id)",
];

const MIGRATION_6: &[&str] = &[
    "ALTER TABLE messages ADD COLUMN thread_position INTEGER",
    "ALTER TABLE messages ADD COLUMN thread_total INTEGER",
];

const MIGRATION_7: &[&str] = &[
    "CREATE INDEX IF NOT EXISTS idx_threads_subject ON threads(subject)",
    "CREATE INDEX IF NOT EXISTS idx_threads_message_count ON threads(message_count)",
    "CREATE INDEX IF NOT EXISTS idx_messages_sender_email ON messages(sender_email)",
    "CREATE INDEX IF NOT EXISTS idx_recipients_email ON recipients(email)",
    "CREATE INDEX IF NOT EXISTS idx_messages_thread_position ON messages(thread_id, thread_position)",
];

const MIGRATIONS: &[(i64, &[&str])] = &[
    (1, MIGRATION_1),
    (2, MIGRATION_2),
    (3, MIGRATION_3),
    (4, MIGRATION_4),
    (5, MIGRATION_5),
    (6, MIGRATION_6),
    (7, MIGRATION_7),
];

/// Apply all pending migrations.
pub async fn run(pool: &SqlitePool) -> Result<(), StoreError> {
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at INTEGER NOT NULL
        )",
    )
    .execute(pool)
    .await
    .map_err(|source| StoreError::Migration { version: 0, source })?;

    let current: Option<i64> = sqlx::query_scalar("SELECT MAX(version) FROM schema_version")
        .fetch_one(pool)
        .await
        .map_err(|source| StoreError::Migration { version: 0, source })?;
    let current = current.unwrap_or(0);

    for (version, statements) in MIGRATIONS {
        if *version <= current {
            continue;
        }

        log::info!("applying mirror schema migration {version}");
        let mut tx = pool
            .begin()
            .await
            .map_err(|source| StoreError::Migration {
                version: *version,
                source,
            })?;

        for sql in *statements {
            execute_step(&mut tx, sql)
                .await
                .map_err(|source| StoreError::Migration {
                    version: *version,
                    source,
                })?;
        }

        sqlx::query("INSERT INTO schema_version (version, applied_at) VALUES (?1, ?2)")
            .bind(version)
            .bind(chrono::Utc::now().timestamp())
            .execute(&mut *tx)
            .await
            .map_err(|source| StoreError::Migration {
                version: *version,
                source,
            })?;

        tx.commit().await.map_err(|source| StoreError::Migration {
            version: *version,
            source,
        })?;
    }

    Ok(())
}

/// Run one migration statement, tolerating re-applied `ADD COLUMN` steps.
async fn execute_step(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    sql: &str,
) -> Result<(), sqlx::Error> {
    if let Err(err) = sqlx::query(sql).execute(&mut **tx).await {
        if err.to_string().contains("duplicate column name") {
            return Ok(());
        }
        return Err(err);
    }
    Ok(())
}

/// Currently applied schema version, 0 when the mirror is empty.
pub async fn current_version(pool: &SqlitePool) -> Result<i64, StoreError> {
    let version: Option<i64> = sqlx::query_scalar("SELECT MAX(version) FROM schema_version")
        .fetch_one(pool)
        .await?;
    Ok(version.unwrap_or(0))
}
