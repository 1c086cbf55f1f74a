//! The mirror database.
//!
//! `MirrorStore` owns the local SQLite file that shadows the host envelope
//! index with derived state: threads, pending actions, and a full-text
//! index. The database is opened with WAL journaling and a 5-second busy
//! timeout; writers are serialized behind SQLite's WAL while readers proceed
//! concurrently. Components hold handles to the store; the store owns the
//! connection pool.

pub mod messages;
pub mod migrations;
pub mod search;
pub mod status;
pub mod threads;

use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use thiserror::Error;

use crate::models::{MailMessage, Mailbox, MailboxStatus, PendingAction};

pub use messages::{BatchOptions, BatchUpsertResult};
pub use migrations::SCHEMA_VERSION;
pub use search::SearchFilter;
pub use threads::{ThreadQuery, ThreadSort};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to open mirror database: {0}")]
    Connection(#[source] sqlx::Error),
    #[error("migration to version {version} failed: {source}")]
    Migration {
        version: i64,
        #[source]
        source: sqlx::Error,
    },
    #[error("mirror query failed: {0}")]
    Query(#[from] sqlx::Error),
    #[error("mirror store is not initialized")]
    NotInitialized,
}

/// Handle to the mirror database.
#[derive(Clone)]
pub struct MirrorStore {
    pool: SqlitePool,
}

impl MirrorStore {
    /// Open (creating if needed) the mirror at `path` and apply migrations.
    pub async fn open(path: &Path) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_millis(5000))
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .map_err(StoreError::Connection)?;

        migrations::run(&pool).await?;
        log::debug!(
            "mirror database open at {} (schema version {})",
            path.display(),
            migrations::SCHEMA_VERSION
        );

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Applied schema version.
    pub async fn schema_version(&self) -> Result<i64, StoreError> {
        migrations::current_version(&self.pool).await
    }

    // Mailboxes

    /// Insert or update a mailbox row keyed by the host's ROWID.
    pub async fn upsert_mailbox(&self, mailbox: &Mailbox) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO mailboxes (id, account_id, name, url, parent_id, message_count, unread_count, synced_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT(id) DO UPDATE SET
                account_id = excluded.account_id,
                name = excluded.name,
                url = excluded.url,
                parent_id = excluded.parent_id,
                message_count = excluded.message_count,
                unread_count = excluded.unread_count,
                synced_at = excluded.synced_at",
        )
        .bind(mailbox.id)
        .bind(&mailbox.account_id)
        .bind(&mailbox.name)
        .bind(&mailbox.url)
        .bind(mailbox.parent_id)
        .bind(mailbox.message_count)
        .bind(mailbox.unread_count)
        .bind(to_ts(mailbox.synced_at).unwrap_or_else(|| Utc::now().timestamp()))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_mailboxes(&self) -> Result<Vec<Mailbox>, StoreError> {
        let rows = sqlx::query(
            "SELECT id, account_id, name, url, parent_id, message_count, unread_count, synced_at
             FROM mailboxes ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(mailbox_from_row).collect()
    }

    /// Recompute per-mailbox message and unread counters from live rows.
    pub async fn refresh_mailbox_counts(&self) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE mailboxes SET
                message_count = (SELECT COUNT(*) FROM messages m
                    WHERE m.mailbox_id = mailboxes.id AND m.is_deleted = 0),
                unread_count = (SELECT COUNT(*) FROM messages m
                    WHERE m.mailbox_id = mailboxes.id AND m.is_deleted = 0 AND m.is_read = 0)",
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_mailbox(&self, id: i64) -> Result<Option<Mailbox>, StoreError> {
        let row = sqlx::query(
            "SELECT id, account_id, name, url, parent_id, message_count, unread_count, synced_at
             FROM mailboxes WHERE id = ?1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(mailbox_from_row).transpose()
    }
}

// Row/value conversion helpers shared by the store submodules.

pub(crate) fn to_ts(value: Option<DateTime<Utc>>) -> Option<i64> {
    value.map(|dt| dt.timestamp())
}

pub(crate) fn from_ts(value: Option<i64>) -> Option<DateTime<Utc>> {
    value.and_then(|ts| Utc.timestamp_opt(ts, 0).single())
}

pub(crate) fn now_ts() -> i64 {
    Utc::now().timestamp()
}

fn mailbox_from_row(row: &SqliteRow) -> Result<Mailbox, StoreError> {
    Ok(Mailbox {
        id: row.try_get("id")?,
        account_id: row.try_get("account_id")?,
        name: row.try_get("name")?,
        url: row.try_get("url")?,
        parent_id: row.try_get("parent_id")?,
        message_count: row.try_get("message_count")?,
        unread_count: row.try_get("unread_count")?,
        synced_at: from_ts(row.try_get("synced_at")?),
    })
}

/// Map a full `messages` row (all columns, `SELECT m.*` shape) into the
/// domain record. Recipients and attachments are loaded separately.
pub(crate) fn message_from_row(row: &SqliteRow) -> Result<MailMessage, StoreError> {
    let references: Option<String> = row.try_get("threading_references")?;
    let references = references
        .as_deref()
        .and_then(|raw| serde_json::from_str::<Vec<String>>(raw).ok())
        .unwrap_or_default();

    let mailbox_status: Option<String> = row.try_get("mailbox_status")?;
    let pending: Option<String> = row.try_get("pending_sync_action")?;

    Ok(MailMessage {
        id: row.try_get("id")?,
        apple_rowid: row.try_get("apple_rowid")?,
        message_id: row.try_get("message_id")?,
        mailbox_id: row.try_get("mailbox_id")?,
        mailbox_name: row.try_get("mailbox_name")?,
        account_id: row.try_get("account_id")?,
        subject: row.try_get("subject")?,
        sender_name: row.try_get("sender_name")?,
        sender_email: row.try_get("sender_email")?,
        date_sent: from_ts(row.try_get("date_sent")?),
        date_received: from_ts(row.try_get("date_received")?),
        is_read: row.try_get::<i64, _>("is_read")? != 0,
        is_flagged: row.try_get::<i64, _>("is_flagged")? != 0,
        is_deleted: row.try_get::<i64, _>("is_deleted")? != 0,
        has_attachments: row.try_get::<i64, _>("has_attachments")? != 0,
        file_path: row.try_get("file_path")?,
        body_text: row.try_get("body_text")?,
        body_html: row.try_get("body_html")?,
        export_path: row.try_get("export_path")?,
        mailbox_status: mailbox_status
            .as_deref()
            .and_then(MailboxStatus::parse)
            .unwrap_or(MailboxStatus::Inbox),
        pending_sync_action: pending.as_deref().and_then(PendingAction::parse),
        last_known_mailbox_id: row.try_get("last_known_mailbox_id")?,
        in_reply_to: row.try_get("in_reply_to")?,
        references,
        thread_id: row.try_get("thread_id")?,
        thread_position: row.try_get("thread_position")?,
        thread_total: row.try_get("thread_total")?,
        synced_at: from_ts(row.try_get("synced_at")?),
        updated_at: from_ts(row.try_get("updated_at")?),
        recipients: Vec::new(),
        attachments: Vec::new(),
    })
}
