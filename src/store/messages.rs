//! Message upserts and read paths.
//!
//! `batch_upsert_messages` is the hot path of a sync: each batch runs inside
//! one transaction, and bulk mode drops the FTS triggers up front, rebuilds
//! the index once at the end, and recreates the triggers. Rebuilding once
//! keeps large syncs linear instead of paying the per-row trigger cost.

use std::collections::HashSet;
use std::time::Instant;

use sqlx::sqlite::SqliteRow;
use sqlx::Row;

use super::{message_from_row, migrations, now_ts, to_ts, MirrorStore, StoreError};
use crate::models::{AttachmentInfo, MailMessage, Recipient, RecipientKind};

/// Tuning knobs for `batch_upsert_messages`.
#[derive(Debug, Clone)]
pub struct BatchOptions {
    pub batch_size: usize,
    /// Drop FTS triggers for the duration and rebuild the index once.
    pub disable_fts_triggers: bool,
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self {
            batch_size: 1000,
            disable_fts_triggers: false,
        }
    }
}

/// Outcome of a batch upsert.
#[derive(Debug, Clone, Default)]
pub struct BatchUpsertResult {
    pub inserted: usize,
    pub updated: usize,
    pub failed: usize,
    pub errors: Vec<String>,
    pub duration_seconds: f64,
}

impl MirrorStore {
    /// Insert or update one message by stable id. Returns true when the row
    /// was newly inserted.
    pub async fn upsert_message(&self, message: &MailMessage) -> Result<bool, StoreError> {
        let mut tx = self.pool().begin().await?;
        let existed: Option<i64> = sqlx::query_scalar("SELECT 1 FROM messages WHERE id = ?1")
            .bind(&message.id)
            .fetch_optional(&mut *tx)
            .await?;
        write_message(&mut tx, message, now_ts()).await?;
        tx.commit().await?;
        Ok(existed.is_none())
    }

    /// Upsert a batch of messages.
    ///
    /// Each `batch_size` chunk runs in its own transaction; an error inside a
    /// chunk rolls the whole chunk back and counts it as failed. With
    /// `disable_fts_triggers` the FTS index is rebuilt once afterwards.
    pub async fn batch_upsert_messages(
        &self,
        messages: &[MailMessage],
        options: &BatchOptions,
    ) -> Result<BatchUpsertResult, StoreError> {
        let started = Instant::now();
        let mut result = BatchUpsertResult::default();
        let batch_size = options.batch_size.max(1);

        if options.disable_fts_triggers {
            for sql in migrations::DROP_FTS_TRIGGERS {
                sqlx::query(sql).execute(self.pool()).await?;
            }
        }

        let outcome = self.upsert_chunks(messages, batch_size, &mut result).await;

        if options.disable_fts_triggers {
            // Always restore the index and triggers, even after a failed chunk.
            sqlx::query("INSERT INTO messages_fts(messages_fts) VALUES('rebuild')")
                .execute(self.pool())
                .await?;
            for sql in migrations::FTS_TRIGGERS {
                sqlx::query(sql).execute(self.pool()).await?;
            }
        }

        outcome?;
        result.duration_seconds = started.elapsed().as_secs_f64();
        log::debug!(
            "batch upsert: {} inserted, {} updated, {} failed in {:.2}s",
            result.inserted,
            result.updated,
            result.failed,
            result.duration_seconds
        );
        Ok(result)
    }

    async fn upsert_chunks(
        &self,
        messages: &[MailMessage],
        batch_size: usize,
        result: &mut BatchUpsertResult,
    ) -> Result<(), StoreError> {
        for chunk in messages.chunks(batch_size) {
            let existing = self.existing_ids(chunk).await?;

            let mut tx = self.pool().begin().await?;
            let now = now_ts();
            let mut chunk_err: Option<sqlx::Error> = None;
            for message in chunk {
                if let Err(err) = write_message(&mut tx, message, now).await {
                    chunk_err = Some(err);
                    break;
                }
            }

            match chunk_err {
                None => {
                    tx.commit().await?;
                    let inserted = chunk
                        .iter()
                        .filter(|m| !existing.contains(&m.id))
                        .count();
                    result.inserted += inserted;
                    result.updated += chunk.len() - inserted;
                }
                Some(err) => {
                    tx.rollback().await?;
                    result.failed += chunk.len();
                    result
                        .errors
                        .push(format!("batch of {} rolled back: {err}", chunk.len()));
                    log::warn!("message batch rolled back: {err}");
                }
            }
        }
        Ok(())
    }

    async fn existing_ids(&self, chunk: &[MailMessage]) -> Result<HashSet<String>, StoreError> {
        if chunk.is_empty() {
            return Ok(HashSet::new());
        }
        let sql = format!(
            "SELECT id FROM messages WHERE id IN ({})",
            placeholders(chunk.len())
        );
        let mut query = sqlx::query_scalar::<_, String>(&sql);
        for message in chunk {
            query = query.bind(&message.id);
        }
        Ok(query.fetch_all(self.pool()).await?.into_iter().collect())
    }

    /// Fetch a live message by stable id.
    pub async fn get_message(&self, id: &str) -> Result<Option<MailMessage>, StoreError> {
        let row = sqlx::query("SELECT * FROM messages WHERE id = ?1 AND is_deleted = 0")
            .bind(id)
            .fetch_optional(self.pool())
            .await?;
        match row {
            Some(row) => Ok(Some(self.with_details(message_from_row(&row)?).await?)),
            None => Ok(None),
        }
    }

    /// Admin accessor: fetch a message regardless of its soft-delete marker.
    pub async fn get_message_unfiltered(&self, id: &str) -> Result<Option<MailMessage>, StoreError> {
        let row = sqlx::query("SELECT * FROM messages WHERE id = ?1")
            .bind(id)
            .fetch_optional(self.pool())
            .await?;
        match row {
            Some(row) => Ok(Some(self.with_details(message_from_row(&row)?).await?)),
            None => Ok(None),
        }
    }

    /// Number of live messages in the mirror.
    pub async fn get_message_count(&self) -> Result<i64, StoreError> {
        Ok(
            sqlx::query_scalar("SELECT COUNT(*) FROM messages WHERE is_deleted = 0")
                .fetch_one(self.pool())
                .await?,
        )
    }

    /// Host ROWIDs of all live mirrored messages.
    pub async fn get_synced_rowids(&self) -> Result<Vec<i64>, StoreError> {
        Ok(sqlx::query_scalar(
            "SELECT apple_rowid FROM messages
             WHERE apple_rowid IS NOT NULL AND is_deleted = 0",
        )
        .fetch_all(self.pool())
        .await?)
    }

    /// Soft-delete every message whose host ROWID is in `rowids`.
    pub async fn soft_delete_by_rowids(&self, rowids: &[i64]) -> Result<usize, StoreError> {
        if rowids.is_empty() {
            return Ok(0);
        }
        let sql = format!(
            "UPDATE messages SET is_deleted = 1, updated_at = ?1
             WHERE apple_rowid IN ({})",
            placeholders(rowids.len())
        );
        let mut query = sqlx::query(&sql).bind(now_ts());
        for rowid in rowids {
            query = query.bind(rowid);
        }
        let done = query.execute(self.pool()).await?;
        Ok(done.rows_affected() as usize)
    }

    async fn with_details(&self, mut message: MailMessage) -> Result<MailMessage, StoreError> {
        let recipient_rows = sqlx::query(
            "SELECT kind, name, email FROM recipients WHERE message_id = ?1",
        )
        .bind(&message.id)
        .fetch_all(self.pool())
        .await?;
        message.recipients = recipient_rows
            .iter()
            .map(recipient_from_row)
            .collect::<Result<_, _>>()?;

        let attachment_rows = sqlx::query(
            "SELECT filename, mime_type, size_bytes, content_id, is_inline
             FROM attachments WHERE message_id = ?1",
        )
        .bind(&message.id)
        .fetch_all(self.pool())
        .await?;
        message.attachments = attachment_rows
            .iter()
            .map(attachment_from_row)
            .collect::<Result<_, _>>()?;

        Ok(message)
    }
}

fn recipient_from_row(row: &SqliteRow) -> Result<Recipient, StoreError> {
    let kind: String = row.try_get("kind")?;
    Ok(Recipient {
        kind: match kind.as_str() {
            "cc" => RecipientKind::Cc,
            "bcc" => RecipientKind::Bcc,
            _ => RecipientKind::To,
        },
        name: row.try_get("name")?,
        email: row.try_get("email")?,
    })
}

fn attachment_from_row(row: &SqliteRow) -> Result<AttachmentInfo, StoreError> {
    Ok(AttachmentInfo {
        filename: row.try_get("filename")?,
        mime_type: row.try_get::<Option<String>, _>("mime_type")?.unwrap_or_default(),
        size_bytes: row.try_get("size_bytes")?,
        content_id: row.try_get("content_id")?,
        is_inline: row.try_get::<i64, _>("is_inline")? != 0,
    })
}

pub(crate) fn placeholders(count: usize) -> String {
    vec!["?"; count].join(",")
}

/// The full upsert: every mutable column is set unconditionally on conflict,
/// and owned recipient/attachment rows are replaced.
async fn write_message(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    message: &MailMessage,
    now: i64,
) -> Result<(), sqlx::Error> {
    let references_json = serde_json::to_string(&message.references).unwrap_or_else(|_| "[]".into());

    sqlx::query(
        "INSERT INTO messages (
            id, apple_rowid, message_id, mailbox_id, mailbox_name, account_id,
            subject, sender_name, sender_email, date_sent, date_received,
            is_read, is_flagged, is_deleted, has_attachments, file_path,
            body_text, body_html, export_path, mailbox_status,
            pending_sync_action, last_known_mailbox_id, in_reply_to,
            threading_references, thread_id, thread_position, thread_total,
            synced_at, updated_at
        ) VALUES (
            ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15,
            ?16, ?17, ?18, ?19, ?20, ?21, ?22, ?23, ?24, ?25, ?26, ?27, ?28, ?29
        )
        ON CONFLICT(id) DO UPDATE SET
            apple_rowid = excluded.apple_rowid,
            message_id = excluded.message_id,
            mailbox_id = excluded.mailbox_id,
            mailbox_name = excluded.mailbox_name,
            account_id = excluded.account_id,
            subject = excluded.subject,
            sender_name = excluded.sender_name,
            sender_email = excluded.sender_email,
            date_sent = excluded.date_sent,
            date_received = excluded.date_received,
            is_read = excluded.is_read,
            is_flagged = excluded.is_flagged,
            is_deleted = excluded.is_deleted,
            has_attachments = excluded.has_attachments,
            file_path = excluded.file_path,
            body_text = excluded.body_text,
            body_html = excluded.body_html,
            export_path = excluded.export_path,
            mailbox_status = excluded.mailbox_status,
            pending_sync_action = excluded.pending_sync_action,
            last_known_mailbox_id = excluded.last_known_mailbox_id,
            in_reply_to = excluded.in_reply_to,
            threading_references = excluded.threading_references,
            thread_id = excluded.thread_id,
            thread_position = excluded.thread_position,
            thread_total = excluded.thread_total,
            synced_at = excluded.synced_at,
            updated_at = excluded.updated_at",
    )
    .bind(&message.id)
    .bind(message.apple_rowid)
    .bind(&message.message_id)
    .bind(message.mailbox_id)
    .bind(&message.mailbox_name)
    .bind(&message.account_id)
    .bind(&message.subject)
    .bind(&message.sender_name)
    .bind(&message.sender_email)
    .bind(to_ts(message.date_sent))
    .bind(to_ts(message.date_received))
    .bind(message.is_read as i64)
    .bind(message.is_flagged as i64)
    .bind(message.is_deleted as i64)
    .bind(message.has_attachments as i64)
    .bind(&message.file_path)
    .bind(&message.body_text)
    .bind(&message.body_html)
    .bind(&message.export_path)
    .bind(message.mailbox_status.as_str())
    .bind(message.pending_sync_action.map(|a| a.as_str()))
    .bind(message.last_known_mailbox_id)
    .bind(&message.in_reply_to)
    .bind(references_json)
    .bind(&message.thread_id)
    .bind(message.thread_position)
    .bind(message.thread_total)
    .bind(to_ts(message.synced_at).unwrap_or(now))
    .bind(now)
    .execute(&mut **tx)
    .await?;

    sqlx::query("DELETE FROM recipients WHERE message_id = ?1")
        .bind(&message.id)
        .execute(&mut **tx)
        .await?;
    for recipient in &message.recipients {
        sqlx::query(
            "INSERT INTO recipients (message_id, kind, name, email) VALUES (?1, ?2, ?3, ?4)",
        )
        .bind(&message.id)
        .bind(recipient.kind.as_str())
        .bind(&recipient.name)
        .bind(&recipient.email)
        .execute(&mut **tx)
        .await?;
    }

    sqlx::query("DELETE FROM attachments WHERE message_id = ?1")
        .bind(&message.id)
        .execute(&mut **tx)
        .await?;
    for attachment in &message.attachments {
        sqlx::query(
            "INSERT INTO attachments (message_id, filename, mime_type, size_bytes, content_id, is_inline)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        )
        .bind(&message.id)
        .bind(&attachment.filename)
        .bind(&attachment.mime_type)
        .bind(attachment.size_bytes)
        .bind(&attachment.content_id)
        .bind(attachment.is_inline as i64)
        .execute(&mut **tx)
        .await?;
    }

    Ok(())
}
