//! Message status tracking and the sync-status key/value contract.

use sqlx::Row;

use super::{from_ts, message_from_row, now_ts, MirrorStore, StoreError};
use crate::models::{
    MailMessage, MailboxStatus, MessageStatus, PendingAction, SyncResult, SyncState,
    SyncStatusSummary,
};
use chrono::{DateTime, TimeZone, Utc};

const SYNC_KEYS: &[&str] = &[
    "sync_state",
    "last_sync_time",
    "last_sync_start_time",
    "last_sync_end_time",
    "last_sync_error",
    "last_sync_messages_added",
    "last_sync_messages_updated",
    "last_sync_messages_deleted",
    "last_sync_duration",
    "last_sync_is_incremental",
];

impl MirrorStore {
    // Message status

    /// Status tuples for every live tracked message.
    pub async fn get_all_message_statuses(&self) -> Result<Vec<MessageStatus>, StoreError> {
        let rows = sqlx::query(
            "SELECT id, apple_rowid, is_read, is_flagged, mailbox_status
             FROM messages WHERE is_deleted = 0 AND apple_rowid IS NOT NULL",
        )
        .fetch_all(self.pool())
        .await?;

        rows.iter()
            .map(|row| -> Result<MessageStatus, StoreError> {
                let status: Option<String> = row.try_get("mailbox_status")?;
                Ok(MessageStatus {
                    id: row.try_get("id")?,
                    apple_rowid: row.try_get("apple_rowid")?,
                    is_read: row.try_get::<i64, _>("is_read")? != 0,
                    is_flagged: row.try_get::<i64, _>("is_flagged")? != 0,
                    mailbox_status: status
                        .as_deref()
                        .and_then(MailboxStatus::parse)
                        .unwrap_or(MailboxStatus::Inbox),
                })
            })
            .collect()
    }

    pub async fn update_message_status(
        &self,
        id: &str,
        is_read: bool,
        is_flagged: bool,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE messages SET is_read = ?1, is_flagged = ?2, updated_at = ?3 WHERE id = ?4",
        )
        .bind(is_read as i64)
        .bind(is_flagged as i64)
        .bind(now_ts())
        .bind(id)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    pub async fn update_mailbox_status(
        &self,
        id: &str,
        status: MailboxStatus,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE messages SET mailbox_status = ?1, updated_at = ?2 WHERE id = ?3",
        )
        .bind(status.as_str())
        .bind(now_ts())
        .bind(id)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    /// Atomically move a message to `status` while recording the intent that
    /// still has to reach the host.
    pub async fn set_status_with_pending(
        &self,
        id: &str,
        status: MailboxStatus,
        pending: PendingAction,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE messages
             SET mailbox_status = ?1, pending_sync_action = ?2, updated_at = ?3
             WHERE id = ?4",
        )
        .bind(status.as_str())
        .bind(pending.as_str())
        .bind(now_ts())
        .bind(id)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    pub async fn set_pending_sync_action(
        &self,
        id: &str,
        action: PendingAction,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE messages SET pending_sync_action = ?1, updated_at = ?2 WHERE id = ?3",
        )
        .bind(action.as_str())
        .bind(now_ts())
        .bind(id)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    pub async fn clear_pending_sync_action(&self, id: &str) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE messages SET pending_sync_action = NULL, updated_at = ?1 WHERE id = ?2",
        )
        .bind(now_ts())
        .bind(id)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    /// Messages with an unpushed intent, oldest update first so retries are
    /// served fairly.
    pub async fn get_messages_with_pending_actions(
        &self,
    ) -> Result<Vec<MailMessage>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM messages
             WHERE pending_sync_action IS NOT NULL AND is_deleted = 0
             ORDER BY updated_at ASC",
        )
        .fetch_all(self.pool())
        .await?;
        rows.iter().map(message_from_row).collect()
    }

    /// Live messages the mirror still considers inbox-resident.
    pub async fn get_tracked_inbox_messages(&self) -> Result<Vec<MailMessage>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM messages
             WHERE mailbox_status = 'inbox' AND is_deleted = 0 AND apple_rowid IS NOT NULL
             ORDER BY date_received DESC",
        )
        .fetch_all(self.pool())
        .await?;
        rows.iter().map(message_from_row).collect()
    }

    pub async fn get_messages_by_status(
        &self,
        status: MailboxStatus,
    ) -> Result<Vec<MailMessage>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM messages
             WHERE mailbox_status = ?1 AND is_deleted = 0
             ORDER BY date_received DESC",
        )
        .bind(status.as_str())
        .fetch_all(self.pool())
        .await?;
        rows.iter().map(message_from_row).collect()
    }

    // Sync status

    pub async fn record_sync_start(&self, is_incremental: bool) -> Result<(), StoreError> {
        let now = Utc::now().timestamp();
        self.put_sync_value("sync_state", SyncState::Running.as_str())
            .await?;
        self.put_sync_value("last_sync_start_time", &now.to_string())
            .await?;
        self.put_sync_value("last_sync_is_incremental", bool_str(is_incremental))
            .await?;
        Ok(())
    }

    pub async fn record_sync_success(&self, result: &SyncResult) -> Result<(), StoreError> {
        let now = Utc::now().timestamp();
        self.put_sync_value("sync_state", SyncState::Success.as_str())
            .await?;
        self.put_sync_value("last_sync_time", &now.to_string()).await?;
        self.put_sync_value("last_sync_end_time", &now.to_string())
            .await?;
        self.put_sync_value("last_sync_error", "").await?;
        self.put_sync_value("last_sync_messages_added", &result.added.to_string())
            .await?;
        self.put_sync_value("last_sync_messages_updated", &result.updated.to_string())
            .await?;
        self.put_sync_value("last_sync_messages_deleted", &result.deleted.to_string())
            .await?;
        self.put_sync_value(
            "last_sync_duration",
            &format!("{:.3}", result.duration_seconds),
        )
        .await?;
        self.put_sync_value(
            "last_sync_is_incremental",
            bool_str(result.is_incremental),
        )
        .await?;
        Ok(())
    }

    /// Record a failed run. `last_sync_time` is left untouched so the next
    /// incremental sync re-covers the failed window.
    pub async fn record_sync_failure(&self, error: &str) -> Result<(), StoreError> {
        let now = Utc::now().timestamp();
        self.put_sync_value("sync_state", SyncState::Failed.as_str())
            .await?;
        self.put_sync_value("last_sync_end_time", &now.to_string())
            .await?;
        self.put_sync_value("last_sync_error", error).await?;
        Ok(())
    }

    pub async fn get_last_sync_time(&self) -> Result<Option<DateTime<Utc>>, StoreError> {
        Ok(self
            .get_sync_value("last_sync_time")
            .await?
            .and_then(|v| v.parse::<i64>().ok())
            .and_then(|ts| Utc.timestamp_opt(ts, 0).single()))
    }

    pub async fn set_last_sync_time(&self, time: DateTime<Utc>) -> Result<(), StoreError> {
        self.put_sync_value("last_sync_time", &time.timestamp().to_string())
            .await
    }

    pub async fn get_sync_status_summary(&self) -> Result<SyncStatusSummary, StoreError> {
        let mut values = std::collections::HashMap::new();
        for key in SYNC_KEYS {
            if let Some(value) = self.get_sync_value(key).await? {
                values.insert(*key, value);
            }
        }

        let ts = |key: &str| from_ts(values.get(key).and_then(|v| v.parse::<i64>().ok()));

        Ok(SyncStatusSummary {
            state: values
                .get("sync_state")
                .and_then(|v| SyncState::parse(v))
                .unwrap_or(SyncState::Idle),
            last_sync_time: ts("last_sync_time"),
            last_start_time: ts("last_sync_start_time"),
            last_end_time: ts("last_sync_end_time"),
            last_error: values
                .get("last_sync_error")
                .filter(|v| !v.is_empty())
                .cloned(),
            messages_added: parse_count(values.get("last_sync_messages_added")),
            messages_updated: parse_count(values.get("last_sync_messages_updated")),
            messages_deleted: parse_count(values.get("last_sync_messages_deleted")),
            last_duration_seconds: values
                .get("last_sync_duration")
                .and_then(|v| v.parse().ok())
                .unwrap_or(0.0),
            last_was_incremental: values
                .get("last_sync_is_incremental")
                .map(|v| v == "true" || v == "1")
                .unwrap_or(false),
        })
    }

    async fn put_sync_value(&self, key: &str, value: &str) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO sync_status (key, value, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
        )
        .bind(key)
        .bind(value)
        .bind(now_ts())
        .execute(self.pool())
        .await?;
        Ok(())
    }

    async fn get_sync_value(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(
            sqlx::query_scalar("SELECT value FROM sync_status WHERE key = ?1")
                .bind(key)
                .fetch_optional(self.pool())
                .await?,
        )
    }
}

fn bool_str(value: bool) -> &'static str {
    if value { "true" } else { "false" }
}

fn parse_count(value: Option<&String>) -> i64 {
    value.and_then(|v| v.parse().ok()).unwrap_or(0)
}
