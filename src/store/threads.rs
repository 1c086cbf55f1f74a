//! Thread records and the thread/message junction.
//!
//! The thread-to-message relation is an explicit junction table with cascade
//! delete on both sides; a message may belong to more than one thread.
//! Thread subjects are sticky: once set they are never overwritten by later
//! members.

use sqlx::sqlite::SqliteRow;
use sqlx::{QueryBuilder, Row, Sqlite};

use super::messages::placeholders;
use super::{from_ts, message_from_row, now_ts, to_ts, MirrorStore, StoreError};
use crate::models::{MailMessage, MailThread};

/// Sort orders accepted by `get_threads`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ThreadSort {
    /// Most recent activity first.
    #[default]
    DateDesc,
    /// Alphabetical subject, untitled threads last.
    SubjectAscNullsLast,
    /// Largest conversations first.
    MessageCountDesc,
}

/// Paged thread listing parameters.
#[derive(Debug, Clone, Default)]
pub struct ThreadQuery {
    pub limit: i64,
    pub offset: i64,
    pub sort: ThreadSort,
    /// Case-insensitive substring matched against sender and recipient
    /// addresses of the thread's live messages.
    pub participant: Option<String>,
}

impl MirrorStore {
    /// Insert or update a thread record. The stored subject wins over the
    /// incoming one, keeping the first admitted subject sticky.
    pub async fn upsert_thread(&self, thread: &MailThread) -> Result<(), StoreError> {
        let now = now_ts();
        sqlx::query(
            "INSERT INTO threads (
                id, subject, participant_count, message_count,
                first_message_date, last_message_date, created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            ON CONFLICT(id) DO UPDATE SET
                subject = COALESCE(threads.subject, excluded.subject),
                participant_count = excluded.participant_count,
                message_count = excluded.message_count,
                first_message_date = excluded.first_message_date,
                last_message_date = excluded.last_message_date,
                updated_at = excluded.updated_at",
        )
        .bind(&thread.id)
        .bind(&thread.subject)
        .bind(thread.participant_count)
        .bind(thread.message_count)
        .bind(to_ts(thread.first_message_date))
        .bind(to_ts(thread.last_message_date))
        .bind(to_ts(thread.created_at).unwrap_or(now))
        .bind(now)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    pub async fn get_thread(&self, id: &str) -> Result<Option<MailThread>, StoreError> {
        let row = sqlx::query(
            "SELECT id, subject, participant_count, message_count,
                    first_message_date, last_message_date, created_at, updated_at
             FROM threads WHERE id = ?1",
        )
        .bind(id)
        .fetch_optional(self.pool())
        .await?;
        row.as_ref().map(thread_from_row).transpose()
    }

    /// List threads with paging, sorting, and an optional participant filter.
    pub async fn get_threads(&self, query: &ThreadQuery) -> Result<Vec<MailThread>, StoreError> {
        let mut builder = QueryBuilder::<Sqlite>::new(
            "SELECT t.id, t.subject, t.participant_count, t.message_count,
                    t.first_message_date, t.last_message_date, t.created_at, t.updated_at
             FROM threads t WHERE 1 = 1",
        );
        push_participant_filter(&mut builder, query.participant.as_deref());

        match query.sort {
            ThreadSort::DateDesc => builder.push(" ORDER BY t.last_message_date DESC"),
            ThreadSort::SubjectAscNullsLast => {
                builder.push(" ORDER BY t.subject IS NULL, t.subject ASC")
            }
            ThreadSort::MessageCountDesc => builder.push(" ORDER BY t.message_count DESC"),
        };
        builder.push(" LIMIT ");
        builder.push_bind(query.limit.max(0));
        builder.push(" OFFSET ");
        builder.push_bind(query.offset.max(0));

        let rows = builder.build().fetch_all(self.pool()).await?;
        rows.iter().map(thread_from_row).collect()
    }

    pub async fn get_thread_count(&self, participant: Option<&str>) -> Result<i64, StoreError> {
        let mut builder =
            QueryBuilder::<Sqlite>::new("SELECT COUNT(*) FROM threads t WHERE 1 = 1");
        push_participant_filter(&mut builder, participant);
        let row = builder.build().fetch_one(self.pool()).await?;
        Ok(row.try_get(0)?)
    }

    // Junction operations

    /// Idempotently link a message into a thread. Returns true when the
    /// junction row was newly created.
    pub async fn add_message_to_thread(
        &self,
        thread_id: &str,
        message_id: &str,
    ) -> Result<bool, StoreError> {
        let done = sqlx::query(
            "INSERT OR IGNORE INTO thread_messages (thread_id, message_id, added_at)
             VALUES (?1, ?2, ?3)",
        )
        .bind(thread_id)
        .bind(message_id)
        .bind(now_ts())
        .execute(self.pool())
        .await?;
        Ok(done.rows_affected() > 0)
    }

    pub async fn remove_message_from_thread(
        &self,
        thread_id: &str,
        message_id: &str,
    ) -> Result<bool, StoreError> {
        let done = sqlx::query(
            "DELETE FROM thread_messages WHERE thread_id = ?1 AND message_id = ?2",
        )
        .bind(thread_id)
        .bind(message_id)
        .execute(self.pool())
        .await?;
        Ok(done.rows_affected() > 0)
    }

    pub async fn get_message_ids_in_thread(
        &self,
        thread_id: &str,
    ) -> Result<Vec<String>, StoreError> {
        Ok(sqlx::query_scalar(
            "SELECT message_id FROM thread_messages WHERE thread_id = ?1 ORDER BY added_at, message_id",
        )
        .bind(thread_id)
        .fetch_all(self.pool())
        .await?)
    }

    pub async fn get_thread_ids_for_message(
        &self,
        message_id: &str,
    ) -> Result<Vec<String>, StoreError> {
        Ok(sqlx::query_scalar(
            "SELECT thread_id FROM thread_messages WHERE message_id = ?1 ORDER BY added_at, thread_id",
        )
        .bind(message_id)
        .fetch_all(self.pool())
        .await?)
    }

    /// Live messages of a thread, date ascending.
    pub async fn get_messages_in_thread_via_junction(
        &self,
        thread_id: &str,
    ) -> Result<Vec<MailMessage>, StoreError> {
        let rows = sqlx::query(
            "SELECT m.* FROM messages m
             JOIN thread_messages tm ON tm.message_id = m.id
             WHERE tm.thread_id = ?1 AND m.is_deleted = 0
             ORDER BY COALESCE(m.date_received, m.date_sent, 0) ASC, m.id ASC",
        )
        .bind(thread_id)
        .fetch_all(self.pool())
        .await?;
        rows.iter().map(message_from_row).collect()
    }

    /// Junction cardinality for a thread (live and soft-deleted members).
    pub async fn get_message_count_in_thread(&self, thread_id: &str) -> Result<i64, StoreError> {
        Ok(
            sqlx::query_scalar("SELECT COUNT(*) FROM thread_messages WHERE thread_id = ?1")
                .bind(thread_id)
                .fetch_one(self.pool())
                .await?,
        )
    }

    pub async fn is_message_in_thread(
        &self,
        thread_id: &str,
        message_id: &str,
    ) -> Result<bool, StoreError> {
        let found: Option<i64> = sqlx::query_scalar(
            "SELECT 1 FROM thread_messages WHERE thread_id = ?1 AND message_id = ?2",
        )
        .bind(thread_id)
        .bind(message_id)
        .fetch_optional(self.pool())
        .await?;
        Ok(found.is_some())
    }

    /// Distinct live sender addresses across the thread, floored at 1.
    pub async fn count_thread_participants(&self, thread_id: &str) -> Result<i64, StoreError> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(DISTINCT LOWER(m.sender_email)) FROM messages m
             JOIN thread_messages tm ON tm.message_id = m.id
             WHERE tm.thread_id = ?1 AND m.is_deleted = 0 AND m.sender_email IS NOT NULL",
        )
        .bind(thread_id)
        .fetch_one(self.pool())
        .await?;
        Ok(count.max(1))
    }

    pub async fn set_message_thread(
        &self,
        message_id: &str,
        thread_id: &str,
    ) -> Result<(), StoreError> {
        sqlx::query("UPDATE messages SET thread_id = ?1, updated_at = ?2 WHERE id = ?3")
            .bind(thread_id)
            .bind(now_ts())
            .bind(message_id)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    /// Recompute 1-based positions and totals for a thread's live messages.
    ///
    /// Small threads get per-row updates; larger ones are collapsed into a
    /// single CASE expression so the whole thread costs one round-trip.
    pub async fn recompute_thread_positions(&self, thread_id: &str) -> Result<(), StoreError> {
        let ordered: Vec<String> = sqlx::query_scalar(
            "SELECT m.id FROM messages m
             JOIN thread_messages tm ON tm.message_id = m.id
             WHERE tm.thread_id = ?1 AND m.is_deleted = 0
             ORDER BY COALESCE(m.date_received, m.date_sent, 0) ASC, m.id ASC",
        )
        .bind(thread_id)
        .fetch_all(self.pool())
        .await?;

        let total = ordered.len() as i64;
        if ordered.is_empty() {
            return Ok(());
        }

        if ordered.len() <= 10 {
            for (index, id) in ordered.iter().enumerate() {
                sqlx::query(
                    "UPDATE messages SET thread_position = ?1, thread_total = ?2 WHERE id = ?3",
                )
                .bind(index as i64 + 1)
                .bind(total)
                .bind(id)
                .execute(self.pool())
                .await?;
            }
            return Ok(());
        }

        let mut sql = String::from("UPDATE messages SET thread_position = CASE id ");
        for _ in &ordered {
            sql.push_str("WHEN ? THEN ? ");
        }
        sql.push_str("END, thread_total = ? WHERE id IN (");
        sql.push_str(&placeholders(ordered.len()));
        sql.push(')');

        let mut query = sqlx::query(&sql);
        for (index, id) in ordered.iter().enumerate() {
            query = query.bind(id).bind(index as i64 + 1);
        }
        query = query.bind(total);
        for id in &ordered {
            query = query.bind(id);
        }
        query.execute(self.pool()).await?;
        Ok(())
    }
}

fn push_participant_filter(builder: &mut QueryBuilder<'_, Sqlite>, participant: Option<&str>) {
    let Some(participant) = participant else {
        return;
    };
    let pattern = format!("%{}%", participant.to_lowercase());
    builder.push(
        " AND (EXISTS (SELECT 1 FROM messages pm
            WHERE pm.thread_id = t.id AND pm.is_deleted = 0
              AND LOWER(pm.sender_email) LIKE ",
    );
    builder.push_bind(pattern.clone());
    builder.push(
        ") OR EXISTS (SELECT 1 FROM messages pm
            JOIN recipients pr ON pr.message_id = pm.id
            WHERE pm.thread_id = t.id AND pm.is_deleted = 0
              AND LOWER(pr.email) LIKE ",
    );
    builder.push_bind(pattern);
    builder.push("))");
}

fn thread_from_row(row: &SqliteRow) -> Result<MailThread, StoreError> {
    Ok(MailThread {
        id: row.try_get("id")?,
        subject: row.try_get("subject")?,
        participant_count: row.try_get("participant_count")?,
        message_count: row.try_get("message_count")?,
        first_message_date: from_ts(row.try_get("first_message_date")?),
        last_message_date: from_ts(row.try_get("last_message_date")?),
        created_at: from_ts(row.try_get("created_at")?),
        updated_at: from_ts(row.try_get("updated_at")?),
    })
}
