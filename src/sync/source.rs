//! Read-only access to the host envelope database.
//!
//! The host index is opened read-only with a 5-second busy timeout; the host
//! application keeps writing to it while we read. Untyped host rows are
//! converted into `HostMessageRow` at this boundary.

use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::Row;

use super::SyncError;

/// One joined message row from the host index.
#[derive(Debug, Clone)]
pub struct HostMessageRow {
    pub rowid: i64,
    pub subject: Option<String>,
    pub sender_email: Option<String>,
    pub sender_name: Option<String>,
    /// Unix seconds.
    pub date_received: Option<i64>,
    pub date_sent: Option<i64>,
    pub message_id: Option<String>,
    pub mailbox_id: Option<i64>,
    pub is_read: bool,
    pub is_flagged: bool,
}

impl HostMessageRow {
    /// `"Name" <email>` when both parts are known, else the bare email.
    pub fn pseudo_sender(&self) -> Option<String> {
        match (&self.sender_name, &self.sender_email) {
            (Some(name), Some(email)) if !name.is_empty() => {
                Some(format!("\"{name}\" <{email}>"))
            }
            (_, Some(email)) => Some(email.clone()),
            _ => None,
        }
    }
}

const JOINED_SELECT: &str = "SELECT m.ROWID AS rowid, s.subject, a.address AS sender_email,
       a.comment AS sender_name, m.date_received, m.date_sent, m.message_id,
       m.mailbox AS mailbox_id, m.read AS is_read, m.flagged AS is_flagged
  FROM messages m
  LEFT JOIN subjects s ON m.subject = s.ROWID
  LEFT JOIN addresses a ON m.sender = a.ROWID
  INNER JOIN mailboxes mb ON m.mailbox = mb.ROWID";

/// Handle to the host envelope database.
pub struct HostEnvelope {
    pool: SqlitePool,
}

impl HostEnvelope {
    /// Open the envelope index read-only.
    pub async fn open(path: &Path) -> Result<Self, SyncError> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .read_only(true)
            .busy_timeout(Duration::from_millis(5000));

        let pool = SqlitePoolOptions::new()
            .max_connections(2)
            .connect_with(options)
            .await
            .map_err(|err| {
                let text = err.to_string();
                if text.contains("locked") || text.contains("busy") {
                    SyncError::SourceDatabaseLocked
                } else {
                    SyncError::SourceConnectionFailed(err)
                }
            })?;

        Ok(Self { pool })
    }

    /// `(ROWID, url)` of every host mailbox.
    pub async fn fetch_mailboxes(&self) -> Result<Vec<(i64, Option<String>)>, SyncError> {
        let sql = "SELECT ROWID AS rowid, url FROM mailboxes";
        let rows = sqlx::query(sql)
            .fetch_all(&self.pool)
            .await
            .map_err(|source| query_failed(sql, source))?;
        rows.iter()
            .map(|row| {
                Ok((
                    row.try_get("rowid").map_err(|e| query_failed(sql, e))?,
                    row.try_get("url").map_err(|e| query_failed(sql, e))?,
                ))
            })
            .collect()
    }

    /// Joined inbox rows, newest received first. `since` (Unix seconds)
    /// restricts to rows the host received after the last sync.
    pub async fn fetch_inbox_messages(
        &self,
        since: Option<i64>,
    ) -> Result<Vec<HostMessageRow>, SyncError> {
        let sql = match since {
            Some(_) => format!(
                "{JOINED_SELECT}
                 WHERE LOWER(mb.url) LIKE '%/inbox' AND m.date_received > ?1
                 ORDER BY m.date_received DESC"
            ),
            None => format!(
                "{JOINED_SELECT}
                 WHERE LOWER(mb.url) LIKE '%/inbox'
                 ORDER BY m.date_received DESC"
            ),
        };

        let mut query = sqlx::query(&sql);
        if let Some(since) = since {
            query = query.bind(since as f64);
        }
        let rows = query
            .fetch_all(&self.pool)
            .await
            .map_err(|source| query_failed(&sql, source))?;

        rows.iter().map(|row| message_row(&sql, row)).collect()
    }

    /// ROWIDs currently resident in the primary inbox.
    pub async fn fetch_inbox_rowids(&self) -> Result<HashSet<i64>, SyncError> {
        let sql = "SELECT m.ROWID AS rowid FROM messages m
                   INNER JOIN mailboxes mb ON m.mailbox = mb.ROWID
                   WHERE LOWER(mb.url) LIKE '%/inbox'";
        let rowids: Vec<i64> = sqlx::query_scalar(sql)
            .fetch_all(&self.pool)
            .await
            .map_err(|source| query_failed(sql, source))?;
        Ok(rowids.into_iter().collect())
    }

    /// Joined rows for an explicit ROWID set.
    pub async fn fetch_messages_by_rowids(
        &self,
        rowids: &[i64],
    ) -> Result<Vec<HostMessageRow>, SyncError> {
        if rowids.is_empty() {
            return Ok(Vec::new());
        }
        let sql = format!(
            "{JOINED_SELECT} WHERE m.ROWID IN ({}) ORDER BY m.date_received DESC",
            placeholders(rowids.len())
        );
        let mut query = sqlx::query(&sql);
        for rowid in rowids {
            query = query.bind(rowid);
        }
        let rows = query
            .fetch_all(&self.pool)
            .await
            .map_err(|source| query_failed(&sql, source))?;
        rows.iter().map(|row| message_row(&sql, row)).collect()
    }

    /// `(ROWID, read, flagged)` for a batch of ROWIDs.
    pub async fn fetch_flags(&self, rowids: &[i64]) -> Result<Vec<(i64, bool, bool)>, SyncError> {
        if rowids.is_empty() {
            return Ok(Vec::new());
        }
        let sql = format!(
            "SELECT ROWID AS rowid, read, flagged FROM messages WHERE ROWID IN ({})",
            placeholders(rowids.len())
        );
        let mut query = sqlx::query(&sql);
        for rowid in rowids {
            query = query.bind(rowid);
        }
        let rows = query
            .fetch_all(&self.pool)
            .await
            .map_err(|source| query_failed(&sql, source))?;

        rows.iter()
            .map(|row| {
                Ok((
                    row.try_get("rowid").map_err(|e| query_failed(&sql, e))?,
                    row.try_get::<Option<i64>, _>("read")
                        .map_err(|e| query_failed(&sql, e))?
                        .unwrap_or(0)
                        != 0,
                    row.try_get::<Option<i64>, _>("flagged")
                        .map_err(|e| query_failed(&sql, e))?
                        .unwrap_or(0)
                        != 0,
                ))
            })
            .collect()
    }

    /// `(ROWID, mailbox ROWID)` for a batch of ROWIDs.
    pub async fn fetch_mailbox_assignments(
        &self,
        rowids: &[i64],
    ) -> Result<Vec<(i64, i64)>, SyncError> {
        if rowids.is_empty() {
            return Ok(Vec::new());
        }
        let sql = format!(
            "SELECT ROWID AS rowid, mailbox FROM messages
             WHERE ROWID IN ({}) AND mailbox IS NOT NULL",
            placeholders(rowids.len())
        );
        let mut query = sqlx::query(&sql);
        for rowid in rowids {
            query = query.bind(rowid);
        }
        let rows = query
            .fetch_all(&self.pool)
            .await
            .map_err(|source| query_failed(&sql, source))?;

        rows.iter()
            .map(|row| {
                Ok((
                    row.try_get("rowid").map_err(|e| query_failed(&sql, e))?,
                    row.try_get("mailbox").map_err(|e| query_failed(&sql, e))?,
                ))
            })
            .collect()
    }

    /// Which of `rowids` still exist on the host.
    pub async fn existing_rowids(&self, rowids: &[i64]) -> Result<HashSet<i64>, SyncError> {
        if rowids.is_empty() {
            return Ok(HashSet::new());
        }
        let sql = format!(
            "SELECT ROWID AS rowid FROM messages WHERE ROWID IN ({})",
            placeholders(rowids.len())
        );
        let mut query = sqlx::query_scalar::<_, i64>(&sql);
        for rowid in rowids {
            query = query.bind(rowid);
        }
        let rowids: Vec<i64> = query
            .fetch_all(&self.pool)
            .await
            .map_err(|source| query_failed(&sql, source))?;
        Ok(rowids.into_iter().collect())
    }
}

fn query_failed(sql: &str, source: sqlx::Error) -> SyncError {
    SyncError::QueryFailed {
        sql: sql.to_string(),
        source,
    }
}

fn placeholders(count: usize) -> String {
    vec!["?"; count].join(",")
}

/// Read a seconds column that may be stored as REAL or INTEGER.
fn seconds_column(row: &sqlx::sqlite::SqliteRow, column: &str) -> Result<Option<i64>, sqlx::Error> {
    match row.try_get::<Option<f64>, _>(column) {
        Ok(value) => Ok(value.map(|v| v as i64)),
        Err(_) => row.try_get::<Option<i64>, _>(column),
    }
}

fn message_row(sql: &str, row: &sqlx::sqlite::SqliteRow) -> Result<HostMessageRow, SyncError> {
    let get = |e: sqlx::Error| query_failed(sql, e);

    Ok(HostMessageRow {
        rowid: row.try_get("rowid").map_err(get)?,
        subject: row.try_get("subject").map_err(get)?,
        sender_email: row.try_get("sender_email").map_err(get)?,
        sender_name: row.try_get("sender_name").map_err(get)?,
        date_received: seconds_column(row, "date_received").map_err(get)?,
        date_sent: seconds_column(row, "date_sent").map_err(get)?,
        message_id: row.try_get("message_id").map_err(get)?,
        mailbox_id: row.try_get("mailbox_id").map_err(get)?,
        is_read: row
            .try_get::<Option<i64>, _>("is_read")
            .map_err(get)?
            .unwrap_or(0)
            != 0,
        is_flagged: row
            .try_get::<Option<i64>, _>("is_flagged")
            .map_err(get)?
            .unwrap_or(0)
            != 0,
    })
}
