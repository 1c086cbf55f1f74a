//! Full-text search and the structured query grammar.
//!
//! A query line mixes named prefixes (`from:`, `to:`, `subject:`,
//! `mailbox:`, `is:`, `has:`, `after:`, `before:`, `date:`) with free text.
//! Prefixed tokens, quoted or bare, are stripped from the input; the residue
//! becomes the FTS MATCH text. Results are ranked by BM25 whenever FTS
//! participates, otherwise by receive date descending. Soft-deleted rows are
//! excluded from every search.

use std::sync::OnceLock;

use chrono::{Days, NaiveDate, NaiveTime, TimeZone, Utc};
use regex::Regex;
use sqlx::{QueryBuilder, Sqlite};

use super::{message_from_row, MirrorStore, StoreError};
use crate::models::{MailMessage, MailboxStatus};

/// Parsed structured query.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SearchFilter {
    pub free_text: Option<String>,
    pub from: Option<String>,
    pub to: Option<String>,
    pub subject: Option<String>,
    pub mailbox: Option<String>,
    pub is_read: Option<bool>,
    pub is_flagged: Option<bool>,
    pub has_attachment: Option<bool>,
    pub after: Option<NaiveDate>,
    pub before: Option<NaiveDate>,
    pub on_date: Option<NaiveDate>,
    pub mailbox_status: Option<MailboxStatus>,
}

fn token_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r#"(?i)\b(from|to|subject|mailbox|is|has|after|before|date):(?:"([^"]*)"|(\S+))"#)
            .unwrap()
    })
}

impl SearchFilter {
    /// Tokenize a query line. Matched prefix tokens are consumed; whatever
    /// remains is free text.
    pub fn parse(input: &str) -> Self {
        let mut filter = SearchFilter::default();
        let mut consumed: Vec<(usize, usize)> = Vec::new();

        for capture in token_pattern().captures_iter(input) {
            let whole = capture.get(0).unwrap();
            consumed.push((whole.start(), whole.end()));

            let key = capture.get(1).unwrap().as_str().to_lowercase();
            let value = capture
                .get(2)
                .or_else(|| capture.get(3))
                .map(|m| m.as_str())
                .unwrap_or_default();

            match key.as_str() {
                "from" => filter.from = Some(value.to_string()),
                "to" => filter.to = Some(value.to_string()),
                "subject" => filter.subject = Some(value.to_string()),
                "mailbox" => filter.mailbox = Some(value.to_string()),
                "is" => match value.to_lowercase().as_str() {
                    "read" => filter.is_read = Some(true),
                    "unread" => filter.is_read = Some(false),
                    "flagged" => filter.is_flagged = Some(true),
                    "unflagged" => filter.is_flagged = Some(false),
                    other => log::debug!("ignoring unknown is: value `{other}`"),
                },
                "has" => match value.to_lowercase().as_str() {
                    "attachment" | "attachments" => filter.has_attachment = Some(true),
                    other => log::debug!("ignoring unknown has: value `{other}`"),
                },
                "after" => filter.after = parse_day(value),
                "before" => filter.before = parse_day(value),
                "date" => filter.on_date = parse_day(value),
                _ => {}
            }
        }

        let mut residue = String::new();
        let mut cursor = 0;
        for (start, end) in consumed {
            residue.push_str(&input[cursor..start]);
            cursor = end;
        }
        residue.push_str(&input[cursor..]);

        let residue = residue.split_whitespace().collect::<Vec<_>>().join(" ");
        if !residue.is_empty() {
            filter.free_text = Some(residue);
        }

        filter
    }
}

fn parse_day(value: &str) -> Option<NaiveDate> {
    match NaiveDate::parse_from_str(value, "%Y-%m-%d") {
        Ok(day) => Some(day),
        Err(_) => {
            log::debug!("ignoring unparseable date filter `{value}`");
            None
        }
    }
}

fn day_start_ts(day: NaiveDate) -> i64 {
    Utc.from_utc_datetime(&day.and_time(NaiveTime::MIN)).timestamp()
}

/// Quote each whitespace token so user input cannot break FTS5 syntax.
fn fts_escape(text: &str) -> String {
    text.split_whitespace()
        .map(|token| format!("\"{}\"", token.replace('"', "\"\"")))
        .collect::<Vec<_>>()
        .join(" ")
}

impl MirrorStore {
    /// Free-text search over subject, sender, and body.
    pub async fn search_messages(
        &self,
        query: &str,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<MailMessage>, StoreError> {
        let filter = SearchFilter {
            free_text: Some(query.to_string()).filter(|q| !q.trim().is_empty()),
            ..Default::default()
        };
        self.search_messages_with_filters(&filter, limit, offset)
            .await
    }

    /// Combined FTS + structured predicate search.
    pub async fn search_messages_with_filters(
        &self,
        filter: &SearchFilter,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<MailMessage>, StoreError> {
        let fts_query = filter
            .free_text
            .as_deref()
            .map(str::trim)
            .filter(|text| !text.is_empty())
            .map(fts_escape);

        let mut builder = QueryBuilder::<Sqlite>::new("SELECT m.* FROM messages m");
        if fts_query.is_some() {
            builder.push(" JOIN messages_fts ON messages_fts.rowid = m.rowid");
        }
        builder.push(" WHERE m.is_deleted = 0");

        if let Some(fts) = &fts_query {
            builder.push(" AND messages_fts MATCH ");
            builder.push_bind(fts.clone());
        }
        if let Some(from) = &filter.from {
            let pattern = format!("%{}%", from.to_lowercase());
            builder.push(" AND (LOWER(m.sender_email) LIKE ");
            builder.push_bind(pattern.clone());
            builder.push(" OR LOWER(m.sender_name) LIKE ");
            builder.push_bind(pattern);
            builder.push(")");
        }
        if let Some(to) = &filter.to {
            builder.push(
                " AND EXISTS (SELECT 1 FROM recipients r
                    WHERE r.message_id = m.id AND LOWER(r.email) LIKE ",
            );
            builder.push_bind(format!("%{}%", to.to_lowercase()));
            builder.push(")");
        }
        if let Some(subject) = &filter.subject {
            builder.push(" AND LOWER(m.subject) LIKE ");
            builder.push_bind(format!("%{}%", subject.to_lowercase()));
        }
        if let Some(mailbox) = &filter.mailbox {
            builder.push(" AND LOWER(m.mailbox_name) LIKE ");
            builder.push_bind(format!("%{}%", mailbox.to_lowercase()));
        }
        if let Some(is_read) = filter.is_read {
            builder.push(" AND m.is_read = ");
            builder.push_bind(is_read as i64);
        }
        if let Some(is_flagged) = filter.is_flagged {
            builder.push(" AND m.is_flagged = ");
            builder.push_bind(is_flagged as i64);
        }
        if let Some(has_attachment) = filter.has_attachment {
            builder.push(" AND m.has_attachments = ");
            builder.push_bind(has_attachment as i64);
        }
        if let Some(after) = filter.after {
            builder.push(" AND m.date_received >= ");
            builder.push_bind(day_start_ts(after));
        }
        if let Some(before) = filter.before {
            builder.push(" AND m.date_received < ");
            builder.push_bind(day_start_ts(before));
        }
        if let Some(day) = filter.on_date {
            builder.push(" AND m.date_received >= ");
            builder.push_bind(day_start_ts(day));
            if let Some(next) = day.checked_add_days(Days::new(1)) {
                builder.push(" AND m.date_received < ");
                builder.push_bind(day_start_ts(next));
            }
        }
        if let Some(status) = filter.mailbox_status {
            builder.push(" AND m.mailbox_status = ");
            builder.push_bind(status.as_str());
        }

        if fts_query.is_some() {
            builder.push(" ORDER BY bm25(messages_fts)");
        } else {
            builder.push(" ORDER BY m.date_received DESC");
        }
        builder.push(" LIMIT ");
        builder.push_bind(limit);
        builder.push(" OFFSET ");
        builder.push_bind(offset);

        let rows = builder.build().fetch_all(self.pool()).await?;
        rows.iter().map(message_from_row).collect()
    }
}
