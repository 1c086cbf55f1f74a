//! Domain records shared across the discovery, parsing, threading, store,
//! and sync layers.
//!
//! Rows read from the host envelope database are converted into these
//! strongly-typed records at the boundary; downstream code never branches on
//! runtime value types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Functional classification of a mailbox, derived from its name and URL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MailboxKind {
    Inbox,
    Archive,
    Trash,
    Sent,
    Drafts,
    Junk,
    Other,
}

/// Keyword groups checked in order. Matching is case-insensitive and accepts
/// either an exact name match or a substring of the name or URL.
const KIND_KEYWORDS: &[(MailboxKind, &[&str])] = &[
    (MailboxKind::Inbox, &["inbox"]),
    (
        MailboxKind::Archive,
        &["archive", "all mail", "archives", "archivo", "archiv"],
    ),
    (
        MailboxKind::Trash,
        &[
            "trash",
            "deleted messages",
            "deleted",
            "papelera",
            "corbeille",
            "papierkorb",
        ],
    ),
    (
        MailboxKind::Sent,
        &["sent messages", "sent mail", "sent"],
    ),
    (MailboxKind::Drafts, &["drafts", "draft"]),
    (MailboxKind::Junk, &["junk e-mail", "junk", "spam"]),
];

impl MailboxKind {
    /// Classify a mailbox from its display name and full URL.
    pub fn classify(name: &str, url: &str) -> Self {
        let name = name.to_lowercase();
        let url = url.to_lowercase();

        for (kind, keywords) in KIND_KEYWORDS {
            for keyword in *keywords {
                if name == *keyword || name.contains(keyword) || url.contains(keyword) {
                    return *kind;
                }
            }
        }

        MailboxKind::Other
    }
}

/// Where the mirror believes a message currently lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MailboxStatus {
    Inbox,
    Archived,
    Deleted,
}

impl MailboxStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MailboxStatus::Inbox => "inbox",
            MailboxStatus::Archived => "archived",
            MailboxStatus::Deleted => "deleted",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "inbox" => Some(MailboxStatus::Inbox),
            "archived" => Some(MailboxStatus::Archived),
            "deleted" => Some(MailboxStatus::Deleted),
            _ => None,
        }
    }
}

/// A recorded intent that still has to be pushed to the host application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PendingAction {
    Archive,
    Delete,
}

impl PendingAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            PendingAction::Archive => "archive",
            PendingAction::Delete => "delete",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "archive" => Some(PendingAction::Archive),
            "delete" => Some(PendingAction::Delete),
            _ => None,
        }
    }
}

/// Which recipient header an address came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecipientKind {
    To,
    Cc,
    Bcc,
}

impl RecipientKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecipientKind::To => "to",
            RecipientKind::Cc => "cc",
            RecipientKind::Bcc => "bcc",
        }
    }
}

/// A single parsed mailbox address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MailAddress {
    /// Display name, absent when the header carried only the address.
    pub name: Option<String>,
    pub email: String,
}

/// A recipient row owned by a message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Recipient {
    pub kind: RecipientKind,
    pub name: Option<String>,
    pub email: String,
}

/// Attachment metadata extracted from a MIME part.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttachmentInfo {
    pub filename: Option<String>,
    pub mime_type: String,
    /// Decoded size in bytes; estimated for base64 parts.
    pub size_bytes: i64,
    pub content_id: Option<String>,
    pub is_inline: bool,
}

/// A message row in the mirror database.
///
/// `id` is the content-addressed stable identifier; `apple_rowid` is the
/// host's ROWID when known. Timestamps are UTC instants; the store persists
/// them as Unix seconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MailMessage {
    pub id: String,
    pub apple_rowid: Option<i64>,
    /// RFC 822 Message-ID as found in the headers.
    pub message_id: Option<String>,
    pub mailbox_id: Option<i64>,
    pub mailbox_name: Option<String>,
    pub account_id: Option<String>,
    pub subject: Option<String>,
    pub sender_name: Option<String>,
    pub sender_email: Option<String>,
    pub date_sent: Option<DateTime<Utc>>,
    pub date_received: Option<DateTime<Utc>>,
    pub is_read: bool,
    pub is_flagged: bool,
    /// Soft-delete marker; excluded from every read path except admin ones.
    pub is_deleted: bool,
    pub has_attachments: bool,
    /// Absolute path of the on-disk message file, when resolved.
    pub file_path: Option<String>,
    pub body_text: Option<String>,
    pub body_html: Option<String>,
    pub export_path: Option<String>,
    pub mailbox_status: MailboxStatus,
    pub pending_sync_action: Option<PendingAction>,
    pub last_known_mailbox_id: Option<i64>,
    pub in_reply_to: Option<String>,
    /// Ordered References chain, oldest first.
    pub references: Vec<String>,
    pub thread_id: Option<String>,
    /// 1-based position within the thread, date ascending.
    pub thread_position: Option<i64>,
    pub thread_total: Option<i64>,
    pub synced_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
    pub recipients: Vec<Recipient>,
    pub attachments: Vec<AttachmentInfo>,
}

impl MailMessage {
    /// Empty message carrying only its stable identifier.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            apple_rowid: None,
            message_id: None,
            mailbox_id: None,
            mailbox_name: None,
            account_id: None,
            subject: None,
            sender_name: None,
            sender_email: None,
            date_sent: None,
            date_received: None,
            is_read: false,
            is_flagged: false,
            is_deleted: false,
            has_attachments: false,
            file_path: None,
            body_text: None,
            body_html: None,
            export_path: None,
            mailbox_status: MailboxStatus::Inbox,
            pending_sync_action: None,
            last_known_mailbox_id: None,
            in_reply_to: None,
            references: Vec::new(),
            thread_id: None,
            thread_position: None,
            thread_total: None,
            synced_at: None,
            updated_at: None,
            recipients: Vec::new(),
            attachments: Vec::new(),
        }
    }

    /// A message is a reply when it points at an earlier message.
    pub fn is_reply(&self) -> bool {
        self.in_reply_to.is_some() || !self.references.is_empty()
    }

    /// Forward detection based on the leading subject prefix.
    pub fn is_forward(&self) -> bool {
        let Some(subject) = &self.subject else {
            return false;
        };
        crate::threading::subject::is_forward_subject(subject)
    }
}

/// A mailbox row mirrored from the host, identified by the host's ROWID.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Mailbox {
    pub id: i64,
    pub account_id: Option<String>,
    /// Last path component of the URL, percent-decoded.
    pub name: String,
    pub url: Option<String>,
    pub parent_id: Option<i64>,
    pub message_count: i64,
    pub unread_count: i64,
    pub synced_at: Option<DateTime<Utc>>,
}

/// A conversation record aggregated over its member messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MailThread {
    /// Deterministic 32-hex thread identifier.
    pub id: String,
    /// Subject of the first admitted message; sticky once set.
    pub subject: Option<String>,
    pub participant_count: i64,
    pub message_count: i64,
    pub first_message_date: Option<DateTime<Utc>>,
    pub last_message_date: Option<DateTime<Utc>>,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

/// Lightweight status tuple used by the incremental sync phases.
#[derive(Debug, Clone)]
pub struct MessageStatus {
    pub id: String,
    pub apple_rowid: Option<i64>,
    pub is_read: bool,
    pub is_flagged: bool,
    pub mailbox_status: MailboxStatus,
}

/// Overall sync lifecycle state persisted in the `sync_status` table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncState {
    Idle,
    Running,
    Success,
    Failed,
}

impl SyncState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncState::Idle => "idle",
            SyncState::Running => "running",
            SyncState::Success => "success",
            SyncState::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "idle" => Some(SyncState::Idle),
            "running" => Some(SyncState::Running),
            "success" => Some(SyncState::Success),
            "failed" => Some(SyncState::Failed),
            _ => None,
        }
    }
}

/// Progress phases reported while a forward sync runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncPhase {
    Discovering,
    SyncingMailboxes,
    SyncingMessages,
    Indexing,
    Threading,
    Complete,
}

impl SyncPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncPhase::Discovering => "discovering",
            SyncPhase::SyncingMailboxes => "syncing_mailboxes",
            SyncPhase::SyncingMessages => "syncing_messages",
            SyncPhase::Indexing => "indexing",
            SyncPhase::Threading => "threading",
            SyncPhase::Complete => "complete",
        }
    }
}

/// Outcome of one forward-sync run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncResult {
    pub processed: usize,
    pub added: usize,
    pub updated: usize,
    pub deleted: usize,
    pub unchanged: usize,
    pub mailboxes: usize,
    pub threads_created: usize,
    pub threads_updated: usize,
    /// Non-fatal per-message and threading errors collected during the run.
    pub errors: Vec<String>,
    pub duration_seconds: f64,
    pub is_incremental: bool,
}

/// Typed view over the `sync_status` key/value contract.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncStatusSummary {
    pub state: SyncState,
    pub last_sync_time: Option<DateTime<Utc>>,
    pub last_start_time: Option<DateTime<Utc>>,
    pub last_end_time: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub messages_added: i64,
    pub messages_updated: i64,
    pub messages_deleted: i64,
    pub last_duration_seconds: f64,
    pub last_was_incremental: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_by_name() {
        assert_eq!(
            MailboxKind::classify("INBOX", "mailbox://acct/INBOX"),
            MailboxKind::Inbox
        );
        assert_eq!(
            MailboxKind::classify("Deleted Messages", "mailbox://acct/Deleted%20Messages"),
            MailboxKind::Trash
        );
        assert_eq!(
            MailboxKind::classify("Papierkorb", "mailbox://acct/Papierkorb"),
            MailboxKind::Trash
        );
        assert_eq!(
            MailboxKind::classify("All Mail", "mailbox://acct/%5BGmail%5D/All%20Mail"),
            MailboxKind::Archive
        );
        assert_eq!(
            MailboxKind::classify("Projects", "mailbox://acct/Projects"),
            MailboxKind::Other
        );
    }

    #[test]
    fn classify_is_case_insensitive() {
        assert_eq!(
            MailboxKind::classify("JUNK E-MAIL", "mailbox://acct/Junk%20E-mail"),
            MailboxKind::Junk
        );
        assert_eq!(
            MailboxKind::classify("archivo", "mailbox://acct/Archivo"),
            MailboxKind::Archive
        );
    }

    #[test]
    fn status_round_trip() {
        for status in [
            MailboxStatus::Inbox,
            MailboxStatus::Archived,
            MailboxStatus::Deleted,
        ] {
            assert_eq!(MailboxStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(MailboxStatus::parse("purgatory"), None);
    }
}
