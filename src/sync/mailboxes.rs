//! Per-sync mailbox cache and URL handling.
//!
//! The mailbox prelude of a sync resolves every host mailbox once:
//! classification, display name, account, and the on-disk path message files
//! hang under. The cache is shared with the parallel parse workers and
//! discarded when the sync run ends.

use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;

use crate::discovery::MailStoreLayout;
use crate::models::MailboxKind;

/// Resolved facts about one host mailbox.
#[derive(Debug, Clone)]
pub struct MailboxEntry {
    pub name: String,
    pub url: String,
    pub kind: MailboxKind,
    pub account_id: Option<String>,
    /// Filesystem directory of the mailbox, when derivable.
    pub fs_path: Option<PathBuf>,
}

/// Host-ROWID keyed mailbox cache, private to one sync run.
#[derive(Clone, Default)]
pub struct MailboxCache {
    map: Arc<DashMap<i64, MailboxEntry>>,
}

impl MailboxCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, rowid: i64, entry: MailboxEntry) {
        self.map.insert(rowid, entry);
    }

    pub fn get(&self, rowid: i64) -> Option<MailboxEntry> {
        self.map.get(&rowid).map(|entry| entry.value().clone())
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

/// Display name of a mailbox: the last URL path component, percent-decoded.
pub fn mailbox_name_from_url(url: &str) -> String {
    let trimmed = url.trim_end_matches('/');
    let last = trimmed.rsplit('/').next().unwrap_or(trimmed);
    percent_decode(last)
}

/// Account identifier: the authority component of a `mailbox://` URL.
pub fn account_from_url(url: &str) -> Option<String> {
    let rest = url.strip_prefix("mailbox://")?;
    let account = rest.split('/').next()?;
    if account.is_empty() {
        None
    } else {
        Some(percent_decode(account))
    }
}

/// Derive the mailbox's on-disk directory.
///
/// `mailbox://ACCOUNT/Folder/Sub` maps to
/// `{mail_root}/{version_dir}/ACCOUNT/Folder.mbox/Sub.mbox`; `file://` URLs
/// map straight to their decoded path.
pub fn mailbox_fs_path(layout: &MailStoreLayout, url: &str) -> Option<PathBuf> {
    if let Some(path) = url.strip_prefix("file://") {
        let decoded = percent_decode(path);
        return Some(PathBuf::from(decoded));
    }

    let rest = url.strip_prefix("mailbox://")?;
    let mut segments = rest.split('/').filter(|s| !s.is_empty());
    let account = segments.next()?;

    let mut path = layout.mail_root.join(&layout.version_dir);
    path.push(percent_decode(account));
    let mut had_folder = false;
    for segment in segments {
        path.push(format!("{}.mbox", percent_decode(segment)));
        had_folder = true;
    }
    if !had_folder {
        return None;
    }
    Some(path)
}

fn percent_decode(value: &str) -> String {
    urlencoding::decode(value)
        .map(|decoded| decoded.into_owned())
        .unwrap_or_else(|_| value.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    fn layout() -> MailStoreLayout {
        MailStoreLayout {
            envelope_path: Path::new("/mail/V10/MailData/Envelope Index").to_path_buf(),
            version_dir: "V10".to_string(),
            data_root: Path::new("/mail/V10/MailData").to_path_buf(),
            mail_root: Path::new("/mail").to_path_buf(),
        }
    }

    #[test]
    fn name_is_last_decoded_component() {
        assert_eq!(
            mailbox_name_from_url("mailbox://ACCT/Deleted%20Messages"),
            "Deleted Messages"
        );
        assert_eq!(mailbox_name_from_url("mailbox://ACCT/INBOX"), "INBOX");
    }

    #[test]
    fn account_extraction() {
        assert_eq!(
            account_from_url("mailbox://9A2B-UUID/INBOX").as_deref(),
            Some("9A2B-UUID")
        );
        assert_eq!(account_from_url("file:///Users/me/Mail"), None);
    }

    #[test]
    fn fs_path_rewrites_segments_to_mbox() {
        let path = mailbox_fs_path(&layout(), "mailbox://ACCT-UUID/Projects/2024").unwrap();
        assert_eq!(
            path,
            Path::new("/mail/V10/ACCT-UUID/Projects.mbox/2024.mbox")
        );
    }

    #[test]
    fn fs_path_decodes_percent_escapes() {
        let path = mailbox_fs_path(&layout(), "mailbox://ACCT/Sent%20Messages").unwrap();
        assert_eq!(path, Path::new("/mail/V10/ACCT/Sent Messages.mbox"));
    }

    #[test]
    fn fs_path_for_file_urls() {
        let path = mailbox_fs_path(&layout(), "file:///Users/me/Mailboxes/Old.mbox").unwrap();
        assert_eq!(path, Path::new("/Users/me/Mailboxes/Old.mbox"));
    }

    #[test]
    fn fs_path_requires_a_folder() {
        assert!(mailbox_fs_path(&layout(), "mailbox://ACCT").is_none());
        assert!(mailbox_fs_path(&layout(), "imap://weird").is_none());
    }
}
