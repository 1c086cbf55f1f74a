//! Thread-root selection and thread record maintenance.
//!
//! The root of a conversation is chosen deterministically: the first (oldest)
//! reference, else the In-Reply-To id, else the message's own Message-ID,
//! else the normalized subject. Messages with none of these get a unique
//! non-grouping key and never thread with anything else.

use std::collections::HashSet;

use chrono::{DateTime, Utc};

use super::cache::ThreadCache;
use super::headers::{self, ThreadingHeaders};
use super::subject::normalize_subject;
use crate::identity;
use crate::models::{MailMessage, MailThread};
use crate::store::{MirrorStore, StoreError};

/// The input a thread identifier is minted from.
#[derive(Debug, Clone, PartialEq)]
pub enum ThreadKey {
    /// A canonical root message-id.
    Root(String),
    /// Normalized-subject fallback.
    Subject(String),
    /// Unique key for messages that cannot group with anything.
    Unthreaded(String),
}

impl ThreadKey {
    /// Select the thread root for a message.
    pub fn for_message(headers: &ThreadingHeaders, subject: Option<&str>) -> Self {
        if let Some(root) = headers.references.first() {
            return ThreadKey::Root(root.clone());
        }
        if let Some(parent) = &headers.in_reply_to {
            return ThreadKey::Root(parent.clone());
        }
        if let Some(own) = &headers.message_id {
            return ThreadKey::Root(own.clone());
        }
        if let Some(subject) = subject {
            let normalized = normalize_subject(subject);
            if !normalized.is_empty() {
                return ThreadKey::Subject(normalized);
            }
        }
        ThreadKey::Unthreaded(identity::random_id())
    }

    /// The 32-hex thread identifier for this key.
    pub fn thread_id(&self) -> String {
        match self {
            ThreadKey::Root(id) => {
                identity::hash_id(&format!("thread:{}", headers::hash_key(id)))
            }
            ThreadKey::Subject(subject) => identity::hash_id(&format!("subj:{subject}")),
            ThreadKey::Unthreaded(token) => identity::hash_id(&format!("noid:{token}")),
        }
    }
}

/// Result of admitting one message.
#[derive(Debug, Clone)]
pub struct ThreadAssignment {
    pub thread_id: String,
    /// The thread record was created by this admission.
    pub created: bool,
    /// A new junction row was written (false on re-admission).
    pub linked: bool,
}

/// Admits messages into threads against the mirror store.
pub struct ThreadDetector {
    store: MirrorStore,
    cache: ThreadCache,
}

impl ThreadDetector {
    pub fn new(store: MirrorStore) -> Self {
        Self {
            store,
            cache: ThreadCache::new(),
        }
    }

    pub fn with_cache_capacity(store: MirrorStore, capacity: usize) -> Self {
        Self {
            store,
            cache: ThreadCache::with_capacity(capacity),
        }
    }

    pub fn cache(&self) -> &ThreadCache {
        &self.cache
    }

    /// Compute the thread for `message`, update the thread record, link the
    /// junction row, and stamp the message's `thread_id`.
    ///
    /// The cache entry is dropped before the mutating path and the freshly
    /// read record re-inserted once everything is committed.
    pub async fn assign_message(
        &self,
        message: &MailMessage,
    ) -> Result<ThreadAssignment, StoreError> {
        let headers = ThreadingHeaders::from_parts(
            message.message_id.as_deref(),
            message.in_reply_to.as_deref(),
            &message.references,
        );
        let key = ThreadKey::for_message(&headers, message.subject.as_deref());
        let thread_id = key.thread_id();

        self.cache.invalidate(&thread_id);

        let existing = self.store.get_thread(&thread_id).await?;
        let created = existing.is_none();
        let message_date = message.date_received.or(message.date_sent);

        // The thread row must exist before the junction row can point at it.
        let seed = match existing {
            Some(thread) => merge_thread(thread, message, message_date),
            None => MailThread {
                id: thread_id.clone(),
                subject: message.subject.clone(),
                participant_count: 1,
                message_count: 1,
                first_message_date: message_date,
                last_message_date: message_date,
                created_at: None,
                updated_at: None,
            },
        };
        self.store.upsert_thread(&seed).await?;

        let linked = self
            .store
            .add_message_to_thread(&thread_id, &message.id)
            .await?;
        self.store.set_message_thread(&message.id, &thread_id).await?;

        // Counts derive from what is actually linked, which keeps
        // re-admissions idempotent.
        let message_count = self.store.get_message_count_in_thread(&thread_id).await?;
        let participant_count = self.store.count_thread_participants(&thread_id).await?;
        let mut thread = seed;
        thread.message_count = message_count;
        thread.participant_count = participant_count;
        self.store.upsert_thread(&thread).await?;

        if let Some(fresh) = self.store.get_thread(&thread_id).await? {
            self.cache.put(fresh);
        }

        Ok(ThreadAssignment {
            thread_id,
            created,
            linked,
        })
    }

    /// Cached read of a thread record.
    pub async fn get_thread(&self, thread_id: &str) -> Result<Option<MailThread>, StoreError> {
        if let Some(thread) = self.cache.get(thread_id) {
            return Ok(Some(thread));
        }
        let thread = self.store.get_thread(thread_id).await?;
        if let Some(thread) = &thread {
            self.cache.put(thread.clone());
        }
        Ok(thread)
    }

    /// Recompute `thread_position`/`thread_total` for the given threads,
    /// typically once per sync batch.
    pub async fn finalize_positions(
        &self,
        thread_ids: &HashSet<String>,
    ) -> Result<(), StoreError> {
        for thread_id in thread_ids {
            self.store.recompute_thread_positions(thread_id).await?;
        }
        Ok(())
    }

    /// Bulk mirror operations invalidate everything cached.
    pub fn invalidate_cache(&self) {
        self.cache.invalidate_all();
    }
}

/// Merge a message into an existing thread record: subject stays sticky,
/// dates widen nil-safely.
fn merge_thread(
    mut thread: MailThread,
    message: &MailMessage,
    message_date: Option<DateTime<Utc>>,
) -> MailThread {
    if thread.subject.is_none() {
        thread.subject = message.subject.clone();
    }
    thread.first_message_date = min_date(thread.first_message_date, message_date);
    thread.last_message_date = max_date(thread.last_message_date, message_date);
    thread
}

fn min_date(a: Option<DateTime<Utc>>, b: Option<DateTime<Utc>>) -> Option<DateTime<Utc>> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (value, None) | (None, value) => value,
    }
}

fn max_date(a: Option<DateTime<Utc>>, b: Option<DateTime<Utc>>) -> Option<DateTime<Utc>> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.max(b)),
        (value, None) | (None, value) => value,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::hash_id;

    fn headers(
        message_id: Option<&str>,
        in_reply_to: Option<&str>,
        references: &[&str],
    ) -> ThreadingHeaders {
        let references: Vec<String> = references.iter().map(|s| s.to_string()).collect();
        ThreadingHeaders::from_parts(message_id, in_reply_to, &references)
    }

    #[test]
    fn root_prefers_first_reference() {
        let key = ThreadKey::for_message(
            &headers(Some("<m>"), Some("<r2>"), &["<r1>", "<r2>"]),
            Some("Re: hi"),
        );
        assert_eq!(key, ThreadKey::Root("<r1>".to_string()));
        assert_eq!(key.thread_id(), hash_id("thread:r1"));
    }

    #[test]
    fn root_falls_back_to_in_reply_to_then_own_id() {
        let key = ThreadKey::for_message(&headers(Some("<m>"), Some("<p>"), &[]), None);
        assert_eq!(key, ThreadKey::Root("<p>".to_string()));

        let key = ThreadKey::for_message(&headers(Some("<m>"), None, &[]), None);
        assert_eq!(key, ThreadKey::Root("<m>".to_string()));
        assert_eq!(key.thread_id(), hash_id("thread:m"));
    }

    #[test]
    fn subject_fallback_normalizes() {
        let key = ThreadKey::for_message(&headers(None, None, &[]), Some("Re: Fwd: Hello World"));
        assert_eq!(key, ThreadKey::Subject("hello world".to_string()));
        assert_eq!(key.thread_id(), hash_id("subj:hello world"));
    }

    #[test]
    fn unthreadable_messages_get_unique_keys() {
        let a = ThreadKey::for_message(&headers(None, None, &[]), None);
        let b = ThreadKey::for_message(&headers(None, None, &[]), None);
        assert_ne!(a.thread_id(), b.thread_id());
    }

    #[test]
    fn date_merge_is_nil_safe() {
        let earlier = Utc::now() - chrono::Duration::hours(2);
        let later = Utc::now();
        assert_eq!(min_date(Some(later), Some(earlier)), Some(earlier));
        assert_eq!(max_date(Some(later), Some(earlier)), Some(later));
        assert_eq!(min_date(None, Some(later)), Some(later));
        assert_eq!(max_date(Some(earlier), None), Some(earlier));
        assert_eq!(min_date(None, None), None);
    }
}
