//! Forward synchronization: host envelope → mirror.
//!
//! A sync run opens the host index read-only, refreshes the mailbox table,
//! then either replays the whole inbox (full sync) or walks the incremental
//! pipeline: new messages, missed-message reconciliation, status changes,
//! mailbox moves, deletions. Message files are parsed on a bounded worker
//! pool; all mirror writes go through a single batched writer.
//!
//! Parse and threading failures are collected into the result and never
//! abort the run. A failure in the driver records `sync_state = failed` and
//! leaves `last_sync_time` untouched so the next incremental run re-covers
//! the window.

pub mod mailboxes;
pub mod source;

use std::collections::{HashMap, HashSet};
use std::time::Instant;

use chrono::{DateTime, TimeZone, Utc};
use rayon::prelude::*;
use thiserror::Error;

use crate::discovery::{self, DiscoveryError, MailStoreLayout};
use crate::identity::{self, IdInputs};
use crate::models::{
    MailMessage, Mailbox, MailboxKind, MailboxStatus, Recipient, RecipientKind, SyncPhase,
    SyncResult,
};
use crate::parser;
use crate::store::{BatchOptions, MirrorStore, StoreError};
use crate::threading::{ThreadDetector, ThreadingHeaders};
use mailboxes::{account_from_url, mailbox_fs_path, mailbox_name_from_url, MailboxCache, MailboxEntry};
use source::{HostEnvelope, HostMessageRow};

/// Host rows are checked in batches of this size during the status, move,
/// and deletion phases.
const STATUS_BATCH: usize = 500;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Discovery(#[from] DiscoveryError),
    #[error("failed to open host envelope database: {0}")]
    SourceConnectionFailed(#[source] sqlx::Error),
    #[error("host envelope database is locked")]
    SourceDatabaseLocked,
    #[error("host query failed ({sql}): {source}")]
    QueryFailed {
        sql: String,
        #[source]
        source: sqlx::Error,
    },
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Tuning for a sync run.
#[derive(Debug, Clone)]
pub struct SyncOptions {
    /// Parse workers; defaults to the CPU count, floored at one.
    pub worker_threads: usize,
    /// Mirror write batch size.
    pub batch_size: usize,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            worker_threads: num_cpus::get().max(1),
            batch_size: 1000,
        }
    }
}

/// Drives forward synchronization against one mirror store.
pub struct SyncEngine {
    store: MirrorStore,
    layout: MailStoreLayout,
    detector: ThreadDetector,
    options: SyncOptions,
}

impl SyncEngine {
    pub fn new(store: MirrorStore, layout: MailStoreLayout) -> Self {
        Self::with_options(store, layout, SyncOptions::default())
    }

    pub fn with_options(store: MirrorStore, layout: MailStoreLayout, options: SyncOptions) -> Self {
        let detector = ThreadDetector::new(store.clone());
        Self {
            store,
            layout,
            detector,
            options,
        }
    }

    pub fn detector(&self) -> &ThreadDetector {
        &self.detector
    }

    /// Run one sync cycle. Full when `force_full` is set or the mirror has
    /// never synced; incremental otherwise.
    pub async fn sync(&self, force_full: bool) -> Result<SyncResult, SyncError> {
        let started = Instant::now();
        let last_sync = self.store.get_last_sync_time().await?;
        let incremental = !force_full && last_sync.is_some();

        self.store.record_sync_start(incremental).await?;
        log::info!(
            "starting {} sync",
            if incremental { "incremental" } else { "full" }
        );

        match self.run(incremental, last_sync).await {
            Ok(mut result) => {
                result.is_incremental = incremental;
                result.duration_seconds = started.elapsed().as_secs_f64();
                result.unchanged = result
                    .processed
                    .saturating_sub(result.added + result.updated);
                log::info!(
                    "sync {}: {} processed, {} added, {} updated, {} deleted, {} errors in {:.2}s",
                    SyncPhase::Complete.as_str(),
                    result.processed,
                    result.added,
                    result.updated,
                    result.deleted,
                    result.errors.len(),
                    result.duration_seconds
                );
                if let Err(err) = self.store.record_sync_success(&result).await {
                    log::warn!("failed to record sync success: {err}");
                }
                Ok(result)
            }
            Err(err) => {
                log::error!("sync failed: {err}");
                if let Err(record_err) = self.store.record_sync_failure(&err.to_string()).await {
                    log::error!("failed to record sync failure: {record_err}");
                }
                Err(err)
            }
        }
    }

    async fn run(
        &self,
        incremental: bool,
        last_sync: Option<DateTime<Utc>>,
    ) -> Result<SyncResult, SyncError> {
        let mut result = SyncResult::default();

        log::info!(
            "sync {}: envelope at {}",
            SyncPhase::Discovering.as_str(),
            self.layout.envelope_path.display()
        );
        let host = HostEnvelope::open(&self.layout.envelope_path).await?;

        log::info!("sync {}", SyncPhase::SyncingMailboxes.as_str());
        let cache = self.sync_mailboxes(&host, &mut result).await?;

        if incremental {
            self.incremental_sync(&host, &cache, last_sync, &mut result)
                .await?;
        } else {
            self.full_sync(&host, &cache, &mut result).await?;
        }

        self.store.refresh_mailbox_counts().await?;
        Ok(result)
    }

    /// Mailbox prelude: upsert every host mailbox and build the per-sync
    /// cache used by the parse workers.
    async fn sync_mailboxes(
        &self,
        host: &HostEnvelope,
        result: &mut SyncResult,
    ) -> Result<MailboxCache, SyncError> {
        let rows = host.fetch_mailboxes().await?;
        let cache = MailboxCache::new();

        for (rowid, url) in rows {
            let url = url.unwrap_or_default();
            let name = mailbox_name_from_url(&url);
            let entry = MailboxEntry {
                name: name.clone(),
                url: url.clone(),
                kind: MailboxKind::classify(&name, &url),
                account_id: account_from_url(&url),
                fs_path: mailbox_fs_path(&self.layout, &url),
            };

            self.store
                .upsert_mailbox(&Mailbox {
                    id: rowid,
                    account_id: entry.account_id.clone(),
                    name,
                    url: Some(url).filter(|u| !u.is_empty()),
                    parent_id: None,
                    message_count: 0,
                    unread_count: 0,
                    synced_at: Some(Utc::now()),
                })
                .await?;
            cache.insert(rowid, entry);
        }

        result.mailboxes = cache.len();
        Ok(cache)
    }

    async fn full_sync(
        &self,
        host: &HostEnvelope,
        cache: &MailboxCache,
        result: &mut SyncResult,
    ) -> Result<(), SyncError> {
        log::info!("sync {}", SyncPhase::SyncingMessages.as_str());
        let rows = host.fetch_inbox_messages(None).await?;
        result.processed += rows.len();
        self.ingest(&rows, cache, result, true).await
    }

    /// The incremental pipeline, phases in order: new messages, missed-row
    /// reconciliation, status changes, mailbox moves, deletions.
    async fn incremental_sync(
        &self,
        host: &HostEnvelope,
        cache: &MailboxCache,
        last_sync: Option<DateTime<Utc>>,
        result: &mut SyncResult,
    ) -> Result<(), SyncError> {
        let last_ts = last_sync.map(|dt| dt.timestamp()).unwrap_or(0);

        // Phase 1: rows the host received since the last sync.
        log::info!("sync {}: new messages", SyncPhase::SyncingMessages.as_str());
        let rows = host.fetch_inbox_messages(Some(last_ts)).await?;
        result.processed += rows.len();
        self.ingest(&rows, cache, result, false).await?;

        // Phase 2: rows the receive-date window missed. The host writer can
        // commit a row with an older date_received after we synced past it.
        let source_rowids = host.fetch_inbox_rowids().await?;
        let mirror_rowids: HashSet<i64> = self.store.get_synced_rowids().await?.into_iter().collect();
        let missed: Vec<i64> = source_rowids
            .difference(&mirror_rowids)
            .copied()
            .collect();
        if !missed.is_empty() {
            log::info!("recovering {} missed messages", missed.len());
            for chunk in missed.chunks(STATUS_BATCH) {
                let rows = host.fetch_messages_by_rowids(chunk).await?;
                result.processed += rows.len();
                self.ingest(&rows, cache, result, false).await?;
            }
        }

        // Phase 3: read/flagged drift.
        let statuses = self.store.get_all_message_statuses().await?;
        let by_rowid: HashMap<i64, &crate::models::MessageStatus> = statuses
            .iter()
            .filter_map(|status| status.apple_rowid.map(|rowid| (rowid, status)))
            .collect();
        let tracked_rowids: Vec<i64> = by_rowid.keys().copied().collect();

        let mut status_changes = 0usize;
        for chunk in tracked_rowids.chunks(STATUS_BATCH) {
            for (rowid, is_read, is_flagged) in host.fetch_flags(chunk).await? {
                let Some(status) = by_rowid.get(&rowid) else {
                    continue;
                };
                if status.is_read != is_read || status.is_flagged != is_flagged {
                    self.store
                        .update_message_status(&status.id, is_read, is_flagged)
                        .await?;
                    status_changes += 1;
                }
            }
        }
        if status_changes > 0 {
            log::info!("updated {status_changes} message statuses");
            result.updated += status_changes;
        }

        // Phase 4: mailbox moves observed on the host.
        let mut moves = 0usize;
        for chunk in tracked_rowids.chunks(STATUS_BATCH) {
            for (rowid, mailbox_rowid) in host.fetch_mailbox_assignments(chunk).await? {
                let Some(status) = by_rowid.get(&rowid) else {
                    continue;
                };
                let Some(entry) = cache.get(mailbox_rowid) else {
                    continue;
                };
                let mapped = match entry.kind {
                    MailboxKind::Inbox => MailboxStatus::Inbox,
                    MailboxKind::Archive => MailboxStatus::Archived,
                    MailboxKind::Trash => MailboxStatus::Deleted,
                    // Sent, drafts, and junk residents are not tracked moves.
                    _ => continue,
                };
                if status.mailbox_status != mapped {
                    self.store.update_mailbox_status(&status.id, mapped).await?;
                    moves += 1;
                }
            }
        }
        if moves > 0 {
            log::info!("applied {moves} mailbox moves");
            result.updated += moves;
        }

        // Phase 5: rows gone from the host become soft deletes.
        let mut deleted = 0usize;
        for chunk in tracked_rowids.chunks(STATUS_BATCH) {
            let existing = host.existing_rowids(chunk).await?;
            let absent: Vec<i64> = chunk
                .iter()
                .filter(|rowid| !existing.contains(rowid))
                .copied()
                .collect();
            deleted += self.store.soft_delete_by_rowids(&absent).await?;
        }
        if deleted > 0 {
            log::info!("soft-deleted {deleted} messages missing from host");
            result.deleted += deleted;
        }

        Ok(())
    }

    /// Parse, batch-upsert, and thread one set of host rows.
    async fn ingest(
        &self,
        rows: &[HostMessageRow],
        cache: &MailboxCache,
        result: &mut SyncResult,
        bulk: bool,
    ) -> Result<(), SyncError> {
        if rows.is_empty() {
            return Ok(());
        }

        let messages = self.assemble_parallel(rows, cache, &mut result.errors);

        log::info!(
            "sync {}: writing {} messages",
            SyncPhase::Indexing.as_str(),
            messages.len()
        );
        let batch = self
            .store
            .batch_upsert_messages(
                &messages,
                &BatchOptions {
                    batch_size: self.options.batch_size,
                    disable_fts_triggers: bulk,
                },
            )
            .await?;
        result.added += batch.inserted;
        result.updated += batch.updated;
        result.errors.extend(batch.errors);
        if bulk {
            self.detector.invalidate_cache();
        }

        log::info!("sync {}", SyncPhase::Threading.as_str());
        let mut touched = HashSet::new();
        for message in &messages {
            match self.detector.assign_message(message).await {
                Ok(assignment) => {
                    if assignment.created {
                        result.threads_created += 1;
                    } else if assignment.linked {
                        result.threads_updated += 1;
                    }
                    touched.insert(assignment.thread_id);
                }
                Err(err) => {
                    result
                        .errors
                        .push(format!("threading failed for {}: {err}", message.id));
                }
            }
        }
        if let Err(err) = self.detector.finalize_positions(&touched).await {
            result
                .errors
                .push(format!("thread position update failed: {err}"));
        }

        Ok(())
    }

    /// Read and parse message files on the worker pool. Assembly failures
    /// skip the row and surface in `errors`.
    fn assemble_parallel(
        &self,
        rows: &[HostMessageRow],
        cache: &MailboxCache,
        errors: &mut Vec<String>,
    ) -> Vec<MailMessage> {
        let workers = self.options.worker_threads.max(1);
        log::debug!("parsing {} message files with {} workers", rows.len(), workers);

        let outcomes: Vec<Result<MailMessage, String>> =
            match rayon::ThreadPoolBuilder::new().num_threads(workers).build() {
                Ok(pool) => pool.install(|| {
                    rows.par_iter()
                        .map(|row| self.assemble_one(row, cache))
                        .collect()
                }),
                Err(err) => {
                    log::warn!("worker pool unavailable, parsing serially: {err}");
                    rows.iter().map(|row| self.assemble_one(row, cache)).collect()
                }
            };

        let mut messages = Vec::with_capacity(outcomes.len());
        for outcome in outcomes {
            match outcome {
                Ok(message) => messages.push(message),
                Err(error) => {
                    log::warn!("{error}");
                    errors.push(error);
                }
            }
        }
        messages
    }

    /// Convert one host row (plus its on-disk message file, when present)
    /// into a mirror message.
    fn assemble_one(
        &self,
        row: &HostMessageRow,
        cache: &MailboxCache,
    ) -> Result<MailMessage, String> {
        let mailbox = row.mailbox_id.and_then(|id| cache.get(id));
        let file_path = mailbox
            .as_ref()
            .and_then(|entry| entry.fs_path.as_deref())
            .and_then(|dir| discovery::message_file_path(row.rowid, dir));

        // A resolvable file that fails to parse skips the message; a message
        // with no file on disk still mirrors its envelope metadata.
        let parsed = match &file_path {
            Some(path) => Some(
                parser::parse_message_file(path)
                    .map_err(|err| format!("parse failed for row {}: {err}", row.rowid))?,
            ),
            None => None,
        };

        let subject = parsed
            .as_ref()
            .and_then(|p| p.subject.clone())
            .or_else(|| row.subject.clone());
        let sender_email = row
            .sender_email
            .clone()
            .or_else(|| parsed.as_ref().and_then(|p| p.from.as_ref().map(|a| a.email.clone())));
        let sender_name = row
            .sender_name
            .clone()
            .or_else(|| parsed.as_ref().and_then(|p| p.from.as_ref().and_then(|a| a.name.clone())));
        let date_received = row
            .date_received
            .and_then(|ts| Utc.timestamp_opt(ts, 0).single())
            .or_else(|| parsed.as_ref().and_then(|p| p.date));
        let date_sent = row
            .date_sent
            .and_then(|ts| Utc.timestamp_opt(ts, 0).single())
            .or_else(|| parsed.as_ref().and_then(|p| p.date));

        let raw_message_id = row
            .message_id
            .clone()
            .or_else(|| parsed.as_ref().and_then(|p| p.message_id.clone()));

        let id = identity::generate_message_id(&IdInputs {
            message_id: raw_message_id.as_deref(),
            subject: subject.as_deref(),
            sender_email: sender_email.as_deref(),
            date: date_received,
            rowid: Some(row.rowid),
        });

        let threading = ThreadingHeaders::from_parts(
            raw_message_id.as_deref(),
            parsed.as_ref().and_then(|p| p.in_reply_to.as_deref()),
            parsed
                .as_ref()
                .map(|p| p.references.as_slice())
                .unwrap_or(&[]),
        );

        let mut message = MailMessage::new(id);
        message.apple_rowid = Some(row.rowid);
        message.message_id = threading.message_id.clone().or(raw_message_id);
        message.mailbox_id = row.mailbox_id;
        message.mailbox_name = mailbox.as_ref().map(|entry| entry.name.clone());
        message.account_id = mailbox.as_ref().and_then(|entry| entry.account_id.clone());
        message.subject = subject;
        message.sender_name = sender_name;
        message.sender_email = sender_email;
        message.date_sent = date_sent;
        message.date_received = date_received;
        message.is_read = row.is_read;
        message.is_flagged = row.is_flagged;
        message.mailbox_status = MailboxStatus::Inbox;
        message.last_known_mailbox_id = row.mailbox_id;
        message.in_reply_to = threading.in_reply_to;
        message.references = threading.references;
        message.file_path = file_path.map(|p| p.to_string_lossy().into_owned());
        message.synced_at = Some(Utc::now());

        if let Some(parsed) = parsed {
            message.body_text = parsed.body_text;
            message.body_html = parsed.body_html;
            message.has_attachments = !parsed.attachments.is_empty();
            message.attachments = parsed.attachments;
            message.recipients = recipients_of(&parsed.to, &parsed.cc, &parsed.bcc);
        }

        Ok(message)
    }
}

fn recipients_of(
    to: &[crate::models::MailAddress],
    cc: &[crate::models::MailAddress],
    bcc: &[crate::models::MailAddress],
) -> Vec<Recipient> {
    let mut recipients = Vec::with_capacity(to.len() + cc.len() + bcc.len());
    for (kind, addresses) in [
        (RecipientKind::To, to),
        (RecipientKind::Cc, cc),
        (RecipientKind::Bcc, bcc),
    ] {
        for address in addresses {
            recipients.push(Recipient {
                kind,
                name: address.name.clone(),
                email: address.email.clone(),
            });
        }
    }
    recipients
}
