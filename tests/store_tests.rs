//! Mirror store integration tests: migrations, upserts, FTS coherence,
//! structured search, junction bookkeeping.

use chrono::{TimeZone, Utc};
use mailmirror::models::{MailMessage, MailThread, MailboxStatus, Recipient, RecipientKind};
use mailmirror::store::{BatchOptions, MirrorStore, SearchFilter, ThreadQuery, ThreadSort};
use tempfile::TempDir;

async fn open_store(dir: &TempDir) -> MirrorStore {
    MirrorStore::open(&dir.path().join("mirror.db"))
        .await
        .expect("mirror opens")
}

fn message(id: &str, subject: &str, sender: &str, received_ts: i64) -> MailMessage {
    let mut m = MailMessage::new(id);
    m.subject = Some(subject.to_string());
    m.sender_email = Some(sender.to_string());
    m.sender_name = Some(sender.split('@').next().unwrap_or(sender).to_string());
    m.date_received = Utc.timestamp_opt(received_ts, 0).single();
    m.body_text = Some(format!("body of {subject}"));
    m
}

#[tokio::test]
async fn migrations_reach_current_version_and_reopen_cleanly() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir).await;
    assert_eq!(store.schema_version().await.unwrap(), 7);
    drop(store);

    // Second open re-runs the migration scan as a no-op.
    let store = open_store(&dir).await;
    assert_eq!(store.schema_version().await.unwrap(), 7);
}

#[tokio::test]
async fn upsert_inserts_then_updates() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir).await;

    let mut m = message("a".repeat(32).as_str(), "First", "alice@example.com", 1_700_000_000);
    m.recipients.push(Recipient {
        kind: RecipientKind::To,
        name: None,
        email: "bob@example.com".to_string(),
    });
    assert!(store.upsert_message(&m).await.unwrap());

    m.subject = Some("First (edited)".to_string());
    m.is_read = true;
    assert!(!store.upsert_message(&m).await.unwrap());

    let loaded = store.get_message(&m.id).await.unwrap().unwrap();
    assert_eq!(loaded.subject.as_deref(), Some("First (edited)"));
    assert!(loaded.is_read);
    assert_eq!(loaded.recipients.len(), 1);
    assert_eq!(loaded.recipients[0].email, "bob@example.com");
    assert_eq!(store.get_message_count().await.unwrap(), 1);
}

#[tokio::test]
async fn bulk_upsert_rebuilds_fts_coherently() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir).await;

    let messages: Vec<MailMessage> = (0..25)
        .map(|i| {
            let id = format!("{i:032x}");
            let mut m = message(&id, &format!("Progress update {i}"), "carol@example.com", 1_700_000_000 + i);
            m.body_text = Some(format!("weekly meteorite report number {i}"));
            m
        })
        .collect();

    let result = store
        .batch_upsert_messages(
            &messages,
            &BatchOptions {
                batch_size: 10,
                disable_fts_triggers: true,
            },
        )
        .await
        .unwrap();
    assert_eq!(result.inserted, 25);
    assert_eq!(result.failed, 0);

    // Triggers were disabled during the bulk write; the rebuild must make
    // every row findable again.
    let hits = store.search_messages("meteorite", 50, 0).await.unwrap();
    assert_eq!(hits.len(), 25);

    // Triggers are restored afterwards: a plain upsert is indexed live.
    let mut extra = message(&"f".repeat(32), "Solo", "dave@example.com", 1_700_100_000);
    extra.body_text = Some("a singular xylophone anecdote".to_string());
    store.upsert_message(&extra).await.unwrap();
    let hits = store.search_messages("xylophone", 10, 0).await.unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].id, extra.id);
}

#[tokio::test]
async fn structured_search_filters_by_sender_and_read_state() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir).await;

    let jan_15 = Utc.with_ymd_and_hms(2024, 1, 15, 9, 0, 0).unwrap().timestamp();
    let jan_20 = Utc.with_ymd_and_hms(2024, 1, 20, 9, 0, 0).unwrap().timestamp();

    let unread = message(&"1".repeat(32), "Quarterly Report", "alice@x", jan_15);
    let mut read = message(&"2".repeat(32), "RE: Quarterly", "bob@y", jan_20);
    read.is_read = true;

    store.upsert_message(&unread).await.unwrap();
    store.upsert_message(&read).await.unwrap();

    let filter = SearchFilter::parse("from:alice is:unread");
    let hits = store
        .search_messages_with_filters(&filter, 10, 0)
        .await
        .unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].id, unread.id);

    // Date window filters.
    let filter = SearchFilter::parse("after:2024-01-16");
    let hits = store
        .search_messages_with_filters(&filter, 10, 0)
        .await
        .unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].id, read.id);

    let filter = SearchFilter::parse("date:2024-01-15");
    let hits = store
        .search_messages_with_filters(&filter, 10, 0)
        .await
        .unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].id, unread.id);
}

#[tokio::test]
async fn soft_deleted_rows_are_invisible_outside_admin_paths() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir).await;

    let mut m = message(&"3".repeat(32), "Ghost", "eve@example.com", 1_700_000_000);
    m.apple_rowid = Some(99);
    store.upsert_message(&m).await.unwrap();
    assert_eq!(store.soft_delete_by_rowids(&[99]).await.unwrap(), 1);

    assert!(store.get_message(&m.id).await.unwrap().is_none());
    assert!(store.search_messages("Ghost", 10, 0).await.unwrap().is_empty());
    assert_eq!(store.get_message_count().await.unwrap(), 0);
    assert!(store.get_synced_rowids().await.unwrap().is_empty());

    // The admin accessor still sees the row.
    let admin = store.get_message_unfiltered(&m.id).await.unwrap().unwrap();
    assert!(admin.is_deleted);
}

#[tokio::test]
async fn junction_ops_and_participant_counts() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir).await;

    let a = message(&"a".repeat(32), "Topic", "alice@example.com", 1_700_000_000);
    let b = message(&"b".repeat(32), "Re: Topic", "bob@example.com", 1_700_000_100);
    store.upsert_message(&a).await.unwrap();
    store.upsert_message(&b).await.unwrap();

    let thread = MailThread {
        id: "c".repeat(32),
        subject: Some("Topic".to_string()),
        participant_count: 1,
        message_count: 0,
        first_message_date: a.date_received,
        last_message_date: b.date_received,
        created_at: None,
        updated_at: None,
    };
    store.upsert_thread(&thread).await.unwrap();

    assert!(store.add_message_to_thread(&thread.id, &a.id).await.unwrap());
    assert!(store.add_message_to_thread(&thread.id, &b.id).await.unwrap());
    // Idempotent re-link.
    assert!(!store.add_message_to_thread(&thread.id, &a.id).await.unwrap());

    assert_eq!(store.get_message_count_in_thread(&thread.id).await.unwrap(), 2);
    assert!(store.is_message_in_thread(&thread.id, &a.id).await.unwrap());
    assert_eq!(
        store.get_message_ids_in_thread(&thread.id).await.unwrap().len(),
        2
    );
    assert_eq!(
        store.get_thread_ids_for_message(&a.id).await.unwrap(),
        vec![thread.id.clone()]
    );
    assert_eq!(store.count_thread_participants(&thread.id).await.unwrap(), 2);

    let members = store
        .get_messages_in_thread_via_junction(&thread.id)
        .await
        .unwrap();
    assert_eq!(members.len(), 2);
    assert_eq!(members[0].id, a.id); // date ascending

    // Sticky subject: a later upsert with a different subject keeps the
    // original.
    let mut renamed = thread.clone();
    renamed.subject = Some("Re: Topic".to_string());
    store.upsert_thread(&renamed).await.unwrap();
    let reloaded = store.get_thread(&thread.id).await.unwrap().unwrap();
    assert_eq!(reloaded.subject.as_deref(), Some("Topic"));

    assert!(store.remove_message_from_thread(&thread.id, &b.id).await.unwrap());
    assert_eq!(store.get_message_count_in_thread(&thread.id).await.unwrap(), 1);
}

#[tokio::test]
async fn thread_positions_use_case_statement_for_large_threads() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir).await;

    let thread_id = "d".repeat(32);
    let thread = MailThread {
        id: thread_id.clone(),
        subject: Some("Long one".to_string()),
        participant_count: 1,
        message_count: 0,
        first_message_date: None,
        last_message_date: None,
        created_at: None,
        updated_at: None,
    };
    store.upsert_thread(&thread).await.unwrap();

    // 12 members exercise the single-statement CASE path.
    for i in 0..12 {
        let id = format!("{i:02}{}", "e".repeat(30));
        let m = message(&id, &format!("part {i}"), "alice@example.com", 1_700_000_000 + i);
        store.upsert_message(&m).await.unwrap();
        store.add_message_to_thread(&thread_id, &id).await.unwrap();
    }
    store.recompute_thread_positions(&thread_id).await.unwrap();

    let members = store
        .get_messages_in_thread_via_junction(&thread_id)
        .await
        .unwrap();
    assert_eq!(members.len(), 12);
    for (index, member) in members.iter().enumerate() {
        assert_eq!(member.thread_position, Some(index as i64 + 1));
        assert_eq!(member.thread_total, Some(12));
    }
}

#[tokio::test]
async fn thread_listing_sorts_and_filters_by_participant() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir).await;

    let mut alpha = message(&"1".repeat(32), "Alpha", "alice@example.com", 1_700_000_000);
    alpha.thread_id = Some("a".repeat(32));
    let mut beta = message(&"2".repeat(32), "Beta", "bob@example.com", 1_700_000_500);
    beta.thread_id = Some("b".repeat(32));
    store.upsert_message(&alpha).await.unwrap();
    store.upsert_message(&beta).await.unwrap();

    for (id, subject, count, ts) in [
        ("a".repeat(32), "Alpha", 3, 1_700_000_000),
        ("b".repeat(32), "Beta", 1, 1_700_000_500),
    ] {
        store
            .upsert_thread(&MailThread {
                id,
                subject: Some(subject.to_string()),
                participant_count: 1,
                message_count: count,
                first_message_date: Utc.timestamp_opt(ts, 0).single(),
                last_message_date: Utc.timestamp_opt(ts, 0).single(),
                created_at: None,
                updated_at: None,
            })
            .await
            .unwrap();
    }

    let by_date = store
        .get_threads(&ThreadQuery {
            limit: 10,
            offset: 0,
            sort: ThreadSort::DateDesc,
            participant: None,
        })
        .await
        .unwrap();
    assert_eq!(by_date[0].subject.as_deref(), Some("Beta"));

    let by_count = store
        .get_threads(&ThreadQuery {
            limit: 10,
            offset: 0,
            sort: ThreadSort::MessageCountDesc,
            participant: None,
        })
        .await
        .unwrap();
    assert_eq!(by_count[0].subject.as_deref(), Some("Alpha"));

    let only_bob = store
        .get_threads(&ThreadQuery {
            limit: 10,
            offset: 0,
            sort: ThreadSort::DateDesc,
            participant: Some("bob@example.com".to_string()),
        })
        .await
        .unwrap();
    assert_eq!(only_bob.len(), 1);
    assert_eq!(only_bob[0].subject.as_deref(), Some("Beta"));
    assert_eq!(store.get_thread_count(Some("bob@example.com")).await.unwrap(), 1);
    assert_eq!(store.get_thread_count(None).await.unwrap(), 2);
}

#[tokio::test]
async fn sync_status_contract_round_trips() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir).await;

    assert!(store.get_last_sync_time().await.unwrap().is_none());
    store.record_sync_start(false).await.unwrap();

    let mut result = mailmirror::models::SyncResult::default();
    result.added = 5;
    result.updated = 2;
    result.deleted = 1;
    result.duration_seconds = 1.25;
    store.record_sync_success(&result).await.unwrap();

    let summary = store.get_sync_status_summary().await.unwrap();
    assert_eq!(summary.state, mailmirror::models::SyncState::Success);
    assert_eq!(summary.messages_added, 5);
    assert_eq!(summary.messages_updated, 2);
    assert_eq!(summary.messages_deleted, 1);
    assert!(summary.last_sync_time.is_some());
    assert!(summary.last_error.is_none());

    let before_failure = store.get_last_sync_time().await.unwrap();
    store.record_sync_failure("host went away").await.unwrap();
    let summary = store.get_sync_status_summary().await.unwrap();
    assert_eq!(summary.state, mailmirror::models::SyncState::Failed);
    assert_eq!(summary.last_error.as_deref(), Some("host went away"));
    // A failure preserves the last successful sync time.
    assert_eq!(store.get_last_sync_time().await.unwrap(), before_failure);
}

#[tokio::test]
async fn messages_by_status_and_pending_queues() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir).await;

    let mut inbox = message(&"5".repeat(32), "Stay", "alice@example.com", 1_700_000_000);
    inbox.apple_rowid = Some(1);
    let mut archived = message(&"6".repeat(32), "Moved", "bob@example.com", 1_700_000_100);
    archived.apple_rowid = Some(2);
    archived.mailbox_status = MailboxStatus::Archived;
    store.upsert_message(&inbox).await.unwrap();
    store.upsert_message(&archived).await.unwrap();

    let tracked = store.get_tracked_inbox_messages().await.unwrap();
    assert_eq!(tracked.len(), 1);
    assert_eq!(tracked[0].id, inbox.id);

    let archived_rows = store
        .get_messages_by_status(MailboxStatus::Archived)
        .await
        .unwrap();
    assert_eq!(archived_rows.len(), 1);

    store
        .set_pending_sync_action(&inbox.id, mailmirror::models::PendingAction::Archive)
        .await
        .unwrap();
    let pending = store.get_messages_with_pending_actions().await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].id, inbox.id);

    store.clear_pending_sync_action(&inbox.id).await.unwrap();
    assert!(store
        .get_messages_with_pending_actions()
        .await
        .unwrap()
        .is_empty());
}
