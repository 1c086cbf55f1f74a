//! Forward-sync integration tests against a fabricated host mail store:
//! an envelope database plus on-disk message files in the partitioned
//! layout.

use std::path::{Path, PathBuf};

use chrono::Utc;
use mailmirror::discovery;
use mailmirror::models::MailboxStatus;
use mailmirror::store::MirrorStore;
use mailmirror::sync::{SyncEngine, SyncOptions};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use tempfile::TempDir;

const ACCOUNT: &str = "11111111-2222-4333-8444-555555555555";
const MAILBOX_UUID: &str = "99999999-8888-4777-A666-555555555544";

struct HostFixture {
    root: TempDir,
    envelope: SqlitePool,
    inbox_messages_dir: PathBuf,
}

impl HostFixture {
    fn mail_root(&self) -> &Path {
        self.root.path()
    }

    async fn exec(&self, sql: &str) {
        sqlx::query(sql).execute(&self.envelope).await.expect(sql);
    }
}

async fn setup_host() -> HostFixture {
    let root = TempDir::new().unwrap();
    let data = root.path().join("V10").join("MailData");
    std::fs::create_dir_all(&data).unwrap();

    let envelope = SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(
            SqliteConnectOptions::new()
                .filename(data.join("Envelope Index"))
                .create_if_missing(true),
        )
        .await
        .unwrap();

    for sql in [
        "CREATE TABLE messages (
            subject INTEGER, sender INTEGER, date_received INTEGER,
            date_sent INTEGER, message_id TEXT, mailbox INTEGER,
            read INTEGER NOT NULL DEFAULT 0, flagged INTEGER NOT NULL DEFAULT 0
        )",
        "CREATE TABLE subjects (subject TEXT)",
        "CREATE TABLE addresses (address TEXT, comment TEXT)",
        "CREATE TABLE mailboxes (url TEXT)",
    ] {
        sqlx::query(sql).execute(&envelope).await.unwrap();
    }

    sqlx::query("INSERT INTO mailboxes (ROWID, url) VALUES (1, ?1)")
        .bind(format!("mailbox://{ACCOUNT}/INBOX"))
        .execute(&envelope)
        .await
        .unwrap();
    sqlx::query("INSERT INTO mailboxes (ROWID, url) VALUES (2, ?1)")
        .bind(format!("mailbox://{ACCOUNT}/Archive"))
        .execute(&envelope)
        .await
        .unwrap();

    // Partitioned message-file layout under the inbox mailbox directory.
    let inbox_messages_dir = root
        .path()
        .join("V10")
        .join(ACCOUNT)
        .join("INBOX.mbox")
        .join(MAILBOX_UUID)
        .join("Data")
        .join("Messages");
    std::fs::create_dir_all(&inbox_messages_dir).unwrap();

    HostFixture {
        root,
        envelope,
        inbox_messages_dir,
    }
}

#[allow(clippy::too_many_arguments)]
async fn add_host_message(
    fixture: &HostFixture,
    rowid: i64,
    subject: &str,
    sender_email: &str,
    sender_name: &str,
    received_ts: i64,
    message_id: Option<&str>,
    rfc822: Option<&str>,
) {
    sqlx::query("INSERT INTO subjects (ROWID, subject) VALUES (?1, ?2)")
        .bind(rowid)
        .bind(subject)
        .execute(&fixture.envelope)
        .await
        .unwrap();
    sqlx::query("INSERT INTO addresses (ROWID, address, comment) VALUES (?1, ?2, ?3)")
        .bind(rowid)
        .bind(sender_email)
        .bind(sender_name)
        .execute(&fixture.envelope)
        .await
        .unwrap();
    sqlx::query(
        "INSERT INTO messages (ROWID, subject, sender, date_received, date_sent, message_id, mailbox, read, flagged)
         VALUES (?1, ?1, ?1, ?2, ?2, ?3, 1, 0, 0)",
    )
    .bind(rowid)
    .bind(received_ts)
    .bind(message_id)
    .execute(&fixture.envelope)
    .await
    .unwrap();

    if let Some(rfc822) = rfc822 {
        let mut bytes = format!("{}\n", rfc822.len()).into_bytes();
        bytes.extend_from_slice(rfc822.as_bytes());
        std::fs::write(
            fixture.inbox_messages_dir.join(format!("{rowid}.emlx")),
            bytes,
        )
        .unwrap();
    }
}

fn rfc822(message_id: &str, subject: &str, references: Option<&str>, body: &str) -> String {
    let mut out = String::new();
    out.push_str("From: Alice <alice@example.com>\r\n");
    out.push_str("To: Bob <bob@example.com>\r\n");
    out.push_str(&format!("Subject: {subject}\r\n"));
    out.push_str(&format!("Message-ID: {message_id}\r\n"));
    if let Some(references) = references {
        out.push_str(&format!("References: {references}\r\n"));
        out.push_str(&format!("In-Reply-To: {references}\r\n"));
    }
    out.push_str("Date: Mon, 15 Jan 2024 10:30:00 +0000\r\n");
    out.push_str("\r\n");
    out.push_str(body);
    out
}

async fn engine_for(fixture: &HostFixture, mirror_dir: &TempDir) -> (MirrorStore, SyncEngine) {
    let store = MirrorStore::open(&mirror_dir.path().join("mirror.db"))
        .await
        .unwrap();
    let layout = discovery::discover(fixture.mail_root(), None).unwrap();
    let engine = SyncEngine::with_options(
        store.clone(),
        layout,
        SyncOptions {
            worker_threads: 2,
            batch_size: 100,
        },
    );
    (store, engine)
}

#[tokio::test]
async fn full_sync_mirrors_inbox_and_threads_replies() {
    let fixture = setup_host().await;
    let now = Utc::now().timestamp();

    add_host_message(
        &fixture,
        1,
        "Project kickoff",
        "alice@example.com",
        "Alice",
        now - 300,
        Some("<root@example.com>"),
        Some(&rfc822(
            "<root@example.com>",
            "Project kickoff",
            None,
            "let us begin the zeppelin project",
        )),
    )
    .await;
    add_host_message(
        &fixture,
        2,
        "Re: Project kickoff",
        "bob@example.com",
        "Bob",
        now - 200,
        Some("<reply@example.com>"),
        Some(&rfc822(
            "<reply@example.com>",
            "Re: Project kickoff",
            Some("<root@example.com>"),
            "sounds good to me",
        )),
    )
    .await;
    add_host_message(
        &fixture,
        3,
        "Lunch",
        "carol@example.com",
        "Carol",
        now - 100,
        Some("<lunch@example.com>"),
        Some(&rfc822("<lunch@example.com>", "Lunch", None, "tacos?")),
    )
    .await;

    let mirror_dir = TempDir::new().unwrap();
    let (store, engine) = engine_for(&fixture, &mirror_dir).await;

    let result = engine.sync(false).await.unwrap();
    assert!(!result.is_incremental);
    assert_eq!(result.processed, 3);
    assert_eq!(result.added, 3);
    assert_eq!(result.deleted, 0);
    assert!(result.errors.is_empty(), "errors: {:?}", result.errors);
    assert_eq!(result.mailboxes, 2);
    assert_eq!(result.threads_created, 2);

    assert_eq!(store.get_message_count().await.unwrap(), 3);

    // The reply landed in the root's thread with positions assigned.
    let hits = store.search_messages("zeppelin", 10, 0).await.unwrap();
    assert_eq!(hits.len(), 1);
    let root = &hits[0];
    let thread_id = root.thread_id.clone().expect("threaded");
    let members = store
        .get_messages_in_thread_via_junction(&thread_id)
        .await
        .unwrap();
    assert_eq!(members.len(), 2);
    assert_eq!(members[0].thread_position, Some(1));
    assert_eq!(members[1].thread_position, Some(2));
    assert_eq!(members[1].thread_total, Some(2));

    let thread = store.get_thread(&thread_id).await.unwrap().unwrap();
    assert_eq!(thread.message_count, 2);
    assert_eq!(thread.participant_count, 2);
    // Host order is newest first, so the reply seeds the thread and its
    // subject sticks.
    assert_eq!(thread.subject.as_deref(), Some("Re: Project kickoff"));

    // Bodies and recipients came from the message files.
    let full = store.get_message(&root.id).await.unwrap().unwrap();
    assert!(full.body_text.as_deref().unwrap().contains("zeppelin"));
    assert_eq!(full.recipients.len(), 1);
    assert_eq!(full.recipients[0].email, "bob@example.com");

    // Second run over an unchanged host adds nothing.
    let second = engine.sync(true).await.unwrap();
    assert_eq!(second.added, 0);
    assert_eq!(second.deleted, 0);
    assert_eq!(store.get_message_count().await.unwrap(), 3);
}

#[tokio::test]
async fn incremental_sync_recovers_missed_rows_and_applies_drift() {
    let fixture = setup_host().await;
    let now = Utc::now().timestamp();

    for rowid in 1..=3i64 {
        add_host_message(
            &fixture,
            rowid,
            &format!("Message {rowid}"),
            "alice@example.com",
            "Alice",
            now - 4000 - rowid,
            Some(&format!("<m{rowid}@example.com>")),
            Some(&rfc822(
                &format!("<m{rowid}@example.com>"),
                &format!("Message {rowid}"),
                None,
                "hello",
            )),
        )
        .await;
    }

    let mirror_dir = TempDir::new().unwrap();
    let (store, engine) = engine_for(&fixture, &mirror_dir).await;
    let first = engine.sync(false).await.unwrap();
    assert_eq!(first.added, 3);

    // Row 4 arrives normally (newer than last sync); row 5 is a late host
    // write whose receive date predates the last sync.
    add_host_message(
        &fixture,
        4,
        "Fresh arrival",
        "bob@example.com",
        "Bob",
        now + 3600,
        Some("<m4@example.com>"),
        Some(&rfc822("<m4@example.com>", "Fresh arrival", None, "new")),
    )
    .await;
    add_host_message(
        &fixture,
        5,
        "Late write",
        "carol@example.com",
        "Carol",
        now - 9000,
        Some("<m5@example.com>"),
        Some(&rfc822("<m5@example.com>", "Late write", None, "old")),
    )
    .await;

    // Read/flag drift on row 1, a move to Archive for row 2, and row 3
    // disappears from the host entirely.
    fixture
        .exec("UPDATE messages SET read = 1, flagged = 1 WHERE ROWID = 1")
        .await;
    fixture.exec("UPDATE messages SET mailbox = 2 WHERE ROWID = 2").await;
    fixture.exec("DELETE FROM messages WHERE ROWID = 3").await;

    let second = engine.sync(false).await.unwrap();
    assert!(second.is_incremental);

    // Missed-row reconciliation picked up the late write.
    let rowids: std::collections::HashSet<i64> =
        store.get_synced_rowids().await.unwrap().into_iter().collect();
    assert!(rowids.contains(&4));
    assert!(rowids.contains(&5));
    assert!(!rowids.contains(&3), "deleted host row must be soft-deleted");
    assert_eq!(second.deleted, 1);

    // Status drift was applied.
    let statuses = store.get_all_message_statuses().await.unwrap();
    let row1 = statuses
        .iter()
        .find(|s| s.apple_rowid == Some(1))
        .expect("row 1 mirrored");
    assert!(row1.is_read);
    assert!(row1.is_flagged);

    // The archive move was classified and recorded.
    let row2 = statuses
        .iter()
        .find(|s| s.apple_rowid == Some(2))
        .expect("row 2 mirrored");
    assert_eq!(row2.mailbox_status, MailboxStatus::Archived);
}

#[tokio::test]
async fn rows_without_message_files_mirror_envelope_metadata() {
    let fixture = setup_host().await;
    let now = Utc::now().timestamp();

    add_host_message(
        &fixture,
        7,
        "No file on disk",
        "dave@example.com",
        "Dave",
        now - 50,
        Some("<nofile@example.com>"),
        None,
    )
    .await;

    let mirror_dir = TempDir::new().unwrap();
    let (store, engine) = engine_for(&fixture, &mirror_dir).await;
    let result = engine.sync(false).await.unwrap();
    assert_eq!(result.added, 1);
    assert!(result.errors.is_empty());

    let statuses = store.get_all_message_statuses().await.unwrap();
    assert_eq!(statuses.len(), 1);
    let message = store.get_message(&statuses[0].id).await.unwrap().unwrap();
    assert_eq!(message.subject.as_deref(), Some("No file on disk"));
    assert!(message.body_text.is_none());
    assert!(message.file_path.is_none());
    assert_eq!(message.message_id.as_deref(), Some("<nofile@example.com>"));
}
