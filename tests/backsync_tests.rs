//! Backward-sync integration tests: optimistic apply, rollback on bridge
//! failure, and retry-queue convergence.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use mailmirror::backsync::{BackSyncError, BackwardSync};
use mailmirror::bridge::{BridgeError, ScriptBridge};
use mailmirror::models::{MailMessage, MailboxStatus, PendingAction};
use mailmirror::store::MirrorStore;
use tempfile::TempDir;

/// Bridge double that records scripts and fails on demand.
#[derive(Default)]
struct MockBridge {
    should_fail: AtomicBool,
    scripts: Mutex<Vec<String>>,
}

impl MockBridge {
    fn fail(&self, fail: bool) {
        self.should_fail.store(fail, Ordering::SeqCst);
    }

    fn script_count(&self) -> usize {
        self.scripts.lock().unwrap().len()
    }

    fn last_script(&self) -> Option<String> {
        self.scripts.lock().unwrap().last().cloned()
    }
}

impl ScriptBridge for &MockBridge {
    async fn execute_mail_script(&self, source: &str) -> Result<Option<String>, BridgeError> {
        self.scripts.lock().unwrap().push(source.to_string());
        if self.should_fail.load(Ordering::SeqCst) {
            Err(BridgeError::MessageNotFound { id: None })
        } else {
            Ok(None)
        }
    }
}

async fn store_with_message(dir: &TempDir, id: &str, message_id: Option<&str>) -> MirrorStore {
    let store = MirrorStore::open(&dir.path().join("mirror.db"))
        .await
        .unwrap();
    let mut message = MailMessage::new(id);
    message.subject = Some("Hello".to_string());
    message.message_id = message_id.map(str::to_string);
    message.mailbox_status = MailboxStatus::Inbox;
    store.upsert_message(&message).await.unwrap();
    store
}

#[tokio::test]
async fn archive_failure_rolls_back_and_retains_intent() {
    let dir = TempDir::new().unwrap();
    let id = "a".repeat(32);
    let store = store_with_message(&dir, &id, Some("<m1@example.com>")).await;

    let bridge = MockBridge::default();
    bridge.fail(true);
    let backsync = BackwardSync::new(store.clone(), &bridge);

    let err = backsync.archive_message(&id).await.unwrap_err();
    assert!(matches!(err, BackSyncError::AppleScriptFailed { .. }));

    // Optimistic update rolled back, intent retained.
    let message = store.get_message(&id).await.unwrap().unwrap();
    assert_eq!(message.mailbox_status, MailboxStatus::Inbox);
    assert_eq!(message.pending_sync_action, Some(PendingAction::Archive));

    // A later retry pass succeeds and converges.
    bridge.fail(false);
    let report = backsync.process_pending_actions().await.unwrap();
    assert_eq!(report.archived, 1);
    assert_eq!(report.failed, 0);

    let message = store.get_message(&id).await.unwrap().unwrap();
    assert_eq!(message.mailbox_status, MailboxStatus::Archived);
    assert_eq!(message.pending_sync_action, None);
    assert_eq!(bridge.script_count(), 2);
}

#[tokio::test]
async fn delete_clears_pending_on_success() {
    let dir = TempDir::new().unwrap();
    let id = "b".repeat(32);
    let store = store_with_message(&dir, &id, Some("<m2@example.com>")).await;

    let bridge = MockBridge::default();
    let backsync = BackwardSync::new(store.clone(), &bridge);
    backsync.delete_message(&id).await.unwrap();

    let message = store.get_message(&id).await.unwrap().unwrap();
    assert_eq!(message.mailbox_status, MailboxStatus::Deleted);
    assert_eq!(message.pending_sync_action, None);

    // The generated script looked the message up by both id forms.
    let script = bridge.last_script().unwrap();
    assert!(script.contains("\"m2@example.com\""));
    assert!(script.contains("\"<m2@example.com>\""));
    assert!(script.contains("delete"));
}

#[tokio::test]
async fn missing_message_and_missing_id_are_typed_errors() {
    let dir = TempDir::new().unwrap();
    let id = "c".repeat(32);
    let store = store_with_message(&dir, &id, None).await;

    let bridge = MockBridge::default();
    let backsync = BackwardSync::new(store.clone(), &bridge);

    let err = backsync.archive_message(&"0".repeat(32)).await.unwrap_err();
    assert!(matches!(err, BackSyncError::MessageNotFound(_)));

    let err = backsync.archive_message(&id).await.unwrap_err();
    assert!(matches!(err, BackSyncError::NoMessageId(_)));
    assert_eq!(bridge.script_count(), 0);
}

#[tokio::test]
async fn successful_archive_removes_export_file() {
    let dir = TempDir::new().unwrap();
    let id = "d".repeat(32);
    let store = MirrorStore::open(&dir.path().join("mirror.db"))
        .await
        .unwrap();

    let export = dir.path().join("export.md");
    std::fs::write(&export, "exported copy").unwrap();

    let mut message = MailMessage::new(&id);
    message.message_id = Some("<m4@example.com>".to_string());
    message.export_path = Some(export.to_string_lossy().into_owned());
    store.upsert_message(&message).await.unwrap();

    let bridge = MockBridge::default();
    let backsync = BackwardSync::new(store.clone(), &bridge);
    backsync.archive_message(&id).await.unwrap();

    assert!(!export.exists());
    let message = store.get_message(&id).await.unwrap().unwrap();
    assert_eq!(message.mailbox_status, MailboxStatus::Archived);
}
