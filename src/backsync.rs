//! Backward synchronization: mirror → host.
//!
//! Archive and delete intents are applied optimistically: the mirror row is
//! moved first, then the script is pushed through the bridge. On success the
//! pending flag clears; on failure the mirror status rolls back while the
//! pending action is retained, so `process_pending_actions` retries until
//! the host confirms. The user's intent is never silently dropped.

use thiserror::Error;

use crate::bridge::{scripts, BridgeError, ScriptBridge};
use crate::models::{MailboxStatus, PendingAction};
use crate::store::{MirrorStore, StoreError};

#[derive(Debug, Error)]
pub enum BackSyncError {
    #[error("message not found in mirror: {0}")]
    MessageNotFound(String),
    #[error("message {0} has no RFC 822 Message-ID; the bridge cannot look it up")]
    NoMessageId(String),
    #[error("script push failed for {id}: {source}")]
    AppleScriptFailed {
        id: String,
        #[source]
        source: BridgeError,
    },
    #[error("rollback failed for {id}: {source}")]
    RollbackFailed {
        id: String,
        #[source]
        source: StoreError,
    },
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Outcome of a retry pass over pending actions.
#[derive(Debug, Clone, Default)]
pub struct PendingActionReport {
    pub archived: usize,
    pub deleted: usize,
    pub failed: usize,
    pub errors: Vec<String>,
}

/// Pushes mirror-side mutations to the host through a script bridge.
pub struct BackwardSync<B: ScriptBridge> {
    store: MirrorStore,
    bridge: B,
}

impl<B: ScriptBridge> BackwardSync<B> {
    pub fn new(store: MirrorStore, bridge: B) -> Self {
        Self { store, bridge }
    }

    /// Archive a message on the host, optimistically marking the mirror.
    pub async fn archive_message(&self, id: &str) -> Result<(), BackSyncError> {
        self.apply(id, PendingAction::Archive).await
    }

    /// Delete a message on the host (moves to trash), optimistically
    /// marking the mirror.
    pub async fn delete_message(&self, id: &str) -> Result<(), BackSyncError> {
        self.apply(id, PendingAction::Delete).await
    }

    /// Retry every recorded intent, oldest update first. Failures keep
    /// their pending flag for the next pass.
    pub async fn process_pending_actions(&self) -> Result<PendingActionReport, BackSyncError> {
        let pending = self.store.get_messages_with_pending_actions().await?;
        let mut report = PendingActionReport::default();

        for message in pending {
            let Some(action) = message.pending_sync_action else {
                continue;
            };
            match self.apply(&message.id, action).await {
                Ok(()) => match action {
                    PendingAction::Archive => report.archived += 1,
                    PendingAction::Delete => report.deleted += 1,
                },
                Err(err) => {
                    report.failed += 1;
                    report.errors.push(err.to_string());
                }
            }
        }

        if report.failed > 0 {
            log::warn!(
                "pending-action pass: {} archived, {} deleted, {} still failing",
                report.archived,
                report.deleted,
                report.failed
            );
        }
        Ok(report)
    }

    async fn apply(&self, id: &str, action: PendingAction) -> Result<(), BackSyncError> {
        let message = self
            .store
            .get_message(id)
            .await?
            .ok_or_else(|| BackSyncError::MessageNotFound(id.to_string()))?;
        let Some(rfc_message_id) = message.message_id.clone() else {
            return Err(BackSyncError::NoMessageId(id.to_string()));
        };

        let original_status = message.mailbox_status;
        let target = match action {
            PendingAction::Archive => MailboxStatus::Archived,
            PendingAction::Delete => MailboxStatus::Deleted,
        };

        // Optimistic step: the mirror moves first, with the intent recorded.
        self.store.set_status_with_pending(id, target, action).await?;

        let script = match action {
            PendingAction::Archive => scripts::archive_script(&rfc_message_id),
            PendingAction::Delete => scripts::delete_script(&rfc_message_id),
        };

        match self.bridge.execute_mail_script(&script).await {
            Ok(_) => {
                self.store.clear_pending_sync_action(id).await?;
                log::debug!("{} confirmed for {id}", action.as_str());

                if let Some(export_path) = &message.export_path {
                    if let Err(err) = std::fs::remove_file(export_path) {
                        log::warn!("could not remove export file {export_path}: {err}");
                    }
                }
                Ok(())
            }
            Err(bridge_err) => {
                // Restore the visible status; the pending action stays so a
                // later pass retries.
                if let Err(rollback_err) =
                    self.store.update_mailbox_status(id, original_status).await
                {
                    return Err(BackSyncError::RollbackFailed {
                        id: id.to_string(),
                        source: rollback_err,
                    });
                }
                Err(BackSyncError::AppleScriptFailed {
                    id: id.to_string(),
                    source: bridge_err,
                })
            }
        }
    }
}
