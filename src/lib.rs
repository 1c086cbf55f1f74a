//! Local mail mirror and threading engine.
//!
//! Maintains a read/write mirror database derived from a host mail
//! application's on-disk envelope index and per-message files. The mirror is
//! queryable, full-text searchable, and threadable by conversation;
//! mutations (archive/delete) are applied optimistically to the mirror and
//! pushed back to the host through a scripting bridge.
//!
//! The pieces compose left to right: [`discovery`] locates the host data,
//! [`parser`] reads message files, [`identity`] mints stable ids,
//! [`threading`] groups conversations, [`store`] owns the mirror database,
//! [`sync`] drives host → mirror, and [`backsync`] pushes mirror → host via
//! [`bridge`].

pub mod backsync;
pub mod bridge;
pub mod discovery;
pub mod identity;
pub mod models;
pub mod parser;
pub mod store;
pub mod sync;
pub mod threading;

use env_logger::Env;
use std::sync::Once;

pub use backsync::BackwardSync;
pub use bridge::{OsaScriptBridge, ScriptBridge};
pub use discovery::MailStoreLayout;
pub use store::MirrorStore;
pub use sync::{SyncEngine, SyncOptions};
pub use threading::{ThreadCache, ThreadDetector};

static LOGGER: Once = Once::new();

/// Initialize the process-wide logger once. Safe to call repeatedly.
pub fn init_logger() {
    LOGGER.call_once(|| {
        env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();
    });
}
