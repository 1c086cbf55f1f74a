//! Host mail-store discovery.
//!
//! Locates the host mail application's on-disk data root, selects the newest
//! version directory, and validates that the envelope database is readable.
//! Also computes per-message file paths using the host's partition scheme.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;
use uuid::Uuid;

/// Resolved layout of the host mail store.
#[derive(Debug, Clone)]
pub struct MailStoreLayout {
    /// Absolute path of the envelope database.
    pub envelope_path: PathBuf,
    /// Name of the selected version directory (e.g. `V10`).
    pub version_dir: String,
    /// `{mail_root}/{version_dir}/MailData`.
    pub data_root: PathBuf,
    /// The mail root supplied by the caller (e.g. `~/Library/Mail`).
    pub mail_root: PathBuf,
}

#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("mail directory not found at {0}")]
    MailDirectoryNotFound(PathBuf),
    #[error("no version directory (V<digits>) under {0}")]
    NoVersionDirectory(PathBuf),
    #[error("envelope database not found at {0}")]
    EnvelopeIndexNotFound(PathBuf),
    #[error("permission denied reading {0}; grant Full Disk Access in System Settings > Privacy & Security")]
    PermissionDenied(PathBuf),
    #[error("failed to read {path}: {source}")]
    ReadFailed {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

fn io_error(path: &Path, source: io::Error) -> DiscoveryError {
    match source.kind() {
        io::ErrorKind::PermissionDenied => DiscoveryError::PermissionDenied(path.to_path_buf()),
        _ => DiscoveryError::ReadFailed {
            path: path.to_path_buf(),
            source,
        },
    }
}

/// Locate the envelope database under `mail_root`, or validate `custom`.
///
/// Without a custom path, version directories named `V` followed by digits
/// are enumerated and the numerically largest one is selected, then
/// `MailData/Envelope Index` is validated inside it.
pub fn discover(
    mail_root: &Path,
    custom: Option<&Path>,
) -> Result<MailStoreLayout, DiscoveryError> {
    if let Some(custom) = custom {
        validate_readable(custom)?;
        let data_root = custom
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| custom.to_path_buf());
        let version_dir = data_root
            .parent()
            .and_then(|p| p.file_name())
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        log::debug!("using custom envelope database at {}", custom.display());
        return Ok(MailStoreLayout {
            envelope_path: custom.to_path_buf(),
            version_dir,
            data_root,
            mail_root: mail_root.to_path_buf(),
        });
    }

    if !mail_root.exists() {
        return Err(DiscoveryError::MailDirectoryNotFound(
            mail_root.to_path_buf(),
        ));
    }

    let version_dir = latest_version_dir(mail_root)?
        .ok_or_else(|| DiscoveryError::NoVersionDirectory(mail_root.to_path_buf()))?;

    let data_root = mail_root.join(&version_dir).join("MailData");
    let envelope_path = data_root.join("Envelope Index");
    if !envelope_path.exists() {
        return Err(DiscoveryError::EnvelopeIndexNotFound(envelope_path));
    }
    validate_readable(&envelope_path)?;

    log::info!(
        "discovered envelope database at {} (version {})",
        envelope_path.display(),
        version_dir
    );

    Ok(MailStoreLayout {
        envelope_path,
        version_dir,
        data_root,
        mail_root: mail_root.to_path_buf(),
    })
}

/// Pick the `V<digits>` entry with the largest numeric suffix.
fn latest_version_dir(mail_root: &Path) -> Result<Option<String>, DiscoveryError> {
    let entries = fs::read_dir(mail_root).map_err(|e| io_error(mail_root, e))?;

    let mut best: Option<(u64, String)> = None;
    for entry in entries {
        let entry = entry.map_err(|e| io_error(mail_root, e))?;
        let name = entry.file_name().to_string_lossy().into_owned();
        let Some(digits) = name.strip_prefix('V') else {
            continue;
        };
        if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
            continue;
        }
        let Ok(number) = digits.parse::<u64>() else {
            continue;
        };
        if best.as_ref().map(|(n, _)| number > *n).unwrap_or(true) {
            best = Some((number, name));
        }
    }

    Ok(best.map(|(_, name)| name))
}

fn validate_readable(path: &Path) -> Result<(), DiscoveryError> {
    if !path.exists() {
        return Err(DiscoveryError::EnvelopeIndexNotFound(path.to_path_buf()));
    }
    fs::File::open(path).map_err(|e| io_error(path, e))?;
    Ok(())
}

/// Compute the on-disk path of a message file.
///
/// The host partitions message files under a UUID-named subdirectory of the
/// mailbox: with `p1 = (row_id / 1000) % 10` and `p2 = row_id / 10000`, the
/// candidates are `Data/{p1}/{p2}/Messages/`, `Data/{p1}/Messages/` and
/// `Data/Messages/`, each tried with `{row_id}.emlx` and
/// `{row_id}.partial.emlx`. Mailboxes without a UUID subdirectory fall back
/// to the legacy `Messages/` layout directly under the mailbox.
pub fn message_file_path(row_id: i64, mailbox_path: &Path) -> Option<PathBuf> {
    let filenames = [
        format!("{row_id}.emlx"),
        format!("{row_id}.partial.emlx"),
    ];

    if let Some(uuid_dir) = find_uuid_subdir(mailbox_path) {
        let p1 = (row_id / 1000) % 10;
        let p2 = row_id / 10_000;
        let data = uuid_dir.join("Data");
        let candidates = [
            data.join(p1.to_string()).join(p2.to_string()).join("Messages"),
            data.join(p1.to_string()).join("Messages"),
            data.join("Messages"),
        ];
        for dir in &candidates {
            for name in &filenames {
                let path = dir.join(name);
                if path.is_file() {
                    return Some(path);
                }
            }
        }
        return None;
    }

    // Legacy layout without per-account UUID partitioning
    let legacy = mailbox_path.join("Messages");
    for name in &filenames {
        let path = legacy.join(name);
        if path.is_file() {
            return Some(path);
        }
    }
    None
}

/// First direct child whose name parses as a UUID (8-4-4-4-12).
fn find_uuid_subdir(mailbox_path: &Path) -> Option<PathBuf> {
    let entries = fs::read_dir(mailbox_path).ok()?;
    for entry in entries.flatten() {
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if Uuid::try_parse(&name).is_ok() && entry.path().is_dir() {
            return Some(entry.path());
        }
    }
    None
}
