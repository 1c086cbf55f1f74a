//! Deterministic content-addressed identifiers.
//!
//! Message and thread identifiers are the first 128 bits of a SHA-256 digest
//! over a tagged input string, rendered as 32 lowercase hex characters.
//! Given the same inputs the generator always produces the same identifier.

use chrono::{DateTime, Utc};
use rand::RngCore;
use sha2::{Digest, Sha256};

/// Hash a tagged input down to a 32-character lowercase hex identifier.
pub fn hash_id(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    let digest = hasher.finalize();

    let mut out = String::with_capacity(32);
    for byte in &digest[..16] {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

/// Inputs available for minting a message identifier, in preference order.
#[derive(Debug, Default, Clone)]
pub struct IdInputs<'a> {
    /// RFC 822 Message-ID, possibly still wrapped in angle brackets.
    pub message_id: Option<&'a str>,
    pub subject: Option<&'a str>,
    pub sender_email: Option<&'a str>,
    pub date: Option<DateTime<Utc>>,
    pub rowid: Option<i64>,
}

/// Mint a stable message identifier.
///
/// Preference order: normalized Message-ID, then at least two of
/// {subject, sender, date, rowid} as a tagged header tuple, then the bare
/// host rowid. Messages with none of these get a random identifier that is
/// not stable across invocations.
pub fn generate_message_id(inputs: &IdInputs<'_>) -> String {
    if let Some(raw) = inputs.message_id {
        let normalized = normalize_rfc_message_id(raw);
        if !normalized.is_empty() {
            return hash_id(&format!("msgid:{normalized}"));
        }
    }

    let mut pairs: Vec<String> = Vec::new();
    if let Some(subject) = inputs.subject {
        if !subject.is_empty() {
            pairs.push(format!("subj:{subject}"));
        }
    }
    if let Some(from) = inputs.sender_email {
        if !from.is_empty() {
            pairs.push(format!("from:{}", from.to_lowercase()));
        }
    }
    if let Some(date) = inputs.date {
        pairs.push(format!("date:{}", date.timestamp()));
    }
    if let Some(rowid) = inputs.rowid {
        pairs.push(format!("rowid:{rowid}"));
    }

    if pairs.len() >= 2 {
        return hash_id(&format!("hdr:{}", pairs.join("|")));
    }

    if let Some(rowid) = inputs.rowid {
        return hash_id(&format!("row:{rowid}"));
    }

    random_id()
}

/// Strip angle brackets, trim, and lowercase a Message-ID for hashing.
pub fn normalize_rfc_message_id(raw: &str) -> String {
    raw.trim()
        .trim_start_matches('<')
        .trim_end_matches('>')
        .trim()
        .to_lowercase()
}

/// Last-resort identifier for malformed messages with no usable inputs.
pub fn random_id() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    let mut out = String::with_capacity(32);
    for byte in bytes {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

/// True iff `s` is exactly 32 lowercase-hex characters.
pub fn is_valid_id(s: &str) -> bool {
    s.len() == 32 && s.bytes().all(|b| b.is_ascii_hexdigit())
}
