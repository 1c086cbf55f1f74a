//! Threading-header normalization.
//!
//! Canonical message-ids keep their angle brackets externally; the bracketed
//! form is what gets stored and compared. Hash keys (for thread-id minting)
//! strip the brackets, trim, and lowercase.

use crate::parser::extract_angle_tokens;

/// Normalized Message-ID / In-Reply-To / References for one message.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ThreadingHeaders {
    pub message_id: Option<String>,
    /// First id only; clients that list several are collapsed to the first.
    pub in_reply_to: Option<String>,
    /// All referenced ids, oldest first.
    pub references: Vec<String>,
}

impl ThreadingHeaders {
    /// Normalize raw header values.
    pub fn from_raw(
        message_id: Option<&str>,
        in_reply_to: Option<&str>,
        references: Option<&str>,
    ) -> Self {
        Self {
            message_id: message_id.and_then(canonical_message_id),
            in_reply_to: in_reply_to.and_then(canonical_message_id),
            references: references
                .map(|raw| {
                    extract_angle_tokens(raw)
                        .into_iter()
                        .filter_map(|token| canonical_message_id(&token))
                        .collect()
                })
                .unwrap_or_default(),
        }
    }

    /// Normalize values whose References were already tokenized.
    pub fn from_parts(
        message_id: Option<&str>,
        in_reply_to: Option<&str>,
        references: &[String],
    ) -> Self {
        Self {
            message_id: message_id.and_then(canonical_message_id),
            in_reply_to: in_reply_to.and_then(canonical_message_id),
            references: references
                .iter()
                .filter_map(|token| canonical_message_id(token))
                .collect(),
        }
    }

    /// True when the message points at an earlier one.
    pub fn is_reply(&self) -> bool {
        self.in_reply_to.is_some() || !self.references.is_empty()
    }
}

/// Canonicalize one raw id: the first `<...>` token wins; a bare value
/// containing `@` gets synthesized brackets; anything else is rejected.
pub fn canonical_message_id(raw: &str) -> Option<String> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }

    if let Some(token) = extract_angle_tokens(raw).into_iter().next() {
        return Some(token);
    }

    if raw.contains('@') && !raw.chars().any(char::is_whitespace) {
        return Some(format!("<{raw}>"));
    }

    None
}

/// Bracket-stripped, trimmed, lowercased form used for hashing only.
pub fn hash_key(canonical: &str) -> String {
    canonical
        .trim()
        .trim_start_matches('<')
        .trim_end_matches('>')
        .trim()
        .to_lowercase()
}
