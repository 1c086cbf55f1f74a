//! Best-effort scan of the trailing property dictionary.
//!
//! Message files carry an XML property list after the RFC 822 block with
//! host-side state (flag bits, color labels, junk scores). Only scalar
//! key/value pairs are extracted; anything unexpected yields `None` and the
//! caller ignores it.

use std::collections::HashMap;
use std::sync::OnceLock;

use regex::Regex;

/// Scalar entries pulled out of the trailing dictionary.
#[derive(Debug, Clone, Default)]
pub struct HostMetadata {
    values: HashMap<String, String>,
}

impl HostMetadata {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    /// The host's `flags` bitfield, when present.
    pub fn flags(&self) -> Option<i64> {
        self.get("flags").and_then(|v| v.parse().ok())
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

fn entry_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(
            r"(?s)<key>([^<]+)</key>\s*(?:<integer>([^<]*)</integer>|<string>([^<]*)</string>|<real>([^<]*)</real>|<(true|false)\s*/>)",
        )
        .unwrap()
    })
}

/// Parse scalar dictionary entries from the trailing bytes.
///
/// Returns `None` when the region does not look like a property list or
/// contains no recognizable entries.
pub fn parse(bytes: &[u8]) -> Option<HostMetadata> {
    let text = super::decode_text(bytes);
    if !text.contains("<dict>") && !text.contains("<plist") {
        return None;
    }

    let mut values = HashMap::new();
    for capture in entry_pattern().captures_iter(&text) {
        let key = capture.get(1)?.as_str().trim().to_string();
        let value = capture
            .get(2)
            .or_else(|| capture.get(3))
            .or_else(|| capture.get(4))
            .or_else(|| capture.get(5))
            .map(|m| m.as_str().trim().to_string())
            .unwrap_or_default();
        values.insert(key, value);
    }

    if values.is_empty() {
        None
    } else {
        Some(HostMetadata { values })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_scalars() {
        let raw = concat!(
            "<plist version=\"1.0\"><dict>",
            "<key>flags</key><integer>33751041</integer>",
            "<key>color</key><string>FF0000</string>",
            "<key>junk</key><real>0.1</real>",
            "<key>remote</key><true/>",
            "</dict></plist>",
        );
        let metadata = parse(raw.as_bytes()).unwrap();
        assert_eq!(metadata.flags(), Some(33751041));
        assert_eq!(metadata.get("color"), Some("FF0000"));
        assert_eq!(metadata.get("junk"), Some("0.1"));
        assert_eq!(metadata.get("remote"), Some("true"));
        assert_eq!(metadata.len(), 4);
    }

    #[test]
    fn rejects_non_plist_bytes() {
        assert!(parse(b"\x00\x01\x02 binary junk").is_none());
        assert!(parse(b"").is_none());
    }
}
