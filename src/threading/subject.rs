//! Subject normalization for threading fallback.
//!
//! When reference headers are missing, messages are grouped by normalized
//! subject. Normalization repeatedly strips leading reply and forward
//! prefixes (including the localized variants common mail clients emit),
//! collapses whitespace, and lowercases.

/// Reply/forward prefixes stripped during normalization, lowercase, with the
/// trailing colon.
const REPLY_PREFIXES: &[&str] = &[
    "re:", "fwd:", "fw:", "aw:", "antw:", "vs:", "sv:", "odp:", "r:",
];

/// Normalize an email subject for threading comparison.
///
/// Prefixes may be nested (`Re: Re: Fwd: ...`); the loop keeps stripping
/// until the subject stops changing.
pub fn normalize_subject(subject: &str) -> String {
    let mut normalized = subject.trim().to_lowercase();

    loop {
        let before = normalized.clone();

        for prefix in REPLY_PREFIXES {
            if normalized.starts_with(prefix) {
                normalized = normalized[prefix.len()..].trim_start().to_string();
            }
        }

        if before == normalized {
            break;
        }
    }

    let words: Vec<&str> = normalized.split_whitespace().collect();
    words.join(" ")
}

/// True when the subject marks a forwarded message.
pub fn is_forward_subject(subject: &str) -> bool {
    let subject = subject.trim().to_lowercase();
    subject.starts_with("fwd:") || subject.starts_with("fw:") || subject.starts_with("forwarded")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_nested_reply_prefixes() {
        assert_eq!(normalize_subject("Re: Re: Fwd: Hello World  "), "hello world");
    }

    #[test]
    fn strips_localized_prefixes() {
        assert_eq!(normalize_subject("Antw: Vs: Meeting"), "meeting");
        assert_eq!(normalize_subject("Odp: Sv: AW: status"), "status");
    }

    #[test]
    fn collapses_whitespace() {
        assert_eq!(normalize_subject("  Re:   too    many spaces "), "too many spaces");
    }

    #[test]
    fn plain_subject_is_lowercased_only() {
        assert_eq!(normalize_subject("Quarterly Report"), "quarterly report");
    }

    #[test]
    fn forward_detection() {
        assert!(is_forward_subject("Fwd: budget"));
        assert!(is_forward_subject("FW: budget"));
        assert!(is_forward_subject("Forwarded message"));
        assert!(!is_forward_subject("Re: budget"));
        assert!(!is_forward_subject("budget"));
    }
}
