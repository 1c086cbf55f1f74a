//! Message-file parsing.
//!
//! A message file wraps an RFC 822 envelope in a small container: the first
//! line is an ASCII decimal byte count, the next `count` bytes are the raw
//! message, and any remaining bytes form a serialized property dictionary
//! maintained by the host application. This module handles the framing and
//! delegates MIME parsing to `mailparse` (folded headers, RFC 2047 encoded
//! words, quoted-printable and base64 transfer encodings, nested multiparts).
//!
//! Parsing is tolerant by design: body or attachment problems produce absent
//! fields, not errors. Only an unreadable file, broken framing, or an
//! unparseable header section fail the parse. Parse failures are collected
//! by the sync engine and never abort a run.

pub mod plist;

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use mailparse::body::Body;
use mailparse::{DispositionType, MailHeaderMap, ParsedMail};
use thiserror::Error;

use crate::models::{AttachmentInfo, MailAddress};
pub use plist::HostMetadata;

/// Structured form of one parsed message file.
#[derive(Debug, Clone, Default)]
pub struct ParsedMessage {
    /// All headers keyed by lowercased name; the last occurrence wins.
    pub headers: HashMap<String, String>,
    pub subject: Option<String>,
    pub from: Option<MailAddress>,
    pub to: Vec<MailAddress>,
    pub cc: Vec<MailAddress>,
    pub bcc: Vec<MailAddress>,
    /// Raw Message-ID value, trimmed but otherwise as found.
    pub message_id: Option<String>,
    /// Raw In-Reply-To value; normalization happens in the threading layer.
    pub in_reply_to: Option<String>,
    /// Every `<...>` token of the References header, order preserved.
    pub references: Vec<String>,
    pub date: Option<DateTime<Utc>>,
    pub body_text: Option<String>,
    pub body_html: Option<String>,
    pub attachments: Vec<AttachmentInfo>,
    /// Best-effort parse of the trailing property dictionary.
    pub host_metadata: Option<HostMetadata>,
}

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("message file not found: {0}")]
    FileNotFound(PathBuf),
    #[error("invalid message file format: {0}")]
    InvalidFormat(String),
    #[error("failed to read message file: {0}")]
    ReadFailed(#[from] io::Error),
    #[error("failed to parse message headers: {0}")]
    HeaderParseFailed(String),
}

/// Read and parse one message file from disk.
pub fn parse_message_file(path: &Path) -> Result<ParsedMessage, ParseError> {
    let bytes = std::fs::read(path).map_err(|e| {
        if e.kind() == io::ErrorKind::NotFound {
            ParseError::FileNotFound(path.to_path_buf())
        } else {
            ParseError::ReadFailed(e)
        }
    })?;
    parse_emlx(&bytes)
}

/// Parse the length-prefixed container format.
pub fn parse_emlx(bytes: &[u8]) -> Result<ParsedMessage, ParseError> {
    let (rfc822, trailing) = split_container(bytes)?;
    let mut message = parse_rfc822(rfc822)?;
    if !trailing.is_empty() {
        message.host_metadata = plist::parse(trailing);
    }
    Ok(message)
}

/// Split a container into its RFC 822 block and trailing property bytes.
fn split_container(bytes: &[u8]) -> Result<(&[u8], &[u8]), ParseError> {
    let newline = bytes
        .iter()
        .position(|&b| b == b'\n')
        .ok_or_else(|| ParseError::InvalidFormat("missing length-prefix line".into()))?;

    let mut prefix = &bytes[..newline];
    if prefix.ends_with(b"\r") {
        prefix = &prefix[..prefix.len() - 1];
    }
    let prefix = prefix.trim_ascii();
    if prefix.is_empty() || !prefix.iter().all(|b| b.is_ascii_digit()) {
        return Err(ParseError::InvalidFormat(
            "length prefix is not a decimal byte count".into(),
        ));
    }

    let count: usize = std::str::from_utf8(prefix)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| ParseError::InvalidFormat("length prefix out of range".into()))?;

    let start = newline + 1;
    let end = start
        .checked_add(count)
        .filter(|&end| end <= bytes.len())
        .ok_or_else(|| ParseError::InvalidFormat("length prefix exceeds file size".into()))?;

    Ok((&bytes[start..end], &bytes[end..]))
}

/// Parse an RFC 822 message into the structured form.
pub fn parse_rfc822(raw: &[u8]) -> Result<ParsedMessage, ParseError> {
    let parsed =
        mailparse::parse_mail(raw).map_err(|e| ParseError::HeaderParseFailed(e.to_string()))?;

    let mut headers = HashMap::new();
    for header in &parsed.headers {
        headers.insert(header.get_key().to_lowercase(), header.get_value());
    }

    let subject = parsed
        .headers
        .get_first_value("Subject")
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty());

    let from = parsed
        .headers
        .get_first_value("From")
        .and_then(|v| parse_address_list(&v).into_iter().next());
    let to = parsed
        .headers
        .get_first_value("To")
        .map(|v| parse_address_list(&v))
        .unwrap_or_default();
    let cc = parsed
        .headers
        .get_first_value("Cc")
        .map(|v| parse_address_list(&v))
        .unwrap_or_default();
    let bcc = parsed
        .headers
        .get_first_value("Bcc")
        .map(|v| parse_address_list(&v))
        .unwrap_or_default();

    let message_id = parsed
        .headers
        .get_first_value("Message-ID")
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty());
    let in_reply_to = parsed
        .headers
        .get_first_value("In-Reply-To")
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty());
    let references = parsed
        .headers
        .get_first_value("References")
        .map(|v| extract_angle_tokens(&v))
        .unwrap_or_default();

    let date = parsed
        .headers
        .get_first_value("Date")
        .and_then(|v| parse_message_date(&v));

    let mut body_text = None;
    let mut body_html = None;
    let mut attachments = Vec::new();
    walk_parts(&parsed, &mut body_text, &mut body_html, &mut attachments);

    Ok(ParsedMessage {
        headers,
        subject,
        from,
        to,
        cc,
        bcc,
        message_id,
        in_reply_to,
        references,
        date,
        body_text,
        body_html,
        attachments,
        host_metadata: None,
    })
}

/// Walk the MIME tree, filling the first text/plain and text/html bodies and
/// collecting attachment metadata from parts that carry a filename or a
/// non-text type.
fn walk_parts(
    part: &ParsedMail<'_>,
    body_text: &mut Option<String>,
    body_html: &mut Option<String>,
    attachments: &mut Vec<AttachmentInfo>,
) {
    if !part.subparts.is_empty() {
        for sub in &part.subparts {
            walk_parts(sub, body_text, body_html, attachments);
        }
        return;
    }

    let ctype = part.ctype.mimetype.to_ascii_lowercase();
    let disposition = part.get_content_disposition();
    let filename = attachment_filename(part, &disposition.params);
    let is_attachment = disposition.disposition == DispositionType::Attachment
        || filename.is_some()
        || !(ctype.starts_with("text/") || ctype.starts_with("message/"));

    if !is_attachment {
        if ctype == "text/plain" && body_text.is_none() {
            if let Ok(text) = part.get_body() {
                *body_text = Some(text);
            }
        } else if ctype == "text/html" && body_html.is_none() {
            if let Ok(html) = part.get_body() {
                *body_html = Some(html);
            }
        }
        return;
    }

    let content_id = part
        .headers
        .get_first_value("Content-ID")
        .map(|v| v.trim().trim_matches(&['<', '>'][..]).to_string())
        .filter(|v| !v.is_empty());

    attachments.push(AttachmentInfo {
        filename,
        mime_type: ctype,
        size_bytes: estimate_part_size(part),
        content_id,
        is_inline: disposition.disposition == DispositionType::Inline,
    });
}

/// Decoded size of a leaf part. Base64 bodies are estimated from the
/// whitespace-stripped encoded length rather than decoded.
fn estimate_part_size(part: &ParsedMail<'_>) -> i64 {
    match part.get_body_encoded() {
        Body::Base64(body) => {
            let stripped = body
                .get_raw()
                .iter()
                .filter(|b| !b.is_ascii_whitespace())
                .count();
            (stripped * 3 / 4) as i64
        }
        Body::QuotedPrintable(body) => body
            .get_decoded()
            .map(|d| d.len() as i64)
            .unwrap_or_else(|_| body.get_raw().len() as i64),
        Body::SevenBit(body) | Body::EightBit(body) => body.get_raw().len() as i64,
        Body::Binary(body) => body.get_raw().len() as i64,
    }
}

/// Filename from Content-Disposition (`filename`, RFC 2231 `filename*`) or
/// the Content-Type `name` parameter.
fn attachment_filename(
    part: &ParsedMail<'_>,
    disposition_params: &std::collections::BTreeMap<String, String>,
) -> Option<String> {
    if let Some(name) = disposition_params.get("filename") {
        return Some(name.clone());
    }
    if let Some(extended) = disposition_params.get("filename*") {
        if let Some(decoded) = decode_rfc2231(extended) {
            return Some(decoded);
        }
    }
    part.ctype.params.get("name").cloned()
}

/// Decode an RFC 2231 `charset''percent-encoded` parameter value.
fn decode_rfc2231(value: &str) -> Option<String> {
    let mut parts = value.splitn(3, '\'');
    let charset = parts.next()?.to_ascii_lowercase();
    let _language = parts.next()?;
    let encoded = parts.next()?;

    let bytes = urlencoding::decode_binary(encoded.as_bytes()).into_owned();
    match charset.as_str() {
        "" | "utf-8" | "us-ascii" => Some(decode_text(&bytes)),
        "iso-8859-1" | "iso-8859-15" | "windows-1252" => {
            Some(bytes.iter().map(|&b| b as char).collect())
        }
        _ => Some(decode_text(&bytes)),
    }
}

/// UTF-8 with ISO-8859-1 fallback; transcoding alone never fails a parse.
pub fn decode_text(bytes: &[u8]) -> String {
    match std::str::from_utf8(bytes) {
        Ok(text) => text.to_string(),
        Err(_) => bytes.iter().map(|&b| b as char).collect(),
    }
}

/// Every `<...>` token with no whitespace inside, in order of appearance.
pub fn extract_angle_tokens(value: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut rest = value;
    while let Some(start) = rest.find('<') {
        let Some(len) = rest[start..].find('>') else {
            break;
        };
        let end = start + len;
        let inner = &rest[start + 1..end];
        if !inner.is_empty() && !inner.chars().any(char::is_whitespace) {
            tokens.push(rest[start..=end].to_string());
        }
        rest = &rest[end + 1..];
    }
    tokens
}

/// Parse a Date header, trying the common RFC 5322 forms first, then a
/// lenient parser, then the ctime-style `EEE MMM dd HH:mm:ss yyyy` layout.
pub fn parse_message_date(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }

    if let Ok(timestamp) = mailparse::dateparse(raw) {
        if let Some(dt) = Utc.timestamp_opt(timestamp, 0).single() {
            return Some(dt);
        }
    }

    if let Ok(dt) = dateparser::parse(raw) {
        return Some(dt.with_timezone(&Utc));
    }

    if let Ok(naive) = NaiveDateTime::parse_from_str(raw, "%a %b %e %H:%M:%S %Y") {
        return Some(Utc.from_utc_datetime(&naive));
    }

    None
}

/// Split a recipient header into addresses, honoring quotes and brackets.
fn parse_address_list(value: &str) -> Vec<MailAddress> {
    let mut out = Vec::new();
    let Ok(parsed) = mailparse::addrparse(value) else {
        return out;
    };
    for addr in parsed.iter() {
        match addr {
            mailparse::MailAddr::Single(info) => {
                out.push(MailAddress {
                    name: info
                        .display_name
                        .clone()
                        .map(|n| n.trim().to_string())
                        .filter(|n| !n.is_empty()),
                    email: info.addr.to_lowercase(),
                });
            }
            mailparse::MailAddr::Group(group) => {
                for info in &group.addrs {
                    out.push(MailAddress {
                        name: info
                            .display_name
                            .clone()
                            .map(|n| n.trim().to_string())
                            .filter(|n| !n.is_empty()),
                        email: info.addr.to_lowercase(),
                    });
                }
            }
        }
    }
    out
}
