//! Script generation for the host mail application.
//!
//! Scripts locate a message by its RFC 822 Message-ID; both the stripped and
//! the angle-wrapped candidate are tried because the host stores either form
//! depending on version. Archive tries the localized archive mailbox names
//! in order; delete uses the host's native delete verb, which moves the
//! message to the trash.

/// Localized archive mailbox names, tried in order.
pub const ARCHIVE_MAILBOX_NAMES: &[&str] = &["Archive", "All Mail", "Archives", "Archivo", "Archiv"];

/// Escape a value for embedding in a quoted script literal.
pub fn escape_script_string(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for ch in value.chars() {
        match ch {
            '\\' => escaped.push_str("\\\\"),
            '"' => escaped.push_str("\\\""),
            '\n' => escaped.push_str("\\n"),
            '\r' => escaped.push_str("\\r"),
            '\t' => escaped.push_str("\\t"),
            _ => escaped.push(ch),
        }
    }
    escaped
}

/// Stripped and angle-wrapped lookup candidates for a Message-ID.
pub fn message_id_candidates(message_id: &str) -> (String, String) {
    let stripped = message_id
        .trim()
        .trim_start_matches('<')
        .trim_end_matches('>')
        .trim()
        .to_string();
    let wrapped = format!("<{stripped}>");
    (stripped, wrapped)
}

fn selector(message_id: &str) -> String {
    let (stripped, wrapped) = message_id_candidates(message_id);
    format!(
        "(every message of inbox whose message id is \"{}\" or message id is \"{}\")",
        escape_script_string(&stripped),
        escape_script_string(&wrapped)
    )
}

/// Script that moves an inbox message into the account's archive mailbox,
/// trying each localized name until one exists.
pub fn archive_script(message_id: &str) -> String {
    let names = ARCHIVE_MAILBOX_NAMES
        .iter()
        .map(|name| format!("\"{name}\""))
        .collect::<Vec<_>>()
        .join(", ");

    format!(
        r#"tell application "Mail"
    set targetMessages to {selector}
    if (count of targetMessages) is 0 then error "message not found" number -1728
    set theMessage to item 1 of targetMessages
    set theAccount to account of mailbox of theMessage
    set archiveNames to {{{names}}}
    set moved to false
    repeat with archiveName in archiveNames
        if moved is false then
            try
                move theMessage to (mailbox (archiveName as string) of theAccount)
                set moved to true
            end try
        end if
    end repeat
    if moved is false then error "mailbox \"Archive\" not found" number -1728
end tell"#,
        selector = selector(message_id),
        names = names,
    )
}

/// Script that deletes a message via the host's native delete verb.
pub fn delete_script(message_id: &str) -> String {
    format!(
        r#"tell application "Mail"
    set targetMessages to {selector}
    if (count of targetMessages) is 0 then error "message not found" number -1728
    delete (item 1 of targetMessages)
end tell"#,
        selector = selector(message_id),
    )
}
