//! Scripting bridge to the host mail application.
//!
//! The bridge contract is one operation: execute a script against the host
//! and return its output or a structured error. The provided implementation
//! shells out to `osascript`; tests substitute their own `ScriptBridge`.
//! Before executing, the bridge makes sure the host application is running:
//! fast-path check, then launch and poll every 100 ms up to the configured
//! timeout.

pub mod scripts;

use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tokio::process::Command;
use tokio::time::Instant;

pub const DEFAULT_LAUNCH_TIMEOUT: Duration = Duration::from_secs(10);
const LAUNCH_POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("automation permission denied: {guidance}")]
    AutomationPermissionDenied { guidance: String },
    #[error("mail application is not responding: {underlying}")]
    MailAppNotResponding { underlying: String },
    #[error("message not found in mail application")]
    MessageNotFound { id: Option<String> },
    #[error("{count} messages matched; narrow the lookup by Message-ID")]
    MessageResolutionAmbiguous { count: usize },
    #[error("mailbox not found: {name}")]
    MailboxNotFound { name: String },
    #[error("script compilation failed: {details}")]
    ScriptCompilationFailed { details: String },
    #[error("script execution failed (code {code}): {message}")]
    ExecutionFailed { code: i64, message: String },
    #[error("mail application did not launch within {seconds}s")]
    MailLaunchTimeout { seconds: u64 },
    #[error("failed to run script host: {0}")]
    Io(#[from] std::io::Error),
}

/// Contract between the core and whatever executes scripts.
pub trait ScriptBridge: Send + Sync {
    /// Execute a script against the host mail application. `Ok` carries the
    /// script's output, when it produced any.
    fn execute_mail_script(
        &self,
        source: &str,
    ) -> impl Future<Output = Result<Option<String>, BridgeError>> + Send;
}

/// `osascript`-backed bridge.
pub struct OsaScriptBridge {
    launch_timeout: Duration,
}

impl OsaScriptBridge {
    pub fn new() -> Self {
        Self {
            launch_timeout: DEFAULT_LAUNCH_TIMEOUT,
        }
    }

    pub fn with_launch_timeout(launch_timeout: Duration) -> Self {
        Self { launch_timeout }
    }

    /// Fast-path running check; launch and poll otherwise.
    pub async fn ensure_mail_running(&self) -> Result<(), BridgeError> {
        if self.is_mail_running().await? {
            return Ok(());
        }

        log::info!("mail application not running, launching");
        self.run_osascript("tell application \"Mail\" to launch")
            .await?;

        let deadline = Instant::now() + self.launch_timeout;
        loop {
            if self.is_mail_running().await? {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(BridgeError::MailLaunchTimeout {
                    seconds: self.launch_timeout.as_secs(),
                });
            }
            tokio::time::sleep(LAUNCH_POLL_INTERVAL).await;
        }
    }

    async fn is_mail_running(&self) -> Result<bool, BridgeError> {
        let output = self
            .run_osascript("application \"Mail\" is running")
            .await?;
        Ok(output.as_deref() == Some("true"))
    }

    async fn run_osascript(&self, source: &str) -> Result<Option<String>, BridgeError> {
        let output = Command::new("osascript")
            .arg("-e")
            .arg(source)
            .output()
            .await?;

        if output.status.success() {
            let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
            Ok(Some(stdout).filter(|s| !s.is_empty()))
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            Err(map_script_error(&stderr))
        }
    }
}

impl Default for OsaScriptBridge {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptBridge for OsaScriptBridge {
    async fn execute_mail_script(&self, source: &str) -> Result<Option<String>, BridgeError> {
        self.ensure_mail_running().await?;
        self.run_osascript(source).await
    }
}

/// Map `osascript` stderr to the typed error taxonomy.
///
/// The script host reports errors as text with a trailing parenthesized
/// code, e.g. `execution error: Not authorized to send Apple events to
/// Mail. (-1743)`.
pub fn map_script_error(stderr: &str) -> BridgeError {
    let message = stderr.trim().to_string();
    let lower = message.to_lowercase();
    let code = extract_error_code(&message).unwrap_or(0);

    match code {
        1743 => BridgeError::AutomationPermissionDenied {
            guidance: "allow automation access to Mail under System Settings > Privacy & Security > Automation".to_string(),
        },
        600 | 609 | 903 => BridgeError::MailAppNotResponding {
            underlying: message,
        },
        1728 | 1719 => {
            if lower.contains("mailbox") {
                BridgeError::MailboxNotFound {
                    name: extract_quoted(&message).unwrap_or_else(|| "Archive".to_string()),
                }
            } else if lower.contains("message") {
                BridgeError::MessageNotFound { id: None }
            } else {
                BridgeError::ExecutionFailed { code, message }
            }
        }
        2740 | 2741 => BridgeError::ScriptCompilationFailed { details: message },
        _ if lower.contains("not authorized") => BridgeError::AutomationPermissionDenied {
            guidance: "allow automation access to Mail under System Settings > Privacy & Security > Automation".to_string(),
        },
        _ => BridgeError::ExecutionFailed { code, message },
    }
}

/// Pull the (positive) code out of a trailing `(-NNNN)` marker.
fn extract_error_code(message: &str) -> Option<i64> {
    let start = message.rfind("(-")?;
    let rest = &message[start + 2..];
    let end = rest.find(')')?;
    rest[..end].parse().ok()
}

fn extract_quoted(message: &str) -> Option<String> {
    let start = message.find(['"', '\u{201c}'])? + 1;
    let rest = &message[start..];
    let end = rest.find(['"', '\u{201d}'])?;
    let name = &rest[..end];
    if name.is_empty() {
        None
    } else {
        Some(name.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_permission_denied() {
        let err = map_script_error(
            "execution error: Not authorized to send Apple events to Mail. (-1743)",
        );
        assert!(matches!(err, BridgeError::AutomationPermissionDenied { .. }));

        let err = map_script_error("Mail got an error: not authorized");
        assert!(matches!(err, BridgeError::AutomationPermissionDenied { .. }));
    }

    #[test]
    fn maps_not_responding() {
        let err = map_script_error("execution error: Application isn't running. (-600)");
        assert!(matches!(err, BridgeError::MailAppNotResponding { .. }));
    }

    #[test]
    fn maps_object_not_found() {
        let err =
            map_script_error("execution error: Mail got an error: message not found (-1728)");
        assert!(matches!(err, BridgeError::MessageNotFound { .. }));

        let err = map_script_error(
            "execution error: Mail got an error: Can't get mailbox \"Archiv\". (-1728)",
        );
        match err {
            BridgeError::MailboxNotFound { name } => assert_eq!(name, "Archiv"),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn maps_compile_errors_and_default() {
        let err = map_script_error("syntax error: Expected end of line. (-2741)");
        assert!(matches!(err, BridgeError::ScriptCompilationFailed { .. }));

        let err = map_script_error("execution error: something odd (-10004)");
        match err {
            BridgeError::ExecutionFailed { code, .. } => assert_eq!(code, 10004),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn code_extraction() {
        assert_eq!(extract_error_code("blah (-1743)"), Some(1743));
        assert_eq!(extract_error_code("no code here"), None);
    }
}
