//! Platform error types

use thiserror::Error;

/// Number of output lines kept with a rejected command
pub const LOG_TAIL_LINES: usize = 20;

/// Errors raised by package-manager and orchestration calls
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PlatformError {
    /// The platform API cannot be reached at all
    #[error("Platform unreachable: {0}")]
    Unreachable(String),

    /// A failure worth retrying (timeouts, conflicts, throttling)
    #[error("Transient failure: {0}")]
    Transient(String),

    /// The call completed and the platform refused it
    #[error("Rejected: {message}")]
    Rejected {
        message: String,
        log_tail: Option<String>,
    },

    /// The addressed object does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// The call did not finish within its bound
    #[error("Timed out after {after_secs}s: {operation}")]
    Timeout { operation: String, after_secs: u64 },

    /// The platform answered with output we cannot interpret
    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    /// Local I/O failed (values files, pipes)
    #[error("IO error: {0}")]
    Io(String),
}

/// Result type for platform operations
pub type PlatformResult<T> = std::result::Result<T, PlatformError>;

impl PlatformError {
    /// Whether the call may succeed when repeated
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            PlatformError::Transient(_) | PlatformError::Unreachable(_) | PlatformError::Timeout { .. }
        )
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, PlatformError::NotFound(_))
    }

    /// Output captured with the failure, if any
    pub fn log_tail(&self) -> Option<&str> {
        match self {
            PlatformError::Rejected { log_tail, .. } => log_tail.as_deref(),
            _ => None,
        }
    }

    pub fn rejected(message: impl Into<String>) -> Self {
        PlatformError::Rejected {
            message: message.into(),
            log_tail: None,
        }
    }
}

impl From<std::io::Error> for PlatformError {
    fn from(err: std::io::Error) -> Self {
        PlatformError::Io(err.to_string())
    }
}

impl From<serde_json::Error> for PlatformError {
    fn from(err: serde_json::Error) -> Self {
        PlatformError::InvalidResponse(err.to_string())
    }
}

const UNREACHABLE_MARKERS: &[&str] = &[
    "unable to connect to the server",
    "connection refused",
    "no such host",
    "kubernetes cluster unreachable",
    "couldn't get current server api group list",
    "no configuration has been provided",
];

const TRANSIENT_MARKERS: &[&str] = &[
    "i/o timeout",
    "tls handshake timeout",
    "context deadline exceeded",
    "etcdserver: request timed out",
    "the object has been modified",
    "too many requests",
    "service unavailable",
    "internal error occurred",
    "connection reset by peer",
    "http2: client connection lost",
];

/// Interpret the output of a failed package-manager query.
///
/// This is the only place raw command output is matched against text;
/// everything above the adapters works on the returned variant.
pub fn classify_failure(program: &str, stdout: &str, stderr: &str) -> PlatformError {
    let lowered = stderr.to_lowercase();
    let message = failure_message(program, stdout, stderr);

    if UNREACHABLE_MARKERS.iter().any(|m| lowered.contains(m)) {
        return PlatformError::Unreachable(message);
    }
    if TRANSIENT_MARKERS.iter().any(|m| lowered.contains(m)) {
        return PlatformError::Transient(message);
    }
    if lowered.contains("not found") {
        return PlatformError::NotFound(message);
    }

    PlatformError::Rejected {
        message,
        log_tail: tail(&format!("{}{}", stdout, stderr), LOG_TAIL_LINES),
    }
}

/// Interpret the output of a failed release install, upgrade or uninstall.
///
/// The release may already be partly applied when the package manager
/// gives up, so every failure is a rejection carrying the output tail,
/// including its own wait deadline expiring.
pub fn classify_release_failure(program: &str, stdout: &str, stderr: &str) -> PlatformError {
    PlatformError::Rejected {
        message: failure_message(program, stdout, stderr),
        log_tail: tail(&format!("{}{}", stdout, stderr), LOG_TAIL_LINES),
    }
}

fn failure_message(program: &str, stdout: &str, stderr: &str) -> String {
    last_meaningful_line(stderr)
        .or_else(|| last_meaningful_line(stdout))
        .unwrap_or_else(|| format!("{} exited unsuccessfully", program))
}

/// Last `lines` lines of `text`, or `None` if it is blank
pub fn tail(text: &str, lines: usize) -> Option<String> {
    let collected: Vec<&str> = text.lines().filter(|l| !l.trim().is_empty()).collect();
    if collected.is_empty() {
        return None;
    }
    let start = collected.len().saturating_sub(lines);
    Some(collected[start..].join("\n"))
}

fn last_meaningful_line(text: &str) -> Option<String> {
    text.lines()
        .rev()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .map(|l| l.trim_start_matches("Error: ").to_string())
}
