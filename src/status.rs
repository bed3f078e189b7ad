//! Poll status codes.
//!
//! A poll run always records an integer status: a real HTTP status when a
//! response was received, a script exit code for legacy programs, or one of
//! a closed set of negative sentinels. Sentinels are distinct and negative so
//! they can never be mistaken for an HTTP status.

use std::fmt;

pub const SCRIPT_TIMEOUT: i64 = -1;
pub const SCRIPT_FAILED: i64 = -2;
pub const SCRIPT_MALFORMED: i64 = -3;
pub const INVALID_DOCUMENT: i64 = -5;
pub const FETCH_TIMEOUT: i64 = -10;
pub const CONNECTION_FAILED: i64 = -20;
pub const TRANSPORT_ERROR: i64 = -30;
pub const UNEXPECTED_ERROR: i64 = -40;
pub const HTTP_STATUS_UNAVAILABLE: i64 = -100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollStatus {
    /// An HTTP response was received (any status, including non-2xx).
    Http(u16),
    /// A legacy script exited with a non-zero code.
    ScriptExit(i32),
    /// A legacy script was killed after exceeding its timeout.
    ScriptTimeout,
    /// A legacy script terminated without an exit code (e.g. by a signal)
    /// or could not be spawned.
    ScriptFailed,
    /// A legacy script exited 0 but its last line is not `r f s`.
    ScriptMalformed,
    /// The source document was fetched but could not be parsed.
    InvalidDocument,
    FetchTimeout,
    ConnectionFailed,
    /// Any other transport error; carries the HTTP status when one is known.
    Transport(Option<u16>),
    /// An HTTP error was reported without a status to extract.
    HttpStatusUnavailable,
    Unexpected,
}

impl PollStatus {
    pub fn code(&self) -> i64 {
        match self {
            PollStatus::Http(code) => i64::from(*code),
            PollStatus::ScriptExit(code) => i64::from(*code),
            PollStatus::ScriptTimeout => SCRIPT_TIMEOUT,
            PollStatus::ScriptFailed => SCRIPT_FAILED,
            PollStatus::ScriptMalformed => SCRIPT_MALFORMED,
            PollStatus::InvalidDocument => INVALID_DOCUMENT,
            PollStatus::FetchTimeout => FETCH_TIMEOUT,
            PollStatus::ConnectionFailed => CONNECTION_FAILED,
            PollStatus::Transport(Some(code)) => i64::from(*code),
            PollStatus::Transport(None) => TRANSPORT_ERROR,
            PollStatus::HttpStatusUnavailable => HTTP_STATUS_UNAVAILABLE,
            PollStatus::Unexpected => UNEXPECTED_ERROR,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, PollStatus::Http(code) if (200..300).contains(code))
    }

    /// Classify a reqwest error into the sentinel taxonomy.
    pub fn from_reqwest(err: &reqwest::Error) -> Self {
        if err.is_timeout() {
            PollStatus::FetchTimeout
        } else if err.is_connect() {
            PollStatus::ConnectionFailed
        } else if err.is_status() {
            match err.status() {
                Some(status) => PollStatus::Transport(Some(status.as_u16())),
                None => PollStatus::HttpStatusUnavailable,
            }
        } else if err.is_request() || err.is_body() || err.is_redirect() || err.is_decode() {
            PollStatus::Transport(None)
        } else {
            PollStatus::Unexpected
        }
    }
}

impl fmt::Display for PollStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PollStatus::Http(code) => write!(f, "http {}", code),
            PollStatus::ScriptExit(code) => write!(f, "script exit {}", code),
            PollStatus::ScriptTimeout => write!(f, "script timeout"),
            PollStatus::ScriptFailed => write!(f, "script failed"),
            PollStatus::ScriptMalformed => write!(f, "script output malformed"),
            PollStatus::InvalidDocument => write!(f, "invalid document"),
            PollStatus::FetchTimeout => write!(f, "fetch timeout"),
            PollStatus::ConnectionFailed => write!(f, "connection failed"),
            PollStatus::Transport(Some(code)) => write!(f, "transport error (http {})", code),
            PollStatus::Transport(None) => write!(f, "transport error"),
            PollStatus::HttpStatusUnavailable => write!(f, "http status unavailable"),
            PollStatus::Unexpected => write!(f, "unexpected error"),
        }
    }
}

/// Human-readable label for a stored status code.
pub fn describe_code(code: i64) -> String {
    let status = match code {
        SCRIPT_TIMEOUT => PollStatus::ScriptTimeout,
        SCRIPT_FAILED => PollStatus::ScriptFailed,
        SCRIPT_MALFORMED => PollStatus::ScriptMalformed,
        INVALID_DOCUMENT => PollStatus::InvalidDocument,
        FETCH_TIMEOUT => PollStatus::FetchTimeout,
        CONNECTION_FAILED => PollStatus::ConnectionFailed,
        TRANSPORT_ERROR => PollStatus::Transport(None),
        UNEXPECTED_ERROR => PollStatus::Unexpected,
        HTTP_STATUS_UNAVAILABLE => PollStatus::HttpStatusUnavailable,
        100..=599 => PollStatus::Http(code as u16),
        _ => return format!("script exit {}", code),
    };
    status.to_string()
}
