//! Error types for the task platform channel.

use std::fmt;
use std::time::Duration;

/// Category of a channel failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelErrorKind {
    /// The platform answered with a status other than 200/204
    Status,
    /// No answer within the configured bound
    Timeout,
    /// TCP/TLS connection could not be established
    Connect,
    /// A 200 body that is not a task
    Decode,
    /// Any other transport failure
    Request,
}

impl fmt::Display for ChannelErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelErrorKind::Status => write!(f, "status"),
            ChannelErrorKind::Timeout => write!(f, "timeout"),
            ChannelErrorKind::Connect => write!(f, "connect"),
            ChannelErrorKind::Decode => write!(f, "decode"),
            ChannelErrorKind::Request => write!(f, "request"),
        }
    }
}

/// Failure talking to the task platform.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct ChannelError {
    pub kind: ChannelErrorKind,
    pub message: String,
    /// HTTP status, when the platform answered at all
    pub status: Option<u16>,
}

impl ChannelError {
    pub fn status(code: u16, body: &str) -> Self {
        let body = body.trim();
        let message = if body.is_empty() {
            format!("server responded with status {}", code)
        } else {
            format!("server responded with status {}: {}", code, truncate(body, 200))
        };
        Self {
            kind: ChannelErrorKind::Status,
            message,
            status: Some(code),
        }
    }

    pub fn timeout(after: Duration) -> Self {
        Self {
            kind: ChannelErrorKind::Timeout,
            message: format!("no response within {:?}", after),
            status: None,
        }
    }

    pub fn decode(message: impl Into<String>) -> Self {
        Self {
            kind: ChannelErrorKind::Decode,
            message: message.into(),
            status: None,
        }
    }

    /// Classify a reqwest error.
    pub fn from_reqwest(e: &reqwest::Error, timeout: Duration) -> Self {
        if e.is_timeout() {
            Self::timeout(timeout)
        } else if e.is_connect() {
            Self {
                kind: ChannelErrorKind::Connect,
                message: format!("connection failed: {}", e),
                status: None,
            }
        } else {
            Self {
                kind: ChannelErrorKind::Request,
                message: format!("request failed: {}", e),
                status: e.status().map(|s| s.as_u16()),
            }
        }
    }
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}
