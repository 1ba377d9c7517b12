use std::fmt;

use crate::cdp::CdpError;

/// Daemon exit codes.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitCode {
    Success = 0,
    GeneralError = 1,
    LaunchError = 2,
    SocketError = 3,
    TransportLost = 4,
}

impl fmt::Display for ExitCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Success => write!(f, "success"),
            Self::GeneralError => write!(f, "general error"),
            Self::LaunchError => write!(f, "browser launch error"),
            Self::SocketError => write!(f, "socket error"),
            Self::TransportLost => write!(f, "transport lost"),
        }
    }
}

/// The error vocabulary commands produce. The `Display` string is what
/// goes over the IPC wire as `{"ok": false, "error": ...}`.
#[derive(Debug)]
pub enum CommandError {
    /// No session has attached yet.
    BrowserNotReady,

    /// The WebSocket to the browser is gone; the daemon is going down.
    TransportClosed,

    /// A per-command or per-call deadline elapsed.
    Timeout(String),

    /// The daemon is shutting down and abandoned the operation.
    Cancelled,

    /// A newer navigation replaced the one being awaited.
    Superseded,

    /// Error reported by the browser, wrapped with the method that
    /// produced it.
    Cdp {
        method: String,
        code: i64,
        message: String,
    },

    /// A JavaScript evaluation threw.
    Js(String),

    /// Request validation failed.
    InvalidArgs(String),

    /// Selector or target query matched nothing.
    NotFound(String),

    /// Target query matched more than one session.
    Ambiguous {
        query: String,
        /// `id url` pairs for each matching session.
        candidates: Vec<String>,
    },

    /// `Network.getResponseBody` failed for a finalized entry.
    BodyUnavailable(String),

    /// Anything that should not happen.
    Internal(String),
}

impl fmt::Display for CommandError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BrowserNotReady => write!(f, "Browser not ready: no session attached"),
            Self::TransportClosed => write!(f, "Browser connection lost"),
            Self::Timeout(what) => write!(f, "Timeout: {what}"),
            Self::Cancelled => write!(f, "Cancelled"),
            Self::Superseded => write!(f, "Superseded"),
            Self::Cdp {
                method,
                code,
                message,
            } => write!(f, "{method} failed ({code}): {message}"),
            Self::Js(description) => write!(f, "JavaScript error: {description}"),
            Self::InvalidArgs(msg) => write!(f, "Invalid arguments: {msg}"),
            Self::NotFound(what) => write!(f, "{what}"),
            Self::Ambiguous { query, candidates } => {
                write!(f, "Ambiguous target {query:?}: matches ")?;
                write!(f, "{}", candidates.join(", "))
            }
            Self::BodyUnavailable(msg) => write!(f, "Response body unavailable: {msg}"),
            Self::Internal(msg) => write!(f, "Internal error: {msg}"),
        }
    }
}

impl std::error::Error for CommandError {}

impl From<CdpError> for CommandError {
    fn from(e: CdpError) -> Self {
        match e {
            CdpError::CallTimeout { method } => Self::Timeout(method),
            CdpError::Protocol {
                method,
                code,
                message,
            } => Self::Cdp {
                method,
                code,
                message,
            },
            CdpError::TransportClosed | CdpError::Connection(_) | CdpError::ConnectTimeout => {
                Self::TransportClosed
            }
            CdpError::Cancelled => Self::Cancelled,
            CdpError::InvalidResponse(msg) | CdpError::Internal(msg) => Self::Internal(msg),
        }
    }
}
