use std::fmt;

/// Errors produced by the CDP transport and correlator.
#[derive(Debug, Clone)]
pub enum CdpError {
    /// WebSocket connection could not be established.
    Connection(String),

    /// Connection attempt exceeded the configured timeout.
    ConnectTimeout,

    /// A call did not receive a response before its deadline.
    CallTimeout {
        /// The CDP method that timed out.
        method: String,
    },

    /// The browser answered with a protocol-level error.
    Protocol {
        /// Originating CDP method.
        method: String,
        /// CDP error code (e.g., -32000).
        code: i64,
        /// Error message verbatim from the browser.
        message: String,
    },

    /// The WebSocket is gone. Pending calls complete with this; the
    /// daemon treats it as fatal (there is no reconnect).
    TransportClosed,

    /// The call was abandoned because the daemon is shutting down.
    Cancelled,

    /// A frame from the browser could not be interpreted.
    InvalidResponse(String),

    /// Transport task died or an internal channel closed.
    Internal(String),
}

impl fmt::Display for CdpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connection(msg) => write!(f, "CDP connection error: {msg}"),
            Self::ConnectTimeout => write!(f, "CDP connection timed out"),
            Self::CallTimeout { method } => write!(f, "CDP call timed out: {method}"),
            Self::Protocol {
                method,
                code,
                message,
            } => write!(f, "CDP error from {method} ({code}): {message}"),
            Self::TransportClosed => write!(f, "CDP transport closed"),
            Self::Cancelled => write!(f, "CDP call cancelled"),
            Self::InvalidResponse(msg) => write!(f, "CDP invalid response: {msg}"),
            Self::Internal(msg) => write!(f, "CDP internal error: {msg}"),
        }
    }
}

impl std::error::Error for CdpError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_call_timeout_names_method() {
        let err = CdpError::CallTimeout {
            method: "Runtime.evaluate".into(),
        };
        assert_eq!(err.to_string(), "CDP call timed out: Runtime.evaluate");
    }

    #[test]
    fn display_protocol_names_method_and_code() {
        let err = CdpError::Protocol {
            method: "DOM.querySelector".into(),
            code: -32000,
            message: "Could not find node".into(),
        };
        assert_eq!(
            err.to_string(),
            "CDP error from DOM.querySelector (-32000): Could not find node"
        );
    }

    #[test]
    fn display_transport_closed() {
        assert_eq!(
            CdpError::TransportClosed.to_string(),
            "CDP transport closed"
        );
    }

    #[test]
    fn error_trait_source_is_none() {
        let err: &dyn std::error::Error = &CdpError::Cancelled;
        assert!(err.source().is_none());
    }
}
