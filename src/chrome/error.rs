use std::fmt;

/// Errors from locating, launching, or probing the browser process.
#[derive(Debug)]
pub enum ChromeError {
    /// No browser executable could be located.
    NotFound(String),

    /// The browser process failed to spawn or died during startup.
    LaunchFailed(String),

    /// The browser did not open its debug endpoint within the timeout.
    StartupTimeout {
        /// The CDP port the browser was told to listen on.
        port: u16,
    },

    /// HTTP request to the browser's debug endpoint failed.
    HttpError(String),

    /// A debug-endpoint response could not be parsed.
    ParseError(String),

    /// An I/O error occurred.
    Io(std::io::Error),
}

impl fmt::Display for ChromeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound(msg) => write!(f, "browser not found: {msg}"),
            Self::LaunchFailed(msg) => write!(f, "browser launch failed: {msg}"),
            Self::StartupTimeout { port } => {
                write!(f, "browser did not become ready on port {port}")
            }
            Self::HttpError(msg) => write!(f, "browser endpoint error: {msg}"),
            Self::ParseError(msg) => write!(f, "browser endpoint parse error: {msg}"),
            Self::Io(e) => write!(f, "browser I/O error: {e}"),
        }
    }
}

impl std::error::Error for ChromeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for ChromeError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}
