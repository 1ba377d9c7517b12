use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::router::Router;

// =============================================================================
// Wire format
// =============================================================================

/// One client request: a line of JSON on the stream socket.
#[derive(Debug, Deserialize)]
pub struct IpcRequest {
    pub cmd: String,
    #[serde(default)]
    pub params: Value,
    /// Optional session selector; `None` uses the active session.
    pub target: Option<String>,
}

/// One response line. `data` and `error` are mutually exclusive by
/// construction; `warning` may accompany a success.
#[derive(Debug, Serialize)]
pub struct IpcResponse {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,
}

impl IpcResponse {
    #[must_use]
    pub fn success(data: Value) -> Self {
        Self {
            ok: true,
            data: Some(data),
            error: None,
            warning: None,
        }
    }

    #[must_use]
    pub fn success_with_warning(data: Value, warning: String) -> Self {
        Self {
            ok: true,
            data: Some(data),
            error: None,
            warning: Some(warning),
        }
    }

    #[must_use]
    pub fn failure(error: impl fmt::Display) -> Self {
        Self {
            ok: false,
            data: None,
            error: Some(error.to_string()),
            warning: None,
        }
    }

    fn to_line(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            r#"{"ok":false,"error":"Internal error: response serialization"}"#.to_owned()
        })
    }
}

// =============================================================================
// Socket and pid-file paths
// =============================================================================

/// Runtime directory for the socket and pid file:
/// `$XDG_RUNTIME_DIR/browserd`, falling back to `/tmp/browserd-<uid>`.
#[must_use]
pub fn runtime_dir() -> PathBuf {
    let xdg = std::env::var_os("XDG_RUNTIME_DIR").map(PathBuf::from);
    runtime_dir_from(xdg.as_deref(), uid())
}

/// Testable core of [`runtime_dir`].
fn runtime_dir_from(xdg: Option<&Path>, uid: u32) -> PathBuf {
    match xdg {
        Some(dir) if !dir.as_os_str().is_empty() => dir.join("browserd"),
        _ => std::env::temp_dir().join(format!("browserd-{uid}")),
    }
}

fn uid() -> u32 {
    #[cfg(unix)]
    {
        // SAFETY: getuid has no failure modes.
        unsafe { libc::getuid() }
    }
    #[cfg(not(unix))]
    {
        0
    }
}

/// `browserd.sock` inside the runtime directory.
#[must_use]
pub fn default_socket_path() -> PathBuf {
    runtime_dir().join("browserd.sock")
}

/// The pid file sits next to the socket.
#[must_use]
pub fn pid_file_path(socket: &Path) -> PathBuf {
    socket.with_extension("pid")
}

/// Whether `pid` names a live process (signal-0 probe).
fn pid_alive(pid: u32) -> bool {
    #[cfg(unix)]
    {
        // PID values fit in i32 on all supported platforms.
        #[allow(clippy::cast_possible_wrap)]
        let pid = pid as i32;
        // SAFETY: signal 0 only checks existence.
        unsafe { libc::kill(pid, 0) == 0 }
    }
    #[cfg(not(unix))]
    {
        let _ = pid;
        false
    }
}

// =============================================================================
// Errors
// =============================================================================

/// Errors while bringing up or running the IPC listener.
#[derive(Debug)]
pub enum IpcError {
    /// Another daemon holds the socket.
    AlreadyRunning {
        pid: u32,
    },
    Io(std::io::Error),
}

impl fmt::Display for IpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AlreadyRunning { pid } => {
                write!(f, "daemon already running (pid {pid})")
            }
            Self::Io(e) => write!(f, "IPC socket error: {e}"),
        }
    }
}

impl std::error::Error for IpcError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            Self::AlreadyRunning { .. } => None,
        }
    }
}

impl From<std::io::Error> for IpcError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

// =============================================================================
// Server
// =============================================================================

/// The local command socket: one task per accepted connection, one
/// newline-delimited JSON request per line, one response line per
/// request, in order.
pub struct IpcServer {
    listener: UnixListener,
    socket_path: PathBuf,
    pid_path: PathBuf,
}

impl IpcServer {
    /// Bind the socket and write the pid file.
    ///
    /// A pre-existing socket is stale if its pid file names a dead
    /// process (or is missing); stale files are unlinked and the bind
    /// retried. A live pid aborts startup.
    ///
    /// # Errors
    ///
    /// `IpcError::AlreadyRunning` when another daemon owns the socket,
    /// `IpcError::Io` for directory or bind failures.
    pub fn bind(socket_path: &Path) -> Result<Self, IpcError> {
        if let Some(parent) = socket_path.parent() {
            std::fs::create_dir_all(parent)?;
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                std::fs::set_permissions(parent, std::fs::Permissions::from_mode(0o700))?;
            }
        }

        let pid_path = pid_file_path(socket_path);

        if socket_path.exists() {
            let recorded_pid = std::fs::read_to_string(&pid_path)
                .ok()
                .and_then(|s| s.trim().parse::<u32>().ok());
            match recorded_pid {
                Some(pid) if pid_alive(pid) => {
                    return Err(IpcError::AlreadyRunning { pid });
                }
                _ => {
                    info!(socket = %socket_path.display(), "removing stale socket");
                    let _ = std::fs::remove_file(socket_path);
                    let _ = std::fs::remove_file(&pid_path);
                }
            }
        }

        let listener = UnixListener::bind(socket_path)?;
        std::fs::write(&pid_path, format!("{}\n", std::process::id()))?;
        info!(socket = %socket_path.display(), "IPC socket bound");

        Ok(Self {
            listener,
            socket_path: socket_path.to_path_buf(),
            pid_path,
        })
    }

    /// Accept connections until `shutdown` flips, then drain handlers.
    pub async fn run(&self, router: Arc<Router>, mut shutdown: watch::Receiver<bool>) {
        let mut handlers = JoinSet::new();

        loop {
            tokio::select! {
                () = wait_for_shutdown(&mut shutdown) => break,

                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((stream, _addr)) => {
                            let router = Arc::clone(&router);
                            let shutdown = shutdown.clone();
                            handlers.spawn(handle_connection(stream, router, shutdown));
                        }
                        Err(e) => {
                            warn!(error = %e, "accept failed");
                        }
                    }
                }
            }
        }

        // In-flight responses finish before teardown; handlers observe
        // the same shutdown signal, so this drain is short.
        while handlers.join_next().await.is_some() {}
        info!("IPC server stopped");
    }

    /// Remove the socket and pid file. Called on clean shutdown.
    pub fn cleanup(&self) {
        let _ = std::fs::remove_file(&self.socket_path);
        let _ = std::fs::remove_file(&self.pid_path);
    }

    /// The bound socket path.
    #[must_use]
    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }
}

async fn wait_for_shutdown(shutdown: &mut watch::Receiver<bool>) {
    while !*shutdown.borrow() {
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}

async fn handle_connection(
    stream: UnixStream,
    router: Arc<Router>,
    mut shutdown: watch::Receiver<bool>,
) {
    let (read_half, mut write_half) = stream.into_split();
    let mut lines = BufReader::new(read_half).lines();

    loop {
        let line = tokio::select! {
            () = wait_for_shutdown(&mut shutdown) => break,
            line = lines.next_line() => line,
        };

        let line = match line {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                debug!(error = %e, "connection read failed");
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        let response = match serde_json::from_str::<IpcRequest>(&line) {
            Ok(request) => router.dispatch(request).await,
            Err(e) => IpcResponse::failure(format!("Invalid arguments: malformed request: {e}")),
        };

        let mut payload = response.to_line();
        payload.push('\n');
        if write_half.write_all(payload.as_bytes()).await.is_err() {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn runtime_dir_prefers_xdg() {
        let dir = runtime_dir_from(Some(Path::new("/run/user/1000")), 1000);
        assert_eq!(dir, PathBuf::from("/run/user/1000/browserd"));
    }

    #[test]
    fn runtime_dir_falls_back_to_tmp_with_uid() {
        let dir = runtime_dir_from(None, 1234);
        assert_eq!(dir, std::env::temp_dir().join("browserd-1234"));

        let empty = runtime_dir_from(Some(Path::new("")), 1234);
        assert_eq!(empty, std::env::temp_dir().join("browserd-1234"));
    }

    #[test]
    fn pid_file_sits_next_to_socket() {
        let pid = pid_file_path(Path::new("/run/user/1000/browserd/browserd.sock"));
        assert_eq!(
            pid,
            PathBuf::from("/run/user/1000/browserd/browserd.pid")
        );
    }

    #[test]
    fn request_parses_with_optional_fields() {
        let req: IpcRequest = serde_json::from_str(r#"{"cmd": "status"}"#).unwrap();
        assert_eq!(req.cmd, "status");
        assert_eq!(req.params, Value::Null);
        assert!(req.target.is_none());

        let req: IpcRequest = serde_json::from_str(
            r#"{"cmd": "navigate", "params": {"url": "https://example.com"}, "target": "ab12"}"#,
        )
        .unwrap();
        assert_eq!(req.params["url"], "https://example.com");
        assert_eq!(req.target.as_deref(), Some("ab12"));
    }

    #[test]
    fn response_lines_are_minimal() {
        let ok = IpcResponse::success(json!({"value": 2})).to_line();
        assert_eq!(ok, r#"{"ok":true,"data":{"value":2}}"#);

        let err = IpcResponse::failure("Superseded").to_line();
        assert_eq!(err, r#"{"ok":false,"error":"Superseded"}"#);

        let warned =
            IpcResponse::success_with_warning(json!({}), "element may be overlapped".into())
                .to_line();
        assert!(warned.contains(r#""warning":"element may be overlapped""#));
    }

    #[test]
    fn own_pid_is_alive_and_bogus_pid_is_not() {
        assert!(pid_alive(std::process::id()));
        // PID near the usual pid_max; overwhelmingly unlikely to exist.
        assert!(!pid_alive(4_000_000));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn bind_recovers_a_stale_socket() {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("browserd.sock");

        // A dead daemon left both files behind.
        std::fs::write(&socket, b"").unwrap();
        std::fs::write(pid_file_path(&socket), "4000000\n").unwrap();

        let server = IpcServer::bind(&socket).expect("stale socket must be recovered");
        assert!(socket.exists());
        let recorded: u32 = std::fs::read_to_string(pid_file_path(&socket))
            .unwrap()
            .trim()
            .parse()
            .unwrap();
        assert_eq!(recorded, std::process::id());
        server.cleanup();
        assert!(!socket.exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn bind_refuses_a_live_daemon() {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("browserd.sock");

        std::fs::write(&socket, b"").unwrap();
        // Our own pid is certainly alive.
        std::fs::write(pid_file_path(&socket), format!("{}\n", std::process::id())).unwrap();

        match IpcServer::bind(&socket) {
            Err(IpcError::AlreadyRunning { pid }) => assert_eq!(pid, std::process::id()),
            Err(other) => panic!("expected AlreadyRunning, got {other}"),
            Ok(_) => panic!("bind must refuse a socket held by a live pid"),
        }
    }
}
