use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::cdp::{CdpClient, CdpConfig, CdpError};
use crate::chrome::{
    Channel, ChromeError, LaunchSpec, launch_browser, locate_browser, pick_cdp_port, query_version,
};
use crate::config::Settings;
use crate::error::{CommandError, ExitCode};
use crate::events::EventRouter;
use crate::ipc::{IpcError, IpcServer, default_socket_path};
use crate::router::Router;
use crate::session::SessionManager;
use crate::telemetry::{ConsoleBuffer, NetworkBuffer};

/// How long the browser gets to open its debug endpoint.
const BROWSER_STARTUP_TIMEOUT: Duration = Duration::from_secs(30);

/// Deadline for the polite `Browser.close` during teardown.
const BROWSER_CLOSE_TIMEOUT: Duration = Duration::from_secs(3);

/// Errors that keep the daemon from starting.
#[derive(Debug)]
pub enum DaemonError {
    Chrome(ChromeError),
    Cdp(CdpError),
    Ipc(IpcError),
    Startup(String),
}

impl DaemonError {
    /// The process exit code this failure maps to.
    #[must_use]
    pub fn exit_code(&self) -> ExitCode {
        match self {
            Self::Chrome(_) | Self::Cdp(_) => ExitCode::LaunchError,
            Self::Ipc(_) => ExitCode::SocketError,
            Self::Startup(_) => ExitCode::GeneralError,
        }
    }
}

impl fmt::Display for DaemonError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Chrome(e) => write!(f, "{e}"),
            Self::Cdp(e) => write!(f, "{e}"),
            Self::Ipc(e) => write!(f, "{e}"),
            Self::Startup(msg) => write!(f, "startup failed: {msg}"),
        }
    }
}

impl std::error::Error for DaemonError {}

impl From<ChromeError> for DaemonError {
    fn from(e: ChromeError) -> Self {
        Self::Chrome(e)
    }
}

impl From<CdpError> for DaemonError {
    fn from(e: CdpError) -> Self {
        Self::Cdp(e)
    }
}

impl From<IpcError> for DaemonError {
    fn from(e: IpcError) -> Self {
        Self::Ipc(e)
    }
}

/// Shared state every command handler sees.
///
/// The daemon owns the browser process, the transport, the session
/// registry, and both telemetry rings; handlers borrow them through
/// this context.
pub struct DaemonContext {
    pub client: CdpClient,
    pub sessions: Arc<SessionManager>,
    pub console: Arc<ConsoleBuffer>,
    pub network: Arc<NetworkBuffer>,
    pub settings: Settings,
    pub started_at: Instant,
    shutdown_tx: watch::Sender<bool>,
}

impl DaemonContext {
    /// Ask the daemon to shut down (the `shutdown` command). The
    /// response for the current request is still written before the
    /// IPC server drains.
    pub fn request_shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// A receiver that flips to `true` once shutdown begins.
    #[must_use]
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    /// Build a context around an existing client and settings. The
    /// integration tests use this to assemble a daemon against a mock
    /// browser endpoint.
    #[must_use]
    pub fn assemble(client: CdpClient, sessions: Arc<SessionManager>, settings: Settings) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            client,
            sessions,
            console: Arc::new(ConsoleBuffer::new(settings.console_capacity)),
            network: Arc::new(NetworkBuffer::new(settings.network_capacity)),
            settings,
            started_at: Instant::now(),
            shutdown_tx,
        }
    }
}

/// Why the main loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StopReason {
    Signal,
    Command,
    TransportLoss,
}

/// Run the daemon to completion: launch the browser, wire up the CDP
/// engine, serve IPC commands, and tear everything down in reverse
/// dependency order.
///
/// # Errors
///
/// Returns a `DaemonError` when the browser cannot be launched, the
/// transport cannot connect, or the socket cannot be bound.
pub async fn run(settings: Settings) -> Result<ExitCode, DaemonError> {
    // Browser process.
    let executable = match &settings.executable {
        Some(path) => path.clone(),
        None => {
            let channel = Channel::parse(&settings.channel).ok_or_else(|| {
                DaemonError::Startup(format!("unknown channel {:?}", settings.channel))
            })?;
            locate_browser(channel, None)?
        }
    };
    let port = pick_cdp_port()?;
    let mut browser = launch_browser(
        LaunchSpec {
            executable,
            port,
            headless: settings.headless,
            extra_args: settings.extra_args.clone(),
        },
        BROWSER_STARTUP_TIMEOUT,
    )
    .await?;

    // Transport.
    let version = query_version("127.0.0.1", port).await?;
    info!(browser = %version.browser, protocol = %version.protocol_version, "connecting");
    let cdp_config = CdpConfig {
        call_timeout: settings.call_timeout,
        ..CdpConfig::default()
    };
    let (client, events) = CdpClient::connect(&version.ws_debugger_url, cdp_config).await?;

    // Engine state.
    let sessions = SessionManager::new(client.clone());
    let console = Arc::new(ConsoleBuffer::new(settings.console_capacity));
    let network = Arc::new(NetworkBuffer::new(settings.network_capacity));

    let demux = EventRouter::new(
        client.clone(),
        Arc::clone(&sessions),
        Arc::clone(&console),
        Arc::clone(&network),
        settings.body_limit,
    );
    let mut demux_task = tokio::spawn(demux.run(events));

    sessions.start_discovery().await.map_err(|e| match e {
        CommandError::TransportClosed => DaemonError::Cdp(CdpError::TransportClosed),
        other => DaemonError::Startup(other.to_string()),
    })?;

    // IPC surface.
    let socket_path = settings
        .socket
        .clone()
        .unwrap_or_else(default_socket_path);
    let server = Arc::new(IpcServer::bind(&socket_path)?);

    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
    let ctx = Arc::new(DaemonContext {
        client: client.clone(),
        sessions: Arc::clone(&sessions),
        console,
        network,
        settings,
        started_at: Instant::now(),
        shutdown_tx,
    });
    let router = Arc::new(Router::new(Arc::clone(&ctx)));

    let ipc_task = {
        let server = Arc::clone(&server);
        let router = Arc::clone(&router);
        let shutdown_rx = ctx.shutdown_signal();
        tokio::spawn(async move { server.run(router, shutdown_rx).await })
    };

    info!(socket = %socket_path.display(), pid = std::process::id(), "daemon ready");

    // Main loop: wait for a stop condition.
    let reason = wait_for_stop(&mut shutdown_rx, &mut demux_task).await;
    info!(?reason, "shutting down");

    // Teardown, reverse dependency order: stop accepting and drain IPC
    // handlers first so in-flight responses are written, then close the
    // browser, then the transport, then the process and files.
    ctx.request_shutdown();
    let _ = ipc_task.await;

    sessions.cancel_all_waiters();

    if reason == StopReason::TransportLoss {
        warn!("browser connection lost, skipping Browser.close");
    } else {
        if let Err(e) = client
            .call(None, "Browser.close", None, Some(BROWSER_CLOSE_TIMEOUT))
            .await
        {
            warn!(error = %e, "Browser.close failed");
        }
        let _ = client.shutdown().await;
        demux_task.abort();
    }

    browser.shutdown();
    server.cleanup();

    Ok(match reason {
        StopReason::TransportLoss => ExitCode::TransportLost,
        StopReason::Signal | StopReason::Command => ExitCode::Success,
    })
}

/// Park until a signal, a `shutdown` command, or transport loss.
async fn wait_for_stop(
    shutdown_rx: &mut watch::Receiver<bool>,
    demux_task: &mut tokio::task::JoinHandle<()>,
) -> StopReason {
    let signals = shutdown_signals();
    tokio::pin!(signals);

    loop {
        tokio::select! {
            () = &mut signals => return StopReason::Signal,

            changed = shutdown_rx.changed() => {
                match changed {
                    Ok(()) if *shutdown_rx.borrow() => return StopReason::Command,
                    Ok(()) => {}
                    Err(_) => return StopReason::Command,
                }
            }

            result = &mut *demux_task => {
                if let Err(e) = result {
                    error!(error = %e, "demultiplexer task failed");
                }
                return StopReason::TransportLoss;
            }
        }
    }
}

/// Resolves on SIGINT or SIGTERM.
async fn shutdown_signals() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(s) => s,
            Err(e) => {
                error!(error = %e, "SIGTERM handler failed, falling back to ctrl-c");
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
