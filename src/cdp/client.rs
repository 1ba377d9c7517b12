use tokio::sync::{mpsc, oneshot};
use tokio::time::{Duration, Instant};
use tracing::warn;

use super::error::CdpError;
use super::transport::{TransportCommand, TransportHandle, spawn_transport};
use super::types::{CdpEvent, CdpRequest};

/// Configuration for the CDP connection.
#[derive(Debug, Clone)]
pub struct CdpConfig {
    /// Timeout for the initial WebSocket handshake (default: 10 s).
    pub connect_timeout: Duration,
    /// Default per-call deadline (default: 30 s). `Duration::ZERO`
    /// disables the deadline entirely.
    pub call_timeout: Duration,
    /// Capacity of the inbound event channel (default: 1024).
    pub event_capacity: usize,
}

impl Default for CdpConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            call_timeout: Duration::from_secs(30),
            event_capacity: 1024,
        }
    }
}

/// Handle for issuing CDP calls over the daemon's single WebSocket.
///
/// Cloning is cheap; all clones share the transport task, its request
/// id counter, and its pending table. Session routing is per call: a
/// `session` argument injects the `sessionId` field for flattened
/// sessions.
#[derive(Debug, Clone)]
pub struct CdpClient {
    handle: TransportHandle,
    config: CdpConfig,
}

impl CdpClient {
    /// Connect to the browser's root debugger endpoint.
    ///
    /// Returns the client and the inbound event stream for the
    /// demultiplexer.
    ///
    /// # Errors
    ///
    /// Returns `CdpError::Connection` or `CdpError::ConnectTimeout` if
    /// the WebSocket cannot be established.
    pub async fn connect(
        url: &str,
        config: CdpConfig,
    ) -> Result<(Self, mpsc::Receiver<CdpEvent>), CdpError> {
        let (handle, event_rx) =
            spawn_transport(url, config.event_capacity, config.connect_timeout).await?;
        Ok((Self { handle, config }, event_rx))
    }

    /// Issue a CDP call and await its response.
    ///
    /// `session` routes the call to a flattened session; `None` targets
    /// the browser. `timeout` overrides the default deadline;
    /// `Some(Duration::ZERO)` waits forever.
    ///
    /// Dropping the returned future abandons the call: the pending
    /// entry stays until the response or deadline arrives, and a late
    /// response is discarded by the transport.
    ///
    /// # Errors
    ///
    /// `CdpError::CallTimeout` when the deadline elapses,
    /// `CdpError::Protocol` when the browser reports an error,
    /// `CdpError::TransportClosed` when the WebSocket is gone, and
    /// `CdpError::Cancelled` when the daemon shut down mid-call.
    pub async fn call(
        &self,
        session: Option<&str>,
        method: &str,
        params: Option<serde_json::Value>,
        timeout: Option<Duration>,
    ) -> Result<serde_json::Value, CdpError> {
        let (response_tx, response_rx) = oneshot::channel();
        self.dispatch(session, method, params, timeout, response_tx)
            .await?;
        response_rx
            .await
            .map_err(|_| CdpError::Internal("transport task exited before responding".into()))?
    }

    /// Fire-and-forget variant of [`call`](Self::call).
    ///
    /// The request id is still reserved and the response still enters
    /// the pending table; a detached task logs late errors instead of
    /// surfacing them.
    ///
    /// # Errors
    ///
    /// Returns `CdpError::TransportClosed` if the transport task has
    /// exited before the request could be handed over.
    pub async fn post(
        &self,
        session: Option<&str>,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<(), CdpError> {
        let (response_tx, response_rx) = oneshot::channel();
        self.dispatch(session, method, params, None, response_tx)
            .await?;

        let method = method.to_owned();
        tokio::spawn(async move {
            if let Ok(Err(e)) = response_rx.await {
                warn!(method, error = %e, "posted CDP call failed");
            }
        });
        Ok(())
    }

    async fn dispatch(
        &self,
        session: Option<&str>,
        method: &str,
        params: Option<serde_json::Value>,
        timeout: Option<Duration>,
        response_tx: oneshot::Sender<Result<serde_json::Value, CdpError>>,
    ) -> Result<(), CdpError> {
        let request = CdpRequest {
            id: self.handle.next_id(),
            method: method.to_owned(),
            params,
            session_id: session.map(str::to_owned),
        };

        let effective = timeout.unwrap_or(self.config.call_timeout);
        let deadline = if effective.is_zero() {
            None
        } else {
            Some(Instant::now() + effective)
        };

        self.handle
            .send(TransportCommand::Call {
                request,
                response_tx,
                deadline,
            })
            .await
    }

    /// Close the WebSocket and stop the transport task.
    ///
    /// # Errors
    ///
    /// Returns `CdpError::TransportClosed` if the task already exited.
    pub async fn shutdown(&self) -> Result<(), CdpError> {
        self.handle.send(TransportCommand::Shutdown).await
    }

    /// Whether the WebSocket is still up.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.handle.is_connected()
    }
}
