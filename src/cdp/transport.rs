use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Duration, Instant};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};

use super::error::CdpError;
use super::types::{CdpEvent, CdpRequest, Inbound, InboundFrame};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Command sent from a client handle to the transport task.
pub enum TransportCommand {
    /// Write a framed request and deliver the correlated response.
    Call {
        request: CdpRequest,
        response_tx: oneshot::Sender<Result<serde_json::Value, CdpError>>,
        /// `None` means the call never times out.
        deadline: Option<Instant>,
    },
    /// Close the WebSocket and stop the task.
    Shutdown,
}

/// An in-flight call awaiting its response.
struct PendingCall {
    response_tx: oneshot::Sender<Result<serde_json::Value, CdpError>>,
    method: String,
    deadline: Option<Instant>,
}

/// Clonable handle to the transport task.
///
/// All writes go through the task's command channel, so the WebSocket
/// only ever has one writer. Request ids come from a shared counter and
/// are never reused within the process.
#[derive(Debug, Clone)]
pub struct TransportHandle {
    command_tx: mpsc::Sender<TransportCommand>,
    connected: Arc<AtomicBool>,
    next_id: Arc<AtomicU64>,
}

impl TransportHandle {
    /// Hand a command to the transport task.
    ///
    /// # Errors
    ///
    /// Returns `CdpError::TransportClosed` if the task has exited.
    pub async fn send(&self, cmd: TransportCommand) -> Result<(), CdpError> {
        self.command_tx
            .send(cmd)
            .await
            .map_err(|_| CdpError::TransportClosed)
    }

    /// Whether the WebSocket is still up.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    /// Allocate the next request id. Strictly monotonic.
    pub fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }
}

/// Connect to the browser's root debugger endpoint and spawn the
/// transport task.
///
/// Returns the command handle and the inbound event stream. The event
/// stream closes when the transport dies, which the daemon treats as
/// fatal — there is no reconnect; a new daemon instance makes a new
/// connection.
///
/// # Errors
///
/// Returns `CdpError::Connection` if the WebSocket handshake fails, or
/// `CdpError::ConnectTimeout` if it exceeds `connect_timeout`.
pub async fn spawn_transport(
    url: &str,
    event_capacity: usize,
    connect_timeout: Duration,
) -> Result<(TransportHandle, mpsc::Receiver<CdpEvent>), CdpError> {
    let ws_stream = connect_ws(url, connect_timeout).await?;
    let connected = Arc::new(AtomicBool::new(true));
    let (command_tx, command_rx) = mpsc::channel(256);
    let (event_tx, event_rx) = mpsc::channel(event_capacity);

    let handle = TransportHandle {
        command_tx,
        connected: Arc::clone(&connected),
        next_id: Arc::new(AtomicU64::new(1)),
    };

    tokio::spawn(async move {
        let mut task = TransportTask {
            ws_stream,
            command_rx,
            event_tx,
            pending: HashMap::new(),
            connected,
        };
        task.run().await;
    });

    Ok((handle, event_rx))
}

async fn connect_ws(url: &str, timeout: Duration) -> Result<WsStream, CdpError> {
    match tokio::time::timeout(timeout, tokio_tungstenite::connect_async(url)).await {
        Ok(Ok((stream, _response))) => Ok(stream),
        Ok(Err(e)) => Err(CdpError::Connection(e.to_string())),
        Err(_) => Err(CdpError::ConnectTimeout),
    }
}

/// The task that owns the WebSocket.
struct TransportTask {
    ws_stream: WsStream,
    command_rx: mpsc::Receiver<TransportCommand>,
    event_tx: mpsc::Sender<CdpEvent>,
    pending: HashMap<u64, PendingCall>,
    connected: Arc<AtomicBool>,
}

impl TransportTask {
    async fn run(&mut self) {
        loop {
            let next_deadline = self.earliest_deadline();
            let deadline_sleep = async {
                if let Some(deadline) = next_deadline {
                    tokio::time::sleep_until(deadline).await;
                } else {
                    std::future::pending::<()>().await;
                }
            };

            tokio::select! {
                ws_msg = self.ws_stream.next() => {
                    match ws_msg {
                        Some(Ok(Message::Text(text))) => {
                            if !self.handle_frame(&text).await {
                                // Demultiplexer gone: the daemon is
                                // tearing down around us.
                                self.teardown(&CdpError::Cancelled);
                                return;
                            }
                        }
                        Some(Ok(Message::Close(_)) | Err(_)) | None => {
                            self.teardown(&CdpError::TransportClosed);
                            return;
                        }
                        Some(Ok(_)) => {
                            // Binary, Ping, Pong, Frame — ignore
                        }
                    }
                }

                cmd = self.command_rx.recv() => {
                    match cmd {
                        Some(TransportCommand::Call { request, response_tx, deadline }) => {
                            if !self.handle_call(request, response_tx, deadline).await {
                                return;
                            }
                        }
                        Some(TransportCommand::Shutdown) | None => {
                            self.teardown(&CdpError::Cancelled);
                            let _ = self.ws_stream.close(None).await;
                            return;
                        }
                    }
                }

                () = deadline_sleep => {
                    self.sweep_deadlines();
                }
            }
        }
    }

    /// Decode and route one inbound frame. Returns `false` when the
    /// event channel is gone and the task should stop.
    async fn handle_frame(&mut self, text: &str) -> bool {
        let frame: InboundFrame = match serde_json::from_str(text) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(error = %e, "dropping undecodable CDP frame");
                return true;
            }
        };

        match frame.classify() {
            Some(Inbound::Response(response)) => {
                if let Some(pending) = self.pending.remove(&response.id) {
                    let result = response.result.map_err(|payload| CdpError::Protocol {
                        method: pending.method.clone(),
                        code: payload.code,
                        message: payload.message,
                    });
                    // A dropped receiver means the caller was cancelled;
                    // the response is simply discarded.
                    let _ = pending.response_tx.send(result);
                } else {
                    // Late response after timeout/cancel, or a frame the
                    // browser invented. Protocol anomaly, not fatal.
                    warn!(id = response.id, "response for unknown request id");
                }
                true
            }
            Some(Inbound::Event(event)) => {
                // The demultiplexer never issues CDP calls inline, so a
                // bounded send here cannot deadlock; it only applies
                // backpressure to the reader.
                self.event_tx.send(event).await.is_ok()
            }
            None => {
                debug!("unclassifiable CDP frame");
                true
            }
        }
    }

    /// Frame and write one request. Returns `false` on write failure,
    /// which tears the transport down.
    async fn handle_call(
        &mut self,
        request: CdpRequest,
        response_tx: oneshot::Sender<Result<serde_json::Value, CdpError>>,
        deadline: Option<Instant>,
    ) -> bool {
        let id = request.id;
        let method = request.method.clone();

        let json = match serde_json::to_string(&request) {
            Ok(j) => j,
            Err(e) => {
                let _ = response_tx.send(Err(CdpError::Internal(format!(
                    "request serialization: {e}"
                ))));
                return true;
            }
        };

        if let Err(e) = self.ws_stream.send(Message::Text(json.into())).await {
            warn!(error = %e, method, "WebSocket write failed");
            let _ = response_tx.send(Err(CdpError::TransportClosed));
            self.teardown(&CdpError::TransportClosed);
            return false;
        }

        self.pending.insert(
            id,
            PendingCall {
                response_tx,
                method,
                deadline,
            },
        );
        true
    }

    fn earliest_deadline(&self) -> Option<Instant> {
        self.pending.values().filter_map(|p| p.deadline).min()
    }

    fn sweep_deadlines(&mut self) {
        let now = Instant::now();
        let expired: Vec<u64> = self
            .pending
            .iter()
            .filter(|(_, p)| p.deadline.is_some_and(|d| d <= now))
            .map(|(&id, _)| id)
            .collect();

        for id in expired {
            if let Some(pending) = self.pending.remove(&id) {
                let _ = pending.response_tx.send(Err(CdpError::CallTimeout {
                    method: pending.method,
                }));
            }
        }
    }

    /// Complete every pending call with `error` and mark the handle
    /// disconnected. The event channel closes when the task drops.
    fn teardown(&mut self, error: &CdpError) {
        self.connected.store(false, Ordering::Relaxed);
        let pending = std::mem::take(&mut self.pending);
        for (_, call) in pending {
            let _ = call.response_tx.send(Err(error.clone()));
        }
    }
}
