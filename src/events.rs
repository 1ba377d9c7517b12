use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use tokio::sync::{Semaphore, mpsc};
use tracing::{debug, trace, warn};

use crate::cdp::{CdpClient, CdpEvent};
use crate::session::SessionManager;
use crate::telemetry::{ConsoleBuffer, ConsoleEntry, NetworkBuffer};

/// Concurrent response-body fetches.
const BODY_FETCH_PERMITS: usize = 4;

/// The event demultiplexer: the single consumer of the transport's
/// inbound channel.
///
/// Every event is delivered synchronously to its sinks before the next
/// one is read. Sinks only take short locks; anything that needs a CDP
/// call (body fetches, attaches) is spawned, because a CDP call from
/// this task would deadlock the transport reader behind the bounded
/// event channel.
pub struct EventRouter {
    sessions: Arc<SessionManager>,
    console: Arc<ConsoleBuffer>,
    network: Arc<NetworkBuffer>,
    bodies: BodyFetcher,
}

impl EventRouter {
    #[must_use]
    pub fn new(
        client: CdpClient,
        sessions: Arc<SessionManager>,
        console: Arc<ConsoleBuffer>,
        network: Arc<NetworkBuffer>,
        body_limit: usize,
    ) -> Self {
        let bodies = BodyFetcher {
            client,
            network: Arc::clone(&network),
            permits: Arc::new(Semaphore::new(BODY_FETCH_PERMITS)),
            in_flight: Arc::new(Mutex::new(HashSet::new())),
            body_limit,
        };
        Self {
            sessions,
            console,
            network,
            bodies,
        }
    }

    /// Consume events until the transport closes the channel. Returning
    /// from here means the browser connection is gone.
    pub async fn run(self, mut events: mpsc::Receiver<CdpEvent>) {
        while let Some(event) = events.recv().await {
            self.dispatch(&event);
        }
        debug!("event channel closed, demultiplexer stopping");
    }

    fn dispatch(&self, event: &CdpEvent) {
        let session_id = event.session_id.as_deref();
        match event.method.as_str() {
            // Telemetry sink: console.
            "Runtime.consoleAPICalled" => {
                self.console.push(ConsoleEntry::from_console_api(&event.params));
            }
            "Runtime.exceptionThrown" => {
                self.console.push(ConsoleEntry::from_exception(&event.params));
            }
            "Log.entryAdded" => {
                self.console.push(ConsoleEntry::from_log_entry(&event.params));
            }

            // Telemetry sink: network, three phases.
            "Network.requestWillBeSent" => self.network.begin_request(&event.params),
            "Network.responseReceived" => self.network.record_response(&event.params),
            "Network.dataReceived" => self.network.data_received(&event.params),
            "Network.loadingFinished" => {
                if self.network.finish(&event.params) {
                    if let Some(request_id) = event.params["requestId"].as_str() {
                        self.bodies.spawn_fetch(session_id, request_id);
                    }
                }
            }
            "Network.loadingFailed" => self.network.fail(&event.params),

            // Navigation sink.
            "Page.frameNavigated" => {
                if let Some(sid) = session_id {
                    self.sessions.on_frame_navigated(sid, &event.params);
                }
            }
            "Page.loadEventFired" => {
                if let Some(sid) = session_id {
                    self.sessions.on_load_event(sid);
                }
            }
            "Page.lifecycleEvent" => {
                if let Some(sid) = session_id {
                    self.sessions.on_lifecycle_event(sid, &event.params);
                }
            }
            "Page.frameStartedLoading" => {
                if let Some(sid) = session_id {
                    self.sessions.on_frame_started_loading(sid, &event.params);
                }
            }

            // Session sink. Attachment stays driver-owned; these are
            // observations that keep the registry current.
            "Target.targetCreated" => self.sessions.on_target_created(&event.params),
            "Target.targetDestroyed" => self.sessions.on_target_destroyed(&event.params),
            "Target.targetInfoChanged" | "Target.attachedToTarget" => {
                self.sessions.on_target_info_changed(&event.params);
            }
            "Target.detachedFromTarget" => self.sessions.on_detached(&event.params),

            other => trace!(method = other, "unrouted event"),
        }
    }
}

/// Bounded worker pool for `Network.getResponseBody` calls.
#[derive(Clone)]
struct BodyFetcher {
    client: CdpClient,
    network: Arc<NetworkBuffer>,
    permits: Arc<Semaphore>,
    /// Request ids with a fetch in flight. At most one concurrent
    /// fetch per id.
    in_flight: Arc<Mutex<HashSet<String>>>,
    body_limit: usize,
}

impl BodyFetcher {
    fn spawn_fetch(&self, session_id: Option<&str>, request_id: &str) {
        {
            let mut in_flight = self.in_flight.lock().expect("body fetch set poisoned");
            if !in_flight.insert(request_id.to_owned()) {
                return;
            }
        }

        let fetcher = self.clone();
        let session_id = session_id.map(str::to_owned);
        let request_id = request_id.to_owned();
        tokio::spawn(async move {
            fetcher.fetch(session_id.as_deref(), &request_id).await;
            fetcher
                .in_flight
                .lock()
                .expect("body fetch set poisoned")
                .remove(&request_id);
        });
    }

    async fn fetch(&self, session_id: Option<&str>, request_id: &str) {
        let _permit = match Arc::clone(&self.permits).acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => return,
        };

        let result = self
            .client
            .call(
                session_id,
                "Network.getResponseBody",
                Some(serde_json::json!({"requestId": request_id})),
                None,
            )
            .await;

        match result {
            Ok(value) => {
                let base64 = value["base64Encoded"].as_bool().unwrap_or(false);
                let raw = value["body"].as_str().unwrap_or_default();
                let (body, truncated) = clamp_body(raw, self.body_limit);
                self.network
                    .attach_body(request_id, body.into_owned(), base64, truncated);
            }
            Err(e) => {
                warn!(request_id, error = %e, "response body fetch failed");
                self.network.set_body_error(request_id, &e.to_string());
            }
        }
    }
}

/// Cap a body at `limit` bytes on a char boundary.
fn clamp_body(body: &str, limit: usize) -> (std::borrow::Cow<'_, str>, bool) {
    if body.len() <= limit {
        return (std::borrow::Cow::Borrowed(body), false);
    }
    let mut end = limit;
    while !body.is_char_boundary(end) {
        end -= 1;
    }
    (std::borrow::Cow::Borrowed(&body[..end]), true)
}
