use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use serde::Serialize;
use serde_json::{Value, json};
use tokio::sync::{Notify, oneshot, watch};
use tracing::{debug, info, warn};

use crate::cdp::CdpClient;
use crate::error::CommandError;

/// The domains enabled for every new session right after attach.
///
/// `Network` is deliberately absent: enabling it at attach time makes
/// the browser hold CDP replies until a `networkIdle` lifecycle event,
/// which a slow favicon or failing subresource can delay by tens of
/// seconds. `Network` is enabled lazily by the first command that
/// needs it.
const ATTACH_DOMAINS: [&str; 3] = ["Runtime", "Page", "DOM"];

/// Why a navigation wait ended without a load event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NavAbort {
    /// A newer navigation replaced this one.
    Superseded,
    /// The daemon is shutting down or the session went away.
    Cancelled,
}

impl From<NavAbort> for CommandError {
    fn from(abort: NavAbort) -> Self {
        match abort {
            NavAbort::Superseded => Self::Superseded,
            NavAbort::Cancelled => Self::Cancelled,
        }
    }
}

/// Per-session record of an in-progress navigation and its waiter.
#[derive(Debug, Default)]
struct NavigationState {
    in_flight: bool,
    frame_id: Option<String>,
    waiter: Option<oneshot::Sender<Result<(), NavAbort>>>,
}

/// A flattened CDP session bound to one page target.
struct Session {
    session_id: String,
    target_id: String,
    url: String,
    title: String,
    attach_seq: u64,
    enabled_domains: HashSet<String>,
    /// Domains with an enable call in flight; waiters park on the
    /// receiver and re-check once the sender side resolves.
    enabling: HashMap<String, watch::Receiver<()>>,
    navigation: NavigationState,
    /// Fires on every load event; `ready` page-load waits park here.
    load_signal: Arc<Notify>,
}

/// Serializable session summary for `status` and `target` output.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub id: String,
    pub target_id: String,
    pub url: String,
    pub title: String,
    pub active: bool,
}

/// A page target as seen in discovery events and enumeration.
#[derive(Debug, Clone)]
pub struct TargetSummary {
    pub target_id: String,
    pub url: String,
    pub title: String,
}

impl TargetSummary {
    /// Extract a page target from a CDP `targetInfo` object. Returns
    /// `None` for workers, extensions, and other non-page targets.
    #[must_use]
    pub fn from_target_info(info: &Value) -> Option<Self> {
        if info["type"].as_str()? != "page" {
            return None;
        }
        Some(Self {
            target_id: info["targetId"].as_str()?.to_owned(),
            url: info["url"].as_str().unwrap_or_default().to_owned(),
            title: info["title"].as_str().unwrap_or_default().to_owned(),
        })
    }
}

#[derive(Default)]
struct Registry {
    sessions: HashMap<String, Session>,
    by_target: HashMap<String, String>,
    /// Targets with an attach in flight. Guards against the
    /// create-event/enumeration double-attach race.
    attaching: HashSet<String>,
    active: Option<String>,
    next_attach_seq: u64,
}

/// Authoritative owner of CDP sessions.
///
/// Discovery events are observation-only; this manager drives every
/// `Target.attachToTarget` itself (flattened), deduplicating attempts
/// per target. Exactly one session is active at a time; commands
/// without an explicit target use it.
pub struct SessionManager {
    client: CdpClient,
    inner: Mutex<Registry>,
    /// Handle to ourselves for spawning attach tasks from sync event
    /// sinks.
    self_ref: Weak<SessionManager>,
}

impl SessionManager {
    #[must_use]
    pub fn new(client: CdpClient) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            client,
            inner: Mutex::new(Registry::default()),
            self_ref: weak.clone(),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Registry> {
        self.inner.lock().expect("session registry poisoned")
    }

    // =========================================================================
    // Discovery and attachment
    // =========================================================================

    /// Turn on target discovery and attach to every existing page
    /// target. Attach calls run as separate tasks because their
    /// responses may be serialized behind the discovery response.
    ///
    /// # Errors
    ///
    /// Returns the underlying CDP error if discovery cannot be enabled
    /// or the initial enumeration fails.
    pub async fn start_discovery(&self) -> Result<(), CommandError> {
        self.client
            .call(
                None,
                "Target.setDiscoverTargets",
                Some(json!({"discover": true})),
                None,
            )
            .await?;

        let result = self.client.call(None, "Target.getTargets", None, None).await?;
        if let Some(infos) = result["targetInfos"].as_array() {
            for info in infos {
                if let Some(target) = TargetSummary::from_target_info(info) {
                    self.maybe_attach(target);
                }
            }
        }
        Ok(())
    }

    /// Spawn an attach task for `target` unless one already ran or is
    /// running. Safe to call from the event path: nothing here blocks.
    pub fn maybe_attach(&self, target: TargetSummary) {
        {
            let mut reg = self.lock();
            if reg.by_target.contains_key(&target.target_id)
                || !reg.attaching.insert(target.target_id.clone())
            {
                return;
            }
        }

        let Some(manager) = self.self_ref.upgrade() else {
            return;
        };
        tokio::spawn(async move {
            manager.attach(target).await;
        });
    }

    async fn attach(self: Arc<Self>, target: TargetSummary) {
        let result = self
            .client
            .call(
                None,
                "Target.attachToTarget",
                Some(json!({"targetId": target.target_id, "flatten": true})),
                None,
            )
            .await;

        let session_id = match result {
            Ok(value) => match value["sessionId"].as_str() {
                Some(id) => id.to_owned(),
                None => {
                    warn!(target = %target.target_id, "attach response missing sessionId");
                    self.lock().attaching.remove(&target.target_id);
                    return;
                }
            },
            Err(e) => {
                warn!(target = %target.target_id, error = %e, "attach failed");
                self.lock().attaching.remove(&target.target_id);
                return;
            }
        };

        {
            let mut reg = self.lock();
            reg.attaching.remove(&target.target_id);
            let attach_seq = reg.next_attach_seq;
            reg.next_attach_seq += 1;
            reg.by_target
                .insert(target.target_id.clone(), session_id.clone());
            reg.sessions.insert(
                session_id.clone(),
                Session {
                    session_id: session_id.clone(),
                    target_id: target.target_id.clone(),
                    url: target.url.clone(),
                    title: target.title.clone(),
                    attach_seq,
                    enabled_domains: HashSet::new(),
                    enabling: HashMap::new(),
                    navigation: NavigationState::default(),
                    load_signal: Arc::new(Notify::new()),
                },
            );
            if reg.active.is_none() {
                reg.active = Some(session_id.clone());
            }
        }

        info!(session = %session_id, target = %target.target_id, url = %target.url, "session attached");

        // Minimal domain set. Network is intentionally not here.
        for domain in ATTACH_DOMAINS {
            if let Err(e) = self.ensure_domain(&session_id, domain).await {
                warn!(session = %session_id, domain, error = %e, "domain enable failed");
            }
        }
    }

    // =========================================================================
    // Lazy domain enablement
    // =========================================================================

    /// Enable a CDP domain for a session exactly once.
    ///
    /// Idempotent and single-flight: concurrent callers converge on one
    /// `<domain>.enable` call; later callers return immediately. No
    /// lock is held across the CDP await.
    ///
    /// # Errors
    ///
    /// Returns `CommandError::NotFound` if the session is gone, or the
    /// translated CDP error if the enable call fails.
    pub async fn ensure_domain(&self, session_id: &str, domain: &str) -> Result<(), CommandError> {
        let _guard_tx = loop {
            let pending_rx = {
                let mut reg = self.lock();
                let session = reg
                    .sessions
                    .get_mut(session_id)
                    .ok_or_else(|| CommandError::NotFound(format!("No session {session_id}")))?;
                if session.enabled_domains.contains(domain) {
                    return Ok(());
                }
                match session.enabling.get(domain) {
                    Some(rx) => rx.clone(),
                    None => {
                        let (tx, rx) = watch::channel(());
                        session.enabling.insert(domain.to_owned(), rx);
                        break tx;
                    }
                }
            };

            // Another caller owns the enable; wait for it to resolve
            // either way, then re-check the registry.
            let mut rx = pending_rx;
            let _ = rx.changed().await;
        };

        let result = self
            .client
            .call(Some(session_id), &format!("{domain}.enable"), None, None)
            .await;

        {
            let mut reg = self.lock();
            if let Some(session) = reg.sessions.get_mut(session_id) {
                session.enabling.remove(domain);
                if result.is_ok() {
                    session.enabled_domains.insert(domain.to_owned());
                }
            }
        }
        // Dropping the sender wakes parked callers via the closed
        // channel; they re-check and either return or retry.

        result.map(|_| ()).map_err(CommandError::from)
    }

    /// Whether a domain is already enabled (test and status surface).
    #[must_use]
    pub fn domain_enabled(&self, session_id: &str, domain: &str) -> bool {
        self.lock()
            .sessions
            .get(session_id)
            .is_some_and(|s| s.enabled_domains.contains(domain))
    }

    // =========================================================================
    // Event sinks (called from the demultiplexer; must not block)
    // =========================================================================

    pub fn on_target_created(&self, params: &Value) {
        if let Some(target) = TargetSummary::from_target_info(&params["targetInfo"]) {
            debug!(target = %target.target_id, url = %target.url, "target created");
            self.maybe_attach(target);
        }
    }

    pub fn on_target_destroyed(&self, params: &Value) {
        let Some(target_id) = params["targetId"].as_str() else {
            return;
        };
        let mut reg = self.lock();
        reg.attaching.remove(target_id);
        let Some(session_id) = reg.by_target.remove(target_id) else {
            return;
        };
        if let Some(mut session) = reg.sessions.remove(&session_id) {
            if let Some(waiter) = session.navigation.waiter.take() {
                let _ = waiter.send(Err(NavAbort::Cancelled));
            }
        }
        if reg.active.as_deref() == Some(&session_id) {
            reg.active = oldest_session(&reg.sessions);
            debug!(promoted = ?reg.active, "active session destroyed");
        }
        info!(session = %session_id, target = %target_id, "session gone");
    }

    pub fn on_target_info_changed(&self, params: &Value) {
        let info = &params["targetInfo"];
        let Some(target_id) = info["targetId"].as_str() else {
            return;
        };
        let mut reg = self.lock();
        let Some(session_id) = reg.by_target.get(target_id).cloned() else {
            return;
        };
        if let Some(session) = reg.sessions.get_mut(&session_id) {
            if let Some(url) = info["url"].as_str() {
                session.url = url.to_owned();
            }
            if let Some(title) = info["title"].as_str() {
                session.title = title.to_owned();
            }
        }
    }

    /// `Target.attachedToTarget` / `Target.detachedFromTarget` are
    /// observation-only: attachment is driven by this manager, but a
    /// browser-initiated detach still tears the session down.
    pub fn on_detached(&self, params: &Value) {
        let Some(session_id) = params["sessionId"].as_str() else {
            return;
        };
        let mut reg = self.lock();
        let Some(mut session) = reg.sessions.remove(session_id) else {
            return;
        };
        reg.by_target.remove(&session.target_id);
        if let Some(waiter) = session.navigation.waiter.take() {
            let _ = waiter.send(Err(NavAbort::Cancelled));
        }
        if reg.active.as_deref() == Some(session_id) {
            reg.active = oldest_session(&reg.sessions);
        }
        info!(session = %session_id, "session detached by browser");
    }

    pub fn on_frame_navigated(&self, session_id: &str, params: &Value) {
        let frame = &params["frame"];
        // Only the main frame (no parent) updates the session URL.
        if frame.get("parentId").and_then(Value::as_str).is_some() {
            return;
        }
        let mut reg = self.lock();
        if let Some(session) = reg.sessions.get_mut(session_id) {
            if let Some(url) = frame["url"].as_str() {
                session.url = url.to_owned();
            }
            if let Some(frame_id) = frame["id"].as_str() {
                session.navigation.frame_id = Some(frame_id.to_owned());
            }
        }
    }

    pub fn on_frame_started_loading(&self, session_id: &str, params: &Value) {
        let mut reg = self.lock();
        if let Some(session) = reg.sessions.get_mut(session_id) {
            let main_frame = session.navigation.frame_id.as_deref();
            let event_frame = params["frameId"].as_str();
            if main_frame.is_none() || main_frame == event_frame {
                session.navigation.in_flight = true;
            }
        }
    }

    /// `Page.loadEventFired`: complete at most one navigation waiter
    /// and wake every `ready` page-load parker.
    pub fn on_load_event(&self, session_id: &str) {
        let (waiter, signal) = {
            let mut reg = self.lock();
            let Some(session) = reg.sessions.get_mut(session_id) else {
                return;
            };
            session.navigation.in_flight = false;
            (
                session.navigation.waiter.take(),
                Arc::clone(&session.load_signal),
            )
        };
        if let Some(waiter) = waiter {
            let _ = waiter.send(Ok(()));
        }
        signal.notify_waiters();
    }

    pub fn on_lifecycle_event(&self, session_id: &str, params: &Value) {
        // Lifecycle events only flow when a client enabled them; treat
        // the "load" milestone like the load event for robustness.
        if params["name"].as_str() == Some("load") {
            self.on_load_event(session_id);
        }
    }

    // =========================================================================
    // Navigation coordination
    // =========================================================================

    /// Mark a navigation as started and optionally install a waiter for
    /// the next load event. A waiter already present is superseded.
    ///
    /// # Errors
    ///
    /// Returns `CommandError::NotFound` if the session is gone.
    pub fn arm_navigation(
        &self,
        session_id: &str,
        wait: bool,
    ) -> Result<Option<oneshot::Receiver<Result<(), NavAbort>>>, CommandError> {
        let mut reg = self.lock();
        let session = reg
            .sessions
            .get_mut(session_id)
            .ok_or_else(|| CommandError::NotFound(format!("No session {session_id}")))?;

        if let Some(previous) = session.navigation.waiter.take() {
            let _ = previous.send(Err(NavAbort::Superseded));
        }
        session.navigation.in_flight = true;

        if wait {
            let (tx, rx) = oneshot::channel();
            session.navigation.waiter = Some(tx);
            Ok(Some(rx))
        } else {
            Ok(None)
        }
    }

    /// Record the main frame id returned by `Page.navigate`.
    pub fn set_frame_id(&self, session_id: &str, frame_id: &str) {
        let mut reg = self.lock();
        if let Some(session) = reg.sessions.get_mut(session_id) {
            session.navigation.frame_id = Some(frame_id.to_owned());
        }
    }

    /// The load-event signal for `ready` page-load waits.
    ///
    /// # Errors
    ///
    /// Returns `CommandError::NotFound` if the session is gone.
    pub fn load_signal(&self, session_id: &str) -> Result<Arc<Notify>, CommandError> {
        self.lock()
            .sessions
            .get(session_id)
            .map(|s| Arc::clone(&s.load_signal))
            .ok_or_else(|| CommandError::NotFound(format!("No session {session_id}")))
    }

    /// Complete every navigation waiter with `Cancelled`. Called once
    /// on daemon shutdown.
    pub fn cancel_all_waiters(&self) {
        let mut reg = self.lock();
        for session in reg.sessions.values_mut() {
            if let Some(waiter) = session.navigation.waiter.take() {
                let _ = waiter.send(Err(NavAbort::Cancelled));
            }
        }
    }

    // =========================================================================
    // Lookup and switching
    // =========================================================================

    /// Resolve a command's session: an explicit query, or the active
    /// session when none is given.
    ///
    /// # Errors
    ///
    /// `BrowserNotReady` when no session exists, `NotFound` when a
    /// query matches nothing, `Ambiguous` when it matches several.
    pub fn resolve(&self, query: Option<&str>) -> Result<String, CommandError> {
        match query {
            Some(q) => self.find_session(q),
            None => self
                .lock()
                .active
                .clone()
                .ok_or(CommandError::BrowserNotReady),
        }
    }

    /// Match sessions by id prefix, URL substring, or title substring.
    fn find_session(&self, query: &str) -> Result<String, CommandError> {
        let reg = self.lock();
        let needle = query.to_lowercase();
        let matches: Vec<&Session> = reg
            .sessions
            .values()
            .filter(|s| {
                s.session_id.starts_with(query)
                    || s.target_id.starts_with(query)
                    || s.url.to_lowercase().contains(&needle)
                    || s.title.to_lowercase().contains(&needle)
            })
            .collect();

        match matches.as_slice() {
            [] => Err(CommandError::NotFound(format!(
                "No session matches {query:?}"
            ))),
            [single] => Ok(single.session_id.clone()),
            several => Err(CommandError::Ambiguous {
                query: query.to_owned(),
                candidates: several
                    .iter()
                    .map(|s| format!("{} {}", short_id(&s.session_id), s.url))
                    .collect(),
            }),
        }
    }

    /// Switch the active session to the one matching `query`.
    ///
    /// # Errors
    ///
    /// Same as [`resolve`](Self::resolve).
    pub fn switch_active(&self, query: &str) -> Result<SessionInfo, CommandError> {
        let session_id = self.find_session(query)?;
        let mut reg = self.lock();
        reg.active = Some(session_id.clone());
        let session = &reg.sessions[&session_id];
        Ok(SessionInfo {
            id: session.session_id.clone(),
            target_id: session.target_id.clone(),
            url: session.url.clone(),
            title: session.title.clone(),
            active: true,
        })
    }

    /// All sessions in attach order.
    #[must_use]
    pub fn list(&self) -> Vec<SessionInfo> {
        let reg = self.lock();
        let mut sessions: Vec<&Session> = reg.sessions.values().collect();
        sessions.sort_by_key(|s| s.attach_seq);
        sessions
            .iter()
            .map(|s| SessionInfo {
                id: s.session_id.clone(),
                target_id: s.target_id.clone(),
                url: s.url.clone(),
                title: s.title.clone(),
                active: reg.active.as_deref() == Some(&s.session_id),
            })
            .collect()
    }

    #[must_use]
    pub fn active_session(&self) -> Option<String> {
        self.lock().active.clone()
    }

    #[must_use]
    pub fn has_sessions(&self) -> bool {
        !self.lock().sessions.is_empty()
    }

    /// Test hook: register a session without a browser round trip.
    #[cfg(test)]
    pub(crate) fn insert_for_tests(&self, session_id: &str, target_id: &str, url: &str, title: &str) {
        let mut reg = self.lock();
        let attach_seq = reg.next_attach_seq;
        reg.next_attach_seq += 1;
        reg.by_target.insert(target_id.to_owned(), session_id.to_owned());
        reg.sessions.insert(
            session_id.to_owned(),
            Session {
                session_id: session_id.to_owned(),
                target_id: target_id.to_owned(),
                url: url.to_owned(),
                title: title.to_owned(),
                attach_seq,
                enabled_domains: HashSet::new(),
                enabling: HashMap::new(),
                navigation: NavigationState::default(),
                load_signal: Arc::new(Notify::new()),
            },
        );
        if reg.active.is_none() {
            reg.active = Some(session_id.to_owned());
        }
    }
}

fn oldest_session(sessions: &HashMap<String, Session>) -> Option<String> {
    sessions
        .values()
        .min_by_key(|s| s.attach_seq)
        .map(|s| s.session_id.clone())
}

/// First eight characters of a session id, for candidate lists.
fn short_id(id: &str) -> &str {
    id.get(..8).unwrap_or(id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::{SinkExt, StreamExt};
    use std::time::Duration;
    use tokio::net::TcpListener;
    use tokio::sync::mpsc;
    use tokio_tungstenite::tungstenite::Message;

    use crate::cdp::CdpConfig;

    /// Mock CDP endpoint that answers every command and records it.
    /// `Target.attachToTarget` returns a session id derived from the
    /// target id; everything else echoes an empty result.
    async fn start_recording_server() -> (String, mpsc::Receiver<Value>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (record_tx, record_rx) = mpsc::channel::<Value>(64);

        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let record_tx = record_tx.clone();
                tokio::spawn(async move {
                    let ws = tokio_tungstenite::accept_async(stream).await.unwrap();
                    let (mut sink, mut source) = ws.split();
                    while let Some(Ok(Message::Text(text))) = source.next().await {
                        let cmd: Value = serde_json::from_str(&text).unwrap();
                        let _ = record_tx.send(cmd.clone()).await;

                        let response = if cmd["method"] == "Target.attachToTarget" {
                            let tid = cmd["params"]["targetId"].as_str().unwrap_or("t");
                            json!({"id": cmd["id"], "result": {"sessionId": format!("sess-{tid}")}})
                        } else {
                            let mut resp = json!({"id": cmd["id"], "result": {}});
                            if let Some(sid) = cmd.get("sessionId") {
                                resp["sessionId"] = sid.clone();
                            }
                            resp
                        };
                        let _ = sink.send(Message::Text(response.to_string().into())).await;
                    }
                });
            }
        });

        (format!("ws://{addr}"), record_rx)
    }

    async fn connect(url: &str) -> CdpClient {
        let config = CdpConfig {
            connect_timeout: Duration::from_secs(5),
            call_timeout: Duration::from_secs(5),
            event_capacity: 64,
        };
        let (client, _events) = CdpClient::connect(url, config).await.unwrap();
        client
    }

    fn target(id: &str) -> TargetSummary {
        TargetSummary {
            target_id: id.to_owned(),
            url: format!("https://example.com/{id}"),
            title: format!("Page {id}"),
        }
    }

    async fn drain_until_attached(manager: &Arc<SessionManager>) {
        for _ in 0..50 {
            if manager.has_sessions() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("no session attached");
    }

    #[tokio::test]
    async fn attach_enables_minimal_domains_without_network() {
        let (url, mut record_rx) = start_recording_server().await;
        let manager = SessionManager::new(connect(&url).await);

        manager.maybe_attach(target("t1"));
        drain_until_attached(&manager).await;
        tokio::time::sleep(Duration::from_millis(100)).await;

        let mut methods = Vec::new();
        while let Ok(cmd) = record_rx.try_recv() {
            methods.push(cmd["method"].as_str().unwrap().to_owned());
        }

        assert!(methods.contains(&"Target.attachToTarget".to_owned()));
        assert!(methods.contains(&"Runtime.enable".to_owned()));
        assert!(methods.contains(&"Page.enable".to_owned()));
        assert!(methods.contains(&"DOM.enable".to_owned()));
        assert!(
            !methods.contains(&"Network.enable".to_owned()),
            "Network must not be enabled at attach: {methods:?}"
        );
    }

    #[tokio::test]
    async fn double_attach_is_deduplicated() {
        let (url, mut record_rx) = start_recording_server().await;
        let manager = SessionManager::new(connect(&url).await);

        // Enumeration and the create event race for the same target.
        manager.maybe_attach(target("t1"));
        manager.maybe_attach(target("t1"));
        manager
            .on_target_created(&json!({"targetInfo": {"targetId": "t1", "type": "page", "url": "u", "title": "t"}}));

        drain_until_attached(&manager).await;
        tokio::time::sleep(Duration::from_millis(100)).await;

        let attach_count = {
            let mut n = 0;
            while let Ok(cmd) = record_rx.try_recv() {
                if cmd["method"] == "Target.attachToTarget" {
                    n += 1;
                }
            }
            n
        };
        assert_eq!(attach_count, 1, "exactly one attach per target");
        assert_eq!(manager.list().len(), 1);
    }

    #[tokio::test]
    async fn lazy_enable_is_single_flight_under_concurrency() {
        let (url, mut record_rx) = start_recording_server().await;
        let manager = SessionManager::new(connect(&url).await);
        manager.insert_for_tests("s1", "t1", "https://example.com", "Example");

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let manager = Arc::clone(&manager);
                tokio::spawn(async move { manager.ensure_domain("s1", "Network").await })
            })
            .collect();
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        let mut network_enables = 0;
        while let Ok(cmd) = record_rx.try_recv() {
            if cmd["method"] == "Network.enable" {
                network_enables += 1;
            }
        }
        assert_eq!(network_enables, 1, "at most one Network.enable per session");
        assert!(manager.domain_enabled("s1", "Network"));

        // Subsequent calls are free.
        manager.ensure_domain("s1", "Network").await.unwrap();
        assert!(record_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn supersession_completes_previous_waiter() {
        let (url, _record_rx) = start_recording_server().await;
        let manager = SessionManager::new(connect(&url).await);
        manager.insert_for_tests("s1", "t1", "https://a.test", "A");

        let first = manager.arm_navigation("s1", true).unwrap().unwrap();
        let _second = manager.arm_navigation("s1", true).unwrap().unwrap();

        assert_eq!(first.await.unwrap(), Err(NavAbort::Superseded));
    }

    #[tokio::test]
    async fn load_event_completes_at_most_one_waiter() {
        let (url, _record_rx) = start_recording_server().await;
        let manager = SessionManager::new(connect(&url).await);
        manager.insert_for_tests("s1", "t1", "https://a.test", "A");

        let waiter = manager.arm_navigation("s1", true).unwrap().unwrap();
        manager.on_load_event("s1");
        assert_eq!(waiter.await.unwrap(), Ok(()));

        // A second load event with no armed waiter is a no-op.
        manager.on_load_event("s1");
    }

    #[tokio::test]
    async fn shutdown_cancels_waiters() {
        let (url, _record_rx) = start_recording_server().await;
        let manager = SessionManager::new(connect(&url).await);
        manager.insert_for_tests("s1", "t1", "https://a.test", "A");

        let waiter = manager.arm_navigation("s1", true).unwrap().unwrap();
        manager.cancel_all_waiters();
        assert_eq!(waiter.await.unwrap(), Err(NavAbort::Cancelled));
    }

    #[tokio::test]
    async fn resolve_prefers_active_without_query() {
        let (url, _record_rx) = start_recording_server().await;
        let manager = SessionManager::new(connect(&url).await);
        assert!(matches!(
            manager.resolve(None),
            Err(CommandError::BrowserNotReady)
        ));

        manager.insert_for_tests("s1", "t1", "https://a.test", "A");
        manager.insert_for_tests("s2", "t2", "https://b.test", "B");
        assert_eq!(manager.resolve(None).unwrap(), "s1");
    }

    #[tokio::test]
    async fn query_matching_and_ambiguity() {
        let (url, _record_rx) = start_recording_server().await;
        let manager = SessionManager::new(connect(&url).await);
        manager.insert_for_tests("alpha-1", "t1", "https://example.com/a", "Alpha");
        manager.insert_for_tests("beta-2", "t2", "https://example.org/b", "Beta");

        // Unique id prefix.
        assert_eq!(manager.resolve(Some("alpha")).unwrap(), "alpha-1");
        // Unique title substring, case-insensitive.
        assert_eq!(manager.resolve(Some("beta")).unwrap(), "beta-2");
        // URL substring shared by both.
        match manager.resolve(Some("example")) {
            Err(CommandError::Ambiguous { candidates, .. }) => {
                assert_eq!(candidates.len(), 2);
            }
            other => panic!("expected Ambiguous, got {other:?}"),
        }
        // No match.
        assert!(matches!(
            manager.resolve(Some("zebra")),
            Err(CommandError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn destroy_promotes_oldest_remaining_session() {
        let (url, _record_rx) = start_recording_server().await;
        let manager = SessionManager::new(connect(&url).await);
        manager.insert_for_tests("s1", "t1", "https://a.test", "A");
        manager.insert_for_tests("s2", "t2", "https://b.test", "B");
        manager.insert_for_tests("s3", "t3", "https://c.test", "C");
        assert_eq!(manager.active_session().as_deref(), Some("s1"));

        manager.on_target_destroyed(&json!({"targetId": "t1"}));
        assert_eq!(manager.active_session().as_deref(), Some("s2"));
        assert_eq!(manager.list().len(), 2);
    }

    #[tokio::test]
    async fn frame_navigated_updates_main_frame_only() {
        let (url, _record_rx) = start_recording_server().await;
        let manager = SessionManager::new(connect(&url).await);
        manager.insert_for_tests("s1", "t1", "https://old.test", "Old");

        manager.on_frame_navigated(
            "s1",
            &json!({"frame": {"id": "F1", "url": "https://new.test/"}}),
        );
        manager.on_frame_navigated(
            "s1",
            &json!({"frame": {"id": "F2", "parentId": "F1", "url": "https://iframe.test/"}}),
        );

        let info = &manager.list()[0];
        assert_eq!(info.url, "https://new.test/");
    }
}
