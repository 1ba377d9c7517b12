use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use serde::Serialize;
use serde_json::Value;

use crate::ring::RingBuffer;

/// Default console ring capacity.
pub const DEFAULT_CONSOLE_CAPACITY: usize = 10_000;
/// Default network ring capacity.
pub const DEFAULT_NETWORK_CAPACITY: usize = 10_000;
/// Default cap on captured response bodies, in bytes.
pub const DEFAULT_BODY_LIMIT: usize = 100 * 1024;

/// Milliseconds since the Unix epoch on the host clock.
///
/// Telemetry timestamps come from the daemon, not the browser, so
/// entries from different CDP domains order consistently.
#[must_use]
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis()
        .try_into()
        .unwrap_or(u64::MAX)
}

// =============================================================================
// Console entries
// =============================================================================

/// Severity of a console entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConsoleLevel {
    Log,
    Info,
    Warn,
    Error,
    Debug,
    Exception,
}

impl ConsoleLevel {
    /// Parse a level name as used in console filters.
    #[must_use]
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "log" => Some(Self::Log),
            "info" => Some(Self::Info),
            "warn" | "warning" => Some(Self::Warn),
            "error" => Some(Self::Error),
            "debug" => Some(Self::Debug),
            "exception" => Some(Self::Exception),
            _ => None,
        }
    }

    /// Map a `Runtime.consoleAPICalled` type to a level.
    fn from_api_type(api_type: &str) -> Self {
        match api_type {
            "warning" => Self::Warn,
            "error" | "assert" => Self::Error,
            "info" => Self::Info,
            "debug" => Self::Debug,
            _ => Self::Log,
        }
    }
}

/// One normalized console message.
#[derive(Debug, Clone, Serialize)]
pub struct ConsoleEntry {
    /// Host-clock timestamp, ms since epoch.
    pub timestamp_ms: u64,
    pub level: ConsoleLevel,
    pub text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub line: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub column: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
}

impl ConsoleEntry {
    /// Normalize a `Runtime.consoleAPICalled` event.
    #[must_use]
    pub fn from_console_api(params: &Value) -> Self {
        let api_type = params["type"].as_str().unwrap_or("log");
        let text = params["args"]
            .as_array()
            .map(|args| {
                args.iter()
                    .map(remote_object_text)
                    .collect::<Vec<_>>()
                    .join(" ")
            })
            .unwrap_or_default();
        let frame = params["stackTrace"]["callFrames"].get(0);

        Self {
            timestamp_ms: now_ms(),
            level: ConsoleLevel::from_api_type(api_type),
            text,
            url: frame
                .and_then(|f| f["url"].as_str())
                .filter(|u| !u.is_empty())
                .map(str::to_owned),
            line: frame.and_then(|f| f["lineNumber"].as_u64()),
            column: frame.and_then(|f| f["columnNumber"].as_u64()),
            stack: format_stack(&params["stackTrace"]),
        }
    }

    /// Normalize a `Runtime.exceptionThrown` event.
    #[must_use]
    pub fn from_exception(params: &Value) -> Self {
        let details = &params["exceptionDetails"];
        let description = details["exception"]["description"]
            .as_str()
            .or_else(|| details["text"].as_str())
            .unwrap_or("uncaught exception");

        Self {
            timestamp_ms: now_ms(),
            level: ConsoleLevel::Exception,
            text: description.to_owned(),
            url: details["url"].as_str().map(str::to_owned),
            line: details["lineNumber"].as_u64(),
            column: details["columnNumber"].as_u64(),
            stack: format_stack(&details["stackTrace"]),
        }
    }

    /// Normalize a `Log.entryAdded` event (browser-generated entries
    /// such as network warnings and deprecations).
    #[must_use]
    pub fn from_log_entry(params: &Value) -> Self {
        let entry = &params["entry"];
        let level = match entry["level"].as_str() {
            Some("warning") => ConsoleLevel::Warn,
            Some("error") => ConsoleLevel::Error,
            Some("verbose") => ConsoleLevel::Debug,
            _ => ConsoleLevel::Info,
        };

        Self {
            timestamp_ms: now_ms(),
            level,
            text: entry["text"].as_str().unwrap_or_default().to_owned(),
            url: entry["url"].as_str().map(str::to_owned),
            line: entry["lineNumber"].as_u64(),
            column: None,
            stack: None,
        }
    }
}

/// Render a CDP `RemoteObject` preview for console text.
fn remote_object_text(obj: &Value) -> String {
    if let Some(value) = obj.get("value") {
        match value {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        }
    } else if let Some(desc) = obj["description"].as_str() {
        desc.to_owned()
    } else {
        obj["type"].as_str().unwrap_or("unknown").to_owned()
    }
}

/// Flatten a CDP stack trace into `func (url:line:col)` lines.
fn format_stack(stack: &Value) -> Option<String> {
    let frames = stack["callFrames"].as_array()?;
    if frames.is_empty() {
        return None;
    }
    let lines: Vec<String> = frames
        .iter()
        .map(|f| {
            let func = match f["functionName"].as_str() {
                Some("") | None => "<anonymous>",
                Some(name) => name,
            };
            format!(
                "{func} ({}:{}:{})",
                f["url"].as_str().unwrap_or(""),
                f["lineNumber"].as_u64().unwrap_or(0),
                f["columnNumber"].as_u64().unwrap_or(0)
            )
        })
        .collect();
    Some(lines.join("\n"))
}

/// Thread-safe console ring.
#[derive(Debug)]
pub struct ConsoleBuffer {
    ring: Mutex<RingBuffer<ConsoleEntry>>,
}

impl ConsoleBuffer {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            ring: Mutex::new(RingBuffer::new(capacity)),
        }
    }

    pub fn push(&self, entry: ConsoleEntry) {
        self.ring.lock().expect("console ring poisoned").push(entry);
    }

    #[must_use]
    pub fn snapshot(&self) -> Vec<ConsoleEntry> {
        self.ring.lock().expect("console ring poisoned").snapshot()
    }

    pub fn clear(&self) {
        self.ring.lock().expect("console ring poisoned").clear();
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.ring.lock().expect("console ring poisoned").len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// =============================================================================
// Network entries
// =============================================================================

/// One request/response pair, assembled in phases as CDP events arrive.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkEntry {
    /// CDP request id; keys in-flight updates.
    pub request_id: String,
    pub method: String,
    pub url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resource_type: Option<String>,
    pub request_headers: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_headers: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    /// Host-clock timestamp of phase one, ms since epoch.
    pub started_at_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    /// Encoded bytes on the wire, accumulated from data events and
    /// finalized on loading-finished.
    pub size: u64,
    pub failed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub body_base64: bool,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub body_truncated: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body_error: Option<String>,
    pub finished: bool,
}

struct NetworkInner {
    ring: RingBuffer<NetworkEntry>,
    /// Request id → sequence number of its slot. Eviction removes the
    /// mapping, so late phase updates to evicted entries are dropped.
    index: HashMap<String, u64>,
    /// Sequence number of the ring's oldest slot.
    front_seq: u64,
    next_seq: u64,
    /// Requests between phase one and loading-finished/failed,
    /// independent of ring eviction. Drives network-idle waits.
    open: HashSet<String>,
    last_activity: Instant,
}

/// Thread-safe two-phase network ring.
pub struct NetworkBuffer {
    inner: Mutex<NetworkInner>,
}

impl NetworkBuffer {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(NetworkInner {
                ring: RingBuffer::new(capacity),
                index: HashMap::new(),
                front_seq: 0,
                next_seq: 0,
                open: HashSet::new(),
                last_activity: Instant::now(),
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, NetworkInner> {
        self.inner.lock().expect("network ring poisoned")
    }

    /// Phase one: `Network.requestWillBeSent`. A repeated request id is
    /// a redirect hop; the existing entry is updated in place.
    pub fn begin_request(&self, params: &Value) {
        let Some(request_id) = params["requestId"].as_str() else {
            return;
        };
        let request = &params["request"];
        let method = request["method"].as_str().unwrap_or("GET").to_owned();
        let url = request["url"].as_str().unwrap_or_default().to_owned();

        let mut inner = self.lock();
        inner.last_activity = Instant::now();

        if let Some(entry) = lookup_mut(&mut inner, request_id) {
            // Redirect: keep the slot and start time, follow the URL.
            entry.method = method;
            entry.url = url;
            entry.status = None;
            entry.response_headers = None;
            return;
        }

        let entry = NetworkEntry {
            request_id: request_id.to_owned(),
            method,
            url,
            resource_type: params["type"].as_str().map(str::to_owned),
            request_headers: request["headers"].clone(),
            status: None,
            response_headers: None,
            mime_type: None,
            started_at_ms: now_ms(),
            duration_ms: None,
            size: 0,
            failed: false,
            error_text: None,
            body: None,
            body_base64: false,
            body_truncated: false,
            body_error: None,
            finished: false,
        };

        let seq = inner.next_seq;
        inner.next_seq += 1;
        if let Some(evicted) = inner.ring.push(entry) {
            inner.front_seq += 1;
            inner.index.remove(&evicted.request_id);
        }
        inner.index.insert(request_id.to_owned(), seq);
        inner.open.insert(request_id.to_owned());
    }

    /// Phase two: `Network.responseReceived`.
    pub fn record_response(&self, params: &Value) {
        let Some(request_id) = params["requestId"].as_str() else {
            return;
        };
        let response = &params["response"];
        let status = response["status"].as_u64().and_then(|s| u16::try_from(s).ok());
        let headers = response["headers"].clone();
        let mime = response["mimeType"].as_str().map(str::to_owned);

        let mut inner = self.lock();
        inner.last_activity = Instant::now();
        if let Some(entry) = lookup_mut(&mut inner, request_id) {
            entry.status = status;
            entry.response_headers = Some(headers);
            entry.mime_type = mime;
        }
    }

    /// `Network.dataReceived`: accumulate transfer size.
    pub fn data_received(&self, params: &Value) {
        let Some(request_id) = params["requestId"].as_str() else {
            return;
        };
        let chunk = params["encodedDataLength"].as_u64().unwrap_or(0);

        let mut inner = self.lock();
        inner.last_activity = Instant::now();
        if let Some(entry) = lookup_mut(&mut inner, request_id) {
            entry.size += chunk;
        }
    }

    /// Phase three, success path: `Network.loadingFinished`. Returns
    /// `true` when the entry is still buffered (a body fetch is worth
    /// scheduling).
    pub fn finish(&self, params: &Value) -> bool {
        let Some(request_id) = params["requestId"].as_str() else {
            return false;
        };
        let total = params["encodedDataLength"].as_u64();

        let mut inner = self.lock();
        inner.last_activity = Instant::now();
        inner.open.remove(request_id);

        let now = now_ms();
        match lookup_mut(&mut inner, request_id) {
            Some(entry) => {
                entry.finished = true;
                entry.duration_ms = Some(now.saturating_sub(entry.started_at_ms));
                if let Some(total) = total {
                    entry.size = total;
                }
                true
            }
            None => false,
        }
    }

    /// Phase three, failure path: `Network.loadingFailed`.
    pub fn fail(&self, params: &Value) {
        let Some(request_id) = params["requestId"].as_str() else {
            return;
        };
        let error_text = params["errorText"].as_str().unwrap_or("failed").to_owned();

        let mut inner = self.lock();
        inner.last_activity = Instant::now();
        inner.open.remove(request_id);

        let now = now_ms();
        if let Some(entry) = lookup_mut(&mut inner, request_id) {
            entry.finished = true;
            entry.failed = true;
            entry.error_text = Some(error_text);
            entry.duration_ms = Some(now.saturating_sub(entry.started_at_ms));
        }
    }

    /// Attach a fetched (possibly truncated) response body.
    pub fn attach_body(&self, request_id: &str, body: String, base64: bool, truncated: bool) {
        let mut inner = self.lock();
        if let Some(entry) = lookup_mut(&mut inner, request_id) {
            entry.body = Some(body);
            entry.body_base64 = base64;
            entry.body_truncated = truncated;
        }
    }

    /// Record a failed body fetch. Not fatal to the entry.
    pub fn set_body_error(&self, request_id: &str, message: &str) {
        let mut inner = self.lock();
        if let Some(entry) = lookup_mut(&mut inner, request_id) {
            entry.body_error = Some(message.to_owned());
        }
    }

    #[must_use]
    pub fn snapshot(&self) -> Vec<NetworkEntry> {
        self.lock().ring.snapshot()
    }

    /// Reset buffered entries. In-flight accounting survives so
    /// network-idle waits stay accurate across a clear.
    pub fn clear(&self) {
        let mut inner = self.lock();
        inner.ring.clear();
        inner.index.clear();
        inner.front_seq = inner.next_seq;
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().ring.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// `(in-flight count, time since last network activity)` for
    /// network-idle waits.
    #[must_use]
    pub fn idle_state(&self) -> (usize, Duration) {
        let inner = self.lock();
        (inner.open.len(), inner.last_activity.elapsed())
    }
}

fn lookup_mut<'a>(inner: &'a mut NetworkInner, request_id: &str) -> Option<&'a mut NetworkEntry> {
    let seq = *inner.index.get(request_id)?;
    let pos = usize::try_from(seq.checked_sub(inner.front_seq)?).ok()?;
    inner.ring.get_mut(pos)
}
