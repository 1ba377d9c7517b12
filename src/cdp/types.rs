use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Outgoing CDP request frame (daemon to browser).
#[derive(Debug, Serialize)]
pub struct CdpRequest {
    /// Process-unique id used to correlate the response.
    pub id: u64,
    /// CDP method name (e.g., `Target.attachToTarget`).
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    /// Session routing for flattened sessions; absent for browser-level calls.
    #[serde(rename = "sessionId", skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

/// Error payload inside a CDP response frame.
#[derive(Debug, Clone, Deserialize)]
pub struct CdpErrorPayload {
    pub code: i64,
    pub message: String,
}

/// Every inbound WebSocket text frame decodes into this union first.
///
/// A frame with an `id` is a command response; a frame with a `method`
/// but no `id` is an event. Frames with neither are protocol noise.
#[derive(Debug, Deserialize)]
pub struct InboundFrame {
    pub id: Option<u64>,
    pub method: Option<String>,
    pub params: Option<Value>,
    pub result: Option<Value>,
    pub error: Option<CdpErrorPayload>,
    #[serde(rename = "sessionId")]
    pub session_id: Option<String>,
}

/// A correlated command response.
#[derive(Debug)]
pub struct CdpResponse {
    pub id: u64,
    pub result: Result<Value, CdpErrorPayload>,
}

/// An asynchronous event from the browser, possibly session-qualified.
#[derive(Debug, Clone)]
pub struct CdpEvent {
    pub method: String,
    pub params: Value,
    pub session_id: Option<String>,
}

/// Classified inbound frame.
#[derive(Debug)]
pub enum Inbound {
    Response(CdpResponse),
    Event(CdpEvent),
}

impl InboundFrame {
    /// Classify this frame as a response or an event.
    ///
    /// Returns `None` for frames carrying neither `id` nor `method`.
    #[must_use]
    pub fn classify(self) -> Option<Inbound> {
        if let Some(id) = self.id {
            let result = match self.error {
                Some(error) => Err(error),
                None => Ok(self.result.unwrap_or(Value::Null)),
            };
            Some(Inbound::Response(CdpResponse { id, result }))
        } else {
            self.method.map(|method| {
                Inbound::Event(CdpEvent {
                    method,
                    params: self.params.unwrap_or(Value::Null),
                    session_id: self.session_id,
                })
            })
        }
    }
}
