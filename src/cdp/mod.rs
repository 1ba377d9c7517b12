//! Chrome DevTools Protocol plumbing: wire types, the single-WebSocket
//! transport task, and the call/response correlator.

mod client;
mod error;
mod transport;
mod types;

pub use client::{CdpClient, CdpConfig};
pub use error::CdpError;
pub use transport::{TransportCommand, TransportHandle, spawn_transport};
pub use types::{CdpErrorPayload, CdpEvent, CdpRequest, CdpResponse, Inbound, InboundFrame};
