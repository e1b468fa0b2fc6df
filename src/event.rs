//! Normalized Telephony Events
//!
//! Adapters translate each carrier's wire protocol into these events and
//! push them over one channel to the manager. Per call, `CallStarted`
//! always precedes `AudioReceived`, and `CallEnded` is terminal and
//! emitted exactly once.

use crate::codec::AudioEncoding;
use crate::config::ProviderKind;
use chrono::{DateTime, Utc};
use serde::Serialize;

/// Call leg direction as reported by the carrier.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CallDirection {
    Inbound,
    Outbound,
}

impl CallDirection {
    /// Carriers report direction as a free-form string; anything that is
    /// not recognizably outbound counts as inbound.
    pub fn parse(raw: Option<&str>) -> Self {
        match raw {
            Some(s) if s.eq_ignore_ascii_case("outbound") => CallDirection::Outbound,
            _ => CallDirection::Inbound,
        }
    }
}

/// Metadata for one active call, created on the adapter's `start` event.
#[derive(Clone, Debug, Serialize)]
pub struct CallRecord {
    /// Process-wide unique id, provider-prefixed (`plivo_…`, `tata_…`).
    pub call_id: String,
    pub provider: ProviderKind,
    pub from: String,
    pub to: String,
    pub direction: CallDirection,
    pub started_at: DateTime<Utc>,
    pub stream_id: String,
}

/// One inbound media frame, normalized across providers.
#[derive(Clone, Debug)]
pub struct AudioPacket {
    pub call_id: String,
    pub stream_id: String,
    pub sequence_number: u64,
    pub timestamp: u64,
    pub payload: Vec<u8>,
    pub encoding: AudioEncoding,
    pub sample_rate: u32,
}

/// Why a call ended. Serialized into call records and logs.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EndReason {
    StreamStopped,
    WebsocketClosed,
    ProviderTimeout,
    PipelineFailed,
    SessionEndRequested,
    Shutdown,
}

impl EndReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            EndReason::StreamStopped => "stream_stopped",
            EndReason::WebsocketClosed => "websocket_closed",
            EndReason::ProviderTimeout => "provider_timeout",
            EndReason::PipelineFailed => "pipeline_failed",
            EndReason::SessionEndRequested => "session_end_requested",
            EndReason::Shutdown => "shutdown",
        }
    }
}

impl std::fmt::Display for EndReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Events emitted by every adapter.
#[derive(Clone, Debug)]
pub enum TelephonyEvent {
    CallStarted(CallRecord),
    CallEnded { call_id: String, reason: EndReason },
    AudioReceived(AudioPacket),
    Dtmf { call_id: String, digit: String },
    Error { call_id: Option<String>, message: String },
}

impl TelephonyEvent {
    /// The call this event belongs to, if any.
    pub fn call_id(&self) -> Option<&str> {
        match self {
            TelephonyEvent::CallStarted(record) => Some(&record.call_id),
            TelephonyEvent::CallEnded { call_id, .. } => Some(call_id),
            TelephonyEvent::AudioReceived(packet) => Some(&packet.call_id),
            TelephonyEvent::Dtmf { call_id, .. } => Some(call_id),
            TelephonyEvent::Error { call_id, .. } => call_id.as_deref(),
        }
    }

    /// Whether this event closes out its call.
    pub fn is_terminal(&self) -> bool {
        matches!(self, TelephonyEvent::CallEnded { .. })
    }
}
