//! Provider Adapters
//!
//! One adapter per carrier. Each owns its media sockets and per-stream
//! state, parses the carrier's envelopes into normalized events, and
//! frames/paces outbound audio the way the carrier requires.

pub mod plivo;
pub mod rest;
pub mod tata;

use crate::config::ProviderKind;
use crate::event::EndReason;
use crate::session::SessionSnapshot;
use async_trait::async_trait;
use futures_util::stream::SplitSink;
use futures_util::SinkExt;
use std::collections::HashMap;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

#[derive(Error, Debug)]
pub enum AdapterError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("provider error: {0}")]
    Provider(String),

    #[error("unsupported media format: {0}")]
    MediaFormat(String),

    #[error("{0} is not supported by this provider")]
    Unsupported(&'static str),
}

/// Structured webhook response, XML or JSON per provider.
#[derive(Clone, Debug)]
pub struct WebhookReply {
    pub status: u16,
    pub content_type: &'static str,
    pub body: String,
}

impl WebhookReply {
    pub fn xml(body: String) -> Self {
        Self {
            status: 200,
            content_type: "text/xml",
            body,
        }
    }

    pub fn json(value: serde_json::Value) -> Self {
        Self {
            status: 200,
            content_type: "application/json",
            body: value.to_string(),
        }
    }

    pub fn not_found() -> Self {
        Self {
            status: 404,
            content_type: "application/json",
            body: serde_json::json!({"error": "Unknown webhook path"}).to_string(),
        }
    }
}

/// Contract every carrier adapter fulfills. Best-effort operations
/// (`send_audio`, `clear_audio`, `end_call`) log instead of failing.
#[async_trait]
pub trait TelephonyAdapter: Send + Sync {
    fn provider(&self) -> ProviderKind;

    /// Originate an outbound call; returns the provider-side request id.
    async fn make_call(&self, to: &str, from: Option<&str>) -> Result<String, AdapterError>;

    /// Hang up: provider REST if available, then close the socket, then
    /// purge local state. Safe on unknown call ids.
    async fn end_call(&self, call_id: &str, reason: EndReason);

    /// Enqueue pipeline-format PCM for the carrier, transcoded and framed
    /// to the wire format. Non-blocking; drops silently if the socket is
    /// absent.
    fn send_audio(&self, call_id: &str, pcm: &[u8], sample_rate: u32);

    /// Barge-in: discard queued outbound audio and, where the protocol
    /// allows, tell the carrier to stop playback.
    fn clear_audio(&self, call_id: &str);

    /// Emit any residual outbound bytes as a final padded frame, followed
    /// by a playback mark where the protocol has one.
    fn flush_audio(&self, call_id: &str);

    /// Provider answer document instructing the carrier to open a media
    /// stream to `stream_url`.
    fn answer_document(&self, call_id: &str, stream_url: &str) -> Result<String, AdapterError>;

    /// Handle a carrier webhook below this provider's path prefix.
    fn handle_webhook(
        &self,
        path: &str,
        method: &str,
        body: &str,
        query: &HashMap<String, String>,
    ) -> WebhookReply;

    fn session(&self, call_id: &str) -> Option<SessionSnapshot>;

    fn sessions(&self) -> Vec<SessionSnapshot>;

    /// Service one inbound media WebSocket until it closes.
    async fn handle_socket(&self, socket: WebSocketStream<TcpStream>);

    /// Terminate every active call and release adapter resources.
    async fn shutdown(&self);
}

/// Forward queued wire messages onto the socket, then close it. Each
/// connection gets one writer task so outbound envelopes stay ordered.
pub(crate) async fn writer_loop(
    mut sink: SplitSink<WebSocketStream<TcpStream>, Message>,
    mut rx: mpsc::Receiver<Message>,
) {
    while let Some(message) = rx.recv().await {
        if sink.send(message).await.is_err() {
            return;
        }
    }
    let _ = sink.send(Message::Close(None)).await;
}

/// Map the public webhook base URL onto the media WebSocket URL for a
/// provider (`https` becomes `wss`).
pub(crate) fn stream_url(webhook_base_url: &str, provider: ProviderKind) -> String {
    let base = webhook_base_url.trim_end_matches('/');
    let ws_base = if let Some(rest) = base.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = base.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        base.to_string()
    };
    format!("{ws_base}/telephony/{}/stream", provider.tag())
}
