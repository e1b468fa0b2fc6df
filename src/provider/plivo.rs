//! PlivoLike Adapter
//!
//! Bidirectional audio over one WebSocket per call, JSON envelopes tagged
//! by `event`. Inbound media is linear16 or μ-law per the envelope's
//! content type (8 kHz default); outbound audio is sent as linear16 @
//! 8 kHz `playAudio` envelopes with no framing constraint. Barge-in maps
//! to an explicit `clearAudio` envelope. Outbound origination goes through
//! the provider REST API.

use crate::codec::{self, AudioEncoding};
use crate::config::{Credentials, ProviderKind, TelephonyConfig};
use crate::event::{AudioPacket, CallDirection, CallRecord, EndReason, TelephonyEvent};
use crate::provider::rest::{ProviderClient, RestError};
use crate::provider::{self, AdapterError, TelephonyAdapter, WebhookReply};
use crate::session::{SessionRegistry, SessionSnapshot, StreamState};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::Utc;
use futures_util::future::join_all;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, error, info, warn};

const DEFAULT_API_BASE: &str = "https://api.plivo.com";
const DEFAULT_CONTENT_TYPE: &str = "audio/x-l16;rate=8000";

// ---------------------------------------------------------------------------
// Wire envelopes
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(tag = "event", rename_all = "camelCase")]
enum PlivoEnvelope {
    Start {
        #[serde(default, rename = "sequenceNumber")]
        sequence_number: u64,
        start: PlivoStart,
    },
    Media {
        #[serde(default, rename = "sequenceNumber")]
        sequence_number: u64,
        #[serde(rename = "streamId")]
        stream_id: String,
        media: PlivoMedia,
    },
    Stop {
        #[serde(rename = "streamId")]
        stream_id: String,
    },
    Dtmf {
        #[serde(rename = "streamId")]
        stream_id: String,
        dtmf: PlivoDtmf,
    },
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PlivoStart {
    stream_id: String,
    call_id: String,
    from: String,
    to: String,
    #[serde(default)]
    direction: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
#[allow(dead_code)]
struct PlivoMedia {
    #[serde(default)]
    track: Option<String>,
    #[serde(default)]
    chunk: u64,
    #[serde(default)]
    timestamp: u64,
    payload: String,
    #[serde(default)]
    content_type: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PlivoDtmf {
    digit: String,
    #[serde(default)]
    duration: Option<u64>,
}

#[derive(Debug, Serialize)]
#[serde(tag = "event", rename_all = "camelCase")]
enum PlivoOutbound {
    PlayAudio { media: PlayAudioMedia },
    ClearAudio,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct PlayAudioMedia {
    content_type: &'static str,
    sample_rate: u32,
    payload: String,
}

/// Substring inspection of the media content type. Only 8000 and 16000 Hz
/// are recognized; other explicit rates are rejected rather than
/// mis-detected.
fn parse_content_type(raw: Option<&str>) -> Result<(AudioEncoding, u32), AdapterError> {
    let ct = raw.unwrap_or(DEFAULT_CONTENT_TYPE);
    let encoding = if ct.contains("mulaw") {
        AudioEncoding::Mulaw
    } else {
        AudioEncoding::Linear16
    };
    let rate = if ct.contains("16000") {
        16_000
    } else if ct.contains("8000") || !ct.contains("rate=") {
        8_000
    } else {
        return Err(AdapterError::MediaFormat(ct.to_string()));
    };
    Ok((encoding, rate))
}

// ---------------------------------------------------------------------------
// Adapter
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct PlivoAdapter {
    registry: SessionRegistry,
    events: mpsc::Sender<TelephonyEvent>,
    client: ProviderClient,
    credentials: Credentials,
    webhook_base_url: String,
    default_from_number: Option<String>,
}

impl PlivoAdapter {
    pub fn new(
        config: &TelephonyConfig,
        events: mpsc::Sender<TelephonyEvent>,
    ) -> Result<Self, AdapterError> {
        if config.provider != ProviderKind::PlivoLike {
            return Err(AdapterError::Config(format!(
                "expected provider plivoLike, got {}",
                config.provider
            )));
        }
        let credentials = config
            .credentials
            .clone()
            .ok_or_else(|| AdapterError::Config("missing credentials.authId/authToken".into()))?;
        let api_base = config
            .api_base_url
            .clone()
            .unwrap_or_else(|| DEFAULT_API_BASE.to_string());
        let client =
            ProviderClient::new(api_base).map_err(|e| AdapterError::Config(e.to_string()))?;

        Ok(Self {
            registry: SessionRegistry::new(),
            events,
            client,
            credentials,
            webhook_base_url: config.webhook_base_url.clone(),
            default_from_number: config.default_from_number.clone(),
        })
    }

    fn stream_url(&self) -> String {
        provider::stream_url(&self.webhook_base_url, ProviderKind::PlivoLike)
    }

    /// Purge the stream and emit the terminal event. Removal from the
    /// registry is what makes `callEnded` exactly-once: whichever path
    /// gets there first wins.
    async fn finish_stream(&self, stream_id: &str, reason: EndReason) {
        if let Some(binding) = self.registry.remove_stream(stream_id) {
            info!("plivo call {} ended ({reason})", binding.call_id);
            let _ = self
                .events
                .send(TelephonyEvent::CallEnded {
                    call_id: binding.call_id,
                    reason,
                })
                .await;
        }
    }

    async fn on_start(
        &self,
        start: PlivoStart,
        writer: mpsc::Sender<Message>,
    ) -> Result<String, AdapterError> {
        let call_id = ProviderKind::PlivoLike.internal_call_id(&start.call_id);
        self.registry.register(&start.stream_id, &call_id, writer)?;

        info!(
            "plivo call {} started (stream {}, {} -> {})",
            call_id, start.stream_id, start.from, start.to
        );
        let record = CallRecord {
            call_id,
            provider: ProviderKind::PlivoLike,
            from: start.from,
            to: start.to,
            direction: CallDirection::parse(start.direction.as_deref()),
            started_at: Utc::now(),
            stream_id: start.stream_id.clone(),
        };
        let stream_id = start.stream_id;
        let _ = self.events.send(TelephonyEvent::CallStarted(record)).await;
        Ok(stream_id)
    }

    async fn on_media(&self, stream_id: &str, sequence_number: u64, media: PlivoMedia) {
        let Some(call_id) = self.registry.call_for_stream(stream_id) else {
            return;
        };
        let (encoding, sample_rate) = match parse_content_type(media.content_type.as_deref()) {
            Ok(parsed) => parsed,
            Err(err) => {
                warn!("plivo call {call_id}: dropping media ({err})");
                return;
            }
        };
        let payload = match BASE64.decode(media.payload.as_bytes()) {
            Ok(payload) => payload,
            Err(err) => {
                warn!("plivo call {call_id}: bad media payload ({err})");
                return;
            }
        };
        let _ = self
            .events
            .send(TelephonyEvent::AudioReceived(AudioPacket {
                call_id,
                stream_id: stream_id.to_string(),
                sequence_number,
                timestamp: media.timestamp,
                payload,
                encoding,
                sample_rate,
            }))
            .await;
    }
}

#[async_trait]
impl TelephonyAdapter for PlivoAdapter {
    fn provider(&self) -> ProviderKind {
        ProviderKind::PlivoLike
    }

    async fn make_call(&self, to: &str, from: Option<&str>) -> Result<String, AdapterError> {
        let from = from
            .or(self.default_from_number.as_deref())
            .ok_or_else(|| AdapterError::Config("no from number configured".into()))?;
        let answer_url = format!(
            "{}/telephony/plivo/answer",
            self.webhook_base_url.trim_end_matches('/')
        );

        let request_uuid = self
            .client
            .originate_call(&self.credentials, to, from, &answer_url)
            .await
            .map_err(|e| AdapterError::Provider(e.to_string()))?;
        info!("plivo originated call to {to} (request {request_uuid})");
        Ok(request_uuid)
    }

    async fn end_call(&self, call_id: &str, reason: EndReason) {
        let Some(snapshot) = self.registry.snapshot(call_id) else {
            warn!("end_call for unknown call {call_id}, ignoring");
            return;
        };
        self.registry.set_state(call_id, StreamState::Draining);

        // REST hangup first, then close the socket by purging the binding
        // (dropping its writer lets the writer task drain in-flight frames
        // and send the close frame).
        let mut reason = reason;
        if let Some(call_uuid) = call_id.strip_prefix("plivo_") {
            match self.client.hangup_call(&self.credentials, call_uuid).await {
                Ok(()) => {}
                Err(RestError::Timeout) => {
                    error!("plivo hangup for {call_id} timed out");
                    reason = EndReason::ProviderTimeout;
                }
                Err(err) => error!("plivo hangup for {call_id} failed: {err}"),
            }
        }
        self.finish_stream(&snapshot.stream_id, reason).await;
    }

    fn send_audio(&self, call_id: &str, pcm: &[u8], sample_rate: u32) {
        let payload = codec::pipeline_to_telephony(pcm, sample_rate, AudioEncoding::Linear16);
        let envelope = PlivoOutbound::PlayAudio {
            media: PlayAudioMedia {
                content_type: "audio/x-l16",
                sample_rate: codec::TELEPHONY_SAMPLE_RATE,
                payload: BASE64.encode(&payload),
            },
        };
        let Ok(text) = serde_json::to_string(&envelope) else {
            return;
        };
        let sent = self.registry.with_stream_of_call(call_id, |binding| {
            if binding.state != StreamState::Active {
                return false;
            }
            binding.chunk += 1;
            binding.sequence += 1;
            binding.try_send(Message::Text(text))
        });
        if sent != Some(true) {
            debug!("plivo call {call_id}: no active stream, dropping outbound audio");
        }
    }

    fn clear_audio(&self, call_id: &str) {
        let Ok(text) = serde_json::to_string(&PlivoOutbound::ClearAudio) else {
            return;
        };
        let sent = self.registry.with_stream_of_call(call_id, |binding| {
            if binding.state != StreamState::Active {
                return false;
            }
            binding.sequence += 1;
            binding.try_send(Message::Text(text))
        });
        if sent == Some(true) {
            debug!("plivo call {call_id}: cleared outbound audio");
        }
    }

    fn flush_audio(&self, _call_id: &str) {
        // playAudio envelopes carry arbitrary lengths, so nothing buffers.
    }

    fn answer_document(&self, _call_id: &str, stream_url: &str) -> Result<String, AdapterError> {
        Ok(format!(
            r#"<Response><Stream bidirectional="true" keepCallAlive="true" contentType="audio/x-l16;rate=8000" streamTimeout="3600">{stream_url}</Stream></Response>"#
        ))
    }

    fn handle_webhook(
        &self,
        path: &str,
        _method: &str,
        body: &str,
        _query: &HashMap<String, String>,
    ) -> WebhookReply {
        match path.trim_matches('/') {
            "answer" => match self.answer_document("", &self.stream_url()) {
                Ok(xml) => WebhookReply::xml(xml),
                Err(err) => {
                    error!("plivo answer document failed: {err}");
                    WebhookReply::not_found()
                }
            },
            "status" => {
                info!("plivo status callback: {body}");
                WebhookReply::json(serde_json::json!({"success": true}))
            }
            other => {
                warn!("plivo webhook: unknown path {other:?}");
                WebhookReply::not_found()
            }
        }
    }

    fn session(&self, call_id: &str) -> Option<SessionSnapshot> {
        self.registry.snapshot(call_id)
    }

    fn sessions(&self) -> Vec<SessionSnapshot> {
        self.registry.snapshots()
    }

    async fn handle_socket(&self, socket: WebSocketStream<TcpStream>) {
        let (sink, mut stream) = socket.split();
        let (writer_tx, writer_rx) = mpsc::channel::<Message>(64);
        let writer = tokio::spawn(provider::writer_loop(sink, writer_rx));

        // Held only until `start` registers the stream; afterwards the
        // registry owns the sole writer handle, so purging the binding
        // closes the socket.
        let mut pending_writer = Some(writer_tx);
        let mut registered: Option<String> = None;

        while let Some(message) = stream.next().await {
            let text = match message {
                Ok(Message::Text(text)) => text,
                Ok(Message::Close(_)) => break,
                Ok(_) => continue,
                Err(err) => {
                    warn!("plivo socket error: {err}");
                    break;
                }
            };
            let envelope = match serde_json::from_str::<PlivoEnvelope>(&text) {
                Ok(envelope) => envelope,
                Err(err) => {
                    warn!("plivo: malformed envelope dropped ({err})");
                    continue;
                }
            };

            match envelope {
                PlivoEnvelope::Start { start, .. } => {
                    if registered.is_some() {
                        warn!("plivo stream {}: duplicate start ignored", start.stream_id);
                        continue;
                    }
                    let Some(writer) = pending_writer.take() else {
                        continue;
                    };
                    match self.on_start(start, writer).await {
                        Ok(stream_id) => registered = Some(stream_id),
                        Err(err) => {
                            warn!("plivo: rejecting stream ({err})");
                            break;
                        }
                    }
                }
                PlivoEnvelope::Media {
                    stream_id,
                    sequence_number,
                    media,
                } => match &registered {
                    Some(sid) if *sid == stream_id => {
                        self.on_media(&stream_id, sequence_number, media).await;
                    }
                    Some(sid) => {
                        warn!("plivo: media for foreign stream {stream_id} on {sid}, dropped");
                    }
                    None => {
                        warn!("plivo: media before start on stream {stream_id}, dropped");
                    }
                },
                PlivoEnvelope::Stop { stream_id } => {
                    if registered.as_deref() == Some(stream_id.as_str()) {
                        registered = None;
                        self.finish_stream(&stream_id, EndReason::StreamStopped).await;
                        break;
                    }
                    warn!("plivo: stop for unknown stream {stream_id}");
                }
                PlivoEnvelope::Dtmf { stream_id, dtmf } => {
                    if let Some(call_id) = self.registry.call_for_stream(&stream_id) {
                        debug!(
                            "plivo call {call_id}: dtmf {} ({}ms)",
                            dtmf.digit,
                            dtmf.duration.unwrap_or_default()
                        );
                        let _ = self
                            .events
                            .send(TelephonyEvent::Dtmf {
                                call_id,
                                digit: dtmf.digit,
                            })
                            .await;
                    }
                }
                PlivoEnvelope::Unknown => {
                    warn!("plivo: unknown envelope dropped");
                }
            }
        }

        // Socket gone without a stop: the peer hung up on us.
        if let Some(stream_id) = registered {
            self.finish_stream(&stream_id, EndReason::WebsocketClosed).await;
        }
        drop(pending_writer);
        let _ = writer.await;
    }

    async fn shutdown(&self) {
        let call_ids = self.registry.call_ids();
        info!("plivo adapter shutting down ({} active calls)", call_ids.len());
        join_all(
            call_ids
                .iter()
                .map(|call_id| self.end_call(call_id, EndReason::Shutdown)),
        )
        .await;
    }
}
