//! TataLike Adapter
//!
//! Twilio-style media streams: JSON envelopes keyed by `streamSid`, media
//! fixed to μ-law @ 8 kHz in both directions. Outbound payloads must
//! decode to exactly 160 bytes (20 ms), so a per-call residual buffer
//! holds partial frames; `flush` pads the tail with μ-law silence and
//! follows it with a playback `mark`. The protocol defines a `clear`
//! envelope but only vendor→endpoint, so barge-in just drops the residual.
//! No REST origination and no answer document.

use crate::codec::{self, AudioEncoding};
use crate::config::{ProviderKind, TelephonyConfig};
use crate::event::{AudioPacket, CallDirection, CallRecord, EndReason, TelephonyEvent};
use crate::provider::{self, AdapterError, TelephonyAdapter, WebhookReply};
use crate::session::{SessionRegistry, SessionSnapshot, StreamBinding, StreamState};
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
use tracing::{debug, info, warn};

/// Outbound media envelopes carry exactly 20 ms of μ-law @ 8 kHz.
pub const MEDIA_FRAME_BYTES: usize = 160;

// ---------------------------------------------------------------------------
// Wire envelopes
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(tag = "event", rename_all = "camelCase")]
enum TataEnvelope {
    Connected,
    Start {
        #[serde(rename = "streamSid")]
        stream_sid: String,
        start: TataStart,
    },
    Media {
        #[serde(default, rename = "sequenceNumber")]
        sequence_number: u64,
        #[serde(rename = "streamSid")]
        stream_sid: String,
        media: TataMedia,
    },
    Stop {
        #[serde(rename = "streamSid")]
        stream_sid: String,
        #[serde(default)]
        stop: Option<TataStop>,
    },
    Dtmf {
        #[serde(rename = "streamSid")]
        stream_sid: String,
        dtmf: TataDtmf,
    },
    Mark {
        #[serde(rename = "streamSid")]
        stream_sid: String,
        mark: TataMark,
    },
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
#[allow(dead_code)]
struct TataStart {
    stream_sid: String,
    #[serde(default)]
    account_sid: Option<String>,
    call_sid: String,
    from: String,
    to: String,
    #[serde(default)]
    direction: Option<String>,
    #[serde(default)]
    media_format: Option<TataMediaFormat>,
    #[serde(default)]
    custom_parameters: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
#[allow(dead_code)]
struct TataMediaFormat {
    encoding: String,
    #[serde(default)]
    sample_rate: u32,
    #[serde(default)]
    bit_rate: u32,
    #[serde(default)]
    bit_depth: u32,
}

#[derive(Debug, Deserialize)]
#[allow(dead_code)]
struct TataMedia {
    #[serde(default)]
    chunk: u64,
    #[serde(default)]
    timestamp: u64,
    payload: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
#[allow(dead_code)]
struct TataStop {
    #[serde(default)]
    account_sid: Option<String>,
    #[serde(default)]
    call_sid: Option<String>,
    #[serde(default)]
    reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TataDtmf {
    digit: String,
}

#[derive(Debug, Deserialize)]
struct TataMark {
    name: String,
}

#[derive(Debug, Serialize)]
#[serde(tag = "event", rename_all = "camelCase")]
enum TataOutbound {
    Media {
        #[serde(rename = "streamSid")]
        stream_sid: String,
        media: TataOutboundMedia,
    },
    Mark {
        #[serde(rename = "streamSid")]
        stream_sid: String,
        mark: TataOutboundMark,
    },
}

#[derive(Debug, Serialize)]
struct TataOutboundMedia {
    payload: String,
    chunk: u64,
}

#[derive(Debug, Serialize)]
struct TataOutboundMark {
    name: String,
}

/// Emit as many full frames as the residual buffer holds, keeping the
/// remainder. Chunk numbers are per-envelope and strictly increasing
/// from 1.
fn emit_full_frames(binding: &mut StreamBinding) {
    while binding.residual.len() >= MEDIA_FRAME_BYTES {
        let frame: Vec<u8> = binding.residual.drain(..MEDIA_FRAME_BYTES).collect();
        binding.chunk += 1;
        binding.sequence += 1;
        let envelope = TataOutbound::Media {
            stream_sid: binding.stream_id.clone(),
            media: TataOutboundMedia {
                payload: BASE64.encode(&frame),
                chunk: binding.chunk,
            },
        };
        if let Ok(text) = serde_json::to_string(&envelope) {
            binding.try_send(Message::Text(text));
        }
    }
}

// ---------------------------------------------------------------------------
// Adapter
// ---------------------------------------------------------------------------

pub struct TataAdapter {
    registry: SessionRegistry,
    events: mpsc::Sender<TelephonyEvent>,
}

impl TataAdapter {
    pub fn new(
        config: &TelephonyConfig,
        events: mpsc::Sender<TelephonyEvent>,
    ) -> Result<Self, AdapterError> {
        if config.provider != ProviderKind::TataLike {
            return Err(AdapterError::Config(format!(
                "expected provider tataLike, got {}",
                config.provider
            )));
        }
        Ok(Self {
            registry: SessionRegistry::new(),
            events,
        })
    }

    async fn finish_stream(&self, stream_sid: &str, reason: EndReason) {
        if let Some(binding) = self.registry.remove_stream(stream_sid) {
            info!("tata call {} ended ({reason})", binding.call_id);
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
        start: TataStart,
        writer: mpsc::Sender<Message>,
    ) -> Result<String, AdapterError> {
        if let Some(format) = &start.media_format {
            if !format.encoding.contains("mulaw") {
                warn!(
                    "tata stream {}: unexpected media format {}, assuming mulaw",
                    start.stream_sid, format.encoding
                );
            }
        }
        let call_id = ProviderKind::TataLike.internal_call_id(&start.call_sid);
        self.registry.register(&start.stream_sid, &call_id, writer)?;

        info!(
            "tata call {} started (stream {}, {} -> {})",
            call_id, start.stream_sid, start.from, start.to
        );
        let record = CallRecord {
            call_id,
            provider: ProviderKind::TataLike,
            from: start.from,
            to: start.to,
            direction: CallDirection::parse(start.direction.as_deref()),
            started_at: Utc::now(),
            stream_id: start.stream_sid.clone(),
        };
        let stream_sid = start.stream_sid;
        let _ = self.events.send(TelephonyEvent::CallStarted(record)).await;
        Ok(stream_sid)
    }

    /// Inbound media is always μ-law @ 8 kHz; it is expanded to linear16
    /// here so downstream consumers never see companded bytes.
    async fn on_media(&self, stream_sid: &str, sequence_number: u64, media: TataMedia) {
        let Some(call_id) = self.registry.call_for_stream(stream_sid) else {
            return;
        };
        let mulaw = match BASE64.decode(media.payload.as_bytes()) {
            Ok(mulaw) => mulaw,
            Err(err) => {
                warn!("tata call {call_id}: bad media payload ({err})");
                return;
            }
        };
        let _ = self
            .events
            .send(TelephonyEvent::AudioReceived(AudioPacket {
                call_id,
                stream_id: stream_sid.to_string(),
                sequence_number,
                timestamp: media.timestamp,
                payload: codec::mulaw_to_linear(&mulaw),
                encoding: AudioEncoding::Linear16,
                sample_rate: codec::TELEPHONY_SAMPLE_RATE,
            }))
            .await;
    }
}

#[async_trait]
impl TelephonyAdapter for TataAdapter {
    fn provider(&self) -> ProviderKind {
        ProviderKind::TataLike
    }

    async fn make_call(&self, _to: &str, _from: Option<&str>) -> Result<String, AdapterError> {
        Err(AdapterError::Unsupported("outbound origination"))
    }

    async fn end_call(&self, call_id: &str, reason: EndReason) {
        self.registry.set_state(call_id, StreamState::Draining);
        match self.registry.remove_call(call_id) {
            Some(binding) => {
                info!("tata call {} ended ({reason})", binding.call_id);
                let _ = self
                    .events
                    .send(TelephonyEvent::CallEnded {
                        call_id: binding.call_id,
                        reason,
                    })
                    .await;
            }
            None => warn!("end_call for unknown call {call_id}, ignoring"),
        }
    }

    fn send_audio(&self, call_id: &str, pcm: &[u8], sample_rate: u32) {
        let mulaw = codec::pipeline_to_telephony(pcm, sample_rate, AudioEncoding::Mulaw);
        let sent = self.registry.with_stream_of_call(call_id, |binding| {
            if binding.state != StreamState::Active {
                return false;
            }
            binding.residual.extend_from_slice(&mulaw);
            emit_full_frames(binding);
            true
        });
        if sent != Some(true) {
            debug!("tata call {call_id}: no active stream, dropping outbound audio");
        }
    }

    fn clear_audio(&self, call_id: &str) {
        // The schema defines a vendor-side `clear` envelope; it is not
        // ours to send, so barge-in only discards buffered output.
        self.registry.with_stream_of_call(call_id, |binding| {
            binding.residual.clear();
        });
    }

    fn flush_audio(&self, call_id: &str) {
        self.registry.with_stream_of_call(call_id, |binding| {
            if binding.state != StreamState::Active {
                return;
            }
            if !binding.residual.is_empty() {
                let padded = binding.residual.len().div_ceil(MEDIA_FRAME_BYTES) * MEDIA_FRAME_BYTES;
                binding.residual.resize(padded, codec::MULAW_SILENCE);
                emit_full_frames(binding);
            }

            let name = format!("complete_{}", binding.chunk);
            binding.sequence += 1;
            let envelope = TataOutbound::Mark {
                stream_sid: binding.stream_id.clone(),
                mark: TataOutboundMark { name: name.clone() },
            };
            if let Ok(text) = serde_json::to_string(&envelope) {
                if binding.try_send(Message::Text(text)) {
                    binding.pending_marks.push(name);
                }
            }
        });
    }

    fn answer_document(&self, _call_id: &str, _stream_url: &str) -> Result<String, AdapterError> {
        Err(AdapterError::Unsupported("answer document"))
    }

    fn handle_webhook(
        &self,
        path: &str,
        _method: &str,
        _body: &str,
        _query: &HashMap<String, String>,
    ) -> WebhookReply {
        warn!("tata webhook: unknown path {path:?}");
        WebhookReply::not_found()
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

        let mut pending_writer = Some(writer_tx);
        let mut registered: Option<String> = None;

        while let Some(message) = stream.next().await {
            let text = match message {
                Ok(Message::Text(text)) => text,
                Ok(Message::Close(_)) => break,
                Ok(_) => continue,
                Err(err) => {
                    warn!("tata socket error: {err}");
                    break;
                }
            };
            let envelope = match serde_json::from_str::<TataEnvelope>(&text) {
                Ok(envelope) => envelope,
                Err(err) => {
                    warn!("tata: malformed envelope dropped ({err})");
                    continue;
                }
            };

            match envelope {
                TataEnvelope::Connected => {
                    debug!("tata: stream connected");
                }
                TataEnvelope::Start { start, .. } => {
                    if registered.is_some() {
                        warn!("tata stream {}: duplicate start ignored", start.stream_sid);
                        continue;
                    }
                    let Some(writer) = pending_writer.take() else {
                        continue;
                    };
                    match self.on_start(start, writer).await {
                        Ok(stream_sid) => registered = Some(stream_sid),
                        Err(err) => {
                            warn!("tata: rejecting stream ({err})");
                            break;
                        }
                    }
                }
                TataEnvelope::Media {
                    stream_sid,
                    sequence_number,
                    media,
                } => match &registered {
                    Some(sid) if *sid == stream_sid => {
                        self.on_media(&stream_sid, sequence_number, media).await;
                    }
                    Some(sid) => {
                        warn!("tata: media for foreign stream {stream_sid} on {sid}, dropped");
                    }
                    None => {
                        warn!("tata: media before start on stream {stream_sid}, dropped");
                    }
                },
                TataEnvelope::Stop { stream_sid, stop } => {
                    if registered.as_deref() == Some(stream_sid.as_str()) {
                        if let Some(reason) = stop.and_then(|s| s.reason) {
                            debug!("tata stream {stream_sid}: carrier stop reason {reason:?}");
                        }
                        registered = None;
                        self.finish_stream(&stream_sid, EndReason::StreamStopped).await;
                        break;
                    }
                    warn!("tata: stop for unknown stream {stream_sid}");
                }
                TataEnvelope::Dtmf { stream_sid, dtmf } => {
                    if let Some(call_id) = self.registry.call_for_stream(&stream_sid) {
                        let _ = self
                            .events
                            .send(TelephonyEvent::Dtmf {
                                call_id,
                                digit: dtmf.digit,
                            })
                            .await;
                    }
                }
                TataEnvelope::Mark { stream_sid, mark } => {
                    let call_id = self.registry.call_for_stream(&stream_sid).unwrap_or_default();
                    let acked = self
                        .registry
                        .with_stream_of_call(&call_id, |binding| {
                            let before = binding.pending_marks.len();
                            binding.pending_marks.retain(|name| *name != mark.name);
                            before != binding.pending_marks.len()
                        })
                        .unwrap_or(false);
                    if !acked {
                        debug!("tata stream {stream_sid}: unmatched mark {}", mark.name);
                    }
                }
                TataEnvelope::Unknown => {
                    warn!("tata: unknown envelope dropped");
                }
            }
        }

        if let Some(stream_sid) = registered {
            self.finish_stream(&stream_sid, EndReason::WebsocketClosed).await;
        }
        drop(pending_writer);
        let _ = writer.await;
    }

    async fn shutdown(&self) {
        let call_ids = self.registry.call_ids();
        info!("tata adapter shutting down ({} active calls)", call_ids.len());
        join_all(
            call_ids
                .iter()
                .map(|call_id| self.end_call(call_id, EndReason::Shutdown)),
        )
        .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::samples_to_bytes;

    #[test]
    fn test_parse_start_envelope() {
        let text = r#"{
            "event": "start",
            "sequenceNumber": 1,
            "streamSid": "MZ1",
            "start": {
                "streamSid": "MZ1",
                "accountSid": "AC1",
                "callSid": "CA1",
                "from": "+15550001",
                "to": "+15550002",
                "direction": "inbound",
                "mediaFormat": {"encoding": "audio/x-mulaw", "sampleRate": 8000, "bitRate": 64, "bitDepth": 8}
            }
        }"#;
        let envelope: TataEnvelope = serde_json::from_str(text).unwrap();
        match envelope {
            TataEnvelope::Start { stream_sid, start } => {
                assert_eq!(stream_sid, "MZ1");
                assert_eq!(start.call_sid, "CA1");
                assert_eq!(start.media_format.unwrap().encoding, "audio/x-mulaw");
            }
            other => panic!("expected start, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_connected_and_mark() {
        let connected: TataEnvelope = serde_json::from_str(r#"{"event":"connected"}"#).unwrap();
        assert!(matches!(connected, TataEnvelope::Connected));

        let mark: TataEnvelope = serde_json::from_str(
            r#"{"event":"mark","sequenceNumber":9,"streamSid":"MZ1","mark":{"name":"complete_3"}}"#,
        )
        .unwrap();
        match mark {
            TataEnvelope::Mark { mark, .. } => assert_eq!(mark.name, "complete_3"),
            other => panic!("expected mark, got {other:?}"),
        }
    }

    fn adapter_with_stream() -> (TataAdapter, mpsc::Receiver<Message>) {
        let config: TelephonyConfig = serde_json::from_str(
            r#"{"provider": "tataLike", "webhookBaseUrl": "https://voice.example.com"}"#,
        )
        .unwrap();
        let (events, _rx) = mpsc::channel(64);
        let adapter = TataAdapter::new(&config, events).unwrap();
        let (writer_tx, writer_rx) = mpsc::channel(64);
        adapter.registry.register("MZ1", "tata_CA1", writer_tx).unwrap();
        (adapter, writer_rx)
    }

    fn wire_frames(rx: &mut mpsc::Receiver<Message>) -> Vec<serde_json::Value> {
        let mut out = Vec::new();
        while let Ok(Message::Text(text)) = rx.try_recv() {
            out.push(serde_json::from_str(&text).unwrap());
        }
        out
    }

    #[tokio::test]
    async fn test_outbound_framing_keeps_residual() {
        let (adapter, mut rx) = adapter_with_stream();

        // 400 samples @ 16 kHz become 200 μ-law bytes: one full frame on
        // the wire, 40 bytes retained.
        let pcm = samples_to_bytes(&vec![0i16; 400]);
        adapter.send_audio("tata_CA1", &pcm, 16_000);

        let frames = wire_frames(&mut rx);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0]["event"], "media");
        assert_eq!(frames[0]["streamSid"], "MZ1");
        assert_eq!(frames[0]["media"]["chunk"], 1);
        let payload = BASE64
            .decode(frames[0]["media"]["payload"].as_str().unwrap())
            .unwrap();
        assert_eq!(payload.len(), MEDIA_FRAME_BYTES);

        let residual = adapter
            .registry
            .with_stream_of_call("tata_CA1", |b| b.residual.len())
            .unwrap();
        assert_eq!(residual, 40);
    }

    #[tokio::test]
    async fn test_flush_pads_with_silence_and_marks() {
        let (adapter, mut rx) = adapter_with_stream();

        let pcm = samples_to_bytes(&vec![100i16; 400]);
        adapter.send_audio("tata_CA1", &pcm, 16_000);
        let _ = wire_frames(&mut rx);

        adapter.flush_audio("tata_CA1");
        let frames = wire_frames(&mut rx);
        assert_eq!(frames.len(), 2);

        assert_eq!(frames[0]["event"], "media");
        assert_eq!(frames[0]["media"]["chunk"], 2);
        let payload = BASE64
            .decode(frames[0]["media"]["payload"].as_str().unwrap())
            .unwrap();
        assert_eq!(payload.len(), MEDIA_FRAME_BYTES);
        assert!(payload[40..].iter().all(|&b| b == codec::MULAW_SILENCE));

        assert_eq!(frames[1]["event"], "mark");
        let name = frames[1]["mark"]["name"].as_str().unwrap();
        let suffix = name.strip_prefix("complete_").unwrap();
        assert!(suffix.parse::<u64>().is_ok(), "mark name {name}");

        let pending = adapter
            .registry
            .snapshot("tata_CA1")
            .unwrap()
            .pending_marks;
        assert_eq!(pending, 1);
    }

    #[tokio::test]
    async fn test_every_frame_is_exactly_160_bytes() {
        let (adapter, mut rx) = adapter_with_stream();

        for samples in [37usize, 411, 160, 1000, 3] {
            let pcm = samples_to_bytes(&vec![0i16; samples * 2]);
            adapter.send_audio("tata_CA1", &pcm, 16_000);
        }
        adapter.flush_audio("tata_CA1");

        let mut chunks = Vec::new();
        for frame in wire_frames(&mut rx) {
            if frame["event"] == "media" {
                let payload = BASE64
                    .decode(frame["media"]["payload"].as_str().unwrap())
                    .unwrap();
                assert_eq!(payload.len(), MEDIA_FRAME_BYTES);
                chunks.push(frame["media"]["chunk"].as_u64().unwrap());
            }
        }
        // Chunk counters are 1, 2, 3, … in send order.
        let expected: Vec<u64> = (1..=chunks.len() as u64).collect();
        assert_eq!(chunks, expected);
    }

    #[tokio::test]
    async fn test_barge_in_drops_residual_without_wire_traffic() {
        let (adapter, mut rx) = adapter_with_stream();

        let pcm = samples_to_bytes(&vec![0i16; 100]);
        adapter.send_audio("tata_CA1", &pcm, 16_000);
        assert!(wire_frames(&mut rx).is_empty());

        adapter.clear_audio("tata_CA1");
        assert!(wire_frames(&mut rx).is_empty());
        let residual = adapter
            .registry
            .with_stream_of_call("tata_CA1", |b| b.residual.len())
            .unwrap();
        assert_eq!(residual, 0);
    }

    #[tokio::test]
    async fn test_unsupported_operations() {
        let config: TelephonyConfig = serde_json::from_str(
            r#"{"provider": "tataLike", "webhookBaseUrl": "https://voice.example.com"}"#,
        )
        .unwrap();
        let (events, _rx) = mpsc::channel(8);
        let adapter = TataAdapter::new(&config, events).unwrap();

        assert!(matches!(
            adapter.make_call("+15550002", None).await.unwrap_err(),
            AdapterError::Unsupported(_)
        ));
        assert!(matches!(
            adapter.answer_document("tata_CA1", "wss://x").unwrap_err(),
            AdapterError::Unsupported(_)
        ));
    }
}
