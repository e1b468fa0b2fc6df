//! Session Registry
//!
//! Per-adapter bookkeeping for active media streams: the
//! `streamId ↔ callId ↔ socket writer` maps, outbound counters, the
//! residual send buffer for frame-aligned providers, and pending marks.
//! All mutation goes through this struct; locks are short-lived and never
//! held across an await.

use crate::provider::AdapterError;
use parking_lot::RwLock;
use std::collections::HashMap;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tracing::warn;

/// Lifecycle of one media stream.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StreamState {
    /// Socket open, no `start` envelope yet.
    AwaitingStart,
    /// Normal bidirectional operation.
    Active,
    /// Tear-down in progress; no more outbound media accepted.
    Draining,
    /// All per-stream state purged.
    Closed,
}

/// State for one active stream, 1:1 with its call.
#[derive(Debug)]
pub struct StreamBinding {
    pub stream_id: String,
    pub call_id: String,
    pub state: StreamState,
    /// Outbound media envelope counter, strictly increasing from 1.
    pub chunk: u64,
    /// Diagnostic counter over all outbound envelopes.
    pub sequence: u64,
    /// Outbound bytes not yet filling a full wire frame.
    pub residual: Vec<u8>,
    /// Mark names sent but not yet acknowledged by the carrier.
    pub pending_marks: Vec<String>,
    writer: mpsc::Sender<Message>,
}

impl StreamBinding {
    /// Enqueue a wire message without blocking. Returns false if the
    /// socket is gone or its mailbox is full.
    pub fn try_send(&self, message: Message) -> bool {
        match self.writer.try_send(message) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!("stream {}: outbound mailbox full, dropping frame", self.stream_id);
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }
}

/// Read-only view of one session for diagnostics.
#[derive(Clone, Debug)]
pub struct SessionSnapshot {
    pub call_id: String,
    pub stream_id: String,
    pub state: StreamState,
    pub chunks_sent: u64,
    pub pending_marks: usize,
}

#[derive(Default, Debug)]
struct Inner {
    streams: HashMap<String, StreamBinding>,
    call_to_stream: HashMap<String, String>,
}

/// The single owner of stream/call bindings for one adapter.
#[derive(Default, Debug)]
pub struct SessionRegistry {
    inner: RwLock<Inner>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind a new stream to a call. Rebinding an already-registered
    /// `stream_id` (or a call that already has a stream) is a protocol
    /// error; the caller closes the offending socket.
    pub fn register(
        &self,
        stream_id: &str,
        call_id: &str,
        writer: mpsc::Sender<Message>,
    ) -> Result<(), AdapterError> {
        let mut inner = self.inner.write();
        if inner.streams.contains_key(stream_id) {
            return Err(AdapterError::Protocol(format!(
                "stream {stream_id} is already registered"
            )));
        }
        if inner.call_to_stream.contains_key(call_id) {
            return Err(AdapterError::Protocol(format!(
                "call {call_id} already has an active stream"
            )));
        }
        inner.streams.insert(
            stream_id.to_string(),
            StreamBinding {
                stream_id: stream_id.to_string(),
                call_id: call_id.to_string(),
                state: StreamState::Active,
                chunk: 0,
                sequence: 0,
                residual: Vec::new(),
                pending_marks: Vec::new(),
                writer,
            },
        );
        inner
            .call_to_stream
            .insert(call_id.to_string(), stream_id.to_string());
        Ok(())
    }

    /// Purge a stream and its call mapping. Returns the binding so the
    /// caller can emit the terminal event exactly once.
    pub fn remove_stream(&self, stream_id: &str) -> Option<StreamBinding> {
        let mut inner = self.inner.write();
        let mut binding = inner.streams.remove(stream_id)?;
        inner.call_to_stream.remove(&binding.call_id);
        binding.state = StreamState::Closed;
        Some(binding)
    }

    /// Purge by call id (local hangup path).
    pub fn remove_call(&self, call_id: &str) -> Option<StreamBinding> {
        let mut inner = self.inner.write();
        let stream_id = inner.call_to_stream.remove(call_id)?;
        let mut binding = inner.streams.remove(&stream_id)?;
        binding.state = StreamState::Closed;
        Some(binding)
    }

    pub fn call_for_stream(&self, stream_id: &str) -> Option<String> {
        self.inner
            .read()
            .streams
            .get(stream_id)
            .map(|b| b.call_id.clone())
    }

    /// Run `f` against the binding for `call_id`, if any.
    pub fn with_stream_of_call<R>(
        &self,
        call_id: &str,
        f: impl FnOnce(&mut StreamBinding) -> R,
    ) -> Option<R> {
        let mut inner = self.inner.write();
        let stream_id = inner.call_to_stream.get(call_id)?.clone();
        inner.streams.get_mut(&stream_id).map(f)
    }

    pub fn set_state(&self, call_id: &str, state: StreamState) {
        self.with_stream_of_call(call_id, |binding| binding.state = state);
    }

    pub fn snapshot(&self, call_id: &str) -> Option<SessionSnapshot> {
        let inner = self.inner.read();
        let stream_id = inner.call_to_stream.get(call_id)?;
        inner.streams.get(stream_id).map(snapshot_of)
    }

    pub fn snapshots(&self) -> Vec<SessionSnapshot> {
        self.inner.read().streams.values().map(snapshot_of).collect()
    }

    pub fn call_ids(&self) -> Vec<String> {
        self.inner.read().call_to_stream.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.read().streams.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn snapshot_of(binding: &StreamBinding) -> SessionSnapshot {
    SessionSnapshot {
        call_id: binding.call_id.clone(),
        stream_id: binding.stream_id.clone(),
        state: binding.state,
        chunks_sent: binding.chunk,
        pending_marks: binding.pending_marks.len(),
    }
}
