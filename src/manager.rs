//! Telephony Manager
//!
//! Routes normalized adapter events to per-call bridges. Pipelines start
//! asynchronously, so each call begins in `AwaitingPipeline` with a
//! bounded pending-audio queue; once the pipeline reports ready the queue
//! drains FIFO into it and is gone for good. Pipeline output (TTS chunks,
//! barge-in, hangup requests) flows back through the owning adapter.

use crate::agent::{AgentDirectory, PipelineDefaults};
use crate::bridge::CallBridge;
use crate::codec;
use crate::config::ProviderKind;
use crate::event::{AudioPacket, CallRecord, EndReason, TelephonyEvent};
use crate::pipeline::{PipelineEvent, PipelineFactory, VoicePipeline};
use crate::provider::TelephonyAdapter;
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, Mutex, RwLock};
use tracing::{debug, error, info, warn};

/// Packets buffered per call between `callStarted` and pipeline readiness.
/// Beyond this the tail is dropped silently and counted.
pub const PENDING_AUDIO_CAP: usize = 100;

/// Events the manager surfaces to the rest of the application.
#[derive(Clone, Debug)]
pub enum ManagerEvent {
    CallEnded {
        call_id: String,
        reason: EndReason,
    },
    Error {
        call_id: Option<String>,
        message: String,
    },
}

/// Fire-and-forget call metadata journaling; storage lives elsewhere.
#[async_trait]
pub trait CallJournal: Send + Sync {
    async fn create_call_record(&self, record: CallRecord);
    async fn end_call_record(&self, call_id: String, reason: EndReason);
}

/// Journal that only writes log lines.
pub struct LogJournal;

#[async_trait]
impl CallJournal for LogJournal {
    async fn create_call_record(&self, record: CallRecord) {
        info!(
            "call record: {} {} {} -> {} via {}",
            record.call_id,
            match record.direction {
                crate::event::CallDirection::Inbound => "inbound",
                crate::event::CallDirection::Outbound => "outbound",
            },
            record.from,
            record.to,
            record.provider
        );
    }

    async fn end_call_record(&self, call_id: String, reason: EndReason) {
        info!("call record closed: {call_id} ({reason})");
    }
}

enum CallState {
    /// Pipeline still starting; inbound audio queues here.
    AwaitingPipeline {
        record: CallRecord,
        pending: VecDeque<AudioPacket>,
    },
    /// Pipeline live; audio flows straight through the bridge.
    Ready(CallBridge),
    /// Tombstone so a late pipeline-ready notices the teardown.
    Ended,
}

pub struct TelephonyManager {
    adapters: parking_lot::RwLock<HashMap<ProviderKind, Arc<dyn TelephonyAdapter>>>,
    calls: RwLock<HashMap<String, Arc<Mutex<CallState>>>>,
    factory: Arc<dyn PipelineFactory>,
    directory: Arc<dyn AgentDirectory>,
    journal: Arc<dyn CallJournal>,
    defaults: PipelineDefaults,
    system_prompt: Option<String>,
    upward: broadcast::Sender<ManagerEvent>,
    dropped_packets: AtomicU64,
}

impl TelephonyManager {
    pub fn new(
        factory: Arc<dyn PipelineFactory>,
        directory: Arc<dyn AgentDirectory>,
        journal: Arc<dyn CallJournal>,
        defaults: PipelineDefaults,
        system_prompt: Option<String>,
    ) -> Arc<Self> {
        let (upward, _) = broadcast::channel(64);
        Arc::new(Self {
            adapters: parking_lot::RwLock::new(HashMap::new()),
            calls: RwLock::new(HashMap::new()),
            factory,
            directory,
            journal,
            defaults,
            system_prompt,
            upward,
            dropped_packets: AtomicU64::new(0),
        })
    }

    pub fn register_adapter(&self, adapter: Arc<dyn TelephonyAdapter>) {
        self.adapters.write().insert(adapter.provider(), adapter);
    }

    pub fn adapter_for(&self, provider: ProviderKind) -> Option<Arc<dyn TelephonyAdapter>> {
        self.adapters.read().get(&provider).cloned()
    }

    /// Subscribe to upward events (`call ended`, errors).
    pub fn subscribe(&self) -> broadcast::Receiver<ManagerEvent> {
        self.upward.subscribe()
    }

    /// Packets dropped because a pending queue was full.
    pub fn dropped_packets(&self) -> u64 {
        self.dropped_packets.load(Ordering::Relaxed)
    }

    pub async fn active_calls(&self) -> usize {
        self.calls.read().await.len()
    }

    /// Consume adapter events until the channel closes. Events are
    /// processed in arrival order, which preserves per-call ordering.
    pub async fn run(self: Arc<Self>, mut events: mpsc::Receiver<TelephonyEvent>) {
        while let Some(event) = events.recv().await {
            match event {
                TelephonyEvent::CallStarted(record) => self.handle_call_started(record).await,
                TelephonyEvent::AudioReceived(packet) => self.handle_audio(packet).await,
                TelephonyEvent::CallEnded { call_id, reason } => {
                    self.handle_call_ended(call_id, reason).await;
                }
                TelephonyEvent::Dtmf { call_id, digit } => self.handle_dtmf(call_id, digit).await,
                TelephonyEvent::Error { call_id, message } => {
                    error!("adapter error (call {call_id:?}): {message}");
                    let _ = self.upward.send(ManagerEvent::Error { call_id, message });
                }
            }
        }
        debug!("telephony manager event loop finished");
    }

    async fn handle_call_started(self: &Arc<Self>, record: CallRecord) {
        info!(
            "call {} started ({} -> {})",
            record.call_id, record.from, record.to
        );
        let cell = Arc::new(Mutex::new(CallState::AwaitingPipeline {
            record: record.clone(),
            pending: VecDeque::new(),
        }));
        if self
            .calls
            .write()
            .await
            .insert(record.call_id.clone(), cell)
            .is_some()
        {
            warn!("call {} was already tracked, replacing", record.call_id);
        }

        let journal = self.journal.clone();
        let journal_record = record.clone();
        tokio::spawn(async move { journal.create_call_record(journal_record).await });

        let manager = Arc::clone(self);
        tokio::spawn(async move { manager.start_pipeline(record).await });
    }

    async fn start_pipeline(self: Arc<Self>, record: CallRecord) {
        let Some(adapter) = self.adapter_for(record.provider) else {
            error!("no adapter registered for {}", record.provider);
            return;
        };
        let agent = match self.directory.lookup_agent_for_number(&record.to).await {
            Some(agent) => agent,
            None => {
                debug!("no agent for {}, using defaults", record.to);
                self.defaults.fallback_agent(self.system_prompt.as_deref())
            }
        };
        let tts_sample_rate = agent.tts.vendor.native_sample_rate();

        let started = match self.factory.build(&record, &agent).await {
            Ok(pipeline) => match pipeline.start().await {
                Ok(events) => Ok((pipeline, events)),
                Err(err) => Err(err),
            },
            Err(err) => Err(err),
        };

        match started {
            Ok((pipeline, events)) => {
                self.attach_pipeline(record, adapter, pipeline, events, tts_sample_rate)
                    .await;
            }
            Err(err) => {
                error!("call {}: pipeline startup failed: {err}", record.call_id);
                let _ = self.upward.send(ManagerEvent::Error {
                    call_id: Some(record.call_id.clone()),
                    message: err.to_string(),
                });
                adapter
                    .end_call(&record.call_id, EndReason::PipelineFailed)
                    .await;
            }
        }
    }

    /// Drain the pending queue into the now-ready pipeline and flip the
    /// call to `Ready`. Draining holds the call lock, so packets arriving
    /// concurrently are ordered strictly after the drained ones.
    async fn attach_pipeline(
        self: Arc<Self>,
        record: CallRecord,
        adapter: Arc<dyn TelephonyAdapter>,
        pipeline: Arc<dyn VoicePipeline>,
        events: mpsc::Receiver<PipelineEvent>,
        tts_sample_rate: u32,
    ) {
        let Some(cell) = self.calls.read().await.get(&record.call_id).cloned() else {
            debug!("call {} ended before pipeline became ready", record.call_id);
            pipeline.stop().await;
            return;
        };

        let mut state = cell.lock().await;
        match std::mem::replace(&mut *state, CallState::Ended) {
            CallState::AwaitingPipeline { pending, .. } => {
                debug!(
                    "call {}: pipeline ready, draining {} buffered packets",
                    record.call_id,
                    pending.len()
                );
                for packet in pending {
                    let pcm = codec::telephony_to_pipeline(
                        &packet.payload,
                        packet.encoding,
                        packet.sample_rate,
                    );
                    if pipeline.push_audio(pcm).await.is_err() {
                        warn!("call {}: pipeline rejected buffered audio", record.call_id);
                        break;
                    }
                }
                *state = CallState::Ready(CallBridge {
                    call_id: record.call_id.clone(),
                    adapter: adapter.clone(),
                    pipeline,
                    tts_sample_rate,
                });
                drop(state);
                self.spawn_pipeline_loop(record.call_id, adapter, events, tts_sample_rate);
            }
            other => {
                *state = other;
                drop(state);
                debug!(
                    "call {}: pipeline ready after teardown, stopping it",
                    record.call_id
                );
                pipeline.stop().await;
            }
        }
    }

    /// Forward pipeline output back through the adapter for the life of
    /// the call.
    fn spawn_pipeline_loop(
        self: &Arc<Self>,
        call_id: String,
        adapter: Arc<dyn TelephonyAdapter>,
        mut events: mpsc::Receiver<PipelineEvent>,
        tts_sample_rate: u32,
    ) {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                match event {
                    PipelineEvent::TtsChunk { pcm, sample_rate } => {
                        let rate = if sample_rate > 0 {
                            sample_rate
                        } else {
                            tts_sample_rate
                        };
                        adapter.send_audio(&call_id, &pcm, rate);
                    }
                    PipelineEvent::BargeIn => {
                        debug!("call {call_id}: barge-in");
                        adapter.clear_audio(&call_id);
                    }
                    PipelineEvent::HangupRequest => {
                        info!("call {call_id}: agent requested hangup");
                        adapter
                            .end_call(&call_id, EndReason::SessionEndRequested)
                            .await;
                    }
                    PipelineEvent::Error(message) => {
                        error!("call {call_id}: pipeline error: {message}");
                        let _ = manager.upward.send(ManagerEvent::Error {
                            call_id: Some(call_id.clone()),
                            message,
                        });
                    }
                }
            }
        });
    }

    async fn handle_audio(&self, packet: AudioPacket) {
        let Some(cell) = self.calls.read().await.get(&packet.call_id).cloned() else {
            debug!("audio for unknown call {}, dropped", packet.call_id);
            return;
        };
        let mut state = cell.lock().await;
        match &mut *state {
            CallState::AwaitingPipeline { pending, .. } => {
                if pending.len() >= PENDING_AUDIO_CAP {
                    self.dropped_packets.fetch_add(1, Ordering::Relaxed);
                } else {
                    pending.push_back(packet);
                }
            }
            CallState::Ready(bridge) => {
                let pcm = codec::telephony_to_pipeline(
                    &packet.payload,
                    packet.encoding,
                    packet.sample_rate,
                );
                if bridge.pipeline.push_audio(pcm).await.is_err() {
                    warn!("call {}: pipeline rejected audio", packet.call_id);
                }
            }
            CallState::Ended => {}
        }
    }

    async fn handle_dtmf(&self, call_id: String, digit: String) {
        let Some(cell) = self.calls.read().await.get(&call_id).cloned() else {
            return;
        };
        let state = cell.lock().await;
        match &*state {
            CallState::Ready(bridge) => {
                if bridge.pipeline.push_dtmf(digit).await.is_err() {
                    warn!("call {call_id}: pipeline rejected dtmf");
                }
            }
            _ => debug!("call {call_id}: dtmf before pipeline ready, dropped"),
        }
    }

    async fn handle_call_ended(&self, call_id: String, reason: EndReason) {
        info!("call {call_id} ended ({reason})");
        let cell = self.calls.write().await.remove(&call_id);
        if let Some(cell) = cell {
            let mut state = cell.lock().await;
            if let CallState::Ready(bridge) = std::mem::replace(&mut *state, CallState::Ended) {
                bridge.pipeline.stop().await;
            }
        }

        let journal = self.journal.clone();
        let journal_id = call_id.clone();
        tokio::spawn(async move { journal.end_call_record(journal_id, reason).await });

        let _ = self.upward.send(ManagerEvent::CallEnded { call_id, reason });
    }

    /// End every active call on every adapter concurrently.
    pub async fn shutdown(&self) {
        let adapters: Vec<_> = self.adapters.read().values().cloned().collect();
        info!("shutting down {} adapter(s)", adapters.len());
        futures_util::future::join_all(adapters.iter().map(|a| a.shutdown())).await;
    }
}
