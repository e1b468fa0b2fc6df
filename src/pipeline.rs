//! Voice Pipeline Contract
//!
//! The STT → LLM → TTS pipeline is a black box to this crate: it consumes
//! 16 kHz linear16 frames and emits synthesized chunks, barge-in signals,
//! and hangup requests. `start` resolves once the pipeline is ready to
//! accept audio; until then the manager buffers inbound packets.

use crate::agent::AgentConfig;
use crate::event::CallRecord;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tracing::debug;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("pipeline startup failed: {0}")]
    StartupFailed(String),

    #[error("pipeline is not running")]
    NotRunning,

    #[error("pipeline channel closed")]
    ChannelClosed,
}

/// Events flowing out of a running pipeline.
#[derive(Clone, Debug)]
pub enum PipelineEvent {
    /// Synthesized audio, linear16 at the TTS vendor's native rate.
    TtsChunk { pcm: Vec<u8>, sample_rate: u32 },
    /// The caller spoke over playback; queued outbound audio must go.
    BargeIn,
    /// The agent decided the conversation is over.
    HangupRequest,
    /// Mid-call failure; the call itself continues.
    Error(String),
}

/// One per-call voice pipeline.
#[async_trait]
pub trait VoicePipeline: Send + Sync {
    fn name(&self) -> &'static str;

    /// Bring the pipeline up. Resolves with the event stream once the
    /// pipeline is ready for audio; calling it twice is an error.
    async fn start(&self) -> Result<mpsc::Receiver<PipelineEvent>, PipelineError>;

    /// Feed one chunk of caller audio (linear16 @ 16 kHz).
    async fn push_audio(&self, pcm: Vec<u8>) -> Result<(), PipelineError>;

    /// Feed a DTMF digit.
    async fn push_dtmf(&self, digit: String) -> Result<(), PipelineError>;

    /// Tear down; cancels in-flight work.
    async fn stop(&self);
}

/// Builds a pipeline for one call from its agent configuration.
#[async_trait]
pub trait PipelineFactory: Send + Sync {
    async fn build(
        &self,
        call: &CallRecord,
        agent: &AgentConfig,
    ) -> Result<Arc<dyn VoicePipeline>, PipelineError>;
}

// ---------------------------------------------------------------------------
// Stub backend
// ---------------------------------------------------------------------------

/// Test/bring-up pipeline with no models behind it. The paired
/// [`StubPipelineHandle`] injects events and observes pushed audio, which
/// is how tests script TTS chunks, barge-in, and hangup.
pub struct StubPipeline {
    ready_delay: Duration,
    fail_start: bool,
    receiver: Mutex<Option<mpsc::Receiver<PipelineEvent>>>,
    audio_tx: mpsc::UnboundedSender<Vec<u8>>,
    stopped: AtomicBool,
}

/// Controller half of a [`StubPipeline`].
pub struct StubPipelineHandle {
    /// Inject pipeline events (TTS chunks, barge-in, hangup).
    pub events: mpsc::Sender<PipelineEvent>,
    /// Audio pushed into the pipeline, in order.
    pub audio: mpsc::UnboundedReceiver<Vec<u8>>,
}

impl StubPipeline {
    pub fn new() -> (Arc<Self>, StubPipelineHandle) {
        Self::with_ready_delay(Duration::ZERO)
    }

    /// Delay `start` to widen the window where inbound audio races
    /// pipeline readiness.
    pub fn with_ready_delay(ready_delay: Duration) -> (Arc<Self>, StubPipelineHandle) {
        Self::build_pair(ready_delay, false)
    }

    /// A pipeline whose startup always fails.
    pub fn failing() -> (Arc<Self>, StubPipelineHandle) {
        Self::build_pair(Duration::ZERO, true)
    }

    fn build_pair(ready_delay: Duration, fail_start: bool) -> (Arc<Self>, StubPipelineHandle) {
        let (events_tx, events_rx) = mpsc::channel(64);
        let (audio_tx, audio_rx) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                ready_delay,
                fail_start,
                receiver: Mutex::new(Some(events_rx)),
                audio_tx,
                stopped: AtomicBool::new(false),
            }),
            StubPipelineHandle {
                events: events_tx,
                audio: audio_rx,
            },
        )
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl VoicePipeline for StubPipeline {
    fn name(&self) -> &'static str {
        "stub"
    }

    async fn start(&self) -> Result<mpsc::Receiver<PipelineEvent>, PipelineError> {
        if self.fail_start {
            return Err(PipelineError::StartupFailed("stub configured to fail".into()));
        }
        if !self.ready_delay.is_zero() {
            tokio::time::sleep(self.ready_delay).await;
        }
        self.receiver
            .lock()
            .await
            .take()
            .ok_or(PipelineError::NotRunning)
    }

    async fn push_audio(&self, pcm: Vec<u8>) -> Result<(), PipelineError> {
        if self.is_stopped() {
            return Err(PipelineError::NotRunning);
        }
        self.audio_tx.send(pcm).map_err(|_| PipelineError::ChannelClosed)
    }

    async fn push_dtmf(&self, digit: String) -> Result<(), PipelineError> {
        debug!("stub pipeline: dtmf {digit}");
        Ok(())
    }

    async fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }
}

/// Factory handing out stub pipelines whose audio is silently drained.
/// Stands in until real STT/LLM/TTS backends are wired up.
#[derive(Default)]
pub struct StubPipelineFactory {
    ready_delay: Duration,
}

impl StubPipelineFactory {
    pub fn new(ready_delay: Duration) -> Self {
        Self { ready_delay }
    }
}

#[async_trait]
impl PipelineFactory for StubPipelineFactory {
    async fn build(
        &self,
        call: &CallRecord,
        agent: &AgentConfig,
    ) -> Result<Arc<dyn VoicePipeline>, PipelineError> {
        debug!(
            "building stub pipeline for call {} (agent {}, stt {}, llm {}, tts {:?})",
            call.call_id, agent.name, agent.stt.provider, agent.llm.provider, agent.tts.vendor
        );
        let (pipeline, mut handle) = StubPipeline::with_ready_delay(self.ready_delay);
        tokio::spawn(async move {
            while handle.audio.recv().await.is_some() {}
        });
        Ok(pipeline)
    }
}
