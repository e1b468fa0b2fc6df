//! Telephony Core
//!
//! The media bridge between telephony carriers and per-call voice
//! pipelines. Each active call couples four moving parts: a
//! carrier-specific WebSocket protocol, hot-path transcoding between
//! wire and pipeline audio formats, an asynchronously starting pipeline,
//! and best-effort teardown across all of them.
//!
//! # Architecture
//!
//! ```text
//! carrier ──ws──> Adapter ──TelephonyEvent──> Manager ──pcm 16k──> Pipeline
//! carrier <──ws── Adapter <──send_audio────── Manager <──PipelineEvent──┘
//! ```
//!
//! - **Adapters** ([`provider`]) own their sockets and per-stream state
//!   and normalize each carrier's envelopes into [`event::TelephonyEvent`].
//! - The **manager** ([`manager`]) owns pipelines and the pending-audio
//!   buffer that absorbs packets arriving before a pipeline is ready.
//! - The **bridge** ([`bridge`]) is the per-call record tying the two
//!   sides together once the pipeline is live.
//! - The **codec** ([`codec`]) converts μ-law/linear16 and resamples
//!   between telephony (8 kHz) and pipeline (16 kHz) rates.

pub mod agent;
pub mod bridge;
pub mod codec;
pub mod config;
pub mod event;
pub mod manager;
pub mod pipeline;
pub mod provider;
pub mod server;
pub mod session;
pub mod webhook;

pub use agent::{AgentConfig, AgentDirectory, PipelineDefaults, StaticAgentDirectory, TtsVendor};
pub use bridge::CallBridge;
pub use codec::AudioEncoding;
pub use config::{Credentials, ProviderKind, TelephonyConfig};
pub use event::{AudioPacket, CallDirection, CallRecord, EndReason, TelephonyEvent};
pub use manager::{CallJournal, LogJournal, ManagerEvent, TelephonyManager, PENDING_AUDIO_CAP};
pub use pipeline::{
    PipelineError, PipelineEvent, PipelineFactory, StubPipeline, StubPipelineFactory,
    StubPipelineHandle, VoicePipeline,
};
pub use provider::plivo::PlivoAdapter;
pub use provider::tata::TataAdapter;
pub use provider::{AdapterError, TelephonyAdapter, WebhookReply};
pub use server::{AdapterMap, MediaServer};
pub use session::{SessionRegistry, SessionSnapshot, StreamState};
