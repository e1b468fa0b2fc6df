//! Call Bridge
//!
//! The per-call glue record: once a pipeline is ready, the bridge holds
//! everything the manager needs to move audio in both directions for that
//! call. It exposes no behavior of its own; the manager drives it.

use crate::pipeline::VoicePipeline;
use crate::provider::TelephonyAdapter;
use std::sync::Arc;

pub struct CallBridge {
    pub call_id: String,
    pub adapter: Arc<dyn TelephonyAdapter>,
    pub pipeline: Arc<dyn VoicePipeline>,
    /// Native rate of the TTS vendor chosen for this call, recorded once
    /// so outbound chunks are transcoded without re-querying the pipeline.
    pub tts_sample_rate: u32,
}
