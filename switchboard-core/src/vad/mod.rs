//! Voice activity detection and endpointing.
//!
//! Two layers:
//!
//! - `VadModel` scores one fixed window of audio with a speech
//!   probability. Swap in `SileroVad` (feature `onnx`) or `EnergyVad`
//!   without touching the endpointing logic.
//! - `Endpointer` owns one model plus a window accumulation buffer and
//!   turns per-window probabilities into `SpeechStart` / `Speech` /
//!   `SpeechEnd` / `Silence` events using millisecond hysteresis.
//!
//! Each call session holds its own `Endpointer` (borrowed from the
//! `VadPool`), so recurrent model state is never shared across calls.

pub mod energy;
pub mod pool;

#[cfg(feature = "onnx")]
pub mod silero;

#[cfg(feature = "onnx")]
pub use silero::SileroVad;

pub use energy::EnergyVad;
pub use pool::{PooledVad, VadPool};

use crate::config::VadConfig;
use crate::error::Result;
use tracing::error;

/// Endpointing event for one processed chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpeechEvent {
    /// No speech in progress.
    Silence,
    /// Enough speech accumulated to open an utterance.
    SpeechStart,
    /// Utterance in progress (including brief pauses).
    Speech,
    /// Enough silence accumulated to close the utterance.
    SpeechEnd,
}

/// Result of feeding one chunk through the endpointer.
#[derive(Debug, Clone, Copy)]
pub struct VadResult {
    pub event: SpeechEvent,
    pub probability: f32,
}

/// Per-utterance endpointing counters. One per concurrent detection
/// context (listening loop, barge-in monitor), never shared.
#[derive(Debug, Clone, Copy, Default)]
pub struct VadSessionState {
    pub is_speaking: bool,
    pub speech_samples: u64,
    pub silence_samples: u64,
}

impl VadSessionState {
    pub fn reset(&mut self) {
        self.is_speaking = false;
        self.speech_samples = 0;
        self.silence_samples = 0;
    }
}

/// Contract for window-level speech scoring backends.
///
/// Implementors may be stateful (RNN hidden state); all per-call state is
/// isolated by giving each session its own instance via the pool.
pub trait VadModel: Send + 'static {
    /// Score one window of mono f32 audio; returns speech probability in
    /// [0, 1].
    fn predict(&mut self, window: &[f32], sample_rate: u32) -> Result<f32>;

    /// Samples per inference window. Silero expects 512 at 16 kHz and 256
    /// at 8 kHz; other backends follow the same framing.
    fn window_size(&self, sample_rate: u32) -> usize {
        if sample_rate >= 16_000 {
            512
        } else {
            256
        }
    }

    /// Clear recurrent state between utterances.
    fn reset(&mut self);
}

/// One model instance plus windowing and hysteresis.
pub struct Endpointer {
    model: Box<dyn VadModel>,
    config: VadConfig,
    /// Accumulates input until a full model window is available.
    window_buf: Vec<f32>,
}

impl Endpointer {
    pub fn new(model: Box<dyn VadModel>, config: VadConfig) -> Self {
        Self {
            model,
            config,
            window_buf: Vec::new(),
        }
    }

    /// Feed one chunk of audio.
    ///
    /// Input accumulates until at least one model window is available;
    /// exactly one window is consumed per call and the remainder kept.
    /// Sub-window calls return `Silence` without advancing `state`.
    pub fn process_chunk(
        &mut self,
        samples: &[f32],
        sample_rate: u32,
        state: &mut VadSessionState,
        threshold_override: Option<f32>,
    ) -> VadResult {
        self.window_buf.extend_from_slice(samples);

        let window_size = self.model.window_size(sample_rate);
        if self.window_buf.len() < window_size {
            return VadResult {
                event: SpeechEvent::Silence,
                probability: 0.0,
            };
        }

        let window: Vec<f32> = self.window_buf.drain(..window_size).collect();
        let probability = match self.model.predict(&window, sample_rate) {
            Ok(p) => p,
            Err(e) => {
                error!("VAD inference error: {e}");
                return VadResult {
                    event: SpeechEvent::Silence,
                    probability: 0.0,
                };
            }
        };

        let threshold = threshold_override.unwrap_or(self.config.threshold);
        let event = self.advance_state(state, probability >= threshold, samples.len() as u64, sample_rate);
        VadResult { event, probability }
    }

    fn advance_state(
        &self,
        state: &mut VadSessionState,
        is_speech: bool,
        chunk_samples: u64,
        sample_rate: u32,
    ) -> SpeechEvent {
        let to_ms = |samples: u64| samples * 1_000 / sample_rate.max(1) as u64;

        if is_speech {
            state.speech_samples += chunk_samples;
            state.silence_samples = 0;

            if !state.is_speaking && to_ms(state.speech_samples) >= self.config.min_speech_duration_ms {
                state.is_speaking = true;
                return SpeechEvent::SpeechStart;
            }
            if state.is_speaking {
                SpeechEvent::Speech
            } else {
                SpeechEvent::Silence
            }
        } else {
            state.silence_samples += chunk_samples;

            if state.is_speaking {
                if to_ms(state.silence_samples) >= self.config.min_silence_duration_ms {
                    state.is_speaking = false;
                    state.speech_samples = 0;
                    return SpeechEvent::SpeechEnd;
                }
                // Brief pause inside the utterance.
                return SpeechEvent::Speech;
            }
            state.speech_samples = 0;
            SpeechEvent::Silence
        }
    }

    /// Clear windowing and model state between utterances.
    pub fn reset(&mut self) {
        self.window_buf.clear();
        self.model.reset();
    }
}
