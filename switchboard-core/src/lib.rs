//! # switchboard-core
//!
//! Per-call orchestration engine for a telephony AI.
//!
//! ## Architecture
//!
//! ```text
//! Switch ──TCP──► Frame codec ──► audio/DTMF queues ──► Pipeline
//!                                                         │
//!                                            VAD endpointer (pooled)
//!                                                         │
//!                                          STT ──► StateMachine ──► LLM stream
//!                                                         │
//!                                  sentence buffer ──► TTS ──► paced sender ──► Switch
//! ```
//!
//! Every call is an isolated session: its own state machine, conversation
//! history, and an exclusively held VAD model from the pool. A barge-in
//! monitor runs beside every playback and can abort it on DTMF or
//! detected voice.

#![forbid(unsafe_code)]
#![warn(clippy::all)]

pub mod audio;
pub mod config;
pub mod error;
pub mod pipeline;
pub mod prompts;
pub mod protocol;
pub mod routing;
pub mod server;
pub mod services;
pub mod session;
pub mod state;
pub mod vad;

// Convenience re-exports for downstream crates
pub use config::Config;
pub use error::{Result, SwitchboardError};
pub use pipeline::VoicePipeline;
pub use server::AudioSocketServer;
pub use session::{Session, SessionMetrics};
pub use state::{State, StateMachine};
pub use vad::{Endpointer, EnergyVad, VadPool};

#[cfg(feature = "onnx")]
pub use vad::SileroVad;
