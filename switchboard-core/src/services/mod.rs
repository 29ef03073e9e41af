//! Clients for the four external AI services.
//!
//! The engine depends only on the traits here; concrete deployments pick
//! HTTP clients or in-process stubs per service. VAD is the exception —
//! its models live in [`crate::vad`] because they are pooled per call
//! rather than shared.

pub mod llm;
pub mod stt;
pub mod tts;

pub use llm::{
    ConversationContext, LanguageModel, LlmResponse, Message, OllamaClient, Role, SentenceBuffer,
    StubLlm, TokenStream,
};
pub use stt::{HttpSttClient, SpeechToText, StubStt, TranscriptionResult};
pub use tts::{voice_for, HttpTtsClient, StubTts, TextToSpeech};
