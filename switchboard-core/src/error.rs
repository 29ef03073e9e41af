use thiserror::Error;

/// All errors produced by switchboard-core.
#[derive(Debug, Error)]
pub enum SwitchboardError {
    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("connection closed by peer")]
    ConnectionClosed,

    #[error("audio processing error: {0}")]
    Audio(String),

    #[error("VAD inference error: {0}")]
    Vad(String),

    #[error("ONNX session error: {0}")]
    OnnxSession(String),

    #[error("model file not found: {path}")]
    ModelNotFound { path: std::path::PathBuf },

    #[error("speech recognition error: {0}")]
    Stt(String),

    #[error("language model error: {0}")]
    Llm(String),

    #[error("speech synthesis error: {0}")]
    Tts(String),

    #[error("server is already running")]
    AlreadyRunning,

    #[error("server is not running")]
    NotRunning,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, SwitchboardError>;
