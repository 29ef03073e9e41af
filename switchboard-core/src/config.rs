//! Engine configuration.
//!
//! One section per subsystem, each with defaults tuned for narrowband
//! telephony. The app binary loads a JSON file over these defaults and
//! applies `SWITCHBOARD_*` environment overrides before handing the result
//! to the server.

use serde::{Deserialize, Serialize};

/// Audio transport and DSP settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    /// TCP listener address for the telephony switch.
    pub host: String,
    pub port: u16,

    /// The switch sends signed 16-bit PCM at this rate.
    pub input_sample_rate: u32,
    /// Recognition models expect this rate.
    pub stt_sample_rate: u32,
    /// Audio written back to the switch.
    pub output_sample_rate: u32,

    /// Telephone band-pass corner frequencies (Hz).
    pub telephone_lowcut: f64,
    pub telephone_highcut: f64,

    /// Outbound frame payload size in bytes. 320 = 20 ms at 8 kHz mono 16-bit.
    pub chunk_size: usize,

    /// Directory holding prerecorded WAV sound effects (SIT tones etc.).
    pub sounds_dir: Option<std::path::PathBuf>,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 9092,
            input_sample_rate: 8_000,
            stt_sample_rate: 16_000,
            output_sample_rate: 8_000,
            telephone_lowcut: 300.0,
            telephone_highcut: 3_400.0,
            chunk_size: 320,
            sounds_dir: None,
        }
    }
}

/// Endpointing and barge-in tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VadConfig {
    /// Speech probability threshold in [0, 1].
    pub threshold: f32,
    /// Speech must persist this long before SPEECH_START fires.
    pub min_speech_duration_ms: u64,
    /// Silence must persist this long before SPEECH_END fires.
    pub min_silence_duration_ms: u64,
    /// Hard cap on a single utterance.
    pub max_utterance_seconds: u64,
    /// Raised threshold used by the barge-in monitor to suppress
    /// echo/sidetone false positives.
    pub barge_in_threshold: f32,
    pub barge_in_enabled: bool,
    /// Number of endpointer models in the per-call pool.
    pub pool_size: usize,
    /// Override path for the Silero VAD ONNX model.
    pub model_path: Option<std::path::PathBuf>,
}

impl Default for VadConfig {
    fn default() -> Self {
        Self {
            threshold: 0.5,
            min_speech_duration_ms: 250,
            min_silence_duration_ms: 500,
            max_utterance_seconds: 30,
            barge_in_threshold: 0.8,
            barge_in_enabled: true,
            pool_size: 3,
            model_path: None,
        }
    }
}

/// Speech recognition client settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SttConfig {
    /// HTTP endpoint of the recognition service. Empty selects the stub.
    pub endpoint: String,
    pub language: String,
    /// Transcripts below this confidence are reported as empty.
    pub min_confidence: f32,
    /// Inputs longer than this are trimmed (keeping the most recent audio).
    pub max_audio_seconds: u64,
}

impl Default for SttConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            language: "en".into(),
            min_confidence: 0.2,
            max_audio_seconds: 30,
        }
    }
}

/// Generation policy for the language model.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    /// Base URL of the model server. Empty selects the stub.
    pub endpoint: String,
    pub model: String,
    pub temperature: f32,
    pub top_p: f32,
    /// Keep responses concise for the phone.
    pub max_tokens: u32,
    /// Prompt evaluation dominates cold latency, so the first-token
    /// deadline is much larger than the inter-token one.
    pub first_token_timeout_secs: u64,
    pub inter_token_timeout_secs: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            model: "qwen2.5:3b".into(),
            temperature: 0.7,
            top_p: 0.9,
            max_tokens: 150,
            first_token_timeout_secs: 25,
            inter_token_timeout_secs: 5,
        }
    }
}

/// Speech synthesis settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TtsConfig {
    /// HTTP endpoint of the synthesis service. Empty selects the stub.
    pub endpoint: String,
    pub voice: String,
    pub speed: f32,
    /// Synthesis service output rate.
    pub sample_rate: u32,
    /// Sentence chunking for streaming playback.
    pub min_sentence_length: usize,
    pub sentence_delimiters: String,
}

impl Default for TtsConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            voice: "af_bella".into(),
            speed: 1.0,
            sample_rate: 24_000,
            min_sentence_length: 10,
            sentence_delimiters: ".!?,".into(),
        }
    }
}

/// Conversation pacing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Seconds of silence before the "are you still there?" prompt.
    pub silence_prompt_secs: f64,
    /// Additional seconds of silence before the goodbye message.
    pub silence_goodbye_secs: f64,
    /// Gap that finalizes an accumulated DTMF number.
    pub dtmf_inter_digit_secs: f64,
    pub max_call_duration_secs: f64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            silence_prompt_secs: 10.0,
            silence_goodbye_secs: 30.0,
            dtmf_inter_digit_secs: 3.0,
            max_call_duration_secs: 1_800.0,
        }
    }
}

/// Aggregated engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub audio: AudioConfig,
    pub vad: VadConfig,
    pub stt: SttConfig,
    pub llm: LlmConfig,
    pub tts: TtsConfig,
    pub timeouts: TimeoutConfig,
    /// How many non-system exchanges the conversation context retains.
    pub max_history: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            audio: AudioConfig::default(),
            vad: VadConfig::default(),
            stt: SttConfig::default(),
            llm: LlmConfig::default(),
            tts: TtsConfig::default(),
            timeouts: TimeoutConfig::default(),
            max_history: 10,
        }
    }
}

impl Config {
    /// Clamp out-of-range values loaded from a file or the environment.
    pub fn normalize(&mut self) {
        self.vad.threshold = self.vad.threshold.clamp(0.01, 0.99);
        self.vad.barge_in_threshold = self.vad.barge_in_threshold.clamp(0.01, 0.99);
        self.vad.pool_size = self.vad.pool_size.clamp(1, 64);
        self.audio.chunk_size = self.audio.chunk_size.clamp(2, 4096);
        if self.audio.chunk_size % 2 != 0 {
            self.audio.chunk_size += 1;
        }
        self.tts.speed = self.tts.speed.clamp(0.5, 2.0);
        if self.tts.sentence_delimiters.is_empty() {
            self.tts.sentence_delimiters = ".!?,".into();
        }
        if self.max_history == 0 {
            self.max_history = 10;
        }
    }
}
