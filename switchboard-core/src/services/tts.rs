//! Speech synthesis client.
//!
//! The synthesis model is not safe for concurrent calls, so every backend
//! serializes `synthesize` behind an async lock held across the request.
//! Sentences therefore play in order even across sessions.

use async_trait::async_trait;
use once_cell::sync::Lazy;
use std::collections::HashMap;
use tracing::warn;

use crate::config::TtsConfig;
use crate::error::{Result, SwitchboardError};

/// Contract for synthesis backends.
#[async_trait]
pub trait TextToSpeech: Send + Sync {
    /// Synthesize `text` into mono f32 samples at `sample_rate()`.
    async fn synthesize(&self, text: &str, voice: &str, speed: f32) -> Result<Vec<f32>>;

    /// Output rate of this backend; the pipeline resamples as needed.
    fn sample_rate(&self) -> u32;
}

/// Voices keyed by persona; features fall back to the house voice.
static PERSONA_VOICES: Lazy<HashMap<&'static str, &'static str>> = Lazy::new(|| {
    HashMap::from([
        ("sage", "am_michael"),
        ("comedian", "am_adam"),
        ("detective", "am_michael"),
        ("grandma", "af_sarah"),
        ("robot", "am_adam"),
        ("valley", "af_sky"),
        ("beatnik", "am_michael"),
        ("gameshow", "am_adam"),
        ("conspiracy", "am_michael"),
    ])
});

static FEATURE_VOICES: Lazy<HashMap<&'static str, &'static str>> = Lazy::new(|| {
    HashMap::from([
        ("easter_jenny", "af_sky"),
        ("easter_haunted", "af_nicole"),
        ("roast", "am_adam"),
    ])
});

/// Pick the voice for the session's current feature/persona.
pub fn voice_for(feature: &str, persona: Option<&str>, default_voice: &str) -> String {
    if let Some(persona) = persona {
        if let Some(voice) = PERSONA_VOICES.get(persona) {
            return (*voice).to_string();
        }
    }
    if let Some(voice) = FEATURE_VOICES.get(feature) {
        return (*voice).to_string();
    }
    default_voice.to_string()
}

#[derive(serde::Serialize)]
struct SynthesizeRequest<'a> {
    text: &'a str,
    voice: &'a str,
    speed: f32,
}

/// HTTP client for a synthesis service returning WAV bodies.
pub struct HttpTtsClient {
    http: reqwest::Client,
    config: TtsConfig,
    /// The model corrupts its state under concurrent synthesis; hold this
    /// across the whole request.
    lock: tokio::sync::Mutex<()>,
}

impl HttpTtsClient {
    pub fn new(config: TtsConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            config,
            lock: tokio::sync::Mutex::new(()),
        }
    }

    fn decode_wav(&self, bytes: &[u8]) -> Result<Vec<f32>> {
        let reader = hound::WavReader::new(std::io::Cursor::new(bytes))
            .map_err(|e| SwitchboardError::Tts(format!("wav decode: {e}")))?;
        let spec = reader.spec();
        if spec.sample_rate != self.config.sample_rate {
            warn!(
                header_rate = spec.sample_rate,
                configured_rate = self.config.sample_rate,
                "synthesis service rate differs from configuration"
            );
        }
        let samples: Vec<f32> = match spec.sample_format {
            hound::SampleFormat::Float => reader
                .into_samples::<f32>()
                .filter_map(std::result::Result::ok)
                .collect(),
            hound::SampleFormat::Int => {
                let scale = 1.0 / (1i64 << (spec.bits_per_sample - 1)) as f32;
                reader
                    .into_samples::<i32>()
                    .filter_map(std::result::Result::ok)
                    .map(|s| s as f32 * scale)
                    .collect()
            }
        };
        // Average stereo down to mono if the service ignores our request.
        if spec.channels == 2 {
            return Ok(samples
                .chunks(2)
                .map(|pair| (pair[0] + pair.get(1).copied().unwrap_or(0.0)) / 2.0)
                .collect());
        }
        Ok(samples)
    }
}

#[async_trait]
impl TextToSpeech for HttpTtsClient {
    async fn synthesize(&self, text: &str, voice: &str, speed: f32) -> Result<Vec<f32>> {
        if text.trim().is_empty() {
            return Ok(Vec::new());
        }

        let _serialized = self.lock.lock().await;
        let url = format!("{}/synthesize", self.config.endpoint.trim_end_matches('/'));
        let response = self
            .http
            .post(url)
            .json(&SynthesizeRequest { text, voice, speed })
            .send()
            .await
            .map_err(|e| SwitchboardError::Tts(e.to_string()))?;
        if !response.status().is_success() {
            return Err(SwitchboardError::Tts(format!(
                "synthesis endpoint returned {}",
                response.status()
            )));
        }
        let bytes = response
            .bytes()
            .await
            .map_err(|e| SwitchboardError::Tts(e.to_string()))?;
        self.decode_wav(&bytes)
    }

    fn sample_rate(&self) -> u32 {
        self.config.sample_rate
    }
}

/// Tone-generating backend for development and tests. Duration scales
/// with text length so pacing behaves like real speech.
pub struct StubTts {
    sample_rate: u32,
    samples_per_char: usize,
    /// Synthesized texts, observable by tests.
    log: parking_lot::Mutex<Vec<String>>,
}

impl StubTts {
    pub fn new(sample_rate: u32, samples_per_char: usize) -> Self {
        Self {
            sample_rate,
            samples_per_char: samples_per_char.max(1),
            log: parking_lot::Mutex::new(Vec::new()),
        }
    }

    /// Everything synthesized so far, in order.
    pub fn spoken(&self) -> Vec<String> {
        self.log.lock().clone()
    }
}

#[async_trait]
impl TextToSpeech for StubTts {
    async fn synthesize(&self, text: &str, _voice: &str, _speed: f32) -> Result<Vec<f32>> {
        if text.trim().is_empty() {
            return Ok(Vec::new());
        }
        self.log.lock().push(text.to_string());
        let len = text.chars().count() * self.samples_per_char;
        let tone: Vec<f32> = (0..len)
            .map(|i| {
                (i as f32 * 2.0 * std::f32::consts::PI * 440.0 / self.sample_rate as f32).sin()
                    * 0.3
            })
            .collect();
        Ok(tone)
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }
}
