//! Speech recognition client.
//!
//! The recognizer is an external HTTP service: the client uploads a mono
//! 16 kHz WAV body and receives a JSON transcript. Transcripts that are
//! blank, or whose confidence falls below the configured floor, are
//! reported as empty so the caller treats the turn as silence.

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::config::SttConfig;
use crate::error::{Result, SwitchboardError};

/// Result of one transcription call.
#[derive(Debug, Clone)]
pub struct TranscriptionResult {
    pub text: String,
    pub language: String,
    pub confidence: f32,
    pub duration_seconds: f32,
}

impl TranscriptionResult {
    pub fn empty() -> Self {
        Self {
            text: String::new(),
            language: String::new(),
            confidence: 0.0,
            duration_seconds: 0.0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.text.trim().is_empty()
    }
}

/// Contract for recognition backends.
#[async_trait]
pub trait SpeechToText: Send + Sync {
    /// Transcribe mono f32 samples at `sample_rate`. Inputs longer than
    /// the backend cap are trimmed to the most recent audio.
    async fn transcribe(&self, samples: &[f32], sample_rate: u32) -> Result<TranscriptionResult>;
}

#[derive(Deserialize)]
struct SttResponse {
    #[serde(default)]
    text: String,
    #[serde(default)]
    language: Option<String>,
    #[serde(default)]
    confidence: Option<f32>,
    #[serde(default)]
    duration: Option<f32>,
}

/// HTTP client for a whisper-style transcription endpoint.
pub struct HttpSttClient {
    http: reqwest::Client,
    config: SttConfig,
}

impl HttpSttClient {
    pub fn new(config: SttConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            config,
        }
    }

    fn encode_wav(samples: &[f32], sample_rate: u32) -> Result<Vec<u8>> {
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut cursor = std::io::Cursor::new(Vec::new());
        {
            let mut writer = hound::WavWriter::new(&mut cursor, spec)
                .map_err(|e| SwitchboardError::Stt(format!("wav encode: {e}")))?;
            for &sample in samples {
                let value = (sample.clamp(-1.0, 1.0) * 32_767.0) as i16;
                writer
                    .write_sample(value)
                    .map_err(|e| SwitchboardError::Stt(format!("wav encode: {e}")))?;
            }
            writer
                .finalize()
                .map_err(|e| SwitchboardError::Stt(format!("wav encode: {e}")))?;
        }
        Ok(cursor.into_inner())
    }
}

#[async_trait]
impl SpeechToText for HttpSttClient {
    async fn transcribe(&self, samples: &[f32], sample_rate: u32) -> Result<TranscriptionResult> {
        if samples.is_empty() {
            return Ok(TranscriptionResult::empty());
        }

        // Keep the most recent audio when the utterance exceeds the cap.
        let cap = (self.config.max_audio_seconds.max(1) as usize) * sample_rate as usize;
        let trimmed = if samples.len() > cap {
            &samples[samples.len() - cap..]
        } else {
            samples
        };

        let wav = Self::encode_wav(trimmed, sample_rate)?;
        let url = format!(
            "{}/transcribe?language={}",
            self.config.endpoint.trim_end_matches('/'),
            self.config.language
        );

        let response = self
            .http
            .post(url)
            .header("content-type", "audio/wav")
            .body(wav)
            .send()
            .await
            .map_err(|e| SwitchboardError::Stt(e.to_string()))?;
        if !response.status().is_success() {
            return Err(SwitchboardError::Stt(format!(
                "transcription endpoint returned {}",
                response.status()
            )));
        }
        let parsed: SttResponse = response
            .json()
            .await
            .map_err(|e| SwitchboardError::Stt(format!("malformed response: {e}")))?;

        let confidence = parsed.confidence.unwrap_or(1.0);
        let duration = parsed
            .duration
            .unwrap_or(trimmed.len() as f32 / sample_rate as f32);

        if confidence < self.config.min_confidence {
            // Low-confidence text is treated as silence; keep it visible in
            // the logs for tuning.
            debug!(
                confidence,
                text = %parsed.text.trim(),
                "discarding low-confidence transcript"
            );
            return Ok(TranscriptionResult {
                text: String::new(),
                language: parsed.language.unwrap_or_default(),
                confidence,
                duration_seconds: duration,
            });
        }

        Ok(TranscriptionResult {
            text: parsed.text.trim().to_string(),
            language: parsed.language.unwrap_or_default(),
            confidence,
            duration_seconds: duration,
        })
    }
}

/// Deterministic backend for development and tests: returns the canned
/// transcript whenever the input carries audible energy.
pub struct StubStt {
    transcript: String,
    rms_floor: f32,
}

impl StubStt {
    pub fn new(transcript: impl Into<String>) -> Self {
        Self {
            transcript: transcript.into(),
            rms_floor: 0.01,
        }
    }
}

#[async_trait]
impl SpeechToText for StubStt {
    async fn transcribe(&self, samples: &[f32], _sample_rate: u32) -> Result<TranscriptionResult> {
        if samples.is_empty() {
            return Ok(TranscriptionResult::empty());
        }
        let rms =
            (samples.iter().map(|s| s * s).sum::<f32>() / samples.len() as f32).sqrt();
        if rms < self.rms_floor {
            warn!(rms, "stub recognizer heard only silence");
            return Ok(TranscriptionResult::empty());
        }
        Ok(TranscriptionResult {
            text: self.transcript.clone(),
            language: "en".into(),
            confidence: 0.99,
            duration_seconds: samples.len() as f32 / 16_000.0,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_result_is_empty() {
        assert!(TranscriptionResult::empty().is_empty());
        let whitespace = TranscriptionResult {
            text: "   ".into(),
            language: "en".into(),
            confidence: 0.9,
            duration_seconds: 1.0,
        };
        assert!(whitespace.is_empty());
    }

    #[test]
    fn wav_encoding_produces_valid_header() {
        let samples = vec![0.1f32; 1600];
        let wav = HttpSttClient::encode_wav(&samples, 16_000).expect("encode");
        let reader = hound::WavReader::new(std::io::Cursor::new(wav)).expect("decode");
        let spec = reader.spec();
        assert_eq!(spec.channels, 1);
        assert_eq!(spec.sample_rate, 16_000);
        assert_eq!(spec.bits_per_sample, 16);
        assert_eq!(reader.len(), 1600);
    }

    #[tokio::test]
    async fn stub_transcribes_loud_audio_only() {
        let stt = StubStt::new("hello operator");
        let loud = vec![0.2f32; 8000];
        let result = stt.transcribe(&loud, 16_000).await.unwrap();
        assert_eq!(result.text, "hello operator");

        let silent = vec![0.0f32; 8000];
        let result = stt.transcribe(&silent, 16_000).await.unwrap();
        assert!(result.is_empty());
    }
}
