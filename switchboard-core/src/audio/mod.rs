//! Audio format conversion and chunking for the voice pipeline.
//!
//! ## Data flow
//!
//! ```text
//! inbound:  bytes@8k ── i16 ── f32 ── resample ──► f32@16k (VAD / STT)
//! outbound: f32@24k ── resample ── band-pass ── i16 ──► bytes@8k (switch)
//! ```
//!
//! All conversions are allocation-per-call; nothing here runs inside a
//! real-time callback, so clarity wins over zero-copy tricks.

pub mod resample;
pub mod telephony;

use crate::config::AudioConfig;
use crate::error::Result;

/// Convert little-endian signed 16-bit PCM bytes to samples.
///
/// A trailing odd byte (which a well-formed AUDIO frame never carries) is
/// ignored.
pub fn bytes_to_i16(bytes: &[u8]) -> Vec<i16> {
    bytes
        .chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
        .collect()
}

/// Convert samples back to little-endian bytes.
pub fn i16_to_bytes(samples: &[i16]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(samples.len() * 2);
    for sample in samples {
        bytes.extend_from_slice(&sample.to_le_bytes());
    }
    bytes
}

/// Normalize i16 samples to f32 in [-1.0, 1.0].
pub fn normalize(samples: &[i16]) -> Vec<f32> {
    samples.iter().map(|&s| s as f32 / 32_768.0).collect()
}

/// Convert f32 [-1.0, 1.0] samples to i16 with clipping.
pub fn denormalize(samples: &[f32]) -> Vec<i16> {
    samples
        .iter()
        .map(|&s| (s * 32_767.0).clamp(-32_768.0, 32_767.0) as i16)
        .collect()
}

/// Lazy chunk iterator over a byte buffer. Produces `⌈len/n⌉` slices of
/// length `≤ n`; the last chunk may be shorter.
pub fn chunks(audio: &[u8], chunk_size: usize) -> std::slice::Chunks<'_, u8> {
    audio.chunks(chunk_size.max(1))
}

/// Stateless conversions between the wire format and model formats.
#[derive(Debug, Clone)]
pub struct AudioProcessor {
    config: AudioConfig,
    band_pass: telephony::TelephoneBandPass,
}

impl AudioProcessor {
    pub fn new(config: AudioConfig) -> Self {
        let band_pass = telephony::TelephoneBandPass::new(
            config.telephone_lowcut,
            config.telephone_highcut,
            config.output_sample_rate,
        );
        Self { config, band_pass }
    }

    /// Inbound path: raw 8 kHz PCM bytes from the switch to 16 kHz f32 for
    /// the endpointer and recognizer.
    pub fn process_inbound(&self, bytes: &[u8]) -> Result<Vec<f32>> {
        let samples = normalize(&bytes_to_i16(bytes));
        resample::resample(
            &samples,
            self.config.input_sample_rate,
            self.config.stt_sample_rate,
        )
    }

    /// Outbound path: synthesized f32 samples at `from_rate` down to 8 kHz,
    /// band-limited to the telephone passband, packed as PCM bytes.
    pub fn process_outbound(&self, samples: &[f32], from_rate: u32) -> Result<Vec<u8>> {
        let at_rate = resample::resample(samples, from_rate, self.config.output_sample_rate)?;
        let filtered = self.band_pass.apply(&at_rate);
        Ok(i16_to_bytes(&denormalize(&filtered)))
    }

    pub fn chunk_size(&self) -> usize {
        self.config.chunk_size
    }
}

/// Accumulates speech audio across an utterance.
#[derive(Debug, Default)]
pub struct AudioBuffer {
    sample_rate: u32,
    chunks: Vec<Vec<f32>>,
    total_samples: usize,
}

impl AudioBuffer {
    pub fn new(sample_rate: u32) -> Self {
        Self {
            sample_rate,
            chunks: Vec::new(),
            total_samples: 0,
        }
    }

    pub fn add(&mut self, samples: Vec<f32>) {
        self.total_samples += samples.len();
        self.chunks.push(samples);
    }

    pub fn num_samples(&self) -> usize {
        self.total_samples
    }

    pub fn is_empty(&self) -> bool {
        self.total_samples == 0
    }

    pub fn duration_ms(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.total_samples as f64 * 1_000.0 / self.sample_rate as f64
    }

    /// Concatenate everything accumulated so far.
    pub fn into_samples(self) -> Vec<f32> {
        let mut out = Vec::with_capacity(self.total_samples);
        for chunk in self.chunks {
            out.extend_from_slice(&chunk);
        }
        out
    }
}
