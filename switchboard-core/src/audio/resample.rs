//! Sample-rate conversion using a rubato `FastFixedIn` resampler.
//!
//! ## Design
//!
//! Three rates meet in this pipeline: the switch speaks 8 kHz, the
//! recognizer wants 16 kHz, and the synthesis service emits 24 kHz.
//! `resample` converts a complete buffer in one call; `RateConverter`
//! keeps a resampler session alive for chunked streams.
//!
//! When input rate == output rate both are zero-copy passthroughs and no
//! rubato session is created at all.

use rubato::{FastFixedIn, PolynomialDegree, Resampler};
use tracing::error;

use crate::error::{Result, SwitchboardError};

/// Input block size fed to rubato per call in whole-buffer mode.
const RESAMPLE_BLOCK: usize = 1024;

fn new_resampler(from_rate: u32, to_rate: u32, chunk_size: usize) -> Result<FastFixedIn<f32>> {
    let ratio = to_rate as f64 / from_rate as f64;
    FastFixedIn::<f32>::new(
        ratio,
        1.0, // fixed ratio — no dynamic adjustment
        PolynomialDegree::Cubic,
        chunk_size,
        1, // mono
    )
    .map_err(|e| SwitchboardError::Audio(format!("resampler init: {e}")))
}

/// Resample a complete mono f32 buffer from `from_rate` to `to_rate`.
///
/// Identity rates return the input unchanged; empty input yields empty
/// output. Output length is `len · to/from` within the resampler's small
/// history window.
pub fn resample(samples: &[f32], from_rate: u32, to_rate: u32) -> Result<Vec<f32>> {
    if from_rate == to_rate {
        return Ok(samples.to_vec());
    }
    if samples.is_empty() {
        return Ok(Vec::new());
    }

    let block = samples.len().min(RESAMPLE_BLOCK).max(32);
    let mut converter = RateConverter::new(from_rate, to_rate, block)?;
    let mut out = converter.process(samples);
    out.extend(converter.flush());
    Ok(out)
}

/// Integer variant: converts through f32 and clips back to i16.
pub fn resample_i16(samples: &[i16], from_rate: u32, to_rate: u32) -> Result<Vec<i16>> {
    if from_rate == to_rate {
        return Ok(samples.to_vec());
    }
    let float = super::normalize(samples);
    let converted = resample(&float, from_rate, to_rate)?;
    Ok(super::denormalize(&converted))
}

/// Converts chunked f32 mono audio from one fixed sample rate to another,
/// keeping partial input between calls.
pub struct RateConverter {
    /// `None` when input rate == output rate (passthrough mode).
    resampler: Option<FastFixedIn<f32>>,
    /// Holds partial input chunks between calls.
    input_buf: Vec<f32>,
    /// How many input samples rubato expects per process call.
    chunk_size: usize,
    /// Pre-allocated output buffer: `[1][output_frames_max]`.
    output_buf: Vec<Vec<f32>>,
}

impl RateConverter {
    /// # Parameters
    /// - `from_rate`: Sample rate of the incoming audio (Hz).
    /// - `to_rate`: Target sample rate (Hz).
    /// - `chunk_size`: Input frame count per rubato call (e.g. `160`).
    pub fn new(from_rate: u32, to_rate: u32, chunk_size: usize) -> Result<Self> {
        if from_rate == to_rate {
            return Ok(Self {
                resampler: None,
                input_buf: Vec::new(),
                chunk_size,
                output_buf: Vec::new(),
            });
        }

        let resampler = new_resampler(from_rate, to_rate, chunk_size)?;
        let max_out = resampler.output_frames_max();
        let output_buf = vec![vec![0f32; max_out]; 1];

        Ok(Self {
            resampler: Some(resampler),
            input_buf: Vec::new(),
            chunk_size,
            output_buf,
        })
    }

    /// Process incoming samples, returning resampled output (may be empty
    /// while a partial chunk accumulates).
    pub fn process(&mut self, samples: &[f32]) -> Vec<f32> {
        let Some(ref mut resampler) = self.resampler else {
            return samples.to_vec();
        };

        self.input_buf.extend_from_slice(samples);

        let mut result = Vec::new();
        while self.input_buf.len() >= self.chunk_size {
            let input_slice = &self.input_buf[..self.chunk_size];
            match resampler.process_into_buffer(&[input_slice], &mut self.output_buf, None) {
                Ok((_consumed, produced)) => {
                    result.extend_from_slice(&self.output_buf[0][..produced]);
                }
                Err(e) => {
                    error!("resampler process error: {e}");
                }
            }
            self.input_buf.drain(..self.chunk_size);
        }

        result
    }

    /// Feed any buffered partial input and drain the resampler's history.
    /// Call once at end of stream; output may be empty.
    pub fn flush(&mut self) -> Vec<f32> {
        let Some(ref mut resampler) = self.resampler else {
            return Vec::new();
        };

        let tail: Vec<f32> = std::mem::take(&mut self.input_buf);
        let outcome = if tail.is_empty() {
            resampler.process_partial_into_buffer(None::<&[&[f32]]>, &mut self.output_buf, None)
        } else {
            let tail_slices: [&[f32]; 1] = [tail.as_slice()];
            resampler.process_partial_into_buffer(Some(&tail_slices[..]), &mut self.output_buf, None)
        };

        match outcome {
            Ok((_consumed, produced)) => self.output_buf[0][..produced].to_vec(),
            Err(e) => {
                error!("resampler flush error: {e}");
                Vec::new()
            }
        }
    }

    pub fn is_passthrough(&self) -> bool {
        self.resampler.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_rate_is_passthrough() {
        let samples: Vec<f32> = (0..480).map(|i| i as f32 * 0.001).collect();
        let out = resample(&samples, 16_000, 16_000).unwrap();
        assert_eq!(out, samples);
    }

    #[test]
    fn empty_input_yields_empty_output() {
        assert!(resample(&[], 8_000, 16_000).unwrap().is_empty());
    }

    #[test]
    fn upsample_8k_to_16k_doubles_length() {
        let samples = vec![0.1f32; 800];
        let out = resample(&samples, 8_000, 16_000).unwrap();
        assert!(
            (out.len() as isize - 1600).unsigned_abs() <= 32,
            "len={}",
            out.len()
        );
    }

    #[test]
    fn downsample_24k_to_8k_thirds_length() {
        let samples = vec![0.1f32; 2400];
        let out = resample(&samples, 24_000, 8_000).unwrap();
        assert!(
            (out.len() as isize - 800).unsigned_abs() <= 32,
            "len={}",
            out.len()
        );
    }

    #[test]
    fn downsample_16k_to_8k_halves_length() {
        let samples = vec![0.25f32; 1600];
        let out = resample(&samples, 16_000, 8_000).unwrap();
        assert!(
            (out.len() as isize - 800).unsigned_abs() <= 32,
            "len={}",
            out.len()
        );
    }

    #[test]
    fn integer_resample_preserves_dtype_and_clips() {
        let samples = vec![16_000i16; 400];
        let out = resample_i16(&samples, 8_000, 16_000).unwrap();
        assert!(!out.is_empty());
        assert!(out.iter().all(|&s| (-32_768..=32_767).contains(&(s as i32))));
    }

    #[test]
    fn converter_passthrough_identity() {
        let mut rc = RateConverter::new(16_000, 16_000, 160).unwrap();
        assert!(rc.is_passthrough());
        let samples: Vec<f32> = (0..320).map(|i| i as f32 * 0.001).collect();
        assert_eq!(rc.process(&samples), samples);
    }

    #[test]
    fn converter_accumulates_partial_chunks() {
        let mut rc = RateConverter::new(8_000, 16_000, 160).unwrap();
        assert!(!rc.is_passthrough());
        let out1 = rc.process(&vec![0.1f32; 100]);
        assert!(out1.is_empty(), "partial chunk should produce nothing");
        let out2 = rc.process(&vec![0.1f32; 100]);
        assert!(!out2.is_empty(), "second push should trigger processing");
    }

    #[test]
    fn flush_drains_buffered_remainder() {
        let mut rc = RateConverter::new(8_000, 16_000, 160).unwrap();
        let out = rc.process(&vec![0.1f32; 100]);
        assert!(out.is_empty());
        let flushed = rc.flush();
        assert!(!flushed.is_empty(), "flush should emit the buffered tail");
    }
}
