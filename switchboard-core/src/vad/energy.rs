//! Energy-based speech scoring.
//!
//! Maps window RMS onto a pseudo-probability so the endpointer can treat
//! it interchangeably with the neural detector. Telephone speech sits well
//! above 0.025 RMS after normalization; line noise stays an order of
//! magnitude below.

use super::VadModel;
use crate::error::Result;

/// RMS level that maps to probability 1.0.
const FULL_SCALE_RMS: f32 = 0.05;

/// Fallback detector used when no ONNX model is available.
#[derive(Debug, Clone, Default)]
pub struct EnergyVad;

impl EnergyVad {
    pub fn new() -> Self {
        Self
    }

    fn rms(samples: &[f32]) -> f32 {
        if samples.is_empty() {
            return 0.0;
        }
        let sum_sq: f32 = samples.iter().map(|s| s * s).sum();
        (sum_sq / samples.len() as f32).sqrt()
    }
}

impl VadModel for EnergyVad {
    fn predict(&mut self, window: &[f32], _sample_rate: u32) -> Result<f32> {
        Ok((Self::rms(window) / FULL_SCALE_RMS).min(1.0))
    }

    fn reset(&mut self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn silence_scores_near_zero() {
        let mut vad = EnergyVad::new();
        let p = vad.predict(&vec![0.0f32; 512], 16_000).unwrap();
        assert!(p < 0.01, "p={p}");
    }

    #[test]
    fn speech_level_audio_scores_high() {
        let mut vad = EnergyVad::new();
        let p = vad.predict(&vec![0.3f32; 512], 16_000).unwrap();
        assert!(p > 0.9, "p={p}");
    }

    #[test]
    fn faint_noise_stays_below_default_threshold() {
        let mut vad = EnergyVad::new();
        let p = vad.predict(&vec![0.005f32; 512], 16_000).unwrap();
        assert!(p < 0.5, "p={p}");
    }

    #[test]
    fn empty_window_is_silent() {
        let mut vad = EnergyVad::new();
        assert_eq!(vad.predict(&[], 16_000).unwrap(), 0.0);
    }

    #[test]
    fn rms_of_square_wave() {
        let samples: Vec<f32> = (0..256)
            .map(|i| if i % 2 == 0 { 0.5 } else { -0.5 })
            .collect();
        let rms = EnergyVad::rms(&samples);
        assert!((rms - 0.5).abs() < 1e-5, "rms={rms}");
    }
}
