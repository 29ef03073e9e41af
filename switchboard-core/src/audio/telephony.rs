//! Telephone band-pass filter (300–3400 Hz).
//!
//! ## Design
//!
//! 4th-order Butterworth band-pass, designed at construction time:
//! analog low-pass prototype poles → band transform → bilinear transform,
//! factored into second-order sections. The transfer-function form is
//! numerically unstable at this narrow band over 8 kHz, so only the SOS
//! cascade is ever materialized.
//!
//! `apply` runs the cascade forward and backward (zero phase): call audio
//! must not acquire group delay relative to silence markers. Edges are
//! odd-reflection padded; the pad length clamps to the input, so inputs
//! shorter than the filter order need no special casing.

/// One biquad in direct form II transposed: b0 b1 b2, a1 a2 (a0 == 1).
#[derive(Debug, Clone, Copy)]
struct Section {
    b0: f64,
    b1: f64,
    b2: f64,
    a1: f64,
    a2: f64,
}

impl Section {
    fn filter(&self, input: &mut [f64]) {
        let mut s1 = 0.0f64;
        let mut s2 = 0.0f64;
        for x in input.iter_mut() {
            let y = self.b0 * *x + s1;
            s1 = self.b1 * *x - self.a1 * y + s2;
            s2 = self.b2 * *x - self.a2 * y;
            *x = y;
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Complex {
    re: f64,
    im: f64,
}

impl Complex {
    fn new(re: f64, im: f64) -> Self {
        Self { re, im }
    }

    fn scale(self, k: f64) -> Self {
        Self::new(self.re * k, self.im * k)
    }

    fn add(self, other: Self) -> Self {
        Self::new(self.re + other.re, self.im + other.im)
    }

    fn sub(self, other: Self) -> Self {
        Self::new(self.re - other.re, self.im - other.im)
    }

    fn mul(self, other: Self) -> Self {
        Self::new(
            self.re * other.re - self.im * other.im,
            self.re * other.im + self.im * other.re,
        )
    }

    fn div(self, other: Self) -> Self {
        let d = other.re * other.re + other.im * other.im;
        Self::new(
            (self.re * other.re + self.im * other.im) / d,
            (self.im * other.re - self.re * other.im) / d,
        )
    }

    fn sqrt(self) -> Self {
        let r = self.re.hypot(self.im);
        let re = ((r + self.re) / 2.0).max(0.0).sqrt();
        let im = ((r - self.re) / 2.0).max(0.0).sqrt() * self.im.signum();
        Self::new(re, im)
    }

    fn abs(self) -> f64 {
        self.re.hypot(self.im)
    }
}

/// Precomputed zero-phase Butterworth band-pass.
#[derive(Debug, Clone)]
pub struct TelephoneBandPass {
    sections: Vec<Section>,
}

impl TelephoneBandPass {
    /// Design the filter for corner frequencies `lowcut`/`highcut` (Hz) at
    /// `sample_rate`. Corners are clamped below Nyquist.
    pub fn new(lowcut: f64, highcut: f64, sample_rate: u32) -> Self {
        const ORDER: usize = 4;

        let fs = sample_rate as f64;
        let nyquist = fs / 2.0;
        let f1 = lowcut.clamp(1.0, nyquist * 0.99);
        let f2 = highcut.clamp(f1 * 1.01, nyquist * 0.99);

        // Bilinear pre-warp of the analog corner frequencies.
        let fs2 = 2.0 * fs;
        let w1 = fs2 * (std::f64::consts::PI * f1 / fs).tan();
        let w2 = fs2 * (std::f64::consts::PI * f2 / fs).tan();
        let bw = w2 - w1;
        let w0_sq = w1 * w2;

        // Analog low-pass prototype poles in the upper half plane.
        let mut sections = Vec::with_capacity(ORDER);
        for k in 0..ORDER / 2 {
            let theta = std::f64::consts::PI * (2.0 * k as f64 + ORDER as f64 + 1.0)
                / (2.0 * ORDER as f64);
            let prototype = Complex::new(theta.cos(), theta.sin());

            // Low-pass → band-pass: each prototype pole splits in two.
            let pb = prototype.scale(bw);
            let disc = pb.mul(pb).sub(Complex::new(4.0 * w0_sq, 0.0)).sqrt();
            for s_pole in [pb.add(disc).scale(0.5), pb.sub(disc).scale(0.5)] {
                // Bilinear transform: z = (2fs + s) / (2fs - s).
                let z_pole = Complex::new(fs2 + s_pole.re, s_pole.im)
                    .div(Complex::new(fs2 - s_pole.re, -s_pole.im));

                // Pair with its conjugate; band-pass zeros land at z = ±1.
                sections.push(Section {
                    b0: 1.0,
                    b1: 0.0,
                    b2: -1.0,
                    a1: -2.0 * z_pole.re,
                    a2: z_pole.re * z_pole.re + z_pole.im * z_pole.im,
                });
            }
        }

        // Normalize unit gain at the geometric center of the passband.
        let fc = (f1 * f2).sqrt();
        let omega = 2.0 * std::f64::consts::PI * fc / fs;
        let z = Complex::new(omega.cos(), omega.sin());
        let z_sq = z.mul(z);
        let mut gain = Complex::new(1.0, 0.0);
        for section in &sections {
            let num = z_sq.add(Complex::new(section.b2, 0.0));
            let den = z_sq
                .add(z.scale(section.a1))
                .add(Complex::new(section.a2, 0.0));
            gain = gain.mul(num.div(den));
        }
        let k = 1.0 / gain.abs();
        if let Some(first) = sections.first_mut() {
            first.b0 *= k;
            first.b2 *= k;
        }

        Self { sections }
    }

    fn run_cascade(&self, data: &mut [f64]) {
        for section in &self.sections {
            section.filter(data);
        }
    }

    /// Zero-phase application: forward pass, reverse, forward pass again.
    pub fn apply(&self, samples: &[f32]) -> Vec<f32> {
        if samples.is_empty() {
            return Vec::new();
        }

        let n = samples.len();
        let padlen = (6 * self.sections.len()).min(n - 1);

        // Odd-reflection padding reduces edge transients.
        let mut extended = Vec::with_capacity(n + 2 * padlen);
        let first = samples[0] as f64;
        let last = samples[n - 1] as f64;
        for i in (1..=padlen).rev() {
            extended.push(2.0 * first - samples[i] as f64);
        }
        extended.extend(samples.iter().map(|&s| s as f64));
        for i in 1..=padlen {
            extended.push(2.0 * last - samples[n - 1 - i] as f64);
        }

        self.run_cascade(&mut extended);
        extended.reverse();
        self.run_cascade(&mut extended);
        extended.reverse();

        extended[padlen..padlen + n]
            .iter()
            .map(|&s| s as f32)
            .collect()
    }
}
