//! Biquad filters, primarily from the [Audio Eq Cookbook](https://www.w3.org/TR/audio-eq-cookbook/).
//!
//! Biosignal channels arrive at whatever rate the amplifier recorded them, so unlike a fixed-rate
//! synthesis engine every design function here takes the sampling rate explicitly.  First-order
//! behavior can be had by zeroing the later coefficients.

use std::f64::consts::PI;

use num::complex::Complex64;

/// Suggested default for the `Q` parameter.
///
/// This makes the lowpass and highpass designs second-order butterworth sections.
pub const DEFAULT_Q: f64 = 0.7071135624381276;

/// A 1-channel biquad filter.
///
/// Implements the transfer function `(b0 + b1 z^-1 + b2 z^-2) / (a0 + a1 z^-1 + a2 z^-2)`,
/// factored so that `a0` and `b0` are always 1 and pulled out into a gain factor.
#[derive(Debug, Clone)]
pub struct MonoBiquadFilter {
    def: BiquadFilterDef,

    // The history.  The first element of the history is implicit: it comes from the current computation
    history: [f64; 2],
}

/// A definition for a biquad filter.
#[derive(Debug, Clone)]
pub struct BiquadFilterDef {
    gain: f64,
    b1: f64,
    b2: f64,
    a1: f64,
    a2: f64,
}

impl MonoBiquadFilter {
    pub fn new(def: BiquadFilterDef) -> MonoBiquadFilter {
        MonoBiquadFilter {
            def,
            history: [0.0; 2],
        }
    }

    /// Tick this filter by 1 sample.
    pub fn tick(&mut self, input_sample: f64) -> f64 {
        // direct form 2: do the recursive part first, then convolve the numerator using only the
        // denominator history rather than having two histories.
        let with_gain = input_sample * self.def.gain;
        let recursive = with_gain + self.def.a1 * self.history[0] + self.def.a2 * self.history[1];
        let out = recursive + self.def.b1 * self.history[0] + self.def.b2 * self.history[1];
        self.history.swap(0, 1);
        self.history[0] = recursive;
        out
    }

    /// Run the filter over a whole f32 slice in place.
    pub fn process(&mut self, signal: &mut [f32]) {
        for s in signal.iter_mut() {
            *s = self.tick(*s as f64) as f32;
        }
    }
}

// Some helpers which compute common variables from the Audio EQ cookbook.
fn bq_omega0(freq: f64, sampling_rate: f64) -> f64 {
    2.0 * PI * freq / sampling_rate
}

fn bq_alpha_q(omega0: f64, q: f64) -> f64 {
    omega0.sin() / (2.0 * q)
}

fn bq_alpha_bw(omega0: f64, bw: f64) -> f64 {
    omega0.sin() * (2.0f64.log2() * bw * omega0 / (2.0 * omega0.sin())).sinh()
}

/// Kinds of thing which can be used for defining the "Q" of a filter.
///
/// The Audio EQ cookbook defines `Q` and `BW` for the sections we keep.  The unit for `Bw` is
/// octaves; to get a bandwidth for a specific frequency and range, use [FilterWidth::bw_from_hz].
#[derive(Debug, Copy, Clone)]
pub enum FilterWidth {
    Q(f64),
    Bw(f64),
}

impl FilterWidth {
    fn compute_alpha(&self, omega0: f64) -> f64 {
        match self {
            Self::Q(q) => bq_alpha_q(omega0, *q),
            Self::Bw(bw) => bq_alpha_bw(omega0, *bw),
        }
    }

    /// Get a [FilterWidth::Bw] for a given midpoint and interval, that is `midpoint - interval`
    /// to `midpoint + interval`, or `2 * interval` bandwidth.
    pub fn bw_from_hz(midpoint: f64, interval: f64) -> FilterWidth {
        let min = midpoint - interval;
        let octaves = interval * 2.0 / min;

        Self::Bw(octaves)
    }
}

impl BiquadFilterDef {
    pub fn new_raw(b: [f64; 3], a: [f64; 3]) -> Self {
        let gain = b[0] / a[0];

        let b1 = b[1] / b[0];
        let b2 = b[2] / b[0];
        let a1 = -a[1] / a[0];
        let a2 = -a[2] / a[0];
        Self {
            gain,
            b1,
            b2,
            a1,
            a2,
        }
    }

    /// Lowpass Audio Eq Biquad, specifying frequency in hz.
    pub fn lowpass(frequency: f64, sampling_rate: f64, width: FilterWidth) -> Self {
        let omega0 = bq_omega0(frequency, sampling_rate);
        let b1 = 1.0 - omega0.cos();
        let b0 = b1 / 2.0f64;
        let b2 = b0;
        let alpha = width.compute_alpha(omega0);
        let a0 = 1.0f64 + alpha;
        let a1 = -2.0 * omega0.cos();
        let a2 = 1.0 - alpha;
        Self::new_raw([b0, b1, b2], [a0, a1, a2])
    }

    /// The highpass filter from the Audio Eq Cookbook.
    pub fn highpass(frequency: f64, sampling_rate: f64, width: FilterWidth) -> Self {
        let omega0 = bq_omega0(frequency, sampling_rate);
        let shared = 1.0f64 + omega0.cos();
        let b0 = shared / 2.0;
        let b1 = -shared;
        let b2 = b0;
        let alpha = width.compute_alpha(omega0);
        let a0 = 1.0 + alpha;
        let a1 = -2.0 * omega0.cos();
        let a2 = 1.0 - alpha;
        Self::new_raw([b0, b1, b2], [a0, a1, a2])
    }

    /// The Audio EQ Cookbook's notch filter.
    pub fn notch(frequency: f64, sampling_rate: f64, width: FilterWidth) -> Self {
        let omega0 = bq_omega0(frequency, sampling_rate);
        let alpha = width.compute_alpha(omega0);
        let b0 = 1.0f64;
        let b1 = -2.0 * omega0.cos();
        let b2 = 1.0;
        let a0 = 1.0 + alpha;
        let a1 = -2.0 * omega0.cos();
        let a2 = 1.0 - alpha;
        Self::new_raw([b0, b1, b2], [a0, a1, a2])
    }

    /// A band-reject section: the notch design widened to cover `frequency - half_width` through
    /// `frequency + half_width`.
    pub fn band_reject(frequency: f64, half_width: f64, sampling_rate: f64) -> Self {
        Self::notch(
            frequency,
            sampling_rate,
            FilterWidth::bw_from_hz(frequency, half_width),
        )
    }

    /// Get the frequency response of this filter as a complex number, given a frequency in hZ.
    pub fn frequency_response(&self, frequency: f64, sampling_rate: f64) -> Complex64 {
        let omega = bq_omega0(frequency, sampling_rate);
        let z_inv = 1.0 / (Complex64::i() * omega).exp();

        self.gain * (1.0 + self.b1 * z_inv + self.b2 * z_inv.powu(2))
            / (1.0 - self.a1 * z_inv - self.a2 * z_inv.powu(2))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::close_floats::*;

    fn gain_db(def: &BiquadFilterDef, freq: f64, sr: f64) -> f64 {
        20.0 * def.frequency_response(freq, sr).norm().log10()
    }

    #[test]
    fn test_lowpass_design() {
        let filt = BiquadFilterDef::lowpass(40.0, 500.0, FilterWidth::Q(DEFAULT_Q));
        close_floats64(gain_db(&filt, 40.0, 500.0), -3.0, 0.02);
        close_floats64(gain_db(&filt, 4.0, 500.0), 0.0, 0.02);
        assert!(gain_db(&filt, 200.0, 500.0) < -25.0);
    }

    #[test]
    fn test_highpass_design() {
        let filt = BiquadFilterDef::highpass(0.5, 250.0, FilterWidth::Q(DEFAULT_Q));
        close_floats64(gain_db(&filt, 0.5, 250.0), -3.0, 0.02);
        close_floats64(gain_db(&filt, 30.0, 250.0), 0.0, 0.02);
        assert!(gain_db(&filt, 0.05, 250.0) < -35.0);
    }

    #[test]
    fn test_notch_design() {
        let filt = BiquadFilterDef::notch(50.0, 500.0, FilterWidth::bw_from_hz(50.0, 2.0));
        assert!(gain_db(&filt, 50.0, 500.0) < -40.0);
        close_floats64(gain_db(&filt, 10.0, 500.0), 0.0, 0.05);
        close_floats64(gain_db(&filt, 150.0, 500.0), 0.0, 0.05);
    }

    #[test]
    fn test_band_reject_design() {
        let filt = BiquadFilterDef::band_reject(60.0, 5.0, 1000.0);
        assert!(gain_db(&filt, 60.0, 1000.0) < -40.0);
        close_floats64(gain_db(&filt, 10.0, 1000.0), 0.0, 0.05);
        close_floats64(gain_db(&filt, 250.0, 1000.0), 0.0, 0.05);
    }

    /// A DC input through a lowpass must converge to the input value.
    #[test]
    fn test_lowpass_passes_dc() {
        let def = BiquadFilterDef::lowpass(30.0, 250.0, FilterWidth::Q(DEFAULT_Q));
        let mut filt = MonoBiquadFilter::new(def);
        let mut out = 0.0;
        for _ in 0..2000 {
            out = filt.tick(5.0);
        }
        close_floats64(out, 5.0, 0.001);
    }
}
