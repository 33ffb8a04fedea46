//! The filter chain applied to derived channel signals.
//!
//! This is the black-box surface the montage processor consumes: given a signal and its sampling
//! rate, apply the enabled sections in a fixed order (high-pass, then low-pass, then notch) and
//! return a signal of identical length.  Band-rejects are applied separately, in the caller's
//! order, after the fixed three.  A frequency of `None` (or a non-positive value) disables a
//! section, so the chain degrades to a copy when nothing is enabled.

use smallvec::SmallVec;

use crate::biquad::{BiquadFilterDef, FilterWidth, MonoBiquadFilter, DEFAULT_Q};

/// One band-reject request: center frequency and half-width, both in Hz.
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct BandReject {
    pub frequency: f64,
    pub half_width: f64,
}

/// Apply high-pass, low-pass and notch filtering to `signal`.
///
/// The output has exactly the same length as the input.  Disabled sections (`None` or `<= 0`)
/// are skipped entirely; the application order of enabled sections is fixed.
pub fn filter(
    signal: &[f32],
    sampling_rate: f64,
    lowpass: Option<f64>,
    highpass: Option<f64>,
    notch: Option<f64>,
) -> Vec<f32> {
    let mut sections: SmallVec<[BiquadFilterDef; 3]> = SmallVec::new();

    if let Some(hz) = enabled(highpass, sampling_rate) {
        sections.push(BiquadFilterDef::highpass(
            hz,
            sampling_rate,
            FilterWidth::Q(DEFAULT_Q),
        ));
    }
    if let Some(hz) = enabled(lowpass, sampling_rate) {
        sections.push(BiquadFilterDef::lowpass(
            hz,
            sampling_rate,
            FilterWidth::Q(DEFAULT_Q),
        ));
    }
    if let Some(hz) = enabled(notch, sampling_rate) {
        sections.push(BiquadFilterDef::notch(
            hz,
            sampling_rate,
            FilterWidth::bw_from_hz(hz, hz * 0.05),
        ));
    }

    let mut out = signal.to_vec();
    for def in sections {
        MonoBiquadFilter::new(def).process(&mut out);
    }
    out
}

/// Apply a list of band-reject sections in the order given.
pub fn apply_band_rejects(signal: &mut [f32], sampling_rate: f64, rejects: &[BandReject]) {
    for r in rejects {
        if enabled(Some(r.frequency), sampling_rate).is_none() {
            continue;
        }
        let def = BiquadFilterDef::band_reject(r.frequency, r.half_width, sampling_rate);
        MonoBiquadFilter::new(def).process(signal);
    }
}

/// A section is enabled when its frequency is positive and below Nyquist.
fn enabled(frequency: Option<f64>, sampling_rate: f64) -> Option<f64> {
    frequency.filter(|hz| *hz > 0.0 && *hz < sampling_rate / 2.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sine(freq: f64, sr: f64, seconds: f64) -> Vec<f32> {
        let n = (sr * seconds) as usize;
        (0..n)
            .map(|i| (2.0 * std::f64::consts::PI * freq * i as f64 / sr).sin() as f32)
            .collect()
    }

    fn rms(signal: &[f32]) -> f64 {
        let sum: f64 = signal.iter().map(|s| (*s as f64).powi(2)).sum();
        (sum / signal.len() as f64).sqrt()
    }

    #[test]
    fn output_length_equals_input_length() {
        let input = sine(10.0, 250.0, 2.0);
        let out = filter(&input, 250.0, Some(40.0), Some(0.5), Some(50.0));
        assert_eq!(out.len(), input.len());
    }

    #[test]
    fn disabled_chain_is_identity() {
        let input = sine(10.0, 250.0, 1.0);
        let out = filter(&input, 250.0, None, None, None);
        assert_eq!(out, input);

        // Zero means disabled too.
        let out = filter(&input, 250.0, Some(0.0), Some(0.0), Some(0.0));
        assert_eq!(out, input);
    }

    #[test]
    fn filtering_is_deterministic() {
        let input = sine(7.0, 250.0, 2.0);
        let a = filter(&input, 250.0, Some(40.0), Some(1.0), Some(50.0));
        let b = filter(&input, 250.0, Some(40.0), Some(1.0), Some(50.0));
        assert_eq!(a, b, "same chain, same input, same bits");
    }

    #[test]
    fn lowpass_attenuates_high_frequencies() {
        // 100 Hz content through a 30 Hz lowpass at 500 Hz sampling.
        let input = sine(100.0, 500.0, 2.0);
        let out = filter(&input, 500.0, Some(30.0), None, None);
        // Skip the transient at the head.
        assert!(rms(&out[500..]) < rms(&input[500..]) * 0.15);
    }

    #[test]
    fn notch_kills_mains_but_not_neighbors() {
        let sr = 500.0;
        let mains = sine(50.0, sr, 4.0);
        let neighbor = sine(20.0, sr, 4.0);

        let mains_out = filter(&mains, sr, None, None, Some(50.0));
        let neighbor_out = filter(&neighbor, sr, None, None, Some(50.0));

        assert!(rms(&mains_out[1000..]) < rms(&mains[1000..]) * 0.1);
        assert!(rms(&neighbor_out[1000..]) > rms(&neighbor[1000..]) * 0.9);
    }

    #[test]
    fn band_rejects_apply_in_order_and_preserve_length() {
        let sr = 1000.0;
        let mut signal = sine(60.0, sr, 2.0);
        let before = signal.len();
        apply_band_rejects(
            &mut signal,
            sr,
            &[
                BandReject {
                    frequency: 60.0,
                    half_width: 5.0,
                },
                BandReject {
                    frequency: 120.0,
                    half_width: 5.0,
                },
            ],
        );
        assert_eq!(signal.len(), before);
        assert!(rms(&signal[1000..]) < 0.1);
    }
}
