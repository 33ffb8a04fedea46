//! Rate reduction for display.
//!
//! The viewer never needs more samples than it has pixels, so channels sampled far above the
//! display limit are low-passed at the target Nyquist and decimated by an integer factor.  The
//! original rate travels with the result so consumers can still report it.

use crate::biquad::{BiquadFilterDef, FilterWidth, MonoBiquadFilter, DEFAULT_Q};

/// A decimated signal plus the rates involved.
#[derive(Debug, Clone, PartialEq)]
pub struct Downsampled {
    pub data: Vec<f32>,
    /// Rate of `data`.
    pub sampling_rate: f64,
    /// Rate of the input the data was derived from.
    pub original_sampling_rate: f64,
}

/// Downsample `signal` when its rate is more than twice `limit`.
///
/// Returns `None` when no downsampling applies (rate already low enough, or `limit` not
/// positive); the caller then uses the signal as-is.  Otherwise the signal is anti-alias filtered
/// with an IIR low-pass at half the output rate and every `factor`-th sample is kept.
pub fn downsample(signal: &[f32], sampling_rate: f64, limit: f64) -> Option<Downsampled> {
    if limit <= 0.0 || sampling_rate <= 2.0 * limit {
        return None;
    }

    // Integer decimation only; the factor is at least 2 by the check above.
    let factor = (sampling_rate / limit).floor() as usize;
    debug_assert!(factor >= 2);
    let out_rate = sampling_rate / factor as f64;

    let mut filtered = signal.to_vec();
    let def = BiquadFilterDef::lowpass(out_rate / 2.0, sampling_rate, FilterWidth::Q(DEFAULT_Q));
    MonoBiquadFilter::new(def).process(&mut filtered);

    let data: Vec<f32> = filtered.iter().step_by(factor).copied().collect();

    Some(Downsampled {
        data,
        sampling_rate: out_rate,
        original_sampling_rate: sampling_rate,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_downsampling_below_the_limit() {
        let signal = vec![0.0f32; 100];
        assert!(downsample(&signal, 250.0, 200.0).is_none());
        assert!(downsample(&signal, 250.0, 0.0).is_none());
    }

    #[test]
    fn decimates_by_integer_factor() {
        let signal = vec![1.0f32; 1000];
        let got = downsample(&signal, 1000.0, 250.0).unwrap();
        assert_eq!(got.data.len(), 250);
        assert_eq!(got.sampling_rate, 250.0);
        assert_eq!(got.original_sampling_rate, 1000.0);
    }

    #[test]
    fn slow_content_survives_decimation() {
        let sr = 1000.0;
        let signal: Vec<f32> = (0..4000)
            .map(|i| (2.0 * std::f64::consts::PI * 2.0 * i as f64 / sr).sin() as f32)
            .collect();
        let got = downsample(&signal, sr, 100.0).unwrap();

        // 2 Hz is far below the new Nyquist; amplitude should be essentially intact after the
        // startup transient.
        let tail = &got.data[got.data.len() / 2..];
        let peak = tail.iter().fold(0.0f32, |m, s| m.max(s.abs()));
        assert!(peak > 0.9, "peak was {peak}");
    }
}
