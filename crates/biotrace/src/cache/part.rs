//! Contiguous cached signal ranges.
//!
//! A [SignalCachePart] is the unit of exchange everywhere in the pipeline: decoders emit them,
//! caches store and return them, the montage processor derives new ones.  Times are data time.

use crate::error::{Error, Result};

/// One signal inside a part.
#[derive(Clone, Debug, PartialEq)]
pub struct PartSignal {
    pub data: Vec<f32>,
    pub sampling_rate: f64,
    /// Set when the data was downsampled for display.
    pub original_sampling_rate: Option<f64>,
    /// Absolute sample index of the first sample, when known.
    pub sample_start: Option<u64>,
    /// Absolute sample index one past the last sample, when known.
    pub sample_end: Option<u64>,
}

impl PartSignal {
    pub fn new(data: Vec<f32>, sampling_rate: f64) -> PartSignal {
        PartSignal {
            data,
            sampling_rate,
            original_sampling_rate: None,
            sample_start: None,
            sample_end: None,
        }
    }
}

/// A contiguous range of cached signals over `[start, end]` seconds of data time.
#[derive(Clone, Debug, PartialEq)]
pub struct SignalCachePart {
    pub start: f64,
    pub end: f64,
    pub signals: Vec<PartSignal>,
}

/// Number of samples covering `seconds` at `sampling_rate`.
pub fn sample_count(seconds: f64, sampling_rate: f64) -> usize {
    (seconds * sampling_rate).round() as usize
}

/// Sample index of data-time `t` at `sampling_rate`.
pub fn sample_index(t: f64, sampling_rate: f64) -> usize {
    (t * sampling_rate).round() as usize
}

impl SignalCachePart {
    pub fn new(start: f64, end: f64, signals: Vec<PartSignal>) -> SignalCachePart {
        SignalCachePart {
            start,
            end,
            signals,
        }
    }

    pub fn duration(&self) -> f64 {
        self.end - self.start
    }

    /// Check the core length invariant: every signal holds exactly
    /// `round(duration * sampling_rate)` samples.
    pub fn is_consistent(&self) -> bool {
        self.signals
            .iter()
            .all(|s| s.data.len() == sample_count(self.duration(), s.sampling_rate))
    }

    /// Merge `other` into this part.
    ///
    /// Succeeds (returning `true`) when the parts share signal count and per-signal sampling
    /// rates and their ranges touch or overlap; the result covers the union of both ranges and
    /// `other`'s samples win wherever the two overlap.  On any mismatch the part is left
    /// untouched and `false` is returned.
    pub fn combine(&mut self, other: &SignalCachePart) -> bool {
        if self.signals.len() != other.signals.len() {
            return false;
        }
        if self
            .signals
            .iter()
            .zip(&other.signals)
            .any(|(a, b)| a.sampling_rate != b.sampling_rate)
        {
            return false;
        }
        // A gap between the parts would leave samples we cannot invent.
        if other.start > self.end || other.end < self.start {
            return false;
        }

        let start = self.start.min(other.start);
        let end = self.end.max(other.end);

        let mut merged = Vec::with_capacity(self.signals.len());
        for (a, b) in self.signals.iter().zip(&other.signals) {
            let rate = a.sampling_rate;
            let mut data = vec![0.0f32; sample_count(end - start, rate)];

            let a_at = sample_index(self.start - start, rate);
            data[a_at..a_at + a.data.len()].copy_from_slice(&a.data);
            let b_at = sample_index(other.start - start, rate);
            data[b_at..b_at + b.data.len()].copy_from_slice(&b.data);

            let mut signal = PartSignal::new(data, rate);
            signal.original_sampling_rate = a.original_sampling_rate;
            signal.sample_start = match (a.sample_start, b.sample_start) {
                (Some(x), Some(y)) => Some(x.min(y)),
                _ => None,
            };
            signal.sample_end = match (a.sample_end, b.sample_end) {
                (Some(x), Some(y)) => Some(x.max(y)),
                _ => None,
            };
            merged.push(signal);
        }

        self.start = start;
        self.end = end;
        self.signals = merged;
        true
    }

    /// Restrict this part to `[new_start, new_end]`, dropping samples outside.  Used to shed
    /// filter padding and to answer exact-range requests.
    pub fn trim_to(&mut self, new_start: f64, new_end: f64) -> Result<()> {
        if new_start < self.start || new_end > self.end || new_start > new_end {
            return Err(Error::State(format!(
                "cannot trim [{}, {}] to [{}, {}]",
                self.start, self.end, new_start, new_end
            )));
        }

        for s in self.signals.iter_mut() {
            let lo = sample_index(new_start - self.start, s.sampling_rate);
            let n = sample_count(new_end - new_start, s.sampling_rate);
            s.data.drain(..lo);
            s.data.truncate(n);
            if let Some(base) = s.sample_start {
                s.sample_start = Some(base + lo as u64);
                s.sample_end = Some(base + lo as u64 + n as u64);
            }
        }
        self.start = new_start;
        self.end = new_end;
        Ok(())
    }

    /// Concatenate data-time-adjacent segments (as produced by an interrupted read) into one
    /// part spanning from the first segment's start to the last one's end.
    pub fn concat_segments(mut segments: Vec<SignalCachePart>) -> Option<SignalCachePart> {
        let mut first = segments.drain(..1).next()?;
        for seg in segments {
            if !first.combine(&seg) {
                return None;
            }
        }
        Some(first)
    }
}
