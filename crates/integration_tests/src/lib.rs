//! Shared fixtures for the cross-crate scenario tests.
//!
//! Everything here builds tiny in-memory recordings in the headerless PCM layout the engine's
//! reference decoder understands, so tests can drive the whole pipeline without touching disk.

use biotrace::reader::decoder::{encode_pcm_units, FormatDecoder, PcmDecoder};
use biotrace::reader::source::MemorySource;
use biotrace::reader::{RawSignalReader, ReaderConfig};
use biotrace::recording::channel::SourceChannel;

/// A recording fixture: named constant-valued channels at one rate.
pub struct ConstantRecording {
    pub channels: Vec<SourceChannel>,
    pub decoder: PcmDecoder,
    pub bytes: Vec<u8>,
    pub duration: f64,
}

/// Build `values.len()` channels, channel `i` holding `values[i]` everywhere, at
/// `sampling_rate` Hz for `duration` whole seconds (one data unit per second).
pub fn constant_recording(values: &[f32], sampling_rate: f64, duration: f64) -> ConstantRecording {
    let channels: Vec<SourceChannel> = values
        .iter()
        .enumerate()
        .map(|(i, _)| SourceChannel::new(format!("ch{i}"), "eeg", sampling_rate))
        .collect();

    let mut decoder = PcmDecoder::new(channels.clone(), 1.0);
    let samples = (sampling_rate * duration) as usize;
    let unit_bytes: usize = values.len() * sampling_rate as usize * 4;
    let header = decoder
        .decode_header(&[], (unit_bytes as f64 * duration) as u64)
        .unwrap();
    let signals: Vec<Vec<f32>> = values.iter().map(|v| vec![*v; samples]).collect();
    let bytes = encode_pcm_units(&header, &signals);

    ConstantRecording {
        channels,
        decoder,
        bytes,
        duration,
    }
}

impl ConstantRecording {
    /// A reader over this fixture with the default configuration.
    pub fn reader(self) -> RawSignalReader<MemorySource, PcmDecoder> {
        RawSignalReader::new(
            MemorySource::new(self.bytes),
            self.decoder,
            ReaderConfig::default(),
        )
    }
}
