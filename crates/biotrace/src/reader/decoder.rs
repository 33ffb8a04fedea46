//! File-format decoder and encoder contracts.
//!
//! Concrete formats (EDF, WAV, and friends) live outside the engine; this module fixes the
//! interface they implement plus one trivial built-in: a headerless PCM layout used by tests and
//! as the reference implementation of the contract.
//!
//! Decoder obligations:
//! - `signals[i].len() == unit_count * header.samples_per_unit[i]`, samples time-ascending;
//! - samples are in physical units unless `return_raw` was set;
//! - annotation and interruption times are absolute data time (the decoder knows `start_unit`).

use crate::cache::part::sample_count;
use crate::error::{Error, Result};
use crate::recording::annotation::Annotation;
use crate::recording::channel::SourceChannel;
use crate::recording::interruption::{Interruption, InterruptionMap};

/// Everything the engine needs to know about a source, as decoded from its header.
#[derive(Clone, Debug)]
pub struct SourceHeader {
    pub channels: Vec<SourceChannel>,
    /// Number of addressable data units (records) in the source.
    pub data_unit_count: u64,
    /// Bytes per data unit.
    pub data_unit_bytes: usize,
    /// Seconds of data time per unit.
    pub data_unit_duration: f64,
    /// Offset of the first data unit.
    pub header_bytes: u64,
    /// Per-channel samples in one unit.
    pub samples_per_unit: Vec<usize>,
    /// Absolute start as seconds since the Unix epoch, when the format records one.
    pub start_time: Option<i64>,
}

impl SourceHeader {
    /// Seconds of actual signal (interruptions excluded).
    pub fn data_duration(&self) -> f64 {
        self.data_unit_count as f64 * self.data_unit_duration
    }

    /// Total bytes of signal data past the header.
    pub fn data_bytes(&self) -> u64 {
        self.data_unit_count * self.data_unit_bytes as u64
    }

    pub fn byte_range_of_units(&self, start_unit: u64, unit_count: u64) -> (u64, u64) {
        let from = self.header_bytes + start_unit * self.data_unit_bytes as u64;
        (from, from + unit_count * self.data_unit_bytes as u64)
    }
}

/// Decoded samples plus whatever bookkeeping the format embeds.
#[derive(Clone, Debug, Default)]
pub struct DecodedChunk {
    /// Per channel, `unit_count * samples_per_unit` samples.
    pub signals: Vec<Vec<f32>>,
    pub annotations: Vec<Annotation>,
    pub interruptions: Vec<Interruption>,
}

pub trait FormatDecoder: Send {
    /// Decode the source header from a prefix of the file.  `source_len` lets headerless
    /// formats derive their unit count.
    fn decode_header(&mut self, bytes: &[u8], source_len: u64) -> Result<SourceHeader>;

    /// Decode `unit_count` units beginning at `start_unit` from `bytes` (exactly the bytes of
    /// those units).  With `return_raw` the physical-unit conversion is skipped.
    fn decode_units(
        &mut self,
        header: &SourceHeader,
        bytes: &[u8],
        start_unit: u64,
        unit_count: u64,
        return_raw: bool,
    ) -> Result<DecodedChunk>;

    /// Decode an entire in-memory source in one go.
    fn decode(&mut self, bytes: &[u8]) -> Result<(SourceHeader, DecodedChunk)> {
        let header = self.decode_header(bytes, bytes.len() as u64)?;
        let (from, to) = header.byte_range_of_units(0, header.data_unit_count);
        let data = bytes.get(from as usize..to as usize).ok_or_else(|| {
            Error::decode("source shorter than its header claims", from, to)
        })?;
        let chunk = self.decode_units(&header, data, 0, header.data_unit_count, false)?;
        Ok((header, chunk))
    }
}

/// The export-side contract.  An encoder is configured piecewise, then asked to produce bytes.
pub trait FormatEncoder {
    /// Build a complete header from the recording's view of itself; the encoder fills
    /// format-specific fields.
    fn create_header(&mut self, template: &SourceHeader) -> SourceHeader;

    fn set_annotations(&mut self, annotations: &[Annotation]);

    fn set_interruptions(&mut self, interruptions: &InterruptionMap);

    /// Restrict the export to these source channel indices.
    fn set_signals_to_include(&mut self, indices: &[usize]);

    /// Produce the encoded bytes.  With `anonymize`, identity fields are stripped from the
    /// header first.
    fn encode(&mut self, anonymize: bool) -> Result<Vec<u8>>;
}

/// A headerless interleaved-f32 format: each unit carries, channel by channel, that channel's
/// samples for one unit duration, little-endian.
///
/// The channel set and unit duration are configuration rather than header content, which makes
/// this the minimal complete [FormatDecoder] and a convenient test vehicle.
pub struct PcmDecoder {
    channels: Vec<SourceChannel>,
    unit_duration: f64,
}

impl PcmDecoder {
    pub fn new(channels: Vec<SourceChannel>, unit_duration: f64) -> PcmDecoder {
        assert!(unit_duration > 0.0);
        PcmDecoder {
            channels,
            unit_duration,
        }
    }

    fn samples_per_unit(&self) -> Vec<usize> {
        self.channels
            .iter()
            .map(|c| sample_count(self.unit_duration, c.sampling_rate))
            .collect()
    }
}

impl FormatDecoder for PcmDecoder {
    fn decode_header(&mut self, _bytes: &[u8], source_len: u64) -> Result<SourceHeader> {
        let samples_per_unit = self.samples_per_unit();
        let unit_bytes: usize = samples_per_unit.iter().sum::<usize>() * 4;
        if unit_bytes == 0 {
            return Err(Error::decode("no channels configured", 0, source_len));
        }

        let mut channels = self.channels.clone();
        let data_unit_count = source_len / unit_bytes as u64;
        for (c, spu) in channels.iter_mut().zip(&samples_per_unit) {
            c.sample_count = data_unit_count * *spu as u64;
        }

        Ok(SourceHeader {
            channels,
            data_unit_count,
            data_unit_bytes: unit_bytes,
            data_unit_duration: self.unit_duration,
            header_bytes: 0,
            samples_per_unit,
            start_time: None,
        })
    }

    fn decode_units(
        &mut self,
        header: &SourceHeader,
        bytes: &[u8],
        start_unit: u64,
        unit_count: u64,
        _return_raw: bool,
    ) -> Result<DecodedChunk> {
        let expected = unit_count as usize * header.data_unit_bytes;
        if bytes.len() != expected {
            let (from, to) = header.byte_range_of_units(start_unit, unit_count);
            return Err(Error::decode(
                format!("expected {expected} bytes, got {}", bytes.len()),
                from,
                to,
            ));
        }

        let mut signals: Vec<Vec<f32>> = header
            .samples_per_unit
            .iter()
            .map(|spu| Vec::with_capacity(*spu * unit_count as usize))
            .collect();

        let mut cursor = 0usize;
        for _ in 0..unit_count {
            for (channel, spu) in header.samples_per_unit.iter().enumerate() {
                for _ in 0..*spu {
                    let raw = [
                        bytes[cursor],
                        bytes[cursor + 1],
                        bytes[cursor + 2],
                        bytes[cursor + 3],
                    ];
                    signals[channel].push(f32::from_le_bytes(raw));
                    cursor += 4;
                }
            }
        }

        Ok(DecodedChunk {
            signals,
            ..Default::default()
        })
    }
}

/// Encode per-channel sample vectors in [PcmDecoder]'s layout.  The inverse used by tests and
/// exports of trivial sources.
pub fn encode_pcm_units(header: &SourceHeader, signals: &[Vec<f32>]) -> Vec<u8> {
    let total_units = signals
        .first()
        .map(|s| s.len() / header.samples_per_unit[0].max(1))
        .unwrap_or(0);
    let mut out = Vec::with_capacity(total_units * header.data_unit_bytes);
    for unit in 0..total_units {
        for (channel, spu) in header.samples_per_unit.iter().enumerate() {
            let from = unit * spu;
            for s in &signals[channel][from..from + spu] {
                out.extend_from_slice(&s.to_le_bytes());
            }
        }
    }
    out
}
