//! The raw signal reader: source bytes in, cached samples out.
//!
//! A reader owns one [SignalSource] and one [FormatDecoder].  After `setup` has decoded the
//! header and `setup_cache` has claimed a range from the memory manager, `cache_signals` pumps
//! data units through the decoder into the input cache, merging any interruptions and
//! annotations the format carries and announcing progress on the property bus.  Small sources
//! are pulled in one read; large ones stream chunk by chunk in an order chosen by the read
//! direction policy around the current viewport position.

pub mod decoder;
pub mod source;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use signal_synchronization::CacheToken;

use crate::cache::coupled::CachedSignal;
use crate::cache::{required_bytes, InputCache, PartSignal, SignalCachePart};
use crate::config::{DATA_CHUNK_BYTES, MAX_DIRECT_LOAD_BYTES, MAX_LOAD_CACHE_BYTES};
use crate::error::{Error, Result};
use crate::events::{PropertyBus, PropertyValue};
use crate::memory::MemoryManager;
use crate::reader::decoder::{DecodedChunk, FormatDecoder, SourceHeader};
use crate::reader::source::{read_exact_retrying, SignalSource};
use crate::recording::annotation::Annotation;
use crate::recording::interruption::{Interruption, InterruptionMap};
use crate::unique_id::UniqueId;

/// Bytes of source prefix offered to `decode_header`.
const HEADER_PROBE_BYTES: u64 = 64 * 1024;

/// Which part of the recording to fetch next while streaming.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub enum ReadDirection {
    /// Ascending from the viewport; continuous playback.
    #[default]
    Forward,
    /// Descending from the viewport.
    Backward,
    /// Around the viewport, trailing half first; user navigation.
    Alternate,
}

#[derive(Clone, Debug)]
pub struct ReaderConfig {
    /// Target chunk size in bytes; rounded down to whole data units (less one) before use.
    pub chunk_bytes: usize,
    /// Sources at most this large load in one read.
    pub max_direct_load_bytes: u64,
    /// Cap on the raw cache size.
    pub max_cache_bytes: usize,
    pub direction: ReadDirection,
}

impl Default for ReaderConfig {
    fn default() -> Self {
        ReaderConfig {
            chunk_bytes: DATA_CHUNK_BYTES,
            max_direct_load_bytes: MAX_DIRECT_LOAD_BYTES,
            max_cache_bytes: MAX_LOAD_CACHE_BYTES,
            direction: ReadDirection::default(),
        }
    }
}

pub struct RawSignalReader<S, D> {
    source: S,
    decoder: D,
    config: ReaderConfig,
    header: Option<SourceHeader>,
    cache: Option<InputCache>,
    cache_owner: UniqueId,
    loaded_units: Vec<bool>,
    interruptions: InterruptionMap,
    annotations: Vec<Annotation>,
    bus: PropertyBus,
    cancel: Arc<AtomicBool>,
    /// Viewport position expressed as a data unit index; anchors the direction policy.
    position_unit: u64,
    alternate_behind: bool,
    /// Bytes reported by the previous progress event.
    progress_bytes: u64,
}

impl<S: SignalSource, D: FormatDecoder> RawSignalReader<S, D> {
    pub fn new(source: S, decoder: D, config: ReaderConfig) -> RawSignalReader<S, D> {
        RawSignalReader {
            source,
            decoder,
            config,
            header: None,
            cache: None,
            cache_owner: UniqueId::new(),
            loaded_units: Vec::new(),
            interruptions: InterruptionMap::new(),
            annotations: Vec::new(),
            bus: PropertyBus::new(),
            cancel: Arc::new(AtomicBool::new(false)),
            position_unit: 0,
            alternate_behind: false,
            progress_bytes: 0,
        }
    }

    /// Decode the source header.  Returns the recording's data duration in seconds.
    ///
    /// A header that fails to decode is fatal for the reader; callers move the owning resource
    /// to its error state.
    pub fn setup(&mut self) -> Result<f64> {
        let probe_len = self.source.len().min(HEADER_PROBE_BYTES);
        let mut probe = vec![0u8; probe_len as usize];
        read_exact_retrying(&mut self.source, 0, &mut probe)?;

        let header = self.decoder.decode_header(&probe, self.source.len())?;
        self.loaded_units = vec![false; header.data_unit_count as usize];
        self.header = Some(header);
        Ok(self.data_duration())
    }

    pub fn data_duration(&self) -> f64 {
        self.header.as_ref().map(|h| h.data_duration()).unwrap_or(0.0)
    }

    pub fn header(&self) -> Option<&SourceHeader> {
        self.header.as_ref()
    }

    pub fn annotations(&self) -> &[Annotation] {
        &self.annotations
    }

    pub fn interruptions(&self) -> &InterruptionMap {
        &self.interruptions
    }

    pub fn bus_mut(&mut self) -> &mut PropertyBus {
        &mut self.bus
    }

    /// Shared flag long fills poll between chunks.
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        self.cancel.clone()
    }

    /// Load progress as `(loaded, total)` bytes; the pollable twin of the
    /// `loading-progress` events.
    pub fn progress(&self) -> (u64, u64) {
        let total = self.header.as_ref().map(|h| h.data_bytes()).unwrap_or(0);
        (self.progress_bytes, total)
    }

    pub fn cache_owner(&self) -> UniqueId {
        self.cache_owner
    }

    /// Move the viewport anchor used by the read-direction policy.
    pub fn set_position(&mut self, seconds: f64) {
        if let Some(header) = &self.header {
            self.position_unit =
                ((seconds / header.data_unit_duration).floor() as u64).min(header.data_unit_count);
        }
    }

    /// Cache size this recording needs, in bytes.  Fails when the source would overflow the
    /// configured cache cap.
    pub fn cache_bytes_required(&self) -> Result<usize> {
        let header = self
            .header
            .as_ref()
            .ok_or_else(|| Error::State("cache sizing before setup".into()))?;

        let rates: Vec<f64> = header.channels.iter().map(|c| c.sampling_rate).collect();
        let bytes = required_bytes(&rates, header.data_duration());
        if bytes > self.config.max_cache_bytes {
            return Err(Error::Allocation {
                requested: bytes,
                available: self.config.max_cache_bytes,
            });
        }
        Ok(bytes)
    }

    /// Build the input cache over an allocated range.  Returns the token readers elsewhere use
    /// to build their views.
    pub fn install_cache(
        &mut self,
        buffer: Arc<signal_synchronization::SharedBuffer>,
        token: CacheToken,
    ) -> Result<CacheToken> {
        let header = self
            .header
            .as_ref()
            .ok_or_else(|| Error::State("install_cache before setup".into()))?;
        let rates: Vec<f64> = header.channels.iter().map(|c| c.sampling_rate).collect();

        let cache = InputCache::new(buffer, token)?;
        cache.init_signal_buffers(&rates, header.data_duration())?;
        let out = cache.output_token();
        self.cache = Some(cache);
        Ok(out)
    }

    /// Register an input cache with a directly-held memory manager, sized for the full
    /// recording.  The threaded service path goes through the memory service instead.
    pub fn setup_cache(&mut self, manager: &mut MemoryManager) -> Result<CacheToken> {
        let bytes = self.cache_bytes_required()?;
        let token = manager.allocate(bytes, self.cache_owner)?;
        self.install_cache(manager.buffer(), token)
    }

    /// Adopt a compacted cache location announced by the memory manager.
    pub fn rebase_cache(&mut self, new_start: usize) {
        if let Some(cache) = self.cache.as_mut() {
            cache.rebase(new_start);
        }
    }

    /// Drop the cache reference; the owning service releases the range with the manager.
    pub fn release_cache(&mut self) {
        self.cache = None;
        for flag in self.loaded_units.iter_mut() {
            *flag = false;
        }
    }

    /// Units per streamed chunk: the chunk byte budget in whole units, less one, at least one.
    fn units_per_chunk(&self, header: &SourceHeader) -> u64 {
        if self.source.len() <= self.config.max_direct_load_bytes {
            return u64::MAX;
        }
        ((self.config.chunk_bytes / header.data_unit_bytes) as u64)
            .saturating_sub(1)
            .max(1)
    }

    /// Pump every remaining data unit through the decoder into the cache.
    pub fn cache_signals(&mut self) -> Result<()> {
        let header = self
            .header
            .clone()
            .ok_or_else(|| Error::State("cache_signals before setup".into()))?;
        if self.cache.is_none() {
            return Err(Error::State("cache_signals before setup_cache".into()));
        }

        let per_chunk = self.units_per_chunk(&header);
        while let Some((start, count)) = self.next_unloaded_run(per_chunk) {
            if self.cancel.load(Ordering::Relaxed) {
                return Err(Error::Cancelled("cache fill cancelled"));
            }
            self.load_run(&header, start, count)?;
        }
        Ok(())
    }

    /// Return the requested range from the cache, forward-loading whatever is missing first.
    ///
    /// The returned part covers the intersection of the request with the cache's valid window
    /// for every signal.
    pub fn get_signals(&mut self, start: f64, end: f64) -> Result<SignalCachePart> {
        let header = self
            .header
            .clone()
            .ok_or_else(|| Error::State("get_signals before setup".into()))?;
        if self.cache.is_none() {
            return Err(Error::State("get_signals before setup_cache".into()));
        }

        let start = start.max(0.0);
        let end = end.min(header.data_duration());
        if start >= end {
            return Err(Error::State(format!(
                "empty or inverted range {start}..{end}"
            )));
        }

        // Load the covering units in forward order, a chunk at a time.
        let first = (start / header.data_unit_duration).floor() as u64;
        let last = ((end / header.data_unit_duration).ceil() as u64).min(header.data_unit_count);
        let per_chunk = self.units_per_chunk(&header);
        let mut unit = first;
        while unit < last {
            if self.loaded_units[unit as usize] {
                unit += 1;
                continue;
            }
            let mut count = 1;
            while unit + count < last
                && count < per_chunk
                && !self.loaded_units[(unit + count) as usize]
            {
                count += 1;
            }
            self.load_run(&header, unit, count)?;
            unit += count;
        }

        let read = self
            .cache
            .as_ref()
            .expect("checked above")
            .read_signals(start, end);
        assemble_part(read)
            .ok_or_else(|| Error::State(format!("range {start}..{end} is not cached")))
    }

    /// Load `count` units starting at `start`, inserting decoded samples into the cache.
    ///
    /// A decode failure skips the chunk: its span becomes an interruption plus a technical
    /// warning annotation, and loading continues.  Source failures have already been retried
    /// and abort the fill.
    fn load_run(&mut self, header: &SourceHeader, start: u64, count: u64) -> Result<()> {
        let (from, to) = header.byte_range_of_units(start, count);
        let mut bytes = vec![0u8; (to - from) as usize];
        read_exact_retrying(&mut self.source, from, &mut bytes)?;

        match self
            .decoder
            .decode_units(header, &bytes, start, count, false)
            .and_then(|chunk| validate_chunk(header, count, chunk, from, to))
        {
            Ok(chunk) => self.insert_chunk(header, start, count, chunk)?,
            Err(err) if err.is_chunk_recoverable() => {
                let t0 = start as f64 * header.data_unit_duration;
                let span = count as f64 * header.data_unit_duration;
                log::warn!("skipping undecodable units {start}..{}: {err}", start + count);
                self.interruptions.insert(Interruption::new(t0, span));
                self.annotations.push(Annotation::technical_warning(
                    t0,
                    span,
                    format!("skipped undecodable data: {err}"),
                ));
            }
            Err(err) => return Err(err),
        }

        for flag in &mut self.loaded_units[start as usize..(start + count) as usize] {
            *flag = true;
        }
        self.emit_progress(header);
        Ok(())
    }

    fn insert_chunk(
        &mut self,
        header: &SourceHeader,
        start_unit: u64,
        unit_count: u64,
        chunk: DecodedChunk,
    ) -> Result<()> {
        let t0 = start_unit as f64 * header.data_unit_duration;
        let t1 = (start_unit + unit_count) as f64 * header.data_unit_duration;

        let signals = chunk
            .signals
            .into_iter()
            .zip(&header.channels)
            .map(|(data, channel)| PartSignal::new(data, channel.sampling_rate))
            .collect();
        let part = SignalCachePart::new(t0, t1, signals);
        self.cache
            .as_ref()
            .expect("load paths check the cache exists")
            .insert_signals(&part)?;

        self.annotations.extend(chunk.annotations);
        for i in chunk.interruptions {
            self.interruptions.insert(i);
        }
        Ok(())
    }

    fn emit_progress(&mut self, header: &SourceHeader) {
        let loaded_units = self.loaded_units.iter().filter(|l| **l).count() as u64;
        let total = header.data_bytes();
        let loaded = loaded_units * header.data_unit_bytes as u64;
        let prev = std::mem::replace(&mut self.progress_bytes, loaded);
        self.bus.emit(
            "loading-progress",
            PropertyValue::Progress {
                loaded: prev,
                total,
            },
            PropertyValue::Progress { loaded, total },
        );
    }

    /// The next run of unloaded units under the direction policy, at most `max_units` long.
    fn next_unloaded_run(&mut self, max_units: u64) -> Option<(u64, u64)> {
        let n = self.loaded_units.len() as u64;
        if n == 0 {
            return None;
        }
        let pos = self.position_unit.min(n - 1);

        let pick = match self.config.direction {
            ReadDirection::Forward => self
                .first_unloaded(pos, n)
                .or_else(|| self.first_unloaded(0, pos)),
            ReadDirection::Backward => self
                .last_unloaded(0, pos + 1)
                .or_else(|| self.first_unloaded(pos + 1, n)),
            ReadDirection::Alternate => {
                self.alternate_behind = !self.alternate_behind;
                if self.alternate_behind {
                    self.last_unloaded(0, pos)
                        .or_else(|| self.first_unloaded(pos, n))
                } else {
                    self.first_unloaded(pos, n)
                        .or_else(|| self.last_unloaded(0, pos))
                }
            }
        }?;

        // Forward loading grows the run ahead of the pick; backward loading grows it behind
        // (the batch itself is still read in order).  Alternate goes by which side of the
        // viewport the pick landed on.
        let growing_back = match self.config.direction {
            ReadDirection::Forward => false,
            ReadDirection::Backward => true,
            ReadDirection::Alternate => pick < pos,
        };
        if growing_back {
            let mut start = pick;
            while start > 0 && pick - start + 1 < max_units && !self.loaded_units[start as usize - 1]
            {
                start -= 1;
            }
            Some((start, pick - start + 1))
        } else {
            let mut count = 1u64;
            while pick + count < n
                && count < max_units
                && !self.loaded_units[(pick + count) as usize]
            {
                count += 1;
            }
            Some((pick, count))
        }
    }

    fn first_unloaded(&self, from: u64, to: u64) -> Option<u64> {
        (from..to.min(self.loaded_units.len() as u64))
            .find(|u| !self.loaded_units[*u as usize])
    }

    fn last_unloaded(&self, from: u64, to: u64) -> Option<u64> {
        (from..to.min(self.loaded_units.len() as u64))
            .rev()
            .find(|u| !self.loaded_units[*u as usize])
    }
}

/// Combine per-signal reads into one part over their common window.
fn assemble_part(read: Vec<Option<CachedSignal>>) -> Option<SignalCachePart> {
    let mut lo = f64::NEG_INFINITY;
    let mut hi = f64::INFINITY;
    for s in &read {
        let s = s.as_ref()?;
        lo = lo.max(s.start);
        hi = hi.min(s.end);
    }
    if lo >= hi {
        return None;
    }

    let signals: Vec<PartSignal> = read
        .into_iter()
        .map(|s| {
            let s = s.expect("checked above");
            let skip = crate::cache::sample_count(lo - s.start, s.sampling_rate);
            let take = crate::cache::sample_count(hi - lo, s.sampling_rate);
            PartSignal::new(
                s.data[skip..skip + take].to_vec(),
                s.sampling_rate,
            )
        })
        .collect();
    Some(SignalCachePart::new(lo, hi, signals))
}

fn validate_chunk(
    header: &SourceHeader,
    unit_count: u64,
    chunk: DecodedChunk,
    from: u64,
    to: u64,
) -> Result<DecodedChunk> {
    if chunk.signals.len() != header.channels.len() {
        return Err(Error::decode(
            format!(
                "decoder produced {} signals for {} channels",
                chunk.signals.len(),
                header.channels.len()
            ),
            from,
            to,
        ));
    }
    for (i, (signal, spu)) in chunk.signals.iter().zip(&header.samples_per_unit).enumerate() {
        let expected = unit_count as usize * spu;
        if signal.len() != expected {
            return Err(Error::decode(
                format!(
                    "signal {i} holds {} samples, expected {expected}",
                    signal.len()
                ),
                from,
                to,
            ));
        }
    }
    Ok(chunk)
}
