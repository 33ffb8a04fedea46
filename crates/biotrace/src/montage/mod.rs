//! The montage processor: derived channels out of cached raw signals.
//!
//! A processor binds one montage recipe to one recording: `map_channels` resolves template
//! id-names against the recording's source channels, `get_all_signals` derives the requested
//! range (active mix minus reference mix, polarity and scale applied, filtered in fixed order,
//! padding shed, optionally downsampled) and writes it through to the montage cache.  Requests
//! are made in recording time; an interrupted range is derived one continuous run at a time and
//! concatenated, and filters never reach across a gap.
//!
//! Per channel the lifecycle is `Unmapped → Mapped → Cached → Stale` (and back to `Cached` on
//! the next request); templates that fail to resolve park at `Missing` and render blank.

pub mod config;

use smallvec::SmallVec;

use biotrace_dsp as dsp;
use signal_synchronization::CacheToken;

use crate::cache::coupled::CachedSignal;
use crate::cache::{required_bytes, sample_count, InputCache, OutputCache, PartSignal, SignalCachePart};
use crate::config::FILTER_PADDING_SECONDS;
use crate::error::{Error, Result};
use crate::events::{PropertyBus, PropertyValue};
use crate::memory::MemoryManager;
use crate::montage::config::{FilterKind, FilterSettings, MontageConfig, TemplateRef};
use crate::recording::channel::SourceChannel;
use crate::recording::interruption::{DataSegment, Interruption, InterruptionMap};
use crate::recording::layout::{channel_offsets, ChannelOffset, LayoutConfig};
use crate::unique_id::UniqueId;

/// Something that serves raw source signals over a data-time range; usually an [OutputCache]
/// view of the reader's input cache, possibly living in another worker.
pub trait RawSignalSupplier: Send {
    /// One entry per source channel, `None` where the range is not cached.
    fn raw_signals(&self, start: f64, end: f64) -> Vec<Option<CachedSignal>>;
}

impl RawSignalSupplier for OutputCache {
    fn raw_signals(&self, start: f64, end: f64) -> Vec<Option<CachedSignal>> {
        self.read_signals(start, end)
    }
}

/// A weighted set of source channel indices.
type Mix = SmallVec<[(usize, f32); 4]>;

#[derive(Clone, Debug, PartialEq)]
enum ReferenceMix {
    /// Unreferenced.
    None,
    Mix(Mix),
    CommonAverage,
}

#[derive(Copy, Clone, Debug, PartialEq)]
pub enum ChannelState {
    Unmapped,
    /// Template resolution failed; rendered blank.
    Missing,
    Mapped,
    Cached {
        start: f64,
        end: f64,
    },
    Stale,
}

/// One resolved derived channel.
#[derive(Clone, Debug)]
pub struct MontageChannel {
    label: String,
    active: Mix,
    reference: ReferenceMix,
    /// Displayed as already averaged.
    averaged: bool,
    overrides: config::FilterOverrides,
    sampling_rate: f64,
    /// Polarity times 10^scale, from the primary active source.
    factor: f64,
    /// The primary active source is treated as pre-referenced.
    source_averaged: bool,
    state: ChannelState,
}

impl MontageChannel {
    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn state(&self) -> ChannelState {
        self.state
    }

    pub fn sampling_rate(&self) -> f64 {
        self.sampling_rate
    }

    pub fn is_averaged(&self) -> bool {
        self.averaged
    }

    fn missing(label: String) -> MontageChannel {
        MontageChannel {
            label,
            active: Mix::new(),
            reference: ReferenceMix::None,
            averaged: false,
            overrides: config::FilterOverrides::default(),
            sampling_rate: 1.0,
            factor: 1.0,
            source_averaged: false,
            state: ChannelState::Missing,
        }
    }
}

/// The result of one derivation request.
#[derive(Clone, Debug, PartialEq)]
pub struct MontageSignals {
    /// Derived samples; `start`/`end` are data time.
    pub part: SignalCachePart,
    /// Interruptions inside the returned span, starts in recording time, for gap rendering.
    pub interruptions: Vec<Interruption>,
}

pub struct MontageProcessor {
    config: MontageConfig,
    setup_channels: Vec<SourceChannel>,
    channels: Vec<MontageChannel>,
    /// Live recording-wide defaults; starts as the recipe's filters.
    filters: FilterSettings,
    interruptions: InterruptionMap,
    data_duration: f64,
    raw: Box<dyn RawSignalSupplier>,
    cache: Option<InputCache>,
    cache_owner: UniqueId,
    bus: PropertyBus,
}

impl MontageProcessor {
    pub fn new(
        config: MontageConfig,
        setup_channels: Vec<SourceChannel>,
        data_duration: f64,
        interruptions: InterruptionMap,
        raw: Box<dyn RawSignalSupplier>,
    ) -> MontageProcessor {
        let filters = config.filters.clone();
        MontageProcessor {
            config,
            setup_channels,
            channels: Vec::new(),
            filters,
            interruptions,
            data_duration,
            raw,
            cache: None,
            cache_owner: UniqueId::new(),
            bus: PropertyBus::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn channels(&self) -> &[MontageChannel] {
        &self.channels
    }

    pub fn bus_mut(&mut self) -> &mut PropertyBus {
        &mut self.bus
    }

    pub fn cache_owner(&self) -> UniqueId {
        self.cache_owner
    }

    /// Resolve every channel template against the recording setup.
    ///
    /// Unresolved or rate-mismatched templates are non-fatal: the channel is marked missing,
    /// a warning is returned (and logged), and it renders blank.
    pub fn map_channels(&mut self) -> Vec<String> {
        let mut warnings = Vec::new();

        self.channels = self
            .config
            .channels
            .iter()
            .map(|template| {
                match self.resolve_template(template) {
                    Ok(channel) => channel,
                    Err(problem) => {
                        log::warn!("montage {}: {problem}", self.config.name);
                        warnings.push(problem);
                        MontageChannel::missing(template.label.clone())
                    }
                }
            })
            .collect();

        warnings
    }

    fn find_source(&self, name: &str) -> Option<usize> {
        self.setup_channels
            .iter()
            .position(|c| c.name == name && !c.is_meta())
    }

    /// Indices participating in a common average: every visible source channel.
    fn visible_sources(&self) -> Vec<usize> {
        self.setup_channels
            .iter()
            .enumerate()
            .filter(|(_, c)| !c.is_meta())
            .map(|(i, _)| i)
            .collect()
    }

    fn resolve_mix(&self, template: &TemplateRef, side: &str) -> Result<Mix, String> {
        match template {
            TemplateRef::None => Ok(Mix::new()),
            TemplateRef::Single(name) => {
                let idx = self
                    .find_source(name)
                    .ok_or_else(|| format!("{side} channel {name} not found in setup"))?;
                Ok(SmallVec::from_slice(&[(idx, 1.0)]))
            }
            TemplateRef::Weighted(list) => {
                let mut mix = Mix::new();
                for (name, weight) in list {
                    let idx = self
                        .find_source(name)
                        .ok_or_else(|| format!("{side} channel {name} not found in setup"))?;
                    mix.push((idx, *weight));
                }
                Ok(mix)
            }
            TemplateRef::CommonAverage => {
                Err(format!("{side} template cannot be a bare common average"))
            }
        }
    }

    fn resolve_template(
        &self,
        template: &config::ChannelTemplate,
    ) -> Result<MontageChannel, String> {
        let active = self.resolve_mix(&template.active, "active")?;
        if active.is_empty() {
            return Err(format!("channel {} has no active signal", template.label));
        }

        let reference = match &template.reference {
            TemplateRef::None => ReferenceMix::None,
            TemplateRef::CommonAverage => ReferenceMix::CommonAverage,
            other => ReferenceMix::Mix(self.resolve_mix(other, "reference")?),
        };

        let primary = active[0].0;
        let rate = self.setup_channels[primary].sampling_rate;

        // Active and reference signals must share one sampling rate.
        let mut participants: SmallVec<[usize; 8]> = active.iter().map(|(i, _)| *i).collect();
        match &reference {
            ReferenceMix::Mix(m) => participants.extend(m.iter().map(|(i, _)| *i)),
            ReferenceMix::CommonAverage => participants.extend(self.visible_sources()),
            ReferenceMix::None => {}
        }
        for idx in participants {
            if (self.setup_channels[idx].sampling_rate - rate).abs() > f64::EPSILON {
                return Err(format!(
                    "channel {} mixes sampling rates {} and {}",
                    template.label, rate, self.setup_channels[idx].sampling_rate
                ));
            }
        }

        Ok(MontageChannel {
            label: template.label.clone(),
            active,
            reference,
            averaged: template.averaged,
            overrides: template.overrides,
            sampling_rate: rate,
            factor: self.setup_channels[primary].derivation_factor(),
            source_averaged: self.setup_channels[primary].averaged,
            state: ChannelState::Mapped,
        })
    }

    /// The rate actually stored for a channel, accounting for display downsampling.
    fn effective_rate(&self, rate: f64) -> f64 {
        match self.config.downsample_limit {
            Some(limit) if limit > 0.0 && rate > 2.0 * limit => {
                rate / (rate / limit).floor()
            }
            _ => rate,
        }
    }

    fn cache_rates(&self) -> Result<Vec<f64>> {
        if self.channels.is_empty() {
            return Err(Error::State("cache sizing before map_channels".into()));
        }
        Ok(self
            .channels
            .iter()
            .map(|c| self.effective_rate(c.sampling_rate))
            .collect())
    }

    /// Cache size this montage needs, in bytes.
    pub fn cache_bytes_required(&self) -> Result<usize> {
        Ok(required_bytes(&self.cache_rates()?, self.data_duration))
    }

    /// Build the montage cache over an allocated range.
    pub fn install_cache(
        &mut self,
        buffer: std::sync::Arc<signal_synchronization::SharedBuffer>,
        token: CacheToken,
    ) -> Result<CacheToken> {
        let rates = self.cache_rates()?;
        let cache = InputCache::new(buffer, token)?;
        cache.init_signal_buffers(&rates, self.data_duration)?;
        let out = cache.output_token();
        self.cache = Some(cache);
        Ok(out)
    }

    /// Register this montage's cache with a directly-held memory manager, declaring its
    /// dependency on the raw cache so eviction ordering sees the coupling.
    pub fn setup_cache(
        &mut self,
        manager: &mut MemoryManager,
        raw_owner: Option<UniqueId>,
    ) -> Result<CacheToken> {
        let bytes = self.cache_bytes_required()?;
        let token = manager.allocate(bytes, self.cache_owner)?;
        if let Some(raw_owner) = raw_owner {
            manager.add_dependency(self.cache_owner, raw_owner)?;
        }
        self.install_cache(manager.buffer(), token)
    }

    pub fn rebase_cache(&mut self, new_start: usize) {
        if let Some(cache) = self.cache.as_mut() {
            cache.rebase(new_start);
        }
    }

    pub fn release_cache(&mut self) {
        self.cache = None;
        for channel in self.channels.iter_mut() {
            if matches!(channel.state, ChannelState::Cached { .. }) {
                channel.state = ChannelState::Stale;
            }
        }
    }

    /// Derive every channel over the recording-time range `[start, end]`.
    ///
    /// The result's part is keyed in data time and spans exactly the data covered by the
    /// request, with interruption spans listed separately for the caller to render as gaps.
    pub fn get_all_signals(&mut self, start: f64, end: f64) -> Result<MontageSignals> {
        if self.channels.is_empty() {
            return Err(Error::State("get_all_signals before map_channels".into()));
        }

        let total = self.interruptions.data_to_recording(self.data_duration);
        let start = start.max(0.0);
        let end = end.min(total);
        if start >= end {
            return Err(Error::State(format!("empty recording range {start}..{end}")));
        }

        let segments = self.interruptions.segments(start, end);
        let mut parts = Vec::with_capacity(segments.len());
        for segment in segments {
            let signals = self.derive_segment(segment)?;
            parts.push(SignalCachePart::new(segment.start, segment.end, signals));
        }
        let part = SignalCachePart::concat_segments(parts)
            .ok_or_else(|| Error::State(format!("no signal inside {start}..{end}")))?;

        if let Some(cache) = &self.cache {
            cache.insert_signals(&part)?;
        }
        for channel in self.channels.iter_mut() {
            if !matches!(channel.state, ChannelState::Missing | ChannelState::Unmapped) {
                channel.state = ChannelState::Cached {
                    start: part.start,
                    end: part.end,
                };
            }
        }

        let interruptions = self.interruptions.in_range(part.start, part.end, false);
        Ok(MontageSignals {
            part,
            interruptions,
        })
    }

    /// Derive all channels over one continuous data run.
    fn derive_segment(&self, segment: DataSegment) -> Result<Vec<PartSignal>> {
        let (run_lo, run_hi) = self
            .interruptions
            .run_bounds(segment.start, self.data_duration);

        // Pad where signal is available, never across a gap or past the recording.
        let padded_lo = (segment.start - FILTER_PADDING_SECONDS).max(run_lo).max(0.0);
        let padded_hi = (segment.end + FILTER_PADDING_SECONDS)
            .min(run_hi)
            .min(self.data_duration);

        let raw = self.raw.raw_signals(padded_lo, padded_hi);

        self.channels
            .iter()
            .map(|channel| self.derive_channel(channel, segment, padded_lo, padded_hi, &raw))
            .collect()
    }

    fn derive_channel(
        &self,
        channel: &MontageChannel,
        segment: DataSegment,
        padded_lo: f64,
        padded_hi: f64,
        raw: &[Option<CachedSignal>],
    ) -> Result<PartSignal> {
        let rate = channel.sampling_rate;
        let out_len = sample_count(segment.end - segment.start, rate);

        if channel.active.is_empty() {
            // Missing channels render blank but keep their slot.
            return Ok(self.finish_channel(vec![0.0; out_len], rate, segment));
        }

        // Every participating source must cover the segment; padding shrinks to what exists.
        let mut needed: SmallVec<[usize; 8]> = channel.active.iter().map(|(i, _)| *i).collect();
        match &channel.reference {
            ReferenceMix::Mix(m) => needed.extend(m.iter().map(|(i, _)| *i)),
            ReferenceMix::CommonAverage => needed.extend(self.visible_sources()),
            ReferenceMix::None => {}
        }

        let mut lo = padded_lo;
        let mut hi = padded_hi;
        for &idx in &needed {
            let signal = raw
                .get(idx)
                .and_then(|s| s.as_ref())
                .ok_or_else(|| Error::State(format!("source channel {idx} is not cached")))?;
            lo = lo.max(signal.start);
            hi = hi.min(signal.end);
        }
        if lo > segment.start || hi < segment.end {
            return Err(Error::State(format!(
                "raw cache covers {lo}..{hi}, needed {}..{}",
                segment.start, segment.end
            )));
        }

        let n = sample_count(hi - lo, rate);
        let mix = |mix: &Mix| -> Vec<f32> {
            let total_weight: f32 = mix.iter().map(|(_, w)| *w).sum();
            let mut out = vec![0.0f32; n];
            for (idx, weight) in mix {
                for (o, s) in out.iter_mut().zip(source_slice(raw, *idx, lo, n)) {
                    *o += *s * *weight;
                }
            }
            if total_weight != 0.0 && total_weight != 1.0 {
                for o in out.iter_mut() {
                    *o /= total_weight;
                }
            }
            out
        };

        let active = mix(&channel.active);
        let reference: Option<Vec<f32>> = if channel.source_averaged {
            // Already referenced at the source.
            None
        } else {
            match &channel.reference {
                ReferenceMix::None => None,
                ReferenceMix::Mix(m) => Some(mix(m)),
                ReferenceMix::CommonAverage => {
                    let exclude = if self.config.exclude_active_from_avg {
                        Some(channel.active[0].0)
                    } else {
                        None
                    };
                    let members: Mix = self
                        .visible_sources()
                        .into_iter()
                        .filter(|i| Some(*i) != exclude)
                        .map(|i| (i, 1.0))
                        .collect();
                    Some(mix(&members))
                }
            }
        };

        let factor = channel.factor as f32;
        let mut derived = active;
        match reference {
            Some(reference) => {
                for (d, r) in derived.iter_mut().zip(reference) {
                    *d = (*d - r) * factor;
                }
            }
            None => {
                if factor != 1.0 {
                    for d in derived.iter_mut() {
                        *d *= factor;
                    }
                }
            }
        }

        // Fixed order: high-pass, low-pass, notch, then band-rejects in user order.
        let highpass = resolve_filter(channel.overrides.highpass, self.filters.highpass);
        let lowpass = resolve_filter(channel.overrides.lowpass, self.filters.lowpass);
        let notch = resolve_filter(channel.overrides.notch, self.filters.notch);
        let mut filtered = dsp::filter(&derived, rate, lowpass, highpass, notch);
        dsp::apply_band_rejects(&mut filtered, rate, &self.filters.band_rejects);

        // Shed the padding.
        let skip = sample_count(segment.start - lo, rate).min(filtered.len());
        let take_to = (skip + out_len).min(filtered.len());
        let mut data = filtered[skip..take_to].to_vec();
        data.resize(out_len, 0.0);
        Ok(self.finish_channel(data, rate, segment))
    }

    /// Apply display downsampling and wrap up one channel's samples.
    fn finish_channel(&self, data: Vec<f32>, rate: f64, segment: DataSegment) -> PartSignal {
        if let Some(limit) = self.config.downsample_limit {
            if let Some(ds) = dsp::downsample(&data, rate, limit) {
                let mut signal = PartSignal::new(ds.data, ds.sampling_rate);
                signal
                    .data
                    .resize(sample_count(segment.end - segment.start, ds.sampling_rate), 0.0);
                signal.original_sampling_rate = Some(ds.original_sampling_rate);
                return signal;
            }
        }
        PartSignal::new(data, rate)
    }

    /// Replace the recording-wide filter defaults, invalidating every channel that inherits a
    /// changed value.
    pub fn set_filters(&mut self, next: FilterSettings) {
        let previous = std::mem::replace(&mut self.filters, next);
        let rejects_changed = previous.band_rejects != self.filters.band_rejects;

        let mut stale: Vec<usize> = Vec::new();
        for (i, channel) in self.channels.iter_mut().enumerate() {
            if matches!(channel.state, ChannelState::Missing | ChannelState::Unmapped) {
                continue;
            }
            let affected = rejects_changed
                || (channel.overrides.highpass.is_none()
                    && previous.highpass != self.filters.highpass)
                || (channel.overrides.lowpass.is_none()
                    && previous.lowpass != self.filters.lowpass)
                || (channel.overrides.notch.is_none() && previous.notch != self.filters.notch);
            if affected {
                channel.state = ChannelState::Stale;
                stale.push(i);
            }
        }

        if let Some(cache) = &self.cache {
            cache.invalidate_output(&stale);
        }
        self.bus
            .emit("filters", PropertyValue::None, PropertyValue::Bool(true));
    }

    /// Override one filter for one channel; only that channel's output is invalidated.
    pub fn set_channel_filter(
        &mut self,
        channel: usize,
        kind: FilterKind,
        value: Option<f64>,
    ) -> Result<()> {
        let target = self
            .channels
            .get_mut(channel)
            .ok_or_else(|| Error::State(format!("no montage channel {channel}")))?;
        match kind {
            FilterKind::Highpass => target.overrides.highpass = value,
            FilterKind::Lowpass => target.overrides.lowpass = value,
            FilterKind::Notch => target.overrides.notch = value,
        }
        if !matches!(target.state, ChannelState::Missing | ChannelState::Unmapped) {
            target.state = ChannelState::Stale;
        }
        if let Some(cache) = &self.cache {
            cache.invalidate_output(&[channel]);
        }
        self.bus
            .emit("filters", PropertyValue::None, PropertyValue::Bool(true));
        Ok(())
    }

    pub fn filters(&self) -> &FilterSettings {
        &self.filters
    }

    /// Adopt an updated interruption map from the recording.
    pub fn set_interruptions(&mut self, interruptions: InterruptionMap) {
        self.interruptions = interruptions;
    }

    /// The interruptions as this montage sees them; `use_cache_time` keeps starts on the data
    /// clock, otherwise they are translated to recording time.
    pub fn get_interruptions(&self, use_cache_time: bool) -> Vec<Interruption> {
        self.interruptions
            .in_range(0.0, self.data_duration, use_cache_time)
    }

    /// Vertical offsets for this montage's channels under the given spacing knobs.
    pub fn channel_offsets(&self, y_padding: f64, group_spacing: f64) -> Vec<ChannelOffset> {
        let layout = LayoutConfig {
            y_padding,
            group_spacing,
            groups: self.config.groups.clone(),
        };
        channel_offsets(&layout, self.channels.len())
    }
}

/// The samples of source `idx` covering `[lo, lo + n/rate]`, cut out of a raw read.
fn source_slice(raw: &[Option<CachedSignal>], idx: usize, lo: f64, n: usize) -> &[f32] {
    let signal = raw[idx].as_ref().expect("availability checked by the caller");
    let skip = sample_count(lo - signal.start, signal.sampling_rate).min(signal.data.len());
    let end = (skip + n).min(signal.data.len());
    &signal.data[skip..end]
}

/// Per-channel override resolution: `None` inherits, zero disables, positive overrides.
fn resolve_filter(channel_override: Option<f64>, default: Option<f64>) -> Option<f64> {
    match channel_override {
        None => default.filter(|hz| *hz > 0.0),
        Some(hz) if hz > 0.0 => Some(hz),
        Some(_) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::Arc;

    use signal_synchronization::{SharedBuffer, WordRange};

    use crate::cache::required_words;
    use crate::montage::config::ChannelTemplate;

    /// Build a raw cache already filled with the given constant signals.
    fn constant_raw(
        values: &[f32],
        rate: f64,
        duration: f64,
    ) -> (Vec<SourceChannel>, OutputCache) {
        let rates = vec![rate; values.len()];
        let words = required_words(&rates, duration);
        let buffer = Arc::new(SharedBuffer::new(words));
        let input =
            InputCache::new(buffer.clone(), signal_synchronization::CacheToken::input(
                WordRange::new(0, words),
                1,
            ))
            .unwrap();
        input.init_signal_buffers(&rates, duration).unwrap();

        let n = sample_count(duration, rate);
        let part = SignalCachePart::new(
            0.0,
            duration,
            values
                .iter()
                .map(|v| PartSignal::new(vec![*v; n], rate))
                .collect(),
        );
        input.insert_signals(&part).unwrap();

        let channels = (0..values.len())
            .map(|i| SourceChannel::new(format!("ch{i}"), "eeg", rate))
            .collect();
        (channels, OutputCache::new(buffer, input.output_token()))
    }

    fn referential_montage() -> MontageConfig {
        MontageConfig::new(
            "test",
            vec![ChannelTemplate::referential("ch0-ch1", "ch0", "ch1")],
        )
    }

    /// Constant 10 referenced against constant 2 yields constant 8 over the full second.
    #[test]
    fn referential_derivation() {
        let (setup, raw) = constant_raw(&[10.0, 2.0], 250.0, 4.0);
        let mut processor = MontageProcessor::new(
            referential_montage(),
            setup,
            4.0,
            InterruptionMap::new(),
            Box::new(raw),
        );
        assert!(processor.map_channels().is_empty());

        let got = processor.get_all_signals(0.0, 1.0).unwrap();
        assert_eq!(got.part.start, 0.0);
        assert_eq!(got.part.end, 1.0);
        let signal = &got.part.signals[0];
        assert_eq!(signal.data.len(), 250);
        assert!(signal.data.iter().all(|s| (*s - 8.0).abs() < 1e-5));
        assert!(got.interruptions.is_empty());
    }

    #[test]
    fn weighted_mix_normalizes() {
        let (setup, raw) = constant_raw(&[6.0, 12.0, 0.0], 100.0, 2.0);
        let config = MontageConfig::new(
            "weighted",
            vec![ChannelTemplate {
                label: "mix".into(),
                active: TemplateRef::Weighted(vec![("ch0".into(), 1.0), ("ch1".into(), 2.0)]),
                reference: TemplateRef::single("ch2"),
                averaged: false,
                overrides: Default::default(),
            }],
        );
        let mut processor =
            MontageProcessor::new(config, setup, 2.0, InterruptionMap::new(), Box::new(raw));
        processor.map_channels();

        let got = processor.get_all_signals(0.0, 1.0).unwrap();
        // (1*6 + 2*12) / 3 = 10.
        assert!(got.part.signals[0].data.iter().all(|s| (*s - 10.0).abs() < 1e-5));
    }

    #[test]
    fn common_average_excludes_the_active_channel() {
        let (setup, raw) = constant_raw(&[10.0, 4.0, 8.0], 100.0, 2.0);
        let config = MontageConfig::new(
            "avg",
            vec![ChannelTemplate {
                label: "ch0-avg".into(),
                active: TemplateRef::single("ch0"),
                reference: TemplateRef::CommonAverage,
                averaged: true,
                overrides: Default::default(),
            }],
        );
        let mut processor =
            MontageProcessor::new(config, setup, 2.0, InterruptionMap::new(), Box::new(raw));
        processor.map_channels();

        let got = processor.get_all_signals(0.0, 2.0).unwrap();
        // Average of ch1 and ch2 is 6; 10 - 6 = 4.
        assert!(got.part.signals[0].data.iter().all(|s| (*s - 4.0).abs() < 1e-5));
    }

    #[test]
    fn unresolved_template_goes_missing_and_blank() {
        let (setup, raw) = constant_raw(&[1.0], 10.0, 1.0);
        let config = MontageConfig::new(
            "broken",
            vec![
                ChannelTemplate::unreferenced("ok", "ch0"),
                ChannelTemplate::referential("gone", "nope", "ch0"),
            ],
        );
        let mut processor =
            MontageProcessor::new(config, setup, 1.0, InterruptionMap::new(), Box::new(raw));
        let warnings = processor.map_channels();
        assert_eq!(warnings.len(), 1);
        assert_eq!(processor.channels()[1].state(), ChannelState::Missing);

        let got = processor.get_all_signals(0.0, 1.0).unwrap();
        assert!(got.part.signals[1].data.iter().all(|s| *s == 0.0));
        // The missing channel still went nowhere: states differ.
        assert!(matches!(
            processor.channels()[0].state(),
            ChannelState::Cached { .. }
        ));
        assert_eq!(processor.channels()[1].state(), ChannelState::Missing);
    }

    /// The S6 shape end to end: 10 s of data, a 2 s gap at data time 4, recording request
    /// [3, 8] comes back as 3 s of concatenated data plus the gap for rendering.
    #[test]
    fn interrupted_range_concatenates_segments() {
        let (setup, raw) = constant_raw(&[5.0, 1.0], 50.0, 10.0);
        let interruptions = InterruptionMap::from_items([Interruption::new(4.0, 2.0)]);
        let mut processor = MontageProcessor::new(
            referential_montage(),
            setup,
            10.0,
            interruptions,
            Box::new(raw),
        );
        processor.map_channels();

        let got = processor.get_all_signals(3.0, 8.0).unwrap();
        assert_eq!(got.part.start, 3.0);
        assert_eq!(got.part.end, 6.0);
        assert_eq!(got.part.signals[0].data.len(), 150);
        assert!(got.part.signals[0].data.iter().all(|s| (*s - 4.0).abs() < 1e-5));
        assert_eq!(got.interruptions, vec![Interruption::new(4.0, 2.0)]);
    }

    #[test]
    fn polarity_and_scale_apply() {
        let (mut setup, raw) = constant_raw(&[3.0], 100.0, 1.0);
        setup[0].polarity = -1;
        setup[0].scale = 1;
        let config = MontageConfig::new("pol", vec![ChannelTemplate::unreferenced("c", "ch0")]);
        let mut processor =
            MontageProcessor::new(config, setup, 1.0, InterruptionMap::new(), Box::new(raw));
        processor.map_channels();

        let got = processor.get_all_signals(0.0, 1.0).unwrap();
        assert!(got.part.signals[0].data.iter().all(|s| (*s + 30.0).abs() < 1e-4));
    }

    #[test]
    fn filter_changes_restale_only_inheriting_channels() {
        let (setup, raw) = constant_raw(&[1.0, 2.0, 3.0], 100.0, 2.0);
        let config = MontageConfig::new(
            "filters",
            vec![
                ChannelTemplate::unreferenced("inherits", "ch0"),
                ChannelTemplate {
                    label: "overridden".into(),
                    active: TemplateRef::single("ch1"),
                    reference: TemplateRef::None,
                    averaged: false,
                    overrides: config::FilterOverrides {
                        lowpass: Some(30.0),
                        ..Default::default()
                    },
                },
            ],
        );
        let mut processor =
            MontageProcessor::new(config, setup, 2.0, InterruptionMap::new(), Box::new(raw));
        processor.map_channels();
        processor.get_all_signals(0.0, 1.0).unwrap();

        processor.set_filters(FilterSettings {
            lowpass: Some(40.0),
            ..Default::default()
        });
        assert_eq!(processor.channels()[0].state(), ChannelState::Stale);
        assert!(matches!(
            processor.channels()[1].state(),
            ChannelState::Cached { .. }
        ));

        // A per-channel override invalidates only its channel.
        processor.get_all_signals(0.0, 1.0).unwrap();
        processor
            .set_channel_filter(1, FilterKind::Lowpass, Some(20.0))
            .unwrap();
        assert!(matches!(
            processor.channels()[0].state(),
            ChannelState::Cached { .. }
        ));
        assert_eq!(processor.channels()[1].state(), ChannelState::Stale);
    }

    #[test]
    fn downsampled_output_reports_original_rate() {
        let (setup, raw) = constant_raw(&[1.0], 1000.0, 2.0);
        let mut config = MontageConfig::new("ds", vec![ChannelTemplate::unreferenced("c", "ch0")]);
        config.downsample_limit = Some(100.0);
        let mut processor =
            MontageProcessor::new(config, setup, 2.0, InterruptionMap::new(), Box::new(raw));
        processor.map_channels();

        let got = processor.get_all_signals(0.0, 2.0).unwrap();
        let signal = &got.part.signals[0];
        assert_eq!(signal.sampling_rate, 100.0);
        assert_eq!(signal.original_sampling_rate, Some(1000.0));
        assert_eq!(signal.data.len(), 200);
    }

    #[test]
    fn requests_before_mapping_are_state_errors() {
        let (setup, raw) = constant_raw(&[1.0], 10.0, 1.0);
        let mut processor = MontageProcessor::new(
            referential_montage(),
            setup,
            1.0,
            InterruptionMap::new(),
            Box::new(raw),
        );
        assert!(matches!(
            processor.get_all_signals(0.0, 1.0),
            Err(Error::State(_))
        ));
    }
}
