//! The recording resource: one source of multi-channel time-series data.
//!
//! A recording aggregates the decoded setup (channels, durations, interruptions, annotations),
//! a lifecycle state machine, and an arena of montages keyed by id.  Montages never hold a
//! reference back to the recording; anything they need (setup channels, durations, the
//! interruption map) is handed over when their processor is lazily created.

pub mod annotation;
pub mod channel;
pub mod interruption;
pub mod layout;

use ahash::{HashMap, HashMapExt};

use crate::error::{Error, Result};
use crate::events::{PropertyBus, PropertyValue};
use crate::montage::config::MontageConfig;
use crate::montage::MontageProcessor;
use crate::reader::decoder::SourceHeader;
use crate::recording::annotation::Annotation;
use crate::recording::channel::SourceChannel;
use crate::recording::interruption::{Interruption, InterruptionMap};
use crate::unique_id::UniqueId;

/// Resource lifecycle.  `Error` is sticky: the only way out is an explicit [Recording::reset].
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ResourceState {
    Added,
    Loading,
    Loaded,
    Ready,
    Error,
}

impl ResourceState {
    fn as_str(&self) -> &'static str {
        match self {
            ResourceState::Added => "added",
            ResourceState::Loading => "loading",
            ResourceState::Loaded => "loaded",
            ResourceState::Ready => "ready",
            ResourceState::Error => "error",
        }
    }
}

struct MontageSlot {
    config: MontageConfig,
    /// Created lazily on first activation.
    processor: Option<MontageProcessor>,
}

pub struct Recording {
    id: UniqueId,
    name: String,
    start_time: Option<i64>,
    data_duration: f64,
    channels: Vec<SourceChannel>,
    interruptions: InterruptionMap,
    annotations: Vec<Annotation>,
    state: ResourceState,
    error_reason: String,
    montages: HashMap<UniqueId, MontageSlot>,
    active_montage: Option<UniqueId>,
    bus: PropertyBus,
}

impl Recording {
    pub fn new(name: impl Into<String>) -> Recording {
        Recording {
            id: UniqueId::new(),
            name: name.into(),
            start_time: None,
            data_duration: 0.0,
            channels: Vec::new(),
            interruptions: InterruptionMap::new(),
            annotations: Vec::new(),
            state: ResourceState::Added,
            error_reason: String::new(),
            montages: HashMap::new(),
            active_montage: None,
            bus: PropertyBus::new(),
        }
    }

    pub fn id(&self) -> UniqueId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> ResourceState {
        self.state
    }

    pub fn error_reason(&self) -> &str {
        &self.error_reason
    }

    pub fn bus_mut(&mut self) -> &mut PropertyBus {
        &mut self.bus
    }

    pub fn channels(&self) -> &[SourceChannel] {
        &self.channels
    }

    /// Channels that take part in the visual layout.
    pub fn visible_channels(&self) -> impl Iterator<Item = &SourceChannel> {
        self.channels.iter().filter(|c| !c.is_meta())
    }

    /// Seconds of actual signal.
    pub fn data_duration(&self) -> f64 {
        self.data_duration
    }

    /// Seconds since recording start, interruptions included.
    pub fn total_duration(&self) -> f64 {
        self.data_duration + self.interruptions.total_duration()
    }

    pub fn start_time(&self) -> Option<i64> {
        self.start_time
    }

    pub fn interruptions(&self) -> &InterruptionMap {
        &self.interruptions
    }

    /// Advance the lifecycle.  Everything is reachable except leaving `Error`, which only
    /// [Recording::reset] may do.
    pub fn set_state(&mut self, next: ResourceState) -> Result<()> {
        if self.state == ResourceState::Error && next != ResourceState::Error {
            return Err(Error::State(
                "an errored recording must be reset explicitly".into(),
            ));
        }
        if self.state != next {
            let old = self.state;
            self.state = next;
            self.bus.emit("state", old.as_str(), next.as_str());
        }
        Ok(())
    }

    /// Move to the error state with a human-readable reason.
    pub fn fail(&mut self, reason: impl Into<String>) {
        let reason = reason.into();
        log::error!("recording {}: {reason}", self.name);
        let old = std::mem::replace(&mut self.error_reason, reason);
        let old_state = self.state;
        self.state = ResourceState::Error;
        self.bus.emit("state", old_state.as_str(), "error");
        self.bus
            .emit("error-reason", old, self.error_reason.clone());
    }

    /// The explicit way out of `Error`, back to square one.
    pub fn reset(&mut self) {
        let old_state = self.state;
        self.state = ResourceState::Added;
        self.error_reason.clear();
        if old_state != self.state {
            self.bus.emit("state", old_state.as_str(), "added");
        }
    }

    /// Adopt a decoded source header: channels, durations, start time.
    pub fn apply_header(&mut self, header: &SourceHeader) -> Result<()> {
        self.channels = header.channels.clone();
        self.data_duration = header.data_duration();
        self.start_time = header.start_time;
        self.set_state(ResourceState::Loaded)
    }

    // --- annotations ---------------------------------------------------------------------

    pub fn annotations(&self) -> &[Annotation] {
        &self.annotations
    }

    pub fn add_annotations(&mut self, annotations: impl IntoIterator<Item = Annotation>) {
        let before = self.annotations.len();
        for a in annotations {
            debug_assert!(!self.annotations.iter().any(|b| b.id == a.id));
            self.annotations.push(a);
        }
        if self.annotations.len() != before {
            self.emit_annotation_count(before);
        }
    }

    /// Remove one annotation by id; annotations are only ever destroyed this way.
    pub fn remove_annotation(&mut self, id: UniqueId) -> bool {
        let before = self.annotations.len();
        self.annotations.retain(|a| a.id != id);
        let removed = self.annotations.len() != before;
        if removed {
            self.emit_annotation_count(before);
        }
        removed
    }

    fn emit_annotation_count(&mut self, before: usize) {
        self.bus.emit(
            "annotations",
            PropertyValue::Int(before as i64),
            PropertyValue::Int(self.annotations.len() as i64),
        );
    }

    /// Annotations intersecting a data-time range.
    pub fn annotations_in(&self, start: f64, end: f64) -> Vec<&Annotation> {
        self.annotations
            .iter()
            .filter(|a| a.overlaps(start, end))
            .collect()
    }

    // --- interruptions -------------------------------------------------------------------

    /// Replace the interruption map, keeping the duration invariant
    /// `total_duration == data_duration + sum(interruptions)` by construction.
    pub fn set_interruptions(
        &mut self,
        items: impl IntoIterator<Item = Interruption>,
    ) -> Result<()> {
        let old_total = self.total_duration();
        self.interruptions.replace(items, self.data_duration)?;
        // Every active processor needs the new map.
        for slot in self.montages.values_mut() {
            if let Some(processor) = slot.processor.as_mut() {
                processor.set_interruptions(self.interruptions.clone());
            }
        }
        self.bus
            .emit("interruptions", old_total, self.total_duration());
        Ok(())
    }

    // --- export --------------------------------------------------------------------------

    /// Export this recording through a format encoder: header first (built from the reader's
    /// decoded header), then annotations, the interruption map and the channel selection.
    ///
    /// With `anonymize` the encoder strips identity fields from the header it writes.
    pub fn export(
        &self,
        encoder: &mut dyn crate::reader::decoder::FormatEncoder,
        header: &SourceHeader,
        include_channels: &[usize],
        anonymize: bool,
    ) -> Result<Vec<u8>> {
        encoder.create_header(header);
        encoder.set_annotations(&self.annotations);
        encoder.set_interruptions(&self.interruptions);
        encoder.set_signals_to_include(include_channels);
        encoder.encode(anonymize)
    }

    // --- montages ------------------------------------------------------------------------

    /// Register a montage recipe; processors are built lazily on activation.
    pub fn add_montage(&mut self, config: MontageConfig) -> UniqueId {
        let id = UniqueId::new();
        self.montages.insert(
            id,
            MontageSlot {
                config,
                processor: None,
            },
        );
        id
    }

    pub fn montage_ids(&self) -> Vec<UniqueId> {
        let mut ids: Vec<UniqueId> = self.montages.keys().copied().collect();
        ids.sort();
        ids
    }

    pub fn montage_config(&self, id: UniqueId) -> Option<&MontageConfig> {
        self.montages.get(&id).map(|s| &s.config)
    }

    pub fn active_montage(&self) -> Option<UniqueId> {
        self.active_montage
    }

    /// Switch the active montage, creating its processor on first use via `build`.
    ///
    /// The factory receives the recipe plus the recording facts a processor needs; wiring to
    /// the raw cache and the memory manager is the caller's business.
    pub fn activate_montage(
        &mut self,
        id: UniqueId,
        build: impl FnOnce(&MontageConfig, &[SourceChannel], f64, InterruptionMap) -> Result<MontageProcessor>,
    ) -> Result<&mut MontageProcessor> {
        let slot = self
            .montages
            .get_mut(&id)
            .ok_or_else(|| Error::State(format!("no montage {id}")))?;

        if slot.processor.is_none() {
            let processor = build(
                &slot.config,
                &self.channels,
                self.data_duration,
                self.interruptions.clone(),
            )?;
            slot.processor = Some(processor);
        }

        let old = self.active_montage.replace(id);
        if old != Some(id) {
            self.bus.emit(
                "active-montage",
                old.map(|o| o.to_string())
                    .map(PropertyValue::Str)
                    .unwrap_or(PropertyValue::None),
                id.to_string(),
            );
        }
        Ok(slot.processor.as_mut().expect("created above"))
    }

    /// The active montage's processor, when one has been activated.
    pub fn active_processor(&mut self) -> Option<&mut MontageProcessor> {
        let id = self.active_montage?;
        self.montages.get_mut(&id)?.processor.as_mut()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::montage::config::ChannelTemplate;
    use crate::montage::RawSignalSupplier;

    struct NullSupplier;

    impl RawSignalSupplier for NullSupplier {
        fn raw_signals(&self, _: f64, _: f64) -> Vec<Option<crate::cache::CachedSignal>> {
            Vec::new()
        }
    }

    fn loaded_recording() -> Recording {
        let mut r = Recording::new("r1");
        r.channels = vec![SourceChannel::new("ch0", "eeg", 100.0)];
        r.data_duration = 10.0;
        r
    }

    #[test]
    fn error_state_is_sticky_until_reset() {
        let mut r = Recording::new("r");
        r.set_state(ResourceState::Loading).unwrap();
        r.fail("header did not decode");
        assert_eq!(r.state(), ResourceState::Error);
        assert_eq!(r.error_reason(), "header did not decode");

        assert!(r.set_state(ResourceState::Ready).is_err());
        r.reset();
        assert_eq!(r.state(), ResourceState::Added);
        assert_eq!(r.error_reason(), "");
        r.set_state(ResourceState::Loading).unwrap();
    }

    #[test]
    fn durations_track_interruptions() {
        let mut r = loaded_recording();
        assert_eq!(r.total_duration(), 10.0);
        r.set_interruptions([Interruption::new(4.0, 2.0)]).unwrap();
        assert_eq!(r.data_duration(), 10.0);
        assert_eq!(r.total_duration(), 12.0);

        // Starts outside the data duration are rejected.
        assert!(r.set_interruptions([Interruption::new(11.0, 1.0)]).is_err());
    }

    #[test]
    fn annotations_are_destroyed_only_by_removal() {
        use crate::recording::annotation::AnnotationClass;

        let mut r = loaded_recording();
        let a = Annotation::new(AnnotationClass::Event, 1.0, 0.0, "spike");
        let id = a.id;
        r.add_annotations([a]);
        assert_eq!(r.annotations().len(), 1);

        assert!(r.remove_annotation(id));
        assert!(!r.remove_annotation(id));
        assert!(r.annotations().is_empty());
    }

    #[test]
    fn export_feeds_the_encoder_in_order() {
        use crate::reader::decoder::FormatEncoder;
        use crate::recording::annotation::AnnotationClass;

        #[derive(Default)]
        struct RecordingEncoder {
            steps: Vec<&'static str>,
            annotations: usize,
            interruptions: usize,
            included: Vec<usize>,
        }

        impl FormatEncoder for RecordingEncoder {
            fn create_header(&mut self, template: &SourceHeader) -> SourceHeader {
                self.steps.push("header");
                template.clone()
            }

            fn set_annotations(&mut self, annotations: &[Annotation]) {
                self.steps.push("annotations");
                self.annotations = annotations.len();
            }

            fn set_interruptions(&mut self, interruptions: &InterruptionMap) {
                self.steps.push("interruptions");
                self.interruptions = interruptions.len();
            }

            fn set_signals_to_include(&mut self, indices: &[usize]) {
                self.steps.push("signals");
                self.included = indices.to_vec();
            }

            fn encode(&mut self, anonymize: bool) -> Result<Vec<u8>> {
                self.steps.push(if anonymize { "encode-anon" } else { "encode" });
                Ok(vec![0xB1, 0x07])
            }
        }

        let mut r = loaded_recording();
        r.add_annotations([Annotation::new(AnnotationClass::Event, 1.0, 0.0, "spike")]);
        r.set_interruptions([Interruption::new(4.0, 2.0)]).unwrap();

        let header = SourceHeader {
            channels: r.channels().to_vec(),
            data_unit_count: 10,
            data_unit_bytes: 400,
            data_unit_duration: 1.0,
            header_bytes: 0,
            samples_per_unit: vec![100],
            start_time: None,
        };

        let mut encoder = RecordingEncoder::default();
        let bytes = r.export(&mut encoder, &header, &[0], true).unwrap();
        assert_eq!(bytes, vec![0xB1, 0x07]);
        assert_eq!(
            encoder.steps,
            vec!["header", "annotations", "interruptions", "signals", "encode-anon"]
        );
        assert_eq!(encoder.annotations, 1);
        assert_eq!(encoder.interruptions, 1);
        assert_eq!(encoder.included, vec![0]);
    }

    #[test]
    fn montage_processors_build_lazily_and_once() {
        let mut r = loaded_recording();
        let id = r.add_montage(MontageConfig::new(
            "m",
            vec![ChannelTemplate::unreferenced("c", "ch0")],
        ));

        let mut builds = 0;
        for _ in 0..2 {
            r.activate_montage(id, |config, channels, duration, interruptions| {
                builds += 1;
                Ok(MontageProcessor::new(
                    config.clone(),
                    channels.to_vec(),
                    duration,
                    interruptions,
                    Box::new(NullSupplier),
                ))
            })
            .unwrap();
        }
        assert_eq!(builds, 1);
        assert_eq!(r.active_montage(), Some(id));
        assert!(r.active_processor().is_some());
    }
}
