//! The interruption map: spans of recording time with no acquired signal.
//!
//! Two clocks run through the engine.  *Data time* counts seconds of actual signal and is what
//! caches and sample indices use; *recording time* counts seconds since recording start,
//! including interruptions, and is what users navigate in.  Each interruption is keyed on the
//! data time at which acquisition paused and carries the recording-time duration of the pause.
//! Entries are kept sorted and disjoint; inserts that touch or overlap an existing entry collapse
//! into it, which makes insertion idempotent and order-independent.

use crate::error::{Error, Result};

#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Interruption {
    /// Data time at which the recording paused.
    pub start: f64,
    /// Recording-time length of the pause.
    pub duration: f64,
}

impl Interruption {
    pub fn new(start: f64, duration: f64) -> Interruption {
        Interruption { start, duration }
    }

    fn end(&self) -> f64 {
        self.start + self.duration
    }
}

/// One continuous run of signal, described on both clocks.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct DataSegment {
    /// Data-time span of the run.
    pub start: f64,
    pub end: f64,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct InterruptionMap {
    /// Sorted by start; pairwise disjoint.
    items: Vec<Interruption>,
}

impl InterruptionMap {
    pub fn new() -> InterruptionMap {
        InterruptionMap::default()
    }

    pub fn from_items(items: impl IntoIterator<Item = Interruption>) -> InterruptionMap {
        let mut map = InterruptionMap::new();
        for i in items {
            map.insert(i);
        }
        map
    }

    pub fn items(&self) -> &[Interruption] {
        &self.items
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Sum of all pause durations; `data_duration + total_duration == recording duration`.
    pub fn total_duration(&self) -> f64 {
        self.items.iter().map(|i| i.duration).sum()
    }

    /// Insert one interruption, collapsing it with any entries it touches or overlaps.
    ///
    /// Zero- and negative-duration entries are ignored.
    pub fn insert(&mut self, item: Interruption) {
        if item.duration <= 0.0 {
            return;
        }

        let mut merged = item;
        let mut out = Vec::with_capacity(self.items.len() + 1);
        for existing in self.items.drain(..) {
            if existing.end() < merged.start || merged.end() < existing.start {
                out.push(existing);
            } else {
                let start = existing.start.min(merged.start);
                let end = existing.end().max(merged.end());
                merged = Interruption::new(start, end - start);
            }
        }
        out.push(merged);
        out.sort_by(|a, b| a.start.partial_cmp(&b.start).unwrap());
        self.items = out;
    }

    /// Replace the whole map (the `set-interruptions` commission).  Fails if any start is
    /// negative or exceeds `data_duration`.
    pub fn replace(
        &mut self,
        items: impl IntoIterator<Item = Interruption>,
        data_duration: f64,
    ) -> Result<()> {
        let mut next = InterruptionMap::new();
        for i in items {
            if i.start < 0.0 || i.start > data_duration {
                return Err(Error::State(format!(
                    "interruption at {} outside data duration {}",
                    i.start, data_duration
                )));
            }
            next.insert(i);
        }
        *self = next;
        Ok(())
    }

    /// Convert a data-time instant to recording time.
    ///
    /// An interruption starting exactly at `t` precedes the sample recorded at `t`, so its
    /// duration is included.
    pub fn data_to_recording(&self, t: f64) -> f64 {
        let mut offset = 0.0;
        for i in &self.items {
            if i.start <= t {
                offset += i.duration;
            } else {
                break;
            }
        }
        t + offset
    }

    /// Convert a recording-time instant to data time.  Instants inside a pause collapse to the
    /// data time at which the pause began.
    pub fn recording_to_data(&self, t: f64) -> f64 {
        let mut offset = 0.0;
        for i in &self.items {
            let pause_begins = i.start + offset;
            if t < pause_begins {
                break;
            }
            if t < pause_begins + i.duration {
                return i.start;
            }
            offset += i.duration;
        }
        t - offset
    }

    /// Interruptions intersecting the data-time range `[start, end]`.
    ///
    /// With `use_cache_time` the returned starts stay on the data clock (how caches address
    /// signal); otherwise starts are translated to recording time for presentation.
    pub fn in_range(&self, start: f64, end: f64, use_cache_time: bool) -> Vec<Interruption> {
        let mut offset = 0.0;
        let mut out = Vec::new();
        for i in &self.items {
            if i.start >= start && i.start <= end {
                let translated_start = if use_cache_time {
                    i.start
                } else {
                    i.start + offset
                };
                out.push(Interruption::new(translated_start, i.duration));
            }
            offset += i.duration;
        }
        out
    }

    /// Split a recording-time range into the continuous data-time runs it covers.
    ///
    /// Each returned segment lies strictly between interruptions; empty segments are dropped.
    pub fn segments(&self, recording_start: f64, recording_end: f64) -> Vec<DataSegment> {
        let mut out = Vec::new();
        let mut run_start_data = 0.0;
        let mut offset = 0.0;

        let mut push_run = |run_data: (f64, f64), run_offset: f64, out: &mut Vec<DataSegment>| {
            // Intersect the run (on the recording clock) with the request.
            let rec_lo = (run_data.0 + run_offset).max(recording_start);
            let rec_hi = (run_data.1 + run_offset).min(recording_end);
            if rec_lo < rec_hi {
                out.push(DataSegment {
                    start: rec_lo - run_offset,
                    end: rec_hi - run_offset,
                });
            }
        };

        for i in &self.items {
            push_run((run_start_data, i.start), offset, &mut out);
            run_start_data = i.start;
            offset += i.duration;
        }
        push_run((run_start_data, f64::INFINITY), offset, &mut out);
        out
    }

    /// The data-time bounds of the continuous run containing data-time `t`.  Filter padding must
    /// not reach across these.
    pub fn run_bounds(&self, t: f64, data_duration: f64) -> (f64, f64) {
        let mut lo = 0.0;
        let mut hi = data_duration;
        for i in &self.items {
            if i.start <= t {
                lo = i.start;
            } else {
                hi = i.start;
                break;
            }
        }
        (lo, hi)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use proptest::prelude::*;

    #[test]
    fn overlapping_inserts_collapse() {
        let mut map = InterruptionMap::new();
        map.insert(Interruption::new(2.0, 2.0));
        map.insert(Interruption::new(3.0, 3.0));
        assert_eq!(map.items(), &[Interruption::new(2.0, 4.0)]);
    }

    #[test]
    fn touching_inserts_collapse() {
        let mut map = InterruptionMap::new();
        map.insert(Interruption::new(2.0, 2.0));
        map.insert(Interruption::new(4.0, 1.0));
        assert_eq!(map.items(), &[Interruption::new(2.0, 3.0)]);
    }

    #[test]
    fn clock_conversion_round_trips_outside_pauses() {
        let map = InterruptionMap::from_items([Interruption::new(4.0, 2.0)]);
        assert_eq!(map.data_to_recording(3.0), 3.0);
        assert_eq!(map.data_to_recording(4.0), 6.0);
        assert_eq!(map.data_to_recording(6.0), 8.0);
        assert_eq!(map.recording_to_data(3.0), 3.0);
        assert_eq!(map.recording_to_data(8.0), 6.0);
        // Inside the pause collapses to the pause point.
        assert_eq!(map.recording_to_data(5.0), 4.0);
    }

    /// The S6 shape: 10 s of data, a 2 s pause at data time 4, recording range [3, 8].
    #[test]
    fn segments_split_on_interruptions() {
        let map = InterruptionMap::from_items([Interruption::new(4.0, 2.0)]);
        let segs = map.segments(3.0, 8.0);
        assert_eq!(
            segs,
            vec![
                DataSegment { start: 3.0, end: 4.0 },
                DataSegment { start: 4.0, end: 6.0 },
            ]
        );
    }

    #[test]
    fn in_range_translates_to_recording_time() {
        let map =
            InterruptionMap::from_items([Interruption::new(4.0, 2.0), Interruption::new(8.0, 1.0)]);
        assert_eq!(
            map.in_range(0.0, 10.0, true),
            vec![Interruption::new(4.0, 2.0), Interruption::new(8.0, 1.0)]
        );
        assert_eq!(
            map.in_range(0.0, 10.0, false),
            vec![Interruption::new(4.0, 2.0), Interruption::new(10.0, 1.0)]
        );
    }

    #[test]
    fn run_bounds_clamp_padding() {
        let map = InterruptionMap::from_items([Interruption::new(4.0, 2.0)]);
        assert_eq!(map.run_bounds(2.0, 10.0), (0.0, 4.0));
        assert_eq!(map.run_bounds(5.0, 10.0), (4.0, 10.0));
    }

    fn arb_interruption() -> impl Strategy<Value = Interruption> {
        (0u32..100, 1u32..50)
            .prop_map(|(s, d)| Interruption::new(s as f64 * 0.5, d as f64 * 0.25))
    }

    proptest! {
        /// merge(merge(M, X), Y) == merge(merge(M, Y), X), and re-inserting is a no-op.
        #[test]
        fn merge_is_order_independent_and_idempotent(
            base in proptest::collection::vec(arb_interruption(), 0..6),
            x in arb_interruption(),
            y in arb_interruption(),
        ) {
            let mut a = InterruptionMap::from_items(base.clone());
            let mut b = InterruptionMap::from_items(base);
            a.insert(x);
            a.insert(y);
            b.insert(y);
            b.insert(x);
            prop_assert_eq!(a.clone(), b.clone());

            a.insert(x);
            prop_assert_eq!(&a.items()[..], b.items());
        }

        #[test]
        fn items_stay_sorted_and_disjoint(
            items in proptest::collection::vec(arb_interruption(), 0..10),
        ) {
            let map = InterruptionMap::from_items(items);
            for w in map.items().windows(2) {
                prop_assert!(w[0].start + w[0].duration < w[1].start);
            }
        }
    }
}
