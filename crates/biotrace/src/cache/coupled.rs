//! The coupled cache: one writer, many readers, one shared buffer range.
//!
//! Layout inside an owner's allocated range, all in 32-bit words:
//!
//! ```text
//! [ lock | signal count | meta(0) .. meta(n-1) | data(0) .. data(n-1) ]
//! ```
//!
//! Each signal's meta block is four words: allocated samples, valid start sample, valid end
//! sample, sampling rate (f32 bits).  Data blocks are `allocated` f32 slots each.  The writer
//! side ([InputCache]) initializes the layout and advances validity; reader sides
//! ([OutputCache]) are built from a token, possibly in another worker, and only ever take the
//! read half of the lock.  `valid_start == valid_end` means "nothing valid"; the writer fills
//! contiguously outward, so the window never contains holes in practice.

use std::sync::Arc;

use signal_synchronization::{CacheToken, CoupledLock, SharedBuffer, WordRange};

use crate::cache::part::{sample_count, PartSignal, SignalCachePart};
use crate::error::{Error, Result};

const COUNT_WORD: usize = 1;
const META_START: usize = 2;
const META_WORDS: usize = 4;

const META_ALLOCATED: usize = 0;
const META_VALID_START: usize = 1;
const META_VALID_END: usize = 2;
const META_RATE: usize = 3;

/// Words needed for a cache over signals at `rates` covering `data_duration` seconds.
pub fn required_words(rates: &[f64], data_duration: f64) -> usize {
    let samples: usize = rates
        .iter()
        .map(|r| (data_duration * r).ceil() as usize)
        .sum();
    META_START + rates.len() * META_WORDS + samples
}

/// Bytes needed for the same cache; what gets requested from the memory manager.
pub fn required_bytes(rates: &[f64], data_duration: f64) -> usize {
    required_words(rates, data_duration) * 4
}

/// One signal read back from a cache, restricted to the valid window.
#[derive(Clone, Debug, PartialEq)]
pub struct CachedSignal {
    pub data: Vec<f32>,
    pub sampling_rate: f64,
    /// Data-time bounds actually returned (the intersection of the request with validity).
    pub start: f64,
    pub end: f64,
}

/// Shared plumbing of both cache halves.
#[derive(Clone)]
struct CacheView {
    buffer: Arc<SharedBuffer>,
    token: CacheToken,
    lock: CoupledLock,
}

impl CacheView {
    fn new(buffer: Arc<SharedBuffer>, token: CacheToken) -> CacheView {
        let lock = CoupledLock::new(buffer.clone(), token.range.start);
        CacheView {
            buffer,
            token,
            lock,
        }
    }

    fn abs(&self, word: usize) -> usize {
        self.token.range.start + word
    }

    fn signal_count(&self) -> usize {
        self.buffer.load(self.abs(COUNT_WORD)) as usize
    }

    fn meta_word(&self, signal: usize, field: usize) -> usize {
        self.abs(META_START + signal * META_WORDS + field)
    }

    fn allocated(&self, signal: usize) -> usize {
        self.buffer.load(self.meta_word(signal, META_ALLOCATED)) as usize
    }

    fn valid(&self, signal: usize) -> (usize, usize) {
        (
            self.buffer.load(self.meta_word(signal, META_VALID_START)) as usize,
            self.buffer.load(self.meta_word(signal, META_VALID_END)) as usize,
        )
    }

    fn rate(&self, signal: usize) -> f64 {
        self.buffer.load_f32(self.meta_word(signal, META_RATE)) as f64
    }

    /// First data word of `signal`, relative to the buffer.
    fn data_start(&self, signal: usize) -> usize {
        let mut offset = META_START + self.signal_count() * META_WORDS;
        for i in 0..signal {
            offset += self.allocated(i);
        }
        self.abs(offset)
    }

    /// Read every signal over `[start, end]` seconds, each restricted to its valid window.
    /// Signals whose intersection is empty come back as `None`.
    fn read_signals(&self, start: f64, end: f64) -> Vec<Option<CachedSignal>> {
        let _guard = self.lock.lock_read();

        let count = self.signal_count();
        let mut out = Vec::with_capacity(count);
        for i in 0..count {
            let rate = self.rate(i);
            let (valid_start, valid_end) = self.valid(i);
            let want_start = sample_count(start.max(0.0), rate);
            let want_end = sample_count(end.max(0.0), rate);

            let lo = want_start.max(valid_start);
            let hi = want_end.min(valid_end);
            if lo >= hi || valid_start == valid_end {
                out.push(None);
                continue;
            }

            let mut data = vec![0.0f32; hi - lo];
            self.buffer.load_f32_slice(self.data_start(i) + lo, &mut data);
            out.push(Some(CachedSignal {
                data,
                sampling_rate: rate,
                start: lo as f64 / rate,
                end: hi as f64 / rate,
            }));
        }
        out
    }

    /// Snapshot the window valid across *all* signals as a part, for cross-worker messaging.
    fn as_cache_part(&self) -> Option<SignalCachePart> {
        let _guard = self.lock.lock_read();

        let count = self.signal_count();
        if count == 0 {
            return None;
        }

        // The common window is the intersection of per-signal validity, in seconds.
        let mut start = 0.0f64;
        let mut end = f64::INFINITY;
        for i in 0..count {
            let rate = self.rate(i);
            let (vs, ve) = self.valid(i);
            if vs == ve {
                return None;
            }
            start = start.max(vs as f64 / rate);
            end = end.min(ve as f64 / rate);
        }
        if start >= end {
            return None;
        }

        let mut signals = Vec::with_capacity(count);
        for i in 0..count {
            let rate = self.rate(i);
            let lo = sample_count(start, rate);
            let n = sample_count(end - start, rate);
            let mut data = vec![0.0f32; n];
            self.buffer.load_f32_slice(self.data_start(i) + lo, &mut data);
            let mut signal = PartSignal::new(data, rate);
            signal.sample_start = Some(lo as u64);
            signal.sample_end = Some((lo + n) as u64);
            signals.push(signal);
        }
        Some(SignalCachePart::new(start, end, signals))
    }

    fn rebase(&mut self, new_start: usize) {
        self.token = self.token.rebased(new_start);
        self.lock = CoupledLock::new(self.buffer.clone(), self.token.range.start);
    }
}

/// The writer half.  Exactly one of these exists per cache, in the worker that fills it.
pub struct InputCache {
    view: CacheView,
}

impl InputCache {
    pub fn new(buffer: Arc<SharedBuffer>, token: CacheToken) -> Result<InputCache> {
        if !token.grants_write() {
            return Err(Error::State(
                "an output token cannot construct the cache writer".into(),
            ));
        }
        Ok(InputCache {
            view: CacheView::new(buffer, token),
        })
    }

    /// Lay out and zero the meta and data regions for `rates`, sized for `data_duration`
    /// seconds per signal.
    pub fn init_signal_buffers(&self, rates: &[f64], data_duration: f64) -> Result<()> {
        let needed = required_words(rates, data_duration);
        if needed > self.view.token.range.len() {
            return Err(Error::Allocation {
                requested: needed * 4,
                available: self.view.token.range.byte_len(),
            });
        }

        self.view.lock.reset();
        let _guard = self.view.lock.lock_write();

        self.view
            .buffer
            .fill_zero(WordRange::new(self.view.abs(1), self.view.token.range.end));
        self.view
            .buffer
            .store(self.view.abs(COUNT_WORD), rates.len() as u32);
        for (i, rate) in rates.iter().enumerate() {
            let allocated = (data_duration * rate).ceil() as u32;
            self.view
                .buffer
                .store(self.view.meta_word(i, META_ALLOCATED), allocated);
            self.view
                .buffer
                .store_f32(self.view.meta_word(i, META_RATE), *rate as f32);
        }
        Ok(())
    }

    /// Copy a part's samples into the data region and widen each signal's valid window.
    ///
    /// The part's signal list must match the cache layout.  `part.start` addresses the insert
    /// position in data time.
    pub fn insert_signals(&self, part: &SignalCachePart) -> Result<()> {
        let _guard = self.view.lock.lock_write();

        let count = self.view.signal_count();
        if part.signals.len() != count {
            return Err(Error::State(format!(
                "part has {} signals, cache holds {}",
                part.signals.len(),
                count
            )));
        }

        for (i, signal) in part.signals.iter().enumerate() {
            let rate = self.view.rate(i);
            // Meta stores the rate as f32; compare at that precision.
            if (rate - signal.sampling_rate).abs() > f32::EPSILON as f64 * rate.max(1.0) {
                return Err(Error::State(format!(
                    "signal {i} rate {} does not match cache rate {rate}",
                    signal.sampling_rate
                )));
            }

            let at = sample_count(part.start, rate);
            let end = at + signal.data.len();
            if end > self.view.allocated(i) {
                return Err(Error::State(format!(
                    "insert of samples {at}..{end} exceeds allocation {}",
                    self.view.allocated(i)
                )));
            }

            self.view
                .buffer
                .store_f32_slice(self.view.data_start(i) + at, &signal.data);

            let (vs, ve) = self.view.valid(i);
            let (new_start, new_end) = if vs == ve {
                (at, end)
            } else {
                (vs.min(at), ve.max(end))
            };
            self.view
                .buffer
                .store(self.view.meta_word(i, META_VALID_START), new_start as u32);
            self.view
                .buffer
                .store(self.view.meta_word(i, META_VALID_END), new_end as u32);
        }
        Ok(())
    }

    /// Collapse the valid window of the listed signals; reads return `None` for them until new
    /// samples arrive.  Used when a filter change voids derived output.
    pub fn invalidate_output(&self, channels: &[usize]) {
        let _guard = self.view.lock.lock_write();
        for &i in channels {
            if i >= self.view.signal_count() {
                continue;
            }
            self.view
                .buffer
                .store(self.view.meta_word(i, META_VALID_START), 0);
            self.view
                .buffer
                .store(self.view.meta_word(i, META_VALID_END), 0);
        }
    }

    pub fn read_signals(&self, start: f64, end: f64) -> Vec<Option<CachedSignal>> {
        self.view.read_signals(start, end)
    }

    pub fn as_cache_part(&self) -> Option<SignalCachePart> {
        self.view.as_cache_part()
    }

    /// A token other workers can use to build read views of this cache.
    pub fn output_token(&self) -> CacheToken {
        CacheToken::output(self.view.token.range, self.view.token.owner)
    }

    pub fn token(&self) -> CacheToken {
        self.view.token
    }

    /// Adopt a compacted location.  The memory manager has already moved the words; only the
    /// view needs re-pointing.
    pub fn rebase(&mut self, new_start: usize) {
        self.view.rebase(new_start);
    }
}

/// A reader half, built from an output token, usually in a different worker than the writer.
pub struct OutputCache {
    view: CacheView,
}

impl OutputCache {
    pub fn new(buffer: Arc<SharedBuffer>, token: CacheToken) -> OutputCache {
        OutputCache {
            view: CacheView::new(buffer, token),
        }
    }

    pub fn signal_count(&self) -> usize {
        let _guard = self.view.lock.lock_read();
        self.view.signal_count()
    }

    pub fn sampling_rate(&self, signal: usize) -> f64 {
        let _guard = self.view.lock.lock_read();
        self.view.rate(signal)
    }

    pub fn read_signals(&self, start: f64, end: f64) -> Vec<Option<CachedSignal>> {
        self.view.read_signals(start, end)
    }

    pub fn as_cache_part(&self) -> Option<SignalCachePart> {
        self.view.as_cache_part()
    }

    pub fn token(&self) -> CacheToken {
        self.view.token
    }

    pub fn rebase(&mut self, new_start: usize) {
        self.view.rebase(new_start);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_cache(rates: &[f64], duration: f64) -> (Arc<SharedBuffer>, InputCache) {
        let words = required_words(rates, duration);
        let buffer = Arc::new(SharedBuffer::new(words));
        let token = CacheToken::input(WordRange::new(0, words), 1);
        let cache = InputCache::new(buffer.clone(), token).unwrap();
        cache.init_signal_buffers(rates, duration).unwrap();
        (buffer, cache)
    }

    fn one_signal_part(start: f64, end: f64, data: Vec<f32>, rate: f64) -> SignalCachePart {
        SignalCachePart::new(start, end, vec![PartSignal::new(data, rate)])
    }

    #[test]
    fn insert_then_read_round_trips() {
        let (_, cache) = make_cache(&[1.0], 10.0);
        cache
            .insert_signals(&one_signal_part(2.0, 5.0, vec![1.0, 2.0, 3.0], 1.0))
            .unwrap();

        let got = cache.read_signals(0.0, 10.0);
        let s = got[0].as_ref().unwrap();
        assert_eq!(s.start, 2.0);
        assert_eq!(s.end, 5.0);
        assert_eq!(s.data, vec![1.0, 2.0, 3.0]);
    }

    #[test]
    fn reads_clip_to_validity() {
        let (_, cache) = make_cache(&[2.0], 10.0);
        cache
            .insert_signals(&one_signal_part(1.0, 3.0, vec![1.0, 2.0, 3.0, 4.0], 2.0))
            .unwrap();

        let got = cache.read_signals(2.0, 8.0);
        let s = got[0].as_ref().unwrap();
        assert_eq!(s.start, 2.0);
        assert_eq!(s.end, 3.0);
        assert_eq!(s.data, vec![3.0, 4.0]);

        // Entirely outside the window.
        assert!(cache.read_signals(5.0, 8.0)[0].is_none());
    }

    #[test]
    fn validity_widens_with_inserts() {
        let (_, cache) = make_cache(&[1.0], 10.0);
        cache
            .insert_signals(&one_signal_part(4.0, 6.0, vec![5.0, 6.0], 1.0))
            .unwrap();
        cache
            .insert_signals(&one_signal_part(2.0, 4.0, vec![3.0, 4.0], 1.0))
            .unwrap();

        let part = cache.as_cache_part().unwrap();
        assert_eq!(part.start, 2.0);
        assert_eq!(part.end, 6.0);
        assert_eq!(part.signals[0].data, vec![3.0, 4.0, 5.0, 6.0]);
    }

    #[test]
    fn invalidate_clears_reads_until_next_write() {
        let (_, cache) = make_cache(&[1.0, 1.0], 10.0);
        let part = SignalCachePart::new(
            0.0,
            3.0,
            vec![
                PartSignal::new(vec![1.0, 2.0, 3.0], 1.0),
                PartSignal::new(vec![4.0, 5.0, 6.0], 1.0),
            ],
        );
        cache.insert_signals(&part).unwrap();

        cache.invalidate_output(&[1]);
        let got = cache.read_signals(0.0, 3.0);
        assert!(got[0].is_some());
        assert!(got[1].is_none());

        cache.insert_signals(&part).unwrap();
        assert!(cache.read_signals(0.0, 3.0)[1].is_some());
    }

    #[test]
    fn reader_in_another_worker_sees_writes() {
        let rates = [10.0];
        let (buffer, cache) = make_cache(&rates, 5.0);
        let reader_token = cache.output_token();

        let writer = std::thread::spawn(move || {
            let data: Vec<f32> = (0..50).map(|i| i as f32).collect();
            cache
                .insert_signals(&one_signal_part(0.0, 5.0, data, 10.0))
                .unwrap();
        });

        writer.join().unwrap();
        let reader = OutputCache::new(buffer, reader_token);
        let part = reader.as_cache_part().unwrap();
        assert_eq!(part.start, 0.0);
        assert_eq!(part.end, 5.0);
        assert_eq!(part.signals[0].data.len(), 50);
        assert_eq!(part.signals[0].data[49], 49.0);
    }

    #[test]
    fn writer_requires_write_capability() {
        let buffer = Arc::new(SharedBuffer::new(64));
        let token = CacheToken::output(WordRange::new(0, 64), 1);
        assert!(InputCache::new(buffer, token).is_err());
    }

    #[test]
    fn insert_rejects_out_of_bounds() {
        let (_, cache) = make_cache(&[1.0], 4.0);
        let err = cache
            .insert_signals(&one_signal_part(2.0, 6.0, vec![1.0, 2.0, 3.0, 4.0], 1.0))
            .unwrap_err();
        assert!(matches!(err, Error::State(_)));
    }
}
