//! The shared word buffer backing every signal cache.
//!
//! The buffer is a fixed-size slice of 32-bit atomic words.  All cache layouts (lock words, meta
//! fields, sample data) are expressed in whole words so that every field can be read and written
//! atomically without tearing.  Plain loads and stores here are `Relaxed`; cross-thread ordering
//! of multi-word regions is established by the lock word of the owning cache, never by the data
//! words themselves.

use std::sync::atomic::{AtomicU32, Ordering};

/// A half-open range of words inside a [SharedBuffer].
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct WordRange {
    pub start: usize,
    pub end: usize,
}

impl WordRange {
    pub fn new(start: usize, end: usize) -> WordRange {
        assert!(start <= end, "WordRange start must not exceed end");
        WordRange { start, end }
    }

    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    /// Byte length of this range (4 bytes per word).
    pub fn byte_len(&self) -> usize {
        self.len() * 4
    }

    pub fn contains(&self, other: &WordRange) -> bool {
        self.start <= other.start && other.end <= self.end
    }

    pub fn overlaps(&self, other: &WordRange) -> bool {
        self.start < other.end && other.start < self.end
    }

    /// The same range moved so that it begins at `new_start`.
    pub fn moved_to(&self, new_start: usize) -> WordRange {
        WordRange::new(new_start, new_start + self.len())
    }
}

/// The process-wide master buffer.
///
/// One of these is created by the memory manager and shared (via `Arc`) with every worker that
/// holds a cache view.  The buffer itself has no notion of ownership; range bookkeeping is the
/// manager's job.
pub struct SharedBuffer {
    words: Box<[AtomicU32]>,
}

impl SharedBuffer {
    /// Create a zeroed buffer of `words` 32-bit words.
    pub fn new(words: usize) -> SharedBuffer {
        let mut v = Vec::with_capacity(words);
        v.resize_with(words, || AtomicU32::new(0));
        SharedBuffer {
            words: v.into_boxed_slice(),
        }
    }

    pub fn len(&self) -> usize {
        self.words.len()
    }

    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }

    /// Total capacity in bytes.
    pub fn byte_len(&self) -> usize {
        self.len() * 4
    }

    /// Direct access to a word, for lock embedding.
    pub fn word(&self, index: usize) -> &AtomicU32 {
        &self.words[index]
    }

    pub fn load(&self, index: usize) -> u32 {
        self.words[index].load(Ordering::Relaxed)
    }

    pub fn store(&self, index: usize, value: u32) {
        self.words[index].store(value, Ordering::Relaxed);
    }

    pub fn load_f32(&self, index: usize) -> f32 {
        f32::from_bits(self.load(index))
    }

    pub fn store_f32(&self, index: usize, value: f32) {
        self.store(index, value.to_bits());
    }

    /// Copy a slice of f32 samples into the buffer starting at `index`.
    pub fn store_f32_slice(&self, index: usize, samples: &[f32]) {
        let as_words: &[u32] = bytemuck::cast_slice(samples);
        for (offset, word) in as_words.iter().enumerate() {
            self.store(index + offset, *word);
        }
    }

    /// Read `out.len()` f32 samples starting at `index`.
    pub fn load_f32_slice(&self, index: usize, out: &mut [f32]) {
        for (offset, sample) in out.iter_mut().enumerate() {
            *sample = self.load_f32(index + offset);
        }
    }

    /// Zero every word in `range`.
    pub fn fill_zero(&self, range: WordRange) {
        for i in range.start..range.end {
            self.store(i, 0);
        }
    }

    /// Move `src` so that it starts at `dst_start`.  Ranges may overlap; the copy direction is
    /// chosen so data is never clobbered before it is read.  The caller must hold whatever lock
    /// covers both ranges.
    pub fn copy_words(&self, src: WordRange, dst_start: usize) {
        if src.start == dst_start || src.is_empty() {
            return;
        }
        assert!(
            dst_start + src.len() <= self.len(),
            "copy_words destination out of bounds"
        );
        if dst_start < src.start {
            for i in 0..src.len() {
                self.store(dst_start + i, self.load(src.start + i));
            }
        } else {
            for i in (0..src.len()).rev() {
                self.store(dst_start + i, self.load(src.start + i));
            }
        }
    }
}

impl std::fmt::Debug for SharedBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedBuffer")
            .field("words", &self.len())
            .finish()
    }
}
