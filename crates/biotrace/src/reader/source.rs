//! Byte sources a reader can pull from.
//!
//! A [SignalSource] is anything with a length and positioned reads: a local file, an in-memory
//! blob in tests, or a remote transport implemented outside the engine.  Sources may return
//! short reads; [read_exact_retrying] turns those and transient errors into a bounded retry with
//! exponential backoff before surfacing a source error carrying the offending byte range.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;

use crate::config::{CHUNK_READ_ATTEMPTS, CHUNK_RETRY_BASE_DELAY};
use crate::error::{Error, Result};

pub trait SignalSource: Send {
    /// Total size in bytes.
    fn len(&self) -> u64;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Read up to `out.len()` bytes at `offset`.  Short reads are allowed; the caller retries.
    fn read_at(&mut self, offset: u64, out: &mut [u8]) -> Result<usize>;
}

/// A local file.
pub struct FileSource {
    file: File,
    len: u64,
}

impl FileSource {
    pub fn open(path: impl AsRef<Path>) -> Result<FileSource> {
        let file = File::open(&path).map_err(|e| Error::source_io(e, 0, 0))?;
        let len = file
            .metadata()
            .map_err(|e| Error::source_io(e, 0, 0))?
            .len();
        Ok(FileSource { file, len })
    }
}

impl SignalSource for FileSource {
    fn len(&self) -> u64 {
        self.len
    }

    fn read_at(&mut self, offset: u64, out: &mut [u8]) -> Result<usize> {
        self.file
            .seek(SeekFrom::Start(offset))
            .map_err(|e| Error::source_io(e, offset, offset + out.len() as u64))?;
        self.file
            .read(out)
            .map_err(|e| Error::source_io(e, offset, offset + out.len() as u64))
    }
}

/// An in-memory source; the test double and the direct-load fast path.
pub struct MemorySource {
    bytes: Vec<u8>,
}

impl MemorySource {
    pub fn new(bytes: Vec<u8>) -> MemorySource {
        MemorySource { bytes }
    }
}

impl SignalSource for MemorySource {
    fn len(&self) -> u64 {
        self.bytes.len() as u64
    }

    fn read_at(&mut self, offset: u64, out: &mut [u8]) -> Result<usize> {
        let offset = offset as usize;
        if offset >= self.bytes.len() {
            return Ok(0);
        }
        let n = out.len().min(self.bytes.len() - offset);
        out[..n].copy_from_slice(&self.bytes[offset..offset + n]);
        Ok(n)
    }
}

/// Fill `out` from `source` at `offset`, retrying short reads and transient failures.
///
/// Attempts are capped; between attempts the delay doubles.  A read that still comes up short
/// after the last attempt is reported as a source error over the full requested range.
pub fn read_exact_retrying(
    source: &mut dyn SignalSource,
    offset: u64,
    out: &mut [u8],
) -> Result<()> {
    let end = offset + out.len() as u64;
    let mut last_message = String::from("short read");

    for attempt in 0..CHUNK_READ_ATTEMPTS {
        if attempt > 0 {
            std::thread::sleep(CHUNK_RETRY_BASE_DELAY * (1 << (attempt - 1)));
        }

        let mut done = 0usize;
        let mut stalled = false;
        while done < out.len() {
            match source.read_at(offset + done as u64, &mut out[done..]) {
                Ok(0) => {
                    stalled = true;
                    break;
                }
                Ok(n) => done += n,
                Err(e) => {
                    last_message = e.to_string();
                    stalled = true;
                    break;
                }
            }
        }
        if !stalled && done == out.len() {
            return Ok(());
        }
        log::debug!(
            "read attempt {} of bytes {offset}..{end} failed, retrying",
            attempt + 1
        );
    }

    Err(Error::Source {
        message: last_message,
        start: offset,
        end,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_source_reads_and_clips() {
        let mut src = MemorySource::new(vec![1, 2, 3, 4, 5]);
        let mut buf = [0u8; 3];
        assert_eq!(src.read_at(3, &mut buf).unwrap(), 2);
        assert_eq!(&buf[..2], &[4, 5]);
        assert_eq!(src.read_at(9, &mut buf).unwrap(), 0);
    }

    /// A source that needs several calls to produce everything.
    struct TrickleSource {
        inner: MemorySource,
    }

    impl SignalSource for TrickleSource {
        fn len(&self) -> u64 {
            self.inner.len()
        }

        fn read_at(&mut self, offset: u64, out: &mut [u8]) -> Result<usize> {
            let n = out.len().min(2);
            self.inner.read_at(offset, &mut out[..n])
        }
    }

    #[test]
    fn retrying_read_assembles_trickled_bytes() {
        let mut src = TrickleSource {
            inner: MemorySource::new((0..32).collect()),
        };
        let mut out = [0u8; 10];
        read_exact_retrying(&mut src, 4, &mut out).unwrap();
        assert_eq!(out, [4, 5, 6, 7, 8, 9, 10, 11, 12, 13]);
    }

    #[test]
    fn exhausted_source_surfaces_the_byte_range() {
        let mut src = MemorySource::new(vec![0u8; 4]);
        let mut out = [0u8; 8];
        let err = read_exact_retrying(&mut src, 0, &mut out).unwrap_err();
        match err {
            Error::Source { start, end, .. } => {
                assert_eq!((start, end), (0, 8));
            }
            other => panic!("expected a source error, got {other:?}"),
        }
    }
}
