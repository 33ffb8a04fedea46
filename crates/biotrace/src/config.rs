//! Engine-wide tuning constants.
//!
//! Runtime-adjustable knobs live in [crate::settings::Settings]; everything here is a fixed
//! property of the engine.

use std::time::Duration;

/// Bytes per cached sample slot (f32 in the shared buffer).
pub const BYTES_PER_SAMPLE: usize = 4;

/// Target size of one streaming read from a source, in bytes.  The reader rounds this down to a
/// whole number of source data units before use.
pub const DATA_CHUNK_BYTES: usize = 1 << 20;

/// Sources at most this large are loaded in one read instead of streamed chunk by chunk.
pub const MAX_DIRECT_LOAD_BYTES: u64 = 16 << 20;

/// Cap on the raw signal cache for a single recording, in bytes after sample conversion.
pub const MAX_LOAD_CACHE_BYTES: usize = 256 << 20;

/// Seconds of extra signal fetched on each side of a requested range so IIR transients settle
/// outside the returned window.
pub const FILTER_PADDING_SECONDS: f64 = 2.0;

/// Attempts for one chunk read before the failure is surfaced.
pub const CHUNK_READ_ATTEMPTS: u32 = 3;

/// Base delay of the exponential backoff between chunk read attempts.
pub const CHUNK_RETRY_BASE_DELAY: Duration = Duration::from_millis(100);

/// Per-attempt deadline for reading and decoding one chunk.
pub const CHUNK_TIMEOUT: Duration = Duration::from_secs(10);

/// Deadline for worker/cache setup commissions.
pub const SETUP_TIMEOUT: Duration = Duration::from_secs(30);

/// Deadline for allocation commissions against the memory manager.
pub const ALLOCATION_TIMEOUT: Duration = Duration::from_secs(5);

/// Deadline for everything else.
pub const RESPONSE_TIMEOUT: Duration = Duration::from_secs(10);

/// A commission older than this when a worker picks it up is answered `cancelled` without
/// touching the handler; the consumer has long since stopped waiting.
pub const ABANDON_TIMEOUT: Duration = Duration::from_secs(30);
