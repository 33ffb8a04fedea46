use std::num::NonZeroU64;
use std::sync::atomic::{AtomicU64, Ordering};

/// A process-wide unique ID.
///
/// Used for memory-manager owners, property-bus callers, annotations and montage arena keys.
/// The underlying counter is monotonic, which the memory manager relies on for deterministic
/// eviction tie-breaks: of two owners with equal last-used stamps, the lower (older) id goes
/// first.  The ID contains a niche, so `Option<UniqueId>` costs nothing extra.
#[derive(Copy, Clone, Debug, Eq, Ord, PartialEq, PartialOrd, Hash)]
pub struct UniqueId(NonZeroU64);

impl UniqueId {
    pub fn new() -> UniqueId {
        UniqueId(unique_u64())
    }

    pub fn get(&self) -> u64 {
        self.0.get()
    }
}

impl Default for UniqueId {
    fn default() -> Self {
        UniqueId::new()
    }
}

impl std::fmt::Display for UniqueId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

fn unique_u64() -> NonZeroU64 {
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    let got = COUNTER.fetch_add(1, Ordering::Relaxed);
    NonZeroU64::new(got + 1).unwrap()
}
