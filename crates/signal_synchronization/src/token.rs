//! Capability tokens for cache ranges.
//!
//! The memory manager owns the byte ranges; workers hold tokens.  A token is just enough to
//! rebuild a view over the shared buffer (where the range starts, how long it is, who owns it).
//! Tokens are plain `Copy` data and travel across worker boundaries inside messages.  Holding a
//! token does not by itself grant writing; the cache layer hands the write capability to exactly
//! one worker and everyone else gets read views.

use crate::shared_buffer::WordRange;

/// Which half of the coupled cache a token grants.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum CacheRole {
    /// The single writer: may initialize, insert and invalidate.
    Input,
    /// A reader: may only take read locks and snapshot.
    Output,
}

/// A transferable handle to an allocated cache range.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct CacheToken {
    /// The allocated range inside the shared buffer.
    pub range: WordRange,
    /// Owner id as registered with the memory manager.
    pub owner: u64,
    /// Role this token grants.
    pub role: CacheRole,
}

impl CacheToken {
    pub fn input(range: WordRange, owner: u64) -> CacheToken {
        CacheToken {
            range,
            owner,
            role: CacheRole::Input,
        }
    }

    pub fn output(range: WordRange, owner: u64) -> CacheToken {
        CacheToken {
            range,
            owner,
            role: CacheRole::Output,
        }
    }

    /// The same token re-pointed at a compacted location.  Used when the memory manager
    /// rearranges ranges; the length never changes.
    pub fn rebased(&self, new_start: usize) -> CacheToken {
        CacheToken {
            range: self.range.moved_to(new_start),
            ..*self
        }
    }

    pub fn grants_write(&self) -> bool {
        self.role == CacheRole::Input
    }
}
