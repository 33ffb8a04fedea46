//! The memory-budgeted shared buffer manager.
//!
//! One manager owns one [SharedBuffer] and parcels it out as disjoint word ranges to cache
//! owners.  When a request does not fit, least-recently-used owners are evicted until it does or
//! nothing evictable remains.  Eviction and compaction are announced on an event channel; a
//! compaction is a barrier, so further allocations fail until every relocated owner has
//! acknowledged its new range.
//!
//! Last-used ordering comes from a monotonic counter held here, not wall clock, and ties break
//! toward the lower owner id, so eviction order is deterministic under test.

use std::sync::Arc;

use ahash::{HashMap, HashMapExt, HashSet, HashSetExt};
use crossbeam::channel::{unbounded, Receiver, Sender};
use signal_synchronization::{CacheToken, CoupledLock, SharedBuffer, WordRange};
use smallvec::SmallVec;

use crate::error::{Error, Result};
use crate::unique_id::UniqueId;

/// Out-of-band notifications to cache holders.
#[derive(Clone, Debug, PartialEq)]
pub enum MemoryEvent {
    /// The owner's range is gone; re-request an allocation before further use.
    Evicted { owner: UniqueId },
    /// The owner's words moved here; rebase views, then acknowledge.
    Rearranged {
        owner: UniqueId,
        new_range: WordRange,
    },
}

#[derive(Debug)]
struct OwnerRecord {
    range: WordRange,
    last_used: u64,
    /// Owners this one reads through (a montage cache depends on its raw cache).  Touching the
    /// dependent touches these transitively.
    dependencies: SmallVec<[UniqueId; 2]>,
    /// In-progress commission count; non-zero pins the owner against eviction.
    reservations: u32,
}

pub struct MemoryManager {
    buffer: Arc<SharedBuffer>,
    owners: HashMap<UniqueId, OwnerRecord>,
    stamp: u64,
    events: Sender<MemoryEvent>,
    /// Owners that were handed a `Rearranged` event and have not yet confirmed it.
    pending_acks: HashSet<UniqueId>,
}

impl MemoryManager {
    /// Create a manager over a fresh buffer of `byte_budget` bytes (rounded down to whole
    /// words).  The receiver carries eviction and rearrangement events.
    pub fn new(byte_budget: usize) -> (MemoryManager, Receiver<MemoryEvent>) {
        let (events, rx) = unbounded();
        (
            MemoryManager {
                buffer: Arc::new(SharedBuffer::new(byte_budget / 4)),
                owners: HashMap::new(),
                stamp: 0,
                events,
                pending_acks: HashSet::new(),
            },
            rx,
        )
    }

    pub fn buffer(&self) -> Arc<SharedBuffer> {
        self.buffer.clone()
    }

    pub fn byte_budget(&self) -> usize {
        self.buffer.byte_len()
    }

    pub fn allocated_bytes(&self) -> usize {
        self.owners.values().map(|o| o.range.byte_len()).sum()
    }

    pub fn free_bytes(&self) -> usize {
        self.byte_budget() - self.allocated_bytes()
    }

    fn bump(&mut self) -> u64 {
        self.stamp += 1;
        self.stamp
    }

    /// Allocate `bytes` for `owner`, evicting and compacting as needed.
    ///
    /// Fails when a previous compaction is still unacknowledged, or when eviction cannot free
    /// enough space (no partial allocation happens in that case).
    pub fn allocate(&mut self, bytes: usize, owner: UniqueId) -> Result<CacheToken> {
        if !self.pending_acks.is_empty() {
            return Err(Error::State(
                "allocation blocked until rearranged owners acknowledge".into(),
            ));
        }
        if self.owners.contains_key(&owner) {
            return Err(Error::State(format!("owner {owner} already holds a range")));
        }

        let words = bytes.div_ceil(4);
        if words > self.buffer.len() {
            return Err(Error::Allocation {
                requested: bytes,
                available: self.byte_budget(),
            });
        }

        // Happy path: an existing gap fits; take the lowest-address one.
        if let Some(range) = self.lowest_fit(words) {
            return Ok(self.admit(owner, range));
        }

        // Evict by LRU until enough total space exists or nothing evictable remains.
        loop {
            if self.free_words() >= words {
                break;
            }
            let Some(victim) = self.next_victim() else {
                return Err(Error::Allocation {
                    requested: bytes,
                    available: self.free_bytes(),
                });
            };
            log::warn!("memory pressure: evicting cache owner {victim}");
            self.owners.remove(&victim);
            let _ = self.events.send(MemoryEvent::Evicted { owner: victim });
        }

        // Enough words exist in total now, but possibly fragmented.
        if self.lowest_fit(words).is_none() {
            self.compact();
        }
        let range = self
            .lowest_fit(words)
            .expect("compaction produced a contiguous gap of at least the freed size");
        Ok(self.admit(owner, range))
    }

    fn admit(&mut self, owner: UniqueId, range: WordRange) -> CacheToken {
        let stamp = self.bump();
        self.owners.insert(
            owner,
            OwnerRecord {
                range,
                last_used: stamp,
                dependencies: SmallVec::new(),
                reservations: 0,
            },
        );
        CacheToken::input(range, owner.get())
    }

    /// Free the owner's range entirely.
    pub fn release(&mut self, owner: UniqueId) {
        self.owners.remove(&owner);
        self.pending_acks.remove(&owner);
    }

    /// Refresh the owner's last-used stamp, and transitively its dependencies'.
    pub fn touch(&mut self, owner: UniqueId) {
        let mut queue: SmallVec<[UniqueId; 4]> = SmallVec::new();
        let mut seen: HashSet<UniqueId> = HashSet::new();
        queue.push(owner);
        while let Some(id) = queue.pop() {
            if !seen.insert(id) {
                continue;
            }
            let stamp = self.bump();
            if let Some(record) = self.owners.get_mut(&id) {
                record.last_used = stamp;
                queue.extend(record.dependencies.iter().copied());
            }
        }
    }

    /// Declare that `owner` reads through `dependency`.
    pub fn add_dependency(&mut self, owner: UniqueId, dependency: UniqueId) -> Result<()> {
        let record = self
            .owners
            .get_mut(&owner)
            .ok_or_else(|| Error::State(format!("unknown owner {owner}")))?;
        if !record.dependencies.contains(&dependency) {
            record.dependencies.push(dependency);
        }
        Ok(())
    }

    /// Pin `owner` against eviction while a commission is in flight.
    pub fn reserve(&mut self, owner: UniqueId) -> Result<()> {
        self.owners
            .get_mut(&owner)
            .ok_or_else(|| Error::State(format!("unknown owner {owner}")))?
            .reservations += 1;
        Ok(())
    }

    pub fn unreserve(&mut self, owner: UniqueId) {
        if let Some(record) = self.owners.get_mut(&owner) {
            record.reservations = record.reservations.saturating_sub(1);
        }
    }

    /// Trim byte ranges off their owners without destroying them (an owner shrank).  Every
    /// range must cover the head or tail of exactly one owner's allocation.
    pub fn remove_ranges(&mut self, ranges: &[WordRange]) -> Result<()> {
        for r in ranges {
            let (id, current) = self
                .owners
                .iter()
                .find(|(_, o)| o.range.contains(r))
                .map(|(id, o)| (*id, o.range))
                .ok_or_else(|| {
                    Error::State(format!("range {r:?} is not inside any owner's allocation"))
                })?;

            let trimmed = if r.start == current.start {
                WordRange::new(r.end, current.end)
            } else if r.end == current.end {
                WordRange::new(current.start, r.start)
            } else {
                return Err(Error::State(format!(
                    "range {r:?} would fragment owner {id}"
                )));
            };
            self.owners
                .get_mut(&id)
                .expect("the owner was just found by range")
                .range = trimmed;
        }
        Ok(())
    }

    /// Confirm that a rearranged owner rebased its views onto the new range.
    pub fn acknowledge_rearrange(&mut self, owner: UniqueId) {
        self.pending_acks.remove(&owner);
    }

    pub fn rearrange_pending(&self) -> bool {
        !self.pending_acks.is_empty()
    }

    pub fn owner_range(&self, owner: UniqueId) -> Option<WordRange> {
        self.owners.get(&owner).map(|o| o.range)
    }

    fn free_words(&self) -> usize {
        self.buffer.len() - self.owners.values().map(|o| o.range.len()).sum::<usize>()
    }

    /// All allocated ranges sorted by start address.
    fn sorted_ranges(&self) -> Vec<(UniqueId, WordRange)> {
        let mut v: Vec<(UniqueId, WordRange)> =
            self.owners.iter().map(|(id, o)| (*id, o.range)).collect();
        v.sort_by_key(|(_, r)| r.start);
        v
    }

    /// The lowest-address free gap of at least `words`.
    fn lowest_fit(&self, words: usize) -> Option<WordRange> {
        let mut cursor = 0usize;
        for (_, range) in self.sorted_ranges() {
            if range.start - cursor >= words {
                return Some(WordRange::new(cursor, cursor + words));
            }
            cursor = range.end;
        }
        if self.buffer.len() - cursor >= words {
            return Some(WordRange::new(cursor, cursor + words));
        }
        None
    }

    /// The least-recently-used evictable owner: not reserved, and with no reserved dependents.
    fn next_victim(&self) -> Option<UniqueId> {
        let mut best: Option<(u64, u64, UniqueId)> = None;
        for (id, record) in &self.owners {
            if record.reservations > 0 {
                continue;
            }
            let pinned_by_dependent = self
                .owners
                .values()
                .any(|o| o.reservations > 0 && o.dependencies.contains(id));
            if pinned_by_dependent {
                continue;
            }
            let key = (record.last_used, id.get(), *id);
            if best.map_or(true, |b| (key.0, key.1) < (b.0, b.1)) {
                best = Some(key);
            }
        }
        best.map(|(_, _, id)| id)
    }

    /// Slide every surviving owner toward address zero, preserving address order, announcing
    /// each move.  Word moves happen under the moved cache's own write lock so no reader can
    /// observe a half-copied range.
    fn compact(&mut self) {
        let mut cursor = 0usize;
        for (id, range) in self.sorted_ranges() {
            if range.start != cursor {
                let guard_lock = CoupledLock::new(self.buffer.clone(), range.start);
                let _guard = guard_lock.lock_write();
                self.buffer.copy_words(range, cursor);
                // The copied lock word carries the held write state; the new home starts free.
                self.buffer.word(cursor).store(0, std::sync::atomic::Ordering::Release);

                let new_range = range.moved_to(cursor);
                self.owners
                    .get_mut(&id)
                    .expect("compaction only walks live owners")
                    .range = new_range;
                self.pending_acks.insert(id);
                let _ = self.events.send(MemoryEvent::Rearranged {
                    owner: id,
                    new_range,
                });
            }
            cursor += range.len();
        }
    }
}

impl std::fmt::Debug for MemoryManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryManager")
            .field("budget_bytes", &self.byte_budget())
            .field("owners", &self.owners.len())
            .field("free_bytes", &self.free_bytes())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(n: usize) -> Vec<UniqueId> {
        (0..n).map(|_| UniqueId::new()).collect()
    }

    #[test]
    fn allocates_lowest_fit_and_tracks_free_space() {
        let (mut mgr, _rx) = MemoryManager::new(400);
        let owners = ids(2);

        let a = mgr.allocate(100, owners[0]).unwrap();
        let b = mgr.allocate(100, owners[1]).unwrap();
        assert_eq!(a.range, WordRange::new(0, 25));
        assert_eq!(b.range, WordRange::new(25, 50));
        assert_eq!(mgr.free_bytes() + mgr.allocated_bytes(), mgr.byte_budget());

        mgr.release(owners[0]);
        let c = mgr.allocate(60, UniqueId::new()).unwrap();
        assert_eq!(c.range, WordRange::new(0, 15));
    }

    #[test]
    fn oversized_requests_fail_cleanly() {
        let (mut mgr, _rx) = MemoryManager::new(100);
        let err = mgr.allocate(1000, UniqueId::new()).unwrap_err();
        assert!(matches!(err, Error::Allocation { .. }));
        assert_eq!(mgr.free_bytes(), 100);
    }

    #[test]
    fn evicts_least_recently_used_first() {
        let (mut mgr, rx) = MemoryManager::new(300);
        let owners = ids(3);
        for o in &owners {
            mgr.allocate(100, *o).unwrap();
        }

        // Owner 0 is oldest, but touching it promotes it; owner 1 becomes the victim.
        mgr.touch(owners[0]);
        mgr.allocate(100, UniqueId::new()).unwrap();

        let evicted: Vec<MemoryEvent> = rx.try_iter().collect();
        assert_eq!(evicted[0], MemoryEvent::Evicted { owner: owners[1] });
    }

    #[test]
    fn reserved_owners_survive_eviction() {
        let (mut mgr, rx) = MemoryManager::new(200);
        let owners = ids(2);
        mgr.allocate(100, owners[0]).unwrap();
        mgr.allocate(100, owners[1]).unwrap();
        mgr.reserve(owners[0]).unwrap();

        mgr.allocate(100, UniqueId::new()).unwrap();
        let events: Vec<MemoryEvent> = rx.try_iter().collect();
        assert!(events.contains(&MemoryEvent::Evicted { owner: owners[1] }));
        assert!(!events.contains(&MemoryEvent::Evicted { owner: owners[0] }));
    }

    #[test]
    fn touching_a_montage_cache_touches_its_raw_cache() {
        let (mut mgr, rx) = MemoryManager::new(300);
        let owners = ids(3);
        for o in &owners {
            mgr.allocate(100, *o).unwrap();
        }
        // owners[1] (montage) depends on owners[0] (raw).
        mgr.add_dependency(owners[1], owners[0]).unwrap();
        mgr.touch(owners[1]);

        // Now owners[2] is the least recently used.
        mgr.allocate(100, UniqueId::new()).unwrap();
        let events: Vec<MemoryEvent> = rx.try_iter().collect();
        assert_eq!(events[0], MemoryEvent::Evicted { owner: owners[2] });
    }

    #[test]
    fn fragmented_space_is_compacted_with_a_barrier() {
        let (mut mgr, rx) = MemoryManager::new(400);
        let owners = ids(4);
        for o in &owners {
            mgr.allocate(100, *o).unwrap();
        }

        // Free two non-adjacent quarters; a half-size request must compact.
        mgr.release(owners[0]);
        mgr.release(owners[2]);
        let big = mgr.allocate(200, UniqueId::new()).unwrap();
        assert_eq!(big.range.len(), 50);

        let moved: Vec<MemoryEvent> = rx.try_iter().collect();
        assert!(moved
            .iter()
            .any(|e| matches!(e, MemoryEvent::Rearranged { owner, .. } if *owner == owners[1])));

        // The barrier holds until acknowledged.
        assert!(mgr.rearrange_pending());
        let err = mgr.allocate(10, UniqueId::new()).unwrap_err();
        assert!(matches!(err, Error::State(_)));
        for e in &moved {
            if let MemoryEvent::Rearranged { owner, .. } = e {
                mgr.acknowledge_rearrange(*owner);
            }
        }
        assert!(!mgr.rearrange_pending());
        assert!(mgr.allocate(10, UniqueId::new()).is_ok());
    }

    #[test]
    fn compaction_moves_cache_words() {
        let (mut mgr, rx) = MemoryManager::new(400);
        let owners = ids(2);
        mgr.allocate(100, owners[0]).unwrap();
        let b = mgr.allocate(100, owners[1]).unwrap();

        // Mark owner 1's words so the move is observable.
        let buffer = mgr.buffer();
        for i in b.range.start..b.range.end {
            buffer.store(i, i as u32);
        }

        mgr.release(owners[0]);
        // 75 words only fit after compaction (25 free at the head + 50 at the tail).
        mgr.allocate(300, UniqueId::new()).unwrap();

        let mut new_range = None;
        for e in rx.try_iter() {
            if let MemoryEvent::Rearranged { owner, new_range: r } = e {
                assert_eq!(owner, owners[1]);
                new_range = Some(r);
            }
        }
        let new_range = new_range.expect("owner 1 must have moved");
        assert_eq!(new_range, WordRange::new(0, 25));
        // Data words followed; word 0 is the (now free) lock word.
        for i in 1..25 {
            assert_eq!(buffer.load(i), (b.range.start + i) as u32);
        }
    }

    #[test]
    fn remove_ranges_shrinks_without_destroying() {
        let (mut mgr, _rx) = MemoryManager::new(400);
        let owner = UniqueId::new();
        let token = mgr.allocate(200, owner).unwrap();
        let full = token.range;

        // Give back the tail half.
        mgr.remove_ranges(&[WordRange::new(full.start + 25, full.end)])
            .unwrap();
        assert_eq!(mgr.owner_range(owner), Some(WordRange::new(full.start, full.start + 25)));
        assert_eq!(mgr.free_bytes(), 400 - 100);

        // A middle cut is refused.
        let err = mgr
            .remove_ranges(&[WordRange::new(full.start + 5, full.start + 10)])
            .unwrap_err();
        assert!(matches!(err, Error::State(_)));
    }

    /// Invariant 6: allocation accounting always balances the budget.
    #[test]
    fn accounting_balances_through_churn() {
        let (mut mgr, rx) = MemoryManager::new(1000);
        let mut live = Vec::new();
        for round in 0..20 {
            let id = UniqueId::new();
            if mgr.allocate(96 + round * 8, id).is_ok() {
                live.push(id);
            }
            for e in rx.try_iter() {
                match e {
                    MemoryEvent::Evicted { owner } => live.retain(|l| *l != owner),
                    MemoryEvent::Rearranged { owner, .. } => mgr.acknowledge_rearrange(owner),
                }
            }
            if round % 3 == 0 && !live.is_empty() {
                mgr.release(live.remove(0));
            }
            assert_eq!(mgr.free_bytes() + mgr.allocated_bytes(), mgr.byte_budget());
        }
    }
}
