use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};

use crossbeam_queue::SegQueue;
use fnv::FnvHashSet;
use parking_lot::Mutex;

use crate::{BlockId, Error, Result, SUPERBLOCK_ID};

#[derive(Default, Debug)]
struct FreeSetAndTip {
    free_set: BTreeSet<BlockId>,
    next_to_allocate: BlockId,
}

/// Tracks which block ids are unused.
///
/// Ids below the tip that are not live sit in `free_set` and are handed out
/// lowest first. The superblock id is never handed out.
#[derive(Debug)]
pub(crate) struct FreeList {
    free_and_tip: Mutex<FreeSetAndTip>,
    /// Flat combining.
    ///
    /// Ids freed while another thread holds `free_and_tip` wait here until
    /// the next allocation folds them in.
    free_queue: SegQueue<BlockId>,
    limit: BlockId,
    allocation_counter: AtomicU64,
    free_counter: AtomicU64,
}

impl FreeList {
    /// Ids below the highest allocated id that are not in `allocated` start
    /// out free. Nothing at or past `limit` is ever handed out.
    pub fn from_allocated(
        allocated: &FnvHashSet<BlockId>,
        limit: BlockId,
    ) -> FreeList {
        let max = allocated.iter().copied().max().unwrap_or(SUPERBLOCK_ID);

        let free_set = (SUPERBLOCK_ID + 1..max)
            .filter(|id| !allocated.contains(id))
            .collect();

        FreeList {
            free_and_tip: Mutex::new(FreeSetAndTip {
                free_set,
                next_to_allocate: max + 1,
            }),
            free_queue: SegQueue::default(),
            limit,
            allocation_counter: 0.into(),
            free_counter: 0.into(),
        }
    }

    pub fn allocate(&self) -> Result<BlockId> {
        let mut free_and_tip = self.free_and_tip.lock();
        while let Some(free_id) = self.free_queue.pop() {
            free_and_tip.free_set.insert(free_id);
        }

        compact(&mut free_and_tip);

        let id = if let Some(id) = free_and_tip.free_set.pop_first() {
            id
        } else {
            let id = free_and_tip.next_to_allocate;
            if id >= self.limit {
                return Err(Error::AllocationFailed(format!(
                    "all {} block ids are in use",
                    self.limit
                )));
            }
            free_and_tip.next_to_allocate += 1;
            id
        };

        self.allocation_counter.fetch_add(1, Ordering::Relaxed);
        Ok(id)
    }

    pub fn free(&self, id: BlockId) {
        assert_ne!(id, SUPERBLOCK_ID, "the superblock can not be freed");

        if cfg!(not(feature = "monotonic-behavior")) {
            self.free_counter.fetch_add(1, Ordering::Relaxed);
            if let Some(mut free) = self.free_and_tip.try_lock() {
                while let Some(free_id) = self.free_queue.pop() {
                    free.free_set.insert(free_id);
                }
                free.free_set.insert(id);

                compact(&mut free);
            } else {
                self.free_queue.push(id);
            }
        }
    }

    /// One past the highest id that may currently be live.
    pub fn tip(&self) -> BlockId {
        self.free_and_tip.lock().next_to_allocate
    }

    /// Returns the counters for allocated, free
    pub fn counters(&self) -> (u64, u64) {
        (
            self.allocation_counter.load(Ordering::Acquire),
            self.free_counter.load(Ordering::Acquire),
        )
    }
}

fn compact(free: &mut FreeSetAndTip) {
    let next = &mut free.next_to_allocate;

    while *next > SUPERBLOCK_ID + 1 && free.free_set.contains(&(*next - 1)) {
        free.free_set.remove(&(*next - 1));
        *next -= 1;
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn allocated(ids: &[BlockId]) -> FnvHashSet<BlockId> {
        ids.iter().copied().collect()
    }

    #[test]
    fn gaps_are_reused_lowest_first() {
        let free_list = FreeList::from_allocated(&allocated(&[0, 1, 4]), 100);
        assert_eq!(free_list.allocate().unwrap(), 2);
        assert_eq!(free_list.allocate().unwrap(), 3);
        assert_eq!(free_list.allocate().unwrap(), 5);
        assert_eq!(free_list.counters(), (3, 0));
    }

    #[test]
    fn superblock_is_never_handed_out() {
        let free_list = FreeList::from_allocated(&allocated(&[0]), 100);
        assert_eq!(free_list.allocate().unwrap(), 1);

        free_list.free(1);
        if cfg!(not(feature = "monotonic-behavior")) {
            assert_eq!(free_list.allocate().unwrap(), 1);
        }
    }

    #[test]
    fn freeing_the_tip_shrinks_it() {
        let free_list = FreeList::from_allocated(&allocated(&[0, 1, 2, 3]), 100);
        free_list.free(3);
        free_list.free(2);
        if cfg!(not(feature = "monotonic-behavior")) {
            assert_eq!(free_list.tip(), 2);
        }
    }

    #[test]
    fn exhaustion_is_reported() {
        let free_list = FreeList::from_allocated(&allocated(&[0]), 3);
        assert_eq!(free_list.allocate().unwrap(), 1);
        assert_eq!(free_list.allocate().unwrap(), 2);
        assert!(matches!(
            free_list.allocate(),
            Err(Error::AllocationFailed(_))
        ));
    }
}
