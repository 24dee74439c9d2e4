//! Object id allocation.

use std::cmp::Reverse;
use std::collections::BinaryHeap;

use osomi_core::Bitset;

use crate::object::ObjectId;

/// Hands out the lowest free id in `1..=max_id`.
///
/// The bitmap has one bit per id, bit 0 permanently set. Released ids go on a
/// min-heap and are preferred over ids that were never used.
#[derive(Debug)]
pub struct IdAllocator {
    bitmap: Bitset,
    released: BinaryHeap<Reverse<u32>>,
    /// Lowest never-used id, `None` once every id has been handed out.
    next: Option<u32>,
    max_id: u32,
    live: usize,
}

impl IdAllocator {
    /// Allocator for ids `1..=max_id`.
    pub fn new(max_id: u32) -> Self {
        let mut bitmap = Bitset::new(max_id as usize + 1);
        bitmap.set(0, true);
        Self {
            bitmap,
            released: BinaryHeap::new(),
            next: (max_id >= 1).then_some(1),
            max_id,
            live: 0,
        }
    }

    /// Largest assignable id.
    #[inline]
    pub fn max_id(&self) -> u32 {
        self.max_id
    }

    /// Number of ids in use.
    #[inline]
    pub fn live(&self) -> usize {
        self.live
    }

    /// One bit per id; bit 0 is reserved.
    pub fn bitmap(&self) -> &Bitset {
        &self.bitmap
    }

    /// Whether `id` is currently assigned.
    pub fn is_live(&self, id: ObjectId) -> bool {
        id.raw() != 0 && self.bitmap.get(id.raw() as usize)
    }

    /// Take the lowest free id, `None` when all are assigned.
    pub fn reserve(&mut self) -> Option<ObjectId> {
        let raw = match self.released.pop() {
            Some(Reverse(raw)) => raw,
            None => {
                let raw = self.next?;
                self.next = next_unused(raw, self.max_id);
                raw
            }
        };

        self.bitmap.set(raw as usize, true);
        self.live += 1;
        Some(ObjectId::new(raw))
    }

    /// Return an id to the pool. False if it was not assigned.
    pub fn release(&mut self, id: ObjectId) -> bool {
        if !self.is_live(id) {
            return false;
        }
        self.bitmap.set(id.raw() as usize, false);
        self.released.push(Reverse(id.raw()));
        self.live -= 1;
        true
    }
}

fn next_unused(raw: u32, max_id: u32) -> Option<u32> {
    raw.checked_add(1).filter(|&next| next <= max_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_start_at_one() {
        let mut ids = IdAllocator::new(10);
        assert_eq!(ids.reserve().map(ObjectId::raw), Some(1));
        assert!(ids.bitmap().get(0));
        assert!(!ids.is_live(ObjectId::new(0)));
    }

    #[test]
    fn last_id_of_full_u32_range_does_not_wrap() {
        assert_eq!(next_unused(u32::MAX - 1, u32::MAX), Some(u32::MAX));
        assert_eq!(next_unused(u32::MAX, u32::MAX), None);
        assert_eq!(next_unused(10, 10), None);
    }

    #[test]
    fn zero_max_id_hands_out_nothing() {
        let mut ids = IdAllocator::new(0);
        assert_eq!(ids.reserve(), None);
        assert_eq!(ids.live(), 0);
    }

    #[test]
    fn lowest_released_id_comes_back_first() {
        let mut ids = IdAllocator::new(10);
        let taken: Vec<_> = (0..5).filter_map(|_| ids.reserve()).collect();

        assert!(ids.release(taken[3]));
        assert!(ids.release(taken[1]));
        assert_eq!(ids.reserve(), Some(taken[1]));
        assert_eq!(ids.reserve(), Some(taken[3]));
        assert_eq!(ids.reserve().map(ObjectId::raw), Some(6));
    }

    #[test]
    fn exhaustion_and_recovery() {
        let mut ids = IdAllocator::new(3);
        let taken: Vec<_> = (0..3).filter_map(|_| ids.reserve()).collect();
        assert_eq!(taken.len(), 3);
        assert_eq!(ids.reserve(), None);

        ids.release(taken[2]);
        assert_eq!(ids.reserve(), Some(taken[2]));
        assert_eq!(ids.live(), 3);
    }

    #[test]
    fn releasing_a_free_id_is_rejected() {
        let mut ids = IdAllocator::new(4);
        let id = ids.reserve().unwrap();
        assert!(ids.release(id));
        assert!(!ids.release(id));
        assert!(!ids.release(ObjectId::new(0)));
        assert_eq!(ids.live(), 0);
    }

    #[test]
    fn bitmap_tracks_live_ids() {
        let mut ids = IdAllocator::new(64);
        let taken: Vec<_> = (0..20).filter_map(|_| ids.reserve()).collect();
        for id in taken.iter().step_by(3) {
            ids.release(*id);
        }

        let live: Vec<usize> = taken
            .iter()
            .filter(|id| ids.is_live(**id))
            .map(|id| id.raw() as usize)
            .collect();
        let set: Vec<usize> = ids.bitmap().ones().skip(1).collect();
        assert_eq!(set, live);
        assert_eq!(ids.bitmap().count_ones(), live.len() + 1);
    }
}
