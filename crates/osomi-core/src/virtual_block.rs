//! Range allocator over an abstract linear address space.
//!
//! Used to carve GPU memory blocks into sub-allocations. Nothing is ever
//! dereferenced here; the allocator only tracks which byte ranges are taken.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// A live range handed out by [`VirtualBlockAllocator::alloc`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlockAllocation {
    /// Start of the range, aligned as requested.
    pub offset: u64,
    /// Length of the range in bytes.
    pub size: u64,
}

impl BlockAllocation {
    /// One past the last byte.
    #[inline]
    pub const fn end(&self) -> u64 {
        self.offset + self.size
    }
}

/// First-fit range allocator with coalescing frees.
#[derive(Clone, Debug)]
pub struct VirtualBlockAllocator {
    size: u64,
    /// Free ranges keyed by offset; adjacent ranges are always merged.
    free: BTreeMap<u64, u64>,
    /// Live allocations keyed by offset.
    used: BTreeMap<u64, u64>,
    used_bytes: u64,
}

impl VirtualBlockAllocator {
    /// Create an allocator managing `[0, size)`.
    pub fn new(size: u64) -> Self {
        let mut free = BTreeMap::new();
        if size > 0 {
            free.insert(0, size);
        }
        Self {
            size,
            free,
            used: BTreeMap::new(),
            used_bytes: 0,
        }
    }

    /// Total managed bytes.
    #[inline]
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Bytes not covered by a live allocation.
    #[inline]
    pub fn free_space(&self) -> u64 {
        self.size - self.used_bytes
    }

    /// Bytes covered by live allocations.
    #[inline]
    pub fn used_space(&self) -> u64 {
        self.used_bytes
    }

    /// Length of the largest contiguous free range.
    pub fn largest_free_range(&self) -> u64 {
        self.free.values().copied().max().unwrap_or(0)
    }

    /// Number of live allocations.
    #[inline]
    pub fn allocation_count(&self) -> usize {
        self.used.len()
    }

    /// True when nothing is allocated.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.used.is_empty()
    }

    /// Reserve the lowest-addressed range of `size` bytes aligned to `alignment`.
    pub fn alloc(&mut self, size: u64, alignment: u64) -> Result<BlockAllocation> {
        if size == 0 {
            return Err(Error::ZeroSize);
        }
        if alignment == 0 || !alignment.is_power_of_two() {
            return Err(Error::InvalidAlignment(alignment));
        }

        let fit = self.free.iter().find_map(|(&start, &len)| {
            let aligned = align_up(start, alignment)?;
            let end = aligned.checked_add(size)?;
            (end <= start + len).then_some((start, len, aligned))
        });

        let Some((start, len, aligned)) = fit else {
            return Err(Error::OutOfSpace {
                requested: size,
                largest_free: self.largest_free_range(),
            });
        };

        self.free.remove(&start);
        if aligned > start {
            self.free.insert(start, aligned - start);
        }
        let tail = start + len - (aligned + size);
        if tail > 0 {
            self.free.insert(aligned + size, tail);
        }

        self.used.insert(aligned, size);
        self.used_bytes += size;

        Ok(BlockAllocation {
            offset: aligned,
            size,
        })
    }

    /// Return a range to the free set, merging it with its neighbours.
    pub fn free(&mut self, allocation: BlockAllocation) -> Result<()> {
        match self.used.get(&allocation.offset) {
            Some(&size) if size == allocation.size => {}
            _ => {
                return Err(Error::InvalidFree {
                    offset: allocation.offset,
                    size: allocation.size,
                })
            }
        }

        self.used.remove(&allocation.offset);
        self.used_bytes -= allocation.size;

        let mut start = allocation.offset;
        let mut len = allocation.size;

        if let Some((&prev_start, &prev_len)) = self.free.range(..start).next_back() {
            if prev_start + prev_len == start {
                self.free.remove(&prev_start);
                start = prev_start;
                len += prev_len;
            }
        }

        if let Some(next_len) = self.free.remove(&(start + len)) {
            len += next_len;
        }

        self.free.insert(start, len);
        Ok(())
    }

    /// Free every allocation at once.
    pub fn reset(&mut self) {
        *self = Self::new(self.size);
    }

    /// Iterate over free ranges in address order.
    pub fn free_ranges(&self) -> impl Iterator<Item = BlockAllocation> + '_ {
        self.free
            .iter()
            .map(|(&offset, &size)| BlockAllocation { offset, size })
    }
}

fn align_up(value: u64, alignment: u64) -> Option<u64> {
    Some(value.checked_add(alignment - 1)? & !(alignment - 1))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_disjoint(live: &[BlockAllocation]) {
        let mut sorted = live.to_vec();
        sorted.sort_by_key(|a| a.offset);
        for pair in sorted.windows(2) {
            assert!(pair[0].end() <= pair[1].offset, "{pair:?} overlap");
        }
    }

    #[test]
    fn first_fit_lowest_address() {
        let mut va = VirtualBlockAllocator::new(1024);
        let a = va.alloc(100, 1).unwrap();
        let b = va.alloc(100, 1).unwrap();
        assert_eq!(a.offset, 0);
        assert_eq!(b.offset, 100);
        assert_eq!(va.used_space(), 200);
        assert_eq!(va.free_space(), 824);
    }

    #[test]
    fn alignment_leaves_padding_free() {
        let mut va = VirtualBlockAllocator::new(1024);
        va.alloc(10, 1).unwrap();
        let aligned = va.alloc(64, 256).unwrap();
        assert_eq!(aligned.offset, 256);

        // The padding before the aligned range is still usable.
        let small = va.alloc(200, 4).unwrap();
        assert_eq!(small.offset, 12);
    }

    #[test]
    fn free_then_realloc_reuses_range() {
        let mut va = VirtualBlockAllocator::new(4096);
        let mut live: Vec<_> = (0..8).map(|_| va.alloc(256, 16).unwrap()).collect();

        for _ in 0..100 {
            let victim = live.remove(3);
            va.free(victim).unwrap();
            let again = va.alloc(256, 16).unwrap();
            assert_eq!(again, victim);
            live.insert(3, again);
            assert_disjoint(&live);
        }
        assert_eq!(va.free_ranges().count(), 1);
    }

    #[test]
    fn free_coalesces_both_sides() {
        let mut va = VirtualBlockAllocator::new(300);
        let a = va.alloc(100, 1).unwrap();
        let b = va.alloc(100, 1).unwrap();
        let c = va.alloc(100, 1).unwrap();
        assert_eq!(va.largest_free_range(), 0);

        va.free(a).unwrap();
        va.free(c).unwrap();
        assert_eq!(va.largest_free_range(), 100);

        va.free(b).unwrap();
        assert_eq!(va.largest_free_range(), 300);
        assert!(va.is_empty());
        assert_eq!(
            va.free_ranges().collect::<Vec<_>>(),
            vec![BlockAllocation {
                offset: 0,
                size: 300
            }]
        );
    }

    #[test]
    fn out_of_space_reports_largest_range() {
        let mut va = VirtualBlockAllocator::new(256);
        va.alloc(200, 1).unwrap();
        assert_eq!(
            va.alloc(100, 1),
            Err(Error::OutOfSpace {
                requested: 100,
                largest_free: 56
            })
        );
    }

    #[test]
    fn rejects_bad_requests() {
        let mut va = VirtualBlockAllocator::new(256);
        assert_eq!(va.alloc(0, 1), Err(Error::ZeroSize));
        assert_eq!(va.alloc(8, 3), Err(Error::InvalidAlignment(3)));
        assert_eq!(va.alloc(8, 0), Err(Error::InvalidAlignment(0)));
    }

    #[test]
    fn double_free_is_rejected() {
        let mut va = VirtualBlockAllocator::new(256);
        let a = va.alloc(32, 1).unwrap();
        va.free(a).unwrap();
        assert_eq!(
            va.free(a),
            Err(Error::InvalidFree {
                offset: 0,
                size: 32
            })
        );
        let wrong_size = BlockAllocation {
            offset: va.alloc(32, 1).unwrap().offset,
            size: 16,
        };
        assert!(va.free(wrong_size).is_err());
        assert_eq!(va.allocation_count(), 1);
    }

    #[test]
    fn interleaved_sequence_never_overlaps() {
        let mut va = VirtualBlockAllocator::new(1 << 16);
        let mut live = Vec::new();
        let mut state = 0x2545_f491_u64;

        for step in 0..500 {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;

            if step % 3 == 2 && !live.is_empty() {
                let idx = (state as usize) % live.len();
                va.free(live.swap_remove(idx)).unwrap();
            } else {
                let size = 1 + state % 700;
                let align = 1 << (state % 7);
                if let Ok(a) = va.alloc(size, align) {
                    assert_eq!(a.offset % align, 0);
                    live.push(a);
                }
            }
            assert_disjoint(&live);
        }

        let used: u64 = live.iter().map(|a| a.size).sum();
        assert_eq!(va.used_space(), used);
    }

    #[test]
    fn reset_frees_everything() {
        let mut va = VirtualBlockAllocator::new(128);
        va.alloc(64, 1).unwrap();
        va.reset();
        assert!(va.is_empty());
        assert_eq!(va.largest_free_range(), 128);
    }
}
