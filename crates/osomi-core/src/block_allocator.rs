//! Pooled storage for objects of one type.
//!
//! Objects live in fixed-capacity chunks that are never resized, so an
//! object keeps its address from `alloc` until `dealloc`. Freed slots go on a
//! free list and are reused before the pool grows.

use std::mem;

/// Handle to an object stored in a [`BlockAllocator`].
///
/// The generation makes handles to freed slots stale instead of aliasing the
/// next object placed in the same slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct BlockHandle {
    index: u32,
    generation: u32,
}

impl BlockHandle {
    /// Slot index inside the pool.
    #[inline]
    pub const fn index(self) -> u32 {
        self.index
    }
}

struct Slot<T> {
    value: Option<T>,
    generation: u32,
}

/// Chunked object pool with free-list reuse.
///
/// `heap_size` only decides how many objects a chunk holds; the pool keeps
/// adding chunks for as long as the process has memory.
pub struct BlockAllocator<T> {
    chunks: Vec<Vec<Slot<T>>>,
    chunk_len: usize,
    free: Vec<u32>,
    len: usize,
}

impl<T> BlockAllocator<T> {
    /// Create a pool whose chunks hold roughly `heap_size` bytes each.
    pub fn new(heap_size: usize) -> Self {
        let slot_size = mem::size_of::<Slot<T>>().max(1);
        Self {
            chunks: Vec::new(),
            chunk_len: (heap_size / slot_size).max(1),
            free: Vec::new(),
            len: 0,
        }
    }

    /// Number of live objects.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// True when no object is live.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Number of slots reserved across all chunks.
    pub fn capacity(&self) -> usize {
        self.chunks.len() * self.chunk_len
    }

    /// Objects per chunk.
    pub fn chunk_len(&self) -> usize {
        self.chunk_len
    }

    /// Store `value` and return its handle.
    pub fn alloc(&mut self, value: T) -> BlockHandle {
        self.len += 1;

        if let Some(index) = self.free.pop() {
            let slot = self
                .slot_mut(index)
                .expect("free list only holds reserved slots");
            slot.value = Some(value);
            return BlockHandle {
                index,
                generation: slot.generation,
            };
        }

        let needs_chunk = self
            .chunks
            .last()
            .map_or(true, |chunk| chunk.len() == self.chunk_len);
        if needs_chunk {
            self.chunks.push(Vec::with_capacity(self.chunk_len));
        }

        let chunk_index = self.chunks.len() - 1;
        let chunk = &mut self.chunks[chunk_index];
        chunk.push(Slot {
            value: Some(value),
            generation: 0,
        });

        BlockHandle {
            index: (chunk_index * self.chunk_len + chunk.len() - 1) as u32,
            generation: 0,
        }
    }

    /// Remove the object behind `handle`, returning it and clearing the handle.
    ///
    /// Stale or empty handles return `None` and are left untouched.
    pub fn dealloc(&mut self, handle: &mut Option<BlockHandle>) -> Option<T> {
        let h = (*handle)?;
        let slot = self.slot_mut(h.index)?;
        if slot.generation != h.generation {
            return None;
        }

        let value = slot.value.take()?;
        slot.generation = slot.generation.wrapping_add(1);

        self.free.push(h.index);
        self.len -= 1;
        *handle = None;
        Some(value)
    }

    /// True if `handle` refers to a live object.
    pub fn contains(&self, handle: BlockHandle) -> bool {
        self.get(handle).is_some()
    }

    /// Borrow the object behind `handle`.
    pub fn get(&self, handle: BlockHandle) -> Option<&T> {
        let slot = self.slot(handle.index)?;
        if slot.generation != handle.generation {
            return None;
        }
        slot.value.as_ref()
    }

    /// Mutably borrow the object behind `handle`.
    pub fn get_mut(&mut self, handle: BlockHandle) -> Option<&mut T> {
        let slot = self.slot_mut(handle.index)?;
        if slot.generation != handle.generation {
            return None;
        }
        slot.value.as_mut()
    }

    /// Iterate over live objects in slot order.
    pub fn iter(&self) -> impl Iterator<Item = (BlockHandle, &T)> {
        self.chunks
            .iter()
            .flatten()
            .enumerate()
            .filter_map(|(index, slot)| {
                slot.value.as_ref().map(|value| {
                    (
                        BlockHandle {
                            index: index as u32,
                            generation: slot.generation,
                        },
                        value,
                    )
                })
            })
    }

    /// Drop every object. Outstanding handles become stale.
    pub fn clear(&mut self) -> Vec<T> {
        let mut drained = Vec::with_capacity(self.len);
        for (chunk_index, chunk) in self.chunks.iter_mut().enumerate() {
            for (i, slot) in chunk.iter_mut().enumerate() {
                if let Some(value) = slot.value.take() {
                    slot.generation = slot.generation.wrapping_add(1);
                    self.free.push((chunk_index * self.chunk_len + i) as u32);
                    drained.push(value);
                }
            }
        }
        self.len = 0;
        drained
    }

    fn slot(&self, index: u32) -> Option<&Slot<T>> {
        let index = index as usize;
        self.chunks
            .get(index / self.chunk_len)?
            .get(index % self.chunk_len)
    }

    fn slot_mut(&mut self, index: u32) -> Option<&mut Slot<T>> {
        let index = index as usize;
        self.chunks
            .get_mut(index / self.chunk_len)?
            .get_mut(index % self.chunk_len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_and_get() {
        let mut pool = BlockAllocator::new(1024);
        let a = pool.alloc(String::from("a"));
        let b = pool.alloc(String::from("b"));

        assert_eq!(pool.len(), 2);
        assert_eq!(pool.get(a).map(String::as_str), Some("a"));
        assert_eq!(pool.get(b).map(String::as_str), Some("b"));
    }

    #[test]
    fn dealloc_clears_handle_and_reuses_slot() {
        let mut pool = BlockAllocator::new(1024);
        let first = pool.alloc(1u64);
        let _second = pool.alloc(2u64);

        let mut handle = Some(first);
        assert_eq!(pool.dealloc(&mut handle), Some(1));
        assert!(handle.is_none());
        assert_eq!(pool.len(), 1);

        let third = pool.alloc(3u64);
        assert_eq!(third.index(), first.index());
        assert!(pool.get(first).is_none(), "old handle must be stale");
        assert_eq!(pool.get(third), Some(&3));
    }

    #[test]
    fn stale_dealloc_is_ignored() {
        let mut pool = BlockAllocator::new(64);
        let h = pool.alloc(7u32);

        let mut first = Some(h);
        let mut second = Some(h);
        assert_eq!(pool.dealloc(&mut first), Some(7));
        assert_eq!(pool.dealloc(&mut second), None);
        assert_eq!(second, Some(h));
        assert!(pool.dealloc(&mut None).is_none());
        assert!(pool.is_empty());
    }

    #[test]
    fn grows_past_heap_hint_without_moving() {
        let mut pool = BlockAllocator::new(4 * mem::size_of::<Slot<u64>>());
        assert_eq!(pool.chunk_len(), 4);

        let first = pool.alloc(0u64);
        let address = pool.get(first).unwrap() as *const u64;

        let handles: Vec<_> = (1..100u64).map(|i| pool.alloc(i)).collect();
        assert_eq!(pool.len(), 100);
        assert!(pool.capacity() >= 100);
        assert_eq!(pool.get(first).unwrap() as *const u64, address);
        assert_eq!(pool.get(handles[98]), Some(&99));
    }

    #[test]
    fn clear_returns_everything() {
        let mut pool = BlockAllocator::new(16);
        let handles: Vec<_> = (0..10u8).map(|i| pool.alloc(i)).collect();

        let mut drained = pool.clear();
        drained.sort_unstable();
        assert_eq!(drained, (0..10).collect::<Vec<_>>());
        assert!(pool.is_empty());
        assert!(handles.iter().all(|&h| !pool.contains(h)));
        assert_eq!(pool.iter().count(), 0);
    }
}
