//! GPU memory management.
//!
//! Device memory is grabbed in large blocks and carved up with a
//! [`VirtualBlockAllocator`] per block. Resources that must own their memory
//! get a dedicated block sized exactly to them. Host-visible blocks are mapped
//! once when they are created and stay mapped until released.

use std::cell::Cell;
use std::fmt;
use std::ptr::NonNull;
use std::rc::Rc;

use ash::vk;
use osomi_core::{BlockAllocation, VirtualBlockAllocator};
use tracing::{debug, warn};

use crate::backend::{GraphicsBackend, MemoryNeeds};
use crate::error::{GpuError, Result};

/// Default size of pooled memory blocks (64 MiB).
pub const DEFAULT_BLOCK_SIZE: u64 = 64 << 20;

/// Identifier of a memory block inside one [`GpuMemoryAllocator`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GpuBlockId(u32);

impl fmt::Display for GpuBlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "block#{}", self.0)
    }
}

/// The single resource a dedicated block is created for.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DedicatedTarget {
    Buffer(vk::Buffer),
    Image(vk::Image),
}

/// Whether a request wants its own memory block.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum DedicatedRequirement {
    /// Share pooled blocks.
    #[default]
    None,
    /// The driver recommends a dedicated block.
    Preferred(DedicatedTarget),
    /// The resource cannot share memory.
    Required(DedicatedTarget),
}

/// A memory request for one resource.
#[derive(Clone, Copy, Debug)]
pub struct MemoryRequest {
    pub requirements: vk::MemoryRequirements,
    /// Property flags the chosen memory type must have.
    pub properties: vk::MemoryPropertyFlags,
    pub dedicated: DedicatedRequirement,
}

impl MemoryRequest {
    /// A pooled request.
    pub fn new(requirements: vk::MemoryRequirements, properties: vk::MemoryPropertyFlags) -> Self {
        Self {
            requirements,
            properties,
            dedicated: DedicatedRequirement::None,
        }
    }

    /// Build a request from what the backend reported for `target`.
    pub fn for_resource(
        needs: MemoryNeeds,
        properties: vk::MemoryPropertyFlags,
        target: DedicatedTarget,
    ) -> Self {
        let dedicated = if needs.requires_dedicated {
            DedicatedRequirement::Required(target)
        } else if needs.prefers_dedicated {
            DedicatedRequirement::Preferred(target)
        } else {
            DedicatedRequirement::None
        };

        Self {
            requirements: needs.requirements,
            properties,
            dedicated,
        }
    }

    /// The resource this request wants a dedicated block for, if any.
    pub fn dedicated_target(&self) -> Option<DedicatedTarget> {
        match self.dedicated {
            DedicatedRequirement::None => None,
            DedicatedRequirement::Preferred(target) | DedicatedRequirement::Required(target) => {
                Some(target)
            }
        }
    }
}

/// Host pointer to the mapped sub-range of an allocation.
#[derive(Clone, Copy, Debug)]
pub struct MappedRange {
    ptr: NonNull<u8>,
    len: usize,
}

impl MappedRange {
    /// Start of the mapped range.
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    /// Length in bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    /// True for zero-length ranges.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// One device memory allocation, sub-allocated by range.
pub struct GpuMemoryBlock {
    id: GpuBlockId,
    memory: vk::DeviceMemory,
    memory_type_index: u32,
    heap_index: u32,
    properties: vk::MemoryPropertyFlags,
    allocator: VirtualBlockAllocator,
    mapped: Option<NonNull<u8>>,
    dedicated: Option<DedicatedTarget>,
    is_default: bool,
    /// Shared with every allocation; cleared when the block is released.
    live: Rc<Cell<bool>>,
}

impl GpuMemoryBlock {
    /// Block identifier.
    pub fn id(&self) -> GpuBlockId {
        self.id
    }

    /// Native memory handle.
    pub fn memory(&self) -> vk::DeviceMemory {
        self.memory
    }

    /// Memory type the block was allocated from.
    pub fn memory_type_index(&self) -> u32 {
        self.memory_type_index
    }

    /// Heap backing the memory type.
    pub fn heap_index(&self) -> u32 {
        self.heap_index
    }

    /// Property flags of the block's memory type.
    pub fn properties(&self) -> vk::MemoryPropertyFlags {
        self.properties
    }

    /// Size of the block in bytes.
    pub fn size(&self) -> u64 {
        self.allocator.size()
    }

    /// Range bookkeeping for the block.
    pub fn allocator(&self) -> &VirtualBlockAllocator {
        &self.allocator
    }

    /// True if the block is persistently mapped.
    pub fn is_mapped(&self) -> bool {
        self.mapped.is_some()
    }

    /// True if the block exists for a single resource.
    pub fn is_dedicated(&self) -> bool {
        self.dedicated.is_some()
    }

    /// True for the first pooled block of a memory type; it is never released early.
    pub fn is_default(&self) -> bool {
        self.is_default
    }

    /// Whether this block can serve `request`.
    ///
    /// The request's memory type bits must include the block's type, the
    /// block's flags must cover the requested ones, and dedicated state must
    /// agree: a dedicated block only takes its own resource and only while
    /// empty, a pooled block never takes a dedicated request.
    pub fn compatible(&self, request: &MemoryRequest) -> bool {
        let type_bit = 1 << self.memory_type_index;
        let type_matches = request.requirements.memory_type_bits & type_bit != 0;
        let flags_match = self.properties.contains(request.properties);

        let dedicated_matches = match (self.dedicated, request.dedicated_target()) {
            (None, None) => true,
            (Some(own), Some(wanted)) => own == wanted && self.allocator.is_empty(),
            _ => false,
        };

        type_matches && flags_match && dedicated_matches
    }

    fn allocation(&self, range: BlockAllocation) -> GpuAllocation {
        let mapped = self.mapped.map(|base| MappedRange {
            // The range lies inside the mapped block.
            ptr: unsafe { NonNull::new_unchecked(base.as_ptr().add(range.offset as usize)) },
            len: range.size as usize,
        });

        GpuAllocation {
            block: self.id,
            memory: self.memory,
            range,
            mapped,
            block_live: Rc::clone(&self.live),
        }
    }
}

impl fmt::Debug for GpuMemoryBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GpuMemoryBlock")
            .field("id", &self.id)
            .field("memory_type_index", &self.memory_type_index)
            .field("size", &self.allocator.size())
            .field("used", &self.allocator.used_space())
            .field("mapped", &self.mapped.is_some())
            .field("dedicated", &self.dedicated)
            .field("is_default", &self.is_default)
            .finish()
    }
}

/// A sub-range of a memory block owned by one resource.
///
/// Deliberately not `Clone`: handing the allocation back to
/// [`GpuMemoryAllocator::free`] consumes it.
#[derive(Debug)]
pub struct GpuAllocation {
    block: GpuBlockId,
    memory: vk::DeviceMemory,
    range: BlockAllocation,
    mapped: Option<MappedRange>,
    block_live: Rc<Cell<bool>>,
}

impl PartialEq for GpuAllocation {
    fn eq(&self, other: &Self) -> bool {
        self.block == other.block && self.range == other.range
    }
}

impl Eq for GpuAllocation {}

impl GpuAllocation {
    /// Block the allocation lives in.
    pub fn block(&self) -> GpuBlockId {
        self.block
    }

    /// Native memory to bind resources to.
    pub fn memory(&self) -> vk::DeviceMemory {
        self.memory
    }

    /// Byte offset inside the block.
    pub fn offset(&self) -> u64 {
        self.range.offset
    }

    /// Size in bytes.
    pub fn size(&self) -> u64 {
        self.range.size
    }

    /// Range inside the block.
    pub fn range(&self) -> BlockAllocation {
        self.range
    }

    /// Host view of the allocation, if its block is mapped and still alive.
    pub fn mapped(&self) -> Option<MappedRange> {
        self.mapped.filter(|_| self.block_live.get())
    }

    /// False once the allocator has released the block, e.g. by `shutdown`.
    pub fn is_live(&self) -> bool {
        self.block_live.get()
    }

    /// Copy `data` into the mapped allocation at `offset`.
    pub fn write_bytes(&self, offset: u64, data: &[u8]) -> Result<()> {
        let mapped = self.checked_range(offset, data.len())?;
        unsafe {
            std::ptr::copy_nonoverlapping(
                data.as_ptr(),
                mapped.as_ptr().add(offset as usize),
                data.len(),
            );
        }
        Ok(())
    }

    /// Copy from the mapped allocation at `offset` into `out`.
    pub fn read_bytes(&self, offset: u64, out: &mut [u8]) -> Result<()> {
        let mapped = self.checked_range(offset, out.len())?;
        unsafe {
            std::ptr::copy_nonoverlapping(
                mapped.as_ptr().add(offset as usize),
                out.as_mut_ptr(),
                out.len(),
            );
        }
        Ok(())
    }

    fn checked_range(&self, offset: u64, len: usize) -> Result<MappedRange> {
        if !self.block_live.get() {
            return Err(GpuError::InvalidState(format!("{} was released", self.block)));
        }
        let mapped = self.mapped.ok_or(GpuError::NotMapped)?;
        let in_range = offset
            .checked_add(len as u64)
            .is_some_and(|end| end <= self.range.size);
        if !in_range {
            return Err(GpuError::MapOutOfRange {
                offset,
                len: len as u64,
                size: self.range.size,
            });
        }
        Ok(mapped)
    }
}

/// Block-based GPU memory allocator.
pub struct GpuMemoryAllocator {
    properties: vk::PhysicalDeviceMemoryProperties,
    blocks: Vec<GpuMemoryBlock>,
    next_block: u32,
    default_block_size: u64,
}

impl GpuMemoryAllocator {
    /// Create an allocator for the device behind `backend`.
    pub fn new(backend: &dyn GraphicsBackend, default_block_size: u64) -> Self {
        Self {
            properties: backend.memory_properties(),
            blocks: Vec::new(),
            next_block: 0,
            default_block_size,
        }
    }

    /// Size used for new pooled blocks.
    pub fn default_block_size(&self) -> u64 {
        self.default_block_size
    }

    /// Live blocks in creation order.
    pub fn blocks(&self) -> &[GpuMemoryBlock] {
        &self.blocks
    }

    /// Look up a block.
    pub fn block(&self, id: GpuBlockId) -> Option<&GpuMemoryBlock> {
        self.blocks.iter().find(|b| b.id == id)
    }

    /// Number of live blocks.
    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    /// Number of live allocations across all blocks.
    pub fn allocation_count(&self) -> usize {
        self.blocks.iter().map(|b| b.allocator.allocation_count()).sum()
    }

    /// Bytes handed out to allocations.
    pub fn allocated_bytes(&self) -> u64 {
        self.blocks.iter().map(|b| b.allocator.used_space()).sum()
    }

    /// Bytes of device memory held by blocks.
    pub fn reserved_bytes(&self) -> u64 {
        self.blocks.iter().map(|b| b.allocator.size()).sum()
    }

    /// First memory type in `type_bits` whose flags contain `properties`.
    pub fn find_memory_type(
        &self,
        type_bits: u32,
        properties: vk::MemoryPropertyFlags,
    ) -> Option<u32> {
        (0..self.properties.memory_type_count).find(|&i| {
            type_bits & (1 << i) != 0
                && self.properties.memory_types[i as usize]
                    .property_flags
                    .contains(properties)
        })
    }

    /// Allocate memory for `request`.
    ///
    /// Existing compatible blocks are tried in creation order; when none has
    /// room a new block is created, sized to the request for dedicated
    /// requests and to at least the default block size otherwise.
    pub fn alloc(
        &mut self,
        backend: &mut dyn GraphicsBackend,
        request: &MemoryRequest,
        name: &str,
    ) -> Result<GpuAllocation> {
        let size = request.requirements.size;
        let alignment = request.requirements.alignment.max(1);
        if size == 0 {
            return Err(osomi_core::Error::ZeroSize.into());
        }
        if !alignment.is_power_of_two() {
            return Err(osomi_core::Error::InvalidAlignment(alignment).into());
        }

        for block in self.blocks.iter_mut().filter(|b| b.compatible(request)) {
            if let Ok(range) = block.allocator.alloc(size, alignment) {
                return Ok(block.allocation(range));
            }
        }

        let index = self.create_block(backend, request, name)?;
        match self.blocks[index].allocator.alloc(size, alignment) {
            Ok(range) => Ok(self.blocks[index].allocation(range)),
            Err(e) => {
                let block = self.blocks.remove(index);
                release_block(backend, &block);
                Err(e.into())
            }
        }
    }

    /// Return an allocation to its block.
    ///
    /// A block left empty is released to the device unless it is the default
    /// block of its memory type.
    pub fn free(
        &mut self,
        backend: &mut dyn GraphicsBackend,
        allocation: GpuAllocation,
    ) -> Result<()> {
        let index = self
            .blocks
            .iter()
            .position(|b| b.id == allocation.block)
            .ok_or_else(|| GpuError::InvalidFree(format!("{} is not live", allocation.block)))?;

        let block = &mut self.blocks[index];
        block.allocator.free(allocation.range)?;

        if block.allocator.is_empty() && !block.is_default {
            let block = self.blocks.remove(index);
            debug!(
                block = %block.id,
                size = block.size(),
                dedicated = block.is_dedicated(),
                "releasing memory block"
            );
            release_block(backend, &block);
        }

        Ok(())
    }

    /// Release every block, live allocations included.
    ///
    /// Allocations that outlive this call report [`GpuError::InvalidState`]
    /// on host access.
    pub fn shutdown(&mut self, backend: &mut dyn GraphicsBackend) {
        for block in self.blocks.drain(..) {
            if !block.allocator.is_empty() {
                warn!(
                    block = %block.id,
                    allocations = block.allocator.allocation_count(),
                    bytes = block.allocator.used_space(),
                    "memory block released with live allocations"
                );
            }
            release_block(backend, &block);
        }
    }

    fn create_block(
        &mut self,
        backend: &mut dyn GraphicsBackend,
        request: &MemoryRequest,
        name: &str,
    ) -> Result<usize> {
        let type_bits = request.requirements.memory_type_bits;
        let memory_type_index = self
            .find_memory_type(type_bits, request.properties)
            .ok_or(GpuError::NoCompatibleMemoryType {
                type_bits,
                properties: request.properties,
            })?;
        let memory_type = self.properties.memory_types[memory_type_index as usize];

        let dedicated = request.dedicated_target();
        let size = if dedicated.is_some() {
            request.requirements.size
        } else {
            request.requirements.size.max(self.default_block_size)
        };
        let is_default = dedicated.is_none()
            && !self
                .blocks
                .iter()
                .any(|b| b.is_default && b.memory_type_index == memory_type_index);

        let memory = backend.allocate_memory(size, memory_type_index, dedicated)?;

        let mapped = if memory_type
            .property_flags
            .contains(vk::MemoryPropertyFlags::HOST_VISIBLE)
        {
            match backend.map_memory(memory, size) {
                Ok(ptr) => Some(ptr),
                Err(e) => {
                    backend.free_memory(memory);
                    return Err(e);
                }
            }
        } else {
            None
        };

        let id = GpuBlockId(self.next_block);
        self.next_block += 1;

        debug!(
            block = %id,
            size,
            memory_type = memory_type_index,
            dedicated = dedicated.is_some(),
            is_default,
            "created memory block for {name}"
        );

        self.blocks.push(GpuMemoryBlock {
            id,
            memory,
            memory_type_index,
            heap_index: memory_type.heap_index,
            properties: memory_type.property_flags,
            allocator: VirtualBlockAllocator::new(size),
            mapped,
            dedicated,
            is_default,
            live: Rc::new(Cell::new(true)),
        });

        Ok(self.blocks.len() - 1)
    }
}

fn release_block(backend: &mut dyn GraphicsBackend, block: &GpuMemoryBlock) {
    block.live.set(false);
    if block.mapped.is_some() {
        backend.unmap_memory(block.memory);
    }
    backend.free_memory(block.memory);
}
