//! GPU buffers.

use ash::vk;
use bitflags::bitflags;
use bytemuck::Pod;

use crate::backend::GraphicsBackend;
use crate::error::{GpuError, Result};
use crate::graphics::InitContext;
use crate::memory::{DedicatedTarget, GpuAllocation, GpuMemoryAllocator, MemoryRequest};
use crate::object::{ObjectKind, Resource, ResourceInfo, TypedResource};

bitflags! {
    /// How a buffer is bound in shaders.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct BufferUsage: u32 {
        const UNIFORM  = 0b0_0001;
        const STORAGE  = 0b0_0010;
        const INDEX    = 0b0_0100;
        const VERTEX   = 0b0_1000;
        const INDIRECT = 0b1_0000;
    }
}

impl BufferUsage {
    /// Vulkan usage flags, transfers always allowed.
    pub fn to_vk(self) -> vk::BufferUsageFlags {
        let mut flags = vk::BufferUsageFlags::TRANSFER_SRC | vk::BufferUsageFlags::TRANSFER_DST;
        if self.contains(Self::UNIFORM) {
            flags |= vk::BufferUsageFlags::UNIFORM_BUFFER;
        }
        if self.contains(Self::STORAGE) {
            flags |= vk::BufferUsageFlags::STORAGE_BUFFER;
        }
        if self.contains(Self::INDEX) {
            flags |= vk::BufferUsageFlags::INDEX_BUFFER;
        }
        if self.contains(Self::VERTEX) {
            flags |= vk::BufferUsageFlags::VERTEX_BUFFER;
        }
        if self.contains(Self::INDIRECT) {
            flags |= vk::BufferUsageFlags::INDIRECT_BUFFER;
        }
        flags
    }
}

/// Creation parameters for a [`GpuBuffer`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GpuBufferInfo {
    pub size: u64,
    pub usage: BufferUsage,
    /// Place the buffer in mapped host-visible memory.
    pub host_visible: bool,
}

impl GpuBufferInfo {
    /// Device-local buffer of `size` bytes.
    pub fn new(size: u64, usage: BufferUsage) -> Self {
        Self {
            size,
            usage,
            host_visible: false,
        }
    }

    /// Request host-visible memory.
    pub fn host_visible(mut self, host_visible: bool) -> Self {
        self.host_visible = host_visible;
        self
    }

    fn memory_properties(&self) -> vk::MemoryPropertyFlags {
        if self.host_visible {
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT
        } else {
            vk::MemoryPropertyFlags::DEVICE_LOCAL
        }
    }
}

/// A buffer with bound memory.
#[derive(Debug)]
pub struct GpuBuffer {
    buffer: vk::Buffer,
    size: u64,
    usage: BufferUsage,
    allocation: Option<GpuAllocation>,
}

impl GpuBuffer {
    /// Native buffer handle.
    pub fn buffer(&self) -> vk::Buffer {
        self.buffer
    }

    /// Requested size in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Usage the buffer was created with.
    pub fn usage(&self) -> BufferUsage {
        self.usage
    }

    /// Memory backing the buffer.
    pub fn allocation(&self) -> Option<&GpuAllocation> {
        self.allocation.as_ref()
    }

    /// True if the buffer can be written from the CPU.
    pub fn is_host_visible(&self) -> bool {
        self.allocation
            .as_ref()
            .is_some_and(|a| a.mapped().is_some())
    }

    /// Write plain data at a byte offset.
    pub fn write<T: Pod>(&self, offset: u64, data: &[T]) -> Result<()> {
        let bytes: &[u8] = bytemuck::cast_slice(data);
        self.mapped_allocation(offset, bytes.len())?
            .write_bytes(offset, bytes)
    }

    /// Read plain data from a byte offset.
    pub fn read<T: Pod>(&self, offset: u64, out: &mut [T]) -> Result<()> {
        let bytes: &mut [u8] = bytemuck::cast_slice_mut(out);
        self.mapped_allocation(offset, bytes.len())?
            .read_bytes(offset, bytes)
    }

    fn mapped_allocation(&self, offset: u64, len: usize) -> Result<&GpuAllocation> {
        // The allocation may be padded past the buffer size.
        let in_range = offset
            .checked_add(len as u64)
            .is_some_and(|end| end <= self.size);
        if !in_range {
            return Err(GpuError::MapOutOfRange {
                offset,
                len: len as u64,
                size: self.size,
            });
        }
        self.allocation
            .as_ref()
            .ok_or_else(|| GpuError::InvalidState("Buffer was released".to_string()))
    }
}

impl Resource for GpuBuffer {
    fn release(
        &mut self,
        backend: &mut dyn GraphicsBackend,
        memory: &mut GpuMemoryAllocator,
    ) -> Result<()> {
        backend.destroy_buffer(self.buffer);
        match self.allocation.take() {
            Some(allocation) => memory.free(backend, allocation),
            None => Ok(()),
        }
    }
}

impl TypedResource for GpuBuffer {
    const KIND: ObjectKind = ObjectKind::Buffer;
}

impl ResourceInfo for GpuBufferInfo {
    type Resource = GpuBuffer;

    fn init(self, ctx: &mut InitContext<'_>) -> Result<GpuBuffer> {
        if self.size == 0 {
            return Err(GpuError::InvalidDescription("Buffer size is zero".to_string()));
        }
        if self.usage.is_empty() {
            return Err(GpuError::InvalidDescription("Buffer has no usage".to_string()));
        }

        let name = ctx.name();
        let buffer = ctx.backend.create_buffer(self.size, self.usage.to_vk())?;

        let needs = ctx.backend.buffer_memory_needs(buffer);
        let request = MemoryRequest::for_resource(
            needs,
            self.memory_properties(),
            DedicatedTarget::Buffer(buffer),
        );

        let allocation = match ctx.memory.alloc(ctx.backend, &request, name) {
            Ok(allocation) => allocation,
            Err(e) => {
                ctx.backend.destroy_buffer(buffer);
                return Err(e);
            }
        };

        if let Err(e) = ctx
            .backend
            .bind_buffer_memory(buffer, allocation.memory(), allocation.offset())
        {
            ctx.backend.destroy_buffer(buffer);
            ctx.memory.free(ctx.backend, allocation)?;
            return Err(e);
        }

        Ok(GpuBuffer {
            buffer,
            size: self.size,
            usage: self.usage,
            allocation: Some(allocation),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{HostBackend, HostBackendConfig};
    use crate::graphics::{Graphics, GraphicsConfig};
    use crate::object::DestroyOutcome;

    fn graphics() -> Graphics<HostBackend> {
        let config = GraphicsConfig::default()
            .with_heap_size(4096)
            .with_default_block_size(1 << 20);
        Graphics::new(config, HostBackend::default()).unwrap()
    }

    #[test]
    fn usage_maps_to_vulkan_flags() {
        let flags = (BufferUsage::VERTEX | BufferUsage::INDEX).to_vk();
        assert!(flags.contains(vk::BufferUsageFlags::VERTEX_BUFFER));
        assert!(flags.contains(vk::BufferUsageFlags::INDEX_BUFFER));
        assert!(!flags.contains(vk::BufferUsageFlags::UNIFORM_BUFFER));
    }

    #[test]
    fn buffer_is_bound_to_its_allocation() {
        let mut g = graphics();
        let handle = g
            .create("vertices", GpuBufferInfo::new(1000, BufferUsage::VERTEX))
            .unwrap();

        let buffer = g.resource(handle).unwrap();
        let allocation = buffer.allocation().unwrap();
        assert_eq!(
            g.backend().buffer_binding(buffer.buffer()),
            Some((allocation.memory(), allocation.offset()))
        );
        assert!(!buffer.is_host_visible());
        assert_eq!(g.memory().allocation_count(), 1);
    }

    #[test]
    fn host_visible_buffer_round_trips_data() {
        let mut g = graphics();
        let info = GpuBufferInfo::new(64, BufferUsage::UNIFORM).host_visible(true);
        let handle = g.create("uniforms", info).unwrap();
        let buffer = g.resource(handle).unwrap();

        buffer.write(16, &[1.0f32, 2.0, 3.0, 4.0]).unwrap();
        let mut out = [0.0f32; 4];
        buffer.read(16, &mut out).unwrap();
        assert_eq!(out, [1.0, 2.0, 3.0, 4.0]);

        assert!(matches!(
            buffer.write(60, &[0u32; 2]),
            Err(GpuError::MapOutOfRange { .. })
        ));
    }

    #[test]
    fn offset_near_u64_max_is_out_of_range() {
        let mut g = graphics();
        let info = GpuBufferInfo::new(64, BufferUsage::UNIFORM).host_visible(true);
        let handle = g.create("uniforms", info).unwrap();
        let buffer = g.resource(handle).unwrap();

        assert!(matches!(
            buffer.write(u64::MAX, &[1u8]),
            Err(GpuError::MapOutOfRange { offset: u64::MAX, .. })
        ));
        let mut out = [0u8; 4];
        assert!(matches!(
            buffer.read(u64::MAX - 1, &mut out),
            Err(GpuError::MapOutOfRange { .. })
        ));
    }

    #[test]
    fn device_local_buffer_is_not_writable() {
        let mut g = graphics();
        let handle = g
            .create("storage", GpuBufferInfo::new(64, BufferUsage::STORAGE))
            .unwrap();
        assert!(matches!(
            g.resource(handle).unwrap().write(0, &[1u8]),
            Err(GpuError::NotMapped)
        ));
    }

    #[test]
    fn invalid_descriptions_are_rejected() {
        let mut g = graphics();
        assert!(g.create("empty", GpuBufferInfo::new(0, BufferUsage::UNIFORM)).is_err());
        assert!(g.create("unused", GpuBufferInfo::new(64, BufferUsage::empty())).is_err());
        assert_eq!(g.object_count(), 0);
    }

    #[test]
    fn out_of_memory_leaves_no_buffer_behind() {
        let backend = HostBackend::new(HostBackendConfig {
            heaps: vec![1 << 16, 1 << 16],
            ..HostBackendConfig::default()
        });
        let config = GraphicsConfig::default().with_default_block_size(1 << 16);
        let mut g = Graphics::new(config, backend).unwrap();

        let err = g
            .create("huge", GpuBufferInfo::new(1 << 20, BufferUsage::STORAGE))
            .unwrap_err();
        assert!(matches!(err, GpuError::ResourceInit { .. }));
        assert_eq!(g.backend().live_buffer_count(), 0);
        assert_eq!(g.object_count(), 0);
    }

    #[test]
    fn destroy_returns_memory() {
        let mut g = graphics();
        let mut first = Some(g.create("a", GpuBufferInfo::new(512, BufferUsage::STORAGE)).unwrap());
        let second = g.create("b", GpuBufferInfo::new(512, BufferUsage::STORAGE)).unwrap();
        let offset = g.resource(second).unwrap().allocation().unwrap().offset();
        assert_eq!(offset, 512);

        assert_eq!(g.destroy(&mut first), DestroyOutcome::Freed);
        assert_eq!(g.backend().live_buffer_count(), 1);
        assert_eq!(g.memory().allocated_bytes(), 512);

        let third = g.create("c", GpuBufferInfo::new(512, BufferUsage::STORAGE)).unwrap();
        assert_eq!(g.resource(third).unwrap().allocation().unwrap().offset(), 0);
    }
}
