//! Backend that keeps every "device" object in host memory.
//!
//! Handles are plain counters and device memory is a boxed byte slice, so the
//! registry and allocator can run without a GPU. Heap budgets are enforced the
//! way a driver would and the next resource creation can be made to fail.

use std::cell::Cell;
use std::ptr::NonNull;

use ash::vk::{self, Handle};
use hashbrown::{HashMap, HashSet};
use tracing::{trace, warn};

use super::{GraphicsBackend, ImageDesc, MemoryNeeds, SurfaceTarget};
use crate::error::{GpuError, Result};
use crate::graphics::GraphicsFeature;
use crate::memory::DedicatedTarget;

const BUFFER_ALIGNMENT: u64 = 256;
const IMAGE_ALIGNMENT: u64 = 4096;

/// Shape of the emulated device.
#[derive(Clone, Debug)]
pub struct HostBackendConfig {
    /// Memory types as (flags, heap index).
    pub memory_types: Vec<(vk::MemoryPropertyFlags, u32)>,
    /// Heap sizes in bytes.
    pub heaps: Vec<u64>,
    /// Images at least this large must get dedicated memory.
    pub dedicated_threshold: u64,
    /// Optional features to report.
    pub features: Vec<GraphicsFeature>,
}

impl Default for HostBackendConfig {
    fn default() -> Self {
        let host = vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT;
        Self {
            memory_types: vec![
                (vk::MemoryPropertyFlags::DEVICE_LOCAL, 0),
                (host, 1),
                (vk::MemoryPropertyFlags::DEVICE_LOCAL | host, 0),
            ],
            heaps: vec![256 << 20, 256 << 20],
            dedicated_threshold: 16 << 20,
            features: Vec::new(),
        }
    }
}

struct HostMemory {
    data: Box<[u8]>,
    heap: u32,
    host_visible: bool,
    mapped: bool,
    dedicated: Option<DedicatedTarget>,
}

struct HostBuffer {
    size: u64,
    bound: Option<(vk::DeviceMemory, u64)>,
}

struct HostImage {
    desc: ImageDesc,
    size: u64,
    bound: Option<(vk::DeviceMemory, u64)>,
}

/// What a sampler was created with.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct HostSampler {
    pub min_filter: vk::Filter,
    pub mag_filter: vk::Filter,
    pub mipmap_mode: vk::SamplerMipmapMode,
    pub address_mode: vk::SamplerAddressMode,
    pub anisotropy: Option<f32>,
}

/// In-process [`GraphicsBackend`].
pub struct HostBackend {
    config: HostBackendConfig,
    next_handle: u64,
    heap_used: Vec<u64>,
    memory: HashMap<vk::DeviceMemory, HostMemory>,
    buffers: HashMap<vk::Buffer, HostBuffer>,
    images: HashMap<vk::Image, HostImage>,
    views: HashSet<vk::ImageView>,
    samplers: HashMap<vk::Sampler, HostSampler>,
    shader_modules: HashMap<vk::ShaderModule, usize>,
    surface: Option<(u32, u32)>,
    fail_next_resource: bool,
    wait_idle_calls: Cell<u32>,
}

impl HostBackend {
    /// Backend with the given memory layout and features.
    pub fn new(config: HostBackendConfig) -> Self {
        let heap_used = vec![0; config.heaps.len()];
        Self {
            config,
            next_handle: 1,
            heap_used,
            memory: HashMap::new(),
            buffers: HashMap::new(),
            images: HashMap::new(),
            views: HashSet::new(),
            samplers: HashMap::new(),
            shader_modules: HashMap::new(),
            surface: None,
            fail_next_resource: false,
            wait_idle_calls: Cell::new(0),
        }
    }

    /// Make the next buffer, image, sampler or shader module creation fail.
    pub fn fail_next_resource(&mut self) {
        self.fail_next_resource = true;
    }

    /// Bytes allocated from a heap.
    pub fn heap_usage(&self, heap: u32) -> u64 {
        self.heap_used.get(heap as usize).copied().unwrap_or(0)
    }

    /// Device memory allocations not yet freed.
    pub fn live_memory_count(&self) -> usize {
        self.memory.len()
    }

    /// Live memory blocks created for a single resource.
    pub fn dedicated_memory_count(&self) -> usize {
        self.memory.values().filter(|m| m.dedicated.is_some()).count()
    }

    /// Buffers not yet destroyed.
    pub fn live_buffer_count(&self) -> usize {
        self.buffers.len()
    }

    /// Images not yet destroyed.
    pub fn live_image_count(&self) -> usize {
        self.images.len()
    }

    /// Image views not yet destroyed.
    pub fn live_view_count(&self) -> usize {
        self.views.len()
    }

    /// Samplers not yet destroyed.
    pub fn live_sampler_count(&self) -> usize {
        self.samplers.len()
    }

    /// Shader modules not yet destroyed.
    pub fn live_shader_module_count(&self) -> usize {
        self.shader_modules.len()
    }

    /// Memory and offset a buffer is bound to.
    pub fn buffer_binding(&self, buffer: vk::Buffer) -> Option<(vk::DeviceMemory, u64)> {
        self.buffers.get(&buffer).and_then(|b| b.bound)
    }

    /// Memory and offset an image is bound to.
    pub fn image_binding(&self, image: vk::Image) -> Option<(vk::DeviceMemory, u64)> {
        self.images.get(&image).and_then(|i| i.bound)
    }

    /// Parameters of a live sampler.
    pub fn sampler(&self, sampler: vk::Sampler) -> Option<HostSampler> {
        self.samplers.get(&sampler).copied()
    }

    /// Word count of a live shader module.
    pub fn shader_module_words(&self, module: vk::ShaderModule) -> Option<usize> {
        self.shader_modules.get(&module).copied()
    }

    /// Size of the current surface.
    pub fn surface_extent(&self) -> Option<(u32, u32)> {
        self.surface
    }

    /// Number of `wait_idle` calls so far.
    pub fn wait_idle_count(&self) -> u32 {
        self.wait_idle_calls.get()
    }

    /// True when nothing created through this backend is still alive.
    pub fn is_clean(&self) -> bool {
        self.memory.is_empty()
            && self.buffers.is_empty()
            && self.images.is_empty()
            && self.views.is_empty()
            && self.samplers.is_empty()
            && self.shader_modules.is_empty()
    }

    fn handle<H: Handle>(&mut self) -> H {
        let raw = self.next_handle;
        self.next_handle += 1;
        H::from_raw(raw)
    }

    fn check_injected_failure(&mut self) -> Result<()> {
        if std::mem::take(&mut self.fail_next_resource) {
            return Err(GpuError::Vulkan(vk::Result::ERROR_INITIALIZATION_FAILED));
        }
        Ok(())
    }

    fn type_bits_where(&self, wanted: vk::MemoryPropertyFlags) -> u32 {
        self.config
            .memory_types
            .iter()
            .enumerate()
            .filter(|(_, (flags, _))| flags.contains(wanted))
            .fold(0, |bits, (i, _)| bits | (1 << i))
    }

    fn check_binding(&self, memory: vk::DeviceMemory, offset: u64, size: u64) -> Result<()> {
        let block = self
            .memory
            .get(&memory)
            .ok_or_else(|| {
                GpuError::InvalidState(format!("Binding to unknown memory {memory:?}"))
            })?;
        if offset + size > block.data.len() as u64 {
            return Err(GpuError::InvalidState(format!(
                "Binding [{offset}, {}) past end of {} byte memory",
                offset + size,
                block.data.len()
            )));
        }
        Ok(())
    }
}

impl Default for HostBackend {
    fn default() -> Self {
        Self::new(HostBackendConfig::default())
    }
}

/// Bytes per texel for the formats the resources use.
fn texel_size(format: vk::Format) -> u64 {
    match format {
        vk::Format::R8_UNORM | vk::Format::S8_UINT => 1,
        vk::Format::R8G8_UNORM | vk::Format::D16_UNORM | vk::Format::R16_SFLOAT => 2,
        vk::Format::R16G16B16A16_SFLOAT | vk::Format::R32G32_SFLOAT => 8,
        vk::Format::R32G32B32A32_SFLOAT => 16,
        _ => 4,
    }
}

impl GraphicsBackend for HostBackend {
    fn memory_properties(&self) -> vk::PhysicalDeviceMemoryProperties {
        let mut props = vk::PhysicalDeviceMemoryProperties::default();

        let types = self.config.memory_types.iter().take(vk::MAX_MEMORY_TYPES);
        for (i, &(property_flags, heap_index)) in types.enumerate() {
            props.memory_types[i] = vk::MemoryType {
                property_flags,
                heap_index,
            };
            props.memory_type_count = i as u32 + 1;
        }

        let heaps = self.config.heaps.iter().take(vk::MAX_MEMORY_HEAPS);
        for (i, &size) in heaps.enumerate() {
            let flags = if i == 0 {
                vk::MemoryHeapFlags::DEVICE_LOCAL
            } else {
                vk::MemoryHeapFlags::empty()
            };
            props.memory_heaps[i] = vk::MemoryHeap { size, flags };
            props.memory_heap_count = i as u32 + 1;
        }

        props
    }

    fn supports(&self, feature: GraphicsFeature) -> bool {
        self.config.features.contains(&feature)
    }

    fn allocate_memory(
        &mut self,
        size: u64,
        memory_type_index: u32,
        dedicated: Option<DedicatedTarget>,
    ) -> Result<vk::DeviceMemory> {
        let &(flags, heap) = self
            .config
            .memory_types
            .get(memory_type_index as usize)
            .ok_or_else(|| GpuError::InvalidState(format!("No memory type {memory_type_index}")))?;

        let budget = self.config.heaps.get(heap as usize).copied().unwrap_or(0);
        let used = self.heap_used.get(heap as usize).copied().unwrap_or(0);
        if used + size > budget {
            return Err(GpuError::OutOfDeviceMemory {
                heap,
                requested: size,
            });
        }

        let memory = self.handle();
        self.memory.insert(
            memory,
            HostMemory {
                data: vec![0; size as usize].into_boxed_slice(),
                heap,
                host_visible: flags.contains(vk::MemoryPropertyFlags::HOST_VISIBLE),
                mapped: false,
                dedicated,
            },
        );
        self.heap_used[heap as usize] += size;

        trace!(?memory, size, memory_type_index, "allocated host memory");
        Ok(memory)
    }

    fn free_memory(&mut self, memory: vk::DeviceMemory) {
        let Some(block) = self.memory.remove(&memory) else {
            warn!(?memory, "freeing unknown memory");
            return;
        };
        if block.mapped {
            warn!(?memory, "freeing memory that is still mapped");
        }
        self.heap_used[block.heap as usize] -= block.data.len() as u64;
    }

    fn map_memory(&mut self, memory: vk::DeviceMemory, _size: u64) -> Result<NonNull<u8>> {
        let block = self
            .memory
            .get_mut(&memory)
            .ok_or_else(|| GpuError::InvalidState(format!("Mapping unknown memory {memory:?}")))?;
        if !block.host_visible {
            return Err(GpuError::InvalidState(format!("{memory:?} is not host visible")));
        }
        if block.mapped {
            return Err(GpuError::InvalidState(format!("{memory:?} is already mapped")));
        }
        block.mapped = true;
        Ok(NonNull::from(&mut block.data[..]).cast())
    }

    fn unmap_memory(&mut self, memory: vk::DeviceMemory) {
        match self.memory.get_mut(&memory) {
            Some(block) => block.mapped = false,
            None => warn!(?memory, "unmapping unknown memory"),
        }
    }

    fn create_buffer(&mut self, size: u64, _usage: vk::BufferUsageFlags) -> Result<vk::Buffer> {
        self.check_injected_failure()?;
        if size == 0 {
            return Err(GpuError::InvalidDescription("Buffer size is zero".to_string()));
        }

        let buffer = self.handle();
        self.buffers.insert(buffer, HostBuffer { size, bound: None });
        Ok(buffer)
    }

    fn buffer_memory_needs(&self, buffer: vk::Buffer) -> MemoryNeeds {
        let size = self.buffers.get(&buffer).map_or(0, |b| b.size);
        MemoryNeeds {
            requirements: vk::MemoryRequirements {
                size,
                alignment: BUFFER_ALIGNMENT,
                memory_type_bits: self.type_bits_where(vk::MemoryPropertyFlags::empty()),
            },
            prefers_dedicated: false,
            requires_dedicated: false,
        }
    }

    fn bind_buffer_memory(
        &mut self,
        buffer: vk::Buffer,
        memory: vk::DeviceMemory,
        offset: u64,
    ) -> Result<()> {
        let size = self
            .buffers
            .get(&buffer)
            .ok_or_else(|| GpuError::InvalidState(format!("Binding unknown buffer {buffer:?}")))?
            .size;
        self.check_binding(memory, offset, size)?;

        if let Some(state) = self.buffers.get_mut(&buffer) {
            state.bound = Some((memory, offset));
        }
        Ok(())
    }

    fn destroy_buffer(&mut self, buffer: vk::Buffer) {
        if self.buffers.remove(&buffer).is_none() {
            warn!(?buffer, "destroying unknown buffer");
        }
    }

    fn create_image(&mut self, desc: &ImageDesc) -> Result<vk::Image> {
        self.check_injected_failure()?;
        if desc.width == 0 || desc.height == 0 {
            return Err(GpuError::InvalidDescription(format!(
                "Image extent {}x{} is empty",
                desc.width, desc.height
            )));
        }

        let size = u64::from(desc.width) * u64::from(desc.height) * texel_size(desc.format);
        let image = self.handle();
        self.images.insert(
            image,
            HostImage {
                desc: *desc,
                size,
                bound: None,
            },
        );
        Ok(image)
    }

    fn image_memory_needs(&self, image: vk::Image) -> MemoryNeeds {
        let size = self.images.get(&image).map_or(0, |i| i.size);
        let requires_dedicated = size >= self.config.dedicated_threshold;
        MemoryNeeds {
            requirements: vk::MemoryRequirements {
                size,
                alignment: IMAGE_ALIGNMENT,
                memory_type_bits: self.type_bits_where(vk::MemoryPropertyFlags::DEVICE_LOCAL),
            },
            prefers_dedicated: requires_dedicated,
            requires_dedicated,
        }
    }

    fn bind_image_memory(
        &mut self,
        image: vk::Image,
        memory: vk::DeviceMemory,
        offset: u64,
    ) -> Result<()> {
        let size = self
            .images
            .get(&image)
            .ok_or_else(|| GpuError::InvalidState(format!("Binding unknown image {image:?}")))?
            .size;
        self.check_binding(memory, offset, size)?;

        if let Some(state) = self.images.get_mut(&image) {
            state.bound = Some((memory, offset));
        }
        Ok(())
    }

    fn create_image_view(
        &mut self,
        image: vk::Image,
        format: vk::Format,
        _aspect: vk::ImageAspectFlags,
    ) -> Result<vk::ImageView> {
        let state = self
            .images
            .get(&image)
            .ok_or_else(|| GpuError::InvalidState(format!("View of unknown image {image:?}")))?;
        if state.bound.is_none() {
            return Err(GpuError::InvalidState(format!("{image:?} has no memory bound")));
        }
        if state.desc.format != format {
            return Err(GpuError::InvalidDescription(format!(
                "View format {format:?} differs from image format {:?}",
                state.desc.format
            )));
        }

        let view = self.handle();
        self.views.insert(view);
        Ok(view)
    }

    fn destroy_image_view(&mut self, view: vk::ImageView) {
        if !self.views.remove(&view) {
            warn!(?view, "destroying unknown image view");
        }
    }

    fn destroy_image(&mut self, image: vk::Image) {
        if self.images.remove(&image).is_none() {
            warn!(?image, "destroying unknown image");
        }
    }

    fn create_sampler(&mut self, info: &vk::SamplerCreateInfo<'_>) -> Result<vk::Sampler> {
        self.check_injected_failure()?;

        let sampler = self.handle();
        self.samplers.insert(
            sampler,
            HostSampler {
                min_filter: info.min_filter,
                mag_filter: info.mag_filter,
                mipmap_mode: info.mipmap_mode,
                address_mode: info.address_mode_u,
                anisotropy: (info.anisotropy_enable == vk::TRUE).then_some(info.max_anisotropy),
            },
        );
        Ok(sampler)
    }

    fn destroy_sampler(&mut self, sampler: vk::Sampler) {
        if self.samplers.remove(&sampler).is_none() {
            warn!(?sampler, "destroying unknown sampler");
        }
    }

    fn create_shader_module(&mut self, code: &[u32]) -> Result<vk::ShaderModule> {
        self.check_injected_failure()?;
        if code.is_empty() {
            return Err(GpuError::InvalidDescription("Shader code is empty".to_string()));
        }

        let module = self.handle();
        self.shader_modules.insert(module, code.len());
        Ok(module)
    }

    fn destroy_shader_module(&mut self, module: vk::ShaderModule) {
        if self.shader_modules.remove(&module).is_none() {
            warn!(?module, "destroying unknown shader module");
        }
    }

    fn init_surface(&mut self, target: &SurfaceTarget) -> Result<()> {
        if target.width == 0 || target.height == 0 {
            return Err(GpuError::SurfaceCreation(format!(
                "Window extent {}x{} is empty",
                target.width, target.height
            )));
        }
        self.surface = Some((target.width, target.height));
        Ok(())
    }

    fn destroy_surface(&mut self) {
        self.surface = None;
    }

    fn wait_idle(&self) -> Result<()> {
        self.wait_idle_calls.set(self.wait_idle_calls.get() + 1);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reports_configured_memory_layout() {
        let backend = HostBackend::default();
        let props = backend.memory_properties();

        assert_eq!(props.memory_type_count, 3);
        assert_eq!(props.memory_heap_count, 2);
        assert!(props.memory_types[1]
            .property_flags
            .contains(vk::MemoryPropertyFlags::HOST_VISIBLE));
        assert_eq!(props.memory_types[2].heap_index, 0);
        assert_eq!(props.memory_heaps[0].size, 256 << 20);
    }

    #[test]
    fn heap_budget_is_enforced() {
        let mut backend = HostBackend::new(HostBackendConfig {
            heaps: vec![1024, 1024],
            ..HostBackendConfig::default()
        });

        let a = backend.allocate_memory(1000, 0, None).unwrap();
        assert!(matches!(
            backend.allocate_memory(100, 2, None),
            Err(GpuError::OutOfDeviceMemory { heap: 0, requested: 100 })
        ));
        backend.allocate_memory(100, 1, None).unwrap();

        backend.free_memory(a);
        assert_eq!(backend.heap_usage(0), 0);
        assert_eq!(backend.heap_usage(1), 100);
    }

    #[test]
    fn mapping_exposes_block_bytes() {
        let mut backend = HostBackend::default();
        let memory = backend.allocate_memory(64, 1, None).unwrap();
        let ptr = backend.map_memory(memory, 64).unwrap();

        unsafe { ptr.as_ptr().add(3).write(9) };
        assert!(backend.map_memory(memory, 64).is_err());

        let device = backend.allocate_memory(64, 0, None).unwrap();
        assert!(backend.map_memory(device, 64).is_err());
        backend.free_memory(device);

        backend.unmap_memory(memory);
        backend.free_memory(memory);
        assert!(backend.is_clean());
    }

    #[test]
    fn injected_failure_hits_only_the_next_resource() {
        let mut backend = HostBackend::default();
        backend.fail_next_resource();

        assert!(backend.create_buffer(64, vk::BufferUsageFlags::UNIFORM_BUFFER).is_err());
        assert!(backend.create_buffer(64, vk::BufferUsageFlags::UNIFORM_BUFFER).is_ok());
    }

    #[test]
    fn large_images_require_dedicated_memory() {
        let mut backend = HostBackend::new(HostBackendConfig {
            dedicated_threshold: 1 << 20,
            ..HostBackendConfig::default()
        });
        let desc = |side| ImageDesc {
            width: side,
            height: side,
            format: vk::Format::R8G8B8A8_UNORM,
            usage: vk::ImageUsageFlags::SAMPLED,
        };

        let small = backend.create_image(&desc(64)).unwrap();
        let large = backend.create_image(&desc(1024)).unwrap();

        let needs = backend.image_memory_needs(small);
        assert!(!needs.requires_dedicated);
        assert_eq!(needs.requirements.size, 64 * 64 * 4);
        assert_eq!(needs.requirements.memory_type_bits, 0b101);
        assert!(backend.image_memory_needs(large).requires_dedicated);
    }

    #[test]
    fn binding_past_end_of_memory_fails() {
        let mut backend = HostBackend::default();
        let memory = backend.allocate_memory(512, 0, None).unwrap();
        let buffer = backend.create_buffer(256, vk::BufferUsageFlags::STORAGE_BUFFER).unwrap();

        assert!(backend.bind_buffer_memory(buffer, memory, 256).is_ok());
        assert!(backend.bind_buffer_memory(buffer, memory, 257).is_err());
    }
}
