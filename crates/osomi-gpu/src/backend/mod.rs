//! Platform GPU backend boundary.
//!
//! The registry and the memory allocator never talk to a driver directly.
//! Everything that creates or destroys a native handle goes through
//! [`GraphicsBackend`], so the same lifecycle code runs on Vulkan
//! ([`AshBackend`]) and on plain host memory ([`HostBackend`]).

mod ash_backend;
mod host;

pub use ash_backend::AshBackend;
pub use host::{HostBackend, HostBackendConfig, HostSampler};

use std::ptr::NonNull;

use ash::vk;
use raw_window_handle::{HasDisplayHandle, HasWindowHandle, RawDisplayHandle, RawWindowHandle};

use crate::error::{GpuError, Result};
use crate::graphics::GraphicsFeature;
use crate::memory::DedicatedTarget;

/// Memory requirements of a freshly created buffer or image.
#[derive(Clone, Copy, Debug, Default)]
pub struct MemoryNeeds {
    pub requirements: vk::MemoryRequirements,
    /// Driver would rather give this resource its own memory block.
    pub prefers_dedicated: bool,
    /// Resource must own its memory block.
    pub requires_dedicated: bool,
}

/// Creation parameters for a 2D image.
#[derive(Clone, Copy, Debug)]
pub struct ImageDesc {
    pub width: u32,
    pub height: u32,
    pub format: vk::Format,
    pub usage: vk::ImageUsageFlags,
}

/// Window handles and size handed over by the windowing layer.
#[derive(Clone, Copy, Debug)]
pub struct SurfaceTarget {
    pub display: RawDisplayHandle,
    pub window: RawWindowHandle,
    pub width: u32,
    pub height: u32,
}

impl SurfaceTarget {
    /// Collect the raw handles of a window.
    pub fn from_window<W>(window: &W, width: u32, height: u32) -> Result<Self>
    where
        W: HasDisplayHandle + HasWindowHandle,
    {
        let display = window
            .display_handle()
            .map_err(|e| GpuError::SurfaceCreation(format!("Failed to get display handle: {e}")))?;
        let handle = window
            .window_handle()
            .map_err(|e| GpuError::SurfaceCreation(format!("Failed to get window handle: {e}")))?;

        Ok(Self {
            display: display.as_raw(),
            window: handle.as_raw(),
            width,
            height,
        })
    }
}

/// Native operations the graphics core needs from a GPU driver.
///
/// All methods run on the thread that owns the `Graphics` instance.
pub trait GraphicsBackend {
    /// Memory types and heaps of the device.
    fn memory_properties(&self) -> vk::PhysicalDeviceMemoryProperties;

    /// Whether an optional feature is available.
    fn supports(&self, feature: GraphicsFeature) -> bool;

    /// Allocate a device memory block.
    fn allocate_memory(
        &mut self,
        size: u64,
        memory_type_index: u32,
        dedicated: Option<DedicatedTarget>,
    ) -> Result<vk::DeviceMemory>;

    /// Release a device memory block. The block must be unmapped.
    fn free_memory(&mut self, memory: vk::DeviceMemory);

    /// Map a whole host-visible block.
    fn map_memory(&mut self, memory: vk::DeviceMemory, size: u64) -> Result<NonNull<u8>>;

    /// Unmap a block mapped with [`GraphicsBackend::map_memory`].
    fn unmap_memory(&mut self, memory: vk::DeviceMemory);

    fn create_buffer(&mut self, size: u64, usage: vk::BufferUsageFlags) -> Result<vk::Buffer>;
    fn buffer_memory_needs(&self, buffer: vk::Buffer) -> MemoryNeeds;
    fn bind_buffer_memory(
        &mut self,
        buffer: vk::Buffer,
        memory: vk::DeviceMemory,
        offset: u64,
    ) -> Result<()>;
    fn destroy_buffer(&mut self, buffer: vk::Buffer);

    fn create_image(&mut self, desc: &ImageDesc) -> Result<vk::Image>;
    fn image_memory_needs(&self, image: vk::Image) -> MemoryNeeds;
    fn bind_image_memory(
        &mut self,
        image: vk::Image,
        memory: vk::DeviceMemory,
        offset: u64,
    ) -> Result<()>;
    fn create_image_view(
        &mut self,
        image: vk::Image,
        format: vk::Format,
        aspect: vk::ImageAspectFlags,
    ) -> Result<vk::ImageView>;
    fn destroy_image_view(&mut self, view: vk::ImageView);
    fn destroy_image(&mut self, image: vk::Image);

    fn create_sampler(&mut self, info: &vk::SamplerCreateInfo<'_>) -> Result<vk::Sampler>;
    fn destroy_sampler(&mut self, sampler: vk::Sampler);

    fn create_shader_module(&mut self, code: &[u32]) -> Result<vk::ShaderModule>;
    fn destroy_shader_module(&mut self, module: vk::ShaderModule);

    /// Create the presentation surface for a window.
    fn init_surface(&mut self, target: &SurfaceTarget) -> Result<()>;

    /// Destroy the presentation surface, if any.
    fn destroy_surface(&mut self);

    /// Block until the device has finished all submitted work.
    fn wait_idle(&self) -> Result<()>;
}
