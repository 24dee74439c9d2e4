//! Vulkan backend built on `ash`.

use std::ptr::NonNull;
use std::sync::Arc;

use ash::vk;

use super::{GraphicsBackend, ImageDesc, MemoryNeeds, SurfaceTarget};
use crate::error::{GpuError, Result};
use crate::graphics::GraphicsFeature;
use crate::memory::DedicatedTarget;

/// Backend that forwards to a Vulkan device.
///
/// The instance and device are created by the caller and must outlive the
/// backend; only the surface is owned here.
pub struct AshBackend {
    entry: ash::Entry,
    instance: ash::Instance,
    device: Arc<ash::Device>,
    memory_properties: vk::PhysicalDeviceMemoryProperties,
    features: Vec<GraphicsFeature>,
    surface_loader: ash::khr::surface::Instance,
    surface: Option<vk::SurfaceKHR>,
}

impl AshBackend {
    /// Wrap an existing device.
    ///
    /// `features` lists the optional features the device was created with.
    ///
    /// # Safety
    /// The entry, instance, physical device and device must be valid and
    /// belong together.
    pub unsafe fn new(
        entry: ash::Entry,
        instance: ash::Instance,
        physical_device: vk::PhysicalDevice,
        device: Arc<ash::Device>,
        features: &[GraphicsFeature],
    ) -> Self {
        let memory_properties =
            unsafe { instance.get_physical_device_memory_properties(physical_device) };
        let surface_loader = ash::khr::surface::Instance::new(&entry, &instance);

        Self {
            entry,
            instance,
            device,
            memory_properties,
            features: features.to_vec(),
            surface_loader,
            surface: None,
        }
    }

    /// Get the Vulkan device handle.
    pub fn device(&self) -> &ash::Device {
        &self.device
    }

    /// The presentation surface, if one was created.
    pub fn surface(&self) -> Option<vk::SurfaceKHR> {
        self.surface
    }
}

fn needs_from(
    requirements: vk::MemoryRequirements,
    dedicated: &vk::MemoryDedicatedRequirements<'_>,
) -> MemoryNeeds {
    MemoryNeeds {
        requirements,
        prefers_dedicated: dedicated.prefers_dedicated_allocation == vk::TRUE,
        requires_dedicated: dedicated.requires_dedicated_allocation == vk::TRUE,
    }
}

impl GraphicsBackend for AshBackend {
    fn memory_properties(&self) -> vk::PhysicalDeviceMemoryProperties {
        self.memory_properties
    }

    fn supports(&self, feature: GraphicsFeature) -> bool {
        self.features.contains(&feature)
    }

    fn allocate_memory(
        &mut self,
        size: u64,
        memory_type_index: u32,
        dedicated: Option<DedicatedTarget>,
    ) -> Result<vk::DeviceMemory> {
        let mut dedicated_info = match dedicated {
            Some(DedicatedTarget::Buffer(buffer)) => {
                Some(vk::MemoryDedicatedAllocateInfo::default().buffer(buffer))
            }
            Some(DedicatedTarget::Image(image)) => {
                Some(vk::MemoryDedicatedAllocateInfo::default().image(image))
            }
            None => None,
        };

        let mut info = vk::MemoryAllocateInfo::default()
            .allocation_size(size)
            .memory_type_index(memory_type_index);
        if let Some(dedicated_info) = dedicated_info.as_mut() {
            info = info.push_next(dedicated_info);
        }

        let memory = unsafe { self.device.allocate_memory(&info, None) }?;
        Ok(memory)
    }

    fn free_memory(&mut self, memory: vk::DeviceMemory) {
        unsafe { self.device.free_memory(memory, None) };
    }

    fn map_memory(&mut self, memory: vk::DeviceMemory, _size: u64) -> Result<NonNull<u8>> {
        let ptr = unsafe {
            self.device
                .map_memory(memory, 0, vk::WHOLE_SIZE, vk::MemoryMapFlags::empty())
        }?;
        NonNull::new(ptr.cast::<u8>())
            .ok_or_else(|| GpuError::AllocationFailed("vkMapMemory returned null".to_string()))
    }

    fn unmap_memory(&mut self, memory: vk::DeviceMemory) {
        unsafe { self.device.unmap_memory(memory) };
    }

    fn create_buffer(&mut self, size: u64, usage: vk::BufferUsageFlags) -> Result<vk::Buffer> {
        let buffer_info = vk::BufferCreateInfo::default()
            .size(size)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let buffer = unsafe { self.device.create_buffer(&buffer_info, None) }?;
        Ok(buffer)
    }

    fn buffer_memory_needs(&self, buffer: vk::Buffer) -> MemoryNeeds {
        let info = vk::BufferMemoryRequirementsInfo2::default().buffer(buffer);
        let mut dedicated = vk::MemoryDedicatedRequirements::default();
        let mut requirements = vk::MemoryRequirements2::default().push_next(&mut dedicated);

        unsafe {
            self.device
                .get_buffer_memory_requirements2(&info, &mut requirements)
        };

        let memory_requirements = requirements.memory_requirements;
        needs_from(memory_requirements, &dedicated)
    }

    fn bind_buffer_memory(
        &mut self,
        buffer: vk::Buffer,
        memory: vk::DeviceMemory,
        offset: u64,
    ) -> Result<()> {
        unsafe { self.device.bind_buffer_memory(buffer, memory, offset) }?;
        Ok(())
    }

    fn destroy_buffer(&mut self, buffer: vk::Buffer) {
        unsafe { self.device.destroy_buffer(buffer, None) };
    }

    fn create_image(&mut self, desc: &ImageDesc) -> Result<vk::Image> {
        let image_info = vk::ImageCreateInfo::default()
            .image_type(vk::ImageType::TYPE_2D)
            .format(desc.format)
            .extent(vk::Extent3D {
                width: desc.width,
                height: desc.height,
                depth: 1,
            })
            .mip_levels(1)
            .array_layers(1)
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(desc.usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED);

        let image = unsafe { self.device.create_image(&image_info, None) }?;
        Ok(image)
    }

    fn image_memory_needs(&self, image: vk::Image) -> MemoryNeeds {
        let info = vk::ImageMemoryRequirementsInfo2::default().image(image);
        let mut dedicated = vk::MemoryDedicatedRequirements::default();
        let mut requirements = vk::MemoryRequirements2::default().push_next(&mut dedicated);

        unsafe {
            self.device
                .get_image_memory_requirements2(&info, &mut requirements)
        };

        let memory_requirements = requirements.memory_requirements;
        needs_from(memory_requirements, &dedicated)
    }

    fn bind_image_memory(
        &mut self,
        image: vk::Image,
        memory: vk::DeviceMemory,
        offset: u64,
    ) -> Result<()> {
        unsafe { self.device.bind_image_memory(image, memory, offset) }?;
        Ok(())
    }

    fn create_image_view(
        &mut self,
        image: vk::Image,
        format: vk::Format,
        aspect: vk::ImageAspectFlags,
    ) -> Result<vk::ImageView> {
        let view_info = vk::ImageViewCreateInfo::default()
            .image(image)
            .view_type(vk::ImageViewType::TYPE_2D)
            .format(format)
            .subresource_range(vk::ImageSubresourceRange {
                aspect_mask: aspect,
                base_mip_level: 0,
                level_count: 1,
                base_array_layer: 0,
                layer_count: 1,
            });

        let view = unsafe { self.device.create_image_view(&view_info, None) }?;
        Ok(view)
    }

    fn destroy_image_view(&mut self, view: vk::ImageView) {
        unsafe { self.device.destroy_image_view(view, None) };
    }

    fn destroy_image(&mut self, image: vk::Image) {
        unsafe { self.device.destroy_image(image, None) };
    }

    fn create_sampler(&mut self, info: &vk::SamplerCreateInfo<'_>) -> Result<vk::Sampler> {
        let sampler = unsafe { self.device.create_sampler(info, None) }?;
        Ok(sampler)
    }

    fn destroy_sampler(&mut self, sampler: vk::Sampler) {
        unsafe { self.device.destroy_sampler(sampler, None) };
    }

    fn create_shader_module(&mut self, code: &[u32]) -> Result<vk::ShaderModule> {
        let info = vk::ShaderModuleCreateInfo::default().code(code);
        let module = unsafe { self.device.create_shader_module(&info, None) }?;
        Ok(module)
    }

    fn destroy_shader_module(&mut self, module: vk::ShaderModule) {
        unsafe { self.device.destroy_shader_module(module, None) };
    }

    fn init_surface(&mut self, target: &SurfaceTarget) -> Result<()> {
        self.destroy_surface();

        let surface = unsafe {
            ash_window::create_surface(
                &self.entry,
                &self.instance,
                target.display,
                target.window,
                None,
            )
        }
        .map_err(|e| GpuError::SurfaceCreation(e.to_string()))?;

        self.surface = Some(surface);
        Ok(())
    }

    fn destroy_surface(&mut self) {
        if let Some(surface) = self.surface.take() {
            unsafe { self.surface_loader.destroy_surface(surface, None) };
        }
    }

    fn wait_idle(&self) -> Result<()> {
        unsafe { self.device.device_wait_idle() }?;
        Ok(())
    }
}
