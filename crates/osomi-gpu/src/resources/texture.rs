//! 2D textures and render targets.

use ash::vk;

use crate::backend::{GraphicsBackend, ImageDesc};
use crate::error::{GpuError, Result};
use crate::graphics::InitContext;
use crate::memory::{DedicatedTarget, GpuAllocation, GpuMemoryAllocator, MemoryRequest};
use crate::object::{ObjectKind, Resource, ResourceInfo, TypedResource};

/// What a texture is used for.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub enum TextureUsage {
    /// Sampled image filled by uploads.
    #[default]
    Image,
    /// Color attachment.
    RenderTarget,
    /// Depth attachment.
    DepthTarget,
    /// Written by compute shaders.
    ComputeTarget,
}

impl TextureUsage {
    fn image_usage(self) -> vk::ImageUsageFlags {
        let extra = match self {
            Self::Image => vk::ImageUsageFlags::TRANSFER_DST,
            Self::RenderTarget => vk::ImageUsageFlags::COLOR_ATTACHMENT,
            Self::DepthTarget => vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT,
            Self::ComputeTarget => vk::ImageUsageFlags::STORAGE,
        };
        vk::ImageUsageFlags::SAMPLED | extra
    }
}

/// Whether `format` holds depth values.
pub fn is_depth_format(format: vk::Format) -> bool {
    matches!(
        format,
        vk::Format::D16_UNORM
            | vk::Format::X8_D24_UNORM_PACK32
            | vk::Format::D32_SFLOAT
            | vk::Format::D16_UNORM_S8_UINT
            | vk::Format::D24_UNORM_S8_UINT
            | vk::Format::D32_SFLOAT_S8_UINT
    )
}

/// Creation parameters for a [`Texture`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TextureInfo {
    pub width: u32,
    pub height: u32,
    pub format: vk::Format,
    pub usage: TextureUsage,
}

impl TextureInfo {
    /// Describe a 2D texture.
    pub fn new(width: u32, height: u32, format: vk::Format, usage: TextureUsage) -> Self {
        Self {
            width,
            height,
            format,
            usage,
        }
    }

    fn validate(&self) -> Result<()> {
        if self.width == 0 || self.height == 0 {
            return Err(GpuError::InvalidDescription(format!(
                "Texture extent {}x{} is empty",
                self.width, self.height
            )));
        }
        if self.format == vk::Format::UNDEFINED {
            return Err(GpuError::InvalidDescription("Texture format is undefined".to_string()));
        }
        let depth = is_depth_format(self.format);
        if depth != (self.usage == TextureUsage::DepthTarget) {
            return Err(GpuError::InvalidDescription(format!(
                "Format {:?} can't be used as {:?}",
                self.format, self.usage
            )));
        }
        Ok(())
    }
}

/// An image with bound memory and a default view.
#[derive(Debug)]
pub struct Texture {
    image: vk::Image,
    view: vk::ImageView,
    info: TextureInfo,
    allocation: Option<GpuAllocation>,
}

impl Texture {
    /// Native image handle.
    pub fn image(&self) -> vk::Image {
        self.image
    }

    /// View over the whole image.
    pub fn view(&self) -> vk::ImageView {
        self.view
    }

    pub fn width(&self) -> u32 {
        self.info.width
    }

    pub fn height(&self) -> u32 {
        self.info.height
    }

    pub fn format(&self) -> vk::Format {
        self.info.format
    }

    pub fn usage(&self) -> TextureUsage {
        self.info.usage
    }

    /// Memory backing the image.
    pub fn allocation(&self) -> Option<&GpuAllocation> {
        self.allocation.as_ref()
    }
}

impl Resource for Texture {
    fn release(
        &mut self,
        backend: &mut dyn GraphicsBackend,
        memory: &mut GpuMemoryAllocator,
    ) -> Result<()> {
        backend.destroy_image_view(self.view);
        backend.destroy_image(self.image);
        match self.allocation.take() {
            Some(allocation) => memory.free(backend, allocation),
            None => Ok(()),
        }
    }
}

impl TypedResource for Texture {
    const KIND: ObjectKind = ObjectKind::Texture;
}

impl ResourceInfo for TextureInfo {
    type Resource = Texture;

    fn init(self, ctx: &mut InitContext<'_>) -> Result<Texture> {
        self.validate()?;

        let name = ctx.name();
        let image = ctx.backend.create_image(&ImageDesc {
            width: self.width,
            height: self.height,
            format: self.format,
            usage: self.usage.image_usage(),
        })?;

        let needs = ctx.backend.image_memory_needs(image);
        let request = MemoryRequest::for_resource(
            needs,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
            DedicatedTarget::Image(image),
        );

        let allocation = match ctx.memory.alloc(ctx.backend, &request, name) {
            Ok(allocation) => allocation,
            Err(e) => {
                ctx.backend.destroy_image(image);
                return Err(e);
            }
        };

        let aspect = if is_depth_format(self.format) {
            vk::ImageAspectFlags::DEPTH
        } else {
            vk::ImageAspectFlags::COLOR
        };

        let view = ctx
            .backend
            .bind_image_memory(image, allocation.memory(), allocation.offset())
            .and_then(|()| ctx.backend.create_image_view(image, self.format, aspect));

        match view {
            Ok(view) => Ok(Texture {
                image,
                view,
                info: self,
                allocation: Some(allocation),
            }),
            Err(e) => {
                ctx.backend.destroy_image(image);
                ctx.memory.free(ctx.backend, allocation)?;
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{HostBackend, HostBackendConfig};
    use crate::graphics::{Graphics, GraphicsConfig};
    use crate::object::DestroyOutcome;

    fn graphics(dedicated_threshold: u64) -> Graphics<HostBackend> {
        let backend = HostBackend::new(HostBackendConfig {
            dedicated_threshold,
            ..HostBackendConfig::default()
        });
        let config = GraphicsConfig::default()
            .with_heap_size(4096)
            .with_default_block_size(8 << 20);
        Graphics::new(config, backend).unwrap()
    }

    #[test]
    fn depth_formats() {
        assert!(is_depth_format(vk::Format::D32_SFLOAT));
        assert!(is_depth_format(vk::Format::D24_UNORM_S8_UINT));
        assert!(!is_depth_format(vk::Format::R8G8B8A8_UNORM));
    }

    #[test]
    fn texture_gets_image_view_and_memory() {
        let mut g = graphics(64 << 20);
        let info = TextureInfo::new(256, 128, vk::Format::R8G8B8A8_UNORM, TextureUsage::Image);
        let handle = g.create("albedo", info).unwrap();

        let texture = g.resource(handle).unwrap();
        assert_eq!((texture.width(), texture.height()), (256, 128));
        assert_eq!(texture.allocation().unwrap().size(), 256 * 128 * 4);
        assert!(g.backend().image_binding(texture.image()).is_some());
        assert_eq!(g.backend().live_view_count(), 1);
    }

    #[test]
    fn large_render_target_gets_dedicated_block() {
        let mut g = graphics(1 << 20);
        let small_info =
            TextureInfo::new(64, 64, vk::Format::R8G8B8A8_UNORM, TextureUsage::Image);
        let small = g.create("small", small_info).unwrap();
        let mut large = Some(
            g.create(
                "gbuffer",
                TextureInfo::new(
                    1024,
                    1024,
                    vk::Format::R16G16B16A16_SFLOAT,
                    TextureUsage::RenderTarget,
                ),
            )
            .unwrap(),
        );

        let large_block = g.resource(large.unwrap()).unwrap().allocation().unwrap().block();
        let small_block = g.resource(small).unwrap().allocation().unwrap().block();
        assert_ne!(large_block, small_block);
        assert!(g.memory().block(large_block).unwrap().is_dedicated());
        assert_eq!(g.backend().dedicated_memory_count(), 1);

        assert_eq!(g.destroy(&mut large), DestroyOutcome::Freed);
        assert_eq!(g.backend().dedicated_memory_count(), 0);
        assert_eq!(g.memory().block_count(), 1);
    }

    #[test]
    fn depth_target_needs_depth_format() {
        let mut g = graphics(64 << 20);
        let depth = TextureInfo::new(32, 32, vk::Format::D32_SFLOAT, TextureUsage::DepthTarget);
        assert!(g.create("depth", depth).is_ok());

        let wrong = TextureInfo::new(32, 32, vk::Format::R8G8B8A8_UNORM, TextureUsage::DepthTarget);
        assert!(g.create("not depth", wrong).is_err());

        let empty = TextureInfo::new(0, 32, vk::Format::R8G8B8A8_UNORM, TextureUsage::Image);
        assert!(g.create("empty", empty).is_err());
        assert_eq!(g.object_count(), 1);
    }

    #[test]
    fn release_destroys_view_image_and_memory() {
        let mut g = graphics(64 << 20);
        let info =
            TextureInfo::new(16, 16, vk::Format::R8G8B8A8_UNORM, TextureUsage::ComputeTarget);
        let mut handle = Some(g.create("storage image", info).unwrap());

        assert_eq!(g.destroy(&mut handle), DestroyOutcome::Freed);
        assert_eq!(g.backend().live_image_count(), 0);
        assert_eq!(g.backend().live_view_count(), 0);
        assert_eq!(g.memory().allocation_count(), 0);
    }
}
