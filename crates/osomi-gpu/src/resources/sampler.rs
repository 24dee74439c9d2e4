//! Texture samplers.

use ash::vk;

use crate::backend::GraphicsBackend;
use crate::error::{GpuError, Result};
use crate::graphics::InitContext;
use crate::memory::GpuMemoryAllocator;
use crate::object::{ObjectKind, Resource, ResourceInfo, TypedResource};

/// Creation parameters for a [`Sampler`].
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SamplerInfo {
    pub min_filter: vk::Filter,
    pub mag_filter: vk::Filter,
    pub mipmap_mode: vk::SamplerMipmapMode,
    /// Address mode on every axis.
    pub wrapping: vk::SamplerAddressMode,
    /// Maximum anisotropy, `None` to disable.
    pub anisotropy: Option<f32>,
}

impl Default for SamplerInfo {
    fn default() -> Self {
        Self {
            min_filter: vk::Filter::LINEAR,
            mag_filter: vk::Filter::LINEAR,
            mipmap_mode: vk::SamplerMipmapMode::LINEAR,
            wrapping: vk::SamplerAddressMode::REPEAT,
            anisotropy: None,
        }
    }
}

impl SamplerInfo {
    /// Same filter for minification, magnification and mips.
    pub fn new(filter: vk::Filter, wrapping: vk::SamplerAddressMode) -> Self {
        let mipmap_mode = if filter == vk::Filter::NEAREST {
            vk::SamplerMipmapMode::NEAREST
        } else {
            vk::SamplerMipmapMode::LINEAR
        };
        Self {
            min_filter: filter,
            mag_filter: filter,
            mipmap_mode,
            wrapping,
            anisotropy: None,
        }
    }

    /// Enable anisotropic filtering.
    pub fn with_anisotropy(mut self, max: f32) -> Self {
        self.anisotropy = Some(max);
        self
    }
}

/// A native sampler.
#[derive(Debug)]
pub struct Sampler {
    sampler: vk::Sampler,
    info: SamplerInfo,
}

impl Sampler {
    /// Native sampler handle.
    pub fn sampler(&self) -> vk::Sampler {
        self.sampler
    }

    /// Parameters the sampler was created with.
    pub fn info(&self) -> &SamplerInfo {
        &self.info
    }
}

impl Resource for Sampler {
    fn release(
        &mut self,
        backend: &mut dyn GraphicsBackend,
        _: &mut GpuMemoryAllocator,
    ) -> Result<()> {
        backend.destroy_sampler(self.sampler);
        Ok(())
    }
}

impl TypedResource for Sampler {
    const KIND: ObjectKind = ObjectKind::Sampler;
}

impl ResourceInfo for SamplerInfo {
    type Resource = Sampler;

    fn init(self, ctx: &mut InitContext<'_>) -> Result<Sampler> {
        if let Some(max) = self.anisotropy {
            if max.is_nan() || max < 1.0 {
                return Err(GpuError::InvalidDescription(format!(
                    "Anisotropy {max} is below 1"
                )));
            }
        }

        let info = vk::SamplerCreateInfo::default()
            .min_filter(self.min_filter)
            .mag_filter(self.mag_filter)
            .mipmap_mode(self.mipmap_mode)
            .address_mode_u(self.wrapping)
            .address_mode_v(self.wrapping)
            .address_mode_w(self.wrapping)
            .anisotropy_enable(self.anisotropy.is_some())
            .max_anisotropy(self.anisotropy.unwrap_or(1.0))
            .min_lod(0.0)
            .max_lod(vk::LOD_CLAMP_NONE)
            .border_color(vk::BorderColor::FLOAT_OPAQUE_BLACK);

        let sampler = ctx.backend.create_sampler(&info)?;
        Ok(Sampler {
            sampler,
            info: self,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::HostBackend;
    use crate::graphics::{Graphics, GraphicsConfig};
    use crate::object::DestroyOutcome;

    fn graphics() -> Graphics<HostBackend> {
        let config = GraphicsConfig::default().with_heap_size(4096);
        Graphics::new(config, HostBackend::default()).unwrap()
    }

    #[test]
    fn description_reaches_the_backend() {
        let mut g = graphics();
        let info = SamplerInfo::new(vk::Filter::NEAREST, vk::SamplerAddressMode::CLAMP_TO_EDGE)
            .with_anisotropy(8.0);
        let handle = g.create("pixel", info).unwrap();

        let native = g.resource(handle).unwrap().sampler();
        let created = g.backend().sampler(native).unwrap();
        assert_eq!(created.min_filter, vk::Filter::NEAREST);
        assert_eq!(created.mipmap_mode, vk::SamplerMipmapMode::NEAREST);
        assert_eq!(created.address_mode, vk::SamplerAddressMode::CLAMP_TO_EDGE);
        assert_eq!(created.anisotropy, Some(8.0));
    }

    #[test]
    fn bad_anisotropy_is_rejected() {
        let mut g = graphics();
        assert!(g.create("bad", SamplerInfo::default().with_anisotropy(0.5)).is_err());
        assert!(g.create("nan", SamplerInfo::default().with_anisotropy(f32::NAN)).is_err());
        assert_eq!(g.backend().live_sampler_count(), 0);
    }

    #[test]
    fn destroy_releases_native_sampler() {
        let mut g = graphics();
        let mut handle = Some(g.create("linear", SamplerInfo::default()).unwrap());
        assert_eq!(g.backend().live_sampler_count(), 1);
        assert_eq!(g.destroy(&mut handle), DestroyOutcome::Freed);
        assert_eq!(g.backend().live_sampler_count(), 0);
    }
}
