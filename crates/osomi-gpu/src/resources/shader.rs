//! Shader stages loaded from SPIR-V and shaders built from them.

use std::io::Cursor;
use std::path::PathBuf;

use ash::vk;

use crate::backend::GraphicsBackend;
use crate::error::{GpuError, Result};
use crate::graphics::InitContext;
use crate::memory::GpuMemoryAllocator;
use crate::object::{Handle, ObjectId, ObjectKind, Resource, ResourceInfo, TypedResource};

/// Creation parameters for a [`ShaderStage`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ShaderStageInfo {
    /// SPIR-V binary on disk.
    pub path: PathBuf,
    pub stage: vk::ShaderStageFlags,
}

impl ShaderStageInfo {
    /// Load `stage` from the SPIR-V file at `path`.
    pub fn new(path: impl Into<PathBuf>, stage: vk::ShaderStageFlags) -> Self {
        Self {
            path: path.into(),
            stage,
        }
    }
}

/// One compiled shader module.
#[derive(Debug)]
pub struct ShaderStage {
    module: vk::ShaderModule,
    stage: vk::ShaderStageFlags,
    path: PathBuf,
}

impl ShaderStage {
    /// Native shader module.
    pub fn module(&self) -> vk::ShaderModule {
        self.module
    }

    /// Pipeline stage this module runs in.
    pub fn stage(&self) -> vk::ShaderStageFlags {
        self.stage
    }

    /// File the module was loaded from.
    pub fn path(&self) -> &std::path::Path {
        &self.path
    }
}

impl Resource for ShaderStage {
    fn release(
        &mut self,
        backend: &mut dyn GraphicsBackend,
        _: &mut GpuMemoryAllocator,
    ) -> Result<()> {
        backend.destroy_shader_module(self.module);
        Ok(())
    }
}

impl TypedResource for ShaderStage {
    const KIND: ObjectKind = ObjectKind::ShaderStage;
}

impl ResourceInfo for ShaderStageInfo {
    type Resource = ShaderStage;

    fn init(self, ctx: &mut InitContext<'_>) -> Result<ShaderStage> {
        let bytes = match std::fs::read(&self.path) {
            Ok(bytes) if !bytes.is_empty() => bytes,
            _ => return Err(GpuError::ShaderNotFound(self.path)),
        };

        let code = ash::util::read_spv(&mut Cursor::new(&bytes)).map_err(|e| {
            GpuError::InvalidDescription(format!("{}: {e}", self.path.display()))
        })?;

        let module = ctx.backend.create_shader_module(&code)?;
        Ok(ShaderStage {
            module,
            stage: self.stage,
            path: self.path,
        })
    }
}

/// Creation parameters for a [`Shader`].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ShaderInfo {
    pub stages: Vec<Handle<ShaderStage>>,
}

impl ShaderInfo {
    /// Shader made of `stages`; each is retained on creation.
    pub fn new(stages: impl IntoIterator<Item = Handle<ShaderStage>>) -> Self {
        Self {
            stages: stages.into_iter().collect(),
        }
    }
}

/// A set of stages used together. Holds a reference to each stage.
#[derive(Debug)]
pub struct Shader {
    stages: Vec<Handle<ShaderStage>>,
    stage_flags: vk::ShaderStageFlags,
}

impl Shader {
    /// Stages in creation order.
    pub fn stages(&self) -> &[Handle<ShaderStage>] {
        &self.stages
    }

    /// Union of the stage flags.
    pub fn stage_flags(&self) -> vk::ShaderStageFlags {
        self.stage_flags
    }
}

impl Resource for Shader {
    fn release(
        &mut self,
        _: &mut dyn GraphicsBackend,
        _: &mut GpuMemoryAllocator,
    ) -> Result<()> {
        Ok(())
    }

    fn dependencies(&self) -> Vec<ObjectId> {
        self.stages.iter().map(|stage| stage.id()).collect()
    }
}

impl TypedResource for Shader {
    const KIND: ObjectKind = ObjectKind::Shader;
}

impl ResourceInfo for ShaderInfo {
    type Resource = Shader;

    fn init(self, ctx: &mut InitContext<'_>) -> Result<Shader> {
        if self.stages.is_empty() {
            return Err(GpuError::InvalidDescription("Shader has no stages".to_string()));
        }

        // Validate everything before taking any references.
        let mut stage_flags = vk::ShaderStageFlags::empty();
        for &handle in &self.stages {
            let stage = ctx.get(handle).ok_or_else(|| {
                GpuError::InvalidDescription(format!("Shader stage {} is not alive", handle.id()))
            })?;
            if stage_flags.intersects(stage.stage()) {
                return Err(GpuError::InvalidDescription(format!(
                    "Stage {:?} appears twice",
                    stage.stage()
                )));
            }
            stage_flags |= stage.stage();
        }

        for &handle in &self.stages {
            ctx.retain(handle);
        }

        Ok(Shader {
            stages: self.stages,
            stage_flags,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use super::*;
    use crate::backend::HostBackend;
    use crate::graphics::{Graphics, GraphicsConfig};
    use crate::object::DestroyOutcome;

    const SPIRV_MAGIC: u32 = 0x0723_0203;

    fn graphics() -> Graphics<HostBackend> {
        let config = GraphicsConfig::default().with_heap_size(4096);
        Graphics::new(config, HostBackend::default()).unwrap()
    }

    fn write_file(name: &str, bytes: &[u8]) -> PathBuf {
        let path = std::env::temp_dir().join(format!("osomi-{}-{name}", std::process::id()));
        std::fs::write(&path, bytes).unwrap();
        path
    }

    fn write_spirv(name: &str, words: usize) -> PathBuf {
        let mut code = vec![SPIRV_MAGIC, 0x0001_0000, 0, 1, 0];
        code.resize(words.max(5), 0);
        write_file(name, bytemuck::cast_slice(&code))
    }

    #[test]
    fn stage_loads_spirv_from_disk() {
        let mut g = graphics();
        let path = write_spirv("load.vert.spv", 16);
        let handle = g
            .create("vert", ShaderStageInfo::new(&path, vk::ShaderStageFlags::VERTEX))
            .unwrap();

        let stage = g.resource(handle).unwrap();
        assert_eq!(stage.stage(), vk::ShaderStageFlags::VERTEX);
        assert_eq!(stage.path(), path.as_path());
        assert_eq!(g.backend().shader_module_words(stage.module()), Some(16));
        std::fs::remove_file(path).unwrap();
    }

    #[test]
    fn missing_or_empty_file_is_not_found() {
        let mut g = graphics();
        let missing = Path::new("/definitely/not/here.spv");
        let err = g
            .create("missing", ShaderStageInfo::new(missing, vk::ShaderStageFlags::FRAGMENT))
            .unwrap_err();
        match err {
            GpuError::ResourceInit { source, .. } => {
                assert!(matches!(*source, GpuError::ShaderNotFound(ref p) if p == missing));
            }
            other => panic!("unexpected error {other:?}"),
        }

        let empty = write_file("empty.spv", &[]);
        let err = g
            .create("empty", ShaderStageInfo::new(&empty, vk::ShaderStageFlags::FRAGMENT))
            .unwrap_err();
        assert!(matches!(
            err,
            GpuError::ResourceInit { source, .. } if matches!(*source, GpuError::ShaderNotFound(_))
        ));
        std::fs::remove_file(empty).unwrap();
        assert_eq!(g.object_count(), 0);
    }

    #[test]
    fn garbage_is_rejected() {
        let mut g = graphics();
        let path = write_file("garbage.spv", b"not a shader");
        assert!(g
            .create("garbage", ShaderStageInfo::new(&path, vk::ShaderStageFlags::COMPUTE))
            .is_err());
        assert_eq!(g.backend().live_shader_module_count(), 0);
        std::fs::remove_file(path).unwrap();
    }

    #[test]
    fn shader_holds_its_stages() {
        let mut g = graphics();
        let vert_path = write_spirv("holds.vert.spv", 8);
        let frag_path = write_spirv("holds.frag.spv", 8);

        let vert = g
            .create("vert", ShaderStageInfo::new(&vert_path, vk::ShaderStageFlags::VERTEX))
            .unwrap();
        let frag = g
            .create("frag", ShaderStageInfo::new(&frag_path, vk::ShaderStageFlags::FRAGMENT))
            .unwrap();
        let mut shader = Some(g.create("forward", ShaderInfo::new([vert, frag])).unwrap());

        assert_eq!(g.object(vert.id()).unwrap().ref_count(), 2);
        assert_eq!(
            g.resource(shader.unwrap()).unwrap().stage_flags(),
            vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT
        );

        // The creator lets go; the shader keeps the stages alive.
        assert_eq!(g.destroy(&mut Some(vert)), DestroyOutcome::StillReferenced);
        assert_eq!(g.destroy(&mut Some(frag)), DestroyOutcome::StillReferenced);
        assert_eq!(g.backend().live_shader_module_count(), 2);

        assert_eq!(g.destroy(&mut shader), DestroyOutcome::Freed);
        assert_eq!(g.object_count(), 0);
        assert_eq!(g.backend().live_shader_module_count(), 0);

        std::fs::remove_file(vert_path).unwrap();
        std::fs::remove_file(frag_path).unwrap();
    }

    #[test]
    fn invalid_stage_lists_take_no_references() {
        let mut g = graphics();
        let path = write_spirv("dup.vert.spv", 8);
        let vert = g
            .create("vert", ShaderStageInfo::new(&path, vk::ShaderStageFlags::VERTEX))
            .unwrap();

        assert!(g.create("twice", ShaderInfo::new([vert, vert])).is_err());
        assert!(g.create("none", ShaderInfo::default()).is_err());

        let mut gone = Some(vert);
        g.destroy(&mut gone);
        assert!(g.create("dangling", ShaderInfo::new([vert])).is_err());
        assert_eq!(g.object_count(), 0);

        std::fs::remove_file(path).unwrap();
    }
}
