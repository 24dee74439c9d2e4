//! GPU object lifecycle for the Osomi engine.
//!
//! This crate provides:
//! - [`Graphics`]: registry and factory of GPU resources with ref-counting
//! - [`GpuMemoryAllocator`]: block-based device memory sub-allocation
//! - Resource types: buffers, textures, samplers, shader stages and shaders
//! - [`GraphicsBackend`] with a Vulkan ([`AshBackend`]) and a host-memory
//!   ([`HostBackend`]) implementation

pub mod backend;
pub mod error;
pub mod graphics;
pub mod id;
pub mod memory;
pub mod object;
pub mod resources;

pub use backend::{
    AshBackend, GraphicsBackend, HostBackend, HostBackendConfig, ImageDesc, MemoryNeeds,
    SurfaceTarget,
};
pub use error::{GpuError, Result};
pub use graphics::{Graphics, GraphicsConfig, GraphicsFeature, InitContext};
pub use memory::{
    DedicatedRequirement, DedicatedTarget, GpuAllocation, GpuBlockId, GpuMemoryAllocator,
    GpuMemoryBlock, MemoryRequest,
};
pub use object::{
    DestroyOutcome, GraphicsObject, Handle, ObjectId, ObjectKind, Resource, ResourceInfo,
    TypedResource,
};
pub use resources::{
    BufferUsage, GpuBuffer, GpuBufferInfo, Sampler, SamplerInfo, Shader, ShaderInfo, ShaderStage,
    ShaderStageInfo, Texture, TextureInfo, TextureUsage,
};
