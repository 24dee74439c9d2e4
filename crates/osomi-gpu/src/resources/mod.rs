//! Concrete GPU resources created through `Graphics::create`.

mod buffer;
mod sampler;
mod shader;
mod texture;

pub use buffer::{BufferUsage, GpuBuffer, GpuBufferInfo};
pub use sampler::{Sampler, SamplerInfo};
pub use shader::{Shader, ShaderInfo, ShaderStage, ShaderStageInfo};
pub use texture::{is_depth_format, Texture, TextureInfo, TextureUsage};
