//! GPU error types.

use std::path::PathBuf;

use ash::vk;
use thiserror::Error;

use crate::object::ObjectKind;

/// GPU-related errors.
#[derive(Error, Debug)]
pub enum GpuError {
    /// Vulkan error.
    #[error("Vulkan error: {0}")]
    Vulkan(#[from] vk::Result),

    /// Every id in the registry's id space is taken.
    #[error("Couldn't create graphics object; all {max_id} ids are in use")]
    IdSpaceExhausted { max_id: u32 },

    /// A resource initializer failed; nothing was registered.
    #[error("Couldn't init {kind} \"{name}\"")]
    ResourceInit {
        kind: ObjectKind,
        name: String,
        #[source]
        source: Box<GpuError>,
    },

    /// Memory allocation failed.
    #[error("Memory allocation failed: {0}")]
    AllocationFailed(String),

    /// A device heap has no room left for the block.
    #[error("Out of device memory: heap {heap} cannot fit {requested} more bytes")]
    OutOfDeviceMemory { heap: u32, requested: u64 },

    /// No memory type satisfies the request.
    #[error("No memory type in {type_bits:#b} supports {properties:?}")]
    NoCompatibleMemoryType {
        type_bits: u32,
        properties: vk::MemoryPropertyFlags,
    },

    /// The allocation doesn't belong to any live block.
    #[error("Invalid free: {0}")]
    InvalidFree(String),

    /// The allocation lives in memory that isn't host visible.
    #[error("Allocation is not host mapped")]
    NotMapped,

    /// A mapped access went past the end of the allocation.
    #[error("Mapped access [{offset}, {offset} + {len}) exceeds allocation of {size} bytes")]
    MapOutOfRange { offset: u64, len: u64, size: u64 },

    /// Shader binary missing or empty.
    #[error("Couldn't find shader stage at path \"{}\"", .0.display())]
    ShaderNotFound(PathBuf),

    /// Resource description is malformed.
    #[error("Invalid resource description: {0}")]
    InvalidDescription(String),

    /// Surface creation failed.
    #[error("Surface creation failed: {0}")]
    SurfaceCreation(String),

    /// Invalid state.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Error from the core allocators.
    #[error(transparent)]
    Core(#[from] osomi_core::Error),
}

/// Result type alias.
pub type Result<T> = std::result::Result<T, GpuError>;
