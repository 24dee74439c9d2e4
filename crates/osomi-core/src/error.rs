//! Error types for the core utilities.

use thiserror::Error;

/// Core error type shared by the bitset and the allocators.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Packed value count does not match the bitset size.
    #[error("Bitset holds {bits} bits but {values} values of {bits_per_val} bits were given")]
    SizeMismatch {
        bits: usize,
        values: usize,
        bits_per_val: u32,
    },

    /// Bits per value must be in `1..=32`.
    #[error("Invalid bits per value: {0}")]
    InvalidWidth(u32),

    /// No free range can hold the request.
    #[error("Out of space: requested {requested} bytes, largest free range is {largest_free}")]
    OutOfSpace { requested: u64, largest_free: u64 },

    /// Zero-sized ranges cannot be allocated.
    #[error("Zero-sized allocation")]
    ZeroSize,

    /// Alignment must be a non-zero power of two.
    #[error("Invalid alignment: {0}")]
    InvalidAlignment(u64),

    /// The range is not a live allocation.
    #[error("Invalid free of range [{offset}, {offset} + {size})")]
    InvalidFree { offset: u64, size: u64 },
}

/// Result type alias using our Error type.
pub type Result<T> = std::result::Result<T, Error>;
