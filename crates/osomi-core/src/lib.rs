//! Core types for the Osomi graphics engine.
//!
//! This crate provides the low-level building blocks the graphics layer is
//! built on:
//! - [`Bitset`]: fixed-capacity bit array with word-wide bulk operators
//! - [`BlockAllocator`]: pooled object storage with free-list reuse
//! - [`VirtualBlockAllocator`]: range allocator used to sub-allocate GPU memory

pub mod bitset;
pub mod block_allocator;
pub mod error;
pub mod virtual_block;

pub use bitset::{BitRef, Bitset};
pub use block_allocator::{BlockAllocator, BlockHandle};
pub use error::{Error, Result};
pub use virtual_block::{BlockAllocation, VirtualBlockAllocator};
