//! Kernel memory management
//!
//! [`MemoryMap`] hands out free address ranges within one contiguous region;
//! [`MainMemory`] layers the per-memory-PE modules on top of it and is what
//! the rest of the kernel allocates DTU buffers, app images, and RCTMux save
//! areas from.

pub mod main;
pub mod map;

pub use main::{Allocation, MainMemory, MemMod};
pub use map::MemoryMap;
