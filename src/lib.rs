//! tilekern - a microkernel for a DTU-based heterogeneous manycore
//!
//! The platform consists of processing elements (PEs, or tiles) that
//! communicate exclusively through a per-tile hardware message/DMA unit, the
//! DTU. Applications run as virtual PEs (VPEs) that the kernel multiplexes
//! onto physical PEs with the help of RCTMux, a cooperative time-multiplexer
//! running inside each PE.
//!
//! The kernel itself is single-threaded and event-driven: one work loop
//! drives message dispatch and timer expiry, and all cross-PE coordination
//! happens through DTU commands.

#![no_std]
// Kernel types often have specialized initialization that doesn't fit Default
#![allow(clippy::new_without_default)]
// Hardware register code uses explicit bit shifts for documentation
#![allow(clippy::identity_op)]

extern crate alloc;

#[macro_use]
pub mod console;

pub mod dtu;
pub mod error;
pub mod kernel;
pub mod mem;
pub mod pes;
pub mod platform;
pub mod services;
pub mod syscalls;
pub mod timeouts;
pub mod types;
pub mod workloop;

/// Kernel version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
/// Kernel name
pub const NAME: &str = "tilekern";
