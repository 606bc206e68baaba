//! Main memory: the platform's memory PEs
//!
//! Each memory PE contributes one module; allocations name the module's PE
//! and the offset within it, which is exactly what DTU memory commands need.

use alloc::vec::Vec;
use core::fmt;

use crate::error::{KernError, KernResult};
use crate::mem::MemoryMap;
use crate::types::{Goff, PeId};

/// One memory PE's contribution to main memory
pub struct MemMod {
    pe: PeId,
    addr: Goff,
    size: usize,
    map: MemoryMap,
}

impl MemMod {
    pub fn new(pe: PeId, addr: Goff, size: usize) -> Self {
        Self {
            pe,
            addr,
            size,
            map: MemoryMap::new(addr, size),
        }
    }

    pub fn pe(&self) -> PeId {
        self.pe
    }

    pub fn capacity(&self) -> usize {
        self.size
    }

    pub fn available(&self) -> usize {
        self.map.size().0
    }

    fn contains(&self, pe: PeId, addr: Goff, size: usize) -> bool {
        self.pe == pe && addr >= self.addr && addr + size as Goff <= self.addr + self.size as Goff
    }
}

/// A range of main memory handed out by [`MainMemory::allocate`]
#[derive(Clone, Copy)]
pub struct Allocation {
    pe: PeId,
    addr: Goff,
    size: usize,
}

impl Allocation {
    pub fn new(pe: PeId, addr: Goff, size: usize) -> Self {
        Self { pe, addr, size }
    }

    /// Take over responsibility for the range; it will not be freed
    pub fn claim(&mut self) {
        self.size = 0;
    }

    pub fn pe(&self) -> PeId {
        self.pe
    }

    pub fn addr(&self) -> Goff {
        self.addr
    }

    pub fn size(&self) -> usize {
        self.size
    }
}

impl fmt::Debug for Allocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Alloc[pe={}, addr={:#x}, size={:#x}]",
            self.pe, self.addr, self.size
        )
    }
}

/// All memory modules of the platform
pub struct MainMemory {
    mods: Vec<MemMod>,
}

impl MainMemory {
    pub fn new() -> Self {
        Self { mods: Vec::new() }
    }

    pub fn add(&mut self, m: MemMod) {
        self.mods.push(m);
    }

    /// Allocate from the first module with a fitting range
    pub fn allocate(&mut self, size: usize, align: usize) -> KernResult<Allocation> {
        for m in &mut self.mods {
            if let Ok(addr) = m.map.allocate(size, align) {
                klog!(MEM, "Allocated {:#x} bytes @ pe{}+{:#x}", size, m.pe, addr);
                return Ok(Allocation::new(m.pe, addr, size));
            }
        }
        Err(KernError::OutOfSpace)
    }

    pub fn free(&mut self, alloc: &Allocation) {
        if alloc.size == 0 {
            return;
        }
        for m in &mut self.mods {
            if m.contains(alloc.pe, alloc.addr, alloc.size) {
                m.map.free(alloc.addr, alloc.size);
                klog!(
                    MEM,
                    "Freed {:#x} bytes @ pe{}+{:#x}",
                    alloc.size,
                    alloc.pe,
                    alloc.addr
                );
                return;
            }
        }
    }

    pub fn capacity(&self) -> usize {
        self.mods.iter().map(|m| m.capacity()).sum()
    }

    pub fn available(&self) -> usize {
        self.mods.iter().map(|m| m.available()).sum()
    }
}
