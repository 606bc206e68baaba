//! Boot-time platform description
//!
//! The PE table, the boot modules, and the kernel's command line are probed
//! once at boot and immutable afterwards. Everything else in the kernel
//! reaches the platform by reference.

use alloc::string::String;
use alloc::vec::Vec;
use heapless::Vec as BoundedVec;

use crate::types::{Goff, PeId};

/// Maximum number of PEs in a platform
pub const MAX_PES: usize = 64;

/// Size of a PE's local scratchpad memory
pub const LOCAL_MEM_SIZE: usize = 64 * 1024;

/// Entry address of application code in PE-local memory
pub const APP_ENTRY: Goff = 0x1000;

/// Initial stack pointer for applications
pub const STACK_TOP: Goff = 0xC000;

/// Address of the boot environment (entry, stack, argument block)
pub const ENV_START: Goff = 0xC000;

/// The kind of a PE
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeType {
    /// Compute PE with internal (scratchpad) memory only
    CompImem,
    /// Compute PE with cache and access to external memory
    CompEmem,
    /// Memory PE: DRAM behind a DTU, no core
    Mem,
}

/// The instruction set of a PE's core
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeIsa {
    /// No core (memory PEs)
    None,
    X86_64,
    Aarch64,
}

/// Immutable descriptor of a single PE
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeDesc {
    ty: PeType,
    isa: PeIsa,
    mem_size: usize,
    has_virtmem: bool,
}

impl PeDesc {
    pub const fn new(ty: PeType, isa: PeIsa, mem_size: usize, has_virtmem: bool) -> Self {
        Self {
            ty,
            isa,
            mem_size,
            has_virtmem,
        }
    }

    pub fn pe_type(&self) -> PeType {
        self.ty
    }

    pub fn isa(&self) -> PeIsa {
        self.isa
    }

    pub fn mem_size(&self) -> usize {
        self.mem_size
    }

    /// PEs with external memory access have a cache
    pub fn has_cache(&self) -> bool {
        self.ty == PeType::CompEmem
    }

    pub fn has_virtmem(&self) -> bool {
        self.has_virtmem
    }

    pub fn is_mem(&self) -> bool {
        self.ty == PeType::Mem
    }

    /// Whether a VPE with the given requirements can run here
    pub fn matches(&self, want: &PeDesc) -> bool {
        self.ty == want.ty && (want.isa == PeIsa::None || self.isa == want.isa)
    }
}

/// A boot module: an application image placed in a memory PE by the loader
#[derive(Debug, Clone)]
pub struct BootMod {
    name: String,
    pe: PeId,
    addr: Goff,
    size: usize,
}

impl BootMod {
    pub fn new(name: String, pe: PeId, addr: Goff, size: usize) -> Self {
        Self {
            name,
            pe,
            addr,
            size,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
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

/// The probed platform
pub struct Platform {
    pes: BoundedVec<PeDesc, MAX_PES>,
    kernel_pe: PeId,
    mods: Vec<BootMod>,
    args: Vec<String>,
}

impl Platform {
    /// Build a platform description from probed parts.
    ///
    /// PE 0 is the kernel PE by convention; the boot command line is the
    /// kernel argument string split on whitespace.
    pub fn new(pes: &[PeDesc], mods: Vec<BootMod>, cmdline: &str) -> Self {
        let mut table = BoundedVec::new();
        for pe in pes {
            table.push(*pe).expect("too many PEs");
        }
        let args = cmdline.split_whitespace().map(String::from).collect();
        Self {
            pes: table,
            kernel_pe: 0,
            mods,
            args,
        }
    }

    pub fn pe(&self, id: PeId) -> &PeDesc {
        &self.pes[id]
    }

    pub fn pe_count(&self) -> usize {
        self.pes.len()
    }

    pub fn kernel_pe(&self) -> PeId {
        self.kernel_pe
    }

    /// First PE id that can be assigned to user VPEs
    pub fn first_user_pe(&self) -> PeId {
        self.kernel_pe + 1
    }

    /// All PE ids that hold user-assignable compute PEs
    pub fn user_pes(&self) -> impl Iterator<Item = PeId> + '_ {
        (self.first_user_pe()..self.pe_count()).filter(move |&id| !self.pes[id].is_mem())
    }

    /// All memory PEs
    pub fn mem_pes(&self) -> impl Iterator<Item = PeId> + '_ {
        (0..self.pe_count()).filter(move |&id| self.pes[id].is_mem())
    }

    pub fn mods(&self) -> &[BootMod] {
        &self.mods
    }

    pub fn find_mod(&self, name: &str) -> Option<&BootMod> {
        self.mods.iter().find(|m| m.name() == name)
    }

    /// The boot command line, split into tokens
    pub fn args(&self) -> &[String] {
        &self.args
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::string::ToString;
    use alloc::vec;

    #[test]
    fn test_pe_desc() {
        let spm = PeDesc::new(PeType::CompImem, PeIsa::X86_64, 64 * 1024, false);
        let cache = PeDesc::new(PeType::CompEmem, PeIsa::X86_64, 0, true);
        assert!(!spm.has_cache());
        assert!(cache.has_cache());
        assert!(cache.has_virtmem());
        assert!(spm.matches(&PeDesc::new(PeType::CompImem, PeIsa::None, 0, false)));
        assert!(!spm.matches(&cache));
    }

    #[test]
    fn test_platform_iterators() {
        let pes = [
            PeDesc::new(PeType::CompEmem, PeIsa::X86_64, 0, true),
            PeDesc::new(PeType::CompImem, PeIsa::X86_64, 64 * 1024, false),
            PeDesc::new(PeType::Mem, PeIsa::None, 1024 * 1024, false),
        ];
        let plat = Platform::new(&pes, vec![], "hello daemon -- a b");
        assert_eq!(plat.kernel_pe(), 0);
        assert_eq!(plat.user_pes().collect::<Vec<_>>(), vec![1]);
        assert_eq!(plat.mem_pes().collect::<Vec<_>>(), vec![2]);
        assert_eq!(plat.args()[0], "hello".to_string());
        assert_eq!(plat.args().len(), 5);
    }
}
