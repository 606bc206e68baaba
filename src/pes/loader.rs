//! Boot-module ELF loading
//!
//! Boot modules sit in main memory where the platform loader placed them.
//! Starting one means pulling its ELF image out of the memory PE and
//! pushing the loadable segments into the target PE through the DTU, all in
//! bounded chunks.

use crate::dtu::Dtu;
use crate::error::{KernError, KernResult};
use crate::platform::Platform;
use crate::types::{Goff, VpeDesc};

/// ELF magic bytes
pub const ELF_MAGIC: [u8; 4] = [0x7f, b'E', b'L', b'F'];
/// ELF class - 64-bit
pub const ELFCLASS64: u8 = 2;
/// Program header type - loadable segment
pub const PT_LOAD: u32 = 1;

/// Copy granularity for module transfers
const BUF_SIZE: usize = 4096;

/// ELF64 file header
#[derive(Debug, Clone, Copy)]
#[repr(C, packed)]
pub struct Elf64Header {
    pub e_ident: [u8; 16],
    pub e_type: u16,
    pub e_machine: u16,
    pub e_version: u32,
    pub e_entry: u64,
    pub e_phoff: u64,
    pub e_shoff: u64,
    pub e_flags: u32,
    pub e_ehsize: u16,
    pub e_phentsize: u16,
    pub e_phnum: u16,
    pub e_shentsize: u16,
    pub e_shnum: u16,
    pub e_shstrndx: u16,
}

impl Elf64Header {
    /// Check for a loadable 64-bit ELF
    pub fn is_valid(&self) -> bool {
        self.e_ident[0..4] == ELF_MAGIC && self.e_ident[4] == ELFCLASS64
    }
}

/// ELF64 program header
#[derive(Debug, Clone, Copy)]
#[repr(C, packed)]
pub struct Elf64ProgramHeader {
    pub p_type: u32,
    pub p_flags: u32,
    pub p_offset: u64,
    pub p_vaddr: u64,
    pub p_paddr: u64,
    pub p_filesz: u64,
    pub p_memsz: u64,
    pub p_align: u64,
}

impl Elf64ProgramHeader {
    pub fn is_load(&self) -> bool {
        self.p_type == PT_LOAD
    }
}

/// Load the named boot module into the PE addressed by `to`; returns the
/// entry point
pub fn load_mod(dtu: &Dtu, platform: &Platform, to: &VpeDesc, name: &str) -> KernResult<Goff> {
    let bmod = platform.find_mod(name).ok_or(KernError::InvArgs)?;
    let src = VpeDesc::new(bmod.pe(), crate::types::INVALID_VPE);

    let mut hdr_buf = [0u8; core::mem::size_of::<Elf64Header>()];
    dtu.read_mem(&src, bmod.addr(), &mut hdr_buf)?;
    let hdr = unsafe { core::ptr::read_unaligned(hdr_buf.as_ptr() as *const Elf64Header) };
    if !hdr.is_valid() {
        return Err(KernError::InvElf);
    }

    let phentsize = hdr.e_phentsize as usize;
    let phnum = hdr.e_phnum as usize;
    if phentsize < core::mem::size_of::<Elf64ProgramHeader>() {
        return Err(KernError::InvElf);
    }

    for i in 0..phnum {
        let mut ph_buf = [0u8; core::mem::size_of::<Elf64ProgramHeader>()];
        let off = hdr.e_phoff + (i * phentsize) as u64;
        dtu.read_mem(&src, bmod.addr() + off, &mut ph_buf)?;
        let ph = unsafe { core::ptr::read_unaligned(ph_buf.as_ptr() as *const Elf64ProgramHeader) };
        if !ph.is_load() || ph.p_memsz == 0 {
            continue;
        }

        copy_segment(dtu, &src, to, bmod.addr() + ph.p_offset, ph.p_vaddr, ph.p_filesz as usize)?;
        clear_mem(
            dtu,
            to,
            ph.p_vaddr + ph.p_filesz,
            (ph.p_memsz - ph.p_filesz) as usize,
        )?;
    }

    Ok(hdr.e_entry)
}

fn copy_segment(
    dtu: &Dtu,
    src: &VpeDesc,
    dst: &VpeDesc,
    from: Goff,
    to: Goff,
    size: usize,
) -> KernResult<()> {
    let mut buf = [0u8; BUF_SIZE];
    let mut done = 0;
    while done < size {
        let amount = core::cmp::min(BUF_SIZE, size - done);
        dtu.read_mem(src, from + done as Goff, &mut buf[..amount])?;
        dtu.write_mem(dst, to + done as Goff, &buf[..amount])?;
        done += amount;
    }
    Ok(())
}

fn clear_mem(dtu: &Dtu, dst: &VpeDesc, addr: Goff, size: usize) -> KernResult<()> {
    let buf = [0u8; BUF_SIZE];
    let mut done = 0;
    while done < size {
        let amount = core::cmp::min(BUF_SIZE, size - done);
        dtu.write_mem(dst, addr + done as Goff, &buf[..amount])?;
        done += amount;
    }
    Ok(())
}

/// Build a minimal ELF64 image with one PT_LOAD segment; shared by the
/// module and kernel tests
#[cfg(test)]
pub(crate) fn build_test_elf(
    entry: u64,
    vaddr: u64,
    payload: &[u8],
    memsz: u64,
) -> alloc::vec::Vec<u8> {
    use alloc::vec::Vec;

    let ehsize = core::mem::size_of::<Elf64Header>();
    let phsize = core::mem::size_of::<Elf64ProgramHeader>();
    let hdr = Elf64Header {
        e_ident: [
            0x7f, b'E', b'L', b'F', ELFCLASS64, 1, 1, 0, 0, 0, 0, 0, 0, 0, 0, 0,
        ],
        e_type: 2,
        e_machine: 62,
        e_version: 1,
        e_entry: entry,
        e_phoff: ehsize as u64,
        e_shoff: 0,
        e_flags: 0,
        e_ehsize: ehsize as u16,
        e_phentsize: phsize as u16,
        e_phnum: 1,
        e_shentsize: 0,
        e_shnum: 0,
        e_shstrndx: 0,
    };
    let ph = Elf64ProgramHeader {
        p_type: PT_LOAD,
        p_flags: 5,
        p_offset: (ehsize + phsize) as u64,
        p_vaddr: vaddr,
        p_paddr: vaddr,
        p_filesz: payload.len() as u64,
        p_memsz: memsz,
        p_align: 0x1000,
    };
    let mut img = Vec::new();
    img.extend_from_slice(unsafe {
        core::slice::from_raw_parts(&hdr as *const _ as *const u8, ehsize)
    });
    img.extend_from_slice(unsafe {
        core::slice::from_raw_parts(&ph as *const _ as *const u8, phsize)
    });
    img.extend_from_slice(payload);
    img
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::{BootMod, PeDesc, PeIsa, PeType, Platform};
    use crate::types::INVALID_VPE;
    use alloc::string::ToString;
    use alloc::vec;

    fn test_platform(img_size: usize) -> Platform {
        let pes = [
            PeDesc::new(PeType::CompEmem, PeIsa::X86_64, 0, false),
            PeDesc::new(PeType::CompImem, PeIsa::X86_64, 64 * 1024, false),
            PeDesc::new(PeType::Mem, PeIsa::None, 64 * 1024, false),
        ];
        let mods = vec![BootMod::new("hello".to_string(), 2, 0x100, img_size)];
        Platform::new(&pes, mods, "")
    }

    #[test]
    fn test_load_copies_segment_and_clears_bss() {
        let img = build_test_elf(0x1000, 0x1000, b"code bytes", 16);
        let platform = test_platform(img.len());
        let dtu = Dtu::new(3);
        dtu.sim_load(2, 0x100, &img);
        // poison the bss range to check clearing
        dtu.sim_write64(1, 0x1000 + 10, u64::MAX);

        let to = VpeDesc::new(1, INVALID_VPE);
        let entry = load_mod(&dtu, &platform, &to, "hello").unwrap();
        assert_eq!(entry, 0x1000);
        assert_eq!(&dtu.sim_read64(1, 0x1000).to_le_bytes(), b"code byt");
        // the 6 bytes past the payload are zero again
        assert_eq!(dtu.sim_read64(1, 0x1000 + 10) & 0xFFFF_FFFF_FFFF, 0);
    }

    #[test]
    fn test_rejects_non_elf() {
        let platform = test_platform(64);
        let dtu = Dtu::new(3);
        dtu.sim_load(2, 0x100, &[0u8; 64]);
        let to = VpeDesc::new(1, INVALID_VPE);
        assert_eq!(
            load_mod(&dtu, &platform, &to, "hello"),
            Err(KernError::InvElf)
        );
    }

    #[test]
    fn test_unknown_module() {
        let platform = test_platform(64);
        let dtu = Dtu::new(3);
        let to = VpeDesc::new(1, INVALID_VPE);
        assert_eq!(
            load_mod(&dtu, &platform, &to, "nosuch"),
            Err(KernError::InvArgs)
        );
    }
}
