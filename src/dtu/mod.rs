//! DTU interface
//!
//! The DTU (data transfer unit) is the per-PE hardware block providing
//! message passing, DMA, and remote memory access through endpoint
//! registers. The kernel drives its own DTU through the memory-mapped
//! register file and reaches remote PEs (their scratchpads and their DTU
//! register files) through memory commands.
//!
//! Under test the NoC is simulated: every PE gets a scratchpad and a
//! register file in memory, and external commands are recorded so tests can
//! play the RCTMux role.

pub mod state;

pub use state::DtuState;

use alloc::vec::Vec;

use crate::error::{KernError, KernResult};
use crate::types::{Cycles, EpId, Goff, PeId, VpeDesc};

#[cfg(test)]
use alloc::collections::{BTreeMap, VecDeque};
#[cfg(test)]
use spin::Mutex;

/// Number of endpoints per DTU
pub const EP_COUNT: usize = 12;
/// Number of global DTU registers
pub const DTU_REGS: usize = 10;
/// Number of command registers
pub const CMD_REGS: usize = 7;
/// Registers per endpoint
pub const EP_REGS: usize = 3;
/// Total size of the register file in registers
pub const NUM_REGS: usize = DTU_REGS + CMD_REGS + EP_COUNT * EP_REGS;

/// Base address of the register file in each PE's address space
pub const BASE_ADDR: Goff = 0xF000_0000;

/// The kernel's receive endpoint for syscalls
pub const SYSC_EP: EpId = 0;
/// The kernel's temporary endpoint for remote memory access
pub const TMP_MEP: EpId = EP_COUNT - 1;

/// Global DTU registers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub enum DtuReg {
    Features = 0,
    RootPt = 1,
    PfEp = 2,
    LastPf = 3,
    RwBarrier = 4,
    VpeId = 5,
    CurTime = 6,
    IdleTime = 7,
    MsgCnt = 8,
    ExtCmd = 9,
}

/// Command registers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub enum CmdReg {
    Command = 10,
    Abort = 11,
    DataAddr = 12,
    DataSize = 13,
    Offset = 14,
    ReplyEp = 15,
    ReplyLabel = 16,
}

/// What an endpoint is configured as
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u64)]
pub enum EpType {
    Invalid = 0,
    Send = 1,
    Receive = 2,
    Memory = 3,
}

/// Command opcodes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u64)]
pub enum CmdOpCode {
    Idle = 0,
    Send = 1,
    Reply = 2,
    Read = 3,
    Write = 4,
    FetchMsg = 5,
    AckMsg = 6,
    Sleep = 7,
    DebugMsg = 8,
}

/// Extended (privileged) command opcodes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u64)]
pub enum ExtCmdOpCode {
    Idle = 0,
    WakeupCore = 1,
    InvPage = 2,
    InvTlb = 3,
    InjectIrq = 4,
    Reset = 5,
}

/// Status bits of the FEATURES register
pub mod features {
    /// The PE may use privileged DTU commands
    pub const PRIV: u64 = 1 << 0;
    /// The PE reports page faults to its pager
    pub const PAGEFAULTS: u64 = 1 << 1;
}

/// Message header as delivered by a receive endpoint
#[derive(Debug, Clone, Copy, Default)]
pub struct Header {
    pub flags: u8,
    pub sender_pe: u8,
    pub sender_ep: u8,
    pub reply_ep: u8,
    pub length: u16,
    pub sender_vpe: u16,
    pub label: u64,
    pub reply_label: u64,
}

/// A fetched message
#[derive(Debug, Clone)]
pub struct Message {
    pub header: Header,
    pub data: Vec<u8>,
}

/// Issue a full memory barrier.
///
/// Register writes that order against NoC traffic (flag cell before IRQ,
/// message payload before ACK) go through this.
pub fn memory_barrier() {
    core::sync::atomic::fence(core::sync::atomic::Ordering::SeqCst);
}

#[cfg(test)]
struct SimPe {
    mem: Vec<u8>,
    regs: [u64; NUM_REGS],
    irqs: u32,
    wakeups: u32,
}

#[cfg(test)]
impl SimPe {
    fn new() -> Self {
        // reset state: no VPE is valid on any PE
        let mut regs = [0; NUM_REGS];
        regs[DtuReg::VpeId as usize] = crate::types::INVALID_VPE as u64;
        Self {
            mem: alloc::vec![0; crate::platform::LOCAL_MEM_SIZE],
            regs,
            irqs: 0,
            wakeups: 0,
        }
    }
}

#[cfg(test)]
struct SimNoc {
    pes: Vec<SimPe>,
    time: Cycles,
    queues: BTreeMap<EpId, VecDeque<Message>>,
    sent: Vec<(PeId, EpId, u64, Vec<u8>)>,
}

/// The kernel's view of the DTU
pub struct Dtu {
    #[cfg(test)]
    sim: Mutex<SimNoc>,
}

impl Dtu {
    pub fn new(pe_count: usize) -> Self {
        let _ = pe_count;
        Self {
            #[cfg(test)]
            sim: Mutex::new(SimNoc {
                pes: (0..pe_count).map(|_| SimPe::new()).collect(),
                time: 0,
                queues: BTreeMap::new(),
                sent: Vec::new(),
            }),
        }
    }

    // ------------------------------------------------------------------
    // own register file
    // ------------------------------------------------------------------

    #[cfg(not(test))]
    fn write_reg(&self, reg: usize, val: u64) {
        let ptr = (BASE_ADDR as usize + reg * 8) as *mut u64;
        unsafe { ptr.write_volatile(val) }
    }

    #[cfg(not(test))]
    fn read_reg(&self, reg: usize) -> u64 {
        let ptr = (BASE_ADDR as usize + reg * 8) as *const u64;
        unsafe { ptr.read_volatile() }
    }

    #[cfg(not(test))]
    fn wait_until_ready(&self) {
        while self.read_reg(CmdReg::Command as usize) & 0xF != CmdOpCode::Idle as u64 {}
    }

    #[cfg(not(test))]
    fn get_error(&self) -> KernResult<()> {
        self.wait_until_ready();
        match self.read_reg(CmdReg::Command as usize) >> 16 {
            0 => Ok(()),
            _ => Err(KernError::Abort),
        }
    }

    /// Configure one of the kernel's own endpoints for memory access to
    /// `[addr, addr+size)` of the given VPE
    #[cfg(not(test))]
    fn config_local_mem_ep(&self, ep: EpId, vpe: &VpeDesc, addr: Goff, size: usize) {
        let base = DTU_REGS + CMD_REGS + ep * EP_REGS;
        self.write_reg(
            base,
            (EpType::Memory as u64) << 61 | (vpe.id as u64) << 45 | (vpe.pe as u64) << 37 | 0x3,
        );
        self.write_reg(base + 1, addr);
        self.write_reg(base + 2, size as u64);
    }

    // ------------------------------------------------------------------
    // remote memory access
    // ------------------------------------------------------------------

    /// Write `data` to `addr` in the address space of the given VPE.
    ///
    /// The write is ordered: it completes before any later command starts.
    pub fn write_mem(&self, vpe: &VpeDesc, addr: Goff, data: &[u8]) -> KernResult<()> {
        #[cfg(test)]
        {
            self.sim_access(vpe, addr, data.len(), |slice| slice.copy_from_slice(data))
        }
        #[cfg(not(test))]
        {
            self.config_local_mem_ep(TMP_MEP, vpe, addr, data.len());
            self.write_reg(CmdReg::DataAddr as usize, data.as_ptr() as u64);
            self.write_reg(CmdReg::DataSize as usize, data.len() as u64);
            self.write_reg(CmdReg::Offset as usize, 0);
            memory_barrier();
            self.write_reg(
                CmdReg::Command as usize,
                CmdOpCode::Write as u64 | (TMP_MEP as u64) << 4,
            );
            self.get_error()
        }
    }

    /// Read `data.len()` bytes from `addr` in the address space of the VPE
    pub fn read_mem(&self, vpe: &VpeDesc, addr: Goff, data: &mut [u8]) -> KernResult<()> {
        #[cfg(test)]
        {
            self.sim_access(vpe, addr, data.len(), |slice| data.copy_from_slice(slice))
        }
        #[cfg(not(test))]
        {
            self.config_local_mem_ep(TMP_MEP, vpe, addr, data.len());
            self.write_reg(CmdReg::DataAddr as usize, data.as_mut_ptr() as u64);
            self.write_reg(CmdReg::DataSize as usize, data.len() as u64);
            self.write_reg(CmdReg::Offset as usize, 0);
            memory_barrier();
            self.write_reg(
                CmdReg::Command as usize,
                CmdOpCode::Read as u64 | (TMP_MEP as u64) << 4,
            );
            self.get_error()
        }
    }

    /// Read one register of a remote PE's DTU. Privileged; does not check
    /// the VPE id.
    pub fn read_remote_reg(&self, pe: PeId, reg: usize) -> KernResult<u64> {
        let mut buf = [0u8; 8];
        self.read_mem(
            &VpeDesc::new(pe, crate::types::INVALID_VPE),
            BASE_ADDR + (reg * 8) as Goff,
            &mut buf,
        )?;
        Ok(u64::from_le_bytes(buf))
    }

    /// Write one register of a remote PE's DTU. Privileged.
    pub fn write_remote_reg(&self, pe: PeId, reg: usize, val: u64) -> KernResult<()> {
        self.write_mem(
            &VpeDesc::new(pe, crate::types::INVALID_VPE),
            BASE_ADDR + (reg * 8) as Goff,
            &val.to_le_bytes(),
        )
    }

    // ------------------------------------------------------------------
    // external commands
    // ------------------------------------------------------------------

    fn ext_cmd(&self, pe: PeId, cmd: ExtCmdOpCode, arg: u64) -> KernResult<()> {
        #[cfg(test)]
        {
            let mut sim = self.sim.lock();
            let simpe = &mut sim.pes[pe];
            match cmd {
                ExtCmdOpCode::InjectIrq => {
                    simpe.irqs += 1;
                    // the agent invalidates the VPE id on IRQ entry
                    simpe.regs[DtuReg::VpeId as usize] = crate::types::INVALID_VPE as u64;
                }
                ExtCmdOpCode::WakeupCore => simpe.wakeups += 1,
                _ => {}
            }
            let _ = arg;
            Ok(())
        }
        #[cfg(not(test))]
        {
            self.write_remote_reg(pe, DtuReg::ExtCmd as usize, cmd as u64 | arg << 4)
        }
    }

    /// Inject an interrupt into the PE, forcing its core into RCTMux
    pub fn inject_irq(&self, vpe: &VpeDesc) -> KernResult<()> {
        self.ext_cmd(vpe.pe, ExtCmdOpCode::InjectIrq, 0)
    }

    /// Wake the PE's core up from sleep
    pub fn wakeup(&self, vpe: &VpeDesc) -> KernResult<()> {
        self.ext_cmd(vpe.pe, ExtCmdOpCode::WakeupCore, 0)
    }

    /// Set the PE's current VPE id register
    pub fn set_vpeid(&self, pe: PeId, vpe: crate::types::VpeId) -> KernResult<()> {
        #[cfg(test)]
        {
            self.sim.lock().pes[pe].regs[DtuReg::VpeId as usize] = vpe as u64;
            Ok(())
        }
        #[cfg(not(test))]
        {
            self.write_remote_reg(pe, DtuReg::VpeId as usize, vpe as u64)
        }
    }

    /// Invalidate the PE's VPE id register
    pub fn unset_vpeid(&self, vpe: &VpeDesc) -> KernResult<()> {
        self.set_vpeid(vpe.pe, crate::types::INVALID_VPE)
    }

    /// Drop the privileged bit of the PE's DTU feature register
    pub fn deprivilege(&self, pe: PeId) -> KernResult<()> {
        #[cfg(test)]
        {
            let mut sim = self.sim.lock();
            sim.pes[pe].regs[DtuReg::Features as usize] &= !features::PRIV;
            Ok(())
        }
        #[cfg(not(test))]
        {
            let feats = self.read_remote_reg(pe, DtuReg::Features as usize)?;
            self.write_remote_reg(pe, DtuReg::Features as usize, feats & !features::PRIV)
        }
    }

    // ------------------------------------------------------------------
    // time and sleep
    // ------------------------------------------------------------------

    /// Current cycle count of the global clock
    pub fn get_time(&self) -> Cycles {
        #[cfg(test)]
        {
            self.sim.lock().time
        }
        #[cfg(not(test))]
        {
            self.read_reg(DtuReg::CurTime as usize)
        }
    }

    /// Sleep until a message arrives or `cycles` have passed (forever if
    /// `None` and no message arrives)
    pub fn try_sleep(&self, cycles: Option<Cycles>) {
        #[cfg(test)]
        {
            // simulated time simply advances to the wakeup point
            self.sim.lock().time += cycles.unwrap_or(1000);
        }
        #[cfg(not(test))]
        {
            if self.read_reg(DtuReg::MsgCnt as usize) == 0 {
                self.write_reg(CmdReg::DataSize as usize, cycles.unwrap_or(0));
                self.write_reg(CmdReg::Command as usize, CmdOpCode::Sleep as u64);
                self.wait_until_ready();
            }
        }
    }

    // ------------------------------------------------------------------
    // messaging
    // ------------------------------------------------------------------

    /// Fetch the next pending message from one of the kernel's receive
    /// endpoints
    pub fn fetch_msg(&self, ep: EpId) -> Option<Message> {
        #[cfg(test)]
        {
            self.sim.lock().queues.get_mut(&ep)?.pop_front()
        }
        #[cfg(not(test))]
        {
            self.write_reg(
                CmdReg::Command as usize,
                CmdOpCode::FetchMsg as u64 | (ep as u64) << 4,
            );
            memory_barrier();
            let off = self.read_reg(CmdReg::Offset as usize);
            if off == 0 {
                return None;
            }
            let hdr = unsafe { (off as usize as *const Header).read_unaligned() };
            let data = unsafe {
                core::slice::from_raw_parts(
                    (off as usize + core::mem::size_of::<Header>()) as *const u8,
                    hdr.length as usize,
                )
            };
            Some(Message {
                header: hdr,
                data: data.to_vec(),
            })
        }
    }

    /// Acknowledge a fetched message, freeing its ring-buffer slot.
    ///
    /// Barriers on both sides: the payload must be consumed before the ACK,
    /// and nothing may be reordered before the ACK either.
    pub fn mark_read(&self, ep: EpId, off: Goff) {
        #[cfg(test)]
        {
            let _ = (ep, off);
        }
        #[cfg(not(test))]
        {
            self.write_reg(CmdReg::Offset as usize, off);
            memory_barrier();
            self.write_reg(
                CmdReg::Command as usize,
                CmdOpCode::AckMsg as u64 | (ep as u64) << 4,
            );
            memory_barrier();
        }
    }

    /// Send a message to an endpoint of the given VPE
    pub fn send_to(&self, vpe: &VpeDesc, ep: EpId, label: u64, data: &[u8]) -> KernResult<()> {
        #[cfg(test)]
        {
            let mut sim = self.sim.lock();
            sim.sent.push((vpe.pe, ep, label, data.to_vec()));
            Ok(())
        }
        #[cfg(not(test))]
        {
            let base = DTU_REGS + CMD_REGS + TMP_MEP * EP_REGS;
            self.write_reg(
                base,
                (EpType::Send as u64) << 61
                    | (vpe.id as u64) << 45
                    | (vpe.pe as u64) << 37
                    | (ep as u64) << 29,
            );
            self.write_reg(base + 1, label);
            self.write_reg(base + 2, 0);
            self.write_reg(CmdReg::DataAddr as usize, data.as_ptr() as u64);
            self.write_reg(CmdReg::DataSize as usize, data.len() as u64);
            memory_barrier();
            self.write_reg(
                CmdReg::Command as usize,
                CmdOpCode::Send as u64 | (TMP_MEP as u64) << 4,
            );
            self.get_error()
        }
    }

    // ------------------------------------------------------------------
    // simulation backdoor for tests
    // ------------------------------------------------------------------

    #[cfg(test)]
    fn sim_access<F: FnOnce(&mut [u8])>(
        &self,
        vpe: &VpeDesc,
        addr: Goff,
        len: usize,
        f: F,
    ) -> KernResult<()> {
        let mut sim = self.sim.lock();
        let simpe = sim.pes.get_mut(vpe.pe).ok_or(KernError::InvArgs)?;
        if addr >= BASE_ADDR {
            // privileged register file access
            let off = (addr - BASE_ADDR) as usize;
            if off % 8 != 0 || len % 8 != 0 || (off + len) / 8 > NUM_REGS {
                return Err(KernError::InvArgs);
            }
            let bytes: &mut [u8] = unsafe {
                core::slice::from_raw_parts_mut(simpe.regs.as_mut_ptr() as *mut u8, NUM_REGS * 8)
            };
            f(&mut bytes[off..off + len]);
            Ok(())
        } else {
            // scratchpad access, tagged with the VPE id
            if simpe.regs[DtuReg::VpeId as usize] != vpe.id as u64 {
                return Err(KernError::NoPerm);
            }
            let end = addr as usize + len;
            if end > simpe.mem.len() {
                return Err(KernError::InvArgs);
            }
            f(&mut simpe.mem[addr as usize..end]);
            Ok(())
        }
    }

    /// Read PE-local memory, bypassing the VPE-id check
    #[cfg(test)]
    pub fn sim_read64(&self, pe: PeId, addr: Goff) -> u64 {
        let sim = self.sim.lock();
        let mem = &sim.pes[pe].mem;
        let mut buf = [0u8; 8];
        buf.copy_from_slice(&mem[addr as usize..addr as usize + 8]);
        u64::from_le_bytes(buf)
    }

    /// Write PE-local memory, bypassing the VPE-id check
    #[cfg(test)]
    pub fn sim_write64(&self, pe: PeId, addr: Goff, val: u64) {
        let mut sim = self.sim.lock();
        let mem = &mut sim.pes[pe].mem;
        mem[addr as usize..addr as usize + 8].copy_from_slice(&val.to_le_bytes());
    }

    /// Fill a range of PE-local memory, bypassing the VPE-id check
    #[cfg(test)]
    pub fn sim_load(&self, pe: PeId, addr: Goff, data: &[u8]) {
        let mut sim = self.sim.lock();
        let mem = &mut sim.pes[pe].mem;
        mem[addr as usize..addr as usize + data.len()].copy_from_slice(data);
    }

    #[cfg(test)]
    pub fn sim_vpe_reg(&self, pe: PeId) -> u64 {
        self.sim.lock().pes[pe].regs[DtuReg::VpeId as usize]
    }

    #[cfg(test)]
    pub fn sim_irq_count(&self, pe: PeId) -> u32 {
        self.sim.lock().pes[pe].irqs
    }

    #[cfg(test)]
    pub fn sim_wakeup_count(&self, pe: PeId) -> u32 {
        self.sim.lock().pes[pe].wakeups
    }

    #[cfg(test)]
    pub fn sim_set_time(&self, time: Cycles) {
        self.sim.lock().time = time;
    }

    /// Enqueue a message on one of the kernel's receive endpoints
    #[cfg(test)]
    pub fn sim_push_msg(&self, ep: EpId, header: Header, data: &[u8]) {
        self.sim.lock().queues.entry(ep).or_default().push_back(Message {
            header,
            data: data.to_vec(),
        });
    }

    /// All messages the kernel sent, as (pe, ep, label, payload)
    #[cfg(test)]
    pub fn sim_sent(&self) -> Vec<(PeId, EpId, u64, Vec<u8>)> {
        self.sim.lock().sent.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{INVALID_VPE, VpeDesc};

    #[test]
    fn test_mem_access_is_tagged() {
        let dtu = Dtu::new(4);
        dtu.set_vpeid(1, 7).unwrap();

        let ok = VpeDesc::new(1, 7);
        let stale = VpeDesc::new(1, 3);
        dtu.write_mem(&ok, 0x100, &42u64.to_le_bytes()).unwrap();
        assert_eq!(dtu.sim_read64(1, 0x100), 42);
        assert_eq!(
            dtu.write_mem(&stale, 0x100, &[0; 8]),
            Err(KernError::NoPerm)
        );
    }

    #[test]
    fn test_irq_invalidates_vpe_id() {
        let dtu = Dtu::new(4);
        dtu.set_vpeid(2, 5).unwrap();
        dtu.inject_irq(&VpeDesc::new(2, 5)).unwrap();
        assert_eq!(dtu.sim_vpe_reg(2), INVALID_VPE as u64);
        assert_eq!(dtu.sim_irq_count(2), 1);
        // reads now have to use the invalid id
        let mut buf = [0u8; 8];
        assert!(dtu.read_mem(&VpeDesc::new(2, INVALID_VPE), 0x0, &mut buf).is_ok());
    }

    #[test]
    fn test_register_file_access() {
        let dtu = Dtu::new(4);
        dtu.write_remote_reg(1, DtuReg::IdleTime as usize, 0xABCD).unwrap();
        assert_eq!(dtu.read_remote_reg(1, DtuReg::IdleTime as usize).unwrap(), 0xABCD);
    }

    #[test]
    fn test_sleep_advances_time() {
        let dtu = Dtu::new(1);
        assert_eq!(dtu.get_time(), 0);
        dtu.try_sleep(Some(500));
        assert_eq!(dtu.get_time(), 500);
    }
}
