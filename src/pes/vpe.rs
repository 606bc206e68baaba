//! Virtual PEs
//!
//! A VPE is the schedulable unit: a named application mapped onto some
//! physical PE. While it is suspended, its DTU state lives in the kernel;
//! while it runs, the kernel keeps only bookkeeping.

use alloc::string::String;
use alloc::vec::Vec;

use crate::dtu::{Dtu, DtuReg, DtuState};
use crate::error::KernResult;
use crate::mem::MainMemory;
use crate::pes::loader;
use crate::platform::{Platform, ENV_START, STACK_TOP};
use crate::types::{CapSel, Cycles, EpId, Goff, PeId, VpeDesc, VpeId};

/// Size of a page-table frame
const PAGE_SIZE: usize = 4096;

/// The endpoint a paged VPE sends page faults through
const PAGER_EP: EpId = 1;

/// VPE state flags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct VpeFlags(pub u32);

impl VpeFlags {
    /// The per-PE idle VPE
    pub const IDLE: Self = Self(1 << 0);
    /// Memory has to be initialized on next dispatch
    pub const INIT: Self = Self(1 << 1);
    /// The application should be started
    pub const START: Self = Self(1 << 2);
    /// Loaded from a boot module
    pub const BOOTMOD: Self = Self(1 << 3);
    /// Does not keep the kernel alive
    pub const DAEMON: Self = Self(1 << 4);
    /// May share its PE with other muxable VPEs
    pub const MUXABLE: Self = Self(1 << 5);
    /// Linked into its PE's ready list
    pub const READY: Self = Self(1 << 6);

    pub const fn empty() -> Self {
        Self(0)
    }

    pub fn bits(self) -> u32 {
        self.0
    }

    pub fn contains(self, other: Self) -> bool {
        (self.0 & other.0) == other.0
    }

    pub fn set(&mut self, other: Self) {
        self.0 |= other.0;
    }

    pub fn clear(&mut self, other: Self) {
        self.0 &= !other.0;
    }
}

impl core::ops::BitOr for VpeFlags {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl core::ops::BitOrAssign for VpeFlags {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

/// Lifecycle states of a VPE
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VpeState {
    Dead,
    Suspended,
    Running,
}

/// A party waiting for a VPE to resume; notified with an empty message
#[derive(Debug, Clone, Copy)]
pub struct StartWaiter {
    pub vpe: VpeDesc,
    pub ep: EpId,
    pub label: u64,
}

/// A virtual PE
pub struct Vpe {
    id: VpeId,
    name: String,
    pub(crate) pe: PeId,
    pub(crate) state: VpeState,
    pub(crate) flags: VpeFlags,
    pub(crate) dtustate: DtuState,
    pub(crate) lastsched: Cycles,
    requirements: Vec<String>,
    args: Vec<String>,
    pid: Option<i32>,
    ep: EpId,
    pfgate: Option<CapSel>,
    waiters: Vec<StartWaiter>,
}

impl Vpe {
    /// Id used to address a PE whose VPE id is invalidated
    pub const INVALID_ID: VpeId = crate::types::INVALID_VPE;

    /// Cycle budget before round-robin preemption
    pub const TIME_SLICE: Cycles = 1_000_000;

    pub fn new(
        name: String,
        pe: PeId,
        id: VpeId,
        flags: VpeFlags,
        ep: EpId,
        pfgate: Option<CapSel>,
    ) -> Self {
        Self {
            id,
            name,
            pe,
            state: VpeState::Dead,
            flags,
            dtustate: DtuState::new(),
            lastsched: 0,
            requirements: Vec::new(),
            args: Vec::new(),
            pid: None,
            ep,
            pfgate,
            waiters: Vec::new(),
        }
    }

    pub fn id(&self) -> VpeId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn pe(&self) -> PeId {
        self.pe
    }

    /// The (pe, id) pair DTU commands address this VPE with
    pub fn desc(&self) -> VpeDesc {
        VpeDesc::new(self.pe, self.id)
    }

    pub fn state(&self) -> VpeState {
        self.state
    }

    pub fn flags(&self) -> VpeFlags {
        self.flags
    }

    pub fn dtustate(&self) -> &DtuState {
        &self.dtustate
    }

    pub fn ep(&self) -> EpId {
        self.ep
    }

    pub fn pfgate(&self) -> Option<CapSel> {
        self.pfgate
    }

    pub fn pid(&self) -> Option<i32> {
        self.pid
    }

    pub fn is_daemon(&self) -> bool {
        self.flags.contains(VpeFlags::DAEMON)
    }

    pub fn make_daemon(&mut self) {
        self.flags.set(VpeFlags::DAEMON);
    }

    /// Record a service this VPE must see before it may start
    pub fn add_requirement(&mut self, name: &str) {
        self.requirements.push(String::from(name));
    }

    pub fn requirements(&self) -> &[String] {
        &self.requirements
    }

    pub fn set_args(&mut self, args: &[String]) {
        self.args = args.to_vec();
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }

    /// Mark the application as startable; the next dispatch loads and
    /// enters it
    pub fn start_app(&mut self, pid: i32) {
        self.pid = Some(pid);
        self.flags.set(VpeFlags::START);
    }

    /// Subscribe to this VPE's next resume
    pub fn add_waiter(&mut self, waiter: StartWaiter) {
        self.waiters.push(waiter);
    }

    /// First-dispatch initialization: address translation for paged PEs and
    /// the boot environment for everyone.
    ///
    /// Failure is fatal for the VPE.
    pub fn init_memory(
        &mut self,
        dtu: &Dtu,
        platform: &Platform,
        mem: &mut MainMemory,
    ) -> KernResult<()> {
        // runs after the restore step installed our id in the DTU
        let desc = self.desc();

        if platform.pe(self.pe).has_virtmem() {
            let root_pt = mem.allocate(PAGE_SIZE, PAGE_SIZE)?;
            // into the snapshot for later resumes, and into the live DTU
            // because the restore already went out
            self.dtustate.config_pf(root_pt.addr(), PAGER_EP);
            dtu.write_remote_reg(self.pe, DtuReg::RootPt as usize, root_pt.addr())?;
            dtu.write_remote_reg(self.pe, DtuReg::PfEp as usize, PAGER_EP as u64)?;
        }

        self.write_env(dtu, &desc)
    }

    /// Write the boot environment (entry, stack, arguments) into the PE
    fn write_env(&self, dtu: &Dtu, desc: &VpeDesc) -> KernResult<()> {
        let mut env = [0u8; 64];
        env[0..8].copy_from_slice(&(crate::platform::APP_ENTRY).to_le_bytes());
        env[8..16].copy_from_slice(&STACK_TOP.to_le_bytes());
        env[16..24].copy_from_slice(&(self.args.len() as u64).to_le_bytes());
        dtu.write_mem(desc, ENV_START, &env)?;

        // argument block follows the header, nul-separated
        let mut blob = Vec::new();
        for a in &self.args {
            blob.extend_from_slice(a.as_bytes());
            blob.push(0);
        }
        if !blob.is_empty() {
            dtu.write_mem(desc, ENV_START + env.len() as Goff, &blob)?;
        }
        Ok(())
    }

    /// Load this VPE's boot module ELF into the PE.
    ///
    /// Failure is fatal for the VPE.
    pub fn load_app(&mut self, dtu: &Dtu, platform: &Platform) -> KernResult<()> {
        let name = self.name.clone();
        let name = name.as_str();
        let desc = self.desc();
        let entry = loader::load_mod(dtu, platform, &desc, name)?;

        // patch the real entry point into the environment
        dtu.write_mem(&desc, ENV_START, &entry.to_le_bytes())?;
        klog!(
            VPES,
            "Loaded boot module '{}' for VPE {} @ {:#x}",
            name,
            self.id,
            entry
        );
        Ok(())
    }

    /// Notify everyone waiting for this VPE to come up
    pub fn notify_resume(&mut self, dtu: &Dtu) {
        for w in self.waiters.drain(..) {
            let _ = dtu.send_to(&w.vpe, w.ep, w.label, &[]);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::string::ToString;

    #[test]
    fn test_flags() {
        let mut f = VpeFlags::BOOTMOD | VpeFlags::INIT;
        assert!(f.contains(VpeFlags::INIT));
        assert!(!f.contains(VpeFlags::START));
        f.set(VpeFlags::START);
        assert!(f.contains(VpeFlags::BOOTMOD | VpeFlags::START));
        f.clear(VpeFlags::INIT | VpeFlags::START);
        assert_eq!(f, VpeFlags::BOOTMOD);
    }

    #[test]
    fn test_notify_resume_fires_waiters() {
        let dtu = Dtu::new(4);
        let mut vpe = Vpe::new("fs".to_string(), 2, 5, VpeFlags::empty(), 0, None);
        vpe.add_waiter(StartWaiter {
            vpe: VpeDesc::new(3, 7),
            ep: 2,
            label: 0xBEEF,
        });

        vpe.notify_resume(&dtu);
        let sent = dtu.sim_sent();
        assert_eq!(sent.len(), 1);
        assert_eq!((sent[0].0, sent[0].1, sent[0].2), (3, 2, 0xBEEF));

        // waiters fire only once
        vpe.notify_resume(&dtu);
        assert_eq!(dtu.sim_sent().len(), 1);
    }

    #[test]
    fn test_vpe_bookkeeping() {
        let mut vpe = Vpe::new("echo".to_string(), 2, 5, VpeFlags::MUXABLE, 0, None);
        assert_eq!(vpe.desc(), VpeDesc::new(2, 5));
        assert_eq!(vpe.state(), VpeState::Dead);

        vpe.add_requirement("net");
        vpe.make_daemon();
        vpe.start_app(42);
        assert!(vpe.is_daemon());
        assert_eq!(vpe.requirements(), &["net".to_string()]);
        assert_eq!(vpe.pid(), Some(42));
        assert!(vpe.flags().contains(VpeFlags::START));
    }
}
