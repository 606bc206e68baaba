//! The kernel context
//!
//! One value owns every kernel subsystem: the platform description, the
//! DTU, main memory, the timeout heap, the VPE table, the per-PE switchers,
//! and the service list. Handlers receive it by reference; context
//! switchers borrow the subset they need through [`SwitchCtx`].

use alloc::string::{String, ToString};
use alloc::vec::Vec;

use crate::dtu::{Dtu, SYSC_EP};
use crate::error::{KernError, KernResult};
use crate::mem::{MainMemory, MemMod};
use crate::pes::ctxsw::SwitchCtx;
use crate::pes::vpe::{Vpe, VpeFlags};
use crate::pes::vpemng::{self, VpeMng};
use crate::pes::PeMng;
use crate::platform::{PeDesc, PeType, Platform};
use crate::services::{Service, ServiceList};
use crate::syscalls;
use crate::timeouts::{TimeoutReason, Timeouts};
use crate::types::{CapSel, EpId, PeId, VpeId};
use crate::workloop::WorkLoop;

/// The kernel: all subsystems, reached from one place
pub struct Kernel {
    platform: Platform,
    dtu: Dtu,
    mem: MainMemory,
    timeouts: Timeouts,
    vpemng: VpeMng,
    pemng: PeMng,
    services: ServiceList,
    workloop: WorkLoop,
}

impl Kernel {
    pub fn new(platform: Platform) -> Self {
        let dtu = Dtu::new(platform.pe_count());
        let mut mem = MainMemory::new();
        for pe in platform.mem_pes() {
            mem.add(MemMod::new(pe, 0, platform.pe(pe).mem_size()));
        }
        let pemng = PeMng::new(&platform);
        let mut workloop = WorkLoop::new();
        workloop.add_ep(SYSC_EP);

        Self {
            platform,
            dtu,
            mem,
            timeouts: Timeouts::new(),
            vpemng: VpeMng::new(),
            pemng,
            services: ServiceList::new(),
            workloop,
        }
    }

    pub fn platform(&self) -> &Platform {
        &self.platform
    }

    pub fn dtu(&self) -> &Dtu {
        &self.dtu
    }

    pub fn vpes(&self) -> &VpeMng {
        &self.vpemng
    }

    pub fn pes(&self) -> &PeMng {
        &self.pemng
    }

    pub fn services(&self) -> &ServiceList {
        &self.services
    }

    /// Borrow the collaborators a switcher operation needs, alongside the
    /// switcher table itself
    fn split(&mut self) -> (SwitchCtx<'_>, &mut PeMng) {
        (
            SwitchCtx {
                platform: &self.platform,
                dtu: &self.dtu,
                timeouts: &mut self.timeouts,
                vpes: &mut self.vpemng,
                mem: &mut self.mem,
                died: Vec::new(),
            },
            &mut self.pemng,
        )
    }

    // ------------------------------------------------------------------
    // boot
    // ------------------------------------------------------------------

    /// Bring the system up: drop PE privileges, create the per-PE idle
    /// VPEs, and start the boot modules from the command line
    pub fn init(&mut self) {
        self.pemng.deprivilege_pes(&self.platform, &self.dtu);

        let user_pes: Vec<PeId> = self.platform.user_pes().collect();
        for pe in user_pes {
            let id = self.vpemng.get_id().expect("out of VPE ids at boot");
            let idle = Vpe::new(
                "idle".to_string(),
                pe,
                id,
                VpeFlags::IDLE | VpeFlags::INIT | VpeFlags::BOOTMOD,
                0,
                None,
            );
            self.vpemng.insert(idle);
            self.pemng.switcher_mut(pe).set_idle(id);
        }

        let specs = vpemng::parse_boot_line(self.platform.args());
        for spec in specs {
            let id = self.create_boot_vpe(&spec);
            if self.vpemng.vpe(id).requirements().is_empty() {
                self.vpemng.vpe_mut(id).start_app(id as i32);
            } else {
                self.vpemng.add_pending(id);
            }

            let (mut ctx, pemng) = self.split();
            pemng.add_vpe(&mut ctx, id);
            let died = ctx.died;
            self.reap(died);
        }
    }

    /// Create one VPE from the boot command line; prefers a PE with a
    /// cache and falls back to a scratchpad PE
    fn create_boot_vpe(&mut self, spec: &vpemng::BootSpec) -> VpeId {
        let cache = PeDesc::new(PeType::CompEmem, crate::platform::PeIsa::None, 0, false);
        let spm = PeDesc::new(PeType::CompImem, crate::platform::PeIsa::None, 0, false);

        let pe = self
            .pemng
            .find_pe(&self.platform, &self.vpemng, &cache, None, false, None)
            .or_else(|| {
                self.pemng
                    .find_pe(&self.platform, &self.vpemng, &spm, None, false, None)
            })
            .unwrap_or_else(|| panic!("no free PE for boot module {}", spec.name));

        let id = self.vpemng.get_id().expect("out of VPE ids at boot");
        let mut vpe = Vpe::new(
            spec.name.clone(),
            pe,
            id,
            VpeFlags::BOOTMOD | VpeFlags::INIT,
            0,
            None,
        );
        vpe.set_args(&spec.args);
        for req in &spec.requirements {
            vpe.add_requirement(req);
        }
        self.vpemng.insert(vpe);
        if spec.daemon {
            self.vpemng.make_daemon(id);
        }
        klog!(VPES, "Created boot VPE {} '{}' on pe {}", id, spec.name, pe);
        id
    }

    // ------------------------------------------------------------------
    // VPE lifecycle
    // ------------------------------------------------------------------

    /// Create a VPE on behalf of a syscall
    pub fn create_vpe(
        &mut self,
        name: String,
        pe_desc: PeDesc,
        ep: EpId,
        pfgate: Option<CapSel>,
        muxable: bool,
    ) -> KernResult<VpeId> {
        let pe = self
            .pemng
            .find_pe(&self.platform, &self.vpemng, &pe_desc, None, muxable, None)
            .ok_or(KernError::NoFreePe)?;

        // a pager without virtual memory support doesn't work
        if pfgate.is_some() && !self.platform.pe(pe).has_virtmem() {
            return Err(KernError::InvArgs);
        }

        let id = self.vpemng.get_id()?;
        let mut flags = VpeFlags::INIT;
        if muxable {
            flags.set(VpeFlags::MUXABLE);
        }
        self.vpemng
            .insert(Vpe::new(name, pe, id, flags, ep, pfgate));

        let (mut ctx, pemng) = self.split();
        pemng.add_vpe(&mut ctx, id);
        let died = ctx.died;
        self.reap(died);
        Ok(id)
    }

    /// Start the VPE's application (VPE_CTRL START)
    pub fn start_vpe_app(&mut self, vpe: VpeId, pid: i32) -> KernResult<()> {
        if self.vpemng.get(vpe).is_none() {
            return Err(KernError::VpeGone);
        }
        self.vpemng.vpe_mut(vpe).start_app(pid);
        let (mut ctx, pemng) = self.split();
        pemng.start_vpe(&mut ctx, vpe);
        let died = ctx.died;
        self.reap(died);
        Ok(())
    }

    /// Destroy a VPE (VPE_CTRL STOP, exit, or removal of a dead VPE)
    pub fn remove_vpe(&mut self, vpe: VpeId) -> KernResult<()> {
        if self.vpemng.get(vpe).is_none() {
            return Err(KernError::VpeGone);
        }
        let (mut ctx, pemng) = self.split();
        pemng.remove_vpe(&mut ctx, vpe, true);
        let died = ctx.died;
        self.reap(died);
        self.finish_remove(vpe);
        Ok(())
    }

    pub fn block_vpe(&mut self, vpe: VpeId) -> KernResult<()> {
        if self.vpemng.get(vpe).is_none() {
            return Err(KernError::VpeGone);
        }
        let (mut ctx, pemng) = self.split();
        pemng.block_vpe(&mut ctx, vpe);
        let died = ctx.died;
        self.reap(died);
        Ok(())
    }

    /// Make a blocked VPE ready again, e.g. because a message arrived
    pub fn unblock_vpe(&mut self, vpe: VpeId) -> KernResult<()> {
        if self.vpemng.get(vpe).is_none() {
            return Err(KernError::VpeGone);
        }
        let (mut ctx, pemng) = self.split();
        pemng.unblock_vpe(&mut ctx, vpe);
        let died = ctx.died;
        self.reap(died);
        Ok(())
    }

    /// Give up the VPE's remaining time slice (VPE_CTRL YIELD)
    pub fn yield_vpe(&mut self, vpe: VpeId) -> KernResult<()> {
        if self.vpemng.get(vpe).is_none() {
            return Err(KernError::VpeGone);
        }
        let (mut ctx, pemng) = self.split();
        pemng.yield_vpe(&mut ctx, vpe);
        let died = ctx.died;
        self.reap(died);
        Ok(())
    }

    /// Move a VPE to another PE of the same kind
    pub fn migrate_vpe(&mut self, vpe: VpeId, fast: bool) -> bool {
        if self.vpemng.get(vpe).is_none() {
            return false;
        }
        let (mut ctx, pemng) = self.split();
        let moved = pemng.migrate_vpe(&mut ctx, vpe, fast);
        let died = ctx.died;
        self.reap(died);
        moved
    }

    /// Finish removal of VPEs that died inside a switcher operation
    fn reap(&mut self, died: Vec<VpeId>) {
        for vpe in died {
            self.finish_remove(vpe);
        }
    }

    fn finish_remove(&mut self, vpe: VpeId) {
        self.services.remove_vpe(vpe);
        if let Some(v) = self.vpemng.take(vpe) {
            klog!(VPES, "Removed VPE {} '{}'", vpe, v.name());
        }

        // if there are no VPEs left, we can stop everything; if only
        // daemons are left, the shutdown procedure begins
        if self.vpemng.used() == 0 {
            self.workloop.stop();
        } else if self.vpemng.used() == self.vpemng.daemons() {
            self.shutdown();
        }
    }

    fn shutdown(&mut self) {
        if !self.vpemng.begin_shutdown() {
            return;
        }
        for srv in self.services.iter() {
            let _ = self.services.send_shutdown(&self.dtu, srv);
        }
    }

    // ------------------------------------------------------------------
    // services
    // ------------------------------------------------------------------

    /// Register a service and start whatever was waiting for it
    pub fn register_service(&mut self, name: String, vpe: VpeId) -> KernResult<()> {
        let v = self.vpemng.get(vpe).ok_or(KernError::VpeGone)?;
        let (pe, ep) = (v.pe(), v.ep());
        self.services.add(Service::new(name, vpe, pe, ep));
        self.start_pending();
        Ok(())
    }

    /// Start every pending VPE whose requirements are now satisfied
    pub fn start_pending(&mut self) {
        let startable = self.vpemng.start_pending(&self.services);
        for vpe in startable {
            let _ = self.start_vpe_app(vpe, vpe as i32);
        }
    }

    // ------------------------------------------------------------------
    // the work loop
    // ------------------------------------------------------------------

    /// Dispatch every expired timeout; returns whether any fired
    pub fn tick(&mut self) -> bool {
        let now = self.dtu.get_time();
        let fired = self.timeouts.tick(now);
        let worked = !fired.is_empty();
        for reason in fired {
            match reason {
                TimeoutReason::ContinueSwitch(pe) => self.continue_switch(pe),
                TimeoutReason::RoundRobinExpired(pe) => self.switch_timedout(pe),
            }
        }
        worked
    }

    fn continue_switch(&mut self, pe: PeId) {
        let (mut ctx, pemng) = self.split();
        pemng.switcher_mut(pe).continue_switch(&mut ctx);
        let died = ctx.died;
        self.reap(died);
    }

    fn switch_timedout(&mut self, pe: PeId) {
        let (mut ctx, pemng) = self.split();
        pemng.switcher_mut(pe).start_switch(&mut ctx, true);
        let died = ctx.died;
        self.reap(died);
    }

    /// The cooperative work loop: timeouts, then messages, then sleep
    pub fn run(&mut self) {
        while !self.workloop.stopped() {
            let mut worked = self.tick();

            let eps: Vec<EpId> = self.workloop.eps().to_vec();
            for ep in eps {
                while let Some(msg) = self.dtu.fetch_msg(ep) {
                    worked = true;
                    syscalls::handle(self, &msg);
                    self.dtu.mark_read(ep, 0);
                }
            }

            if !worked && !self.workloop.stopped() {
                let now = self.dtu.get_time();
                let sleep = self.timeouts.next_deadline().map(|d| d.saturating_sub(now));
                self.dtu.try_sleep(sleep);
            }
        }
    }

    pub fn stopped(&self) -> bool {
        self.workloop.stopped()
    }
}
