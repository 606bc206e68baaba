//! PE management
//!
//! Owns one context switcher per user PE and implements placement: finding
//! a PE that satisfies a descriptor, respecting the muxability of whoever
//! already lives there.

use alloc::vec::Vec;

use crate::dtu::Dtu;
use crate::pes::ctxsw::{ContextSwitcher, State, SwitchCtx};
use crate::pes::vpe::VpeFlags;
use crate::pes::vpemng::VpeMng;
use crate::platform::{PeDesc, Platform};
use crate::types::{PeId, VpeId};

/// Per-PE switcher table
pub struct PeMng {
    switchers: Vec<Option<ContextSwitcher>>,
}

impl PeMng {
    /// Create a switcher for every user-assignable compute PE
    pub fn new(platform: &Platform) -> Self {
        let mut switchers = Vec::new();
        switchers.resize_with(platform.pe_count(), || None);
        for pe in platform.user_pes() {
            switchers[pe] = Some(ContextSwitcher::new(pe));
        }
        Self { switchers }
    }

    pub fn switcher(&self, pe: PeId) -> &ContextSwitcher {
        self.switchers[pe].as_ref().expect("PE has no switcher")
    }

    pub fn switcher_mut(&mut self, pe: PeId) -> &mut ContextSwitcher {
        self.switchers[pe].as_mut().expect("PE has no switcher")
    }

    /// Drop privileged DTU access on every user PE; done once at boot
    pub fn deprivilege_pes(&self, platform: &Platform, dtu: &Dtu) {
        for pe in platform.user_pes() {
            dtu.deprivilege(pe).expect("deprivileging PE failed");
        }
    }

    /// Find a PE matching `desc`, scanning in id order.
    ///
    /// A PE with residents is acceptable only if the newcomer and all
    /// residents are muxable. With `group` given, PEs that already host a
    /// member of the group are skipped.
    pub fn find_pe(
        &self,
        platform: &Platform,
        vpes: &VpeMng,
        desc: &PeDesc,
        except: Option<PeId>,
        muxable: bool,
        group: Option<&[VpeId]>,
    ) -> Option<PeId> {
        for pe in platform.user_pes() {
            if Some(pe) == except || !platform.pe(pe).matches(desc) {
                continue;
            }
            let sw = self.switcher(pe);
            if sw.count() != 0 && !(muxable && sw.can_mux(vpes)) {
                continue;
            }
            if let Some(group) = group {
                if group.iter().any(|&v| vpes.vpe(v).pe() == pe) {
                    continue;
                }
            }
            return Some(pe);
        }
        None
    }

    /// Hand a VPE to its PE's switcher
    pub fn add_vpe(&mut self, ctx: &mut SwitchCtx<'_>, vpe: VpeId) {
        let pe = ctx.vpes.vpe(vpe).pe();
        self.switcher_mut(pe).add(ctx, vpe);
    }

    /// Take a VPE away from its PE's switcher
    pub fn remove_vpe(&mut self, ctx: &mut SwitchCtx<'_>, vpe: VpeId, destroy: bool) {
        let pe = ctx.vpes.vpe(vpe).pe();
        self.switcher_mut(pe).remove(ctx, vpe, destroy);
    }

    /// Enable the VPE for execution after its START flag is set
    pub fn start_vpe(&mut self, ctx: &mut SwitchCtx<'_>, vpe: VpeId) {
        debug_assert!(ctx.vpes.vpe(vpe).flags().contains(VpeFlags::START));
        let pe = ctx.vpes.vpe(vpe).pe();
        let sw = self.switcher_mut(pe);
        if sw.current() == Some(vpe) && sw.state() == State::Idle {
            sw.start_vpe(ctx);
        } else {
            sw.unblock_vpe(ctx, vpe);
        }
    }

    pub fn block_vpe(&mut self, ctx: &mut SwitchCtx<'_>, vpe: VpeId) {
        let pe = ctx.vpes.vpe(vpe).pe();
        self.switcher_mut(pe).block_vpe(ctx, vpe);
    }

    pub fn unblock_vpe(&mut self, ctx: &mut SwitchCtx<'_>, vpe: VpeId) {
        let pe = ctx.vpes.vpe(vpe).pe();
        self.switcher_mut(pe).unblock_vpe(ctx, vpe);
    }

    /// Give up the VPE's time slice if someone else could use it
    pub fn yield_vpe(&mut self, ctx: &mut SwitchCtx<'_>, vpe: VpeId) {
        let v = ctx.vpes.vpe(vpe);
        let pe = v.pe();
        let own = v.flags().contains(VpeFlags::READY) as usize;
        let sw = self.switcher_mut(pe);
        if sw.ready_len() > own {
            sw.start_switch(ctx, false);
        }
    }

    /// Move a suspended VPE to another PE of the same kind; `fast` accepts
    /// only completely free PEs. Returns false if no PE is available.
    pub fn migrate_vpe(&mut self, ctx: &mut SwitchCtx<'_>, vpe: VpeId, fast: bool) -> bool {
        let (old_pe, muxable) = {
            let v = ctx.vpes.vpe(vpe);
            (v.pe(), v.flags().contains(VpeFlags::MUXABLE))
        };
        let desc = *ctx.platform.pe(old_pe);

        let new_pe = match self.find_pe(ctx.platform, ctx.vpes, &desc, Some(old_pe), muxable, None) {
            Some(pe) if !fast || self.switcher(pe).count() == 0 => pe,
            _ => return false,
        };

        klog!(VPES, "Migrating VPE {} from pe {} to pe {}", vpe, old_pe, new_pe);
        self.switcher_mut(old_pe).remove(ctx, vpe, false);
        ctx.vpes.vpe_mut(vpe).pe = new_pe;
        self.switcher_mut(new_pe).add(ctx, vpe);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pes::vpe::Vpe;
    use crate::platform::{PeIsa, PeType};
    use alloc::vec;

    fn test_platform() -> Platform {
        let spm = PeDesc::new(PeType::CompImem, PeIsa::X86_64, 64 * 1024, false);
        let cache = PeDesc::new(PeType::CompEmem, PeIsa::X86_64, 0, true);
        let mem = PeDesc::new(PeType::Mem, PeIsa::None, 1024 * 1024, false);
        Platform::new(&[cache, spm, spm, cache, mem], vec![], "")
    }

    fn add_vpe_on(vpes: &mut VpeMng, pemng: &mut PeMng, pe: PeId, muxable: bool) -> VpeId {
        let id = vpes.get_id().unwrap();
        let flags = if muxable {
            VpeFlags::MUXABLE
        } else {
            VpeFlags::empty()
        };
        vpes.insert(Vpe::new(alloc::format!("v{}", id), pe, id, flags, 0, None));
        // occupy the PE without running the switch machinery
        let sw = pemng.switcher_mut(pe);
        sw.add_occupant_for_test(vpes, id);
        id
    }

    #[test]
    fn test_find_pe_matches_descriptor() {
        let platform = test_platform();
        let vpes = VpeMng::new();
        let pemng = PeMng::new(&platform);

        let spm = PeDesc::new(PeType::CompImem, PeIsa::None, 0, false);
        let cache = PeDesc::new(PeType::CompEmem, PeIsa::None, 0, false);
        assert_eq!(pemng.find_pe(&platform, &vpes, &spm, None, false, None), Some(1));
        assert_eq!(pemng.find_pe(&platform, &vpes, &cache, None, false, None), Some(3));
        // excluding the only cache PE leaves nothing
        assert_eq!(pemng.find_pe(&platform, &vpes, &cache, Some(3), false, None), None);
    }

    #[test]
    fn test_find_pe_respects_muxability() {
        let platform = test_platform();
        let mut vpes = VpeMng::new();
        let mut pemng = PeMng::new(&platform);

        let spm = PeDesc::new(PeType::CompImem, PeIsa::None, 0, false);
        add_vpe_on(&mut vpes, &mut pemng, 1, true);

        // a muxable newcomer may share pe 1, a non-muxable one gets pe 2
        assert_eq!(pemng.find_pe(&platform, &vpes, &spm, None, true, None), Some(1));
        assert_eq!(pemng.find_pe(&platform, &vpes, &spm, None, false, None), Some(2));

        // with pe 2 held by a non-muxable resident, only pe 1 can be shared
        add_vpe_on(&mut vpes, &mut pemng, 2, false);
        assert_eq!(pemng.find_pe(&platform, &vpes, &spm, None, false, None), None);
        assert_eq!(pemng.find_pe(&platform, &vpes, &spm, None, true, None), Some(1));
    }

    #[test]
    fn test_find_pe_respects_group() {
        let platform = test_platform();
        let mut vpes = VpeMng::new();
        let mut pemng = PeMng::new(&platform);

        let spm = PeDesc::new(PeType::CompImem, PeIsa::None, 0, false);
        let a = add_vpe_on(&mut vpes, &mut pemng, 1, true);
        let group = [a];
        assert_eq!(
            pemng.find_pe(&platform, &vpes, &spm, None, true, Some(&group)),
            Some(2)
        );
    }
}
