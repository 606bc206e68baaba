//! The global VPE table
//!
//! Owns every VPE by id (a dense, reused integer), tracks how many are
//! alive and how many of those are daemons, and keeps the VPEs whose
//! service requirements are not yet satisfied in a pending list. The
//! cross-component orchestration (placement, switcher calls, shutdown
//! messages) happens in [`crate::kernel::Kernel`].

use alloc::boxed::Box;
use alloc::string::{String, ToString};
use alloc::vec;
use alloc::vec::Vec;

use crate::error::{KernError, KernResult};
use crate::pes::vpe::{Vpe, VpeFlags};
use crate::services::ServiceList;
use crate::types::VpeId;

/// Maximum number of live VPEs
pub const MAX_VPES: usize = 1024;

/// One program from the boot command line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootSpec {
    pub name: String,
    pub args: Vec<String>,
    pub daemon: bool,
    pub requirements: Vec<String>,
}

/// Walk the boot command line and collect the programs to start.
///
/// Tokens after a program belong to it until the next `--`; the tokens
/// `daemon` and `requires=<name>` are kernel arguments modifying the
/// program, `fs=<dev>:<part>` appends the synthesized name of the backing
/// disk (`hda0` style) to the program's arguments. The literal program
/// `idle` is recognized and skipped: every PE gets its idle VPE anyway.
pub fn parse_boot_line(args: &[String]) -> Vec<BootSpec> {
    let mut specs = Vec::new();
    let mut i = 0;
    while i < args.len() {
        if args[i] == "--" {
            i += 1;
            continue;
        }

        let name = args[i].clone();
        let mut spec = BootSpec {
            name: name.clone(),
            args: vec![name],
            daemon: false,
            requirements: Vec::new(),
        };

        let mut karg = false;
        let mut j = i + 1;
        while j < args.len() {
            let tok = &args[j];
            if tok == "daemon" {
                spec.daemon = true;
                karg = true;
            } else if let Some(req) = tok.strip_prefix("requires=") {
                spec.requirements.push(req.to_string());
                karg = true;
            } else if let Some(disk) = tok.strip_prefix("fs=") {
                if let Some(arg) = disk_name(disk) {
                    spec.args.push(arg);
                }
                karg = true;
            } else if tok == "--" {
                break;
            } else if karg {
                panic!("kernel argument before program argument: {}", tok);
            } else {
                spec.args.push(tok.clone());
            }
            j += 1;
        }

        if spec.name != "idle" {
            specs.push(spec);
        }
        i = j + 1;
    }
    specs
}

/// Synthesize the disk argument for `"<dev>:<part>"`
fn disk_name(spec: &str) -> Option<String> {
    let (dev, part) = spec.split_once(':')?;
    let dev: u8 = dev.parse().ok()?;
    let part: u8 = part.parse().ok()?;
    Some(alloc::format!("hd{}{}", (b'a' + dev) as char, part))
}

/// The VPE arena
pub struct VpeMng {
    next_id: VpeId,
    vpes: Vec<Option<Box<Vpe>>>,
    count: usize,
    daemons: usize,
    pending: Vec<VpeId>,
    shutdown_issued: bool,
}

impl VpeMng {
    pub fn new() -> Self {
        let mut vpes = Vec::new();
        vpes.resize_with(MAX_VPES, || None);
        Self {
            next_id: 0,
            vpes,
            count: 0,
            daemons: 0,
            pending: Vec::new(),
            shutdown_issued: false,
        }
    }

    /// Allocate the next free VPE id: probe upwards from the last one, then
    /// wrap around once
    pub fn get_id(&mut self) -> KernResult<VpeId> {
        let mut id = self.next_id;
        while id < MAX_VPES && self.vpes[id].is_some() {
            id += 1;
        }
        if id == MAX_VPES {
            id = 0;
            while id < MAX_VPES && self.vpes[id].is_some() {
                id += 1;
            }
        }
        if id == MAX_VPES {
            return Err(KernError::OutOfVpes);
        }
        self.next_id = id + 1;
        Ok(id)
    }

    /// Put a freshly constructed VPE into its slot
    pub fn insert(&mut self, vpe: Vpe) {
        let id = vpe.id();
        debug_assert!(self.vpes[id].is_none());
        if !vpe.flags().contains(VpeFlags::IDLE) {
            self.count += 1;
            if vpe.is_daemon() {
                self.daemons += 1;
            }
        }
        self.vpes[id] = Some(Box::new(vpe));
    }

    pub fn get(&self, id: VpeId) -> Option<&Vpe> {
        self.vpes.get(id).and_then(|s| s.as_deref())
    }

    pub fn vpe(&self, id: VpeId) -> &Vpe {
        self.vpes[id].as_deref().expect("no such VPE")
    }

    pub fn vpe_mut(&mut self, id: VpeId) -> &mut Vpe {
        self.vpes[id].as_deref_mut().expect("no such VPE")
    }

    /// Mark a VPE as daemon and account for it
    pub fn make_daemon(&mut self, id: VpeId) {
        let vpe = self.vpe_mut(id);
        if !vpe.is_daemon() {
            vpe.make_daemon();
            self.daemons += 1;
        }
    }

    /// Free the slot and update the counts; the caller decides whether this
    /// means stop or shutdown
    pub fn take(&mut self, id: VpeId) -> Option<Box<Vpe>> {
        let vpe = self.vpes[id].take()?;
        self.pending.retain(|&p| p != id);
        if !vpe.flags().contains(VpeFlags::IDLE) {
            debug_assert!(self.count > 0);
            self.count -= 1;
            if vpe.is_daemon() {
                debug_assert!(self.daemons > 0);
                self.daemons -= 1;
            }
        }
        Some(vpe)
    }

    /// Live VPEs (idle VPEs not counted)
    pub fn used(&self) -> usize {
        self.count
    }

    pub fn daemons(&self) -> usize {
        self.daemons
    }

    /// Park a VPE until its requirements are satisfied
    pub fn add_pending(&mut self, id: VpeId) {
        self.pending.push(id);
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Drain every pending VPE whose requirements are now all registered
    pub fn start_pending(&mut self, services: &ServiceList) -> Vec<VpeId> {
        let mut startable = Vec::new();
        let vpes = &self.vpes;
        self.pending.retain(|&id| {
            let vpe = vpes[id].as_deref().expect("pending VPE vanished");
            let fulfilled = vpe
                .requirements()
                .iter()
                .all(|r| services.find(r).is_some());
            if fulfilled {
                startable.push(id);
            }
            !fulfilled
        });
        startable
    }

    /// Whether shutdown has begun; flips to true exactly once
    pub fn begin_shutdown(&mut self) -> bool {
        if self.shutdown_issued {
            return false;
        }
        self.shutdown_issued = true;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pes::vpe::{Vpe, VpeFlags};

    fn vpe(id: VpeId) -> Vpe {
        Vpe::new(
            alloc::format!("v{}", id),
            1,
            id,
            VpeFlags::empty(),
            0,
            None,
        )
    }

    fn to_args(line: &str) -> Vec<String> {
        line.split_whitespace().map(String::from).collect()
    }

    #[test]
    fn test_id_allocation_reuses_after_death() {
        let mut mng = VpeMng::new();
        let a = mng.get_id().unwrap();
        mng.insert(vpe(a));
        let b = mng.get_id().unwrap();
        mng.insert(vpe(b));
        assert_eq!((a, b), (0, 1));

        mng.take(a).unwrap();
        // the probe continues upwards first and wraps around at the end
        let c = mng.get_id().unwrap();
        mng.insert(vpe(c));
        assert_eq!(c, 2);
        mng.take(b).unwrap();
        let d = mng.get_id().unwrap();
        assert_eq!(d, 3);
    }

    #[test]
    fn test_counts() {
        let mut mng = VpeMng::new();
        for _ in 0..3 {
            let id = mng.get_id().unwrap();
            mng.insert(vpe(id));
        }
        mng.make_daemon(1);
        mng.make_daemon(1);
        assert_eq!(mng.used(), 3);
        assert_eq!(mng.daemons(), 1);

        mng.take(0).unwrap();
        assert_eq!(mng.used(), 2);
        mng.take(1).unwrap();
        assert_eq!((mng.used(), mng.daemons()), (1, 0));
    }

    #[test]
    fn test_parse_single_program() {
        let specs = parse_boot_line(&to_args("hello"));
        assert_eq!(specs.len(), 1);
        assert_eq!(specs[0].name, "hello");
        assert_eq!(specs[0].args, to_args("hello"));
        assert!(!specs[0].daemon);
    }

    #[test]
    fn test_parse_kernel_args() {
        let specs = parse_boot_line(&to_args("pager daemon -- shell -b requires=pager"));
        assert_eq!(specs.len(), 2);
        assert!(specs[0].daemon);
        assert_eq!(specs[1].name, "shell");
        assert_eq!(specs[1].args, to_args("shell -b"));
        assert_eq!(specs[1].requirements, to_args("pager"));
    }

    #[test]
    fn test_parse_skips_idle() {
        let specs = parse_boot_line(&to_args("idle -- hello"));
        assert_eq!(specs.len(), 1);
        assert_eq!(specs[0].name, "hello");
    }

    #[test]
    fn test_parse_disk_argument() {
        let specs = parse_boot_line(&to_args("fsrv fs=0:2"));
        assert_eq!(specs[0].args, to_args("fsrv hda2"));
    }
}
