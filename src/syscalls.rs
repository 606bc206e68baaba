//! The kernel-call surface
//!
//! Messages on the kernel's receive endpoint decode into one operation
//! each; every operation has exactly one handler. Errors travel back to the
//! caller through its reply endpoint as a numeric code.

use alloc::string::String;

use crate::dtu::Message;
use crate::error::{KernError, KernResult};
use crate::kernel::Kernel;
use crate::types::{EpId, VpeDesc, VpeId};

/// Operation codes on the wire
mod opcodes {
    pub const CREATE_VPE: u64 = 0;
    pub const VPE_CTRL: u64 = 1;
    pub const EXIT: u64 = 2;
}

/// Sub-operations of VPE_CTRL
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VpeOp {
    Start,
    Stop,
    Yield,
}

/// A decoded kernel call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Syscall {
    CreateVpe {
        name: String,
        ep: EpId,
        muxable: bool,
    },
    VpeCtrl {
        vpe: VpeId,
        op: VpeOp,
        pid: i32,
    },
    Exit {
        code: i32,
    },
}

fn word(msg: &Message, idx: usize) -> KernResult<u64> {
    let off = idx * 8;
    let bytes = msg
        .data
        .get(off..off + 8)
        .ok_or(KernError::InvArgs)?;
    let mut buf = [0u8; 8];
    buf.copy_from_slice(bytes);
    Ok(u64::from_le_bytes(buf))
}

/// Decode a message into an operation
pub fn decode(msg: &Message) -> KernResult<Syscall> {
    match word(msg, 0)? {
        opcodes::CREATE_VPE => {
            let ep = word(msg, 1)? as EpId;
            let muxable = word(msg, 2)? != 0;
            let name_bytes = msg.data.get(24..).ok_or(KernError::InvArgs)?;
            let name = core::str::from_utf8(name_bytes)
                .map_err(|_| KernError::InvArgs)?
                .trim_end_matches('\0');
            Ok(Syscall::CreateVpe {
                name: String::from(name),
                ep,
                muxable,
            })
        }
        opcodes::VPE_CTRL => {
            let vpe = word(msg, 1)? as VpeId;
            let op = match word(msg, 2)? {
                0 => VpeOp::Start,
                1 => VpeOp::Stop,
                2 => VpeOp::Yield,
                _ => return Err(KernError::InvArgs),
            };
            let pid = word(msg, 3)? as i32;
            Ok(Syscall::VpeCtrl { vpe, op, pid })
        }
        opcodes::EXIT => Ok(Syscall::Exit {
            code: word(msg, 1)? as i32,
        }),
        _ => Err(KernError::InvArgs),
    }
}

/// Handle one message from the kernel's receive endpoint
pub fn handle(kernel: &mut Kernel, msg: &Message) {
    let caller = msg.header.sender_vpe as VpeId;
    klog!(KSYSC, "VPE {} -> {:?}", caller, decode(msg));

    let result = decode(msg).and_then(|call| dispatch(kernel, caller, call));
    reply(kernel, msg, result);
}

fn dispatch(kernel: &mut Kernel, caller: VpeId, call: Syscall) -> KernResult<()> {
    match call {
        Syscall::CreateVpe { name, ep, muxable } => {
            let desc = *kernel
                .platform()
                .pe(kernel.vpes().get(caller).ok_or(KernError::VpeGone)?.pe());
            kernel.create_vpe(name, desc, ep, None, muxable).map(|_| ())
        }
        Syscall::VpeCtrl { vpe, op, pid } => {
            if kernel.vpes().get(vpe).is_none() {
                return Err(KernError::VpeGone);
            }
            match op {
                VpeOp::Start => kernel.start_vpe_app(vpe, pid),
                VpeOp::Stop => kernel.remove_vpe(vpe),
                VpeOp::Yield => kernel.yield_vpe(vpe),
            }
        }
        Syscall::Exit { code } => {
            klog!(KSYSC, "VPE {} exited with {}", caller, code);
            kernel.remove_vpe(caller)
        }
    }
}

/// Report the outcome through the caller's reply endpoint
fn reply(kernel: &mut Kernel, msg: &Message, result: KernResult<()>) {
    let code = match result {
        Ok(()) => 0,
        Err(e) => e.code(),
    };
    let to = VpeDesc::new(msg.header.sender_pe as usize, msg.header.sender_vpe as usize);
    let _ = kernel.dtu().send_to(
        &to,
        msg.header.reply_ep as EpId,
        msg.header.reply_label,
        &code.to_le_bytes(),
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dtu::Header;
    use alloc::string::ToString;
    use alloc::vec::Vec;

    fn msg_of(words: &[u64], tail: &[u8]) -> Message {
        let mut data = Vec::new();
        for w in words {
            data.extend_from_slice(&w.to_le_bytes());
        }
        data.extend_from_slice(tail);
        Message {
            header: Header::default(),
            data,
        }
    }

    #[test]
    fn test_decode_create_vpe() {
        let msg = msg_of(&[opcodes::CREATE_VPE, 3, 1], b"shell\0\0\0");
        assert_eq!(
            decode(&msg).unwrap(),
            Syscall::CreateVpe {
                name: "shell".to_string(),
                ep: 3,
                muxable: true,
            }
        );
    }

    #[test]
    fn test_decode_vpe_ctrl() {
        let msg = msg_of(&[opcodes::VPE_CTRL, 7, 2, 0], &[]);
        assert_eq!(
            decode(&msg).unwrap(),
            Syscall::VpeCtrl {
                vpe: 7,
                op: VpeOp::Yield,
                pid: 0,
            }
        );
    }

    #[test]
    fn test_decode_rejects_garbage() {
        let msg = msg_of(&[99], &[]);
        assert_eq!(decode(&msg), Err(KernError::InvArgs));
        let short = msg_of(&[], &[1, 2, 3]);
        assert_eq!(decode(&short), Err(KernError::InvArgs));
    }
}
