//! Per-thread user-space backtraces and the safety predicates gating every
//! memory-mutating phase.

use nix::sys::ptrace;
use nix::unistd::Pid;

use crate::arch::FUNC_JUMP_SIZE;
use crate::error::Result;
use crate::vma::{find_vma_by_addr, Vma};

const MAX_FRAMES: usize = 128;

/// Current instruction pointer plus the return addresses found by walking
/// the frame-pointer chain. Frames built without a frame pointer cut the
/// walk short; the gate then simply sees fewer frames.
pub fn collect_backtrace(tid: Pid, vmas: &[Vma]) -> Result<Vec<u64>> {
    let regs = ptrace::getregs(tid)?;
    let mut frames = vec![regs.rip];

    let Some(stack) = find_vma_by_addr(vmas, regs.rsp) else {
        return Ok(frames);
    };

    let mut fp = regs.rbp;
    while frames.len() < MAX_FRAMES {
        if fp & 7 != 0 || !stack.contains(fp) || !stack.contains(fp + 8) {
            break;
        }
        let Some(ret) = read_word(tid, fp + 8) else {
            break;
        };
        let Some(next) = read_word(tid, fp) else {
            break;
        };
        if ret == 0 {
            break;
        }
        frames.push(ret);
        if next <= fp {
            break;
        }
        fp = next;
    }

    Ok(frames)
}

/// Apply gate: no frame may point into a prologue that is about to be
/// rewritten, or a thread could return into a half-written jump.
pub fn check_func_jumps(frames: &[u64], load_base: u64, func_values: &[u64]) -> bool {
    frames.iter().all(|&addr| {
        func_values.iter().all(|&value| {
            let start = load_base.wrapping_add(value);
            addr < start || addr >= start + FUNC_JUMP_SIZE as u64
        })
    })
}

/// Revert gate: no frame may lie anywhere inside the image about to be
/// unmapped.
pub fn check_range(frames: &[u64], start: u64, end: u64) -> bool {
    frames.iter().all(|&addr| addr < start || addr >= end)
}

fn read_word(tid: Pid, addr: u64) -> Option<u64> {
    ptrace::read(tid, addr as usize as ptrace::AddressType)
        .ok()
        .map(|w| w as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn func_jump_gate_covers_the_full_prologue() {
        let base = 0x7f00_0000_0000;
        let values = [0x1000u64];

        assert!(check_func_jumps(&[base + 0x999], base, &values));
        assert!(!check_func_jumps(&[base + 0x1000], base, &values));
        assert!(!check_func_jumps(&[base + 0x1007], base, &values));
        assert!(check_func_jumps(&[base + 0x1008], base, &values));
    }

    #[test]
    fn range_gate_is_half_open() {
        assert!(check_range(&[0x0fff], 0x1000, 0x2000));
        assert!(!check_range(&[0x1000], 0x1000, 0x2000));
        assert!(!check_range(&[0x1fff], 0x1000, 0x2000));
        assert!(check_range(&[0x2000], 0x1000, 0x2000));
    }

    #[test]
    fn any_unsafe_frame_rejects_the_whole_stack() {
        let base = 0x1000;
        let frames = [0x50u64, base + 4, 0x9000];
        assert!(!check_func_jumps(&frames, base, &[0]));
    }
}
