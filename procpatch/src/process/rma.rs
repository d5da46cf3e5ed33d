//! Remote memory access: reads, writes and code execution in the target.
//!
//! Small transfers ride on ptrace word copies and `process_vm_readv`; bulk
//! transfers are proxied through the helper service once it is connected.
//! `exec_code` stages a payload in the scratch page, points one stopped
//! thread at it, and runs until the payload's trailing trap fires.

use std::io::IoSliceMut;

use nix::errno::Errno;
use nix::sys::ptrace;
use nix::sys::signal::Signal;
use nix::sys::uio::{process_vm_readv, RemoteIoVec};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;

use crate::error::{Error, Result};
use crate::process::ProcessCtx;
use crate::vma::{self, Vma};

/// Size of the anonymous RWX mapping used to stage synthesized code.
pub const SCRATCH_SIZE: usize = 4096;
/// Code lives at the page start; operand data (path strings, register
/// snapshots) is staged past this offset.
pub const SCRATCH_DATA_OFF: u64 = 512;

const MAX_TRAP_BOUNCES: u32 = 16;

impl ProcessCtx<'_> {
    pub fn read_data(&mut self, addr: u64, buf: &mut [u8]) -> Result<()> {
        if buf.is_empty() {
            return Ok(());
        }
        if self.service_connected() && buf.len() > self.cfg.service_threshold {
            return self.service_read(addr, buf);
        }
        self.ensure_service_interrupted()?;

        let len = buf.len();
        let res = {
            let mut local = [IoSliceMut::new(buf)];
            let remote = [RemoteIoVec {
                base: addr as usize,
                len,
            }];
            process_vm_readv(self.pid, &mut local, &remote)
        };
        match res {
            Ok(n) if n == len => Ok(()),
            Ok(_) | Err(Errno::EFAULT) => Err(Error::Fault(addr)),
            // Fall back to the word-copy path when the fast path is fenced
            // off (Yama, seccomp) -- we are attached, so it is always legal.
            Err(Errno::EPERM) | Err(Errno::ENOSYS) => self.peek_bytes(addr, buf),
            Err(err) => Err(err.into()),
        }
    }

    pub fn write_data(&mut self, addr: u64, bytes: &[u8]) -> Result<()> {
        if bytes.is_empty() {
            return Ok(());
        }
        if self.service_connected() && bytes.len() > self.cfg.service_threshold {
            return self.service_write(addr, bytes);
        }
        self.ensure_service_interrupted()?;
        self.poke_bytes(addr, bytes)
    }

    pub(crate) fn peek_bytes(&self, addr: u64, buf: &mut [u8]) -> Result<()> {
        let tid = self.main_tid()?;
        let start = addr & !7;
        let end = (addr + buf.len() as u64 + 7) & !7;

        let mut raw = Vec::with_capacity((end - start) as usize);
        let mut pos = start;
        while pos < end {
            let word = peek_word(tid, pos).ok_or(Error::Fault(pos))?;
            raw.extend_from_slice(&word.to_ne_bytes());
            pos += 8;
        }

        let off = (addr - start) as usize;
        buf.copy_from_slice(&raw[off..off + buf.len()]);
        Ok(())
    }

    /// Word-granular read-modify-write. Works regardless of the mapping's
    /// protection, which is what the jump installer and static-reference
    /// fixups rely on when they rewrite text pages.
    pub(crate) fn poke_bytes(&self, addr: u64, bytes: &[u8]) -> Result<()> {
        let tid = self.main_tid()?;
        let start = addr & !7;
        let end = (addr + bytes.len() as u64 + 7) & !7;

        let mut raw = Vec::with_capacity((end - start) as usize);
        let mut pos = start;
        while pos < end {
            let word = peek_word(tid, pos).ok_or(Error::Fault(pos))?;
            raw.extend_from_slice(&word.to_ne_bytes());
            pos += 8;
        }

        let off = (addr - start) as usize;
        raw[off..off + bytes.len()].copy_from_slice(bytes);

        for (i, chunk) in raw.chunks_exact(8).enumerate() {
            let word = i64::from_ne_bytes(chunk.try_into().unwrap());
            let at = start + 8 * i as u64;
            ptrace::write(tid, at as usize as ptrace::AddressType, word)
                .map_err(|_| Error::Fault(at))?;
        }
        Ok(())
    }

    /// Execute `payload` in the scratch page of one stopped thread and return
    /// the value left in the accumulator register when its trap fires.
    pub fn exec_code(&mut self, payload: &[u8]) -> Result<i64> {
        if payload.len() as u64 > SCRATCH_DATA_OFF {
            return Err(Error::PayloadTooBig(payload.len()));
        }
        self.ensure_service_interrupted()?;
        let entry = self.ensure_scratch()?;
        self.poke_bytes(entry, payload)?;
        self.run_at(entry)
    }

    /// Install `payload` and resume the thread without waiting for it -- used
    /// to start the helper's resident run loop. `acquire` gets the thread
    /// back once the loop returns.
    pub fn release_at(&mut self, payload: &[u8]) -> Result<()> {
        if payload.len() as u64 > SCRATCH_DATA_OFF {
            return Err(Error::PayloadTooBig(payload.len()));
        }
        let entry = self.ensure_scratch()?;
        self.poke_bytes(entry, payload)?;

        let tid = self.main_tid()?;
        let saved = ptrace::getregs(tid)?;
        ptrace::setregs(tid, entry_regs(&saved, entry))?;
        ptrace::cont(tid, None)?;

        self.released_regs = Some(saved);
        Ok(())
    }

    /// Single-step the released thread back into a stopped state and restore
    /// its original registers.
    pub fn acquire(&mut self) -> Result<()> {
        let Some(saved) = self.released_regs.take() else {
            return Ok(());
        };
        let tid = self.main_tid()?;
        wait_for_trap(tid, false)?;
        ptrace::setregs(tid, saved)?;
        Ok(())
    }

    fn run_at(&self, entry: u64) -> Result<i64> {
        let tid = self.main_tid()?;
        let saved = ptrace::getregs(tid)?;
        ptrace::setregs(tid, entry_regs(&saved, entry))?;

        let result = wait_for_trap(tid, true);
        let restored = ptrace::setregs(tid, saved);

        let ret = result?;
        restored?;
        Ok(ret)
    }

    /// Issue a system call through the scratch page.
    pub fn exec_syscall(&mut self, nr: i64, args: &[u64; 6]) -> Result<u64> {
        let entry = self.ensure_scratch()?;
        let code = self.arch.syscall_code(entry, nr, args)?;
        syscall_ret(self.exec_code(&code)?)
    }

    /// Call an exported function of an injected library.
    pub fn exec_call(&mut self, name: &'static str, target: u64, args: &[u64]) -> Result<i64> {
        self.ensure_service_interrupted()?;
        let entry = self.ensure_scratch()?;
        let code = self.arch.call_code(entry, target, args)?;
        let ret = self.exec_code(&code)?;
        if ret < 0 {
            return Err(Error::RemoteCall(name, ret));
        }
        Ok(ret)
    }

    /// Stage operand data (a path string, a register snapshot) in the data
    /// half of the scratch page and return its remote address.
    pub fn write_scratch_data(&mut self, bytes: &[u8]) -> Result<u64> {
        if bytes.len() > SCRATCH_SIZE - SCRATCH_DATA_OFF as usize {
            return Err(Error::PayloadTooBig(bytes.len()));
        }
        let addr = self.ensure_scratch()? + SCRATCH_DATA_OFF;
        self.poke_bytes(addr, bytes)?;
        Ok(addr)
    }

    /// The 4 KiB anonymous RWX staging area, created on first use by
    /// overwriting the bytes under the stopped thread's instruction pointer
    /// with a bare `syscall; int3` -- the only way in before any scratch
    /// exists.
    pub(crate) fn ensure_scratch(&mut self) -> Result<u64> {
        if let Some(addr) = self.scratch {
            return Ok(addr);
        }

        log::info!("= Injecting scratch page into {}", self.pid);
        let ret = self.syscall_at_rip(
            libc::SYS_mmap,
            &[
                0,
                SCRATCH_SIZE as u64,
                (libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC) as u64,
                (libc::MAP_PRIVATE | libc::MAP_ANONYMOUS) as u64,
                u64::MAX,
                0,
            ],
        )?;
        let addr = syscall_ret(ret)?;
        log::debug!("  scratch page at {addr:#x}");

        self.scratch = Some(addr);
        vma::insert_sorted(
            &mut self.vmas,
            Vma {
                start: addr,
                end: addr + SCRATCH_SIZE as u64,
                pgoff: 0,
                prot: (libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC) as u32,
                shared: false,
                path: None,
                deleted: false,
            },
        );
        Ok(addr)
    }

    pub(crate) fn drop_scratch(&mut self) -> Result<()> {
        let Some(addr) = self.scratch.take() else {
            return Ok(());
        };
        if self.threads.is_empty() {
            return Ok(());
        }
        let ret = self.syscall_at_rip(libc::SYS_munmap, &[addr, SCRATCH_SIZE as u64, 0, 0, 0, 0])?;
        syscall_ret(ret)?;
        self.vmas.retain(|v| v.start != addr);
        Ok(())
    }

    /// Run one system call by temporarily planting `syscall; int3` at the
    /// stopped thread's current instruction pointer. Needs no scratch page,
    /// so it also bootstraps (and tears down) the scratch page itself.
    fn syscall_at_rip(&mut self, nr: i64, args: &[u64; 6]) -> Result<i64> {
        self.ensure_service_interrupted()?;
        let tid = self.main_tid()?;

        let saved = ptrace::getregs(tid)?;
        let insn_addr = saved.rip;
        let saved_word = peek_word(tid, insn_addr).ok_or(Error::Fault(insn_addr))?;

        let mut patched = saved_word.to_ne_bytes();
        patched[..3].copy_from_slice(&[0x0f, 0x05, 0xcc]);
        poke_word(tid, insn_addr, u64::from_ne_bytes(patched))?;

        let mut regs = saved;
        regs.rax = nr as u64;
        regs.rdi = args[0];
        regs.rsi = args[1];
        regs.rdx = args[2];
        regs.r10 = args[3];
        regs.r8 = args[4];
        regs.r9 = args[5];
        // A pending restartable syscall must not rewind rip onto our insn.
        regs.orig_rax = -1i64 as u64;
        let set = ptrace::setregs(tid, regs);

        let result = match set {
            Ok(()) => wait_for_trap(tid, true),
            Err(err) => Err(err.into()),
        };

        let unpoke = poke_word(tid, insn_addr, saved_word);
        let restore = ptrace::setregs(tid, saved);

        let ret = result?;
        unpoke?;
        restore?;
        Ok(ret)
    }
}

pub(crate) fn wait_for_stop(tid: Pid) -> Result<()> {
    match waitpid(tid, Some(WaitPidFlag::__WALL)) {
        Ok(WaitStatus::Stopped(_, _)) => Ok(()),
        Ok(_) => Err(Error::ThreadNotStopped(tid.as_raw())),
        Err(err) => Err(err.into()),
    }
}

/// Resume `tid` until the payload's trap fires; returns the accumulator.
/// Other stop signals are swallowed: the target must not run its handlers
/// while its memory is mid-rewrite.
fn wait_for_trap(tid: Pid, resume_first: bool) -> Result<i64> {
    let mut resume = resume_first;
    for _ in 0..MAX_TRAP_BOUNCES {
        if resume {
            ptrace::cont(tid, None)?;
        }
        resume = true;
        match waitpid(tid, Some(WaitPidFlag::__WALL))? {
            WaitStatus::Stopped(_, Signal::SIGTRAP) => {
                let regs = ptrace::getregs(tid)?;
                return Ok(regs.rax as i64);
            }
            WaitStatus::Stopped(_, sig) => {
                log::warn!("swallowing {sig} while executing in {tid}");
            }
            _ => return Err(Error::ThreadNotStopped(tid.as_raw())),
        }
    }
    Err(Error::ThreadNotStopped(tid.as_raw()))
}

fn peek_word(tid: Pid, addr: u64) -> Option<u64> {
    ptrace::read(tid, addr as usize as ptrace::AddressType)
        .ok()
        .map(|w| w as u64)
}

fn poke_word(tid: Pid, addr: u64, word: u64) -> Result<()> {
    ptrace::write(tid, addr as usize as ptrace::AddressType, word as i64)
        .map_err(|_| Error::Fault(addr))
}

fn entry_regs(saved: &libc::user_regs_struct, entry: u64) -> libc::user_regs_struct {
    let mut regs = *saved;
    regs.rip = entry;
    // Skip the red zone and realign; the payload starts with a call.
    regs.rsp = saved.rsp.wrapping_sub(256) & !0xf;
    regs.orig_rax = -1i64 as u64;
    regs
}

pub(crate) fn syscall_ret(ret: i64) -> Result<u64> {
    if ret < 0 && ret > -4096 {
        Err(Error::Sys(Errno::from_raw(-ret as i32)))
    } else {
        Ok(ret as u64)
    }
}
