//! Dynamic-loader emulator: maps ELF images into the target at free holes,
//! through system calls executed remotely. Only what the linker would do for
//! `PT_LOAD` is reproduced; relocation is the resolver's job.

use std::os::unix::ffi::OsStrExt;
use std::path::Path;

use crate::dl_map::{DlMap, DlState};
use crate::elf::{ElfInfo, LoadSegment};
use crate::error::{Error, Result};
use crate::process::ProcessCtx;
use crate::vma::{self, find_vma_hole, Vma, PAGE_SIZE};

/// One remote `mmap` (plus optional anonymous tail and bss zeroing) derived
/// from a `PT_LOAD` program header. Addresses are image-relative; the final
/// placement adds the load slide.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegPlan {
    pub vaddr_page: u64,
    pub file_off: u64,
    pub file_len: u64,
    pub mem_end: u64,
    /// First byte past the file-backed contents that must read as zero, or 0
    /// when the segment has no bss.
    pub zero_start: u64,
    pub prot: u32,
}

/// Page-granular mapping plan for all load segments: the image-relative span
/// `[min, max)` and per-segment mappings.
pub fn plan_segments(segments: &[LoadSegment], page: u64) -> Result<(u64, u64, Vec<SegPlan>)> {
    if segments.is_empty() {
        return Err(Error::MalformedPatch("image has no load segments".into()));
    }

    let mut plans = Vec::with_capacity(segments.len());
    let mut min = u64::MAX;
    let mut max = 0u64;

    for seg in segments {
        if seg.memsz == 0 {
            continue;
        }
        let vaddr_page = seg.vaddr & !(page - 1);
        let file_off = seg.offset & !(page - 1);
        let file_len = if seg.filesz > 0 {
            round_up(seg.offset + seg.filesz, page) - file_off
        } else {
            0
        };
        let mem_end = round_up(seg.vaddr + seg.memsz, page);
        let zero_start = if seg.memsz > seg.filesz {
            seg.vaddr + seg.filesz
        } else {
            0
        };

        min = min.min(vaddr_page);
        max = max.max(mem_end);
        plans.push(SegPlan {
            vaddr_page,
            file_off,
            file_len,
            mem_end,
            zero_start,
            prot: prot_from_flags(seg.p_flags),
        });
    }

    if plans.is_empty() {
        return Err(Error::MalformedPatch("image has no loadable contents".into()));
    }
    Ok((min, max, plans))
}

fn prot_from_flags(p_flags: u32) -> u32 {
    let mut prot = 0;
    if p_flags & object::elf::PF_R != 0 {
        prot |= libc::PROT_READ as u32;
    }
    if p_flags & object::elf::PF_W != 0 {
        prot |= libc::PROT_WRITE as u32;
    }
    if p_flags & object::elf::PF_X != 0 {
        prot |= libc::PROT_EXEC as u32;
    }
    prot
}

fn round_up(v: u64, page: u64) -> u64 {
    (v + page - 1) & !(page - 1)
}

pub fn load_elf(ctx: &mut ProcessCtx, path: &Path, hint: u64) -> Result<u64> {
    let ei = ElfInfo::parse(path)?;
    load_elf_info(ctx, path, ei, hint)
}

/// Map all load segments of `ei` into the target at the lowest hole at or
/// above `hint` and register the result as a DL-map. A failure un-maps every
/// partial mapping before returning.
pub fn load_elf_info(ctx: &mut ProcessCtx, path: &Path, ei: ElfInfo, hint: u64) -> Result<u64> {
    log::info!("= Loading {}:", path.display());

    let page = *PAGE_SIZE;
    let (span_min, span_max, plans) = plan_segments(&ei.load_segments, page)?;
    let span = span_max - span_min;

    let base = find_vma_hole(&ctx.vmas, hint, span).ok_or(Error::NoHole(span))?;
    let slide = base - span_min;
    log::debug!("  placing at {base:#x} ({span:#x} bytes)");

    let fd = remote_open(ctx, path)?;

    let mut mapped: Vec<Vma> = Vec::new();
    let result = map_segments(ctx, &plans, slide, fd, path, &mut mapped);

    if let Err(err) = ctx.exec_syscall(libc::SYS_close, &[fd, 0, 0, 0, 0, 0]) {
        log::warn!("failed to close remote fd {fd}: {err}");
    }

    if let Err(err) = result {
        for v in &mapped {
            if let Err(e) = ctx.exec_syscall(libc::SYS_munmap, &[v.start, v.len(), 0, 0, 0, 0]) {
                log::error!("failed to unmap partial mapping at {:#x}: {e}", v.start);
            }
        }
        return Err(err);
    }

    for v in &mapped {
        vma::insert_sorted(&mut ctx.vmas, v.clone());
    }
    let id = ctx.alloc_dlm_id();
    ctx.dl_maps.push(DlMap {
        id,
        path: path.display().to_string(),
        vmas: mapped,
        ei,
        state: DlState::Mapped,
    });
    Ok(id)
}

fn map_segments(
    ctx: &mut ProcessCtx,
    plans: &[SegPlan],
    slide: u64,
    fd: u64,
    path: &Path,
    mapped: &mut Vec<Vma>,
) -> Result<()> {
    let path_str = path.display().to_string();

    for plan in plans {
        let addr = slide + plan.vaddr_page;
        let mem_end = slide + plan.mem_end;

        if plan.file_len > 0 {
            let ret = ctx.exec_syscall(
                libc::SYS_mmap,
                &[
                    addr,
                    plan.file_len,
                    plan.prot as u64,
                    (libc::MAP_PRIVATE | libc::MAP_FIXED) as u64,
                    fd,
                    plan.file_off,
                ],
            )?;
            if ret != addr {
                return Err(Error::Fault(addr));
            }
            mapped.push(Vma {
                start: addr,
                end: addr + plan.file_len,
                pgoff: plan.file_off,
                prot: plan.prot,
                shared: false,
                path: Some(path_str.clone()),
                deleted: false,
            });
        }

        let file_end = addr + plan.file_len;
        if mem_end > file_end {
            let ret = ctx.exec_syscall(
                libc::SYS_mmap,
                &[
                    file_end,
                    mem_end - file_end,
                    plan.prot as u64,
                    (libc::MAP_PRIVATE | libc::MAP_FIXED | libc::MAP_ANONYMOUS) as u64,
                    u64::MAX,
                    0,
                ],
            )?;
            if ret != file_end {
                return Err(Error::Fault(file_end));
            }
            mapped.push(Vma {
                start: file_end,
                end: mem_end,
                pgoff: 0,
                prot: plan.prot,
                shared: false,
                path: Some(path_str.clone()),
                deleted: false,
            });
        }

        // The bss tail shares its last page with file contents; the file
        // bytes there are garbage and must read as zero.
        if plan.zero_start != 0 {
            let zstart = slide + plan.zero_start;
            if file_end > zstart {
                let zeros = vec![0u8; (file_end - zstart) as usize];
                ctx.write_data(zstart, &zeros)?;
            }
        }
    }
    Ok(())
}

fn remote_open(ctx: &mut ProcessCtx, path: &Path) -> Result<u64> {
    let mut cpath = path.as_os_str().as_bytes().to_vec();
    cpath.push(0);
    let remote_path = ctx.write_scratch_data(&cpath)?;

    ctx.exec_syscall(
        libc::SYS_openat,
        &[
            libc::AT_FDCWD as i64 as u64,
            remote_path,
            libc::O_RDONLY as u64,
            0,
            0,
            0,
        ],
    )
}

/// Resolve and write a freshly mapped image's own relocations against the
/// rest of the process, then mark it linked. Mapped code is not runnable
/// before this: its GOT still holds file-relative values.
pub fn link_image(ctx: &mut ProcessCtx, dlm_id: u64) -> Result<()> {
    let (ei, base) = {
        let dlm = ctx.dlm(dlm_id)?;
        (dlm.ei.clone(), dlm.load_base())
    };

    let plan = crate::relocs::resolve_against_process(ctx, &ei, dlm_id)?;
    ctx.set_dlm_state(dlm_id, DlState::Relocated);

    crate::relocs::apply_relocations(ctx, base, &plan)?;
    ctx.set_dlm_state(dlm_id, DlState::Linked);
    Ok(())
}

/// Unmap every VMA composing the DL-map. Removal is idempotent so rollback
/// paths can call it blindly.
pub fn unload_elf(ctx: &mut ProcessCtx, dlm_id: u64) -> Result<()> {
    let Some(dlm) = ctx.remove_dl_map(dlm_id) else {
        return Ok(());
    };
    log::info!("= Unloading {}:", dlm.path);

    let mut first_err = None;
    for v in &dlm.vmas {
        if let Err(err) = ctx.exec_syscall(libc::SYS_munmap, &[v.start, v.len(), 0, 0, 0, 0]) {
            log::error!("failed to unmap {:#x}-{:#x}: {err}", v.start, v.end);
            first_err.get_or_insert(err);
        }
    }
    match first_err {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seg(vaddr: u64, memsz: u64, offset: u64, filesz: u64, p_flags: u32) -> LoadSegment {
        LoadSegment {
            vaddr,
            memsz,
            offset,
            filesz,
            align: 0x1000,
            p_flags,
        }
    }

    #[test]
    fn text_and_data_segments_plan() {
        let segments = [
            seg(0, 0x1234, 0, 0x1234, object::elf::PF_R | object::elf::PF_X),
            seg(0x2e50, 0x400, 0x1e50, 0x200, object::elf::PF_R | object::elf::PF_W),
        ];
        let (min, max, plans) = plan_segments(&segments, 0x1000).unwrap();

        assert_eq!(min, 0);
        assert_eq!(max, 0x4000);
        assert_eq!(plans.len(), 2);

        let text = &plans[0];
        assert_eq!(text.vaddr_page, 0);
        assert_eq!(text.file_len, 0x2000);
        assert_eq!(text.zero_start, 0);
        assert_eq!(
            text.prot,
            (libc::PROT_READ | libc::PROT_EXEC) as u32
        );

        // Data segment: file part covers 0x1000-0x3000 of the file, memory
        // runs to 0x3250 and the bss tail must be zeroed in place.
        let data = &plans[1];
        assert_eq!(data.vaddr_page, 0x2000);
        assert_eq!(data.file_off, 0x1000);
        assert_eq!(data.file_len, 0x2000);
        assert_eq!(data.mem_end, 0x4000);
        assert_eq!(data.zero_start, 0x2e50 + 0x200);
    }

    #[test]
    fn bss_only_segment_plans_anonymous() {
        let segments = [seg(0x5000, 0x3000, 0x1000, 0, object::elf::PF_R | object::elf::PF_W)];
        let (_, _, plans) = plan_segments(&segments, 0x1000).unwrap();
        assert_eq!(plans[0].file_len, 0);
        assert_eq!(plans[0].mem_end, 0x8000);
    }

    #[test]
    fn empty_image_is_rejected() {
        assert!(plan_segments(&[], 0x1000).is_err());
    }
}
