//! PLT/DYN relocation resolution against the target's live symbol tables,
//! and the RIP-relative static-reference fixups that are specific to patch
//! blobs.

use object::elf::{
    R_X86_64_64, R_X86_64_COPY, R_X86_64_GLOB_DAT, R_X86_64_JUMP_SLOT, R_X86_64_RELATIVE,
};

use crate::dl_map::DlMap;
use crate::elf::{ElfInfo, RawRela};
use crate::error::{Error, Result};
use crate::patch::{Patch, PatchInfo, StaticSym};
use crate::process::ProcessCtx;

/// Where a relocated value comes from. Patch-relative values are finalized
/// only when the patch's load base exists, which lets the whole plan be built
/// before the image is even mapped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SymValue {
    Abs(u64),
    PatchRel(u64),
}

#[derive(Debug, Clone)]
pub struct RelocPlan {
    pub offset: u64,
    pub value: SymValue,
    pub name: String,
}

/// Resolve every relocation of the patch blob. The plan is complete before a
/// single byte is written, so a late failure cannot leave the GOT
/// half-resolved. DYN entries come strictly before PLT entries.
///
/// Lookup cascade per symbol: the patch itself, then the target image, then
/// the target's `DT_NEEDED` closure plus any libraries loaded for the patch.
pub fn resolve_relocations(
    ctx: &ProcessCtx,
    patch_ei: &ElfInfo,
    target_id: u64,
    extra_dlms: &[u64],
) -> Result<Vec<RelocPlan>> {
    log::info!("= Resolving relocations:");

    let mut search: Vec<&DlMap> = vec![ctx.dlm(target_id)?];
    for id in ctx.needed_closure(target_id) {
        search.push(ctx.dlm(id)?);
    }
    for id in extra_dlms {
        search.push(ctx.dlm(*id)?);
    }

    resolve_with_search(patch_ei, &search)
}

/// Resolve an image's relocations against every other image in the process.
/// This is what makes libraries mapped by the loader emulator (the helper
/// service, missing `NEEDED` libraries) actually runnable: their GOT entries
/// must point at live code before anything calls into them.
pub fn resolve_against_process(
    ctx: &ProcessCtx,
    ei: &ElfInfo,
    exclude_id: u64,
) -> Result<Vec<RelocPlan>> {
    let search: Vec<&DlMap> = ctx
        .dl_maps
        .iter()
        .filter(|m| m.id != exclude_id)
        .collect();
    resolve_with_search(ei, &search)
}

fn resolve_with_search(ei: &ElfInfo, search: &[&DlMap]) -> Result<Vec<RelocPlan>> {
    let mut plan = Vec::with_capacity(ei.rela_dyn.len() + ei.rela_plt.len());
    for rela in ei.rela_dyn.iter().chain(ei.rela_plt.iter()) {
        plan.push(resolve_one(ei, search, rela)?);
    }

    log::debug!("  {} relocations resolved", plan.len());
    Ok(plan)
}

fn resolve_one(patch_ei: &ElfInfo, search: &[&DlMap], rela: &RawRela) -> Result<RelocPlan> {
    match rela.rtype {
        R_X86_64_RELATIVE => Ok(RelocPlan {
            offset: rela.offset,
            value: SymValue::PatchRel(rela.addend as u64),
            name: String::new(),
        }),
        R_X86_64_64 | R_X86_64_GLOB_DAT | R_X86_64_JUMP_SLOT => {
            let sym = patch_ei
                .dyn_syms
                .get(rela.sym as usize)
                .ok_or_else(|| Error::MalformedPatch(format!("bad symbol index {}", rela.sym)))?;

            let value = if !sym.undefined {
                // Defined inside the patch itself.
                SymValue::PatchRel(sym.value.wrapping_add(rela.addend as u64))
            } else if let Some((dlm, v)) = search
                .iter()
                .find_map(|d| d.ei.dyn_sym_value(&sym.name).map(|v| (d, v)))
            {
                SymValue::Abs(dlm.load_base().wrapping_add(v).wrapping_add(rela.addend as u64))
            } else if sym.weak {
                SymValue::Abs(0)
            } else {
                return Err(Error::UnresolvedSymbol(sym.name.clone()));
            };

            Ok(RelocPlan {
                offset: rela.offset,
                value,
                name: sym.name.clone(),
            })
        }
        // The patch must reference target data in place, never copy it.
        R_X86_64_COPY => Err(Error::MalformedPatch(format!(
            "COPY relocation at {:#x}",
            rela.offset
        ))),
        other => Err(Error::MalformedPatch(format!(
            "unsupported relocation type {other} at {:#x}",
            rela.offset
        ))),
    }
}

/// Write the planned values into the now-mapped patch image.
pub fn apply_relocations(ctx: &mut ProcessCtx, patch_base: u64, plan: &[RelocPlan]) -> Result<()> {
    log::info!("= Applying {} relocations:", plan.len());

    for r in plan {
        let value = match r.value {
            SymValue::Abs(v) => v,
            SymValue::PatchRel(off) => patch_base.wrapping_add(off),
        };
        let at = patch_base.wrapping_add(r.offset);
        if !r.name.is_empty() {
            log::debug!("  \"{}\" = {value:#x} at {at:#x}", r.name);
        }
        ctx.write_data(at, &value.to_le_bytes())?;
    }
    Ok(())
}

/// Sign-safe fit check: the high `64 - 8*size` bits of `reloc` must equal the
/// sign extension of its low bits.
pub fn reloc_fits(reloc: u64, size: u8) -> bool {
    if size >= 8 {
        return true;
    }
    let bits = 8 * size as u32;
    let sign = (reloc >> (bits - 1)) & 1;
    let high = (if sign == 1 { !reloc } else { reloc }) >> bits;
    high == 0
}

/// New operand bytes: the low `size` bytes carry the relocated offset, the
/// rest of the 8-byte window is preserved.
pub fn merge_ref_bytes(mut original: [u8; 8], reloc: u64, size: u8) -> [u8; 8] {
    let size = size as usize;
    original[..size].copy_from_slice(&reloc.to_le_bytes()[..size]);
    original
}

/// Validate every static reference against a pair of (possibly hypothetical)
/// load bases. The dry-run path uses this with the base a real apply would
/// have picked.
pub fn check_static_refs(pi: &PatchInfo, patch_base: u64, target_base: u64) -> Result<()> {
    for ss in &pi.static_syms {
        let (addr, reloc) = static_ref_value(ss, patch_base, target_base);
        if !reloc_fits(reloc, ss.patch_size) {
            return Err(Error::RelocOverflow {
                addr,
                reloc,
                size: ss.patch_size,
            });
        }
    }
    Ok(())
}

fn static_ref_value(ss: &StaticSym, patch_base: u64, target_base: u64) -> (u64, u64) {
    let addr = patch_base.wrapping_add(ss.patch_address);
    let reloc = ss
        .target_value
        .wrapping_add(target_base)
        .wrapping_sub(patch_base);
    (addr, reloc)
}

/// Rewrite each RIP-relative operand in the patch so it addresses the live
/// datum in the target image.
pub fn apply_static_refs(ctx: &mut ProcessCtx, p: &Patch) -> Result<()> {
    if p.pi.static_syms.is_empty() {
        return Ok(());
    }
    log::info!("= Fixing static variable references:");

    let patch_base = ctx.dlm(p.patch_dlm.ok_or(Error::StaleDlMap(0))?)?.load_base();
    let target_base = ctx.dlm(p.target_dlm.ok_or(Error::StaleDlMap(0))?)?.load_base();

    for ss in &p.pi.static_syms {
        let (addr, reloc) = static_ref_value(ss, patch_base, target_base);
        if !reloc_fits(reloc, ss.patch_size) {
            return Err(Error::RelocOverflow {
                addr,
                reloc,
                size: ss.patch_size,
            });
        }
        log::debug!(
            "  - ref at {addr:#x} ---> {:#x} ({target_base:#x} + {:#x})",
            addr.wrapping_add(reloc).wrapping_add(ss.patch_size as u64),
            addr.wrapping_add(reloc)
                .wrapping_add(ss.patch_size as u64)
                .wrapping_sub(target_base),
        );

        if ss.patch_size == 8 {
            ctx.write_data(addr, &reloc.to_le_bytes())?;
        } else {
            let mut original = [0u8; 8];
            ctx.read_data(addr, &mut original)?;
            let merged = merge_ref_bytes(original, reloc, ss.patch_size);
            ctx.write_data(addr, &merged)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn one_byte_fit_boundaries() {
        assert!(reloc_fits(127, 1));
        assert!(!reloc_fits(128, 1));
        assert!(reloc_fits((-128i64) as u64, 1));
        assert!(!reloc_fits((-129i64) as u64, 1));
    }

    #[test]
    fn four_byte_fit_boundaries() {
        assert!(reloc_fits(i32::MAX as u64, 4));
        assert!(!reloc_fits(1 << 31, 4));
        assert!(reloc_fits((i32::MIN as i64) as u64, 4));
        assert!(!reloc_fits((i32::MIN as i64 - 1) as u64, 4));
    }

    #[test]
    fn eight_bytes_always_fit() {
        assert!(reloc_fits(u64::MAX, 8));
        assert!(reloc_fits(0, 8));
    }

    #[test]
    fn merge_preserves_tail_bytes() {
        let original = [0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77, 0x88];
        let merged = merge_ref_bytes(original, 0xfffffffe, 4);
        assert_eq!(merged, [0xfe, 0xff, 0xff, 0xff, 0x55, 0x66, 0x77, 0x88]);

        let merged = merge_ref_bytes(original, 0x7f, 1);
        assert_eq!(merged, [0x7f, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77, 0x88]);
    }

    #[test]
    fn overflow_check_reports_erange_like_einval() {
        let pi = PatchInfo {
            arch: "EM_X86_64".into(),
            target_bid: String::new(),
            patch_bid: String::new(),
            func_jumps: Vec::new(),
            static_syms: vec![StaticSym {
                patch_address: 0,
                target_value: 0,
                patch_size: 1,
            }],
        };
        // target 128 bytes above the patch: does not fit in one byte.
        assert!(check_static_refs(&pi, 0x1000, 0x1080).is_err());
        assert!(check_static_refs(&pi, 0x1000, 0x107f).is_ok());
    }
}
