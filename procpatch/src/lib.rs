//! Live binary patching of running Linux processes.
//!
//! Given a pid and a patch blob (a shared object carrying a `vzpatch`
//! section), the engine suspends the target, maps the blob into it, resolves
//! the blob's relocations against the target's live symbol tables, rewrites
//! the patched functions' prologues with relative jumps, and resumes. Revert
//! walks the same stages backwards. Any failure mid-way triggers
//! reverse-order compensation, and the target is resumed on every exit path.

use std::path::{Path, PathBuf};

use log::LevelFilter;

pub mod arch;
pub mod config;
pub mod dl_map;
pub mod elf;
pub mod error;
pub mod loader;
pub mod patch;
pub mod process;
pub mod relocs;
pub mod service;
pub mod vma;

pub use config::PatcherConfig;
pub use error::{Error, Result};

use crate::arch::FUNC_JUMP_SIZE;
use crate::dl_map::DlState;
use crate::elf::ElfInfo;
use crate::patch::{Patch, PatchInfo};
use crate::process::{Gate, ProcessCtx};

pub fn init_logging(level: LevelFilter) {
    let cfg = simplelog::ConfigBuilder::new().build();

    // Ignore the result so embedding next to another logger keeps working.
    let _ = simplelog::SimpleLogger::init(level, cfg);
}

fn init_patch(patchfile: &Path) -> Result<(ElfInfo, PatchInfo)> {
    let ei = ElfInfo::parse(patchfile)?;
    let raw = ei.vzpatch.as_deref().ok_or_else(|| {
        Error::MalformedPatch(format!(
            "{} has no {} section",
            patchfile.display(),
            elf::VZPATCH_SECTION
        ))
    })?;
    let pi = PatchInfo::parse(raw)?;

    if pi.arch != ei.machine {
        return Err(Error::UnsupportedArch(format!(
            "patch blob is {} but declares {}",
            ei.machine, pi.arch
        )));
    }
    Ok((ei, pi))
}

/// Apply `patchfile` to process `pid`.
///
/// `dry_run` validates everything that can be validated without a write and
/// performs none. `no_plugin` forbids injecting the helper service; every
/// transfer then rides on ptrace alone.
pub fn patch_process(
    cfg: &PatcherConfig,
    pid: i32,
    patchfile: &Path,
    dry_run: bool,
    no_plugin: bool,
) -> Result<()> {
    let (patch_ei, pi) = init_patch(patchfile)?;
    let ops = arch::by_name(&pi.arch).ok_or_else(|| Error::UnsupportedArch(pi.arch.clone()))?;

    log::info!("Patch context:");
    log::info!("  Pid            : {pid}");
    log::info!("  Patch path     : {}", patchfile.display());
    log::info!("  Target Build ID: {}", pi.target_bid);
    log::info!("  Patch Build ID : {}", pi.patch_bid);
    log::info!("  Architecture   : {}", pi.arch);

    let mut ctx = ProcessCtx::new(cfg, pid, ops, dry_run);
    let gate = Gate::FuncJumps {
        func_values: pi.func_jumps.iter().map(|fj| fj.func_value).collect(),
    };

    let ret = match ctx.suspend(&pi.target_bid, &gate) {
        Ok(()) => apply_patch(&mut ctx, patch_ei, pi, no_plugin),
        Err(err) => Err(err),
    };
    if let Err(err) = &ret {
        log::error!("failed to apply binary patch: {err}");
    }
    let resumed = ctx.resume();

    log::info!("Done");
    ret.and(resumed)
}

/// Revert a previously applied `patchfile` in process `pid`.
pub fn unpatch_process(cfg: &PatcherConfig, pid: i32, patchfile: &Path, dry_run: bool) -> Result<()> {
    let (_patch_ei, pi) = init_patch(patchfile)?;
    let ops = arch::by_name(&pi.arch).ok_or_else(|| Error::UnsupportedArch(pi.arch.clone()))?;

    log::info!("Revert context:");
    log::info!("  Pid           : {pid}");
    log::info!("  Patch path    : {}", patchfile.display());
    log::info!("  Patch Build ID: {}", pi.patch_bid);

    let mut ctx = ProcessCtx::new(cfg, pid, ops, dry_run);

    let ret = match ctx.suspend(&pi.patch_bid, &Gate::ImageRange) {
        Ok(()) => revert_patch(&mut ctx, &pi.patch_bid),
        Err(err) => Err(err),
    };
    if let Err(err) = &ret {
        log::error!("failed to revert patch: {err}");
    }
    let resumed = ctx.resume();

    log::info!("Done");
    ret.and(resumed)
}

/// Report whether `patchfile` is applied in `pid` without touching the
/// target: everything derives from a `/proc` scan.
pub fn check_process(cfg: &PatcherConfig, pid: i32, patchfile: &Path) -> Result<()> {
    let (_ei, pi) = init_patch(patchfile)?;
    let ops = arch::by_name(&pi.arch).ok_or_else(|| Error::UnsupportedArch(pi.arch.clone()))?;

    let mut ctx = ProcessCtx::new(cfg, pid, ops, false);
    ctx.collect_vmas()?;

    match patch::find_patch_by_bid(&ctx.applied, &pi.patch_bid) {
        Some(_) => Ok(()),
        None => Err(Error::PatchNotFound(pi.patch_bid)),
    }
}

/// Print every applied patch of `pid`: blob path, Build ID and the patched
/// image's path.
pub fn list_process_patches(cfg: &PatcherConfig, pid: i32) -> Result<()> {
    let ops = arch::by_name("EM_X86_64").ok_or_else(|| Error::UnsupportedArch("EM_X86_64".into()))?;
    let mut ctx = ProcessCtx::new(cfg, pid, ops, false);
    ctx.collect_vmas()?;

    for p in &ctx.applied {
        let path = p
            .patch_dlm
            .and_then(|id| ctx.dlm(id).ok())
            .map(|m| m.path.clone())
            .unwrap_or_default();
        match p.target_dlm.and_then(|id| ctx.dlm(id).ok()) {
            Some(target) => println!("  {} ({}) - {}", path, p.pi.patch_bid, target.path),
            None => println!("  {} ({})", path, p.pi.patch_bid),
        }
    }
    Ok(())
}

fn apply_patch(ctx: &mut ProcessCtx, patch_ei: ElfInfo, pi: PatchInfo, no_plugin: bool) -> Result<()> {
    log::info!("= Checking whether {} is already applied...", pi.patch_bid);
    if patch::find_patch_by_bid(&ctx.applied, &pi.patch_bid).is_some() {
        return Err(Error::AlreadyApplied(pi.patch_bid.clone()));
    }

    let target_id = ctx.find_target_dlm(&pi.target_bid)?;
    {
        let target = ctx.dlm(target_id)?;
        log::info!("  target image: {}", target.path);
        if target.ei.machine != pi.arch {
            return Err(Error::UnsupportedArch(format!(
                "patch is {} but target image is {}",
                pi.arch, target.ei.machine
            )));
        }
    }

    if !ctx.dry_run && !no_plugin {
        ctx.inject_service()?;
    }

    let needed_paths = ctx.collect_needed(&patch_ei)?;

    if ctx.dry_run {
        return dry_run_patch(ctx, &patch_ei, &pi, target_id, &needed_paths);
    }

    // Keep new images close to the target so rel32 encodings stay in range.
    let hint = ctx.dlm(target_id)?.end();

    let mut loaded_needed = Vec::new();
    for path in &needed_paths {
        let id = match loader::load_elf(ctx, path, hint) {
            Ok(id) => id,
            Err(err) => {
                unload_all(ctx, &loaded_needed);
                return Err(err);
            }
        };
        loaded_needed.push(id);
        if let Err(err) = loader::link_image(ctx, id) {
            unload_all(ctx, &loaded_needed);
            return Err(err);
        }
    }

    let result = apply_loaded(ctx, patch_ei, pi, target_id, &loaded_needed, hint);
    if result.is_err() {
        unload_all(ctx, &loaded_needed);
    }
    result
}

fn apply_loaded(
    ctx: &mut ProcessCtx,
    patch_ei: ElfInfo,
    pi: PatchInfo,
    target_id: u64,
    loaded_needed: &[u64],
    hint: u64,
) -> Result<()> {
    // The complete relocation plan exists before the first write; a late
    // failure cannot leave the GOT half-resolved.
    let plan = relocs::resolve_relocations(ctx, &patch_ei, target_id, loaded_needed)?;

    let patch_path = patch_ei.path.clone();
    let patch_id = loader::load_elf_info(ctx, &patch_path, patch_ei, hint)?;

    let mut p = Patch::new(pi);
    p.patch_dlm = Some(patch_id);
    p.target_dlm = Some(target_id);

    if let Err(err) = apply_mapped(ctx, &mut p, patch_id, &plan) {
        let upto = ctx.applied.len();
        if revert_func_jumps(ctx, &p, upto).is_err() {
            log::error!("failed to revert function jumps");
        }
        if loader::unload_elf(ctx, patch_id).is_err() {
            log::error!("failed to unload patch");
        }
        return Err(err);
    }

    // Registered only after every jump is in; a patch is either fully
    // applied or absent.
    ctx.applied.push(p);
    Ok(())
}

fn apply_mapped(
    ctx: &mut ProcessCtx,
    p: &mut Patch,
    patch_id: u64,
    plan: &[relocs::RelocPlan],
) -> Result<()> {
    let patch_base = ctx.dlm(patch_id)?.load_base();

    relocs::apply_relocations(ctx, patch_base, plan)?;
    ctx.set_dlm_state(patch_id, DlState::Relocated);

    relocs::apply_static_refs(ctx, p)?;
    tune_func_jumps(ctx, p)?;
    apply_func_jumps(ctx, p)?;

    ctx.set_dlm_state(patch_id, DlState::Linked);
    Ok(())
}

fn tune_func_jumps(ctx: &ProcessCtx, p: &mut Patch) -> Result<()> {
    log::info!("= Tuning function jumps:");

    let patch_dlm = ctx.dlm(p.patch_dlm.ok_or(Error::StaleDlMap(0))?)?;
    let target_dlm = ctx.dlm(p.target_dlm.ok_or(Error::StaleDlMap(0))?)?;
    patch::tune_func_jumps(p, patch_dlm, target_dlm, ctx.pid.as_raw())?;

    let patch_base = patch_dlm.load_base();
    for fj in &p.pi.func_jumps {
        log::info!("  - Function \"{}\":", fj.name);
        log::info!("      original address: {:#x}", fj.func_addr);
        log::info!(
            "      patch address   : {:#x}",
            patch_base.wrapping_add(fj.patch_value)
        );
    }
    Ok(())
}

fn apply_func_jumps(ctx: &mut ProcessCtx, p: &Patch) -> Result<()> {
    log::info!("= Applying function jumps:");

    for fj in &p.pi.func_jumps {
        log::info!("  - \"{}\": installing jump at {:#x}", fj.name, fj.func_addr);
        ctx.write_data(fj.func_addr, &fj.func_jump)?;
    }
    Ok(())
}

/// Per-jump revert with the live-bytes ownership test: a slot whose bytes no
/// longer match was taken over by a later patch and is left alone.
fn revert_func_jumps(ctx: &mut ProcessCtx, p: &Patch, upto: usize) -> Result<()> {
    log::info!("= Reverting function jumps:");

    for fj in &p.pi.func_jumps {
        if fj.func_addr == 0 {
            continue;
        }
        let mut live = [0u8; FUNC_JUMP_SIZE];
        ctx.read_data(fj.func_addr, &mut live)?;
        if live != fj.func_jump {
            log::debug!("  - \"{}\": owned by a later patch, skipping", fj.name);
            continue;
        }

        let restore: [u8; FUNC_JUMP_SIZE] =
            match patch::find_previous_func_jump(&ctx.applied, upto, p.target_dlm, fj.func_addr) {
                Some((prev, prev_fj)) => {
                    log::info!(
                        "  - \"{}\": re-installing jump of patch {}",
                        fj.name,
                        prev.pi.patch_bid
                    );
                    prev_fj.func_jump
                }
                None => {
                    log::info!("  - Restoring code in \"{}\":", fj.name);
                    log::info!("      old address: {:#x}", fj.func_addr);
                    fj.code
                }
            };
        ctx.write_data(fj.func_addr, &restore)?;
    }
    Ok(())
}

fn revert_patch(ctx: &mut ProcessCtx, patch_bid: &str) -> Result<()> {
    let Some(index) = ctx.applied.iter().position(|p| p.pi.patch_bid == patch_bid) else {
        return Err(Error::PatchNotFound(patch_bid.to_string()));
    };
    let p = ctx.applied[index].clone();

    if ctx.dry_run {
        log::info!("= Dry run: patch {} is applied, would revert", patch_bid);
        return Ok(());
    }

    if p.target_dlm.is_some() {
        revert_func_jumps(ctx, &p, index)?;
    }

    loader::unload_elf(ctx, p.patch_dlm.ok_or(Error::StaleDlMap(0))?)?;
    ctx.applied.remove(index);
    Ok(())
}

/// Everything an apply validates, against the placement a real apply would
/// pick, with no writes visible through any remote-access path.
fn dry_run_patch(
    ctx: &mut ProcessCtx,
    patch_ei: &ElfInfo,
    pi: &PatchInfo,
    target_id: u64,
    needed_paths: &[PathBuf],
) -> Result<()> {
    log::info!("= Dry run: validating without writing");

    let page = *vma::PAGE_SIZE;
    let (span_min, span_max, _) = loader::plan_segments(&patch_ei.load_segments, page)?;
    let span = span_max - span_min;

    let hint = ctx.dlm(target_id)?.end();
    let base = vma::find_vma_hole(&ctx.vmas, hint, span).ok_or(Error::NoHole(span))?;
    let patch_base = base - span_min;
    let target_base = ctx.dlm(target_id)?.load_base();

    if needed_paths.is_empty() {
        let plan = relocs::resolve_relocations(ctx, patch_ei, target_id, &[])?;
        log::info!("  {} relocations would be applied", plan.len());
    } else {
        log::info!(
            "  skipping relocation resolution: {} NEEDED libraries would be loaded first",
            needed_paths.len()
        );
    }

    relocs::check_static_refs(pi, patch_base, target_base)?;

    for fj in &pi.func_jumps {
        let func_addr = target_base.wrapping_add(fj.func_value);
        let patch_addr = patch_base.wrapping_add(fj.patch_value);
        ctx.arch.func_jump(func_addr, patch_addr)?;
        log::info!("  - \"{}\": {func_addr:#x} ---> {patch_addr:#x}", fj.name);
    }
    Ok(())
}

fn unload_all(ctx: &mut ProcessCtx, ids: &[u64]) {
    for id in ids.iter().rev() {
        if let Err(err) = loader::unload_elf(ctx, *id) {
            log::error!("failed to unload library during rollback: {err}");
        }
    }
}
