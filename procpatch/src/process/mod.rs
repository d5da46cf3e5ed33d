pub mod backtrace;
pub mod rma;

use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

use nix::errno::Errno;
use nix::sys::ptrace;
use nix::unistd::Pid;

use crate::arch::ArchOps;
use crate::config::PatcherConfig;
use crate::dl_map::{find_dl_map_by_bid, DlMap, DlState};
use crate::elf::ElfInfo;
use crate::error::{Error, Result};
use crate::patch::{self, Patch, PatchInfo};
use crate::service::Service;
use crate::vma::{self, Vma};

#[derive(Debug, Clone, Copy)]
pub struct Thread {
    pub tid: Pid,
}

/// Which stack frames make a suspension unsafe.
pub enum Gate {
    /// Applying: no thread may sit inside a prologue about to be rewritten.
    FuncJumps { func_values: Vec<u64> },
    /// Reverting: no thread may sit anywhere inside the image being unloaded.
    ImageRange,
}

/// Everything one orchestration call knows about the target. Dropping the
/// context detaches from whatever is still attached, so an error path can
/// never leave the target stopped.
pub struct ProcessCtx<'cfg> {
    pub cfg: &'cfg PatcherConfig,
    pub pid: Pid,
    pub arch: &'static dyn ArchOps,
    pub dry_run: bool,
    pub vmas: Vec<Vma>,
    pub dl_maps: Vec<DlMap>,
    pub threads: Vec<Thread>,
    /// Applied patches, oldest first, re-derived from the target's mappings.
    pub applied: Vec<Patch>,
    pub(crate) scratch: Option<u64>,
    pub(crate) service: Service,
    pub(crate) released_regs: Option<libc::user_regs_struct>,
    next_dlm_id: u64,
}

impl<'cfg> ProcessCtx<'cfg> {
    pub fn new(cfg: &'cfg PatcherConfig, pid: i32, arch: &'static dyn ArchOps, dry_run: bool) -> Self {
        Self {
            cfg,
            pid: Pid::from_raw(pid),
            arch,
            dry_run,
            vmas: Vec::new(),
            dl_maps: Vec::new(),
            threads: Vec::new(),
            applied: Vec::new(),
            scratch: None,
            service: Service::new(cfg.service_library.clone()),
            released_regs: None,
            next_dlm_id: 0,
        }
    }

    pub(crate) fn alloc_dlm_id(&mut self) -> u64 {
        self.next_dlm_id += 1;
        self.next_dlm_id
    }

    pub fn dlm(&self, id: u64) -> Result<&DlMap> {
        self.dl_maps
            .iter()
            .find(|m| m.id == id)
            .ok_or(Error::StaleDlMap(id))
    }

    pub(crate) fn main_tid(&self) -> Result<Pid> {
        // Prefer the thread-group leader; any stopped thread would do.
        self.threads
            .iter()
            .find(|t| t.tid == self.pid)
            .or_else(|| self.threads.first())
            .map(|t| t.tid)
            .ok_or_else(|| Error::ThreadNotStopped(self.pid.as_raw()))
    }

    /// Stop every thread of the target and keep them stopped, retrying until
    /// the backtrace gate holds. `bid` names the image the gate is about.
    pub fn suspend(&mut self, bid: &str, gate: &Gate) -> Result<()> {
        log::info!("= Suspending {}", self.pid);

        let mut attempt = 0;
        loop {
            self.attach_all()?;
            self.collect_vmas()?;

            if self.backtraces_safe(bid, gate)? {
                return Ok(());
            }

            attempt += 1;
            if attempt >= self.cfg.suspend_retries {
                return Err(Error::TargetBusy);
            }

            log::debug!("  backtrace gate failed, retry {attempt}");
            self.detach_all();
            std::thread::sleep(Duration::from_millis(self.cfg.suspend_retry_delay_ms));
        }
    }

    /// Undo everything `suspend` and later stages set up. Attempted on every
    /// exit path; keeps the first error but finishes all stages.
    pub fn resume(&mut self) -> Result<()> {
        let mut first_err = None;

        if let Err(err) = self.shutdown_service() {
            log::error!("failed to shut down service: {err}");
            first_err.get_or_insert(err);
        }
        if let Err(err) = self.drop_scratch() {
            log::error!("failed to drop scratch page: {err}");
            first_err.get_or_insert(err);
        }

        log::info!("= Resuming {}", self.pid);
        self.detach_all();

        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Attach to every thread, re-listing until no new ones appear. Threads
    /// spawned mid-attach land in the stopped set as well.
    fn attach_all(&mut self) -> Result<()> {
        loop {
            let tids = list_tids(self.pid)?;
            let mut new = 0;

            for tid in tids {
                if self.threads.iter().any(|t| t.tid == tid) {
                    continue;
                }
                match ptrace::attach(tid) {
                    Ok(()) => {}
                    // Raced with thread exit.
                    Err(Errno::ESRCH) => continue,
                    Err(err) => return Err(err.into()),
                }
                rma::wait_for_stop(tid)?;
                self.threads.push(Thread { tid });
                new += 1;
            }

            if new == 0 {
                log::debug!("  {} thread(s) stopped", self.threads.len());
                return Ok(());
            }
        }
    }

    fn detach_all(&mut self) {
        for thread in self.threads.drain(..) {
            if let Err(err) = ptrace::detach(thread.tid, None) {
                if err != Errno::ESRCH {
                    log::warn!("failed to detach from {}: {err}", thread.tid);
                }
            }
        }
    }

    fn backtraces_safe(&self, bid: &str, gate: &Gate) -> Result<bool> {
        let Some(dlm) = find_dl_map_by_bid(&self.dl_maps, bid) else {
            // Nothing to collide with; a missing target fails later lookups
            // with a clearer error.
            return Ok(true);
        };
        let (load_base, start, end) = (dlm.load_base(), dlm.start(), dlm.end());

        for thread in &self.threads {
            let frames = backtrace::collect_backtrace(thread.tid, &self.vmas)?;
            let safe = match gate {
                Gate::FuncJumps { func_values } => {
                    backtrace::check_func_jumps(&frames, load_base, func_values)
                }
                Gate::ImageRange => backtrace::check_range(&frames, start, end),
            };
            if !safe {
                log::debug!("  thread {} is inside the patched range", thread.tid);
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Scan `/proc/<pid>/maps`, group the regions into DL-maps and re-derive
    /// the applied-patch registry from `vzpatch`-bearing images.
    pub fn collect_vmas(&mut self) -> Result<()> {
        self.vmas = vma::collect_vmas(self.pid.as_raw())?;
        self.dl_maps.clear();

        let mut groups: Vec<(String, Vec<Vma>)> = Vec::new();
        for v in &self.vmas {
            let Some(path) = v.path.as_deref() else {
                continue;
            };
            // Pseudo-paths like [stack] and [vdso] are not ELF images.
            if !path.starts_with('/') {
                continue;
            }
            match groups.last_mut() {
                Some((p, vs)) if p.as_str() == path => vs.push(v.clone()),
                _ => groups.push((path.to_string(), vec![v.clone()])),
            }
        }

        for (path, vmas) in groups {
            // The map_files link survives unlinking of the backing file.
            let map_file = vmas[0].map_file(self.pid.as_raw());
            let ei = match ElfInfo::parse(&map_file).or_else(|_| ElfInfo::parse(&path)) {
                Ok(ei) => ei,
                Err(err) => {
                    log::debug!("  skipping {path}: {err}");
                    continue;
                }
            };
            let id = self.alloc_dlm_id();
            self.dl_maps.push(DlMap {
                id,
                path,
                vmas,
                ei,
                state: DlState::Linked,
            });
        }

        self.derive_applied()
    }

    fn derive_applied(&mut self) -> Result<()> {
        let mut applied = Vec::new();

        for dlm in &self.dl_maps {
            let Some(raw) = dlm.ei.vzpatch.as_deref() else {
                continue;
            };
            let pi = match PatchInfo::parse(raw) {
                Ok(pi) => pi,
                Err(err) => {
                    log::warn!("ignoring bad vzpatch payload in {}: {err}", dlm.path);
                    continue;
                }
            };

            let mut p = Patch::new(pi);
            p.patch_dlm = Some(dlm.id);
            p.target_dlm = find_dl_map_by_bid(&self.dl_maps, &p.pi.target_bid).map(|t| t.id);

            match p.target_dlm {
                Some(target_id) => {
                    let target = self
                        .dl_maps
                        .iter()
                        .find(|m| m.id == target_id)
                        .ok_or(Error::StaleDlMap(target_id))?;
                    patch::tune_func_jumps(&mut p, dlm, target, self.pid.as_raw())?;
                    self.print_dl_vmas(dlm);
                }
                None => log::warn!(
                    "failed to find image with Build ID {} in process {}",
                    p.pi.target_bid,
                    self.pid
                ),
            }
            applied.push(p);
        }

        self.applied = applied;
        Ok(())
    }

    pub fn find_target_dlm(&self, bid: &str) -> Result<u64> {
        find_dl_map_by_bid(&self.dl_maps, bid)
            .map(|m| m.id)
            .ok_or_else(|| Error::TargetNotFound(bid.to_string()))
    }

    /// Close the patch's `DT_NEEDED` list against what the target already has
    /// mapped; whatever is missing comes back as file paths for the loader.
    pub fn collect_needed(&self, ei: &ElfInfo) -> Result<Vec<PathBuf>> {
        let mut missing = Vec::new();

        log::info!("= Collecting NEEDED libraries:");
        for name in &ei.needed {
            if self.dl_maps.iter().any(|m| m.file_name() == name) {
                log::debug!("  {name}: already mapped");
                continue;
            }
            let path = resolve_library(name).ok_or_else(|| Error::BadImage {
                path: name.into(),
                what: "NEEDED library not found on disk".into(),
            })?;
            log::info!("  {name}: will load {}", path.display());
            missing.push(path);
        }
        Ok(missing)
    }

    /// DL-map ids of the target's `DT_NEEDED` closure, root excluded.
    pub fn needed_closure(&self, root: u64) -> Vec<u64> {
        let mut out = Vec::new();
        let mut queue = vec![root];
        let mut seen: HashSet<u64> = queue.iter().copied().collect();

        while let Some(id) = queue.pop() {
            let Some(dlm) = self.dl_maps.iter().find(|m| m.id == id) else {
                continue;
            };
            for name in &dlm.ei.needed {
                if let Some(dep) = self.dl_maps.iter().find(|m| m.file_name() == name) {
                    if seen.insert(dep.id) {
                        out.push(dep.id);
                        queue.push(dep.id);
                    }
                }
            }
        }
        out
    }

    pub fn find_dl_map_by_path(&self, file_name: &str) -> Option<&DlMap> {
        self.dl_maps.iter().find(|m| m.file_name() == file_name)
    }

    pub fn set_dlm_state(&mut self, id: u64, state: DlState) {
        if let Some(dlm) = self.dl_maps.iter_mut().find(|m| m.id == id) {
            dlm.state = state;
        }
    }

    pub fn remove_dl_map(&mut self, id: u64) -> Option<DlMap> {
        let pos = self.dl_maps.iter().position(|m| m.id == id)?;
        let dlm = self.dl_maps.remove(pos);
        self.vmas
            .retain(|v| !dlm.vmas.iter().any(|d| d.start == v.start));
        Some(dlm)
    }

    pub fn print_dl_vmas(&self, dlm: &DlMap) {
        for v in &dlm.vmas {
            log::debug!(
                "  {:#x}-{:#x} off {:#x} prot {:#x}{}",
                v.start,
                v.end,
                v.pgoff,
                v.prot,
                if v.deleted { " (deleted)" } else { "" }
            );
        }
    }
}

impl Drop for ProcessCtx<'_> {
    fn drop(&mut self) {
        // Last-resort cleanup; normal paths already ran resume().
        self.detach_all();
    }
}

fn list_tids(pid: Pid) -> Result<Vec<Pid>> {
    let task_dir = format!("/proc/{pid}/task");
    let entries = std::fs::read_dir(&task_dir).map_err(|err| {
        if err.kind() == std::io::ErrorKind::NotFound {
            Error::Sys(Errno::ESRCH)
        } else {
            err.into()
        }
    })?;

    let mut tids = Vec::new();
    for entry in entries {
        let entry = entry?;
        if let Ok(tid) = entry.file_name().to_string_lossy().parse::<i32>() {
            tids.push(Pid::from_raw(tid));
        }
    }
    tids.sort();
    Ok(tids)
}

/// Mimics the dynamic linker's search order closely enough for the libraries
/// a patch can reasonably pull in.
pub(crate) fn resolve_library(name: &str) -> Option<PathBuf> {
    let mut dirs: Vec<PathBuf> = Vec::new();
    if let Ok(ld_path) = std::env::var("LD_LIBRARY_PATH") {
        dirs.extend(ld_path.split(':').filter(|d| !d.is_empty()).map(Into::into));
    }
    dirs.extend(
        [
            "/lib/x86_64-linux-gnu",
            "/usr/lib/x86_64-linux-gnu",
            "/lib64",
            "/usr/lib64",
            "/lib",
            "/usr/lib",
        ]
        .into_iter()
        .map(PathBuf::from),
    );

    dirs.into_iter()
        .map(|d| d.join(name))
        .find(|p| p.exists())
}
