use crate::elf::ElfInfo;
use crate::vma::Vma;

/// Load state of an image the engine itself mapped into the target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DlState {
    Unloaded,
    Mapped,
    Relocated,
    Linked,
}

/// The set of VMAs that together realize one ELF image in the target,
/// plus the parsed view of its backing file.
///
/// Invariant: every VMA carries the same backing path.
#[derive(Debug)]
pub struct DlMap {
    pub id: u64,
    pub path: String,
    pub vmas: Vec<Vma>,
    pub ei: ElfInfo,
    pub state: DlState,
}

impl DlMap {
    /// The executable mapping; its start and file offset define the image's
    /// load base.
    pub fn exec_vma(&self) -> Option<&Vma> {
        self.vmas.iter().find(|v| v.is_exec())
    }

    /// Virtual address corresponding to file offset zero.
    pub fn load_base(&self) -> u64 {
        self.exec_vma()
            .map(|v| v.start - v.pgoff)
            .unwrap_or_else(|| self.start())
    }

    pub fn start(&self) -> u64 {
        self.vmas.first().map(|v| v.start).unwrap_or(0)
    }

    pub fn end(&self) -> u64 {
        self.vmas.last().map(|v| v.end).unwrap_or(0)
    }

    pub fn build_id(&self) -> Option<&str> {
        self.ei.build_id.as_deref()
    }

    /// File name component of the backing path, for `DT_NEEDED` matching.
    pub fn file_name(&self) -> &str {
        self.path.rsplit('/').next().unwrap_or(&self.path)
    }
}

pub fn find_dl_map_by_bid<'a>(maps: &'a [DlMap], bid: &str) -> Option<&'a DlMap> {
    maps.iter().find(|m| m.build_id() == Some(bid))
}

pub fn find_dl_map_by_addr(maps: &[DlMap], addr: u64) -> Option<&DlMap> {
    maps.iter()
        .find(|m| addr >= m.start() && addr < m.end() && m.vmas.iter().any(|v| v.contains(addr)))
}
