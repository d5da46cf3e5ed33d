use std::path::{Path, PathBuf};

use object::elf::{Dyn64, Rela64};
use object::read::File;
use object::{elf, Architecture, LittleEndian, Object, ObjectSection, ObjectSegment, ObjectSymbol};

use crate::error::{Error, Result};

/// Name of the section a patch generator adds to a patch blob.
pub const VZPATCH_SECTION: &str = "vzpatch";

/// Everything the engine needs from one ELF file, extracted eagerly so the
/// struct owns no borrow into the raw file data. The file itself is re-opened
/// by whoever needs bytes (the jump installer reads original prologues from
/// disk, the loader maps segments in the target).
#[derive(Debug, Clone)]
pub struct ElfInfo {
    pub path: PathBuf,
    pub machine: String,
    pub build_id: Option<String>,
    pub sections: Vec<SectionInfo>,
    /// Dynamic symbols, indexed by their `.dynsym` index.
    pub dyn_syms: Vec<DynSym>,
    pub needed: Vec<String>,
    pub rela_dyn: Vec<RawRela>,
    pub rela_plt: Vec<RawRela>,
    pub load_segments: Vec<LoadSegment>,
    pub vzpatch: Option<Vec<u8>>,
}

#[derive(Debug, Clone)]
pub struct SectionInfo {
    pub index: usize,
    pub name: String,
    pub addr: u64,
    pub file_off: u64,
    pub size: u64,
}

#[derive(Debug, Clone, Default)]
pub struct DynSym {
    pub name: String,
    pub value: u64,
    pub weak: bool,
    pub undefined: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct RawRela {
    pub offset: u64,
    pub sym: u32,
    pub rtype: u32,
    pub addend: i64,
}

#[derive(Debug, Clone, Copy)]
pub struct LoadSegment {
    pub vaddr: u64,
    pub memsz: u64,
    pub offset: u64,
    pub filesz: u64,
    pub align: u64,
    /// ELF `p_flags` of the segment.
    pub p_flags: u32,
}

impl ElfInfo {
    pub fn parse(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let data = std::fs::read(&path)?;
        let file = File::parse(&*data)?;

        if !file.is_little_endian() {
            return Err(Error::BadImage {
                path,
                what: "big-endian images are not supported".into(),
            });
        }

        let machine = match file.architecture() {
            Architecture::X86_64 => "EM_X86_64".to_string(),
            Architecture::I386 => "EM_386".to_string(),
            other => format!("{other:?}"),
        };

        let build_id = file.build_id()?.map(hex);

        let mut sections = Vec::new();
        for section in file.sections() {
            sections.push(SectionInfo {
                index: section.index().0,
                name: section.name().unwrap_or_default().to_string(),
                addr: section.address(),
                file_off: section.file_range().map(|(off, _)| off).unwrap_or(0),
                size: section.size(),
            });
        }

        let mut dyn_syms: Vec<DynSym> = Vec::new();
        for sym in file.dynamic_symbols() {
            let index = sym.index().0;
            if dyn_syms.len() <= index {
                dyn_syms.resize(index + 1, DynSym::default());
            }
            dyn_syms[index] = DynSym {
                name: sym.name().unwrap_or_default().to_string(),
                value: sym.address(),
                weak: sym.is_weak(),
                undefined: sym.is_undefined(),
            };
        }

        let mut load_segments = Vec::new();
        for segment in file.segments() {
            let (offset, filesz) = segment.file_range();
            let p_flags = match segment.flags() {
                object::SegmentFlags::Elf { p_flags } => p_flags,
                _ => 0,
            };
            load_segments.push(LoadSegment {
                vaddr: segment.address(),
                memsz: segment.size(),
                offset,
                filesz,
                align: segment.align(),
                p_flags,
            });
        }

        // The dynamic table and relocation sections are read as raw ELF64
        // records; 32-bit images keep them empty and the loader rejects them.
        let mut needed = Vec::new();
        let mut rela_dyn = Vec::new();
        let mut rela_plt = Vec::new();
        if file.is_64() {
            needed = parse_needed(&file, &path)?;
            rela_dyn = parse_rela(&file, ".rela.dyn", &path)?;
            rela_plt = parse_rela(&file, ".rela.plt", &path)?;
        }

        let vzpatch = match file.section_by_name(VZPATCH_SECTION) {
            Some(section) => Some(section.data()?.to_vec()),
            None => None,
        };

        Ok(Self {
            path,
            machine,
            build_id,
            sections,
            dyn_syms,
            needed,
            rela_dyn,
            rela_plt,
            load_segments,
            vzpatch,
        })
    }

    pub fn has_vzpatch(&self) -> bool {
        self.vzpatch.is_some()
    }

    pub fn section(&self, index: usize) -> Option<&SectionInfo> {
        self.sections.iter().find(|s| s.index == index)
    }

    /// Value of a defined dynamic symbol, if the image exports one by this name.
    pub fn dyn_sym_value(&self, name: &str) -> Option<u64> {
        self.dyn_syms
            .iter()
            .find(|s| !s.undefined && s.name == name)
            .map(|s| s.value)
    }

    /// File offset backing a virtual address, resolved through the section
    /// that contains it.
    pub fn file_offset_of(&self, vaddr: u64) -> Option<u64> {
        self.sections
            .iter()
            .find(|s| s.addr != 0 && vaddr >= s.addr && vaddr < s.addr + s.size)
            .map(|s| s.file_off + (vaddr - s.addr))
    }
}

fn parse_needed(file: &File<'_>, path: &Path) -> Result<Vec<String>> {
    let Some(dynamic) = file.section_by_name(".dynamic") else {
        return Ok(Vec::new());
    };
    let Some(dynstr) = file.section_by_name(".dynstr") else {
        return Ok(Vec::new());
    };
    let dyn_data = dynamic.data()?;
    let str_data = dynstr.data()?;

    let dyn_count = dyn_data.len() / std::mem::size_of::<Dyn64<LittleEndian>>();
    let (entries, _): (&[Dyn64<LittleEndian>], _) =
        object::pod::slice_from_bytes(dyn_data, dyn_count).map_err(|()| Error::BadImage {
            path: path.to_path_buf(),
            what: "unreadable .dynamic section".into(),
        })?;

    let mut needed = Vec::new();
    for entry in entries {
        let tag = entry.d_tag.get(LittleEndian);
        if tag == elf::DT_NULL as u64 {
            break;
        }
        if tag == elf::DT_NEEDED as u64 {
            let off = entry.d_val.get(LittleEndian) as usize;
            if let Some(name) = read_cstr(str_data, off) {
                needed.push(name);
            }
        }
    }
    Ok(needed)
}

fn parse_rela(file: &File<'_>, section_name: &str, path: &Path) -> Result<Vec<RawRela>> {
    let Some(section) = file.section_by_name(section_name) else {
        return Ok(Vec::new());
    };
    let data = section.data()?;
    let rela_count = data.len() / std::mem::size_of::<Rela64<LittleEndian>>();
    let (entries, _): (&[Rela64<LittleEndian>], _) =
        object::pod::slice_from_bytes(data, rela_count).map_err(|()| Error::BadImage {
            path: path.to_path_buf(),
            what: format!("unreadable {section_name} section"),
        })?;

    Ok(entries
        .iter()
        .map(|r| RawRela {
            offset: r.r_offset.get(LittleEndian),
            sym: r.r_sym(LittleEndian, false),
            rtype: r.r_type(LittleEndian, false),
            addend: r.r_addend.get(LittleEndian),
        })
        .collect())
}

fn read_cstr(data: &[u8], offset: usize) -> Option<String> {
    let tail = data.get(offset..)?;
    let end = tail.iter().position(|&b| b == 0)?;
    Some(String::from_utf8_lossy(&tail[..end]).into_owned())
}

pub fn hex(bytes: &[u8]) -> String {
    use std::fmt::Write;

    bytes.iter().fold(String::new(), |mut out, b| {
        let _ = write!(out, "{b:02x}");
        out
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_formats_build_ids() {
        assert_eq!(hex(&[0xde, 0xad, 0x01]), "dead01");
        assert_eq!(hex(&[]), "");
    }

    #[test]
    fn cstr_reads_stop_at_nul() {
        let data = b"libc.so.6\0libm.so.6\0";
        assert_eq!(read_cstr(data, 0).as_deref(), Some("libc.so.6"));
        assert_eq!(read_cstr(data, 10).as_deref(), Some("libm.so.6"));
        assert_eq!(read_cstr(data, 100), None);
    }
}
