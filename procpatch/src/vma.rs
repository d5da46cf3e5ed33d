use std::path::PathBuf;

use once_cell::sync::Lazy;

use crate::error::Result;

pub static PAGE_SIZE: Lazy<u64> = Lazy::new(|| {
    nix::unistd::sysconf(nix::unistd::SysconfVar::PAGE_SIZE)
        .ok()
        .flatten()
        .map(|v| v as u64)
        .unwrap_or(4096)
});

/// Lowest address mmap will hand out on a default `vm.mmap_min_addr` system.
const MMAP_MIN_ADDR: u64 = 0x1_0000;
/// Upper bound for placement; keeps new mappings clear of the kernel-reserved
/// top of the user address space (vsyscall page, stack guard area).
const TASK_ADDR_MAX: u64 = 0x7fff_ff00_0000;

/// One mapped region of the target, as reported by `/proc/<pid>/maps`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Vma {
    pub start: u64,
    pub end: u64,
    /// File offset of the mapping, in bytes.
    pub pgoff: u64,
    /// `libc::PROT_*` bits.
    pub prot: u32,
    pub shared: bool,
    pub path: Option<String>,
    /// The backing file was unlinked while mapped.
    pub deleted: bool,
}

impl Vma {
    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    pub fn contains(&self, addr: u64) -> bool {
        addr >= self.start && addr < self.end
    }

    pub fn is_exec(&self) -> bool {
        self.prot & libc::PROT_EXEC as u32 != 0
    }

    /// The `/proc/<pid>/map_files` link for this region. Readable even when
    /// the backing file has been unlinked.
    pub fn map_file(&self, pid: i32) -> PathBuf {
        PathBuf::from(format!(
            "/proc/{pid}/map_files/{:x}-{:x}",
            self.start, self.end
        ))
    }
}

/// Parse `/proc/<pid>/maps`. Entries come back ordered by start address with
/// disjoint ranges, which every lookup below relies on.
pub fn collect_vmas(pid: i32) -> Result<Vec<Vma>> {
    let maps = std::fs::read_to_string(format!("/proc/{pid}/maps"))?;
    Ok(maps.lines().filter_map(parse_maps_line).collect())
}

pub(crate) fn parse_maps_line(line: &str) -> Option<Vma> {
    let mut fields = line.split_whitespace();

    let range = fields.next()?;
    let (start, end) = range.split_once('-')?;
    let start = u64::from_str_radix(start, 16).ok()?;
    let end = u64::from_str_radix(end, 16).ok()?;

    let perms = fields.next()?.as_bytes();
    if perms.len() < 4 {
        return None;
    }
    let mut prot = 0u32;
    if perms[0] == b'r' {
        prot |= libc::PROT_READ as u32;
    }
    if perms[1] == b'w' {
        prot |= libc::PROT_WRITE as u32;
    }
    if perms[2] == b'x' {
        prot |= libc::PROT_EXEC as u32;
    }
    let shared = perms[3] == b's';

    let pgoff = u64::from_str_radix(fields.next()?, 16).ok()?;
    let _dev = fields.next()?;
    let _inode = fields.next()?;

    let rest: Vec<&str> = fields.collect();
    let (path, deleted) = match rest.as_slice() {
        [] => (None, false),
        parts => {
            let deleted = parts.last() == Some(&"(deleted)");
            let parts = if deleted {
                &parts[..parts.len() - 1]
            } else {
                parts
            };
            (Some(parts.join(" ")), deleted)
        }
    };

    Some(Vma {
        start,
        end,
        pgoff,
        prot,
        shared,
        path,
        deleted,
    })
}

pub fn find_vma_by_addr(vmas: &[Vma], addr: u64) -> Option<&Vma> {
    vmas.iter().find(|v| v.contains(addr))
}

pub fn find_vma_by_prot(vmas: &[Vma], prot: u32) -> Option<&Vma> {
    vmas.iter().find(|v| v.prot & prot == prot)
}

pub fn find_vma_by_path<'a>(vmas: &'a [Vma], path: &str) -> Option<&'a Vma> {
    vmas.iter().find(|v| v.path.as_deref() == Some(path))
}

/// Lowest gap of at least `size` bytes at or above `hint`, skipping the
/// kernel-reserved top of the address space. Placement prefers the lowest
/// acceptable hole so 32-bit relative jump and call encodings between the
/// target image and new mappings stay in range.
pub fn find_vma_hole(vmas: &[Vma], hint: u64, size: u64) -> Option<u64> {
    let page = *PAGE_SIZE;
    let mut cursor = hint.max(MMAP_MIN_ADDR);
    cursor = (cursor + page - 1) & !(page - 1);

    for vma in vmas {
        if vma.end <= cursor {
            continue;
        }
        if vma.start >= cursor && vma.start - cursor >= size {
            return Some(cursor);
        }
        cursor = cursor.max(vma.end);
    }

    if cursor <= TASK_ADDR_MAX && TASK_ADDR_MAX - cursor >= size {
        Some(cursor)
    } else {
        None
    }
}

/// Keep `vmas` sorted by start address when inserting freshly mapped regions.
pub fn insert_sorted(vmas: &mut Vec<Vma>, vma: Vma) {
    let pos = vmas.partition_point(|v| v.start < vma.start);
    vmas.insert(pos, vma);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vma(start: u64, end: u64) -> Vma {
        Vma {
            start,
            end,
            pgoff: 0,
            prot: libc::PROT_READ as u32,
            shared: false,
            path: None,
            deleted: false,
        }
    }

    #[test]
    fn parses_file_backed_line() {
        let line = "7f1a2b400000-7f1a2b5b0000 r-xp 00024000 fd:01 1835043 /usr/lib/x86_64-linux-gnu/libc.so.6";
        let vma = parse_maps_line(line).unwrap();
        assert_eq!(vma.start, 0x7f1a2b400000);
        assert_eq!(vma.end, 0x7f1a2b5b0000);
        assert_eq!(vma.pgoff, 0x24000);
        assert!(vma.is_exec());
        assert!(!vma.shared);
        assert_eq!(
            vma.path.as_deref(),
            Some("/usr/lib/x86_64-linux-gnu/libc.so.6")
        );
        assert!(!vma.deleted);
    }

    #[test]
    fn parses_anonymous_and_deleted_lines() {
        let anon = parse_maps_line("7ffd1000-7ffd2000 rw-p 00000000 00:00 0").unwrap();
        assert_eq!(anon.path, None);

        let deleted =
            parse_maps_line("400000-401000 r-xp 00000000 fd:01 42 /tmp/lib test.so (deleted)")
                .unwrap();
        assert_eq!(deleted.path.as_deref(), Some("/tmp/lib test.so"));
        assert!(deleted.deleted);
    }

    #[test]
    fn hole_prefers_lowest_gap_at_or_above_hint() {
        let vmas = vec![
            vma(0x100000, 0x200000),
            vma(0x200000, 0x300000),
            vma(0x500000, 0x600000),
        ];
        // The gap at 0x300000 is the lowest one above the hint.
        assert_eq!(find_vma_hole(&vmas, 0x100000, 0x1000), Some(0x300000));
        // A hint inside a gap starts the search there.
        assert_eq!(find_vma_hole(&vmas, 0x310000, 0x1000), Some(0x310000));
        // Too large for the gap, falls through past the last mapping.
        assert_eq!(find_vma_hole(&vmas, 0x100000, 0x300000), Some(0x600000));
    }

    #[test]
    fn hole_respects_address_space_limits() {
        let vmas = vec![vma(MMAP_MIN_ADDR, TASK_ADDR_MAX)];
        assert_eq!(find_vma_hole(&vmas, 0, 0x1000), None);
    }

    #[test]
    fn insert_keeps_order() {
        let mut vmas = vec![vma(0x1000, 0x2000), vma(0x5000, 0x6000)];
        insert_sorted(&mut vmas, vma(0x3000, 0x4000));
        let starts: Vec<u64> = vmas.iter().map(|v| v.start).collect();
        assert_eq!(starts, vec![0x1000, 0x3000, 0x5000]);
    }
}
