use std::io::{Read, Seek, SeekFrom};

use crate::arch::{self, FUNC_JUMP_SIZE};
use crate::dl_map::DlMap;
use crate::error::{Error, Result};

/// One function replacement described by the patch blob.
///
/// `code` and `func_jump` start out zeroed; tuning fills them in once the
/// load bases of both images are known.
#[derive(Debug, Clone)]
pub struct FuncJump {
    pub name: String,
    /// Offset of the original function inside the target ELF.
    pub func_value: u64,
    /// Offset of the replacement inside the patch ELF.
    pub patch_value: u64,
    /// Target section holding the original function.
    pub shndx: usize,
    /// The 8 bytes originally at the function entry, captured from the
    /// target's on-disk file before anything is overwritten.
    pub code: [u8; FUNC_JUMP_SIZE],
    /// The 8 bytes written to install the jump.
    pub func_jump: [u8; FUNC_JUMP_SIZE],
    /// Live address of the original function, once load bases are known.
    pub func_addr: u64,
}

/// A RIP-relative operand inside the patch that must be rewritten to address
/// a live datum in the target image.
#[derive(Debug, Clone, Copy)]
pub struct StaticSym {
    pub patch_address: u64,
    pub target_value: u64,
    /// Width of the operand: 1, 2, 4 or 8 bytes.
    pub patch_size: u8,
}

/// Parsed payload of a `vzpatch` section.
#[derive(Debug, Clone)]
pub struct PatchInfo {
    pub arch: String,
    pub target_bid: String,
    pub patch_bid: String,
    pub func_jumps: Vec<FuncJump>,
    pub static_syms: Vec<StaticSym>,
}

impl PatchInfo {
    /// Parse the length-prefixed little-endian record the patch generator
    /// wrote into the `vzpatch` section.
    pub fn parse(data: &[u8]) -> Result<Self> {
        let mut r = Reader::new(data);

        let total = r.u32()? as usize;
        if total != r.remaining() {
            return Err(malformed(format!(
                "payload length {total} does not match section size {}",
                r.remaining()
            )));
        }

        let arch = r.str16()?;
        let target_bid = r.str16()?;
        let patch_bid = r.str16()?;

        let n_jumps = r.u32()?;
        let mut func_jumps = Vec::with_capacity(n_jumps.min(4096) as usize);
        for _ in 0..n_jumps {
            let name = r.str16()?;
            let func_value = r.u64()?;
            let patch_value = r.u64()?;
            let shndx = r.u32()? as usize;
            func_jumps.push(FuncJump {
                name,
                func_value,
                patch_value,
                shndx,
                code: [0; FUNC_JUMP_SIZE],
                func_jump: [0; FUNC_JUMP_SIZE],
                func_addr: 0,
            });
        }

        let n_syms = r.u32()?;
        let mut static_syms = Vec::with_capacity(n_syms.min(4096) as usize);
        for _ in 0..n_syms {
            let patch_address = r.u64()?;
            let target_value = r.u64()?;
            let patch_size = r.u32()?;
            if !matches!(patch_size, 1 | 2 | 4 | 8) {
                return Err(malformed(format!("invalid static ref size {patch_size}")));
            }
            static_syms.push(StaticSym {
                patch_address,
                target_value,
                patch_size: patch_size as u8,
            });
        }

        if r.remaining() != 0 {
            return Err(malformed(format!("{} trailing bytes", r.remaining())));
        }

        Ok(Self {
            arch,
            target_bid,
            patch_bid,
            func_jumps,
            static_syms,
        })
    }
}

/// A patch blob's view inside one process: its parsed info, the DL-map it was
/// loaded as, and the DL-map it targets. The cross-links are DL-map ids, not
/// ownership; the target image outlives any patch applied to it.
#[derive(Debug, Clone)]
pub struct Patch {
    pub pi: PatchInfo,
    pub patch_dlm: Option<u64>,
    pub target_dlm: Option<u64>,
}

impl Patch {
    pub fn new(pi: PatchInfo) -> Self {
        Self {
            pi,
            patch_dlm: None,
            target_dlm: None,
        }
    }

    pub fn find_jump_by_addr(&self, func_addr: u64) -> Option<&FuncJump> {
        self.pi
            .func_jumps
            .iter()
            .find(|fj| fj.func_addr != 0 && fj.func_addr == func_addr)
    }
}

/// Applied patches, oldest first. No two entries share a `patch_bid`.
pub fn find_patch_by_bid<'a>(applied: &'a [Patch], bid: &str) -> Option<&'a Patch> {
    applied.iter().find(|p| p.pi.patch_bid == bid)
}

/// The most recent patch before position `upto` that also patches
/// `func_addr` in the same target image. Its jump is what a revert must
/// re-install; with no previous owner the on-disk bytes go back instead.
pub fn find_previous_func_jump<'a>(
    applied: &'a [Patch],
    upto: usize,
    target_dlm: Option<u64>,
    func_addr: u64,
) -> Option<(&'a Patch, &'a FuncJump)> {
    target_dlm?;

    applied[..upto.min(applied.len())]
        .iter()
        .rev()
        .find_map(|prev| {
            if prev.target_dlm != target_dlm {
                return None;
            }
            prev.find_jump_by_addr(func_addr).map(|fj| (prev, fj))
        })
}

/// Fill in the live address, the jump bytes and the original code of every
/// function jump, once both load bases are known.
///
/// The jump is a relative branch from the function entry in the target to the
/// replacement in the patch image; the distance between the two placements
/// decides whether it can be encoded at all.
pub fn tune_func_jumps(
    p: &mut Patch,
    patch_dlm: &DlMap,
    target_dlm: &DlMap,
    pid: i32,
) -> Result<()> {
    let ops = arch::by_name(&p.pi.arch).ok_or_else(|| Error::UnsupportedArch(p.pi.arch.clone()))?;
    let target_base = target_dlm.load_base();
    let patch_base = patch_dlm.load_base();

    for fj in &mut p.pi.func_jumps {
        fj.func_addr = target_base.wrapping_add(fj.func_value);
        let patch_addr = patch_base.wrapping_add(fj.patch_value);
        fj.func_jump = ops.func_jump(fj.func_addr, patch_addr)?;
        fj.code = read_func_jump_code(target_dlm, fj, pid)?;
    }
    Ok(())
}

/// The byte-exact original prologue, read from the target's on-disk file --
/// never from live memory, which may already carry another patch's jump.
fn read_func_jump_code(
    target_dlm: &DlMap,
    fj: &FuncJump,
    pid: i32,
) -> Result<[u8; FUNC_JUMP_SIZE]> {
    let section = target_dlm.ei.section(fj.shndx).ok_or_else(|| {
        malformed(format!(
            "function \"{}\" names section {} which the target lacks",
            fj.name, fj.shndx
        ))
    })?;
    if fj.func_value < section.addr || fj.func_value >= section.addr + section.size {
        return Err(malformed(format!(
            "function \"{}\" at {:#x} lies outside its section",
            fj.name, fj.func_value
        )));
    }
    let offset = section.file_off + (fj.func_value - section.addr);

    // The map_files link still resolves when the backing file was unlinked.
    let exec_vma = target_dlm
        .exec_vma()
        .ok_or(Error::StaleDlMap(target_dlm.id))?;
    let mut file = std::fs::File::open(exec_vma.map_file(pid))
        .or_else(|_| std::fs::File::open(&target_dlm.path))?;

    file.seek(SeekFrom::Start(offset))?;
    let mut code = [0u8; FUNC_JUMP_SIZE];
    file.read_exact(&mut code)?;
    Ok(code)
}

fn malformed(what: String) -> Error {
    Error::MalformedPatch(what)
}

struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    fn bytes(&mut self, n: usize) -> Result<&'a [u8]> {
        let end = self.pos.checked_add(n).filter(|&e| e <= self.data.len());
        let end = end.ok_or_else(|| malformed("truncated payload".into()))?;
        let out = &self.data[self.pos..end];
        self.pos = end;
        Ok(out)
    }

    fn u32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.bytes(4)?.try_into().unwrap()))
    }

    fn u64(&mut self) -> Result<u64> {
        Ok(u64::from_le_bytes(self.bytes(8)?.try_into().unwrap()))
    }

    fn str16(&mut self) -> Result<String> {
        let len = u16::from_le_bytes(self.bytes(2)?.try_into().unwrap()) as usize;
        let raw = self.bytes(len)?;
        String::from_utf8(raw.to_vec()).map_err(|_| malformed("string is not UTF-8".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn put_str(out: &mut Vec<u8>, s: &str) {
        out.extend((s.len() as u16).to_le_bytes());
        out.extend(s.as_bytes());
    }

    /// Builds a payload the way the generator does.
    fn build_payload(
        arch: &str,
        target_bid: &str,
        patch_bid: &str,
        jumps: &[(&str, u64, u64, u32)],
        syms: &[(u64, u64, u32)],
    ) -> Vec<u8> {
        let mut body = Vec::new();
        put_str(&mut body, arch);
        put_str(&mut body, target_bid);
        put_str(&mut body, patch_bid);
        body.extend((jumps.len() as u32).to_le_bytes());
        for (name, func_value, patch_value, shndx) in jumps {
            put_str(&mut body, name);
            body.extend(func_value.to_le_bytes());
            body.extend(patch_value.to_le_bytes());
            body.extend(shndx.to_le_bytes());
        }
        body.extend((syms.len() as u32).to_le_bytes());
        for (patch_address, target_value, patch_size) in syms {
            body.extend(patch_address.to_le_bytes());
            body.extend(target_value.to_le_bytes());
            body.extend(patch_size.to_le_bytes());
        }

        let mut out = Vec::new();
        out.extend((body.len() as u32).to_le_bytes());
        out.extend(body);
        out
    }

    fn applied_patch(bid: &str, target_dlm: u64, jumps: &[(u64, [u8; 8])]) -> Patch {
        let mut p = Patch::new(PatchInfo {
            arch: "EM_X86_64".into(),
            target_bid: "aa".into(),
            patch_bid: bid.into(),
            func_jumps: jumps
                .iter()
                .map(|&(addr, jump)| FuncJump {
                    name: "f".into(),
                    func_value: 0,
                    patch_value: 0,
                    shndx: 1,
                    code: [0; 8],
                    func_jump: jump,
                    func_addr: addr,
                })
                .collect(),
            static_syms: Vec::new(),
        });
        p.target_dlm = Some(target_dlm);
        p
    }

    #[test]
    fn payload_round_trip() {
        let data = build_payload(
            "EM_X86_64",
            "11aabb",
            "22ccdd",
            &[("do_work", 0x1234, 0x40, 14)],
            &[(0x2000, 0x8000, 4)],
        );
        let pi = PatchInfo::parse(&data).unwrap();

        assert_eq!(pi.arch, "EM_X86_64");
        assert_eq!(pi.target_bid, "11aabb");
        assert_eq!(pi.patch_bid, "22ccdd");
        assert_eq!(pi.func_jumps.len(), 1);
        assert_eq!(pi.func_jumps[0].name, "do_work");
        assert_eq!(pi.func_jumps[0].func_value, 0x1234);
        assert_eq!(pi.func_jumps[0].shndx, 14);
        assert_eq!(pi.static_syms.len(), 1);
        assert_eq!(pi.static_syms[0].patch_size, 4);
    }

    #[test]
    fn truncated_payload_is_rejected() {
        let data = build_payload("EM_X86_64", "aa", "bb", &[("f", 1, 2, 3)], &[]);
        for cut in [0, 4, 10, data.len() - 1] {
            assert!(PatchInfo::parse(&data[..cut]).is_err());
        }
    }

    #[test]
    fn bad_static_size_is_rejected() {
        let data = build_payload("EM_X86_64", "aa", "bb", &[], &[(0, 0, 3)]);
        let err = PatchInfo::parse(&data).unwrap_err();
        assert_eq!(err.code(), libc::EINVAL);
    }

    #[test]
    fn registry_bids_are_unique_lookups() {
        let applied = vec![
            applied_patch("p1", 7, &[(0x1000, [1; 8])]),
            applied_patch("p2", 7, &[(0x2000, [2; 8])]),
        ];
        assert!(find_patch_by_bid(&applied, "p1").is_some());
        assert!(find_patch_by_bid(&applied, "p3").is_none());
    }

    #[test]
    fn previous_owner_is_most_recent_prior_patch() {
        let applied = vec![
            applied_patch("p1", 7, &[(0x1000, [1; 8])]),
            applied_patch("p2", 7, &[(0x1000, [2; 8])]),
            applied_patch("p3", 7, &[(0x1000, [3; 8])]),
        ];

        let (owner, fj) = find_previous_func_jump(&applied, 2, Some(7), 0x1000).unwrap();
        assert_eq!(owner.pi.patch_bid, "p2");
        assert_eq!(fj.func_jump, [2; 8]);

        // The oldest patch has no previous owner; revert restores disk bytes.
        assert!(find_previous_func_jump(&applied, 0, Some(7), 0x1000).is_none());
    }

    #[test]
    fn previous_owner_ignores_other_targets() {
        let applied = vec![
            applied_patch("p1", 3, &[(0x1000, [1; 8])]),
            applied_patch("p2", 7, &[(0x1000, [2; 8])]),
        ];
        assert!(find_previous_func_jump(&applied, 1, Some(7), 0x1000).is_none());
    }

    #[test]
    fn unregistered_patch_scans_the_whole_registry() {
        let applied = vec![applied_patch("p1", 7, &[(0x1000, [1; 8])])];
        let (owner, _) = find_previous_func_jump(&applied, applied.len(), Some(7), 0x1000).unwrap();
        assert_eq!(owner.pi.patch_bid, "p1");
    }
}
