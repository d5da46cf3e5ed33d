use std::path::PathBuf;

/// Errors surfaced by the patch engine.
///
/// Every variant maps onto an errno-style exit code via [`Error::code`], so
/// scripted callers can tell "already applied" from "target busy" without
/// parsing log output.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("patch with Build ID {0} is already applied")]
    AlreadyApplied(String),
    #[error("no applied patch with Build ID {0} in target")]
    PatchNotFound(String),
    #[error("no mapped ELF with Build ID {0} in target")]
    TargetNotFound(String),
    #[error("backtrace check kept failing, target is busy")]
    TargetBusy,
    #[error("jump displacement {disp:#x} from {from:#x} does not fit in 32 bits")]
    JumpOutOfRange { from: u64, disp: i64 },
    #[error("relocation {reloc:#x} at {addr:#x} overflows a {size}-byte operand")]
    RelocOverflow { addr: u64, reloc: u64, size: u8 },
    #[error("malformed patch: {0}")]
    MalformedPatch(String),
    #[error("bad ELF image {path}: {what}")]
    BadImage { path: PathBuf, what: String },
    #[error("unsupported architecture \"{0}\"")]
    UnsupportedArch(String),
    #[error("failed to resolve symbol \"{0}\"")]
    UnresolvedSymbol(String),
    #[error("transfer of {0} bytes exceeds the service maximum of {1}")]
    TransferTooBig(usize, usize),
    #[error("payload of {0} bytes does not fit in the scratch page")]
    PayloadTooBig(usize),
    #[error("no free hole of {0:#x} bytes in the target address space")]
    NoHole(u64),
    #[error("stale dl-map reference {0}")]
    StaleDlMap(u64),
    #[error("thread {0} would not stop")]
    ThreadNotStopped(i32),
    #[error("unmapped target address {0:#x}")]
    Fault(u64),
    #[error("remote call to {0} returned {1}")]
    RemoteCall(&'static str, i64),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("system call failed: {0}")]
    Sys(#[from] nix::errno::Errno),
    #[error("ELF parsing failed: {0}")]
    Elf(#[from] object::read::Error),
    #[error("code assembly failed: {0}")]
    Asm(#[from] iced_x86::IcedError),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Errno-style exit code for the command line front end.
    pub fn code(&self) -> i32 {
        match self {
            Error::AlreadyApplied(_) => libc::EEXIST,
            Error::PatchNotFound(_) | Error::TargetNotFound(_) => libc::ENOENT,
            Error::TargetBusy => libc::EBUSY,
            Error::JumpOutOfRange { .. } => libc::ERANGE,
            Error::RelocOverflow { .. }
            | Error::MalformedPatch(_)
            | Error::BadImage { .. }
            | Error::UnsupportedArch(_)
            | Error::UnresolvedSymbol(_)
            | Error::PayloadTooBig(_)
            | Error::StaleDlMap(_) => libc::EINVAL,
            Error::TransferTooBig(..) => libc::E2BIG,
            Error::NoHole(_) => libc::ENOMEM,
            Error::ThreadNotStopped(_) => libc::EAGAIN,
            Error::Fault(_) => libc::EFAULT,
            Error::Sys(errno) => *errno as i32,
            Error::Io(_) | Error::Elf(_) | Error::Asm(_) | Error::RemoteCall(..) => libc::EIO,
        }
    }
}
