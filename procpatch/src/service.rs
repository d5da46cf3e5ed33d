//! Channel to the in-target helper library.
//!
//! The helper is mapped by the loader like any other image, told to bind an
//! abstract seqpacket socket, and then either runs its loop resident (bulk
//! transfers) or one-shot (command processing while everything is stopped).
//! It stays mapped across invocations; only the socket and the loop are torn
//! down on resume.

use std::os::fd::{AsRawFd, OwnedFd};
use std::path::{Path, PathBuf};

use nix::errno::Errno;
use nix::sys::ptrace;
use nix::sys::socket::{connect, recv, send, socket, AddressFamily, MsgFlags, SockFlag, SockType, UnixAddr};

use crate::error::{Error, Result};
use crate::loader;
use crate::process::ProcessCtx;

/// Abstract socket name is `\0NSB-SERVICE-<pid>`.
pub const SOCKET_PREFIX: &str = "NSB-SERVICE-";

/// Cap on one proxied transfer; larger requests must be chunked by the
/// caller. Exceeds a page so a whole-page transfer needs one round trip.
pub const RW_DATA_SIZE_MAX: usize = 8192;

pub const CMD_READ: u32 = 1;
pub const CMD_WRITE: u32 = 2;
pub const CMD_STOP: u32 = 3;
pub const CMD_EMERG_SIGFRAME: u32 = 4;

const RESPONSE_HEAD: usize = 4;

#[derive(Debug)]
pub struct Service {
    /// Library name or path from the config.
    pub library: PathBuf,
    pub sock: Option<OwnedFd>,
    pub dlm: Option<u64>,
    /// Live address of `nsb_service_run_loop`.
    pub runner: u64,
    /// The chosen thread is currently executing the resident run loop.
    pub released: bool,
}

impl Service {
    pub fn new(library: PathBuf) -> Self {
        Self {
            library,
            sock: None,
            dlm: None,
            runner: 0,
            released: false,
        }
    }
}

pub(crate) fn check_rw_size(n: usize) -> Result<()> {
    if n > RW_DATA_SIZE_MAX {
        return Err(Error::TransferTooBig(n, RW_DATA_SIZE_MAX));
    }
    Ok(())
}

pub(crate) fn encode_request(cmd: u32, data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(4 + data.len());
    out.extend(cmd.to_le_bytes());
    out.extend(data);
    out
}

pub(crate) fn encode_rw_head(cmd: u32, addr: u64, len: usize) -> Vec<u8> {
    let mut out = Vec::with_capacity(4 + 16);
    out.extend(cmd.to_le_bytes());
    out.extend(addr.to_le_bytes());
    out.extend((len as u64).to_le_bytes());
    out
}

pub(crate) fn decode_response(buf: &[u8]) -> Result<(i32, &[u8])> {
    if buf.len() < RESPONSE_HEAD {
        return Err(Error::Sys(Errno::EPROTO));
    }
    let ret = i32::from_le_bytes(buf[..RESPONSE_HEAD].try_into().unwrap());
    Ok((ret, &buf[RESPONSE_HEAD..]))
}

impl ProcessCtx<'_> {
    pub(crate) fn service_connected(&self) -> bool {
        self.service.sock.is_some()
    }

    /// Map the helper into the target (or reuse an earlier mapping), connect
    /// over the abstract socket, hand over the emergency register snapshot
    /// and leave the helper's loop running.
    pub fn inject_service(&mut self) -> Result<()> {
        if self.service.sock.is_some() {
            return Ok(());
        }
        log::info!("= Injecting service into {}", self.pid);

        let library = self.service.library.clone();
        let file_name = library
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| Error::BadImage {
                path: library.clone(),
                what: "service library has no file name".into(),
            })?;

        let dlm_id = match self.find_dl_map_by_path(&file_name) {
            Some(existing) => {
                log::debug!("  reusing mapped {}", existing.path);
                existing.id
            }
            None => {
                let path = self.service_library_path(&library)?;
                let id = loader::load_elf(self, &path, 0)?;
                if let Err(err) = loader::link_image(self, id) {
                    let _ = loader::unload_elf(self, id);
                    return Err(err);
                }
                id
            }
        };
        self.service.dlm = Some(dlm_id);

        let (accept, runner) = {
            let dlm = self.dlm(dlm_id)?;
            let base = dlm.load_base();
            let sym = |name: &'static str| -> Result<u64> {
                dlm.ei
                    .dyn_sym_value(name)
                    .map(|v| base + v)
                    .ok_or_else(|| Error::UnresolvedSymbol(name.into()))
            };
            (sym("nsb_service_accept")?, sym("nsb_service_run_loop")?)
        };
        self.service.runner = runner;

        // The target binds and listens; our connect below queues until the
        // run loop picks the connection up.
        self.exec_call("nsb_service_accept", accept, &[])?;
        self.service_connect()?;
        self.service_provide_sigframe()?;
        self.service_release()?;

        Ok(())
    }

    fn service_library_path(&self, library: &Path) -> Result<PathBuf> {
        if library.is_absolute() || library.exists() {
            return Ok(library.to_path_buf());
        }
        let name = library.to_string_lossy();
        crate::process::resolve_library(&name).ok_or_else(|| Error::BadImage {
            path: library.to_path_buf(),
            what: "service library not found".into(),
        })
    }

    fn service_connect(&mut self) -> Result<()> {
        let name = format!("{SOCKET_PREFIX}{}", self.pid.as_raw());
        let fd = socket(
            AddressFamily::Unix,
            SockType::SeqPacket,
            SockFlag::empty(),
            None,
        )?;
        let addr = UnixAddr::new_abstract(name.as_bytes())?;
        connect(fd.as_raw_fd(), &addr)?;
        log::debug!("  connected to service socket \"\\0{name}\"");
        self.service.sock = Some(fd);
        Ok(())
    }

    /// Register snapshot the helper can fall back to if the coordinator dies
    /// while the loop owns the thread.
    fn service_provide_sigframe(&mut self) -> Result<()> {
        let tid = self.main_tid()?;
        let regs = ptrace::getregs(tid)?;
        let snapshot = unsafe {
            std::slice::from_raw_parts(
                &regs as *const libc::user_regs_struct as *const u8,
                std::mem::size_of::<libc::user_regs_struct>(),
            )
        };

        self.service_send(&encode_request(CMD_EMERG_SIGFRAME, snapshot))?;
        // One synchronous pass of the loop accepts our connection and
        // processes the queued request.
        self.exec_call("nsb_service_run_loop", self.service.runner, &[1])?;

        let mut resp = [0u8; 16];
        let n = self.service_recv(&mut resp)?;
        let (ret, _) = decode_response(&resp[..n])?;
        if ret < 0 {
            return Err(Error::Sys(Errno::from_raw(-ret)));
        }
        log::debug!("  emergency sigframe provided");
        Ok(())
    }

    fn service_release(&mut self) -> Result<()> {
        if self.service.released {
            return Ok(());
        }
        let entry = self.ensure_scratch()?;
        let code = self.arch.call_code(entry, self.service.runner, &[0])?;
        self.release_at(&code)?;
        self.service.released = true;
        log::debug!("  service released");
        Ok(())
    }

    /// Stop the resident loop and single-step the thread back into a ptrace
    /// stop, so direct target operations are legal again.
    pub(crate) fn ensure_service_interrupted(&mut self) -> Result<()> {
        if !self.service.released {
            return Ok(());
        }
        self.service_send(&encode_request(CMD_STOP, &[]))?;
        let mut resp = [0u8; 16];
        let n = self.service_recv(&mut resp)?;
        decode_response(&resp[..n])?;

        self.acquire()?;
        self.service.released = false;
        log::debug!("  service caught");
        Ok(())
    }

    /// Interrupt the loop and drop the socket. The helper library itself
    /// stays mapped for the next invocation.
    pub(crate) fn shutdown_service(&mut self) -> Result<()> {
        if self.service.sock.is_none() {
            return Ok(());
        }
        self.ensure_service_interrupted()?;
        self.service.sock = None;
        log::debug!("  disconnected from service socket");
        Ok(())
    }

    pub(crate) fn service_read(&mut self, addr: u64, buf: &mut [u8]) -> Result<()> {
        self.service_release()?;
        let mut pos = 0usize;
        for chunk in buf.chunks_mut(RW_DATA_SIZE_MAX) {
            self.service_read_once(addr + pos as u64, chunk)?;
            pos += chunk.len();
        }
        Ok(())
    }

    pub(crate) fn service_write(&mut self, addr: u64, bytes: &[u8]) -> Result<()> {
        self.service_release()?;
        let mut pos = 0usize;
        for chunk in bytes.chunks(RW_DATA_SIZE_MAX) {
            self.service_write_once(addr + pos as u64, chunk)?;
            pos += chunk.len();
        }
        Ok(())
    }

    fn service_read_once(&mut self, addr: u64, buf: &mut [u8]) -> Result<()> {
        check_rw_size(buf.len())?;
        self.service_send(&encode_rw_head(CMD_READ, addr, buf.len()))?;

        let mut resp = vec![0u8; RESPONSE_HEAD + RW_DATA_SIZE_MAX];
        let n = self.service_recv(&mut resp)?;
        let (ret, data) = decode_response(&resp[..n])?;
        if ret < 0 {
            return Err(Error::Sys(Errno::from_raw(-ret)));
        }
        if data.len() != buf.len() {
            return Err(Error::Fault(addr));
        }
        buf.copy_from_slice(data);
        Ok(())
    }

    fn service_write_once(&mut self, addr: u64, bytes: &[u8]) -> Result<()> {
        check_rw_size(bytes.len())?;
        let mut rq = encode_rw_head(CMD_WRITE, addr, bytes.len());
        rq.extend(bytes);
        self.service_send(&rq)?;

        let mut resp = [0u8; 16];
        let n = self.service_recv(&mut resp)?;
        let (ret, _) = decode_response(&resp[..n])?;
        if ret < 0 {
            return Err(Error::Sys(Errno::from_raw(-ret)));
        }
        Ok(())
    }

    fn service_send(&self, buf: &[u8]) -> Result<()> {
        let sock = self.service.sock.as_ref().ok_or(Error::Sys(Errno::ENOTCONN))?;
        let sent = send(sock.as_raw_fd(), buf, MsgFlags::empty())?;
        if sent != buf.len() {
            return Err(Error::Sys(Errno::EMSGSIZE));
        }
        Ok(())
    }

    fn service_recv(&self, buf: &mut [u8]) -> Result<usize> {
        let sock = self.service.sock.as_ref().ok_or(Error::Sys(Errno::ENOTCONN))?;
        Ok(recv(sock.as_raw_fd(), buf, MsgFlags::empty())?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transfer_cap_is_exact() {
        assert!(check_rw_size(RW_DATA_SIZE_MAX).is_ok());
        let err = check_rw_size(RW_DATA_SIZE_MAX + 1).unwrap_err();
        assert_eq!(err.code(), libc::E2BIG);
    }

    #[test]
    fn rw_request_layout() {
        let rq = encode_rw_head(CMD_READ, 0x1122334455667788, 0x10);
        assert_eq!(rq.len(), 20);
        assert_eq!(&rq[..4], &CMD_READ.to_le_bytes());
        assert_eq!(&rq[4..12], &0x1122334455667788u64.to_le_bytes());
        assert_eq!(&rq[12..20], &0x10u64.to_le_bytes());
    }

    #[test]
    fn response_decoding() {
        let mut buf = (-(libc::EFAULT) as i32).to_le_bytes().to_vec();
        buf.extend([1, 2, 3]);
        let (ret, data) = decode_response(&buf).unwrap();
        assert_eq!(ret, -libc::EFAULT);
        assert_eq!(data, &[1, 2, 3]);

        assert!(decode_response(&[0, 1]).is_err());
    }
}
