//! Descriptor-backed TUN interface shared by the unix adapters

use super::TunInterface;
use std::io;
use std::os::fd::{AsRawFd, OwnedFd};

/// How packets are laid out on the descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
    /// Bare IP packets
    Raw,
    /// 4-byte big-endian address family before each packet (utun)
    AfHeader,
}

const AF_HEADER_LEN: usize = 4;

/// A TUN interface backed by an adopted, non-blocking descriptor
///
/// Dropping it closes the descriptor.
#[derive(Debug)]
pub struct FdTun {
    fd: OwnedFd,
    name: String,
    framing: Framing,
}

impl FdTun {
    pub fn new(fd: OwnedFd, name: String, framing: Framing) -> Self {
        Self { fd, name, framing }
    }

    pub fn framing(&self) -> Framing {
        self.framing
    }
}

impl AsRawFd for FdTun {
    fn as_raw_fd(&self) -> std::os::fd::RawFd {
        self.fd.as_raw_fd()
    }
}

impl TunInterface for FdTun {
    fn name(&self) -> io::Result<String> {
        Ok(self.name.clone())
    }

    fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        match self.framing {
            Framing::Raw => {
                let n = unsafe {
                    libc::read(
                        self.fd.as_raw_fd(),
                        buf.as_mut_ptr() as *mut libc::c_void,
                        buf.len(),
                    )
                };
                if n < 0 {
                    return Err(io::Error::last_os_error());
                }
                Ok(n as usize)
            }
            Framing::AfHeader => {
                let mut header = [0u8; AF_HEADER_LEN];
                let iov = [
                    libc::iovec {
                        iov_base: header.as_mut_ptr() as *mut libc::c_void,
                        iov_len: header.len(),
                    },
                    libc::iovec {
                        iov_base: buf.as_mut_ptr() as *mut libc::c_void,
                        iov_len: buf.len(),
                    },
                ];
                let n = unsafe { libc::readv(self.fd.as_raw_fd(), iov.as_ptr(), 2) };
                if n < 0 {
                    return Err(io::Error::last_os_error());
                }
                Ok((n as usize).saturating_sub(AF_HEADER_LEN))
            }
        }
    }

    fn write(&self, buf: &[u8]) -> io::Result<usize> {
        match self.framing {
            Framing::Raw => {
                let n = unsafe {
                    libc::write(
                        self.fd.as_raw_fd(),
                        buf.as_ptr() as *const libc::c_void,
                        buf.len(),
                    )
                };
                if n < 0 {
                    return Err(io::Error::last_os_error());
                }
                Ok(n as usize)
            }
            Framing::AfHeader => {
                let header = af_header(buf)?;
                let iov = [
                    libc::iovec {
                        iov_base: header.as_ptr() as *mut libc::c_void,
                        iov_len: header.len(),
                    },
                    libc::iovec {
                        iov_base: buf.as_ptr() as *mut libc::c_void,
                        iov_len: buf.len(),
                    },
                ];
                let n = unsafe { libc::writev(self.fd.as_raw_fd(), iov.as_ptr(), 2) };
                if n < 0 {
                    return Err(io::Error::last_os_error());
                }
                Ok((n as usize).saturating_sub(AF_HEADER_LEN))
            }
        }
    }
}

/// Address family prefix for an outgoing packet, from its IP version nibble
fn af_header(packet: &[u8]) -> io::Result<[u8; AF_HEADER_LEN]> {
    let family = match packet.first().map(|b| b >> 4) {
        Some(4) => libc::AF_INET,
        Some(6) => libc::AF_INET6,
        _ => {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "not an IP packet",
            ))
        }
    };
    Ok((family as u32).to_be_bytes())
}
