//! POSIX-generic descriptor adapter
//!
//! Wraps the duplicated descriptor directly, with no lifecycle monitoring.

use super::fd::{FdTun, Framing};
use super::AdoptInterface;
use crate::error::{BridgeError, Result};
use std::io;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};

#[cfg(any(target_os = "macos", target_os = "ios"))]
const SYSPROTO_CONTROL: libc::c_int = 2;
#[cfg(any(target_os = "macos", target_os = "ios"))]
const UTUN_OPT_IFNAME: libc::c_int = 2;

/// Adopts an already duplicated, non-blocking descriptor as-is
#[derive(Debug, Default, Clone, Copy)]
pub struct GenericFdAdapter;

impl AdoptInterface for GenericFdAdapter {
    type Handle = OwnedFd;
    type Interface = FdTun;

    fn adopt(&self, fd: OwnedFd) -> Result<FdTun> {
        let (name, framing) = identify(fd.as_raw_fd())?;
        log::debug!("Adopted interface {name}");
        Ok(FdTun::new(fd, name, framing))
    }
}

/// utun descriptors are kernel control sockets that name their interface
#[cfg(any(target_os = "macos", target_os = "ios"))]
fn identify(fd: RawFd) -> Result<(String, Framing)> {
    let mut name = [0u8; libc::IFNAMSIZ];
    let mut len = name.len() as libc::socklen_t;
    let ret = unsafe {
        libc::getsockopt(
            fd,
            SYSPROTO_CONTROL,
            UTUN_OPT_IFNAME,
            name.as_mut_ptr() as *mut libc::c_void,
            &mut len,
        )
    };
    if ret < 0 {
        return Err(BridgeError::Interface(format!(
            "descriptor {fd} is not a utun socket: {}",
            io::Error::last_os_error()
        )));
    }
    let end = name.iter().position(|&b| b == 0).unwrap_or(len as usize);
    let name = String::from_utf8_lossy(&name[..end]).into_owned();
    Ok((name, Framing::AfHeader))
}

#[cfg(not(any(target_os = "macos", target_os = "ios")))]
fn identify(fd: RawFd) -> Result<(String, Framing)> {
    let mut stat: libc::stat = unsafe { std::mem::zeroed() };
    if unsafe { libc::fstat(fd, &mut stat) } < 0 {
        return Err(BridgeError::Interface(format!(
            "unable to inspect descriptor {fd}: {}",
            io::Error::last_os_error()
        )));
    }
    if stat.st_mode & libc::S_IFMT != libc::S_IFCHR {
        return Err(BridgeError::Interface(format!(
            "descriptor {fd} is not a character device"
        )));
    }
    Ok((device_name(fd).unwrap_or_else(|| format!("tun-fd{fd}")), Framing::Raw))
}

#[cfg(target_os = "android")]
fn device_name(fd: RawFd) -> Option<String> {
    #[repr(C)]
    struct IfReq {
        ifr_name: [libc::c_char; libc::IFNAMSIZ],
        _union: [u8; 24],
    }

    const TUNGETIFF: libc::c_int = 0x8004_54d2_u32 as libc::c_int;
    let mut ifr: IfReq = unsafe { std::mem::zeroed() };
    if unsafe { libc::ioctl(fd, TUNGETIFF as _, &mut ifr as *mut IfReq) } < 0 {
        return None;
    }
    let bytes: Vec<u8> = ifr
        .ifr_name
        .iter()
        .take_while(|&&c| c != 0)
        .map(|&c| c as u8)
        .collect();
    Some(String::from_utf8_lossy(&bytes).into_owned())
}

#[cfg(not(any(target_os = "macos", target_os = "ios", target_os = "android")))]
fn device_name(_fd: RawFd) -> Option<String> {
    None
}
