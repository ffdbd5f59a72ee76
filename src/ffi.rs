//! C FFI Interface
//!
//! The exported symbols are the ones the host's loader resolves. Errors
//! never cross this boundary except as sentinels: `-1` from `wgTurnOn`, a
//! negative errno from `wgSetConfig`, NULL from `wgGetConfig`. The cause is
//! always logged on the error channel first.

#![allow(clippy::missing_safety_doc, non_snake_case)]

use std::ffi::{c_char, c_void, CStr};
use std::ptr;

use crate::attach::Attacher;
use crate::engine::DeviceFactory;
use crate::error::{BridgeError, Result};
use crate::errorf;
use crate::logger::{host_logger, set_host_logger, LoggerFn};
use crate::registry::tunnels;
use crate::tunnel::PlatformAdapter;

/// Borrow a host string, rejecting NULL and invalid UTF-8
unsafe fn c_str<'a>(ptr: *const c_char, what: &str) -> Result<&'a str> {
    if ptr.is_null() {
        return Err(BridgeError::InvalidParameter(format!("{what} is null")));
    }
    unsafe { CStr::from_ptr(ptr) }
        .to_str()
        .map_err(|e| BridgeError::InvalidParameter(format!("{what} is not valid UTF-8: {e}")))
}

/// Copy `text` into a `malloc`ed C string the host releases with `free`
fn into_host_string(text: &str) -> *mut c_char {
    let bytes = text.as_bytes();
    let out = unsafe { libc::malloc(bytes.len() + 1) } as *mut u8;
    if out.is_null() {
        return ptr::null_mut();
    }
    unsafe {
        ptr::copy_nonoverlapping(bytes.as_ptr(), out, bytes.len());
        *out.add(bytes.len()) = 0;
    }
    out as *mut c_char
}

fn arm_diagnostics() {
    #[cfg(all(unix, feature = "signal-diagnostics"))]
    crate::diagnostics::install();
}

/// Get library version
///
/// # Returns
/// - Version string (caller must not free)
#[no_mangle]
pub unsafe extern "C" fn wgVersion() -> *const c_char {
    static VERSION_CSTR: &[u8] = concat!(env!("CARGO_PKG_VERSION"), "\0").as_bytes();
    VERSION_CSTR.as_ptr() as *const c_char
}

/// Register the host log callback
///
/// # Parameters
/// - `context`: opaque pointer passed back on every call
/// - `callback`: `(context, level, message)`; level 0 is verbose, 1 is error.
///   NULL clears the binding; a later call may bind a new callback.
#[no_mangle]
pub unsafe extern "C" fn wgSetLogger(context: *mut c_void, callback: Option<LoggerFn>) {
    set_host_logger(context, callback);
    arm_diagnostics();
}

/// Attach a tunnel to a host-owned TUN descriptor
///
/// The descriptor is duplicated; the host keeps ownership of `tun_fd`.
///
/// # Parameters
/// - `settings`: UAPI configuration text
/// - `tun_fd`: TUN device descriptor
///
/// # Returns
/// - Non-negative tunnel handle on success
/// - -1 on failure
#[cfg(unix)]
#[no_mangle]
pub unsafe extern "C" fn wgTurnOn(settings: *const c_char, tun_fd: i32) -> i32 {
    arm_diagnostics();
    let logger = host_logger();
    let settings = match unsafe { c_str(settings, "settings") } {
        Ok(settings) => settings,
        Err(e) => {
            errorf!(logger, "{}", e);
            return -1;
        }
    };
    Attacher::new(logger, PlatformAdapter::default(), DeviceFactory, tunnels())
        .attach_descriptor(settings, tun_fd)
}

/// Attach a tunnel to a Wintun adapter created for the given interface GUID
///
/// # Parameters
/// - `settings`: UAPI configuration text
/// - `ifname`: interface GUID without braces
///
/// # Returns
/// - Non-negative tunnel handle on success
/// - -1 on failure
#[cfg(windows)]
#[no_mangle]
pub unsafe extern "C" fn wgTurnOn(settings: *const c_char, ifname: *const c_char) -> i32 {
    let logger = host_logger();
    let parsed = unsafe { (c_str(settings, "settings"), c_str(ifname, "ifname")) };
    let (settings, ifname) = match parsed {
        (Ok(settings), Ok(ifname)) => (settings, ifname),
        (Err(e), _) | (_, Err(e)) => {
            errorf!(logger, "{}", e);
            return -1;
        }
    };
    Attacher::new(logger, PlatformAdapter::default(), DeviceFactory, tunnels())
        .attach_identifier(settings, ifname)
}

/// Stop a tunnel and release its interface
///
/// Unknown handles are ignored.
#[no_mangle]
pub unsafe extern "C" fn wgTurnOff(handle: i32) {
    if let Some(engine) = tunnels().remove(handle) {
        drop(engine);
    }
}

/// Apply UAPI settings to a running tunnel
///
/// # Returns
/// - 0 on success
/// - Negative errno on failure (`-EBADF` for an unknown handle)
#[no_mangle]
pub unsafe extern "C" fn wgSetConfig(handle: i32, settings: *const c_char) -> i64 {
    let logger = host_logger();
    let result = unsafe { c_str(settings, "settings") }.and_then(|settings| {
        tunnels()
            .with_engine(handle, |engine| engine.ipc_set(settings))
            .unwrap_or_else(|| Err(BridgeError::InvalidHandle(handle)))
    });
    match result {
        Ok(()) => 0,
        Err(e) => {
            errorf!(logger, "{}", e);
            -i64::from(e.errno())
        }
    }
}

/// Current UAPI settings of a tunnel
///
/// # Returns
/// - `malloc`ed string the caller must `free`
/// - NULL for an unknown handle or on failure
#[no_mangle]
pub unsafe extern "C" fn wgGetConfig(handle: i32) -> *mut c_char {
    match tunnels().with_engine(handle, |engine| engine.ipc_get()) {
        Some(Ok(text)) => into_host_string(&text),
        Some(Err(e)) => {
            errorf!(host_logger(), "{}", e);
            ptr::null_mut()
        }
        None => ptr::null_mut(),
    }
}

/// Rebind a tunnel's sockets after a network change
#[no_mangle]
pub unsafe extern "C" fn wgBumpSockets(handle: i32) {
    if let Some(Err(e)) = tunnels().with_engine(handle, |engine| engine.bump_sockets()) {
        errorf!(host_logger(), "{}", e);
    }
}

/// Stop updating peer endpoints from incoming packets
#[no_mangle]
pub unsafe extern "C" fn wgDisableSomeRoamingForBrokenMobileSemantics(handle: i32) {
    tunnels().with_engine(handle, |engine| engine.disable_some_roaming());
}

/// IPv4 UDP socket of a tunnel, for `VpnService.protect`
///
/// # Returns
/// - Socket descriptor, or -1
#[cfg(target_os = "android")]
#[no_mangle]
pub unsafe extern "C" fn wgGetSocketV4(handle: i32) -> i32 {
    tunnels()
        .with_engine(handle, |engine| engine.socket_v4())
        .flatten()
        .unwrap_or(-1)
}

/// IPv6 UDP socket of a tunnel, for `VpnService.protect`
///
/// # Returns
/// - Socket descriptor, or -1
#[cfg(target_os = "android")]
#[no_mangle]
pub unsafe extern "C" fn wgGetSocketV6(handle: i32) -> i32 {
    tunnels()
        .with_engine(handle, |engine| engine.socket_v6())
        .flatten()
        .unwrap_or(-1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{Device, UdpBind};
    use crate::registry::Registry;
    use crate::tunnel::TunInterface;
    use std::ffi::CString;
    use std::io;

    struct LoopTun;

    impl TunInterface for LoopTun {
        fn name(&self) -> io::Result<String> {
            Ok("loop0".to_string())
        }

        fn read(&self, _buf: &mut [u8]) -> io::Result<usize> {
            Err(io::ErrorKind::WouldBlock.into())
        }

        fn write(&self, buf: &[u8]) -> io::Result<usize> {
            Ok(buf.len())
        }
    }

    const PEER: &str = "b85996fecc9c7f1fc6d2572a76eda11d59bcd20be8e543b15ce4bd85a8e75a33";

    #[test]
    fn test_version() {
        let version = unsafe { CStr::from_ptr(wgVersion()) };
        assert_eq!(version.to_str().unwrap(), crate::VERSION);
    }

    #[test]
    fn test_turn_on_null_settings() {
        #[cfg(unix)]
        assert_eq!(unsafe { wgTurnOn(ptr::null(), 0) }, -1);
        #[cfg(windows)]
        assert_eq!(unsafe { wgTurnOn(ptr::null(), ptr::null()) }, -1);
    }

    #[cfg(unix)]
    #[test]
    fn test_turn_on_rejects_non_tun_descriptor() {
        let mut fds = [0; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        let settings = CString::new("listen_port=0\n").unwrap();

        assert_eq!(unsafe { wgTurnOn(settings.as_ptr(), fds[0]) }, -1);
        assert!(unsafe { libc::fcntl(fds[0], libc::F_GETFD) } >= 0);
        unsafe {
            libc::close(fds[0]);
            libc::close(fds[1]);
        }
    }

    #[test]
    fn test_unknown_handle() {
        let settings = CString::new("listen_port=0\n").unwrap();
        assert_eq!(unsafe { wgSetConfig(-5, settings.as_ptr()) }, -i64::from(libc::EBADF));
        assert!(unsafe { wgGetConfig(-5) }.is_null());
        unsafe {
            wgBumpSockets(-5);
            wgDisableSomeRoamingForBrokenMobileSemantics(-5);
            wgTurnOff(-5);
        }
    }

    #[test]
    fn test_registered_tunnel_lifecycle() {
        let engine = Box::new(Device::new(LoopTun, UdpBind::new()));
        let handle = tunnels().register(engine, "").ok().unwrap();

        let update = CString::new(format!(
            "listen_port=0\npublic_key={PEER}\nallowed_ip=192.168.4.1/24\n"
        ))
        .unwrap();
        assert_eq!(unsafe { wgSetConfig(handle, update.as_ptr()) }, 0);

        let garbage = CString::new("garbage config").unwrap();
        let einval = -i64::from(libc::EINVAL);
        assert_eq!(unsafe { wgSetConfig(handle, garbage.as_ptr()) }, einval);
        assert_eq!(unsafe { wgSetConfig(handle, ptr::null()) }, einval);

        let dump = unsafe { wgGetConfig(handle) };
        assert!(!dump.is_null());
        let text = unsafe { CStr::from_ptr(dump) }.to_str().unwrap().to_owned();
        unsafe { libc::free(dump as *mut c_void) };
        assert!(text.contains(&format!("public_key={PEER}\n")));
        assert!(text.contains("allowed_ip=192.168.4.0/24\n"));

        unsafe {
            wgBumpSockets(handle);
            wgDisableSomeRoamingForBrokenMobileSemantics(handle);
            wgTurnOff(handle);
        }
        assert!(unsafe { wgGetConfig(handle) }.is_null());
    }
}
