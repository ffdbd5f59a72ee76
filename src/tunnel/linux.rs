//! Linux descriptor-monitoring adapter
//!
//! Adopts the host's `/dev/net/tun` descriptor and watches rtnetlink link
//! events so that removal of the interface from outside the process is
//! observable through [`TunInterface::is_removed`].

use super::fd::{FdTun, Framing};
use super::{AdoptInterface, TunInterface};
use crate::error::{BridgeError, Result};
use netlink_packet_core::{NetlinkMessage, NetlinkPayload};
use netlink_packet_route::link::LinkFlags;
use netlink_packet_route::RouteNetlinkMessage;
use netlink_sys::{protocols::NETLINK_ROUTE, Socket, SocketAddr};
use std::ffi::CString;
use std::io;
use std::mem;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread;

/// TUNGETIFF ioctl number, `_IOR('T', 210, unsigned int)`
const TUNGETIFF: libc::c_ulong = 0x8004_54d2;

const RTNLGRP_LINK: u32 = 1;
const MONITOR_BUFFER: usize = 8192;

/// Interface request structure for ioctl calls
#[repr(C)]
struct IfReq {
    ifr_name: [libc::c_char; libc::IFNAMSIZ],
    ifr_flags: libc::c_short,
    _padding: [u8; 22],
}

/// Linux TUN interface with a detached link monitor
#[derive(Debug)]
pub struct LinuxTun {
    inner: FdTun,
    index: u32,
    removed: Arc<AtomicBool>,
}

impl LinuxTun {
    /// Kernel interface index
    pub fn index(&self) -> u32 {
        self.index
    }
}

impl TunInterface for LinuxTun {
    fn name(&self) -> io::Result<String> {
        self.inner.name()
    }

    fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        self.inner.read(buf)
    }

    fn write(&self, buf: &[u8]) -> io::Result<usize> {
        self.inner.write(buf)
    }

    fn is_removed(&self) -> bool {
        self.removed.load(Ordering::Acquire)
    }
}

/// Adopts a duplicated TUN descriptor and attaches link monitoring
#[derive(Debug, Default, Clone, Copy)]
pub struct MonitoredFdAdapter;

impl AdoptInterface for MonitoredFdAdapter {
    type Handle = OwnedFd;
    type Interface = LinuxTun;

    fn adopt(&self, fd: OwnedFd) -> Result<LinuxTun> {
        let name = tun_name(fd.as_raw_fd())?;
        let index = interface_index(&name)?;

        let removed = Arc::new(AtomicBool::new(false));
        let monitor = LinkMonitor::open(index).map_err(|e| {
            BridgeError::Interface(format!("unable to monitor interface {name}: {e}"))
        })?;
        // The join handle is dropped; the monitor ends once the interface does.
        monitor
            .spawn(name.clone(), Arc::downgrade(&removed))
            .map_err(|e| BridgeError::Interface(format!("unable to start link monitor: {e}")))?;

        log::debug!("Adopted interface {name} (index {index})");
        Ok(LinuxTun {
            inner: FdTun::new(fd, name, Framing::Raw),
            index,
            removed,
        })
    }
}

/// Name of the TUN interface behind `fd`, failing if it is not a TUN device
fn tun_name(fd: RawFd) -> Result<String> {
    let mut ifr: IfReq = unsafe { mem::zeroed() };
    let ret = unsafe { libc::ioctl(fd, TUNGETIFF as _, &mut ifr as *mut IfReq) };
    if ret < 0 {
        return Err(BridgeError::Interface(format!(
            "descriptor {fd} is not a TUN device: {}",
            io::Error::last_os_error()
        )));
    }
    let bytes: Vec<u8> = ifr
        .ifr_name
        .iter()
        .take_while(|&&c| c != 0)
        .map(|&c| c as u8)
        .collect();
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

fn interface_index(name: &str) -> Result<u32> {
    let cname = CString::new(name)
        .map_err(|_| BridgeError::Interface(format!("invalid interface name {name:?}")))?;
    let index = unsafe { libc::if_nametoindex(cname.as_ptr()) };
    if index == 0 {
        return Err(BridgeError::Interface(format!(
            "unable to resolve interface {name}: {}",
            io::Error::last_os_error()
        )));
    }
    Ok(index)
}

/// What happened to a link
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LinkChange {
    Up,
    Down,
    Removed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct LinkEvent {
    index: u32,
    change: LinkChange,
}

/// How the monitor reacts to a failed receive
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RecvFailure {
    /// Timeout or signal; poll again
    Retry,
    /// The kernel dropped notifications; the link has to be checked directly
    Overrun,
    Fatal,
}

fn classify(err: &io::Error) -> RecvFailure {
    if err.raw_os_error() == Some(libc::ENOBUFS) {
        return RecvFailure::Overrun;
    }
    match err.kind() {
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted => {
            RecvFailure::Retry
        }
        _ => RecvFailure::Fatal,
    }
}

/// rtnetlink socket subscribed to link notifications
struct LinkMonitor {
    socket: Socket,
    index: u32,
}

impl LinkMonitor {
    fn open(index: u32) -> io::Result<Self> {
        let mut socket = Socket::new(NETLINK_ROUTE)?;
        socket.bind(&SocketAddr::new(0, 0))?;
        socket.add_membership(RTNLGRP_LINK)?;

        // Wake up periodically to notice that the interface object is gone.
        let timeout = libc::timeval {
            tv_sec: 1,
            tv_usec: 0,
        };
        let ret = unsafe {
            libc::setsockopt(
                socket.as_raw_fd(),
                libc::SOL_SOCKET,
                libc::SO_RCVTIMEO,
                &timeout as *const libc::timeval as *const libc::c_void,
                mem::size_of::<libc::timeval>() as libc::socklen_t,
            )
        };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }

        Ok(Self { socket, index })
    }

    fn spawn(self, name: String, removed: Weak<AtomicBool>) -> io::Result<()> {
        thread::Builder::new()
            .name(format!("link-monitor-{name}"))
            .spawn(move || self.run(&name, removed))
            .map(|_| ())
    }

    fn run(self, name: &str, removed: Weak<AtomicBool>) {
        let mark_removed = || {
            if let Some(flag) = removed.upgrade() {
                flag.store(true, Ordering::Release);
            }
            log::error!("Interface {name} was removed");
        };

        let mut buf: Vec<u8> = Vec::with_capacity(MONITOR_BUFFER);
        while removed.strong_count() > 0 {
            buf.clear();
            if let Err(err) = self.socket.recv(&mut buf, 0) {
                match classify(&err) {
                    RecvFailure::Retry => continue,
                    RecvFailure::Overrun => {
                        log::warn!("Link monitor for {name} lost notifications: {err}");
                        if !link_present(name, self.index) {
                            mark_removed();
                            return;
                        }
                        continue;
                    }
                    RecvFailure::Fatal => {
                        log::error!("Link monitor for {name} failed: {err}");
                        return;
                    }
                }
            }

            for event in parse_link_events(&buf) {
                if event.index != self.index {
                    continue;
                }
                match event.change {
                    LinkChange::Removed => {
                        mark_removed();
                        return;
                    }
                    LinkChange::Down => log::info!("Interface {name} is down"),
                    LinkChange::Up => log::debug!("Interface {name} is up"),
                }
            }
        }
        log::debug!("Link monitor for {name} stopped");
    }
}

/// Whether `name` still resolves to the monitored index
fn link_present(name: &str, index: u32) -> bool {
    matches!(interface_index(name), Ok(current) if current == index)
}

/// Extract link events from one netlink datagram
fn parse_link_events(data: &[u8]) -> Vec<LinkEvent> {
    let mut events = Vec::new();
    let mut offset = 0;
    while offset < data.len() {
        let msg = match NetlinkMessage::<RouteNetlinkMessage>::deserialize(&data[offset..]) {
            Ok(msg) => msg,
            Err(e) => {
                log::debug!("Ignoring undecodable netlink message: {e}");
                break;
            }
        };
        let len = msg.header.length as usize;
        if len == 0 {
            break;
        }

        match msg.payload {
            NetlinkPayload::InnerMessage(RouteNetlinkMessage::NewLink(link)) => {
                let change = if link.header.flags.contains(LinkFlags::Up) {
                    LinkChange::Up
                } else {
                    LinkChange::Down
                };
                events.push(LinkEvent {
                    index: link.header.index,
                    change,
                });
            }
            NetlinkPayload::InnerMessage(RouteNetlinkMessage::DelLink(link)) => {
                events.push(LinkEvent {
                    index: link.header.index,
                    change: LinkChange::Removed,
                });
            }
            _ => {}
        }
        // Messages are 4-byte aligned.
        offset += (len + 3) & !3;
    }
    events
}
