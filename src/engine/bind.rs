//! Network transport binder
//!
//! Owns the UDP sockets the engine sends and receives encrypted traffic on.

use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};

/// UDP socket pair the engine talks to peers through
pub trait Bind: Send {
    /// Bind sockets on `port` (0 picks one) and return the port actually bound
    ///
    /// The previous sockets are only replaced when the new ones are ready,
    /// except when reopening the port already bound: that releases them first.
    fn open(&mut self, port: u16, fwmark: u32) -> io::Result<u16>;

    /// Release all sockets
    fn close(&mut self);

    /// Apply a firewall mark to the open sockets
    fn set_mark(&mut self, fwmark: u32) -> io::Result<()>;

    fn socket_v4(&self) -> Option<i32>;

    fn socket_v6(&self) -> Option<i32>;
}

/// Default binder: one IPv4 and, when available, one IPv6-only socket
#[derive(Debug, Default)]
pub struct UdpBind {
    v4: Option<Socket>,
    v6: Option<Socket>,
    port: Option<u16>,
}

impl UdpBind {
    pub fn new() -> Self {
        Self::default()
    }

    /// Port currently bound, if any
    pub fn port(&self) -> Option<u16> {
        self.port
    }

    fn sockets(&self) -> impl Iterator<Item = &Socket> {
        self.v4.iter().chain(self.v6.iter())
    }
}

impl Bind for UdpBind {
    fn open(&mut self, port: u16, fwmark: u32) -> io::Result<u16> {
        // The old sockets hold the port we want; let go of them first.
        if port != 0 && self.port == Some(port) {
            self.close();
        }

        let v4 = udp_socket(SocketAddr::from((Ipv4Addr::UNSPECIFIED, port)), fwmark)?;
        let bound = v4
            .local_addr()?
            .as_socket()
            .map(|addr| addr.port())
            .unwrap_or(port);

        let v6 = match udp_socket(SocketAddr::from((Ipv6Addr::UNSPECIFIED, bound)), fwmark) {
            Ok(socket) => Some(socket),
            Err(e) => {
                log::warn!("IPv6 bind on port {bound} failed, continuing with IPv4 only: {e}");
                None
            }
        };

        self.v4 = Some(v4);
        self.v6 = v6;
        self.port = Some(bound);
        log::debug!("UDP bind has been updated (port {bound})");
        Ok(bound)
    }

    fn close(&mut self) {
        if self.port.take().is_some() {
            self.v4 = None;
            self.v6 = None;
            log::debug!("UDP bind closed");
        }
    }

    fn set_mark(&mut self, fwmark: u32) -> io::Result<()> {
        for socket in self.sockets() {
            apply_mark(socket, fwmark)?;
        }
        Ok(())
    }

    fn socket_v4(&self) -> Option<i32> {
        self.v4.as_ref().and_then(raw_socket)
    }

    fn socket_v6(&self) -> Option<i32> {
        self.v6.as_ref().and_then(raw_socket)
    }
}

fn udp_socket(addr: SocketAddr, fwmark: u32) -> io::Result<Socket> {
    let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))?;
    if addr.is_ipv6() {
        socket.set_only_v6(true)?;
    }
    apply_mark(&socket, fwmark)?;
    socket.bind(&addr.into())?;
    socket.set_nonblocking(true)?;
    Ok(socket)
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn apply_mark(socket: &Socket, fwmark: u32) -> io::Result<()> {
    if fwmark == 0 {
        return Ok(());
    }
    socket.set_mark(fwmark)
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn apply_mark(_socket: &Socket, fwmark: u32) -> io::Result<()> {
    if fwmark != 0 {
        log::debug!("fwmark {fwmark} ignored on this platform");
    }
    Ok(())
}

#[cfg(unix)]
fn raw_socket(socket: &Socket) -> Option<i32> {
    use std::os::fd::AsRawFd;
    Some(socket.as_raw_fd())
}

#[cfg(not(unix))]
fn raw_socket(_socket: &Socket) -> Option<i32> {
    None
}
