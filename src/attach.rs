//! Tunnel attachment
//!
//! Turns a host interface handle plus a settings blob into a registered,
//! running engine. Every acquired resource is owned by a value whose drop
//! releases it, so an early return unwinds in reverse order: engine first,
//! then the interface, then the duplicated descriptor it wraps.

use crate::engine::EngineFactory;
use crate::error::{BridgeError, Result};
use crate::logger::LogBridge;
use crate::registry::Registry;
use crate::tunnel::{AdoptInterface, InterfaceGuid, TunInterface};
use crate::{errorf, verbosef};

/// Wires an adapter, an engine factory and a registry together
pub struct Attacher<'a, A, F, R> {
    logger: &'a LogBridge,
    adapter: A,
    factory: F,
    registry: &'a R,
}

impl<'a, A, F, R> Attacher<'a, A, F, R>
where
    A: AdoptInterface,
    F: EngineFactory<A::Interface>,
    R: Registry,
{
    pub fn new(logger: &'a LogBridge, adapter: A, factory: F, registry: &'a R) -> Self {
        Self {
            logger,
            adapter,
            factory,
            registry,
        }
    }

    /// Log a failed attempt once and collapse it to the host sentinel
    fn finish(&self, result: Result<i32>) -> i32 {
        match result {
            Ok(handle) => handle,
            Err(e) => {
                errorf!(self.logger, "{}", e);
                -1
            }
        }
    }

    fn start(&self, tun: A::Interface, settings: &str) -> Result<i32> {
        let name = tun.name().unwrap_or_else(|_| "unknown".to_string());
        verbosef!(self.logger, "Attaching to interface {}", name);

        let mut engine = self.factory.construct(tun);
        engine.ipc_set(settings)?;
        engine.up()?;
        verbosef!(self.logger, "Device started");

        self.registry.register(engine, settings).map_err(|engine| {
            drop(engine);
            BridgeError::Registration("registry refused the tunnel".to_string())
        })
    }
}

#[cfg(unix)]
pub use descriptor::{DescriptorOps, SystemDescriptors};

#[cfg(unix)]
mod descriptor {
    use super::*;
    use std::io;
    use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

    /// How a host descriptor is prepared before the adapter sees it
    pub trait DescriptorOps {
        /// Duplicate `fd` with close-on-exec set
        fn duplicate(&self, fd: RawFd) -> io::Result<OwnedFd> {
            let dup = unsafe { libc::fcntl(fd, libc::F_DUPFD_CLOEXEC, 0) };
            if dup < 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(unsafe { OwnedFd::from_raw_fd(dup) })
        }

        fn set_nonblocking(&self, fd: &OwnedFd) -> io::Result<()> {
            let flags = unsafe { libc::fcntl(fd.as_raw_fd(), libc::F_GETFL) };
            if flags < 0 {
                return Err(io::Error::last_os_error());
            }
            if unsafe { libc::fcntl(fd.as_raw_fd(), libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(())
        }
    }

    /// Plain `fcntl` calls
    #[derive(Debug, Default, Clone, Copy)]
    pub struct SystemDescriptors;

    impl DescriptorOps for SystemDescriptors {}

    impl<'a, A, F, R> Attacher<'a, A, F, R>
    where
        A: AdoptInterface<Handle = OwnedFd>,
        F: EngineFactory<A::Interface>,
        R: Registry,
    {
        /// Attach to a host-owned descriptor; the host keeps its own copy
        ///
        /// Returns the tunnel handle, or -1 after logging the cause.
        pub fn attach_descriptor(&self, settings: &str, fd: RawFd) -> i32 {
            self.attach_descriptor_with(&SystemDescriptors, settings, fd)
        }

        /// [`Attacher::attach_descriptor`] with custom descriptor preparation
        pub fn attach_descriptor_with(
            &self,
            ops: &impl DescriptorOps,
            settings: &str,
            fd: RawFd,
        ) -> i32 {
            let result = self.try_attach_descriptor(ops, settings, fd);
            self.finish(result)
        }

        fn try_attach_descriptor(
            &self,
            ops: &impl DescriptorOps,
            settings: &str,
            fd: RawFd,
        ) -> Result<i32> {
            let dup = ops.duplicate(fd).map_err(BridgeError::Duplicate)?;
            ops.set_nonblocking(&dup).map_err(BridgeError::NonBlocking)?;
            let tun = self.adapter.adopt(dup)?;
            self.start(tun, settings)
        }
    }
}

impl<'a, A, F, R> Attacher<'a, A, F, R>
where
    A: AdoptInterface<Handle = InterfaceGuid>,
    F: EngineFactory<A::Interface>,
    R: Registry,
{
    /// Attach by interface identifier, given without braces
    ///
    /// Returns the tunnel handle, or -1 after logging the cause.
    pub fn attach_identifier(&self, settings: &str, identifier: &str) -> i32 {
        let result = self.try_attach_identifier(settings, identifier);
        self.finish(result)
    }

    fn try_attach_identifier(&self, settings: &str, identifier: &str) -> Result<i32> {
        let guid = InterfaceGuid::parse_bare(identifier)?;
        let tun = self.adapter.adopt(guid)?;
        self.start(tun, settings)
    }
}
