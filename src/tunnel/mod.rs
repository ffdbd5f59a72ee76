//! Platform Interface Adapters
//!
//! Each target turns a host-owned interface handle into a [`TunInterface`]
//! the engine can read and write packets through. Exactly one adapter is
//! compiled per target and exported as [`PlatformAdapter`]:
//!
//! | target            | handle            | adapter                |
//! |-------------------|-------------------|------------------------|
//! | Linux             | duplicated fd     | [`MonitoredFdAdapter`] |
//! | other unix        | duplicated fd     | [`GenericFdAdapter`]   |
//! | Windows           | interface GUID    | [`WintunAdapter`]      |
//!
//! Adapters never return a half-built interface: on error the handle they
//! were given has already been released.

use crate::error::Result;
use std::io;

mod guid;
pub use guid::InterfaceGuid;

#[cfg(unix)]
mod fd;
#[cfg(unix)]
pub use fd::{FdTun, Framing};

#[cfg(target_os = "linux")]
mod linux;
#[cfg(target_os = "linux")]
pub use linux::{LinuxTun, MonitoredFdAdapter};

#[cfg(all(unix, not(target_os = "linux")))]
mod posix;
#[cfg(all(unix, not(target_os = "linux")))]
pub use posix::GenericFdAdapter;

#[cfg(windows)]
mod windows;
#[cfg(windows)]
pub use windows::{WintunAdapter, WintunInterface};

/// The adapter selected for this build target
#[cfg(target_os = "linux")]
pub type PlatformAdapter = MonitoredFdAdapter;
#[cfg(all(unix, not(target_os = "linux")))]
pub type PlatformAdapter = GenericFdAdapter;
#[cfg(windows)]
pub type PlatformAdapter = WintunAdapter;

/// Virtual interface object: raw IP packets in and out
pub trait TunInterface: Send + Sync + 'static {
    /// OS name of the interface
    fn name(&self) -> io::Result<String>;

    /// Read one packet; `WouldBlock` when none is pending
    fn read(&self, buf: &mut [u8]) -> io::Result<usize>;

    /// Write one packet
    fn write(&self, buf: &[u8]) -> io::Result<usize>;

    /// Whether the OS reported the interface as gone
    fn is_removed(&self) -> bool {
        false
    }
}

/// Turn a host handle into a virtual interface
pub trait AdoptInterface {
    /// What the host hands over
    type Handle;
    /// What the engine receives
    type Interface: TunInterface;

    fn adopt(&self, handle: Self::Handle) -> Result<Self::Interface>;
}
