//! Tunnel engine contract
//!
//! The orchestrator only needs to construct an engine around an adopted
//! interface, feed it configuration and bring it up. Packet processing
//! lives behind [`Engine`] and is not part of this crate.

mod bind;
mod device;

pub use bind::{Bind, UdpBind};
pub use device::Device;

use crate::error::Result;
use crate::tunnel::TunInterface;

/// A running tunnel engine instance
///
/// Dropping the engine closes it and releases its interface.
pub trait Engine: Send {
    /// Bring the device up and bind its sockets
    fn up(&mut self) -> Result<()>;

    /// Apply UAPI settings; on error nothing changed
    fn ipc_set(&mut self, settings: &str) -> Result<()>;

    /// Current settings in UAPI form
    fn ipc_get(&self) -> Result<String>;

    /// Rebind sockets after a network change
    fn bump_sockets(&mut self) -> Result<()>;

    /// Stop following endpoint changes reported by incoming packets
    fn disable_some_roaming(&mut self);

    fn socket_v4(&self) -> Option<i32>;

    fn socket_v6(&self) -> Option<i32>;
}

/// Builds an engine around an adopted interface
pub trait EngineFactory<T: TunInterface> {
    fn construct(&self, tun: T) -> Box<dyn Engine>;
}

/// Default factory: a [`Device`] with a [`UdpBind`]
#[derive(Debug, Default, Clone, Copy)]
pub struct DeviceFactory;

impl<T: TunInterface> EngineFactory<T> for DeviceFactory {
    fn construct(&self, tun: T) -> Box<dyn Engine> {
        Box::new(Device::new(tun, UdpBind::new()))
    }
}
