//! wgbridge - Static Library for Attaching a Tunnel Engine to a Host Interface
//!
//! This is a **static library** loaded by a host VPN process. The host owns
//! the virtual network interface; this library adopts it, runs a tunnel
//! engine on top of it and hands back a small integer handle.
//!
//! ## What This Library Provides
//! - Per-platform interface adoption (TUN descriptors on unix, Wintun by GUID on Windows)
//! - Attachment with full rollback: a failed attempt releases everything it acquired
//! - UAPI configuration applied atomically to running tunnels
//! - Log forwarding to a host callback (level 0 verbose, 1 error)
//! - `SIGUSR2` stack dumps for diagnosing hangs in the field
//! - C FFI bindings (`wgTurnOn`, `wgSetConfig`, ...) for the host's loader
//!
//! ## What the Host Must Provide
//! - The TUN descriptor or interface GUID
//! - Addresses, routes and DNS on the interface
//! - A log callback, if it wants to see anything

pub mod logger;

pub mod attach;
pub mod config;
#[cfg(all(unix, feature = "signal-diagnostics"))]
pub mod diagnostics;
pub mod engine;
pub mod error;
pub mod registry;
pub mod tunnel;

// Re-export core types for static library interface
pub use attach::Attacher;
pub use config::{DeviceConfig, Key, PeerConfig};
pub use engine::{Engine, EngineFactory};
pub use error::{BridgeError, Result};
pub use logger::{LogBridge, LogLevel};
pub use registry::{Registry, TunnelRegistry};
pub use tunnel::{AdoptInterface, InterfaceGuid, PlatformAdapter, TunInterface};

/// Library version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const NAME: &str = env!("CARGO_PKG_NAME");

/// C FFI Interface for the host process
pub mod ffi;
