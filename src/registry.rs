//! Handle registry for live tunnels
//!
//! Maps the small integer handles returned to the host onto running engines.

use crate::engine::Engine;
use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

/// Accepts a configured engine and hands back a handle
pub trait Registry {
    /// Register `engine`, or give it back when no handle is available
    fn register(&self, engine: Box<dyn Engine>, settings: &str)
        -> Result<i32, Box<dyn Engine>>;
}

/// A registered engine and the settings it was started with
struct Tunnel {
    engine: Box<dyn Engine>,
    settings: String,
}

/// Process-wide table of tunnels
pub struct TunnelRegistry {
    tunnels: Mutex<BTreeMap<i32, Tunnel>>,
    capacity: usize,
}

lazy_static::lazy_static! {
    static ref TUNNELS: TunnelRegistry = TunnelRegistry::new();
}

/// The registry the exported entry points use
pub fn tunnels() -> &'static TunnelRegistry {
    &TUNNELS
}

impl TunnelRegistry {
    pub fn new() -> Self {
        Self::with_capacity(i32::MAX as usize)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            tunnels: Mutex::new(BTreeMap::new()),
            capacity,
        }
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<i32, Tunnel>> {
        // The map stays consistent even if an engine call panicked.
        self.tunnels
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Take a tunnel out of the table; the caller drops it
    pub fn remove(&self, handle: i32) -> Option<Box<dyn Engine>> {
        self.lock().remove(&handle).map(|tunnel| tunnel.engine)
    }

    /// Run `f` against the engine behind `handle`
    pub fn with_engine<R>(&self, handle: i32, f: impl FnOnce(&mut dyn Engine) -> R) -> Option<R> {
        let mut tunnels = self.lock();
        tunnels.get_mut(&handle).map(|tunnel| f(tunnel.engine.as_mut()))
    }

    /// Settings text the tunnel was started with
    pub fn settings(&self, handle: i32) -> Option<String> {
        self.lock().get(&handle).map(|tunnel| tunnel.settings.clone())
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for TunnelRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry for TunnelRegistry {
    fn register(
        &self,
        engine: Box<dyn Engine>,
        settings: &str,
    ) -> Result<i32, Box<dyn Engine>> {
        let mut tunnels = self.lock();
        if tunnels.len() >= self.capacity {
            return Err(engine);
        }
        // Keys are sorted, so the first gap is the lowest free handle.
        let mut handle = 0;
        for &used in tunnels.keys() {
            if used != handle {
                break;
            }
            handle += 1;
        }
        if handle == i32::MAX {
            return Err(engine);
        }
        tunnels.insert(
            handle,
            Tunnel {
                engine,
                settings: settings.to_string(),
            },
        );
        Ok(handle)
    }
}
