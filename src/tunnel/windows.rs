//! Windows identifier-request adapter backed by Wintun

use super::guid::InterfaceGuid;
use super::{AdoptInterface, TunInterface};
use crate::error::{BridgeError, Result};
use std::io;
use std::sync::Arc;
use wintun::{Adapter, Session};

const TUNNEL_TYPE: &str = "WireGuard";

/// Wintun adapter plus its packet session
pub struct WintunInterface {
    name: String,
    adapter: Arc<Adapter>,
    session: Arc<Session>,
}

impl WintunInterface {
    pub fn adapter(&self) -> &Arc<Adapter> {
        &self.adapter
    }
}

impl TunInterface for WintunInterface {
    fn name(&self) -> io::Result<String> {
        Ok(self.name.clone())
    }

    fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        match self.session.try_receive() {
            Ok(Some(packet)) => {
                let bytes = packet.bytes();
                let n = bytes.len().min(buf.len());
                buf[..n].copy_from_slice(&bytes[..n]);
                Ok(n)
            }
            Ok(None) => Err(io::ErrorKind::WouldBlock.into()),
            Err(e) => Err(io::Error::new(io::ErrorKind::Other, e.to_string())),
        }
    }

    fn write(&self, buf: &[u8]) -> io::Result<usize> {
        let len = u16::try_from(buf.len())
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "packet too large"))?;
        let mut packet = self
            .session
            .allocate_send_packet(len)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?;
        packet.bytes_mut().copy_from_slice(buf);
        self.session.send_packet(packet);
        Ok(buf.len())
    }
}

impl Drop for WintunInterface {
    fn drop(&mut self) {
        let _ = self.session.shutdown();
        log::debug!("Closed Wintun adapter {}", self.name);
    }
}

/// Creates a Wintun adapter carrying the requested identifier
#[derive(Debug, Default, Clone, Copy)]
pub struct WintunAdapter;

impl AdoptInterface for WintunAdapter {
    type Handle = InterfaceGuid;
    type Interface = WintunInterface;

    fn adopt(&self, guid: InterfaceGuid) -> Result<WintunInterface> {
        let wintun = unsafe { wintun::load() }
            .map_err(|e| BridgeError::Interface(format!("unable to load wintun.dll: {e}")))?;

        let name = guid.to_string();
        let adapter = Adapter::create(&wintun, &name, TUNNEL_TYPE, Some(guid.as_u128()))
            .map_err(|e| BridgeError::Interface(format!("unable to create adapter {name}: {e}")))?;
        let session = adapter
            .start_session(wintun::MAX_RING_CAPACITY)
            .map_err(|e| BridgeError::Interface(format!("unable to start session: {e}")))?;

        log::debug!("Created Wintun adapter {name}");
        Ok(WintunInterface {
            name,
            adapter,
            session: Arc::new(session),
        })
    }
}
