//! Default engine: interface, transport and UAPI state

use super::{Bind, Engine};
use crate::config::DeviceConfig;
use crate::error::{BridgeError, ConfigErrorKind, Result};
use crate::tunnel::TunInterface;
use std::io;

/// A tunnel device bound to one interface and one binder
pub struct Device<T: TunInterface, B: Bind> {
    tun: T,
    bind: B,
    config: DeviceConfig,
    is_up: bool,
    /// Set by the first `up`; sockets lost afterwards are reopened on bump
    requested_up: bool,
    bound_port: u16,
    roaming_disabled: bool,
}

impl<T: TunInterface, B: Bind> Device<T, B> {
    pub fn new(tun: T, bind: B) -> Self {
        Self {
            tun,
            bind,
            config: DeviceConfig::default(),
            is_up: false,
            requested_up: false,
            bound_port: 0,
            roaming_disabled: false,
        }
    }

    pub fn config(&self) -> &DeviceConfig {
        &self.config
    }

    pub fn is_up(&self) -> bool {
        self.is_up
    }

    pub fn roaming_disabled(&self) -> bool {
        self.roaming_disabled
    }

    pub fn interface(&self) -> &T {
        &self.tun
    }

    /// Reopen the transport while up
    ///
    /// Reopening the port already bound releases the old sockets first, so
    /// a failure there leaves the device without transport and takes it down.
    fn reopen(&mut self, port: u16, fwmark: u32) -> io::Result<()> {
        match self.bind.open(port, fwmark) {
            Ok(bound) => {
                self.bound_port = bound;
                Ok(())
            }
            Err(e) => {
                if port != 0 && port == self.bound_port {
                    self.is_up = false;
                    log::error!("Sockets on port {port} lost, device is down: {e}");
                }
                Err(e)
            }
        }
    }
}

fn bind_failure(port: u16, err: io::Error) -> BridgeError {
    let kind = if err.kind() == io::ErrorKind::AddrInUse {
        ConfigErrorKind::PortInUse
    } else {
        ConfigErrorKind::Io
    };
    BridgeError::Config {
        kind,
        message: format!("failed to set listen_port {port}: {err}"),
    }
}

impl<T: TunInterface, B: Bind> Engine for Device<T, B> {
    fn up(&mut self) -> Result<()> {
        if self.is_up {
            return Ok(());
        }
        if self.tun.is_removed() {
            return Err(BridgeError::Interface("interface was removed".to_string()));
        }
        self.bound_port = self
            .bind
            .open(self.config.listen_port, self.config.fwmark)
            .map_err(BridgeError::Bind)?;
        self.is_up = true;
        self.requested_up = true;
        log::debug!("Interface state was Down, requested Up, now Up");
        Ok(())
    }

    fn ipc_set(&mut self, settings: &str) -> Result<()> {
        let mut staged = self.config.clone();
        staged.apply_uapi(settings)?;

        if self.is_up {
            if staged.listen_port != self.config.listen_port {
                self.reopen(staged.listen_port, staged.fwmark)
                    .map_err(|e| bind_failure(staged.listen_port, e))?;
            } else if staged.fwmark != self.config.fwmark {
                self.bind.set_mark(staged.fwmark).map_err(|e| BridgeError::Config {
                    kind: ConfigErrorKind::Io,
                    message: format!("failed to update fwmark: {e}"),
                })?;
            }
        }

        self.config = staged;
        Ok(())
    }

    fn ipc_get(&self) -> Result<String> {
        let port = if self.is_up {
            self.bound_port
        } else {
            self.config.listen_port
        };
        Ok(self.config.render(port))
    }

    fn bump_sockets(&mut self) -> Result<()> {
        if !self.requested_up {
            return Ok(());
        }
        if !self.is_up {
            return self.up();
        }
        self.reopen(self.bound_port, self.config.fwmark)
            .map_err(BridgeError::Bind)
    }

    fn disable_some_roaming(&mut self) {
        self.roaming_disabled = true;
        log::debug!("Roaming disabled for all peers");
    }

    fn socket_v4(&self) -> Option<i32> {
        self.bind.socket_v4()
    }

    fn socket_v6(&self) -> Option<i32> {
        self.bind.socket_v6()
    }
}

impl<T: TunInterface, B: Bind> Drop for Device<T, B> {
    fn drop(&mut self) {
        self.bind.close();
        self.is_up = false;
        log::debug!("Device closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    struct NullTun;

    impl TunInterface for NullTun {
        fn name(&self) -> io::Result<String> {
            Ok("tun-null".to_string())
        }

        fn read(&self, _buf: &mut [u8]) -> io::Result<usize> {
            Err(io::ErrorKind::WouldBlock.into())
        }

        fn write(&self, buf: &[u8]) -> io::Result<usize> {
            Ok(buf.len())
        }
    }

    #[derive(Default)]
    struct BindLog {
        opens: Vec<(u16, u32)>,
        marks: Vec<u32>,
        closes: usize,
        busy_port: Option<u16>,
    }

    #[derive(Clone, Default)]
    struct FakeBind(Arc<Mutex<BindLog>>);

    impl Bind for FakeBind {
        fn open(&mut self, port: u16, fwmark: u32) -> io::Result<u16> {
            let mut log = self.0.lock().unwrap();
            if log.busy_port == Some(port) {
                return Err(io::ErrorKind::AddrInUse.into());
            }
            log.opens.push((port, fwmark));
            Ok(if port == 0 { 40000 } else { port })
        }

        fn close(&mut self) {
            self.0.lock().unwrap().closes += 1;
        }

        fn set_mark(&mut self, fwmark: u32) -> io::Result<()> {
            self.0.lock().unwrap().marks.push(fwmark);
            Ok(())
        }

        fn socket_v4(&self) -> Option<i32> {
            None
        }

        fn socket_v6(&self) -> Option<i32> {
            None
        }
    }

    const PRIVATE: &str = "e84b5a6d2717c1003a13b431570353dbaca9146cf150c5f8575680feba52027a";

    fn device() -> (Device<NullTun, FakeBind>, FakeBind) {
        let bind = FakeBind::default();
        (Device::new(NullTun, bind.clone()), bind)
    }

    #[test]
    fn test_rejected_settings_leave_state_untouched() {
        let (mut dev, _) = device();
        dev.ipc_set(&format!("private_key={PRIVATE}\nlisten_port=51820\n"))
            .unwrap();
        let before = dev.ipc_get().unwrap();

        let err = dev.ipc_set("listen_port=1\ngarbage config\n").unwrap_err();
        assert!(matches!(
            err,
            BridgeError::Config {
                kind: ConfigErrorKind::Invalid,
                ..
            }
        ));
        assert_eq!(dev.ipc_get().unwrap(), before);
    }

    #[test]
    fn test_up_binds_configured_port() {
        let (mut dev, bind) = device();
        dev.ipc_set("listen_port=51820\nfwmark=7\n").unwrap();
        dev.up().unwrap();
        dev.up().unwrap();
        assert!(dev.is_up());
        assert_eq!(bind.0.lock().unwrap().opens, vec![(51820, 7)]);
    }

    #[test]
    fn test_random_port_is_reported() {
        let (mut dev, _) = device();
        dev.up().unwrap();
        assert!(dev.ipc_get().unwrap().contains("listen_port=40000\n"));
    }

    #[test]
    fn test_port_change_rebinds_while_up() {
        let (mut dev, bind) = device();
        dev.up().unwrap();
        dev.ipc_set("listen_port=51821\n").unwrap();
        dev.ipc_set("fwmark=3\n").unwrap();

        let log = bind.0.lock().unwrap();
        assert_eq!(log.opens, vec![(0, 0), (51821, 0)]);
        assert_eq!(log.marks, vec![3]);
    }

    #[test]
    fn test_port_in_use_rejects_whole_blob() {
        let (mut dev, bind) = device();
        dev.up().unwrap();
        bind.0.lock().unwrap().busy_port = Some(51822);

        let err = dev
            .ipc_set(&format!("private_key={PRIVATE}\nlisten_port=51822\n"))
            .unwrap_err();
        assert_eq!(err.errno(), libc::EADDRINUSE);
        assert!(dev.is_up());
        assert!(dev.config().private_key.is_none());
        assert_eq!(dev.config().listen_port, 0);
    }

    #[test]
    fn test_bump_and_roaming() {
        let (mut dev, bind) = device();
        dev.bump_sockets().unwrap();
        assert!(bind.0.lock().unwrap().opens.is_empty());

        dev.up().unwrap();
        dev.bump_sockets().unwrap();
        assert_eq!(bind.0.lock().unwrap().opens, vec![(0, 0), (40000, 0)]);

        dev.disable_some_roaming();
        assert!(dev.roaming_disabled());
    }

    #[test]
    fn test_failed_bump_takes_device_down_until_next_bump() {
        let (mut dev, bind) = device();
        dev.up().unwrap();
        bind.0.lock().unwrap().busy_port = Some(40000);

        let err = dev.bump_sockets().unwrap_err();
        assert!(matches!(err, BridgeError::Bind(_)));
        assert!(!dev.is_up());
        assert!(dev.ipc_get().unwrap().contains("listen_port=0\n"));

        bind.0.lock().unwrap().busy_port = None;
        dev.bump_sockets().unwrap();
        assert!(dev.is_up());
        assert_eq!(bind.0.lock().unwrap().opens, vec![(0, 0), (0, 0)]);
    }

    #[test]
    fn test_failed_rebind_to_bound_port_takes_device_down() {
        let (mut dev, bind) = device();
        dev.up().unwrap();
        bind.0.lock().unwrap().busy_port = Some(40000);

        let err = dev.ipc_set("listen_port=40000\n").unwrap_err();
        assert_eq!(err.errno(), libc::EADDRINUSE);
        assert!(!dev.is_up());
        assert_eq!(dev.config().listen_port, 0);
    }

    #[test]
    fn test_drop_closes_bind() {
        let (dev, bind) = device();
        drop(dev);
        assert_eq!(bind.0.lock().unwrap().closes, 1);
    }
}
