//! UAPI configuration model
//!
//! The host hands the engine WireGuard's cross-platform `key=value` text.
//! This module parses that text into a typed [`DeviceConfig`] and renders it
//! back for `wgGetConfig`. Applying is done on a caller-owned copy so a
//! rejected blob never leaves a half-updated device behind.

use crate::error::{BridgeError, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use ipnet::IpNet;
use std::fmt;
use std::fmt::Write as _;
use std::net::SocketAddr;
use std::str::FromStr;

/// Length of every Curve25519 / preshared key
pub const KEY_LEN: usize = 32;

/// A 32 byte key exchanged in hex over UAPI
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Key([u8; KEY_LEN]);

impl Key {
    /// Parse a 64 character hex key
    pub fn from_hex(text: &str) -> Result<Self> {
        let mut bytes = [0u8; KEY_LEN];
        hex::decode_to_slice(text, &mut bytes)
            .map_err(|e| BridgeError::invalid_config(format!("invalid key {text:?}: {e}")))?;
        Ok(Self(bytes))
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|b| *b == 0)
    }

    /// Abbreviated base64 form used to name peers in log lines
    pub fn short(&self) -> String {
        let full = BASE64.encode(self.0);
        format!("{}…{}", &full[..4], &full[full.len() - 5..full.len() - 1])
    }
}

impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Key(..)")
    }
}

impl From<[u8; KEY_LEN]> for Key {
    fn from(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }
}

/// Per-peer settings
#[derive(Debug, Clone, PartialEq)]
pub struct PeerConfig {
    pub public_key: Key,
    pub preshared_key: Option<Key>,
    pub endpoint: Option<SocketAddr>,
    /// Seconds, 0 disables
    pub persistent_keepalive: u16,
    pub allowed_ips: Vec<IpNet>,
}

impl PeerConfig {
    pub fn new(public_key: Key) -> Self {
        Self {
            public_key,
            preshared_key: None,
            endpoint: None,
            persistent_keepalive: 0,
            allowed_ips: Vec::new(),
        }
    }
}

/// Interface settings plus the ordered peer list
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeviceConfig {
    pub private_key: Option<Key>,
    pub listen_port: u16,
    pub fwmark: u32,
    pub peers: Vec<PeerConfig>,
}

/// Peer section being assembled while parsing
struct PeerUpdate {
    peer: PeerConfig,
    is_new: bool,
    update_only: bool,
    remove: bool,
}

impl DeviceConfig {
    /// Apply UAPI `text` on top of the current settings
    ///
    /// Returns an error on the first malformed line. On error `self` may be
    /// partially modified; callers apply to a copy and keep the original.
    pub fn apply_uapi(&mut self, text: &str) -> Result<()> {
        let mut current: Option<PeerUpdate> = None;

        for line in text.lines() {
            let line = line.trim_end_matches('\r');
            if line.is_empty() {
                continue;
            }
            let (key, value) = line
                .split_once('=')
                .ok_or_else(|| BridgeError::invalid_config(format!("failed to parse line {line:?}")))?;

            if key == "public_key" {
                if let Some(update) = current.take() {
                    self.finish_peer(update);
                }
                let public_key = Key::from_hex(value)?;
                current = Some(match self.peers.iter().find(|p| p.public_key == public_key) {
                    Some(existing) => PeerUpdate {
                        peer: existing.clone(),
                        is_new: false,
                        update_only: false,
                        remove: false,
                    },
                    None => PeerUpdate {
                        peer: PeerConfig::new(public_key),
                        is_new: true,
                        update_only: false,
                        remove: false,
                    },
                });
                continue;
            }

            match current.as_mut() {
                Some(update) => Self::set_peer_key(update, key, value)?,
                None => self.set_device_key(key, value)?,
            }
        }

        if let Some(update) = current.take() {
            self.finish_peer(update);
        }
        Ok(())
    }

    fn set_device_key(&mut self, key: &str, value: &str) -> Result<()> {
        match key {
            "private_key" => {
                let private_key = Key::from_hex(value)?;
                self.private_key = (!private_key.is_zero()).then_some(private_key);
            }
            "listen_port" => {
                self.listen_port = parse_number(key, value)?;
            }
            "fwmark" => {
                self.fwmark = parse_number(key, value)?;
            }
            "replace_peers" => {
                expect_true(key, value)?;
                self.peers.clear();
            }
            _ => {
                return Err(BridgeError::invalid_config(format!(
                    "invalid UAPI device key: {key}"
                )))
            }
        }
        Ok(())
    }

    fn set_peer_key(update: &mut PeerUpdate, key: &str, value: &str) -> Result<()> {
        match key {
            "update_only" => {
                expect_true(key, value)?;
                update.update_only = true;
            }
            "remove" => {
                expect_true(key, value)?;
                update.remove = true;
            }
            "preshared_key" => {
                let psk = Key::from_hex(value)?;
                update.peer.preshared_key = (!psk.is_zero()).then_some(psk);
            }
            "endpoint" => {
                let endpoint = value.parse::<SocketAddr>().map_err(|e| {
                    BridgeError::invalid_config(format!("failed to set endpoint {value}: {e}"))
                })?;
                update.peer.endpoint = Some(endpoint);
            }
            "persistent_keepalive_interval" => {
                update.peer.persistent_keepalive = parse_number(key, value)?;
            }
            "replace_allowed_ips" => {
                expect_true(key, value)?;
                update.peer.allowed_ips.clear();
            }
            "allowed_ip" => {
                let net = value.parse::<IpNet>().map_err(|e| {
                    BridgeError::invalid_config(format!("failed to set allowed ip {value}: {e}"))
                })?;
                let net = net.trunc();
                if !update.peer.allowed_ips.contains(&net) {
                    update.peer.allowed_ips.push(net);
                }
            }
            "protocol_version" => {
                if value != "1" {
                    return Err(BridgeError::invalid_config(format!(
                        "invalid protocol version: {value}"
                    )));
                }
            }
            _ => {
                return Err(BridgeError::invalid_config(format!(
                    "invalid UAPI peer key: {key}"
                )))
            }
        }
        Ok(())
    }

    fn finish_peer(&mut self, update: PeerUpdate) {
        let key = update.peer.public_key;
        if update.remove {
            if !update.is_new {
                log::debug!("peer({}) - UAPI: Removing", key.short());
            }
            self.peers.retain(|p| p.public_key != key);
            return;
        }
        if update.is_new && update.update_only {
            return;
        }

        // An allowed IP routes to exactly one peer; the latest assignment wins.
        for other in self.peers.iter_mut().filter(|p| p.public_key != key) {
            other
                .allowed_ips
                .retain(|net| !update.peer.allowed_ips.contains(net));
        }

        if update.is_new {
            log::debug!("peer({}) - UAPI: Created", key.short());
            self.peers.push(update.peer);
        } else if let Some(slot) = self.peers.iter_mut().find(|p| p.public_key == key) {
            log::debug!("peer({}) - UAPI: Updated", key.short());
            *slot = update.peer;
        }
    }

    /// Render the settings in UAPI form
    pub fn to_uapi(&self) -> String {
        self.render(self.listen_port)
    }

    /// Render with the port the device actually bound
    pub fn render(&self, listen_port: u16) -> String {
        let mut out = String::new();
        if let Some(key) = &self.private_key {
            let _ = writeln!(out, "private_key={}", key.to_hex());
        }
        let _ = writeln!(out, "listen_port={listen_port}");
        if self.fwmark != 0 {
            let _ = writeln!(out, "fwmark={}", self.fwmark);
        }
        for peer in &self.peers {
            let _ = writeln!(out, "public_key={}", peer.public_key.to_hex());
            let psk = peer.preshared_key.unwrap_or(Key([0; KEY_LEN]));
            let _ = writeln!(out, "preshared_key={}", psk.to_hex());
            let _ = writeln!(out, "protocol_version=1");
            if let Some(endpoint) = peer.endpoint {
                let _ = writeln!(out, "endpoint={endpoint}");
            }
            let _ = writeln!(
                out,
                "persistent_keepalive_interval={}",
                peer.persistent_keepalive
            );
            for net in &peer.allowed_ips {
                let _ = writeln!(out, "allowed_ip={net}");
            }
        }
        out
    }
}

impl FromStr for DeviceConfig {
    type Err = BridgeError;

    fn from_str(text: &str) -> Result<Self> {
        let mut config = Self::default();
        config.apply_uapi(text)?;
        Ok(config)
    }
}

fn parse_number<T: FromStr>(key: &str, value: &str) -> Result<T>
where
    T::Err: fmt::Display,
{
    value
        .parse::<T>()
        .map_err(|e| BridgeError::invalid_config(format!("failed to parse {key} {value:?}: {e}")))
}

fn expect_true(key: &str, value: &str) -> Result<()> {
    if value == "true" {
        Ok(())
    } else {
        Err(BridgeError::invalid_config(format!(
            "failed to set {key}, invalid value: {value}"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PRIVATE: &str = "e84b5a6d2717c1003a13b431570353dbaca9146cf150c5f8575680feba52027a";
    const PEER_A: &str = "b85996fecc9c7f1fc6d2572a76eda11d59bcd20be8e543b15ce4bd85a8e75a33";
    const PEER_B: &str = "58402e695ba1772b1cc9309755f043251ea77fdcf10fbe63989ceb7e19321376";

    fn base() -> String {
        format!(
            "private_key={PRIVATE}\nlisten_port=51820\n\
             public_key={PEER_A}\nendpoint=192.0.2.1:51820\n\
             persistent_keepalive_interval=25\nallowed_ip=10.0.0.0/8\nallowed_ip=fd00::1/64\n"
        )
    }

    #[test]
    fn test_config_parsing() {
        let config: DeviceConfig = base().parse().expect("Failed to parse config");
        assert_eq!(config.private_key, Some(Key::from_hex(PRIVATE).unwrap()));
        assert_eq!(config.listen_port, 51820);
        assert_eq!(config.peers.len(), 1);
        let peer = &config.peers[0];
        assert_eq!(peer.endpoint, Some("192.0.2.1:51820".parse().unwrap()));
        assert_eq!(peer.persistent_keepalive, 25);
        assert_eq!(
            peer.allowed_ips,
            vec![
                "10.0.0.0/8".parse::<IpNet>().unwrap(),
                "fd00::/64".parse::<IpNet>().unwrap()
            ]
        );
    }

    #[test]
    fn test_garbage_is_rejected() {
        assert!("garbage config".parse::<DeviceConfig>().is_err());
        assert!("listen_port=seventy".parse::<DeviceConfig>().is_err());
        assert!("private_key=abcd".parse::<DeviceConfig>().is_err());
        assert!("mtu=1420".parse::<DeviceConfig>().is_err());
        assert!(format!("public_key={PEER_A}\nprotocol_version=2")
            .parse::<DeviceConfig>()
            .is_err());
        assert!(format!("public_key={PEER_A}\nendpoint=example.com:51820")
            .parse::<DeviceConfig>()
            .is_err());
    }

    #[test]
    fn test_update_remove_and_replace() {
        let mut config: DeviceConfig = base().parse().unwrap();

        config
            .apply_uapi(&format!("public_key={PEER_B}\nupdate_only=true\nallowed_ip=10.1.0.0/16"))
            .unwrap();
        assert_eq!(config.peers.len(), 1, "update_only must not create peers");

        config
            .apply_uapi(&format!("public_key={PEER_B}\nallowed_ip=10.0.0.0/8"))
            .unwrap();
        assert_eq!(config.peers.len(), 2);
        assert!(config.peers[0].allowed_ips.iter().all(|n| n.to_string() != "10.0.0.0/8"));

        config
            .apply_uapi(&format!("public_key={PEER_A}\nremove=true"))
            .unwrap();
        assert_eq!(config.peers.len(), 1);
        assert_eq!(config.peers[0].public_key, Key::from_hex(PEER_B).unwrap());

        config.apply_uapi("replace_peers=true\nfwmark=51820").unwrap();
        assert!(config.peers.is_empty());
        assert_eq!(config.fwmark, 51820);
    }

    #[test]
    fn test_uapi_render_parses_back() {
        let config: DeviceConfig = base().parse().unwrap();
        let rendered = config.to_uapi();
        assert!(rendered.starts_with(&format!("private_key={PRIVATE}\nlisten_port=51820\n")));
        assert!(rendered.contains("allowed_ip=fd00::/64\n"));
        assert_eq!(rendered.parse::<DeviceConfig>().unwrap(), config);
    }

    #[test]
    fn test_zero_private_key_clears() {
        let mut config: DeviceConfig = base().parse().unwrap();
        config
            .apply_uapi(&format!("private_key={}", "0".repeat(64)))
            .unwrap();
        assert!(config.private_key.is_none());
        assert!(!config.to_uapi().contains("private_key="));
    }

    #[test]
    fn test_key_debug_is_redacted() {
        let key = Key::from_hex(PRIVATE).unwrap();
        assert_eq!(format!("{key:?}"), "Key(..)");
        assert_eq!(key.short().chars().count(), 9);
    }
}
