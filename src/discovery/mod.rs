//! mDNS/DNS-SD peer discovery
//!
//! The agent advertises `_yank._tcp.local.` with a `device_id` TXT key
//! and browses the same type. A record whose `device_id` matches the
//! paired peer updates the best-known-address slot; the connect loop
//! reads that slot. Discovery and connection are otherwise independent.

use mdns_sd::{ServiceDaemon, ServiceEvent, ServiceInfo, TxtProperties};
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// mDNS service type for yank agents.
pub const SERVICE_TYPE: &str = "_yank._tcp.local.";

/// How long the connector waits on discovery before falling back to a
/// user-supplied `--peer` address.
pub const DISCOVERY_GRACE: Duration = Duration::from_secs(10);

/// Discovery errors
#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("mDNS error: {0}")]
    Mdns(#[from] mdns_sd::Error),

    #[error("no usable network interface")]
    NoInterface,
}

/// Single-slot cell holding the best known peer address.
#[derive(Clone, Default)]
pub struct PeerSlot {
    inner: Arc<RwLock<Option<SocketAddr>>>,
}

impl PeerSlot {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set(&self, addr: SocketAddr) {
        let mut slot = self.inner.write().await;
        if *slot != Some(addr) {
            info!(%addr, "peer address updated");
        }
        *slot = Some(addr);
    }

    pub async fn get(&self) -> Option<SocketAddr> {
        *self.inner.read().await
    }

    pub async fn clear(&self) {
        *self.inner.write().await = None;
    }
}

/// mDNS advertisement plus browse loop.
pub struct Discovery {
    daemon: ServiceDaemon,
    registered: Option<String>,
}

impl Discovery {
    pub fn new() -> Result<Self, DiscoveryError> {
        Ok(Self {
            daemon: ServiceDaemon::new()?,
            registered: None,
        })
    }

    /// Advertise this agent's service record.
    pub fn advertise(
        &mut self,
        device_id: &str,
        device_name: &str,
        port: u16,
    ) -> Result<(), DiscoveryError> {
        let instance = format!("yank-{}", device_id);
        let hostname = format!("{}.local.", sanitize_host(device_name));
        let addresses = local_addresses()?;
        if addresses.is_empty() {
            return Err(DiscoveryError::NoInterface);
        }

        let mut properties = HashMap::new();
        properties.insert("device_id".to_string(), device_id.to_string());

        let info = ServiceInfo::new(
            SERVICE_TYPE,
            &instance,
            &hostname,
            addresses[0],
            port,
            Some(properties),
        )?;
        let fullname = info.get_fullname().to_string();
        self.daemon.register(info)?;
        self.registered = Some(fullname);
        info!(device_id, port, "advertising service");
        Ok(())
    }

    /// Browse for the paired peer, feeding matches into `slot`.
    ///
    /// Runs until the daemon shuts down.
    pub fn browse(
        &self,
        peer_device_id: String,
        own_device_id: String,
        slot: PeerSlot,
    ) -> Result<(), DiscoveryError> {
        let receiver = self.daemon.browse(SERVICE_TYPE)?;
        tokio::spawn(async move {
            while let Ok(event) = receiver.recv_async().await {
                match event {
                    ServiceEvent::ServiceResolved(info) => {
                        let Some(device_id) = txt_value(info.get_properties(), "device_id")
                        else {
                            continue;
                        };
                        if device_id == own_device_id {
                            continue;
                        }
                        if device_id != peer_device_id {
                            debug!(device_id, "ignoring unpaired yank service");
                            continue;
                        }
                        if let Some(ip) = pick_address(&info) {
                            slot.set(SocketAddr::new(ip, info.get_port())).await;
                        }
                    }
                    ServiceEvent::ServiceRemoved(_, fullname) => {
                        debug!(%fullname, "service removed");
                    }
                    _ => {}
                }
            }
        });
        Ok(())
    }

    pub fn shutdown(&mut self) {
        if let Some(fullname) = self.registered.take() {
            let _ = self.daemon.unregister(&fullname);
        }
        if let Err(e) = self.daemon.shutdown() {
            warn!("mDNS shutdown failed: {e}");
        }
    }
}

/// One-shot resolve used by `yank status`: browse briefly and return the
/// paired peer's address if it shows up.
pub async fn resolve_once(
    peer_device_id: &str,
    timeout: Duration,
) -> Result<Option<SocketAddr>, DiscoveryError> {
    let daemon = ServiceDaemon::new()?;
    let receiver = daemon.browse(SERVICE_TYPE)?;
    let deadline = tokio::time::Instant::now() + timeout;

    let mut found = None;
    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            break;
        }
        match tokio::time::timeout(remaining, receiver.recv_async()).await {
            Ok(Ok(ServiceEvent::ServiceResolved(info))) => {
                if txt_value(info.get_properties(), "device_id").as_deref()
                    == Some(peer_device_id)
                {
                    if let Some(ip) = pick_address(&info) {
                        found = Some(SocketAddr::new(ip, info.get_port()));
                        break;
                    }
                }
            }
            Ok(Ok(_)) => continue,
            Ok(Err(_)) | Err(_) => break,
        }
    }

    let _ = daemon.shutdown();
    Ok(found)
}

fn txt_value(properties: &TxtProperties, key: &str) -> Option<String> {
    properties.iter().find_map(|prop| {
        if prop.key() == key {
            prop.val().map(|v| String::from_utf8_lossy(v).to_string())
        } else {
            None
        }
    })
}

fn pick_address(info: &ServiceInfo) -> Option<IpAddr> {
    // Prefer IPv4; link-local IPv6 addresses need scope ids we do not carry.
    let addresses = info.get_addresses();
    addresses
        .iter()
        .find(|ip| ip.is_ipv4())
        .or_else(|| addresses.iter().next())
        .copied()
}

/// Non-loopback local addresses, for advertisement and for the pairing
/// host's "run this on the other device" banner.
pub fn local_addresses() -> Result<Vec<IpAddr>, DiscoveryError> {
    let mut addresses = Vec::new();
    let interfaces = if_addrs::get_if_addrs().map_err(|_| DiscoveryError::NoInterface)?;
    for iface in interfaces {
        if !iface.is_loopback() {
            addresses.push(iface.ip());
        }
    }
    // IPv4 first for readability.
    addresses.sort_by_key(|ip| !ip.is_ipv4());
    Ok(addresses)
}

fn sanitize_host(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '-' })
        .collect();
    let trimmed = cleaned.trim_matches('-');
    if trimmed.is_empty() {
        "yank".to_string()
    } else {
        trimmed.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn peer_slot_updates_and_clears() {
        let slot = PeerSlot::new();
        assert!(slot.get().await.is_none());

        let addr: SocketAddr = "192.168.1.20:9876".parse().unwrap();
        slot.set(addr).await;
        assert_eq!(slot.get().await, Some(addr));

        slot.clear().await;
        assert!(slot.get().await.is_none());
    }

    #[test]
    fn hostnames_are_sanitized() {
        assert_eq!(sanitize_host("alpha (linux)"), "alpha--linux");
        assert_eq!(sanitize_host("???"), "yank");
        assert_eq!(sanitize_host("box-1"), "box-1");
    }
}
