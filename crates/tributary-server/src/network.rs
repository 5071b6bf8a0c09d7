//! Local network collaborators: LAN address discovery and QR rendering.

use std::net::{IpAddr, SocketAddr, UdpSocket};

use crate::error::PairingError;

/// Reports this device's address on the local network.
pub trait LocalAddressProvider: Send + Sync + 'static {
    /// `None` when offline.
    fn local_address(&self) -> Option<IpAddr>;
}

/// Turns a pairing URL into a scannable image.
pub trait QrRenderer: Send + Sync {
    fn render(&self, url: &str) -> Result<Vec<u8>, PairingError>;
}

/// Finds the outbound interface address by connecting a UDP socket.
///
/// `connect` on UDP only selects a route; no packet is sent.
#[derive(Debug, Clone)]
pub struct UdpProbeAddressProvider {
    probe: SocketAddr,
}

impl Default for UdpProbeAddressProvider {
    fn default() -> Self {
        Self {
            probe: SocketAddr::from(([192, 0, 2, 1], 9)),
        }
    }
}

impl UdpProbeAddressProvider {
    pub fn new(probe: SocketAddr) -> Self {
        Self { probe }
    }
}

impl LocalAddressProvider for UdpProbeAddressProvider {
    fn local_address(&self) -> Option<IpAddr> {
        let bind: SocketAddr = if self.probe.is_ipv4() {
            SocketAddr::from(([0, 0, 0, 0], 0))
        } else {
            SocketAddr::from(([0u16; 8], 0))
        };
        let socket = UdpSocket::bind(bind).ok()?;
        socket.connect(self.probe).ok()?;
        let ip = socket.local_addr().ok()?.ip();
        (!ip.is_unspecified()).then_some(ip)
    }
}

/// Always reports the same address.
#[derive(Debug, Clone, Copy)]
pub struct FixedAddressProvider(pub Option<IpAddr>);

impl LocalAddressProvider for FixedAddressProvider {
    fn local_address(&self) -> Option<IpAddr> {
        self.0
    }
}

/// `http://<ip>:<port>/`, bracketing IPv6 addresses.
pub fn pairing_url(ip: IpAddr, port: u16) -> String {
    format!("http://{}/", SocketAddr::new(ip, port))
}
