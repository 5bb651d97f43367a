//! Device Identity Module

use std::net::{IpAddr, Ipv4Addr, UdpSocket};

use tracing::warn;

use crate::model::DeviceIdentity;

const UNKNOWN_MAC: &str = "00:00:00:00:00:00";

/// Identifiers of the reporting device
pub trait IdentityProvider: Send + Sync {
    fn hostname(&self) -> String;
    fn hardware_address(&self) -> String;
    fn local_ip(&self) -> String;

    /// Snapshot of all identifiers, taken when an event is written
    fn capture(&self) -> DeviceIdentity {
        DeviceIdentity {
            host_name: self.hostname(),
            mac_address: self.hardware_address(),
            ip_address: self.local_ip(),
        }
    }
}

/// Identity read from the running machine
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemIdentity;

impl IdentityProvider for SystemIdentity {
    fn hostname(&self) -> String {
        whoami::fallible::hostname().unwrap_or_else(|_| "unknown-host".to_string())
    }

    fn hardware_address(&self) -> String {
        match mac_address::get_mac_address() {
            Ok(Some(mac)) => mac.to_string().to_lowercase(),
            Ok(None) => UNKNOWN_MAC.to_string(),
            Err(e) => {
                warn!("Failed to read MAC address: {}", e);
                UNKNOWN_MAC.to_string()
            }
        }
    }

    fn local_ip(&self) -> String {
        // Connecting a UDP socket sends nothing but selects the outbound interface
        let detect = || -> std::io::Result<IpAddr> {
            let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))?;
            socket.connect(("8.8.8.8", 80))?;
            Ok(socket.local_addr()?.ip())
        };

        detect()
            .unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST))
            .to_string()
    }
}

/// Fixed identity, for tests and headless tooling
#[derive(Debug, Clone)]
pub struct StaticIdentity(pub DeviceIdentity);

impl IdentityProvider for StaticIdentity {
    fn hostname(&self) -> String {
        self.0.host_name.clone()
    }

    fn hardware_address(&self) -> String {
        self.0.mac_address.clone()
    }

    fn local_ip(&self) -> String {
        self.0.ip_address.clone()
    }
}
