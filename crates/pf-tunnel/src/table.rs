//! Device to relay endpoint table

use dashmap::DashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use pf_core::DeviceSerial;

/// Local relay endpoint of every tunnelled device
#[derive(Debug, Default)]
pub struct TunnelTable {
    endpoints: DashMap<DeviceSerial, SocketAddr>,
}

impl TunnelTable {
    /// Create a new empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the relay endpoint of a device, replacing any previous one
    pub fn insert(&self, serial: DeviceSerial, addr: SocketAddr) {
        self.endpoints.insert(serial, addr);
    }

    /// Forget a device's endpoint
    pub fn remove(&self, serial: &DeviceSerial) -> Option<SocketAddr> {
        self.endpoints.remove(serial).map(|(_, addr)| addr)
    }

    /// Host and port of the device's relay endpoint
    pub fn connection_info(&self, serial: &DeviceSerial) -> Option<(String, u16)> {
        self.endpoints
            .get(serial)
            .map(|addr| (addr.ip().to_string(), addr.port()))
    }

    pub fn clear(&self) {
        self.endpoints.clear();
    }

    /// Check if no device is tunnelled
    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }

    /// Read-only handle for consumers of the table
    pub fn handle(self: &Arc<Self>) -> TunnelHandle {
        TunnelHandle {
            table: Arc::clone(self),
        }
    }
}

/// Cloneable read access to the tunnel table
#[derive(Debug, Clone)]
pub struct TunnelHandle {
    table: Arc<TunnelTable>,
}

impl TunnelHandle {
    /// Host and port of the device's relay endpoint
    pub fn connection_info(&self, serial: &DeviceSerial) -> Option<(String, u16)> {
        self.table.connection_info(serial)
    }

    /// Agent base URL through the device's tunnel, e.g. `http://127.0.0.1:50312/`
    pub fn base_url(&self, serial: &DeviceSerial) -> Option<String> {
        self.table
            .endpoints
            .get(serial)
            .map(|addr| format!("http://{}/", *addr))
    }

    pub fn is_tunnelled(&self, serial: &DeviceSerial) -> bool {
        self.table.endpoints.contains_key(serial)
    }
}
