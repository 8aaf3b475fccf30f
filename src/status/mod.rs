//! Device reachability checks
//!
//! The node probes every known device on an interval and records the result
//! through `Registry::set_status`, which only emits a delta on change.

use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpStream;

use crate::devices::{Device, DeviceId, DeviceStatus, WakeAddress};

/// Default probe cadence (20 seconds)
pub const DEFAULT_STATUS_INTERVAL: Duration = Duration::from_secs(20);

/// Ports tried when none are configured: SSH, SMB, RDP
pub const DEFAULT_PROBE_PORTS: [u16; 3] = [22, 445, 3389];

/// Decides whether a device is up
#[async_trait]
pub trait StatusProbe: Send + Sync {
    async fn probe(&self, address: &WakeAddress) -> DeviceStatus;
}

/// TCP connect probe
///
/// A device that accepts or actively refuses a connection on any port has a
/// live network stack and counts as online.
#[derive(Debug, Clone)]
pub struct TcpProbe {
    ports: Vec<u16>,
    timeout: Duration,
}

impl Default for TcpProbe {
    fn default() -> Self {
        Self::new(DEFAULT_PROBE_PORTS.to_vec(), Duration::from_millis(1500))
    }
}

impl TcpProbe {
    #[must_use]
    pub const fn new(ports: Vec<u16>, timeout: Duration) -> Self {
        Self { ports, timeout }
    }

    async fn try_port(&self, host: &str, port: u16) -> bool {
        match tokio::time::timeout(self.timeout, TcpStream::connect((host, port))).await {
            Ok(Ok(_)) => true,
            Ok(Err(e)) => e.kind() == std::io::ErrorKind::ConnectionRefused,
            Err(_) => false,
        }
    }
}

#[async_trait]
impl StatusProbe for TcpProbe {
    async fn probe(&self, address: &WakeAddress) -> DeviceStatus {
        let attempts = self.ports.iter().map(|port| self.try_port(&address.host, *port));
        let results = futures::future::join_all(attempts).await;
        if results.into_iter().any(|up| up) {
            DeviceStatus::Online
        } else {
            DeviceStatus::Offline
        }
    }
}

/// Probe every device concurrently
pub async fn check_all(probe: &dyn StatusProbe, devices: &[Device]) -> Vec<(DeviceId, DeviceStatus)> {
    let checks = devices.iter().map(|device| async move {
        let status = probe.probe(&device.address).await;
        tracing::trace!(device_id = %device.id, %status, "probed device");
        (device.id.clone(), status)
    });
    futures::future::join_all(checks).await
}
