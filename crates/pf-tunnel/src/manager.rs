//! Device tunnel manager
//!
//! Polls the multiplexed transport for attached devices and keeps exactly
//! one relay per enumerated device. Newly enumerated devices get a relay
//! and a table entry; departed devices have their relay stopped (grace
//! period, then abort) and their entry removed.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use pf_core::config::TunnelConfig;
use pf_core::traits::MuxTransport;
use pf_core::{DeviceSerial, TunnelError};

use crate::relay::RelayService;
use crate::table::{TunnelHandle, TunnelTable};

/// Running relay owned by the manager
struct RelayTask {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Owns every device relay and the device to endpoint table
pub struct TunnelManager {
    mux: Arc<dyn MuxTransport>,
    config: TunnelConfig,
    table: Arc<TunnelTable>,
    relays: HashMap<DeviceSerial, RelayTask>,
}

impl TunnelManager {
    pub fn new(mux: Arc<dyn MuxTransport>, config: TunnelConfig) -> Self {
        Self {
            mux,
            config,
            table: Arc::new(TunnelTable::new()),
            relays: HashMap::new(),
        }
    }

    /// Read handle on the endpoint table
    pub fn handle(&self) -> TunnelHandle {
        self.table.handle()
    }

    /// Number of running relays
    pub fn relay_count(&self) -> usize {
        self.relays.len()
    }

    /// Run discovery until cancelled, then stop every relay
    pub async fn run(mut self, cancel: CancellationToken) {
        tracing::info!(
            "Tunnel manager started (agent port {}, bind host {})",
            self.config.agent_port,
            self.config.bind_host
        );

        loop {
            if let Err(e) = self.sync().await {
                tracing::debug!("Device discovery failed: {}", e);
            }

            let interval = if self.relays.is_empty() {
                self.config.idle_poll
            } else {
                self.config.active_poll
            };

            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = cancel.cancelled() => break,
            }
        }

        tracing::info!("Tunnel manager shutting down");
        self.stop_all().await;
    }

    /// One discovery pass: start relays for new devices, stop departed ones
    pub async fn sync(&mut self) -> Result<(), TunnelError> {
        let attached: BTreeSet<DeviceSerial> = self.mux.devices().await?.into_iter().collect();

        // relays that died on their own are restarted below
        let dead: Vec<DeviceSerial> = self
            .relays
            .iter()
            .filter(|(_, relay)| relay.handle.is_finished())
            .map(|(serial, _)| serial.clone())
            .collect();
        for serial in dead {
            tracing::warn!("Relay for {} exited unexpectedly", serial);
            self.stop_relay(&serial).await;
        }

        let departed: Vec<DeviceSerial> = self
            .relays
            .keys()
            .filter(|serial| !attached.contains(*serial))
            .cloned()
            .collect();
        for serial in departed {
            tracing::info!("Device {} detached", serial);
            self.stop_relay(&serial).await;
        }

        for serial in attached {
            if self.relays.contains_key(&serial) {
                continue;
            }
            if let Err(e) = self.start_relay(serial.clone()).await {
                tracing::error!("Failed to start relay for {}: {}", serial, e);
            }
        }

        Ok(())
    }

    async fn start_relay(&mut self, serial: DeviceSerial) -> Result<(), TunnelError> {
        let relay = RelayService::bind(
            &self.config.bind_host,
            serial.clone(),
            Arc::clone(&self.mux),
            self.config.agent_port,
        )
        .await?;
        let addr = relay.local_addr()?;

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(relay.run(cancel.clone()));

        self.table.insert(serial.clone(), addr);
        tracing::info!("Device {} attached, agent reachable at {}", serial, addr);
        self.relays.insert(serial, RelayTask { cancel, handle });
        Ok(())
    }

    async fn stop_relay(&mut self, serial: &DeviceSerial) {
        self.table.remove(serial);

        let Some(RelayTask { cancel, mut handle }) = self.relays.remove(serial) else {
            return;
        };

        cancel.cancel();
        if tokio::time::timeout(self.config.relay_grace, &mut handle)
            .await
            .is_err()
        {
            tracing::warn!("Relay for {} did not stop within {:?}, aborting", serial, self.config.relay_grace);
            handle.abort();
        }
    }

    async fn stop_all(&mut self) {
        let serials: Vec<DeviceSerial> = self.relays.keys().cloned().collect();
        for serial in serials {
            self.stop_relay(&serial).await;
        }
        self.table.clear();
    }
}
