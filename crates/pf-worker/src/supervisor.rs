//! Worker supervisor
//!
//! Keeps exactly one [`DeviceLoop`] task per attached device. Devices are
//! re-enumerated on a fixed interval: new devices get a fresh loop, loops
//! of vanished devices are stopped (cancelled, then aborted after the join
//! timeout). A loop that ended on its own is only restarted after its
//! device has disappeared and come back.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use pf_core::config::WorkerConfig;
use pf_core::traits::{DeviceTools, StoreLookup};
use pf_core::{BackendError, Device, DeviceSerial};
use pf_tunnel::TunnelHandle;

use crate::backend::Backend;
use crate::backoff::ExponentialBackoff;
use crate::device_loop::{sleep_or_cancel, DeviceLoop, LoopExit};
use crate::job::JobContext;
use crate::pilot::{Pilot, PilotClient, PilotEndpoint};

/// Builds the agent client for a device
pub type PilotFactory = Box<dyn Fn(&DeviceSerial) -> Arc<dyn Pilot> + Send + Sync>;

struct LoopHandle {
    task: JoinHandle<LoopExit>,
    cancel: CancellationToken,
}

/// Supervises the device loops of this worker
pub struct Supervisor {
    config: Arc<WorkerConfig>,
    tools: Arc<dyn DeviceTools>,
    backend: Arc<dyn Backend>,
    store: Arc<dyn StoreLookup>,
    tunnel: TunnelHandle,
    pilots: PilotFactory,
    loops: HashMap<DeviceSerial, LoopHandle>,
    /// Devices whose loop ended on its own while they stayed attached
    ended: HashSet<DeviceSerial>,
}

impl Supervisor {
    pub fn new(
        config: Arc<WorkerConfig>,
        tools: Arc<dyn DeviceTools>,
        backend: Arc<dyn Backend>,
        store: Arc<dyn StoreLookup>,
        tunnel: TunnelHandle,
    ) -> Self {
        let status_poll = config.poll.agent_status_poll;
        let handle = tunnel.clone();
        let pilots: PilotFactory = Box::new(move |serial: &DeviceSerial| -> Arc<dyn Pilot> {
            let endpoint = PilotEndpoint::Tunnel {
                handle: handle.clone(),
                serial: serial.clone(),
            };
            Arc::new(PilotClient::new(endpoint, status_poll))
        });

        Self {
            config,
            tools,
            backend,
            store,
            tunnel,
            pilots,
            loops: HashMap::new(),
            ended: HashSet::new(),
        }
    }

    /// Replace how agent clients are built
    pub fn with_pilot_factory(
        mut self,
        factory: impl Fn(&DeviceSerial) -> Arc<dyn Pilot> + Send + Sync + 'static,
    ) -> Self {
        self.pilots = Box::new(factory);
        self
    }

    /// Devices with a running loop
    pub fn active_devices(&self) -> Vec<DeviceSerial> {
        let mut serials: Vec<_> = self.loops.keys().cloned().collect();
        serials.sort();
        serials
    }

    /// Resolve the worker id, then supervise device loops until `cancel` fires
    pub async fn run(mut self, cancel: CancellationToken) -> Result<(), BackendError> {
        let Some(worker_id) = self.resolve_worker_id(&cancel).await? else {
            return Ok(());
        };
        tracing::info!("Running as worker {}", worker_id);

        loop {
            self.scan(&worker_id, &cancel).await;
            if !sleep_or_cancel(&cancel, self.config.poll.device_rescan).await {
                break;
            }
        }

        tracing::info!("Stopping {} device loop(s)", self.loops.len());
        self.stop_all().await;
        Ok(())
    }

    /// Look up (or create) this worker's backend id.
    ///
    /// Connectivity failures are retried with backoff; `None` if cancelled.
    pub async fn resolve_worker_id(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Option<String>, BackendError> {
        let name = self.config.worker_name();
        let mut backoff = ExponentialBackoff::from_config(&self.config.backoff);

        loop {
            match self.backend.worker_for_name(&name).await {
                Ok(id) => return Ok(Some(id)),
                Err(BackendError::Connectivity(e)) => {
                    let delay = backoff.next_delay();
                    tracing::warn!("Backend unreachable: {}. Retrying in {:?}", e, delay);
                    if !sleep_or_cancel(cancel, delay).await {
                        return Ok(None);
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn scan(&mut self, worker_id: &str, cancel: &CancellationToken) {
        let attached: HashSet<DeviceSerial> = match self.tools.list_devices().await {
            Ok(serials) => serials.into_iter().collect(),
            Err(e) => {
                tracing::warn!("Device enumeration failed: {}", e);
                return;
            }
        };

        self.reap_finished().await;

        let vanished: Vec<DeviceSerial> = self
            .loops
            .keys()
            .filter(|serial| !attached.contains(*serial))
            .cloned()
            .collect();
        let mut stopping = Vec::with_capacity(vanished.len());
        for serial in vanished {
            if let Some(handle) = self.loops.remove(&serial) {
                tracing::info!("Device {} disappeared", serial);
                stopping.push(self.stop_loop(serial, handle));
            }
        }
        futures::future::join_all(stopping).await;

        self.ended.retain(|serial| attached.contains(serial));

        for serial in attached {
            if !self.loops.contains_key(&serial) && !self.ended.contains(&serial) {
                self.start_loop(serial, worker_id, cancel);
            }
        }
    }

    async fn reap_finished(&mut self) {
        let finished: Vec<DeviceSerial> = self
            .loops
            .iter()
            .filter(|(_, handle)| handle.task.is_finished())
            .map(|(serial, _)| serial.clone())
            .collect();

        for serial in finished {
            let Some(handle) = self.loops.remove(&serial) else {
                continue;
            };
            match handle.task.await {
                Ok(exit) => tracing::info!("Device loop for {} finished: {}", serial, exit),
                Err(e) => tracing::error!("Device loop for {} panicked: {}", serial, e),
            }
            self.ended.insert(serial);
        }
    }

    fn start_loop(&mut self, serial: DeviceSerial, worker_id: &str, cancel: &CancellationToken) {
        tracing::info!("Starting device loop for {}", serial);

        let ctx = JobContext {
            backend: self.backend.clone(),
            device: Arc::new(Device::new(serial.clone(), self.tools.clone())),
            pilot: (self.pilots)(&serial),
            store: self.store.clone(),
            config: self.config.clone(),
        };
        let cancel = cancel.child_token();
        let device_loop = DeviceLoop::new(ctx, worker_id, self.tunnel.clone());
        let task = tokio::spawn(device_loop.run(cancel.clone()));

        self.loops.insert(serial, LoopHandle { task, cancel });
    }

    fn stop_loop(
        &self,
        serial: DeviceSerial,
        mut handle: LoopHandle,
    ) -> impl std::future::Future<Output = ()> + Send + 'static {
        let timeout = self.config.poll.loop_join_timeout;
        async move {
            handle.cancel.cancel();
            match tokio::time::timeout(timeout, &mut handle.task).await {
                Ok(Ok(exit)) => tracing::debug!("Device loop for {} stopped: {}", serial, exit),
                Ok(Err(e)) => tracing::warn!("Device loop for {} failed: {}", serial, e),
                Err(_) => {
                    tracing::warn!(
                        "Device loop for {} did not stop within {:?}, aborting",
                        serial,
                        timeout
                    );
                    handle.task.abort();
                }
            }
        }
    }

    async fn stop_all(&mut self) {
        let loops: Vec<_> = self.loops.drain().collect();
        let stopping: Vec<_> = loops
            .into_iter()
            .map(|(serial, handle)| self.stop_loop(serial, handle))
            .collect();
        futures::future::join_all(stopping).await;
        self.ended.clear();
    }
}
