//! Per-device work loop
//!
//! One loop runs per attached device. It registers the device with the
//! backend, then claims and executes jobs strictly one at a time until the
//! device runs low on storage, the backend or device becomes unreachable,
//! or the loop is cancelled.

use std::fmt;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use pf_core::BackendError;
use pf_tunnel::TunnelHandle;

use crate::backend::register_device;
use crate::job::{JobContext, JobFactory};

/// Why a device loop ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoopExit {
    /// Stop was requested
    Cancelled,
    /// Free storage dropped below the configured floor
    LowStorage { free_bytes: u64 },
    /// The backend or the device could not be reached
    Unreachable(String),
    /// Device tooling or registration failed
    Failed(String),
}

impl fmt::Display for LoopExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoopExit::Cancelled => write!(f, "cancelled"),
            LoopExit::LowStorage { free_bytes } => {
                write!(f, "low storage ({} bytes free)", free_bytes)
            }
            LoopExit::Unreachable(reason) => write!(f, "unreachable: {}", reason),
            LoopExit::Failed(reason) => write!(f, "failed: {}", reason),
        }
    }
}

/// Claims and executes jobs for one device
pub struct DeviceLoop {
    ctx: JobContext,
    worker_id: String,
    tunnel: TunnelHandle,
}

impl DeviceLoop {
    pub fn new(ctx: JobContext, worker_id: impl Into<String>, tunnel: TunnelHandle) -> Self {
        Self {
            ctx,
            worker_id: worker_id.into(),
            tunnel,
        }
    }

    /// Run until the loop stops on its own or `cancel` fires
    pub async fn run(self, cancel: CancellationToken) -> LoopExit {
        let span = tracing::info_span!("device", serial = %self.ctx.device.serial());
        async {
            let exit = self.work(&cancel).await;
            tracing::info!("Device loop ended: {}", exit);
            exit
        }
        .instrument(span)
        .await
    }

    async fn work(&self, cancel: &CancellationToken) -> LoopExit {
        if let Err(exit) = self.register().await {
            return exit;
        }

        let config = &self.ctx.config;
        let serial = self.ctx.device.serial();

        loop {
            if cancel.is_cancelled() {
                return LoopExit::Cancelled;
            }

            match self.ctx.device.free_bytes().await {
                Ok(free_bytes) if free_bytes < config.install.min_free_bytes => {
                    tracing::warn!("Device storage is almost full ({} bytes free)", free_bytes);
                    return LoopExit::LowStorage { free_bytes };
                }
                Ok(_) => {}
                Err(e) => return LoopExit::Failed(e.to_string()),
            }

            if !self.tunnel.is_tunnelled(serial) {
                tracing::debug!("Waiting for tunnel");
                if !sleep_or_cancel(cancel, config.tunnel.idle_poll).await {
                    return LoopExit::Cancelled;
                }
                continue;
            }

            let claimed = match self.ctx.backend.claim_job(&self.worker_id, serial.as_str()).await {
                Ok(record) => record,
                Err(BackendError::Connectivity(e)) => return LoopExit::Unreachable(e.to_string()),
                Err(e) => {
                    tracing::warn!("Unable to claim a job: {}", e);
                    None
                }
            };

            match claimed.and_then(JobFactory::job_from_record) {
                Some(mut job) => match job.execute(&self.ctx).await {
                    Ok(_) => {}
                    Err(e) if e.is_connectivity() => return LoopExit::Unreachable(e.to_string()),
                    Err(e) => tracing::debug!("Continuing after failed job: {}", e),
                },
                None => {
                    tracing::trace!("No job available");
                    if !sleep_or_cancel(cancel, config.poll.job_poll).await {
                        return LoopExit::Cancelled;
                    }
                }
            }
        }
    }

    async fn register(&self) -> Result<(), LoopExit> {
        let device = &self.ctx.device;
        let registration = device
            .registration()
            .await
            .map_err(|e| LoopExit::Failed(e.to_string()))?;
        let accounts = device
            .accounts()
            .await
            .map_err(|e| LoopExit::Failed(e.to_string()))?;

        match register_device(self.ctx.backend.as_ref(), &registration, accounts).await {
            Ok(()) => Ok(()),
            Err(BackendError::Connectivity(e)) => Err(LoopExit::Unreachable(e.to_string())),
            Err(e) => Err(LoopExit::Failed(e.to_string())),
        }
    }
}

/// Sleep for `duration`; `false` if cancelled first
pub(crate) async fn sleep_or_cancel(cancel: &CancellationToken, duration: Duration) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(duration) => true,
    }
}
