//! Relay service for a single device
//!
//! Accepts local TCP connections and pumps each one to the agent port on
//! the device. A connection whose device channel cannot be opened is closed
//! on its own; the listener and every other connection keep running.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use pf_core::traits::MuxTransport;
use pf_core::{DeviceSerial, TunnelError};

const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Local listener bridging to one device's agent
pub struct RelayService {
    serial: DeviceSerial,
    mux: Arc<dyn MuxTransport>,
    device_port: u16,
    listener: TcpListener,
}

impl RelayService {
    /// Bind a listener on an ephemeral port of `bind_host`
    pub async fn bind(
        bind_host: &str,
        serial: DeviceSerial,
        mux: Arc<dyn MuxTransport>,
        device_port: u16,
    ) -> Result<Self, TunnelError> {
        let listener = TcpListener::bind((bind_host, 0))
            .await
            .map_err(TunnelError::Bind)?;

        Ok(Self {
            serial,
            mux,
            device_port,
            listener,
        })
    }

    /// Address clients connect to
    pub fn local_addr(&self) -> Result<SocketAddr, TunnelError> {
        self.listener.local_addr().map_err(TunnelError::Bind)
    }

    /// Accept and relay connections until cancelled.
    ///
    /// In-flight connections are dropped when this returns.
    pub async fn run(self, cancel: CancellationToken) {
        let mut connections = JoinSet::new();

        tracing::debug!(
            "Relay for {} listening on {:?}",
            self.serial,
            self.listener.local_addr()
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::debug!("Relay for {} stopping", self.serial);
                    break;
                }
                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((stream, peer_addr)) => {
                            let serial = self.serial.clone();
                            let mux = Arc::clone(&self.mux);
                            let port = self.device_port;
                            connections.spawn(async move {
                                match relay_connection(stream, &serial, mux.as_ref(), port).await {
                                    Ok((sent, received)) => tracing::trace!(
                                        "Relay {} <-> {} closed ({} bytes out, {} bytes in)",
                                        peer_addr, serial, sent, received
                                    ),
                                    Err(e) => tracing::warn!("Relay connection from {} failed: {}", peer_addr, e),
                                }
                            });
                        }
                        Err(e) => {
                            tracing::error!("Failed to accept relay connection for {}: {}", self.serial, e);
                            // errors such as EMFILE persist until a connection closes
                            tokio::select! {
                                _ = cancel.cancelled() => break,
                                _ = tokio::time::sleep(ACCEPT_ERROR_BACKOFF) => {}
                            }
                        }
                    }
                }
                Some(_) = connections.join_next(), if !connections.is_empty() => {}
            }
        }
    }
}

/// Pump one inbound connection to the device port until either side closes
async fn relay_connection(
    mut inbound: TcpStream,
    serial: &DeviceSerial,
    mux: &dyn MuxTransport,
    port: u16,
) -> Result<(u64, u64), TunnelError> {
    let mut outbound = mux.connect(serial, port).await?;

    tokio::io::copy_bidirectional(&mut inbound, &mut outbound)
        .await
        .map_err(|e| TunnelError::Connect {
            serial: serial.to_string(),
            port,
            message: e.to_string(),
        })
}
