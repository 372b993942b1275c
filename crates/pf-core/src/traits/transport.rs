//! Multiplexed device transport

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::error::TunnelError;
use crate::types::DeviceSerial;

/// Byte stream to a port on a device
pub trait MuxStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> MuxStream for T {}

/// Transport that reaches device ports by serial
#[async_trait]
pub trait MuxTransport: Send + Sync {
    /// Serials of the devices currently attached to the transport
    async fn devices(&self) -> Result<Vec<DeviceSerial>, TunnelError>;

    /// Open a channel to `port` on the device
    async fn connect(&self, serial: &DeviceSerial, port: u16)
        -> Result<Box<dyn MuxStream>, TunnelError>;
}
