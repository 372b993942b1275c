//! Multiplexed transport backed by libimobiledevice's `inetcat`
//!
//! Every device channel is an `inetcat` child process whose stdin and
//! stdout carry the raw byte stream to the device port.

use std::io;
use std::pin::Pin;
use std::process::Stdio;
use std::task::{ready, Context, Poll};

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};

use pf_core::idevice::{parse_device_list, run_tool};
use pf_core::traits::{MuxStream, MuxTransport};
use pf_core::{DeviceSerial, TunnelError};

const INETCAT: &str = "inetcat";

/// [`MuxTransport`] over `idevice_id` and `inetcat`
#[derive(Debug, Clone, Default)]
pub struct InetcatMux;

impl InetcatMux {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl MuxTransport for InetcatMux {
    async fn devices(&self) -> Result<Vec<DeviceSerial>, TunnelError> {
        let output = run_tool("idevice_id", &["--list"])
            .await
            .map_err(|e| TunnelError::Transport(e.to_string()))?;
        Ok(parse_device_list(&output))
    }

    async fn connect(
        &self,
        serial: &DeviceSerial,
        port: u16,
    ) -> Result<Box<dyn MuxStream>, TunnelError> {
        let port_arg = port.to_string();
        let mut command = Command::new(INETCAT);
        command.args(["--udid", serial.as_str(), port_arg.as_str()]);

        let stream = ChildStream::spawn(command).map_err(|e| TunnelError::Connect {
            serial: serial.to_string(),
            port,
            message: format!("failed to spawn {}: {}", INETCAT, e),
        })?;
        Ok(Box::new(stream))
    }
}

/// Byte stream over a child's stdio; the child is killed when dropped.
///
/// Shutting down the write half closes the child's stdin.
struct ChildStream {
    _child: Child,
    stdin: Option<ChildStdin>,
    stdout: ChildStdout,
}

impl ChildStream {
    fn spawn(mut command: Command) -> io::Result<Self> {
        let mut child = command
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()?;

        let stdin = child.stdin.take();
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "child stdout unavailable"))?;
        if stdin.is_none() {
            return Err(io::Error::new(io::ErrorKind::Other, "child stdin unavailable"));
        }

        Ok(Self {
            _child: child,
            stdin,
            stdout,
        })
    }
}

impl AsyncRead for ChildStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().stdout).poll_read(cx, buf)
    }
}

impl AsyncWrite for ChildStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut().stdin.as_mut() {
            Some(stdin) => Pin::new(stdin).poll_write(cx, buf),
            None => Poll::Ready(Err(io::ErrorKind::BrokenPipe.into())),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut().stdin.as_mut() {
            Some(stdin) => Pin::new(stdin).poll_flush(cx),
            None => Poll::Ready(Ok(())),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if let Some(stdin) = this.stdin.as_mut() {
            ready!(Pin::new(stdin).poll_flush(cx))?;
        }
        // dropping the pipe is what signals EOF to the child
        this.stdin = None;
        Poll::Ready(Ok(()))
    }
}
