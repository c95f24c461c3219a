use std::future::Future;

use log::debug;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

use crate::error::LinkError;

/// Byte-stream seam under the device link.
pub trait Transport: Send + Sync + 'static {
    type Stream: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    /// Human-readable target, for logs
    fn describe(&self) -> String;

    /// Fails with a non-retryable error when the adapter is missing or off.
    fn check_available(&self) -> Result<(), LinkError>;

    fn open(&self) -> impl Future<Output = Result<Self::Stream, LinkError>> + Send;
}

/// Device exposed as a TCP byte stream (Wi-Fi module or serial bridge)
#[derive(Debug, Clone)]
pub struct TcpTransport {
    addr: String,
}

impl TcpTransport {
    pub fn new(addr: impl Into<String>) -> Self {
        Self { addr: addr.into() }
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }
}

impl Transport for TcpTransport {
    type Stream = TcpStream;

    fn describe(&self) -> String {
        format!("tcp://{}", self.addr)
    }

    fn check_available(&self) -> Result<(), LinkError> {
        if self.addr.trim().is_empty() {
            return Err(LinkError::DeviceNotFound("no device address configured".to_string()));
        }
        if !self.addr.contains(':') {
            return Err(LinkError::DeviceNotFound(format!(
                "device address {:?} has no port",
                self.addr
            )));
        }
        Ok(())
    }

    async fn open(&self) -> Result<TcpStream, LinkError> {
        let stream = TcpStream::connect(&self.addr)
            .await
            .map_err(|e| LinkError::from_io(&e))?;
        if let Err(e) = stream.set_nodelay(true) {
            debug!("[link] set_nodelay failed: {}", e);
        }
        Ok(stream)
    }
}
