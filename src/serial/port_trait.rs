//! Trait abstraction for serial port operations to enable testing

use async_trait::async_trait;
use std::io;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

/// Trait for serial port I/O operations
#[async_trait]
pub trait SerialPortIO: Send {
    /// Write all data to the port
    async fn write_all(&mut self, data: &[u8]) -> io::Result<()>;

    /// Flush the output buffer
    async fn flush(&mut self) -> io::Result<()>;
}

/// Any bidirectional byte stream a link can be built on
///
/// Implemented by `tokio_serial::SerialStream` in production and by
/// `tokio::io::DuplexStream` in tests.
pub trait SerialStreamIO: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> SerialStreamIO for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

/// Write half of a stream, exposed through [`SerialPortIO`]
pub struct StreamWriter<W> {
    inner: W,
}

impl<W> StreamWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl<W> SerialPortIO for StreamWriter<W>
where
    W: AsyncWrite + Send + Unpin,
{
    async fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        self.inner.write_all(data).await
    }

    async fn flush(&mut self) -> io::Result<()> {
        self.inner.flush().await
    }
}
