/*!
 * Transport trait for instrument communication.
 *
 * A [`Transport`] is the byte stream a [`Device`](crate::Device) talks through.
 * Two implementations ship with the crate: [`SocketTransport`](crate::transports::SocketTransport)
 * for networked instruments and `SerialTransport` for USB/serial ones.
 * With the `testing` feature, `testing::MockTransport` stands in for hardware.
 */
use std::fmt::Debug;

use async_trait::async_trait;
use xtralien_core::types::Endpoint;

use crate::error::Result;

/// Asynchronous text transport to an instrument.
///
/// Transports are not shared between tasks; the owning device serializes
/// access. Once [`close`](Transport::close) has been called every other
/// operation fails with [`DeviceError::TransportClosed`](crate::DeviceError::TransportClosed).
#[async_trait]
pub trait Transport: Send + Sync + Debug {
    /// Where this transport is connected to
    fn endpoint(&self) -> &Endpoint;

    /// Whether the transport is still open
    fn is_open(&self) -> bool;

    /// Send raw bytes. No delimiter is appended.
    async fn write(&mut self, data: &[u8]) -> Result<()>;

    /// Send text, encoded as UTF-8
    async fn write_text(&mut self, text: &str) -> Result<()> {
        self.write(text.as_bytes()).await
    }

    /// Read a response.
    ///
    /// With `wait` set this blocks until data arrives. Without it, only data
    /// that is already available is returned (possibly an empty string).
    async fn read(&mut self, wait: bool) -> Result<String>;

    /// Release the underlying stream
    async fn close(&mut self) -> Result<()>;
}

