/*!
 * Serial port transport.
 *
 * USB instruments enumerate as CDC virtual COM ports. The instrument
 * terminates every reply with a newline, so a read is one line.
 */
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::time::timeout;
use tokio_serial::{SerialPortBuilderExt, SerialStream};
use tracing::{debug, error, info, trace, warn};

use xtralien_core::config::TransportConfig;
use xtralien_core::types::Endpoint;

use crate::error::{DeviceError, Result};
use crate::transport::Transport;

/// Serial port parameters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SerialOptions {
    /// Baud rate; ignored by USB CDC devices
    pub baud_rate: u32,
    /// Deadline for reading one line
    pub timeout: Duration,
    /// Deadline for writing one command
    pub write_timeout: Duration,
}

impl Default for SerialOptions {
    fn default() -> Self {
        Self {
            baud_rate: 9600,
            timeout: Duration::from_secs(1),
            write_timeout: Duration::from_secs(1),
        }
    }
}

impl From<&TransportConfig> for SerialOptions {
    fn from(config: &TransportConfig) -> Self {
        Self {
            baud_rate: config.baud_rate,
            timeout: config.serial_timeout(),
            write_timeout: config.serial_write_timeout(),
        }
    }
}

/// Serial transport to a USB-connected instrument
#[derive(Debug)]
pub struct SerialTransport {
    /// The buffered port, `None` after `close()`
    port: Option<BufReader<SerialStream>>,
    /// Port path, for logging and display
    endpoint: Endpoint,
    /// Timeouts and line settings
    options: SerialOptions,
}

impl SerialTransport {
    /// Open a serial port with default options
    pub fn open(path: &str) -> Result<Self> {
        Self::open_with_options(path, SerialOptions::default())
    }

    /// Open a serial port with explicit options
    pub fn open_with_options(path: &str, options: SerialOptions) -> Result<Self> {
        debug!(
            port = %path,
            baud_rate = options.baud_rate,
            "Opening serial port"
        );

        let stream = tokio_serial::new(path, options.baud_rate)
            .timeout(options.timeout)
            .open_native_async()
            .map_err(|e| {
                error!(port = %path, error = %e, "Failed to open serial port");
                DeviceError::from(e)
            })?;

        info!(port = %path, "Serial port opened");

        Ok(Self {
            port: Some(BufReader::new(stream)),
            endpoint: Endpoint::serial(path),
            options,
        })
    }

    /// The options this port was opened with
    pub fn options(&self) -> &SerialOptions {
        &self.options
    }
}

#[async_trait]
impl Transport for SerialTransport {
    fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    fn is_open(&self) -> bool {
        self.port.is_some()
    }

    async fn write(&mut self, data: &[u8]) -> Result<()> {
        let write_timeout = self.options.write_timeout;
        let port = self.port.as_mut().ok_or(DeviceError::TransportClosed)?.get_mut();

        trace!(endpoint = %self.endpoint, bytes = data.len(), "Sending data");

        // Completes once the OS output buffer has drained.
        let send = async {
            port.write_all(data).await?;
            port.flush().await
        };

        match timeout(write_timeout, send).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => {
                error!(endpoint = %self.endpoint, error = %e, "Failed to send data");
                Err(DeviceError::Io(e))
            }
            Err(_) => Err(DeviceError::timeout(format!("writing to {}", self.endpoint))),
        }
    }

    async fn read(&mut self, wait: bool) -> Result<String> {
        let read_timeout = self.options.timeout;
        let port = self.port.as_mut().ok_or(DeviceError::TransportClosed)?;

        if !wait {
            return Ok(String::new());
        }

        let mut line = Vec::new();
        match timeout(read_timeout, port.read_until(b'\n', &mut line)).await {
            Ok(Ok(0)) => return Err(DeviceError::connection_lost("serial port closed")),
            Ok(Ok(_)) => {}
            Ok(Err(e)) => return Err(DeviceError::Io(e)),
            // Partial lines are returned as-is, like a timed-out readline.
            Err(_) => {
                debug!(endpoint = %self.endpoint, bytes = line.len(), "Line read timed out");
            }
        }

        trace!(endpoint = %self.endpoint, bytes = line.len(), "Received data");

        Ok(String::from_utf8(line)?)
    }

    async fn close(&mut self) -> Result<()> {
        let mut port = self.port.take().ok_or(DeviceError::TransportClosed)?;

        debug!(endpoint = %self.endpoint, "Closing serial port");
        if let Err(e) = port.get_mut().flush().await {
            warn!(
                endpoint = %self.endpoint,
                error = %e,
                "Failed to flush before closing (continuing anyway)"
            );
        }
        info!(endpoint = %self.endpoint, "Serial port closed");

        Ok(())
    }
}

/// List the serial ports present on this host, in enumeration order.
pub fn available_ports() -> Result<Vec<String>> {
    let ports = serialport::available_ports().map_err(|e| DeviceError::Serial(e.to_string()))?;
    Ok(ports.into_iter().map(|p| p.port_name).collect())
}

/// The conventional Windows name of COM port `n`
pub fn com_port_name(n: u32) -> String {
    format!("COM{}", n)
}
