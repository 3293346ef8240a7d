/*!
 * Xtralien Devices
 *
 * Client for Xtralien measurement instruments: transports, the command
 * dispatch pipeline, response formatting and network discovery.
 *
 * ```no_run
 * use xtralien_devices::{Device, Response};
 *
 * # async fn demo() -> xtralien_devices::Result<()> {
 * let device = Device::network("192.168.1.20").await?;
 * let reading = device.step("smu1").step("measure").send().await?;
 * if let Response::Array(values) = reading {
 *     println!("V = {}, I = {}", values[0], values[1]);
 * }
 * device.close().await?;
 * # Ok(())
 * # }
 * ```
 */

#![warn(missing_docs)]

// Re-export core types
pub use xtralien_core::prelude;

pub mod command;
pub mod device;
pub mod discovery;
pub mod error;
pub mod format;
pub mod pool;
pub mod serial_number;
#[cfg(any(test, feature = "testing"))]
pub mod testing;
pub mod transport;
pub mod transports;

pub use command::{CallOptions, CommandBuilder};
pub use device::{Device, DeviceBuilder};
pub use discovery::{discover, discover_addresses, discover_with_config, DiscoveryOptions};
pub use error::{DeviceError, Result};
pub use format::{Format, Response};
pub use pool::CommandHandle;
pub use serial_number::{SerialNumber, SerialNumberFields};
pub use transport::Transport;
pub use transports::SocketTransport;
#[cfg(feature = "serial")]
pub use transports::{available_ports, SerialTransport};

/// Xtralien devices crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Initialize the device layer
pub fn init() -> std::result::Result<(), xtralien_core::error::Error> {
    tracing::info!(
        version = VERSION,
        transports = ?available_transports(),
        "Xtralien Devices initialized"
    );
    Ok(())
}

/// Transport kinds compiled into this build
pub fn available_transports() -> Vec<&'static str> {
    let mut transports = vec!["socket"];

    #[cfg(feature = "serial")]
    transports.push("serial");

    transports
}
