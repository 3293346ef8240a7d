/*!
 * Transport implementations.
 *
 * This module contains the implementations of the `Transport` trait
 * for the links an instrument can be reached over.
 */

pub mod socket;

#[cfg(feature = "serial")]
pub mod serial;

pub use socket::SocketTransport;

#[cfg(feature = "serial")]
pub use serial::{available_ports, com_port_name, SerialOptions, SerialTransport};
