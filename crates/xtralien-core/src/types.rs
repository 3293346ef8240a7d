/*!
 * Core data types for the Xtralien client.
 */
use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A unique identifier for client-side resources (devices, transports)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Id(String);

impl Id {
    /// Create a new ID with a random UUID
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Create an ID from a string
    pub fn from_string<S: AsRef<str>>(s: S) -> Self {
        Self(s.as_ref().to_string())
    }

    /// Get the string representation of the ID
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Default for Id {
    fn default() -> Self {
        Self::new()
    }
}

impl From<&str> for Id {
    fn from(s: &str) -> Self {
        Self::from_string(s)
    }
}

impl From<String> for Id {
    fn from(s: String) -> Self {
        Self::from_string(s)
    }
}

impl From<Uuid> for Id {
    fn from(uuid: Uuid) -> Self {
        Self::from_string(uuid.to_string())
    }
}

/// Where a transport is connected to
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Endpoint {
    /// A TCP socket
    Socket {
        /// Host name or IP address
        host: String,
        /// TCP port
        port: u16,
    },
    /// A serial (USB CDC or RS-232) port
    Serial {
        /// Port name, e.g. `/dev/ttyACM0` or `COM3`
        path: String,
    },
}

impl Endpoint {
    /// Create a socket endpoint
    pub fn socket<S: Into<String>>(host: S, port: u16) -> Self {
        Endpoint::Socket {
            host: host.into(),
            port,
        }
    }

    /// Create a serial endpoint
    pub fn serial<S: Into<String>>(path: S) -> Self {
        Endpoint::Serial { path: path.into() }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Socket { host, port } => write!(f, "<Socket {}:{} />", host, port),
            Endpoint::Serial { path } => write!(f, "<Serial/USB {} />", path),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_id_creation() {
        let id = Id::new();
        assert!(!id.as_str().is_empty());

        let id = Id::from_string("test-id");
        assert_eq!(id.as_str(), "test-id");

        let id: Id = "another-id".into();
        assert_eq!(id.as_str(), "another-id");

        let id: Id = String::from("string-id").into();
        assert_eq!(id.as_str(), "string-id");
    }

    #[test]
    fn test_ids_are_unique() {
        assert_ne!(Id::new(), Id::new());
    }

    #[test]
    fn test_endpoint_display() {
        assert_eq!(
            Endpoint::socket("192.168.1.20", 8888).to_string(),
            "<Socket 192.168.1.20:8888 />"
        );
        assert_eq!(
            Endpoint::serial("/dev/ttyACM0").to_string(),
            "<Serial/USB /dev/ttyACM0 />"
        );
    }
}
