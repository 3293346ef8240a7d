/*!
 * Network discovery of instruments.
 *
 * A 4-byte `xtra` probe is broadcast to UDP port 8889 and every instrument on
 * the broadcast domain answers with a datagram of its own. Replies are
 * collected until the network has been quiet for one timeout period, so a
 * burst of late answers is not cut off.
 */
use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

use futures::future::join_all;
use tokio::net::UdpSocket;
use tokio::time::timeout;
use tracing::{debug, info, trace, warn, Instrument};

use xtralien_core::config::{Config, SharedConfig};
use xtralien_core::logging::operation_span;
use xtralien_core::utils::duration_to_millis;

use crate::device::Device;
use crate::error::Result;

/// The probe datagram
pub const PROBE: &[u8; 4] = b"xtra";

/// Discovery options
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveryOptions {
    /// Where the probe is sent
    pub broadcast_address: String,
    /// UDP port instruments listen for probes on
    pub probe_port: u16,
    /// TCP port discovered instruments are connected on
    pub control_port: u16,
    /// Quiet period that ends discovery; restarts after every reply
    pub timeout: Duration,
}

impl Default for DiscoveryOptions {
    fn default() -> Self {
        Self::from(&Config::default())
    }
}

impl From<&Config> for DiscoveryOptions {
    fn from(config: &Config) -> Self {
        Self {
            broadcast_address: config.discovery.broadcast_address.clone(),
            probe_port: config.discovery.probe_port,
            control_port: config.transport.network_port,
            timeout: config.discovery.timeout(),
        }
    }
}

impl DiscoveryOptions {
    /// Send the probe somewhere other than the configured broadcast address
    pub fn with_broadcast_address<S: Into<String>>(mut self, address: S) -> Self {
        self.broadcast_address = address.into();
        self
    }

    /// Use a different quiet period
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Probe the network and return the address of every instrument that answered,
/// in order of first reply. No replies is not an error.
pub async fn discover_addresses(options: &DiscoveryOptions) -> Result<Vec<IpAddr>> {
    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).await?;
    socket.set_broadcast(true)?;

    debug!(
        address = %options.broadcast_address,
        port = options.probe_port,
        timeout_ms = duration_to_millis(options.timeout),
        "Sending discovery probe"
    );
    socket
        .send_to(PROBE, (options.broadcast_address.as_str(), options.probe_port))
        .await?;

    let mut found = Vec::new();
    let mut buf = [0u8; 64];
    loop {
        match timeout(options.timeout, socket.recv_from(&mut buf)).await {
            Ok(Ok((len, from))) => {
                trace!(from = %from, bytes = len, "Discovery reply");
                let ip = from.ip();
                if !found.contains(&ip) {
                    info!(address = %ip, "Discovered instrument");
                    found.push(ip);
                }
            }
            Ok(Err(e)) => return Err(e.into()),
            Err(_) => {
                debug!(found = found.len(), "Discovery window elapsed");
                break;
            }
        }
    }

    Ok(found)
}

/// Probe the network and connect to every instrument that answered.
///
/// Connections are opened concurrently and share one copy of `config`; the
/// result keeps reply order.
/// Instruments that answer the probe but refuse the control connection are
/// logged and left out.
pub async fn discover(options: &DiscoveryOptions, config: &Config) -> Result<Vec<Device>> {
    async move {
        let addresses = discover_addresses(options).await?;
        let shared = SharedConfig::from(config);

        let connects = addresses.iter().map(|address| {
            let shared = shared.clone();
            async move {
                let host = address.to_string();
                Device::open(Some(&host), Some(options.control_port), shared)
                    .await
                    .map_err(|e| warn!(address = %host, error = %e, "Failed to connect to discovered instrument"))
                    .ok()
            }
        });
        let devices: Vec<Device> = join_all(connects).await.into_iter().flatten().collect();

        Ok(devices)
    }
    .instrument(operation_span("discover", "discovery"))
    .await
}

/// [`discover`] with options taken from `config`
pub async fn discover_with_config(config: &Config) -> Result<Vec<Device>> {
    discover(&DiscoveryOptions::from(config), config).await
}

impl Device {
    /// Find instruments on the network. See [`discover`].
    pub async fn discover(options: &DiscoveryOptions) -> Result<Vec<Device>> {
        discover(options, &Config::default()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;
    use tokio::net::TcpListener;
    use xtralien_core::types::Endpoint;

    /// A UDP responder answering the first probe `replies` times
    async fn responder(replies: usize) -> (u16, tokio::task::JoinHandle<()>) {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = socket.local_addr().unwrap().port();
        let task = tokio::spawn(async move {
            let mut buf = [0u8; 16];
            let (len, from) = socket.recv_from(&mut buf).await.unwrap();
            assert_eq!(&buf[..len], PROBE);
            for _ in 0..replies {
                socket.send_to(b"here", from).await.unwrap();
            }
        });
        (port, task)
    }

    fn loopback(probe_port: u16, control_port: u16, window: Duration) -> DiscoveryOptions {
        DiscoveryOptions {
            broadcast_address: "127.0.0.1".to_string(),
            probe_port,
            control_port,
            timeout: window,
        }
    }

    #[test_log::test(tokio::test)]
    async fn test_single_reply_yields_one_device_after_window() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let control_port = listener.local_addr().unwrap().port();
        let server = tokio::spawn(async move {
            let (_stream, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_millis(100)).await;
        });
        let (probe_port, probe) = responder(1).await;

        let window = Duration::from_millis(150);
        let started = Instant::now();
        let devices = discover(&loopback(probe_port, control_port, window), &Config::default())
            .await
            .unwrap();

        assert!(started.elapsed() >= window);
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].endpoint(), Some(Endpoint::socket("127.0.0.1", control_port)));

        probe.await.unwrap();
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_duplicate_replies_are_collapsed() {
        let (probe_port, probe) = responder(3).await;
        let addresses = discover_addresses(&loopback(probe_port, 0, Duration::from_millis(100)))
            .await
            .unwrap();
        assert_eq!(addresses, vec![IpAddr::V4(Ipv4Addr::LOCALHOST)]);
        probe.await.unwrap();
    }

    #[tokio::test]
    async fn test_silence_is_an_empty_result() {
        let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let probe_port = silent.local_addr().unwrap().port();

        let window = Duration::from_millis(50);
        let started = Instant::now();
        let addresses = discover_addresses(&loopback(probe_port, 0, window)).await.unwrap();
        assert!(addresses.is_empty());
        assert!(started.elapsed() >= window);
    }

    #[tokio::test]
    async fn test_unreachable_control_port_is_skipped() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let control_port = listener.local_addr().unwrap().port();
        drop(listener);
        let (probe_port, probe) = responder(1).await;

        let devices = discover(
            &loopback(probe_port, control_port, Duration::from_millis(50)),
            &Config::default(),
        )
        .await
        .unwrap();
        assert!(devices.is_empty());
        probe.await.unwrap();
    }

    #[test]
    fn test_options_from_config() {
        let options = DiscoveryOptions::default();
        assert_eq!(options.broadcast_address, "255.255.255.255");
        assert_eq!(options.probe_port, 8889);
        assert_eq!(options.control_port, 8888);
        assert_eq!(options.timeout, Duration::from_millis(100));

        let options = options
            .with_broadcast_address("192.168.1.255")
            .with_timeout(Duration::from_secs(1));
        assert_eq!(options.broadcast_address, "192.168.1.255");
        assert_eq!(options.timeout, Duration::from_secs(1));
    }
}
