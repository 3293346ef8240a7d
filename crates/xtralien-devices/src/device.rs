/*!
 * The instrument handle and its dispatch pipeline.
 *
 * A [`Device`] owns one active transport, optionally a list of standby
 * transports, and a worker pool for asynchronous commands. Every command,
 * synchronous or not, holds the device lock for its whole write and read
 * cycle, so replies can never be attributed to the wrong request.
 */
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, error, info, warn, Instrument};

use xtralien_core::config::{Config, DispatchConfig, SharedConfig};
use xtralien_core::logging::{component_span, Span};
use xtralien_core::types::{Endpoint, Id};

use crate::command::{join_tokens, CallOptions, CommandBuilder};
use crate::error::{DeviceError, Result};
use crate::format::Response;
use crate::pool::{Callback, CommandHandle, WorkerPool};
use crate::transport::Transport;
use crate::transports::SocketTransport;
#[cfg(feature = "serial")]
use crate::transports::{available_ports, com_port_name, SerialOptions, SerialTransport};

/// The transports a device holds. Guarded by the device lock.
#[derive(Debug, Default)]
struct Transports {
    active: Option<Box<dyn Transport>>,
    standby: Vec<Box<dyn Transport>>,
}

impl Transports {
    fn count(&self) -> usize {
        usize::from(self.active.is_some()) + self.standby.len()
    }
}

struct Inner {
    id: Id,
    span: Span,
    transports: Mutex<Transports>,
    /// Snapshot of the active endpoint, readable without the device lock
    endpoint: RwLock<Option<Endpoint>>,
    /// Set while a command holds the device lock
    in_flight: AtomicBool,
    pool: WorkerPool,
    config: SharedConfig,
}

impl Inner {
    fn set_endpoint(&self, endpoint: Option<Endpoint>) {
        match self.endpoint.write() {
            Ok(mut guard) => *guard = endpoint,
            Err(poisoned) => *poisoned.into_inner() = endpoint,
        }
    }

    fn endpoint(&self) -> Option<Endpoint> {
        match self.endpoint.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

/// Marks a command as in flight until dropped
struct InFlight<'a>(&'a AtomicBool);

impl<'a> InFlight<'a> {
    fn enter(flag: &'a AtomicBool) -> Self {
        flag.store(true, Ordering::Release);
        Self(flag)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.pool.close();
    }
}

/// Builder for [`Device`]
pub struct DeviceBuilder {
    id: Option<Id>,
    span: Option<Span>,
    config: SharedConfig,
    transports: Vec<Box<dyn Transport>>,
}

impl DeviceBuilder {
    /// Start with the default configuration and no transport
    pub fn new() -> Self {
        Self {
            id: None,
            span: None,
            config: SharedConfig::default(),
            transports: Vec::new(),
        }
    }

    /// Use a fixed device id
    pub fn id<I: Into<Id>>(mut self, id: I) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Log everything this device does inside `span`
    pub fn span(mut self, span: Span) -> Self {
        self.span = Some(span);
        self
    }

    /// Share a configuration with the device
    pub fn config<C: Into<SharedConfig>>(mut self, config: C) -> Self {
        self.config = config.into();
        self
    }

    /// Override the dispatch settings of the current configuration
    pub fn dispatch(mut self, dispatch: DispatchConfig) -> Self {
        let mut config = self.config.get().clone();
        config.dispatch = dispatch;
        self.config = config.into();
        self
    }

    /// Add a transport. The first one added becomes active.
    pub fn transport<T: Transport + 'static>(mut self, transport: T) -> Self {
        self.transports.push(Box::new(transport));
        self
    }

    /// Create the device
    pub fn build(self) -> Device {
        let id = self.id.unwrap_or_default();
        let span = self
            .span
            .unwrap_or_else(|| component_span("device", Some(id.as_str())));

        let mut transports = self.transports.into_iter();
        let active = transports.next();
        let endpoint = active.as_ref().map(|t| t.endpoint().clone());

        Device {
            inner: Arc::new(Inner {
                id,
                span,
                transports: Mutex::new(Transports {
                    active,
                    standby: transports.collect(),
                }),
                endpoint: RwLock::new(endpoint),
                in_flight: AtomicBool::new(false),
                pool: WorkerPool::new(self.config.get().dispatch.max_concurrent_tasks),
                config: self.config,
            }),
        }
    }
}

impl Default for DeviceBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Handle to one instrument.
///
/// Cloning is cheap and every clone talks to the same transport.
#[derive(Clone)]
pub struct Device {
    inner: Arc<Inner>,
}

impl Device {
    /// Start building a device
    pub fn builder() -> DeviceBuilder {
        DeviceBuilder::new()
    }

    /// Connect with default settings.
    ///
    /// With a port this opens a TCP connection to `address:port`; with only an
    /// address, `address` names a serial port. With neither the device starts
    /// without a transport.
    pub async fn new(address: Option<&str>, port: Option<u16>) -> Result<Self> {
        Self::open(address, port, &Config::default()).await
    }

    /// Connect using the settings in `config`. See [`Device::new`].
    ///
    /// The device keeps a handle to `config`; pass a [`SharedConfig`] to
    /// share one configuration between devices.
    pub async fn open<C: Into<SharedConfig>>(
        address: Option<&str>,
        port: Option<u16>,
        config: C,
    ) -> Result<Self> {
        let config = config.into();
        let builder = Self::builder().config(config.clone());
        let builder = match (address, port) {
            (Some(host), Some(port)) => builder.transport(
                SocketTransport::connect_with_config(host, port, &config.get().transport).await?,
            ),
            (Some(path), None) => with_serial(builder, path, config.get())?,
            _ => builder,
        };
        Ok(builder.build())
    }

    /// Connect to a networked instrument on the control port
    pub async fn network(ip: &str) -> Result<Self> {
        Self::network_with_config(ip, &Config::default()).await
    }

    /// Connect to a networked instrument using the settings in `config`
    pub async fn network_with_config(ip: &str, config: &Config) -> Result<Self> {
        Self::open(Some(ip), Some(config.transport.network_port), config).await
    }

    /// Open a USB instrument, or the first serial port on the host if `port` is `None`
    #[cfg(feature = "serial")]
    pub async fn usb(port: Option<&str>) -> Result<Self> {
        Self::usb_with_config(port, &Config::default()).await
    }

    /// Open a USB instrument using the settings in `config`
    #[cfg(feature = "serial")]
    pub async fn usb_with_config(port: Option<&str>, config: &Config) -> Result<Self> {
        let path = match port {
            Some(path) => path.to_string(),
            None => available_ports()?
                .into_iter()
                .next()
                .ok_or_else(|| DeviceError::NotFound("no serial ports available".to_string()))?,
        };
        Self::open(Some(&path), None, config).await
    }

    /// Open the instrument on Windows port `COM{n}`
    #[cfg(feature = "serial")]
    pub async fn com(n: u32) -> Result<Self> {
        Self::com_with_config(n, &Config::default()).await
    }

    /// Open `COM{n}` using the settings in `config`
    #[cfg(feature = "serial")]
    pub async fn com_with_config(n: u32, config: &Config) -> Result<Self> {
        Self::usb_with_config(Some(&com_port_name(n)), config).await
    }

    /// Make one attempt at finding an instrument.
    ///
    /// A serial port is preferred; if none is present or it fails to open, the
    /// network is searched with a discovery broadcast. Fails with
    /// [`DeviceError::NotFound`] if neither turns anything up.
    pub async fn try_first(config: &Config) -> Result<Self> {
        if let Some(device) = first_serial(config).await {
            return Ok(device);
        }

        crate::discovery::discover_with_config(config)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| DeviceError::NotFound("no instrument found".to_string()))
    }

    /// Wait until an instrument can be found, polling every
    /// `discovery.retry_interval_ms`. See [`Device::try_first`].
    pub async fn first(config: &Config) -> Result<Self> {
        loop {
            match Self::try_first(config).await {
                Err(DeviceError::NotFound(reason)) => {
                    debug!(reason = %reason, "No instrument yet, retrying");
                    tokio::time::sleep(config.discovery.retry_interval()).await;
                }
                result => return result,
            }
        }
    }

    /// This device's id
    pub fn id(&self) -> &Id {
        &self.inner.id
    }

    /// The span this device logs in
    pub fn span(&self) -> &Span {
        &self.inner.span
    }

    /// The configuration this device was opened with
    pub fn config(&self) -> &SharedConfig {
        &self.inner.config
    }

    /// Dispatch settings in effect
    pub fn dispatch_config(&self) -> &DispatchConfig {
        &self.inner.config.get().dispatch
    }

    /// Whether a command currently holds the device lock. Transport queries
    /// such as [`Device::transport_count`] do not count.
    pub fn in_progress(&self) -> bool {
        self.inner.in_flight.load(Ordering::Acquire)
    }

    /// Where the active transport is connected, if there is one
    pub fn endpoint(&self) -> Option<Endpoint> {
        self.inner.endpoint()
    }

    /// Number of transports held, active and standby
    pub async fn transport_count(&self) -> usize {
        self.inner.transports.lock().await.count()
    }

    /// Whether the device has an active transport
    pub async fn is_connected(&self) -> bool {
        self.inner.transports.lock().await.active.is_some()
    }

    /// Add a transport. It becomes active if there is none, otherwise it is
    /// kept on standby for [`Device::failover`].
    pub async fn add_transport<T: Transport + 'static>(&self, transport: T) {
        let mut transports = self.inner.transports.lock().await;
        let endpoint = transport.endpoint().clone();
        if transports.active.is_none() {
            info!(parent: &self.inner.span, endpoint = %endpoint, "Transport activated");
            transports.active = Some(Box::new(transport));
            self.inner.set_endpoint(Some(endpoint));
        } else {
            debug!(parent: &self.inner.span, endpoint = %endpoint, "Transport added to standby");
            transports.standby.push(Box::new(transport));
        }
    }

    /// Close the active transport, if any, and make `transport` active
    pub async fn replace_transport<T: Transport + 'static>(&self, transport: T) {
        let mut transports = self.inner.transports.lock().await;
        if let Some(old) = transports.active.take() {
            self.close_transport(old).await;
        }
        let endpoint = transport.endpoint().clone();
        info!(parent: &self.inner.span, endpoint = %endpoint, "Transport replaced");
        transports.active = Some(Box::new(transport));
        self.inner.set_endpoint(Some(endpoint));
    }

    /// Close the active transport, if any, and promote the first standby.
    ///
    /// Returns the new active endpoint, or [`DeviceError::NoTransport`] when
    /// there was nothing on standby.
    pub async fn failover(&self) -> Result<Endpoint> {
        let mut transports = self.inner.transports.lock().await;
        if let Some(old) = transports.active.take() {
            self.close_transport(old).await;
        }
        if transports.standby.is_empty() {
            self.inner.set_endpoint(None);
            warn!(parent: &self.inner.span, "Failover requested with no standby transport");
            return Err(DeviceError::NoTransport);
        }

        let next = transports.standby.remove(0);
        let endpoint = next.endpoint().clone();
        info!(parent: &self.inner.span, endpoint = %endpoint, "Failed over to standby transport");
        transports.active = Some(next);
        self.inner.set_endpoint(Some(endpoint.clone()));
        Ok(endpoint)
    }

    /// Start a command with no tokens
    pub fn command(&self) -> CommandBuilder {
        CommandBuilder::new(self.clone())
    }

    /// Start a command with its first token
    pub fn step<T: fmt::Display>(&self, token: T) -> CommandBuilder {
        self.command().step(token)
    }

    /// Send `tokens`, joined with spaces, and format the reply
    pub async fn call<I>(&self, tokens: I, options: CallOptions) -> Result<Response>
    where
        I: IntoIterator,
        I::Item: fmt::Display,
    {
        self.dispatch(join_tokens(tokens), options).await
    }

    /// Run [`Device::call`] on the worker pool.
    ///
    /// Must be called from within a tokio runtime.
    pub fn call_async<I>(&self, tokens: I, options: CallOptions) -> CommandHandle
    where
        I: IntoIterator,
        I::Item: fmt::Display,
    {
        self.submit(join_tokens(tokens), options, None)
    }

    /// Run [`Device::call`] on the worker pool and hand the result to `callback`.
    ///
    /// The callback runs on the pool task, after the device lock has been
    /// released and before the returned handle resolves. On a multi-threaded
    /// runtime that is a runtime worker thread, never the thread that submitted
    /// the command. It may submit further commands but must not block on them.
    pub fn call_with_callback<I, F>(&self, tokens: I, options: CallOptions, callback: F) -> CommandHandle
    where
        I: IntoIterator,
        I::Item: fmt::Display,
        F: FnOnce(std::result::Result<&Response, &DeviceError>) + Send + 'static,
    {
        self.submit(join_tokens(tokens), options, Some(Box::new(callback)))
    }

    pub(crate) fn submit(
        &self,
        command: String,
        options: CallOptions,
        callback: Option<Callback>,
    ) -> CommandHandle {
        let device = self.clone();
        self.inner.pool.spawn(async move {
            let result = device.dispatch(command, options).await;
            if let Some(callback) = callback {
                if catch_unwind(AssertUnwindSafe(|| callback(result.as_ref()))).is_err() {
                    error!(parent: &device.inner.span, "Command callback panicked");
                }
            }
            result
        })
    }

    /// Send one command and read its reply under the device lock
    pub(crate) async fn dispatch(&self, command: String, options: CallOptions) -> Result<Response> {
        let span = self.inner.span.clone();
        async move {
            let mut transports = self.inner.transports.lock().await;
            let in_flight = InFlight::enter(&self.inner.in_flight);
            let raw = self.exchange(&mut transports, &command, &options).await?;
            drop(in_flight);
            drop(transports);

            if options.response {
                options.format.apply(&raw)
            } else {
                Ok(Response::None)
            }
        }
        .instrument(span)
        .await
    }

    async fn exchange(
        &self,
        transports: &mut MutexGuard<'_, Transports>,
        command: &str,
        options: &CallOptions,
    ) -> Result<String> {
        let transport = match transports.active.as_mut() {
            Some(transport) => transport,
            None => {
                error!(command = %command, "Cannot send command, no transport available");
                return Err(DeviceError::NoTransport);
            }
        };

        let delay = options.delay.unwrap_or_else(|| self.dispatch_config().pre_send_delay());
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        debug!(endpoint = %transport.endpoint(), command = %command, "Sending command");
        let result = write_then_read(&mut **transport, command, options.response).await;

        match result {
            Err(e) if e.is_connection_error() => {
                error!(command = %command, error = %e, "Transport failed, discarding it");
                if let Some(failed) = transports.active.take() {
                    self.close_transport(failed).await;
                }
                self.inner.set_endpoint(None);
                Err(e)
            }
            other => other,
        }
    }

    async fn close_transport(&self, mut transport: Box<dyn Transport>) {
        let endpoint = transport.endpoint().clone();
        if !transport.is_open() {
            return;
        }
        if let Err(e) = transport.close().await {
            warn!(parent: &self.inner.span, endpoint = %endpoint, error = %e, "Failed to close transport");
        }
    }

    /// Cancel queued asynchronous commands and close every transport.
    ///
    /// Commands already running finish first; the transports are closed once
    /// the device lock is free.
    pub async fn close(&self) -> Result<()> {
        self.inner.pool.close();

        let mut transports = self.inner.transports.lock().await;
        let active = transports.active.take();
        let standby = std::mem::take(&mut transports.standby);
        for transport in active.into_iter().chain(standby) {
            self.close_transport(transport).await;
        }
        self.inner.set_endpoint(None);

        info!(parent: &self.inner.span, "Device closed");
        Ok(())
    }

    /// Pre-send delay used when a call does not set one
    pub fn pre_send_delay(&self) -> Duration {
        self.dispatch_config().pre_send_delay()
    }
}

#[cfg(feature = "serial")]
fn with_serial(builder: DeviceBuilder, path: &str, config: &Config) -> Result<DeviceBuilder> {
    let transport = SerialTransport::open_with_options(path, SerialOptions::from(&config.transport))?;
    Ok(builder.transport(transport))
}

#[cfg(not(feature = "serial"))]
fn with_serial(_builder: DeviceBuilder, path: &str, _config: &Config) -> Result<DeviceBuilder> {
    Err(DeviceError::ConfigurationError(format!(
        "serial support is disabled, cannot open {}",
        path
    )))
}

/// Open the first serial port on the host, if there is one and it opens
#[cfg(feature = "serial")]
async fn first_serial(config: &Config) -> Option<Device> {
    let ports = match available_ports() {
        Ok(ports) => ports,
        Err(e) => {
            warn!(error = %e, "Failed to list serial ports");
            return None;
        }
    };
    let port = ports.first()?;
    match Device::usb_with_config(Some(port), config).await {
        Ok(device) => Some(device),
        Err(e) => {
            warn!(port = %port, error = %e, "Failed to open serial port");
            None
        }
    }
}

#[cfg(not(feature = "serial"))]
async fn first_serial(_config: &Config) -> Option<Device> {
    None
}

async fn write_then_read(transport: &mut dyn Transport, command: &str, wait: bool) -> Result<String> {
    transport.write_text(command).await?;
    transport.read(wait).await
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.endpoint() {
            Some(endpoint) => write!(f, "<Device connection={}/>", endpoint),
            None => write!(f, "<Device connection=None/>"),
        }
    }
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("id", &self.inner.id)
            .field("endpoint", &self.endpoint())
            .field("in_progress", &self.in_progress())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::Format;
    use crate::testing::{Event, MockTransport};
    use tokio_test::{assert_err, assert_ok};

    fn fast() -> CallOptions {
        CallOptions::new().with_delay(Duration::ZERO)
    }

    #[tokio::test]
    async fn test_call_formats_reply() {
        let mock = MockTransport::new().with_reply("[1,2;3,4]\n").with_reply("1.5e-3");
        let device = Device::builder().transport(mock).build();

        let matrix = device.call(["smu1", "measure"], fast()).await.unwrap();
        assert_eq!(matrix, Response::Matrix(vec![vec![1.0, 2.0], vec![3.0, 4.0]]));

        let number = device
            .call(["smu1", "get", "voltage"], fast().with_format(Format::None))
            .await
            .unwrap();
        assert_eq!(number, Response::Text("1.5e-3".to_string()));
    }

    #[tokio::test]
    async fn test_no_response_skips_waiting() {
        let mock = MockTransport::new().with_reply("unused");
        let log = mock.log();
        let device = Device::builder().transport(mock).build();

        let reply = device.call(["smu1", "set", "enabled", "1"], fast().no_response()).await.unwrap();
        assert_eq!(reply, Response::None);
        assert_eq!(log.events()[2], Event::Read { wait: false });
    }

    #[tokio::test]
    async fn test_no_transport_is_an_error() {
        let device = Device::builder().build();
        let err = assert_err!(device.call(["serial"], fast()).await);
        assert!(matches!(err, DeviceError::NoTransport));
        assert_eq!(device.to_string(), "<Device connection=None/>");
    }

    #[test_log::test(tokio::test)]
    async fn test_connection_failure_discards_transport() {
        let mock = MockTransport::new();
        let log = mock.log();
        let device = Device::builder().transport(mock).build();

        log.fail_next_write();
        let err = device.call(["smu1", "measure"], fast()).await.unwrap_err();
        assert!(err.is_connection_error());
        assert!(log.is_closed());
        assert_eq!(device.transport_count().await, 0);
        assert_eq!(device.endpoint(), None);

        assert!(matches!(device.call(["smu1", "measure"], fast()).await, Err(DeviceError::NoTransport)));
    }

    #[tokio::test]
    async fn test_read_failure_discards_transport() {
        let mock = MockTransport::new().with_reply("1");
        let log = mock.log();
        let device = Device::builder().transport(mock).build();

        log.fail_next_read();
        let err = assert_err!(device.call(["smu1", "measure"], fast()).await);
        assert!(err.is_connection_error());
        assert_eq!(log.writes(), ["smu1 measure"]);
        assert!(log.is_closed());
        assert_eq!(device.transport_count().await, 0);
        assert!(!device.is_connected().await);
        assert_eq!(device.endpoint(), None);
        assert!(!device.in_progress());

        let err = assert_err!(device.call(["smu1", "measure"], fast()).await);
        assert!(matches!(err, DeviceError::NoTransport));
    }

    #[tokio::test]
    async fn test_parse_error_keeps_transport() {
        let mock = MockTransport::new().with_reply("not a number");
        let device = Device::builder().transport(mock).build();

        let result = device.call(["x"], fast().with_format(Format::Number)).await;
        assert!(matches!(result, Err(DeviceError::Parse(_))));
        assert_eq!(device.transport_count().await, 1);
    }

    #[tokio::test]
    async fn test_add_replace_and_failover() {
        let primary = MockTransport::new().with_endpoint(Endpoint::socket("10.0.0.2", 8888));
        let primary_log = primary.log();
        let backup = MockTransport::new().with_endpoint(Endpoint::serial("/dev/ttyACM0"));

        let device = Device::builder().build();
        device.add_transport(primary).await;
        device.add_transport(backup).await;
        assert_eq!(device.transport_count().await, 2);
        assert_eq!(device.to_string(), "<Device connection=<Socket 10.0.0.2:8888 />/>");

        let endpoint = assert_ok!(device.failover().await);
        assert_eq!(endpoint, Endpoint::serial("/dev/ttyACM0"));
        assert!(primary_log.is_closed());
        assert_eq!(device.to_string(), "<Device connection=<Serial/USB /dev/ttyACM0 />/>");

        let replacement = MockTransport::new().with_endpoint(Endpoint::socket("10.0.0.3", 8888));
        device.replace_transport(replacement).await;
        assert_eq!(device.endpoint(), Some(Endpoint::socket("10.0.0.3", 8888)));
        assert_eq!(device.transport_count().await, 1);

        assert!(matches!(device.failover().await, Err(DeviceError::NoTransport)));
        assert!(!device.is_connected().await);
    }

    #[tokio::test]
    async fn test_in_progress_while_command_runs() {
        let mock = MockTransport::new().with_reply("1").with_latency(Duration::from_millis(50));
        let device = Device::builder().transport(mock).build();
        assert!(!device.in_progress());

        let handle = device.call_async(["smu1", "measure"], fast());
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(device.in_progress());

        assert_eq!(handle.await.unwrap(), Response::Number(1.0));
        assert!(!device.in_progress());
    }

    #[tokio::test]
    async fn test_in_progress_ignores_transport_queries() {
        let device = Device::builder().transport(MockTransport::new()).build();

        let guard = device.inner.transports.lock().await;
        assert!(!device.in_progress());
        drop(guard);

        device.add_transport(MockTransport::new()).await;
        assert_eq!(device.transport_count().await, 2);
        assert!(!device.in_progress());
    }

    #[tokio::test]
    async fn test_callback_runs_before_handle_resolves() {
        let mock = MockTransport::new().with_reply("[1;2;3]");
        let device = Device::builder().transport(mock).build();
        let called = Arc::new(AtomicBool::new(false));

        let seen = Arc::clone(&called);
        let handle = device.call_with_callback(["smu1", "sweep"], fast(), move |result| {
            assert_eq!(result.unwrap(), &Response::Array(vec![1.0, 2.0, 3.0]));
            seen.store(true, Ordering::SeqCst);
        });

        handle.await.unwrap();
        assert!(called.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_panicking_callback_keeps_result() {
        let mock = MockTransport::new().with_reply("42");
        let device = Device::builder().transport(mock).build();

        let handle = device.call_with_callback(["smu1", "measure"], fast(), |_| {
            panic!("callback failure");
        });
        assert_eq!(handle.await.unwrap(), Response::Number(42.0));
        assert!(device.is_connected().await);
        assert!(!device.in_progress());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_callers_never_interleave() {
        let mock = MockTransport::new()
            .with_responder(|command| Some(format!("{}\n", command.len())))
            .with_latency(Duration::from_millis(2));
        let log = mock.log();
        let device = Device::builder().transport(mock).build();

        let mut handles = Vec::new();
        for i in 0..8 {
            handles.push(device.call_async([format!("smu1 measure {}", i)], fast()));
            let device = device.clone();
            handles.push(CommandHandle::from(tokio::spawn(async move {
                device.step("smu2").step("measure").call_with([i], fast()).await
            })));
        }
        for handle in handles {
            assert!(handle.await.unwrap().as_number().is_some());
        }

        assert_eq!(log.writes().len(), 16);
        assert!(log.is_serialized());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_callback_runs_off_the_calling_thread() {
        let mock = MockTransport::new().with_reply("OK\n");
        let device = Device::builder().transport(mock).build();
        let caller = std::thread::current().id();
        let (tx, rx) = std::sync::mpsc::channel();

        let handle = device.call_with_callback(["hello"], fast(), move |result| {
            let _ = tx.send((std::thread::current().id(), result.ok().cloned()));
        });
        handle.await.unwrap();

        let (thread, reply) = rx.recv().unwrap();
        assert_ne!(thread, caller);
        assert_eq!(reply, Some(Response::Text("OK".to_string())));
    }

    #[tokio::test]
    async fn test_close_closes_all_transports() {
        let first = MockTransport::new();
        let second = MockTransport::new();
        let (first_log, second_log) = (first.log(), second.log());
        let device = Device::builder().transport(first).transport(second).build();

        device.close().await.unwrap();
        assert!(first_log.is_closed());
        assert!(second_log.is_closed());
        assert_eq!(device.transport_count().await, 0);
        assert!(matches!(device.call_async(["x"], fast()).await, Err(DeviceError::Cancelled)));
    }

    #[test]
    fn test_builder_settings() {
        let dispatch = DispatchConfig {
            pre_send_delay_ms: 5,
            ..DispatchConfig::default()
        };
        let device = Device::builder().id("bench-1").dispatch(dispatch).build();
        assert_eq!(device.id().as_str(), "bench-1");
        assert_eq!(device.pre_send_delay(), Duration::from_millis(5));
        assert_eq!(device.endpoint(), None);
    }

    #[tokio::test]
    async fn test_devices_share_configuration() {
        let mut config = Config::default();
        config.dispatch.eeprom_write_delay_ms = 7;
        let shared = SharedConfig::new(config);

        let first = Device::open(None, None, shared.clone()).await.unwrap();
        let second = Device::builder().config(shared.clone()).build();
        assert!(Arc::ptr_eq(first.config().inner(), shared.inner()));
        assert!(Arc::ptr_eq(second.config().inner(), shared.inner()));
        assert_eq!(second.dispatch_config().eeprom_write_delay_ms, 7);

        let from_ref = Device::open(None, None, &Config::default()).await.unwrap();
        assert_eq!(from_ref.dispatch_config(), &DispatchConfig::default());
    }
}
