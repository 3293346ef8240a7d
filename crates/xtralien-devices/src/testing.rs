/*!
 * Test support: an instrumented in-memory transport.
 *
 * [`MockTransport`] answers writes from a reply script or a responder closure
 * and records every call boundary in a [`MockLog`] that stays with the test
 * after the transport has been moved into a device.
 */
use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use xtralien_core::types::Endpoint;

use crate::error::{DeviceError, Result};
use crate::transport::Transport;

/// One recorded transport call boundary
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// A write began with this text
    Write(String),
    /// The write finished
    WriteDone,
    /// A read began
    Read {
        /// Whether the caller waited for data
        wait: bool,
    },
    /// The read finished
    ReadDone,
    /// An injected failure was raised
    Failed,
    /// The transport was closed
    Close,
}

#[derive(Debug, Default)]
struct MockState {
    events: Vec<Event>,
    replies: VecDeque<String>,
    fail_write: bool,
    fail_read: bool,
    closed: bool,
}

/// Shared view of a mock transport's calls and failure switches
#[derive(Debug, Clone, Default)]
pub struct MockLog {
    state: Arc<Mutex<MockState>>,
}

impl MockLog {
    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn record(&self, event: Event) {
        self.state().events.push(event);
    }

    /// Every recorded event, in order
    pub fn events(&self) -> Vec<Event> {
        self.state().events.clone()
    }

    /// The text of every write, in order
    pub fn writes(&self) -> Vec<String> {
        self.state()
            .events
            .iter()
            .filter_map(|event| match event {
                Event::Write(text) => Some(text.clone()),
                _ => None,
            })
            .collect()
    }

    /// Queue a reply for the next waiting read
    pub fn push_reply<S: Into<String>>(&self, reply: S) {
        self.state().replies.push_back(reply.into());
    }

    /// Make the next write fail with a connection error
    pub fn fail_next_write(&self) {
        self.state().fail_write = true;
    }

    /// Make the next read fail with a connection error
    pub fn fail_next_read(&self) {
        self.state().fail_read = true;
    }

    /// Whether the transport has been closed
    pub fn is_closed(&self) -> bool {
        self.state().closed
    }

    /// Whether every write/read exchange ran to completion before the next began
    pub fn is_serialized(&self) -> bool {
        const CYCLE: usize = 4;
        let events: Vec<Event> = self
            .events()
            .into_iter()
            .filter(|event| *event != Event::Close)
            .collect();

        events.len() % CYCLE == 0
            && events.chunks(CYCLE).all(|exchange| {
                matches!(
                    exchange,
                    [Event::Write(_), Event::WriteDone, Event::Read { .. }, Event::ReadDone]
                )
            })
    }
}

type Responder = Arc<dyn Fn(&str) -> Option<String> + Send + Sync>;

/// In-memory transport for tests
pub struct MockTransport {
    endpoint: Endpoint,
    latency: Duration,
    responder: Option<Responder>,
    /// Responder output for the last write
    pending: Option<String>,
    log: MockLog,
}

impl MockTransport {
    /// A mock with no scripted replies, posing as a socket transport
    pub fn new() -> Self {
        Self {
            endpoint: Endpoint::socket("mock", 8888),
            latency: Duration::ZERO,
            responder: None,
            pending: None,
            log: MockLog::default(),
        }
    }

    /// Queue a reply
    pub fn with_reply<S: Into<String>>(self, reply: S) -> Self {
        self.log.push_reply(reply);
        self
    }

    /// Answer writes the script does not cover.
    ///
    /// The responder is called with every written command, including those
    /// whose reply is never read.
    pub fn with_responder<F>(mut self, responder: F) -> Self
    where
        F: Fn(&str) -> Option<String> + Send + Sync + 'static,
    {
        self.responder = Some(Arc::new(responder));
        self
    }

    /// Delay every write and read, giving concurrent callers a chance to interleave
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Report a different endpoint
    pub fn with_endpoint(mut self, endpoint: Endpoint) -> Self {
        self.endpoint = endpoint;
        self
    }

    /// A handle on this transport's call log
    pub fn log(&self) -> MockLog {
        self.log.clone()
    }

    async fn pause(&self) {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for MockTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MockTransport")
            .field("endpoint", &self.endpoint)
            .field("latency", &self.latency)
            .field("responder", &self.responder.is_some())
            .finish()
    }
}

#[async_trait]
impl Transport for MockTransport {
    fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    fn is_open(&self) -> bool {
        !self.log.is_closed()
    }

    async fn write(&mut self, data: &[u8]) -> Result<()> {
        if self.log.is_closed() {
            return Err(DeviceError::TransportClosed);
        }
        let text = String::from_utf8(data.to_vec())?;
        self.log.record(Event::Write(text.clone()));

        let fail = std::mem::take(&mut self.log.state().fail_write);
        if fail {
            self.log.record(Event::Failed);
            return Err(DeviceError::connection_lost("injected write failure"));
        }

        self.pause().await;
        self.pending = self.responder.as_ref().and_then(|responder| responder(&text));
        self.log.record(Event::WriteDone);
        Ok(())
    }

    async fn read(&mut self, wait: bool) -> Result<String> {
        if self.log.is_closed() {
            return Err(DeviceError::TransportClosed);
        }
        self.log.record(Event::Read { wait });

        let fail = std::mem::take(&mut self.log.state().fail_read);
        if fail {
            self.log.record(Event::Failed);
            return Err(DeviceError::connection_lost("injected read failure"));
        }

        self.pause().await;
        let pending = self.pending.take();
        let reply = if wait {
            let scripted = self.log.state().replies.pop_front();
            scripted.or(pending).unwrap_or_default()
        } else {
            String::new()
        };
        self.log.record(Event::ReadDone);
        Ok(reply)
    }

    async fn close(&mut self) -> Result<()> {
        let mut state = self.log.state();
        if state.closed {
            return Err(DeviceError::TransportClosed);
        }
        state.closed = true;
        state.events.push(Event::Close);
        Ok(())
    }
}
