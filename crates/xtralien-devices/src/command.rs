/*!
 * Command construction.
 *
 * The instrument vocabulary is hierarchical: `smu1 set voltage 1.5` addresses
 * the `voltage` setting of the first source-measure unit. A [`CommandBuilder`]
 * grows such a path one token at a time and only talks to the instrument when
 * it is called.
 *
 * ```no_run
 * # async fn demo(device: xtralien_devices::Device) -> xtralien_devices::Result<()> {
 * let smu = device.step("smu1");
 * smu.dup().step("set").step("voltage").call([1.5]).await?;
 * let reading = smu.step("measure").send().await?;
 * # Ok(())
 * # }
 * ```
 */
use std::fmt::{self, Display};
use std::time::Duration;

use crate::device::Device;
use crate::error::Result;
use crate::format::{Format, Response};
use crate::pool::CommandHandle;

/// Per-invocation dispatch options
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallOptions {
    /// How the reply is formatted
    pub format: Format,
    /// Whether to wait for a reply
    pub response: bool,
    /// Settling delay before sending; `None` uses the device default
    pub delay: Option<Duration>,
}

impl Default for CallOptions {
    fn default() -> Self {
        Self {
            format: Format::Auto,
            response: true,
            delay: None,
        }
    }
}

impl CallOptions {
    /// Default options: auto-format, wait for a reply
    pub fn new() -> Self {
        Self::default()
    }

    /// Use a specific response format
    pub fn with_format(mut self, format: Format) -> Self {
        self.format = format;
        self
    }

    /// Do not wait for a reply
    pub fn no_response(mut self) -> Self {
        self.response = false;
        self
    }

    /// Override the pre-send delay
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }
}

/// Join tokens into one command string
pub(crate) fn join_tokens<I>(tokens: I) -> String
where
    I: IntoIterator,
    I::Item: Display,
{
    tokens
        .into_iter()
        .map(|token| token.to_string())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Accumulates command tokens for a device
#[derive(Clone)]
pub struct CommandBuilder {
    device: Device,
    tokens: Vec<String>,
}

impl CommandBuilder {
    pub(crate) fn new(device: Device) -> Self {
        Self {
            device,
            tokens: Vec::new(),
        }
    }

    /// Append a token
    pub fn step<T: Display>(mut self, token: T) -> Self {
        self.tokens.push(token.to_string());
        self
    }

    /// Append an index token, e.g. the channel number in `smu 1`
    pub fn index<T: Display>(self, value: T) -> Self {
        self.step(value)
    }

    /// Branch off an independent copy of this builder
    pub fn dup(&self) -> Self {
        self.clone()
    }

    /// The tokens accumulated so far
    pub fn tokens(&self) -> &[String] {
        &self.tokens
    }

    /// The device this builder sends through
    pub fn device(&self) -> &Device {
        &self.device
    }

    /// The command string that calling with `args` would send
    pub fn command_line<I>(&self, args: I) -> String
    where
        I: IntoIterator,
        I::Item: Display,
    {
        let args = args.into_iter().map(|arg| arg.to_string());
        join_tokens(self.tokens.iter().cloned().chain(args))
    }

    /// Send the accumulated tokens with no extra arguments
    pub async fn send(&self) -> Result<Response> {
        self.send_with(CallOptions::default()).await
    }

    /// Send the accumulated tokens with explicit options
    pub async fn send_with(&self, options: CallOptions) -> Result<Response> {
        self.device.dispatch(join_tokens(&self.tokens), options).await
    }

    /// Send the accumulated tokens followed by `args`
    pub async fn call<I>(&self, args: I) -> Result<Response>
    where
        I: IntoIterator,
        I::Item: Display,
    {
        self.call_with(args, CallOptions::default()).await
    }

    /// Send the accumulated tokens followed by `args`, with explicit options
    pub async fn call_with<I>(&self, args: I, options: CallOptions) -> Result<Response>
    where
        I: IntoIterator,
        I::Item: Display,
    {
        self.device.dispatch(self.command_line(args), options).await
    }

    /// Run the call on the device's worker pool
    pub fn call_async<I>(&self, args: I, options: CallOptions) -> CommandHandle
    where
        I: IntoIterator,
        I::Item: Display,
    {
        self.device.submit(self.command_line(args), options, None)
    }

    /// Run the call on the worker pool and hand the result to `callback`.
    ///
    /// See [`Device::call_with_callback`] for where the callback runs.
    pub fn call_with_callback<I, F>(&self, args: I, options: CallOptions, callback: F) -> CommandHandle
    where
        I: IntoIterator,
        I::Item: Display,
        F: FnOnce(std::result::Result<&Response, &crate::DeviceError>) + Send + 'static,
    {
        self.device
            .submit(self.command_line(args), options, Some(Box::new(callback)))
    }
}

impl fmt::Debug for CommandBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandBuilder")
            .field("device", &self.device.id())
            .field("tokens", &self.tokens)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockTransport;

    fn device() -> Device {
        Device::builder().build()
    }

    #[tokio::test]
    async fn test_step_accumulates_in_order() {
        let builder = device().step("smu1").step("set").index(2);
        assert_eq!(builder.tokens(), ["smu1", "set", "2"]);
        assert_eq!(builder.command_line(["1.5", "V"]), "smu1 set 2 1.5 V");
    }

    #[tokio::test]
    async fn test_command_line_without_args() {
        let builder = device().step("serial");
        assert_eq!(builder.command_line(std::iter::empty::<&str>()), "serial");
        assert_eq!(device().command().command_line([1, 2]), "1 2");
    }

    #[tokio::test]
    async fn test_dup_is_independent() {
        let base = device().step("smu1");
        let set = base.dup().step("set");
        let measure = base.dup().step("measure");

        assert_eq!(base.tokens(), ["smu1"]);
        assert_eq!(set.tokens(), ["smu1", "set"]);
        assert_eq!(measure.tokens(), ["smu1", "measure"]);

        let base = base.step("get");
        assert_eq!(base.tokens(), ["smu1", "get"]);
        assert_eq!(set.tokens(), ["smu1", "set"]);
    }

    #[tokio::test]
    async fn test_call_sends_joined_tokens() {
        let mock = MockTransport::new().with_reply("[1;2]\n");
        let log = mock.log();
        let device = Device::builder().transport(mock).build();

        let reply = device
            .step("smu1")
            .step("measure")
            .call_with(["now"], CallOptions::new().with_delay(Duration::ZERO))
            .await
            .unwrap();

        assert_eq!(reply, Response::Array(vec![1.0, 2.0]));
        assert_eq!(log.writes(), vec!["smu1 measure now".to_string()]);
    }

    #[test]
    fn test_call_options() {
        let options = CallOptions::new()
            .with_format(Format::Number)
            .no_response()
            .with_delay(Duration::from_millis(5));
        assert_eq!(options.format, Format::Number);
        assert!(!options.response);
        assert_eq!(options.delay, Some(Duration::from_millis(5)));

        let defaults = CallOptions::default();
        assert_eq!(defaults.format, Format::Auto);
        assert!(defaults.response);
        assert_eq!(defaults.delay, None);
    }
}
