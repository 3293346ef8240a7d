/*!
 * Prelude module for Xtralien Core.
 *
 * Re-exports the types most callers need in one import.
 */

pub use crate::error::{Error, Result};

pub use crate::types::{Endpoint, Id};

pub use crate::config::{
    Config, ConfigBuilder, DiscoveryConfig, DispatchConfig, LoggingConfig, SharedConfig,
    TransportConfig,
};

pub use crate::utils::{duration_to_millis, millis_to_duration};

pub use tracing::{debug, error, info, trace, warn};

pub use crate::init;
