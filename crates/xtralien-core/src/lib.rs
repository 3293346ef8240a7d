/*!
 * Xtralien Core
 *
 * This crate provides the shared plumbing for the Xtralien client crates:
 * configuration, logging setup, error types and small async utilities.
 */

#![warn(missing_docs)]

pub mod config;
pub mod error;
pub mod logging;
pub mod prelude;
pub mod types;
pub mod utils;

/// Re-export of dependencies that are part of the public API
pub mod deps {
    pub use anyhow;
    pub use tokio;
    pub use tracing;
}

/// Xtralien core crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library initialization with the default logging configuration
pub fn init() -> Result<(), error::Error> {
    logging::init()?;
    tracing::info!("Xtralien Core {} initialized", VERSION);
    Ok(())
}

/// Library initialization from a loaded configuration
pub fn init_with_config(config: &config::Config) -> Result<(), error::Error> {
    logging::init_with_config(&config.logging)?;
    tracing::info!("Xtralien Core {} initialized", VERSION);
    Ok(())
}
