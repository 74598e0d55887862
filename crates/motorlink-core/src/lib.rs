/*!
 * MotorLink Core
 *
 * This crate provides the shared foundation for MotorLink: the error type,
 * argument values, configuration, and logging setup.
 */

#![warn(missing_docs)]

pub mod config;
pub mod error;
pub mod logging;
pub mod prelude;
pub mod types;
pub mod utils;

pub use error::{Error, Result};

/// Re-export of dependencies that are part of the public API
pub mod deps {
    pub use tokio;
    pub use tracing;
}

/// MotorLink core crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library initialization
pub fn init() -> Result<()> {
    logging::init()?;
    tracing::info!("MotorLink Core {} initialized", VERSION);
    Ok(())
}
