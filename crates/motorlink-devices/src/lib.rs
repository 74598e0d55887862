/*!
 * MotorLink Devices
 *
 * Self-healing command sessions with serial-attached microcontrollers
 * speaking the CmdMessenger protocol.
 *
 * ```no_run
 * use motorlink_devices::{args, SessionRegistry};
 * use motorlink_devices::prelude::*;
 *
 * # async fn run() -> Result<()> {
 * let registry = SessionRegistry::from_config(&Config::default())?;
 * registry.create(None).await?;
 * registry.send("moveMotor", args![1, 0.5, -0.5]).await?;
 * # Ok(())
 * # }
 * ```
 */

#![warn(missing_docs)]

// Re-export core types
pub use motorlink_core::prelude;
pub use motorlink_core::types::Value;

pub mod channel;
pub mod codec;
pub mod discovery;
pub mod handler;
pub mod message;
pub mod registry;
pub mod schema;
pub mod session;

mod dispatch;

#[cfg(feature = "serial")]
pub mod serial;

#[cfg(test)]
mod mock;

pub use channel::{ChannelOpener, ConnectionIdentity, MessageChannel, DEFAULT_BAUD_RATE};
pub use codec::CmdMessengerCodec;
pub use discovery::{DeviceDiscovery, PortDiscovery, StaticDiscovery};
pub use handler::{CallbackTable, CommandHandler};
pub use message::{Args, Message};
pub use registry::{RegistryEvent, SessionRegistry, SessionRegistryBuilder};
pub use schema::{ArgType, CommandSchema, Signature};
pub use session::{Delivery, DeviceSession, SessionConfig, SessionState, StatsSnapshot};

#[cfg(feature = "serial")]
pub use serial::{SerialChannel, SerialOpener};

/// MotorLink devices crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Channel implementations compiled into this build
pub fn available_channels() -> Vec<&'static str> {
    let mut channels = Vec::new();

    #[cfg(feature = "serial")]
    channels.push("serial");

    channels
}
