/*!
 * Message channel abstractions.
 *
 * A channel is one open connection to a device that sends and receives typed
 * commands. Sessions never mutate a channel after a failure; they ask the
 * opener for a brand new one.
 */
use std::fmt::{self, Debug};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use motorlink_core::error::Result;
use motorlink_core::types::Value;

use crate::message::Message;
use crate::schema::CommandSchema;

/// Default baud rate for CmdMessenger firmware
pub const DEFAULT_BAUD_RATE: u32 = 9600;

/// Where a session connects to; fixed for the session's lifetime
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConnectionIdentity {
    /// Device path, e.g. `/dev/ttyACM0`
    pub path: String,
    /// Baud rate
    pub baud_rate: u32,
}

impl ConnectionIdentity {
    /// Create a new identity
    pub fn new<P: Into<String>>(path: P, baud_rate: u32) -> Self {
        Self {
            path: path.into(),
            baud_rate,
        }
    }
}

impl fmt::Display for ConnectionIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.path, self.baud_rate)
    }
}

/// One open connection that sends and receives typed commands
///
/// Implementations must allow `send` and `receive` to run concurrently; the
/// session only ever has one `receive` in flight at a time.
#[async_trait]
pub trait MessageChannel: Send + Sync + Debug {
    /// Transmit a command
    ///
    /// `args` have already been validated against the schema. An `Err` here
    /// means the link is broken.
    async fn send(&self, address: &str, args: &[Value]) -> Result<()>;

    /// Wait for the next inbound message
    ///
    /// Returns `Ok(None)` when no complete message arrived within the
    /// channel's read timeout. `Error::Codec` reports a frame that could not
    /// be decoded and was skipped; any other error means the link is broken.
    async fn receive(&self) -> Result<Option<Message>>;
}

/// Opens channels; used for the initial connection and every reconnect
#[async_trait]
pub trait ChannelOpener: Send + Sync + Debug {
    /// Open a new channel at `identity` speaking `schema`
    async fn open(
        &self,
        identity: &ConnectionIdentity,
        schema: Arc<CommandSchema>,
    ) -> Result<Arc<dyn MessageChannel>>;
}
