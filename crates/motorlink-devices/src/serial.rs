/*!
 * Serial port channel.
 *
 * Opens the device with 8N1 framing and a short read timeout, then speaks the
 * CmdMessenger codec over it. Blocking port I/O runs on tokio's blocking pool.
 */
use std::io::{ErrorKind, Read, Write};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::BytesMut;
use serialport::SerialPort;
use tracing::{debug, info};

use motorlink_core::error::{Error, Result};
use motorlink_core::types::Value;

use crate::channel::{ChannelOpener, ConnectionIdentity, MessageChannel};
use crate::codec::CmdMessengerCodec;
use crate::message::Message;
use crate::schema::CommandSchema;

/// Default read timeout; bounds how long a receive waits before yielding `None`
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_millis(100);

const READ_CHUNK: usize = 256;

/// Bytes kept while waiting for a command terminator before giving up on them
pub const MAX_PENDING_BYTES: usize = 4096;

struct ReadHalf {
    port: Box<dyn SerialPort>,
    buffer: BytesMut,
}

/// A CmdMessenger channel over a serial port
pub struct SerialChannel {
    identity: ConnectionIdentity,
    codec: CmdMessengerCodec,
    writer: Arc<Mutex<Box<dyn SerialPort>>>,
    reader: Arc<Mutex<ReadHalf>>,
}

impl std::fmt::Debug for SerialChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SerialChannel")
            .field("identity", &self.identity)
            .finish()
    }
}

impl SerialChannel {
    /// Open and configure the port at `identity`
    pub fn open(
        identity: &ConnectionIdentity,
        schema: Arc<CommandSchema>,
        read_timeout: Duration,
    ) -> Result<Self> {
        let port = serialport::new(&identity.path, identity.baud_rate)
            .data_bits(serialport::DataBits::Eight)
            .parity(serialport::Parity::None)
            .stop_bits(serialport::StopBits::One)
            .flow_control(serialport::FlowControl::None)
            .timeout(read_timeout)
            .open()
            .map_err(|e| Error::connection(&identity.path, e.to_string()))?;

        let writer = port
            .try_clone()
            .map_err(|e| Error::connection(&identity.path, e.to_string()))?;

        info!("Opened serial port {}", identity);

        Ok(Self {
            identity: identity.clone(),
            codec: CmdMessengerCodec::new(schema),
            writer: Arc::new(Mutex::new(writer)),
            reader: Arc::new(Mutex::new(ReadHalf {
                port,
                buffer: BytesMut::with_capacity(READ_CHUNK),
            })),
        })
    }
}

#[async_trait]
impl MessageChannel for SerialChannel {
    async fn send(&self, address: &str, args: &[Value]) -> Result<()> {
        let mut frame = BytesMut::new();
        self.codec.encode(address, args, &mut frame)?;

        let writer = self.writer.clone();
        tokio::task::spawn_blocking(move || -> Result<()> {
            let mut port = writer
                .lock()
                .map_err(|_| Error::transport("serial writer lock poisoned"))?;
            port.write_all(&frame)
                .and_then(|_| port.flush())
                .map_err(|e| Error::transport(e.to_string()))
        })
        .await
        .map_err(|e| Error::transport(format!("write task failed: {}", e)))?
    }

    async fn receive(&self) -> Result<Option<Message>> {
        let reader = self.reader.clone();
        let codec = self.codec.clone();

        tokio::task::spawn_blocking(move || -> Result<Option<Message>> {
            let mut half = reader
                .lock()
                .map_err(|_| Error::transport("serial reader lock poisoned"))?;
            let ReadHalf { port, buffer } = &mut *half;
            read_message(&codec, buffer, |chunk| port.read(chunk))
        })
        .await
        .map_err(|e| Error::transport(format!("read task failed: {}", e)))?
    }
}

/// Decode the next message, pulling bytes from `read` until one is complete
///
/// A read timeout yields `Ok(None)`. More than [`MAX_PENDING_BYTES`] without a
/// terminator (line noise, baud mismatch) are discarded as `Error::Codec`.
fn read_message<R>(
    codec: &CmdMessengerCodec,
    buffer: &mut BytesMut,
    mut read: R,
) -> Result<Option<Message>>
where
    R: FnMut(&mut [u8]) -> std::io::Result<usize>,
{
    loop {
        if let Some(message) = codec.decode(buffer)? {
            return Ok(Some(message));
        }

        if buffer.len() > MAX_PENDING_BYTES {
            let discarded = buffer.len();
            buffer.clear();
            return Err(Error::codec(format!(
                "discarded {} bytes without a command terminator",
                discarded
            )));
        }

        let mut chunk = [0u8; READ_CHUNK];
        match read(&mut chunk) {
            Ok(0) => {
                // A zero-length read on a tty means the device went away
                return Err(Error::transport("serial port closed"));
            }
            Ok(n) => buffer.extend_from_slice(&chunk[..n]),
            Err(e) if e.kind() == ErrorKind::TimedOut => return Ok(None),
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(Error::transport(e.to_string())),
        }
    }
}

/// Opens [`SerialChannel`]s
#[derive(Debug, Clone)]
pub struct SerialOpener {
    read_timeout: Duration,
}

impl SerialOpener {
    /// Create an opener with a specific read timeout
    pub fn new(read_timeout: Duration) -> Self {
        Self { read_timeout }
    }
}

impl Default for SerialOpener {
    fn default() -> Self {
        Self::new(DEFAULT_READ_TIMEOUT)
    }
}

#[async_trait]
impl ChannelOpener for SerialOpener {
    async fn open(
        &self,
        identity: &ConnectionIdentity,
        schema: Arc<CommandSchema>,
    ) -> Result<Arc<dyn MessageChannel>> {
        debug!("Opening serial channel {}", identity);
        let identity = identity.clone();
        let read_timeout = self.read_timeout;

        let channel = tokio::task::spawn_blocking(move || {
            SerialChannel::open(&identity, schema, read_timeout)
        })
        .await
        .map_err(|e| Error::other(format!("open task failed: {}", e)))??;

        Ok(Arc::new(channel))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_open_missing_port_is_connection_error() {
        let schema = Arc::new(CommandSchema::from_pairs(&[("error", "s")]).unwrap());
        let identity = ConnectionIdentity::new("/dev/ttyFAKE0-motorlink", 9600);

        let err = SerialOpener::default().open(&identity, schema).await.unwrap_err();
        match err {
            Error::Connection { path, .. } => assert_eq!(path, "/dev/ttyFAKE0-motorlink"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_noise_without_terminator_is_discarded() {
        let schema = Arc::new(CommandSchema::from_pairs(&[("error", "s")]).unwrap());
        let codec = CmdMessengerCodec::new(schema);
        let mut buffer = BytesMut::new();

        let err = read_message(&codec, &mut buffer, |chunk| {
            chunk.fill(b'x');
            Ok(chunk.len())
        })
        .unwrap_err();
        assert!(matches!(err, Error::Codec(_)));
        assert!(buffer.is_empty());

        // The link stays usable once real frames arrive
        let mut frame = BytesMut::new();
        codec.encode("error", &[Value::from("ok")], &mut frame).unwrap();
        let mut pending = Some(frame);
        let message = read_message(&codec, &mut buffer, |chunk| match pending.take() {
            Some(frame) => {
                chunk[..frame.len()].copy_from_slice(&frame);
                Ok(frame.len())
            }
            None => Err(std::io::ErrorKind::TimedOut.into()),
        })
        .unwrap();
        assert_eq!(message, Some(Message::new("error", vec![Value::from("ok")])));
    }

    #[test]
    fn test_read_timeout_yields_none_and_keeps_partial_frame() {
        let schema = Arc::new(CommandSchema::from_pairs(&[("error", "s")]).unwrap());
        let codec = CmdMessengerCodec::new(schema);
        let mut buffer = BytesMut::new();
        let mut fed = false;

        let result = read_message(&codec, &mut buffer, |chunk| {
            if fed {
                return Err(std::io::ErrorKind::TimedOut.into());
            }
            fed = true;
            chunk[..2].copy_from_slice(b"0,");
            Ok(2)
        })
        .unwrap();
        assert_eq!(result, None);
        assert_eq!(&buffer[..], b"0,");
    }
}
