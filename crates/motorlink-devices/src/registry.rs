/*!
 * Session registry for MotorLink.
 *
 * The registry picks devices, opens sessions on them and keeps them keyed by
 * device path. The first session `create` attaches becomes the default target
 * for `send`.
 */
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{debug, error, info};

use motorlink_core::config::{Config, SerialConfig};
use motorlink_core::error::{Error, Result};
use motorlink_core::types::{Id, Value};

use crate::channel::{ChannelOpener, ConnectionIdentity};
use crate::discovery::{DeviceDiscovery, PortDiscovery};
use crate::handler::CallbackTable;
use crate::message::Args;
use crate::schema::CommandSchema;
use crate::session::{Delivery, DeviceSession, SessionConfig};

/// Event types for the session registry
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum RegistryEvent {
    /// A session was opened and added
    SessionAttached {
        /// Device path
        path: String,
        /// Session ID
        id: Id,
    },
    /// A session was closed and removed
    SessionDetached {
        /// Device path
        path: String,
        /// Session ID
        id: Id,
    },
}

/// The schema every registry session speaks unless overridden
///
/// Order matters: it must match the command enumeration in the firmware.
pub fn builtin_schema() -> Result<CommandSchema> {
    CommandSchema::builder()
        .command("moveMotor", "iff")
        .command("error", "s")
        .build()
}

/// Callbacks every registry session runs unless overridden
pub fn builtin_callbacks() -> CallbackTable {
    CallbackTable::builder()
        .on("error", |session, args| {
            let text = args.first().and_then(Value::as_str).unwrap_or_default();
            error!("Device {} reported: {}", session.identity().path, text);
        })
        .build()
}

/// Owns every open session, keyed by device path
#[derive(Debug)]
pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, Arc<DeviceSession>>>,
    default_path: RwLock<Option<String>>,
    discovery: Arc<dyn DeviceDiscovery>,
    opener: Arc<dyn ChannelOpener>,
    schema: Arc<CommandSchema>,
    callbacks: Arc<CallbackTable>,
    device_path: Option<String>,
    baud_rate: u32,
    session_config: SessionConfig,
    event_sender: broadcast::Sender<RegistryEvent>,
}

impl SessionRegistry {
    /// Start building a registry
    pub fn builder() -> SessionRegistryBuilder {
        SessionRegistryBuilder::default()
    }

    /// A registry with the serial opener, port discovery and built-in schema
    pub fn from_config(config: &Config) -> Result<Self> {
        Self::builder().with_config(config.clone()).build()
    }

    /// Open the default session
    ///
    /// With no `device_path`, the configured `serial.device_path` is used, or
    /// else the first candidate from discovery. Nothing is kept on failure.
    pub async fn create(&self, device_path: Option<&str>) -> Result<Arc<DeviceSession>> {
        let path = match device_path.or(self.device_path.as_deref()) {
            Some(path) => path.to_string(),
            None => self.discover().await?,
        };

        let session = self.attach(&path).await?;
        *self.write_default()? = Some(path);
        Ok(session)
    }

    async fn discover(&self) -> Result<String> {
        let candidates = self.discovery.candidates().await?;
        debug!(
            "Discovery provider {} returned {} candidate(s)",
            self.discovery.name(),
            candidates.len()
        );
        candidates.into_iter().next().ok_or(Error::NoDeviceFound)
    }

    /// Open a session on `path` and add it to the registry
    pub async fn attach(&self, path: &str) -> Result<Arc<DeviceSession>> {
        if self.read_sessions()?.contains_key(path) {
            return Err(Error::AlreadyAttached(path.to_string()));
        }

        let identity = ConnectionIdentity::new(path, self.baud_rate);
        let session = DeviceSession::open(
            identity,
            self.schema.clone(),
            self.callbacks.clone(),
            self.opener.clone(),
            self.session_config.clone(),
        )
        .await?;

        {
            let mut sessions = self.write_sessions()?;
            if !sessions.contains_key(path) {
                sessions.insert(path.to_string(), session.clone());
                let _ = self.event_sender.send(RegistryEvent::SessionAttached {
                    path: path.to_string(),
                    id: session.id().clone(),
                });
                info!("Attached session {} on {}", session.id(), path);
                return Ok(session);
            }
        }

        // Lost a race with another attach on the same path
        session.close().await;
        Err(Error::AlreadyAttached(path.to_string()))
    }

    /// Send on the default session
    ///
    /// Fails with [`Error::NoDeviceFound`] if `create` has not succeeded.
    pub async fn send<A: Into<Args>>(&self, address: &str, args: A) -> Result<Delivery> {
        let session = self.default_session()?.ok_or(Error::NoDeviceFound)?;
        session.send(address, args).await
    }

    /// Send on the session attached at `path`
    pub async fn send_to<A: Into<Args>>(
        &self,
        path: &str,
        address: &str,
        args: A,
    ) -> Result<Delivery> {
        let session = self
            .session(path)?
            .ok_or_else(|| Error::other(format!("No session attached at {}", path)))?;
        session.send(address, args).await
    }

    /// The session attached at `path`
    pub fn session(&self, path: &str) -> Result<Option<Arc<DeviceSession>>> {
        Ok(self.read_sessions()?.get(path).cloned())
    }

    /// The session `create` attached, if still present
    pub fn default_session(&self) -> Result<Option<Arc<DeviceSession>>> {
        let path = self.read_default()?.clone();
        match path {
            Some(path) => self.session(&path),
            None => Ok(None),
        }
    }

    /// Attached device paths, sorted
    pub fn paths(&self) -> Result<Vec<String>> {
        let mut paths: Vec<String> = self.read_sessions()?.keys().cloned().collect();
        paths.sort();
        Ok(paths)
    }

    /// Number of attached sessions
    pub fn len(&self) -> usize {
        self.read_sessions().map(|s| s.len()).unwrap_or(0)
    }

    /// Whether no session is attached
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Close and remove the session at `path`
    pub async fn detach(&self, path: &str) -> Result<()> {
        let session = self
            .write_sessions()?
            .remove(path)
            .ok_or_else(|| Error::other(format!("No session attached at {}", path)))?;

        {
            let mut default_path = self.write_default()?;
            if default_path.as_deref() == Some(path) {
                *default_path = None;
            }
        }

        session.close().await;
        let _ = self.event_sender.send(RegistryEvent::SessionDetached {
            path: path.to_string(),
            id: session.id().clone(),
        });
        debug!("Detached session on {}", path);
        Ok(())
    }

    /// Close and remove every session
    pub async fn close_all(&self) -> Result<()> {
        let sessions: Vec<(String, Arc<DeviceSession>)> =
            self.write_sessions()?.drain().collect();
        *self.write_default()? = None;

        futures::future::join_all(sessions.iter().map(|(_, session)| session.close())).await;

        for (path, session) in &sessions {
            let _ = self.event_sender.send(RegistryEvent::SessionDetached {
                path: path.clone(),
                id: session.id().clone(),
            });
        }

        info!("Closed {} session(s)", sessions.len());
        Ok(())
    }

    /// Subscribe to registry events
    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.event_sender.subscribe()
    }

    fn read_sessions(
        &self,
    ) -> Result<std::sync::RwLockReadGuard<'_, HashMap<String, Arc<DeviceSession>>>> {
        self.sessions
            .read()
            .map_err(|_| Error::other("Failed to acquire read lock on session registry"))
    }

    fn write_sessions(
        &self,
    ) -> Result<std::sync::RwLockWriteGuard<'_, HashMap<String, Arc<DeviceSession>>>> {
        self.sessions
            .write()
            .map_err(|_| Error::other("Failed to acquire write lock on session registry"))
    }

    fn read_default(&self) -> Result<std::sync::RwLockReadGuard<'_, Option<String>>> {
        self.default_path
            .read()
            .map_err(|_| Error::other("Failed to acquire read lock on default session"))
    }

    fn write_default(&self) -> Result<std::sync::RwLockWriteGuard<'_, Option<String>>> {
        self.default_path
            .write()
            .map_err(|_| Error::other("Failed to acquire write lock on default session"))
    }
}

/// Builder for [`SessionRegistry`]
#[derive(Default)]
pub struct SessionRegistryBuilder {
    config: Option<Config>,
    opener: Option<Arc<dyn ChannelOpener>>,
    discovery: Option<Arc<dyn DeviceDiscovery>>,
    schema: Option<CommandSchema>,
    callbacks: Option<CallbackTable>,
}

impl SessionRegistryBuilder {
    /// Baud rate, discovery prefixes and session tuning
    pub fn with_config(mut self, config: Config) -> Self {
        self.config = Some(config);
        self
    }

    /// Replace the serial opener
    pub fn with_opener<O: ChannelOpener + 'static>(mut self, opener: O) -> Self {
        self.opener = Some(Arc::new(opener));
        self
    }

    /// Replace an opener already behind an `Arc`
    pub fn with_shared_opener(mut self, opener: Arc<dyn ChannelOpener>) -> Self {
        self.opener = Some(opener);
        self
    }

    /// Replace port discovery
    pub fn with_discovery<D: DeviceDiscovery + 'static>(mut self, discovery: D) -> Self {
        self.discovery = Some(Arc::new(discovery));
        self
    }

    /// Replace the built-in schema
    pub fn with_schema(mut self, schema: CommandSchema) -> Self {
        self.schema = Some(schema);
        self
    }

    /// Replace the built-in callbacks
    pub fn with_callbacks(mut self, callbacks: CallbackTable) -> Self {
        self.callbacks = Some(callbacks);
        self
    }

    /// Build the registry
    pub fn build(self) -> Result<SessionRegistry> {
        let config = self.config.unwrap_or_default();
        config.validate()?;

        let opener = match self.opener {
            Some(opener) => opener,
            None => default_opener(&config.serial)?,
        };
        let discovery = self.discovery.unwrap_or_else(|| {
            Arc::new(PortDiscovery::new(config.serial.discovery_prefixes.clone()))
        });
        let schema = match self.schema {
            Some(schema) => schema,
            None => builtin_schema()?,
        };
        let callbacks = self.callbacks.unwrap_or_else(builtin_callbacks);
        let (event_sender, _) = broadcast::channel(100);

        Ok(SessionRegistry {
            sessions: RwLock::new(HashMap::new()),
            default_path: RwLock::new(None),
            discovery,
            opener,
            schema: Arc::new(schema),
            callbacks: Arc::new(callbacks),
            device_path: config.serial.device_path.clone(),
            baud_rate: config.serial.baud_rate,
            session_config: SessionConfig::from(&config.session),
            event_sender,
        })
    }
}

#[cfg(feature = "serial")]
fn default_opener(serial: &SerialConfig) -> Result<Arc<dyn ChannelOpener>> {
    Ok(Arc::new(crate::serial::SerialOpener::new(serial.read_timeout())))
}

#[cfg(not(feature = "serial"))]
fn default_opener(_serial: &SerialConfig) -> Result<Arc<dyn ChannelOpener>> {
    Err(Error::config(
        "no channel opener given and the serial feature is disabled",
    ))
}
