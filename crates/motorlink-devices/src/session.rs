/*!
 * Device sessions.
 *
 * A session owns one channel to one device. It runs a receive loop that fans
 * inbound messages out to handlers, transmits outbound commands, and replaces
 * the channel on its own whenever the link breaks.
 *
 * State and channel generation live together in one atomic cell. Every failure
 * is reported against the generation it was observed on, so a late error from
 * a channel that has already been replaced cannot start a second reconnect.
 */
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, RwLock};
use tracing::{debug, error, info, trace, warn, Instrument};

use motorlink_core::config::SessionSettings;
use motorlink_core::error::{Error, Result};
use motorlink_core::logging::component_span;
use motorlink_core::types::Id;
use motorlink_core::utils::retry_until_cancelled;

use crate::channel::{ChannelOpener, ConnectionIdentity, MessageChannel};
use crate::dispatch::{Dispatcher, Job};
use crate::handler::CallbackTable;
use crate::message::{Args, Message};
use crate::schema::CommandSchema;

/// Connection state of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SessionState {
    /// The first channel is being opened
    Connecting,
    /// A channel is open and the receive loop is running
    Connected,
    /// The link failed and a reconnect is in progress
    Reconnecting,
    /// The session was closed; terminal
    Closed,
}

impl SessionState {
    fn to_bits(self) -> u64 {
        match self {
            SessionState::Connecting => 0,
            SessionState::Connected => 1,
            SessionState::Reconnecting => 2,
            SessionState::Closed => 3,
        }
    }

    fn from_bits(bits: u64) -> Self {
        match bits {
            0 => SessionState::Connecting,
            1 => SessionState::Connected,
            2 => SessionState::Reconnecting,
            _ => SessionState::Closed,
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Connecting => "connecting",
            SessionState::Connected => "connected",
            SessionState::Reconnecting => "reconnecting",
            SessionState::Closed => "closed",
        };
        f.write_str(name)
    }
}

const STATE_BITS: u32 = 8;
const STATE_MASK: u64 = (1 << STATE_BITS) - 1;

/// State plus channel generation in a single atomic word
#[derive(Debug)]
struct StateCell(AtomicU64);

impl StateCell {
    fn new(state: SessionState) -> Self {
        Self(AtomicU64::new(Self::pack(0, state)))
    }

    fn pack(generation: u64, state: SessionState) -> u64 {
        (generation << STATE_BITS) | state.to_bits()
    }

    fn unpack(word: u64) -> (u64, SessionState) {
        (word >> STATE_BITS, SessionState::from_bits(word & STATE_MASK))
    }

    fn load(&self) -> (u64, SessionState) {
        Self::unpack(self.0.load(Ordering::Acquire))
    }

    fn get(&self) -> SessionState {
        self.load().1
    }

    /// Move from `(generation, from)` to `(next_generation, to)`; false if the cell moved on
    fn transition(
        &self,
        generation: u64,
        from: SessionState,
        next_generation: u64,
        to: SessionState,
    ) -> bool {
        self.0
            .compare_exchange(
                Self::pack(generation, from),
                Self::pack(next_generation, to),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Force the state to `Closed`, returning the previous state
    fn close(&self) -> SessionState {
        let previous = self
            .0
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |word| {
                let (generation, _) = Self::unpack(word);
                Some(Self::pack(generation, SessionState::Closed))
            })
            .unwrap_or_else(|word| word);
        Self::unpack(previous).1
    }
}

/// Outcome of a [`DeviceSession::send`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Delivery {
    /// The command was written to the channel
    Sent,
    /// The session was not connected, or the write failed; nothing was sent
    Dropped,
}

/// Session tuning
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    /// Delay between reconnect attempts
    pub reconnect_interval: Duration,
    /// Number of handler workers
    pub dispatch_workers: usize,
    /// Capacity of the dispatch queue
    pub dispatch_queue: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self::from(&SessionSettings::default())
    }
}

impl From<&SessionSettings> for SessionConfig {
    fn from(settings: &SessionSettings) -> Self {
        Self {
            reconnect_interval: settings.reconnect_interval(),
            dispatch_workers: settings.dispatch_workers,
            dispatch_queue: settings.dispatch_queue,
        }
    }
}

/// Live counters for one session
#[derive(Debug, Default)]
pub struct SessionStats {
    pub(crate) received: AtomicU64,
    pub(crate) dispatched: AtomicU64,
    pub(crate) unknown_addresses: AtomicU64,
    pub(crate) handler_panics: AtomicU64,
    pub(crate) sent: AtomicU64,
    pub(crate) dropped: AtomicU64,
    pub(crate) reconnects: AtomicU64,
}

impl SessionStats {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Copy the counters
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            received: self.received.load(Ordering::Relaxed),
            dispatched: self.dispatched.load(Ordering::Relaxed),
            unknown_addresses: self.unknown_addresses.load(Ordering::Relaxed),
            handler_panics: self.handler_panics.load(Ordering::Relaxed),
            sent: self.sent.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`SessionStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    /// Messages decoded off the wire
    pub received: u64,
    /// Handler calls started
    pub dispatched: u64,
    /// Messages with no registered handler
    pub unknown_addresses: u64,
    /// Handler calls that panicked
    pub handler_panics: u64,
    /// Commands written
    pub sent: u64,
    /// Commands dropped while disconnected or on a failed write
    pub dropped: u64,
    /// Completed reconnects
    pub reconnects: u64,
}

/// Serializable summary of a session
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    /// Session ID
    pub id: Id,
    /// Where the session connects to
    pub identity: ConnectionIdentity,
    /// Current state
    pub state: SessionState,
    /// When the current channel was opened
    pub connected_at: Option<DateTime<Utc>>,
    /// Counters
    pub stats: StatsSnapshot,
}

/// One channel generation and the signal that retires its receive loop
#[derive(Clone)]
struct Link {
    generation: u64,
    channel: Arc<dyn MessageChannel>,
    stop: Arc<watch::Sender<bool>>,
}

impl Link {
    fn new(generation: u64, channel: Arc<dyn MessageChannel>) -> Self {
        let (stop, _) = watch::channel(false);
        Self {
            generation,
            channel,
            stop: Arc::new(stop),
        }
    }

    fn retire(&self) {
        self.stop.send_replace(true);
    }
}

/// A self-healing connection to one device
pub struct DeviceSession {
    id: Id,
    identity: ConnectionIdentity,
    schema: Arc<CommandSchema>,
    callbacks: Arc<CallbackTable>,
    opener: Arc<dyn ChannelOpener>,
    config: SessionConfig,
    state: StateCell,
    link: RwLock<Option<Link>>,
    connected_at: RwLock<Option<DateTime<Utc>>>,
    dispatcher: Dispatcher,
    shutdown: watch::Sender<bool>,
    stats: Arc<SessionStats>,
    self_ref: Weak<DeviceSession>,
}

impl fmt::Debug for DeviceSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceSession")
            .field("id", &self.id)
            .field("identity", &self.identity)
            .field("state", &self.state.get())
            .finish()
    }
}

impl DeviceSession {
    /// Open a channel at `identity` and start receiving
    ///
    /// The first open is not retried; its failure is returned as
    /// [`Error::Connection`]. Once this returns, the session reconnects on its
    /// own until [`close`](Self::close) is called or it is dropped.
    pub async fn open(
        identity: ConnectionIdentity,
        schema: Arc<CommandSchema>,
        callbacks: Arc<CallbackTable>,
        opener: Arc<dyn ChannelOpener>,
        config: SessionConfig,
    ) -> Result<Arc<Self>> {
        debug!("Opening session for {}", identity);
        let channel = opener
            .open(&identity, schema.clone())
            .await
            .map_err(|e| match e {
                Error::Connection { .. } => e,
                other => Error::connection(&identity.path, other.to_string()),
            })?;

        let (shutdown, _) = watch::channel(false);
        let stats = Arc::new(SessionStats::default());
        let link = Link::new(0, channel);

        let session = Arc::new_cyclic(|weak: &Weak<DeviceSession>| Self {
            id: Id::new(),
            identity,
            schema,
            callbacks,
            opener,
            dispatcher: Dispatcher::start(
                config.dispatch_workers,
                config.dispatch_queue,
                weak.clone(),
                stats.clone(),
            ),
            config,
            state: StateCell::new(SessionState::Connecting),
            link: RwLock::new(Some(link.clone())),
            connected_at: RwLock::new(Some(Utc::now())),
            shutdown,
            stats,
            self_ref: weak.clone(),
        });

        session
            .state
            .transition(0, SessionState::Connecting, 0, SessionState::Connected);
        info!("Connected to device {}", session.identity);
        session.spawn_receive_loop(link);

        Ok(session)
    }

    /// Session ID
    pub fn id(&self) -> &Id {
        &self.id
    }

    /// Where this session connects to
    pub fn identity(&self) -> &ConnectionIdentity {
        &self.identity
    }

    /// The schema this session speaks
    pub fn schema(&self) -> &Arc<CommandSchema> {
        &self.schema
    }

    /// Current state
    pub fn state(&self) -> SessionState {
        self.state.get()
    }

    /// Whether a channel is currently open
    pub fn is_connected(&self) -> bool {
        self.state() == SessionState::Connected
    }

    /// Counter snapshot
    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Serializable summary
    pub async fn info(&self) -> SessionInfo {
        SessionInfo {
            id: self.id.clone(),
            identity: self.identity.clone(),
            state: self.state(),
            connected_at: *self.connected_at.read().await,
            stats: self.stats(),
        }
    }

    /// Transmit a command to the device
    ///
    /// `args` is a single value or a sequence matching the address's
    /// signature; see [`args!`](crate::args). Schema violations are returned
    /// as [`Error::Schema`] whatever the state. While the session is
    /// reconnecting the command is dropped, never queued. A failed write
    /// starts a reconnect and is reported as [`Delivery::Dropped`].
    pub async fn send<A: Into<Args>>(&self, address: &str, args: A) -> Result<Delivery> {
        let args = self.schema.validate(address, args.into().as_slice())?;

        match self.state() {
            SessionState::Connected => {}
            SessionState::Closed => return Err(Error::Closed),
            state => {
                SessionStats::bump(&self.stats.dropped);
                debug!(
                    "Dropped {} to {}: session is {}",
                    address, self.identity.path, state
                );
                return Ok(Delivery::Dropped);
            }
        }

        let link = self.link.read().await.clone();
        let Some(link) = link else {
            SessionStats::bump(&self.stats.dropped);
            return Ok(Delivery::Dropped);
        };

        match link.channel.send(address, &args).await {
            Ok(()) => {
                SessionStats::bump(&self.stats.sent);
                trace!("Sent {} to {}", address, self.identity.path);
                Ok(Delivery::Sent)
            }
            Err(e) => {
                SessionStats::bump(&self.stats.dropped);
                error!("Write to {} failed: {}", self.identity.path, e);
                self.on_transport_failure(&link);
                Ok(Delivery::Dropped)
            }
        }
    }

    /// Stop the session
    ///
    /// Stops the receive loop, cancels any reconnect and releases the channel.
    /// Handlers already queued still run. Closing twice is a no-op.
    pub async fn close(&self) {
        if self.state.close() == SessionState::Closed {
            return;
        }

        self.shutdown.send_replace(true);
        if let Some(link) = self.link.write().await.take() {
            link.retire();
        }
        self.dispatcher.stop();
        info!("Closed session for {}", self.identity);
    }

    fn spawn_receive_loop(&self, link: Link) {
        let session = self.self_ref.clone();
        let mut shutdown = self.shutdown.subscribe();
        let mut stop = link.stop.subscribe();
        let span = component_span("device_session", Some(&self.identity.path));

        tokio::spawn(
            async move {
                debug!("Receive loop started (generation {})", link.generation);
                loop {
                    if *shutdown.borrow() || *stop.borrow() {
                        break;
                    }

                    let received = tokio::select! {
                        received = link.channel.receive() => received,
                        _ = shutdown.changed() => break,
                        _ = stop.changed() => break,
                    };

                    let Some(session) = session.upgrade() else { break };
                    if session.state.load() != (link.generation, SessionState::Connected) {
                        // Superseded by a send-side failure
                        break;
                    }
                    match received {
                        Ok(Some(message)) => session.route(message, &mut shutdown).await,
                        Ok(None) => {}
                        Err(Error::Codec(reason)) => {
                            warn!(
                                "Discarded malformed frame from {}: {}",
                                session.identity.path, reason
                            );
                        }
                        Err(e) => {
                            error!("Read from {} failed: {}", session.identity.path, e);
                            session.on_transport_failure(&link);
                            break;
                        }
                    }
                }
                debug!("Receive loop stopped (generation {})", link.generation);
            }
            .instrument(span),
        );
    }

    async fn route(&self, message: Message, shutdown: &mut watch::Receiver<bool>) {
        SessionStats::bump(&self.stats.received);
        let Message { address, args } = message;

        let Some(handler) = self.callbacks.get(&address) else {
            SessionStats::bump(&self.stats.unknown_addresses);
            warn!(
                "Address not understood: {} from device {}",
                address, self.identity.path
            );
            return;
        };

        let Some(sender) = self.dispatcher.sender() else {
            debug!("Dispatcher stopped, discarding {}", address);
            return;
        };

        let job = Job {
            address,
            handler,
            args,
        };
        // Waits for queue space, so dispatch starts in read order
        tokio::select! {
            sent = sender.send(job) => {
                if sent.is_err() {
                    debug!("Dispatch queue closed");
                }
            }
            _ = shutdown.changed() => {
                debug!("Session closed while waiting for queue space");
            }
        }
    }

    fn on_transport_failure(&self, link: &Link) {
        link.retire();

        let generation = link.generation;
        if !self.state.transition(
            generation,
            SessionState::Connected,
            generation,
            SessionState::Reconnecting,
        ) {
            trace!(
                "Ignoring failure on generation {} of {}",
                generation,
                self.identity.path
            );
            return;
        }

        warn!("Reconnecting device {}", self.identity);
        self.spawn_reconnect(generation);
    }

    fn spawn_reconnect(&self, generation: u64) {
        let session = self.self_ref.clone();
        let opener = self.opener.clone();
        let identity = self.identity.clone();
        let schema = self.schema.clone();
        let interval = self.config.reconnect_interval;
        let cancel = self.shutdown.subscribe();
        let span = component_span("device_session", Some(&self.identity.path));

        tokio::spawn(
            async move {
                if let Some(session) = session.upgrade() {
                    if let Some(link) = session.link.write().await.take() {
                        link.retire();
                    }
                }

                let channel = retry_until_cancelled(interval, cancel, || {
                    let opener = opener.clone();
                    let identity = identity.clone();
                    let schema = schema.clone();
                    async move { opener.open(&identity, schema).await }
                })
                .await;

                let Some(channel) = channel else {
                    debug!("Reconnect to {} cancelled", identity);
                    return;
                };
                if let Some(session) = session.upgrade() {
                    session.install(generation, channel).await;
                }
            }
            .instrument(span),
        );
    }

    async fn install(&self, generation: u64, channel: Arc<dyn MessageChannel>) {
        let link = Link::new(generation + 1, channel);

        *self.link.write().await = Some(link.clone());
        if !self.state.transition(
            generation,
            SessionState::Reconnecting,
            link.generation,
            SessionState::Connected,
        ) {
            // Closed while the last attempt was in flight
            if let Some(link) = self.link.write().await.take() {
                link.retire();
            }
            debug!("Discarding reopened channel for {}", self.identity);
            return;
        }

        *self.connected_at.write().await = Some(Utc::now());
        SessionStats::bump(&self.stats.reconnects);
        info!("Reconnected to device {}", self.identity);
        self.spawn_receive_loop(link);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    use crate::args;
    use crate::mock::{eventually, MockOpener};
    use motorlink_core::types::Value;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex as StdMutex;

    const INTERVAL: Duration = Duration::from_millis(20);

    fn schema() -> Arc<CommandSchema> {
        Arc::new(
            CommandSchema::from_pairs(&[("moveMotor", "iff"), ("error", "s"), ("ping", "")])
                .unwrap(),
        )
    }

    fn config() -> SessionConfig {
        SessionConfig {
            reconnect_interval: INTERVAL,
            ..SessionConfig::default()
        }
    }

    fn identity() -> ConnectionIdentity {
        ConnectionIdentity::new("/dev/ttyMOCK0", 9600)
    }

    fn counting_table(counter: Arc<AtomicUsize>) -> Arc<CallbackTable> {
        Arc::new(
            CallbackTable::builder()
                .on("error", move |_session, args| {
                    assert_eq!(args.len(), 1);
                    counter.fetch_add(1, Ordering::SeqCst);
                })
                .build(),
        )
    }

    async fn open_session(
        opener: &Arc<MockOpener>,
        callbacks: Arc<CallbackTable>,
    ) -> Arc<DeviceSession> {
        DeviceSession::open(identity(), schema(), callbacks, opener.clone(), config())
            .await
            .unwrap()
    }

    #[test]
    fn test_state_cell_transitions() {
        let cell = StateCell::new(SessionState::Connecting);
        assert!(cell.transition(0, SessionState::Connecting, 0, SessionState::Connected));
        assert!(!cell.transition(0, SessionState::Connecting, 0, SessionState::Connected));

        assert!(cell.transition(0, SessionState::Connected, 0, SessionState::Reconnecting));
        assert!(cell.transition(0, SessionState::Reconnecting, 1, SessionState::Connected));
        // A failure observed on the old generation is stale
        assert!(!cell.transition(0, SessionState::Connected, 0, SessionState::Reconnecting));
        assert_eq!(cell.load(), (1, SessionState::Connected));

        assert_eq!(cell.close(), SessionState::Connected);
        assert_eq!(cell.close(), SessionState::Closed);
        assert_eq!(cell.load(), (1, SessionState::Closed));
    }

    #[tokio::test]
    async fn test_every_message_dispatched_once() {
        let opener = Arc::new(MockOpener::new());
        let counter = Arc::new(AtomicUsize::new(0));
        let session = open_session(&opener, counting_table(counter.clone())).await;
        let channel = opener.channel(0).unwrap();

        for i in 0..10 {
            channel.push(Message::new("error", vec![Value::from(format!("fault {}", i))]));
        }

        assert!(eventually(|| counter.load(Ordering::SeqCst) == 10).await);
        let stats = session.stats();
        assert_eq!(stats.received, 10);
        assert_eq!(stats.dispatched, 10);
        assert_eq!(stats.unknown_addresses, 0);
    }

    #[tokio::test]
    async fn test_handlers_run_concurrently() {
        let opener = Arc::new(MockOpener::new());
        let (release, _) = tokio::sync::broadcast::channel::<()>(1);
        let started = Arc::new(AtomicUsize::new(0));

        let callbacks = {
            let release = release.clone();
            let started = started.clone();
            CallbackTable::builder()
                .on_async("error", move |_session, _args| {
                    let mut release = release.subscribe();
                    let started = started.clone();
                    async move {
                        started.fetch_add(1, Ordering::SeqCst);
                        let _ = release.recv().await;
                    }
                })
                .build()
        };
        let _session = open_session(&opener, Arc::new(callbacks)).await;
        let channel = opener.channel(0).unwrap();

        channel.push(Message::new("error", vec![Value::from("a")]));
        channel.push(Message::new("error", vec![Value::from("b")]));

        // Both handlers are blocked at the same time
        assert!(eventually(|| started.load(Ordering::SeqCst) == 2).await);
        let _ = release.send(());
    }

    #[tokio::test]
    async fn test_unknown_address_reported_and_loop_continues() {
        let opener = Arc::new(MockOpener::new());
        let counter = Arc::new(AtomicUsize::new(0));
        let session = open_session(&opener, counting_table(counter.clone())).await;
        let channel = opener.channel(0).unwrap();

        channel.push(Message::new("moveMotor", vec![Value::from(1), Value::from(0.5), Value::from(0.5)]));
        channel.push(Message::new("error", vec![Value::from("after")]));

        assert!(eventually(|| counter.load(Ordering::SeqCst) == 1).await);
        assert_eq!(session.stats().unknown_addresses, 1);
        assert_eq!(session.stats().received, 2);
    }

    #[tokio::test]
    async fn test_malformed_frame_is_skipped() {
        let opener = Arc::new(MockOpener::new());
        let counter = Arc::new(AtomicUsize::new(0));
        let session = open_session(&opener, counting_table(counter.clone())).await;
        let channel = opener.channel(0).unwrap();

        channel.push_error(Error::codec("unknown command id 42"));
        channel.push(Message::new("error", vec![Value::from("next")]));

        assert!(eventually(|| counter.load(Ordering::SeqCst) == 1).await);
        assert!(session.is_connected());
        assert_eq!(opener.opened(), 1);
    }

    #[tokio::test]
    async fn test_handler_panic_is_contained() {
        let opener = Arc::new(MockOpener::new());
        let counter = Arc::new(AtomicUsize::new(0));
        let callbacks = {
            let counter = counter.clone();
            CallbackTable::builder()
                .on("ping", |_session, _args| panic!("handler bug"))
                .on("error", move |_session, _args| {
                    counter.fetch_add(1, Ordering::SeqCst);
                })
                .build()
        };
        let session = open_session(&opener, Arc::new(callbacks)).await;
        let channel = opener.channel(0).unwrap();

        channel.push(Message::new("ping", vec![]));
        channel.push(Message::new("error", vec![Value::from("still alive")]));

        assert!(eventually(|| counter.load(Ordering::SeqCst) == 1).await);
        assert!(eventually(|| session.stats().handler_panics == 1).await);
    }

    #[tokio::test]
    async fn test_send_transmits_values_in_order() {
        let opener = Arc::new(MockOpener::new());
        let session = open_session(&opener, Arc::new(CallbackTable::default())).await;

        let delivery = session.send("moveMotor", args![1, 0.5, -0.5]).await.unwrap();
        assert_eq!(delivery, Delivery::Sent);

        let sent = opener.channel(0).unwrap().sent();
        assert_eq!(
            sent,
            vec![Message::new(
                "moveMotor",
                vec![Value::Integer(1), Value::Float(0.5), Value::Float(-0.5)]
            )]
        );
        assert_eq!(session.stats().sent, 1);
    }

    #[tokio::test]
    async fn test_send_rejects_schema_violations() {
        let opener = Arc::new(MockOpener::new());
        let session = open_session(&opener, Arc::new(CallbackTable::default())).await;

        let err = session.send("fly", args![1]).await.unwrap_err();
        assert!(matches!(err, Error::Schema(_)));
        let err = session.send("moveMotor", args![1, 0.5]).await.unwrap_err();
        assert!(matches!(err, Error::Schema(_)));

        assert!(opener.channel(0).unwrap().sent().is_empty());
    }

    #[tokio::test]
    async fn test_initial_open_failure_is_connection_error() {
        let opener = Arc::new(MockOpener::new());
        opener.fail_always(true);

        let err = DeviceSession::open(
            identity(),
            schema(),
            Arc::new(CallbackTable::default()),
            opener.clone(),
            config(),
        )
        .await
        .unwrap_err();

        assert!(matches!(err, Error::Connection { .. }));
        assert_eq!(opener.attempts(), 1);
    }

    #[test_log::test(tokio::test)]
    async fn test_reconnects_after_read_failure() {
        let opener = Arc::new(MockOpener::new());
        let counter = Arc::new(AtomicUsize::new(0));
        let session = open_session(&opener, counting_table(counter.clone())).await;

        opener.fail_next(3);
        let started = Instant::now();
        opener.channel(0).unwrap().fail_read();

        assert!(eventually(|| opener.opened() == 2).await);
        assert!(eventually(|| session.is_connected()).await);
        // Three failed attempts, each followed by one interval
        assert!(started.elapsed() >= INTERVAL * 3);
        assert_eq!(opener.attempts(), 5);
        assert_eq!(session.stats().reconnects, 1);

        opener
            .channel(1)
            .unwrap()
            .push(Message::new("error", vec![Value::from("back")]));
        assert!(eventually(|| counter.load(Ordering::SeqCst) == 1).await);
    }

    #[tokio::test]
    async fn test_concurrent_failures_reconnect_once() {
        let opener = Arc::new(MockOpener::new());
        let session = open_session(&opener, Arc::new(CallbackTable::default())).await;
        let channel = opener.channel(0).unwrap();

        opener.fail_next(2);
        channel.fail_sends(true);
        channel.fail_read();
        let delivery = session.send("error", args!["boom"]).await.unwrap();
        assert_eq!(delivery, Delivery::Dropped);

        assert!(eventually(|| session.is_connected()).await);
        tokio::time::sleep(INTERVAL * 3).await;

        assert_eq!(opener.opened(), 2);
        assert_eq!(session.stats().reconnects, 1);
    }

    #[tokio::test]
    async fn test_single_worker_dispatches_in_read_order() {
        let opener = Arc::new(MockOpener::new());
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let callbacks = {
            let seen = seen.clone();
            CallbackTable::builder()
                .on("error", move |_session, args| {
                    let text = args[0].as_str().unwrap_or_default().to_string();
                    seen.lock().unwrap().push(text);
                })
                .build()
        };
        let config = SessionConfig {
            dispatch_workers: 1,
            ..config()
        };
        let _session =
            DeviceSession::open(identity(), schema(), Arc::new(callbacks), opener.clone(), config)
                .await
                .unwrap();
        let channel = opener.channel(0).unwrap();

        for i in 0..20 {
            channel.push(Message::new("error", vec![Value::from(i.to_string())]));
        }

        assert!(eventually(|| seen.lock().unwrap().len() == 20).await);
        let expected: Vec<String> = (0..20).map(|i| i.to_string()).collect();
        assert_eq!(*seen.lock().unwrap(), expected);
    }

    #[tokio::test]
    async fn test_write_failure_releases_old_channel() {
        let opener = Arc::new(MockOpener::new());
        let session = open_session(&opener, Arc::new(CallbackTable::default())).await;
        let channel = opener.channel(0).unwrap();

        channel.fail_sends(true);
        let delivery = session.send("ping", args![]).await.unwrap();
        assert_eq!(delivery, Delivery::Dropped);
        assert!(eventually(|| opener.opened() == 2 && session.is_connected()).await);

        // Only the opener and this test still hold the first channel
        assert!(eventually(|| Arc::strong_count(&channel) == 2).await);
    }

    #[tokio::test]
    async fn test_close_while_dispatch_queue_full() {
        let opener = Arc::new(MockOpener::new());
        let callbacks = CallbackTable::builder()
            .on_async("error", |_session, _args| std::future::pending::<()>())
            .build();
        let config = SessionConfig {
            dispatch_workers: 1,
            dispatch_queue: 1,
            ..config()
        };
        let session =
            DeviceSession::open(identity(), schema(), Arc::new(callbacks), opener.clone(), config)
                .await
                .unwrap();
        let channel = opener.channel(0).unwrap();

        for i in 0..4 {
            channel.push(Message::new("error", vec![Value::from(i.to_string())]));
        }
        // One handler stuck, one job queued, the third read waits for space
        assert!(eventually(|| session.stats().received == 3).await);

        session.close().await;
        assert!(eventually(|| Arc::strong_count(&channel) == 2).await);
        assert_eq!(session.stats().received, 3);
    }

    #[tokio::test]
    async fn test_send_during_outage_is_dropped_not_replayed() {
        let opener = Arc::new(MockOpener::new());
        let session = open_session(&opener, Arc::new(CallbackTable::default())).await;

        opener.fail_next(5);
        opener.channel(0).unwrap().fail_read();
        assert!(eventually(|| session.state() == SessionState::Reconnecting).await);

        let delivery = session.send("moveMotor", args![2, 1.0, 1.0]).await.unwrap();
        assert_eq!(delivery, Delivery::Dropped);

        assert!(eventually(|| session.is_connected()).await);
        session.send("ping", args![]).await.unwrap();

        let replacement = opener.channel(1).unwrap();
        assert_eq!(replacement.sent(), vec![Message::new("ping", vec![])]);
        assert!(opener.channel(0).unwrap().sent().is_empty());
        assert_eq!(session.stats().dropped, 1);
    }

    #[tokio::test]
    async fn test_close_stops_reconnecting() {
        let opener = Arc::new(MockOpener::new());
        let session = open_session(&opener, Arc::new(CallbackTable::default())).await;

        opener.fail_always(true);
        opener.channel(0).unwrap().fail_read();
        assert!(eventually(|| opener.attempts() >= 3).await);

        session.close().await;
        // Let any in-flight attempt finish
        tokio::time::sleep(INTERVAL * 2).await;
        let attempts = opener.attempts();
        tokio::time::sleep(INTERVAL * 5).await;

        assert_eq!(opener.attempts(), attempts);
        assert_eq!(session.state(), SessionState::Closed);
        assert!(matches!(
            session.send("ping", args![]).await,
            Err(Error::Closed)
        ));
    }

    #[tokio::test]
    async fn test_info_serializes() {
        let opener = Arc::new(MockOpener::new());
        let session = open_session(&opener, Arc::new(CallbackTable::default())).await;

        let info = session.info().await;
        assert_eq!(info.state, SessionState::Connected);
        assert!(info.connected_at.is_some());

        let json = serde_json::to_value(&info).unwrap();
        assert_eq!(json["identity"]["path"], "/dev/ttyMOCK0");
        assert_eq!(json["state"], "Connected");
    }
}
