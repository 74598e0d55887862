/*!
 * Scripted channel and opener for session and registry tests.
 */
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};

use motorlink_core::error::{Error, Result};
use motorlink_core::types::Value;
use motorlink_core::utils::with_timeout;

use crate::channel::{ChannelOpener, ConnectionIdentity, MessageChannel};
use crate::message::Message;
use crate::schema::CommandSchema;

/// A channel fed by the test instead of a wire
#[derive(Debug)]
pub(crate) struct MockChannel {
    inbound: mpsc::UnboundedSender<Result<Message>>,
    receiver: Mutex<mpsc::UnboundedReceiver<Result<Message>>>,
    sent: StdMutex<Vec<Message>>,
    fail_sends: AtomicBool,
}

impl MockChannel {
    fn new() -> Self {
        let (inbound, receiver) = mpsc::unbounded_channel();
        Self {
            inbound,
            receiver: Mutex::new(receiver),
            sent: StdMutex::new(Vec::new()),
            fail_sends: AtomicBool::new(false),
        }
    }

    /// Deliver a message to the next `receive`
    pub(crate) fn push(&self, message: Message) {
        let _ = self.inbound.send(Ok(message));
    }

    /// Make a later `receive` fail with `error`
    pub(crate) fn push_error(&self, error: Error) {
        let _ = self.inbound.send(Err(error));
    }

    /// Make a later `receive` fail as if the device was unplugged
    pub(crate) fn fail_read(&self) {
        self.push_error(Error::transport("mock read failure"));
    }

    /// Make every `send` fail
    pub(crate) fn fail_sends(&self, fail: bool) {
        self.fail_sends.store(fail, Ordering::SeqCst);
    }

    /// Everything written so far
    pub(crate) fn sent(&self) -> Vec<Message> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl MessageChannel for MockChannel {
    async fn send(&self, address: &str, args: &[Value]) -> Result<()> {
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(Error::transport("mock write failure"));
        }
        self.sent
            .lock()
            .unwrap()
            .push(Message::new(address, args.to_vec()));
        Ok(())
    }

    async fn receive(&self) -> Result<Option<Message>> {
        match self.receiver.lock().await.recv().await {
            Some(item) => item.map(Some),
            None => Ok(None),
        }
    }
}

/// Opens [`MockChannel`]s and records every attempt
#[derive(Debug, Default)]
pub(crate) struct MockOpener {
    attempts: AtomicUsize,
    fail_next: AtomicUsize,
    fail_always: AtomicBool,
    channels: StdMutex<Vec<Arc<MockChannel>>>,
}

impl MockOpener {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Fail the next `count` open attempts
    pub(crate) fn fail_next(&self, count: usize) {
        self.fail_next.store(count, Ordering::SeqCst);
    }

    /// Fail every open attempt while set
    pub(crate) fn fail_always(&self, fail: bool) {
        self.fail_always.store(fail, Ordering::SeqCst);
    }

    /// Open attempts, successful or not
    pub(crate) fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Successful opens
    pub(crate) fn opened(&self) -> usize {
        self.channels.lock().unwrap().len()
    }

    /// The `index`th channel opened
    pub(crate) fn channel(&self, index: usize) -> Option<Arc<MockChannel>> {
        self.channels.lock().unwrap().get(index).cloned()
    }
}

#[async_trait]
impl ChannelOpener for MockOpener {
    async fn open(
        &self,
        identity: &ConnectionIdentity,
        _schema: Arc<CommandSchema>,
    ) -> Result<Arc<dyn MessageChannel>> {
        self.attempts.fetch_add(1, Ordering::SeqCst);

        let scripted_failure = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if scripted_failure || self.fail_always.load(Ordering::SeqCst) {
            return Err(Error::connection(&identity.path, "mock open failure"));
        }

        let channel = Arc::new(MockChannel::new());
        self.channels.lock().unwrap().push(channel.clone());
        Ok(channel)
    }
}

/// Poll `condition` until it holds, giving up after two seconds
pub(crate) async fn eventually<F: FnMut() -> bool>(mut condition: F) -> bool {
    with_timeout(Duration::from_secs(2), async {
        loop {
            if condition() {
                return Ok(());
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .is_ok()
}
