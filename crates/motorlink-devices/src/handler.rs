/*!
 * Inbound message handlers.
 *
 * A callback table maps addresses to handlers. It is frozen once built and
 * shared read-only by every worker of a session.
 */
use std::collections::HashMap;
use std::fmt::{self, Debug};
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;

use motorlink_core::types::Value;

use crate::session::DeviceSession;

/// Handles messages received on one address
#[async_trait]
pub trait CommandHandler: Send + Sync {
    /// Handle one message
    ///
    /// `session` is the session the message arrived on, so a handler can
    /// reply with `session.send(..)`.
    async fn handle(&self, session: Arc<DeviceSession>, args: Vec<Value>);
}

/// Adapts a plain closure into a [`CommandHandler`]
pub struct FnHandler<F>(F);

#[async_trait]
impl<F> CommandHandler for FnHandler<F>
where
    F: Fn(Arc<DeviceSession>, Vec<Value>) + Send + Sync,
{
    async fn handle(&self, session: Arc<DeviceSession>, args: Vec<Value>) {
        (self.0)(session, args)
    }
}

/// Adapts a closure returning a future into a [`CommandHandler`]
pub struct AsyncFnHandler<F, Fut> {
    f: F,
    _future: PhantomData<fn() -> Fut>,
}

#[async_trait]
impl<F, Fut> CommandHandler for AsyncFnHandler<F, Fut>
where
    F: Fn(Arc<DeviceSession>, Vec<Value>) -> Fut + Send + Sync,
    Fut: Future<Output = ()> + Send,
{
    async fn handle(&self, session: Arc<DeviceSession>, args: Vec<Value>) {
        (self.f)(session, args).await
    }
}

/// Immutable mapping from address to handler
#[derive(Clone, Default)]
pub struct CallbackTable {
    handlers: HashMap<String, Arc<dyn CommandHandler>>,
}

impl CallbackTable {
    /// Start building a table
    pub fn builder() -> CallbackTableBuilder {
        CallbackTableBuilder::default()
    }

    /// Handler registered for `address`
    pub fn get(&self, address: &str) -> Option<Arc<dyn CommandHandler>> {
        self.handlers.get(address).cloned()
    }

    /// Whether `address` has a handler
    pub fn contains(&self, address: &str) -> bool {
        self.handlers.contains_key(address)
    }

    /// Registered addresses
    pub fn addresses(&self) -> impl Iterator<Item = &str> {
        self.handlers.keys().map(String::as_str)
    }

    /// Number of handlers
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    /// Whether the table is empty
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl Debug for CallbackTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut addresses: Vec<&str> = self.addresses().collect();
        addresses.sort_unstable();
        f.debug_struct("CallbackTable")
            .field("addresses", &addresses)
            .finish()
    }
}

/// Builder for [`CallbackTable`]
#[derive(Default)]
pub struct CallbackTableBuilder {
    handlers: HashMap<String, Arc<dyn CommandHandler>>,
}

impl CallbackTableBuilder {
    /// Register a synchronous closure; keep it short, it runs on a worker
    pub fn on<A, F>(self, address: A, f: F) -> Self
    where
        A: Into<String>,
        F: Fn(Arc<DeviceSession>, Vec<Value>) + Send + Sync + 'static,
    {
        self.handler(address, FnHandler(f))
    }

    /// Register an async closure
    pub fn on_async<A, F, Fut>(self, address: A, f: F) -> Self
    where
        A: Into<String>,
        F: Fn(Arc<DeviceSession>, Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.handler(
            address,
            AsyncFnHandler {
                f,
                _future: PhantomData,
            },
        )
    }

    /// Register any [`CommandHandler`]; a later registration replaces an earlier one
    pub fn handler<A, H>(mut self, address: A, handler: H) -> Self
    where
        A: Into<String>,
        H: CommandHandler + 'static,
    {
        self.handlers.insert(address.into(), Arc::new(handler));
        self
    }

    /// Freeze the table
    pub fn build(self) -> CallbackTable {
        CallbackTable {
            handlers: self.handlers,
        }
    }
}
