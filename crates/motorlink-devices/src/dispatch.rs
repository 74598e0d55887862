/*!
 * Handler dispatch.
 *
 * The receive loop enqueues jobs in read order on a bounded queue. A small pool
 * of workers drains it, running every handler call in its own task so a
 * panicking handler only costs that one message.
 */
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex as StdMutex, Weak};

use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error};

use motorlink_core::types::Value;

use crate::handler::CommandHandler;
use crate::session::{DeviceSession, SessionStats};

/// One handler invocation waiting for a worker
pub(crate) struct Job {
    pub(crate) address: String,
    pub(crate) handler: Arc<dyn CommandHandler>,
    pub(crate) args: Vec<Value>,
}

/// Bounded queue plus worker pool owned by one session
pub(crate) struct Dispatcher {
    sender: StdMutex<Option<mpsc::Sender<Job>>>,
    workers: Vec<JoinHandle<()>>,
}

impl Dispatcher {
    /// Spawn `workers` tasks draining a queue of `capacity` jobs
    pub(crate) fn start(
        workers: usize,
        capacity: usize,
        session: Weak<DeviceSession>,
        stats: Arc<SessionStats>,
    ) -> Self {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        let receiver = Arc::new(Mutex::new(receiver));

        let workers = (0..workers.max(1))
            .map(|index| {
                let receiver = receiver.clone();
                let session = session.clone();
                let stats = stats.clone();
                tokio::spawn(worker(index, receiver, session, stats))
            })
            .collect();

        Self {
            sender: StdMutex::new(Some(sender)),
            workers,
        }
    }

    /// A handle for enqueueing jobs, or `None` once stopped
    pub(crate) fn sender(&self) -> Option<mpsc::Sender<Job>> {
        self.sender.lock().ok().and_then(|guard| guard.clone())
    }

    /// Stop accepting jobs; queued jobs still run
    pub(crate) fn stop(&self) {
        if let Ok(mut guard) = self.sender.lock() {
            guard.take();
        }
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        for worker in &self.workers {
            worker.abort();
        }
    }
}

async fn worker(
    index: usize,
    receiver: Arc<Mutex<mpsc::Receiver<Job>>>,
    session: Weak<DeviceSession>,
    stats: Arc<SessionStats>,
) {
    loop {
        let job = receiver.lock().await.recv().await;
        let Some(job) = job else { break };
        let Some(session) = session.upgrade() else { break };

        stats.dispatched.fetch_add(1, Ordering::Relaxed);
        let Job {
            address,
            handler,
            args,
        } = job;

        let task = tokio::spawn(async move { handler.handle(session, args).await });
        if let Err(e) = task.await {
            if e.is_panic() {
                stats.handler_panics.fetch_add(1, Ordering::Relaxed);
                error!("Handler for {} panicked", address);
            }
        }
    }

    debug!("Dispatch worker {} stopped", index);
}
