use super::super::broker::Envelope;
use super::{CorrelationId, RpcError};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::timeout;
use tracing::trace;

#[derive(Default)]
struct Registry {
    waiters: HashMap<CorrelationId, oneshot::Sender<Envelope>>,
    closed: bool,
}

/// Mapping from correlation ids to the callers waiting for a response
///
/// The lock is never held across an await point. Each entry is resolved at most once: resolving removes
/// it and dropping the [`Waiter`] removes it as well, regardless of how the call ended.
#[derive(Default)]
pub struct PendingRequests {
    registry: Mutex<Registry>,
}

impl PendingRequests {
    /// Creates a new, empty instance
    pub fn new() -> Self {
        Self::default()
    }

    fn registry(&self) -> MutexGuard<'_, Registry> {
        self.registry
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Registers a waiter for the given id
    ///
    /// Fails if the id is already outstanding or the registry has been closed.
    pub fn register(self: &Arc<Self>, id: CorrelationId) -> Result<Waiter, RpcError> {
        let mut registry = self.registry();

        if registry.closed {
            return Err(RpcError::Cancelled);
        }

        if registry.waiters.contains_key(&id) {
            return Err(RpcError::DuplicateCorrelation(id));
        }

        let (sender, receiver) = oneshot::channel();
        registry.waiters.insert(id.clone(), sender);

        Ok(Waiter {
            id,
            receiver,
            pending: self.clone(),
        })
    }

    /// Hands a response to the matching waiter, returns `false` if nobody waits for it
    pub fn resolve(&self, id: &str, reply: Envelope) -> bool {
        let sender = self.registry().waiters.remove(id);

        match sender {
            Some(sender) => sender.send(reply).is_ok(),
            None => false,
        }
    }

    /// Cancels every outstanding waiter and refuses future registrations
    pub fn close(&self) -> usize {
        let cancelled: Vec<_> = {
            let mut registry = self.registry();
            registry.closed = true;
            registry.waiters.drain().collect()
        };

        cancelled.len()
    }

    /// Number of outstanding waiters
    pub fn len(&self) -> usize {
        self.registry().waiters.len()
    }

    /// Whether no waiter is outstanding
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn remove(&self, id: &str) {
        if self.registry().waiters.remove(id).is_some() {
            trace!(correlation_id = id, "Released waiter");
        }
    }
}

/// Handle on a registered correlation id, removes its entry when dropped
pub struct Waiter {
    id: CorrelationId,
    receiver: oneshot::Receiver<Envelope>,
    pending: Arc<PendingRequests>,
}

impl Waiter {
    /// Correlation id this waiter is registered for
    pub fn id(&self) -> &CorrelationId {
        &self.id
    }

    /// Suspends until the response arrives, the waiter is cancelled or the timeout elapses
    pub async fn wait(mut self, duration: Duration) -> Result<Envelope, RpcError> {
        match timeout(duration, &mut self.receiver).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(RpcError::Cancelled),
            Err(_) => Err(RpcError::Timeout(duration)),
        }
    }
}

impl Drop for Waiter {
    fn drop(&mut self) {
        self.pending.remove(self.id.as_str());
    }
}
