use super::MemoryBrokerError;
use crate::library::communication::broker::{
    Envelope, ExchangeDescriptor, ExchangeKind, QueueDescriptor,
};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tracing::trace;
use uuid::Uuid;

/// Identifies the connection owning exclusive queues
pub(super) type ConnectionId = u64;

struct Binding {
    queue: String,
    key: String,
}

struct Exchange {
    kind: ExchangeKind,
    durable: bool,
    bindings: Vec<Binding>,
}

/// Message sitting in a queue
#[derive(Clone)]
pub(super) struct Stored {
    pub(super) envelope: Envelope,
    pub(super) routing_key: String,
    expires_at: Option<Instant>,
}

impl Stored {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.map(|at| at <= now).unwrap_or(false)
    }
}

struct Queue {
    durable: bool,
    exclusive: bool,
    auto_delete: bool,
    owner: Option<ConnectionId>,
    message_ttl: Option<Duration>,
    dead_letter_exchange: Option<String>,
    messages: VecDeque<Stored>,
    consumers: usize,
    notify: Arc<Notify>,
}

impl Queue {
    fn push_back(&mut self, envelope: Envelope, routing_key: &str, now: Instant) {
        let ttl = match (self.message_ttl, envelope.properties.expiration) {
            (Some(queue), Some(message)) => Some(queue.min(message)),
            (queue, message) => queue.or(message),
        };

        self.messages.push_back(Stored {
            envelope,
            routing_key: routing_key.to_owned(),
            expires_at: ttl.map(|ttl| now + ttl),
        });
        self.notify.notify_one();
    }

    fn take_expired(&mut self, now: Instant) -> Vec<Stored> {
        let (expired, alive): (Vec<_>, Vec<_>) = self
            .messages
            .drain(..)
            .partition(|message| message.is_expired(now));

        self.messages = alive.into();
        expired
    }

    fn is_equivalent(&self, descriptor: &QueueDescriptor) -> bool {
        self.durable == descriptor.durable
            && self.exclusive == descriptor.exclusive
            && self.auto_delete == descriptor.auto_delete
            && self.message_ttl == descriptor.message_ttl
            && self.dead_letter_exchange == descriptor.dead_letter_exchange
    }

    fn check_access(&self, name: &str, connection: ConnectionId) -> Result<(), MemoryBrokerError> {
        match self.owner {
            Some(owner) if owner != connection => {
                Err(MemoryBrokerError::ResourceLocked(name.to_owned()))
            }
            _ => Ok(()),
        }
    }
}

/// Exchanges and queues of an in-memory broker
#[derive(Default)]
pub(super) struct State {
    exchanges: HashMap<String, Exchange>,
    queues: HashMap<String, Queue>,
}

impl State {
    pub(super) fn declare_exchange(
        &mut self,
        descriptor: &ExchangeDescriptor,
    ) -> Result<(), MemoryBrokerError> {
        if let Some(existing) = self.exchanges.get(&descriptor.name) {
            if existing.kind != descriptor.kind || existing.durable != descriptor.durable {
                return Err(MemoryBrokerError::PreconditionFailed(format!(
                    "inequivalent arguments for exchange '{}'",
                    descriptor.name
                )));
            }

            return Ok(());
        }

        self.exchanges.insert(
            descriptor.name.clone(),
            Exchange {
                kind: descriptor.kind,
                durable: descriptor.durable,
                bindings: Vec::new(),
            },
        );

        Ok(())
    }

    pub(super) fn declare_queue(
        &mut self,
        descriptor: &QueueDescriptor,
        connection: ConnectionId,
    ) -> Result<String, MemoryBrokerError> {
        let name = descriptor
            .name
            .clone()
            .unwrap_or_else(|| format!("amq.gen-{}", Uuid::new_v4()));

        if let Some(existing) = self.queues.get(&name) {
            existing.check_access(&name, connection)?;

            if !existing.is_equivalent(descriptor) {
                return Err(MemoryBrokerError::PreconditionFailed(format!(
                    "inequivalent arguments for queue '{}'",
                    name
                )));
            }

            return Ok(name);
        }

        self.queues.insert(
            name.clone(),
            Queue {
                durable: descriptor.durable,
                exclusive: descriptor.exclusive,
                auto_delete: descriptor.auto_delete,
                owner: descriptor.exclusive.then(|| connection),
                message_ttl: descriptor.message_ttl,
                dead_letter_exchange: descriptor.dead_letter_exchange.clone(),
                messages: VecDeque::new(),
                consumers: 0,
                notify: Arc::new(Notify::new()),
            },
        );

        Ok(name)
    }

    pub(super) fn bind(
        &mut self,
        queue: &str,
        exchange: &str,
        key: &str,
        connection: ConnectionId,
    ) -> Result<(), MemoryBrokerError> {
        self.queues
            .get(queue)
            .ok_or_else(|| MemoryBrokerError::queue_not_found(queue))?
            .check_access(queue, connection)?;

        let exchange = self
            .exchanges
            .get_mut(exchange)
            .ok_or_else(|| MemoryBrokerError::exchange_not_found(exchange))?;

        let exists = exchange
            .bindings
            .iter()
            .any(|binding| binding.queue == queue && binding.key == key);

        if !exists {
            exchange.bindings.push(Binding {
                queue: queue.to_owned(),
                key: key.to_owned(),
            });
        }

        Ok(())
    }

    /// Routes a message to every matching queue and returns how many received it
    pub(super) fn publish(
        &mut self,
        exchange: &str,
        routing_key: &str,
        envelope: &Envelope,
    ) -> Result<usize, MemoryBrokerError> {
        let exchange_ref = self
            .exchanges
            .get(exchange)
            .ok_or_else(|| MemoryBrokerError::exchange_not_found(exchange))?;

        let mut targets: Vec<String> = exchange_ref
            .bindings
            .iter()
            .filter(|binding| exchange_ref.kind.routes(&binding.key, routing_key))
            .map(|binding| binding.queue.clone())
            .collect();
        targets.sort();
        targets.dedup();

        let now = Instant::now();
        let mut routed = 0;

        for name in targets {
            if let Some(queue) = self.queues.get_mut(&name) {
                queue.push_back(envelope.clone(), routing_key, now);
                routed += 1;
            }
        }

        trace!(exchange, routing_key, routed, "Routed message");
        Ok(routed)
    }

    pub(super) fn subscribe(
        &mut self,
        queue: &str,
        connection: ConnectionId,
    ) -> Result<Arc<Notify>, MemoryBrokerError> {
        let queue_ref = self
            .queues
            .get_mut(queue)
            .ok_or_else(|| MemoryBrokerError::queue_not_found(queue))?;

        queue_ref.check_access(queue, connection)?;
        queue_ref.consumers += 1;

        Ok(queue_ref.notify.clone())
    }

    pub(super) fn unsubscribe(&mut self, queue: &str) {
        let delete = match self.queues.get_mut(queue) {
            Some(queue) => {
                queue.consumers = queue.consumers.saturating_sub(1);
                queue.consumers == 0 && queue.auto_delete
            }
            None => false,
        };

        if delete {
            self.delete_queue(queue);
        }
    }

    /// Takes the next live message, dead-lettering expired ones on the way
    pub(super) fn pop(&mut self, queue: &str) -> Result<Option<Stored>, MemoryBrokerError> {
        let now = Instant::now();
        let queue_ref = self
            .queues
            .get_mut(queue)
            .ok_or_else(|| MemoryBrokerError::queue_not_found(queue))?;

        let mut expired = Vec::new();
        let next = loop {
            match queue_ref.messages.pop_front() {
                Some(message) if message.is_expired(now) => expired.push(message),
                other => break other,
            }
        };

        let dead_letter_exchange = queue_ref.dead_letter_exchange.clone();
        self.dead_letter(dead_letter_exchange, expired);

        Ok(next)
    }

    /// Puts an unsettled message back at the head of its queue
    pub(super) fn requeue(&mut self, queue: &str, message: Stored) {
        if let Some(queue) = self.queues.get_mut(queue) {
            queue.messages.push_front(message);
            queue.notify.notify_one();
        }
    }

    /// Routes a rejected message to the dead-letter exchange of its queue, if any
    pub(super) fn reject(&mut self, queue: &str, message: Stored) {
        let dead_letter_exchange = self
            .queues
            .get(queue)
            .and_then(|queue| queue.dead_letter_exchange.clone());

        self.dead_letter(dead_letter_exchange, vec![message]);
    }

    fn dead_letter(&mut self, exchange: Option<String>, messages: Vec<Stored>) {
        let exchange = match exchange {
            Some(exchange) => exchange,
            None => return,
        };

        for mut message in messages {
            message.envelope.properties.expiration = None;

            if let Err(error) = self.publish(&exchange, &message.routing_key, &message.envelope) {
                trace!(%error, "Dropping dead-lettered message");
            }
        }
    }

    /// Number of live messages in a queue
    pub(super) fn depth(&mut self, queue: &str) -> Option<usize> {
        let queue_ref = self.queues.get_mut(queue)?;
        let expired = queue_ref.take_expired(Instant::now());
        let dead_letter_exchange = queue_ref.dead_letter_exchange.clone();
        let depth = queue_ref.messages.len();

        self.dead_letter(dead_letter_exchange, expired);
        Some(depth)
    }

    pub(super) fn has_queue(&self, queue: &str) -> bool {
        self.queues.contains_key(queue)
    }

    pub(super) fn consumer_count(&self, queue: &str) -> Option<usize> {
        self.queues.get(queue).map(|queue| queue.consumers)
    }

    /// Removes every exclusive queue owned by the given connection
    pub(super) fn release(&mut self, connection: ConnectionId) {
        let owned: Vec<String> = self
            .queues
            .iter()
            .filter(|(_, queue)| queue.owner == Some(connection))
            .map(|(name, _)| name.clone())
            .collect();

        for name in owned {
            self.delete_queue(&name);
        }
    }

    fn delete_queue(&mut self, name: &str) {
        if let Some(queue) = self.queues.remove(name) {
            queue.notify.notify_waiters();
            trace!(queue = name, "Deleted queue");
        }

        for exchange in self.exchanges.values_mut() {
            exchange.bindings.retain(|binding| binding.queue != name);
        }
    }
}
