//! Ownership and repair of the link to a broker
//!
//! A [`ConnectionManager`] owns exactly one connection and one channel. Every operation asks it for the
//! channel and it transparently re-establishes the link when it finds it closed. Reconnecting happens
//! while holding an async mutex so that callers observing the same closed link queue up behind a single
//! reconnect attempt instead of racing each other. The setup routine passed by the caller (usually the
//! declaration of a [`Topology`](super::topology::Topology)) runs on the fresh channel before the lock is
//! released, thus nobody gets to use the link before the topology exists again.

mod state;

pub use state::ConnectionState;

use super::super::helpers::RetryPolicy;
use super::super::{BoxedError, EmptyResult};
use super::broker::{Broker, BrokerChannel, BrokerConnection, ChannelOf};
use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use thiserror::Error;
use tokio::sync::{watch, Mutex};
use tracing::{debug, error, info, instrument, warn};

/// Errors that may occur while acquiring the link to the broker
#[derive(Error, Debug)]
pub enum ConnectionError {
    /// Every attempt permitted by the retry policy failed
    #[error("unable to connect to the broker after {attempts} attempts")]
    Exhausted {
        /// Number of attempts that have been made
        attempts: u32,
        /// Failure of the last attempt
        #[source]
        source: BoxedError,
    },
    /// The manager has been stopped
    #[error("broker connection has been closed")]
    Closed,
    /// The link is up but consuming from a queue was refused
    #[error("unable to consume queue '{queue}'")]
    Consume {
        /// Queue that could not be consumed
        queue: String,
        /// Failure reported by the broker
        #[source]
        source: BoxedError,
    },
}

struct Link<C: BrokerConnection> {
    connection: C,
    channel: C::Channel,
}

impl<C: BrokerConnection> Link<C> {
    fn is_open(&self) -> bool {
        self.connection.is_open() && self.channel.is_open()
    }
}

/// Shared, self-repairing link to a [`Broker`]
pub struct ConnectionManager<B: Broker> {
    broker: B,
    policy: RetryPolicy,
    link: Mutex<Option<Link<B::Connection>>>,
    state: watch::Sender<ConnectionState>,
    attempts: AtomicU32,
}

impl<B: Broker> ConnectionManager<B> {
    /// Creates a new, disconnected instance
    pub fn new(broker: B, policy: RetryPolicy) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);

        Self {
            broker,
            policy,
            link: Mutex::new(None),
            state,
            attempts: AtomicU32::new(0),
        }
    }

    /// Current state of the link
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Number of the connection attempt currently in progress, zero once connected
    pub fn reconnect_attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Retry policy used while establishing the link
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Underlying broker
    pub fn broker(&self) -> &B {
        &self.broker
    }

    /// Establishes the link unless it is already up
    pub async fn connect<F, Fut>(&self, setup: F) -> Result<(), ConnectionError>
    where
        F: Fn(ChannelOf<B>) -> Fut + Send + Sync,
        Fut: Future<Output = EmptyResult> + Send,
    {
        self.channel(setup).await.map(|_| ())
    }

    /// Returns the live channel, reconnecting and running `setup` on the new channel if the link is down
    ///
    /// A failing `setup` counts as a failed connection attempt.
    #[instrument(skip(self, setup))]
    pub async fn channel<F, Fut>(&self, setup: F) -> Result<ChannelOf<B>, ConnectionError>
    where
        F: Fn(ChannelOf<B>) -> Fut + Send + Sync,
        Fut: Future<Output = EmptyResult> + Send,
    {
        let mut link = self.link.lock().await;

        if self.state().is_terminal() {
            return Err(ConnectionError::Closed);
        }

        if let Some(existing) = link.as_ref() {
            if existing.is_open() {
                return Ok(existing.channel.clone());
            }

            warn!("Broker link has been lost, reconnecting");
            self.state.send_replace(ConnectionState::Disconnected);
        }

        *link = None;
        self.state.send_replace(ConnectionState::Connecting);

        let setup = &setup;
        let result = self
            .policy
            .retry(move |attempt| {
                self.attempts.store(attempt, Ordering::SeqCst);
                self.open(setup)
            })
            .await;

        match result {
            Ok(established) => {
                self.attempts.store(0, Ordering::SeqCst);
                self.state.send_replace(ConnectionState::Connected);
                info!("Connected to broker");

                let channel = established.channel.clone();
                *link = Some(established);
                Ok(channel)
            }
            Err(exhausted) => {
                self.state.send_replace(ConnectionState::Disconnected);
                error!(attempts = exhausted.attempts, error = %exhausted.last_error, "Unable to connect to broker");

                Err(ConnectionError::Exhausted {
                    attempts: exhausted.attempts,
                    source: exhausted.last_error,
                })
            }
        }
    }

    async fn open<F, Fut>(&self, setup: &F) -> Result<Link<B::Connection>, BoxedError>
    where
        F: Fn(ChannelOf<B>) -> Fut,
        Fut: Future<Output = EmptyResult>,
    {
        let connection = self.broker.connect().await?;

        let prepared = async {
            let channel = connection.channel().await?;
            setup(channel.clone()).await?;
            Ok::<_, BoxedError>(channel)
        }
        .await;

        match prepared {
            Ok(channel) => Ok(Link {
                connection,
                channel,
            }),
            Err(error) => {
                if let Err(close_error) = connection.close().await {
                    debug!(error = %close_error, "Failed to close half-established connection");
                }

                Err(error)
            }
        }
    }

    /// Closes the channel and the connection, errors while doing so are only logged
    ///
    /// Afterwards, every attempt to acquire the channel fails with [`ConnectionError::Closed`].
    #[instrument(skip(self))]
    pub async fn stop(&self) {
        let mut link = self.link.lock().await;
        self.state.send_replace(ConnectionState::Closing);

        if let Some(link) = link.take() {
            if let Err(error) = link.channel.close().await {
                warn!(%error, "Failed to close channel");
            }

            if let Err(error) = link.connection.close().await {
                warn!(%error, "Failed to close connection");
            }
        }

        self.state.send_replace(ConnectionState::Closed);
        info!("Broker connection closed");
    }
}
