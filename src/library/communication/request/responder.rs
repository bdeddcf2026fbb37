use super::super::broker::{
    Broker, BrokerChannel, ChannelOf, ConsumeOptions, Delivery, DeliveryOf, DeliveryStream,
    Envelope, RawDelivery,
};
use super::super::connection::{ConnectionError, ConnectionManager, ConnectionState};
use super::super::implementation::json::json_envelope;
use super::super::topology::Topology;
use super::super::BlackboxError;
use super::{RemoteError, ERROR_CONTENT_TYPE};
use crate::library::helpers::RetryPolicy;
use crate::library::{BoxedError, EmptyResult};
use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::{FutureExt, StreamExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, error, info, instrument, warn, Span};
use uuid::Uuid;

/// Structure which processes requests and produces responses
#[async_trait]
pub trait RequestProcessor: Send + Sync + 'static {
    /// Type of request to process
    type Request: DeserializeOwned + Send;
    /// Type of response produced
    type Response: Serialize + Send;

    /// Handler for requests, returning a response
    async fn process(&self, request: Self::Request) -> Result<Self::Response, BoxedError>;
}

/// Tuning parameters of an [`RpcServer`]
#[derive(Debug, Clone)]
pub struct ServerOptions {
    /// Number of requests processed at once, also used as broker prefetch
    pub concurrency: u16,
    /// Prefix of the consumer tag
    pub consumer_tag: String,
    /// Retry policy used while (re-)establishing the broker link
    pub policy: RetryPolicy,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            concurrency: 10,
            consumer_tag: "courier-server".into(),
            policy: RetryPolicy::default(),
        }
    }
}

struct Inner<B: Broker + 'static, P: RequestProcessor> {
    topology: Arc<Topology>,
    manager: ConnectionManager<B>,
    processor: P,
    options: ServerOptions,
}

/// Responding side of a remote procedure call
///
/// Consumes the request queue of a [`Topology`], hands each request to a [`RequestProcessor`] and
/// routes the result back to the reply destination of the request. Every request is settled exactly
/// once: it is acknowledged after processing or rejected into the dead-letter queue when it can not
/// be decoded. Failures of the processor, including panics, are reported back as [`RemoteError`]s.
pub struct RpcServer<B: Broker + 'static, P: RequestProcessor> {
    inner: Arc<Inner<B, P>>,
    shutdown: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl<B: Broker + 'static, P: RequestProcessor> RpcServer<B, P> {
    /// Creates a new, stopped server
    pub fn new(broker: B, topology: Topology, processor: P, options: ServerOptions) -> Self {
        let (shutdown, _) = watch::channel(false);

        Self {
            inner: Arc::new(Inner {
                topology: Arc::new(topology),
                manager: ConnectionManager::new(broker, options.policy),
                processor,
                options,
            }),
            shutdown,
            task: Mutex::new(None),
        }
    }

    /// Topology requests are consumed from
    pub fn topology(&self) -> &Topology {
        &self.inner.topology
    }

    /// State of the broker link
    pub fn state(&self) -> ConnectionState {
        self.inner.manager.state()
    }

    /// Declares the topology and starts consuming requests in the background
    ///
    /// Returns once the request queue is being consumed. Fails if the broker can not be reached or
    /// refuses the consumer. Once started, lost links are repaired in the background.
    #[instrument(skip(self), fields(queue = %self.inner.topology.queue()))]
    pub async fn start(&self) -> Result<(), ConnectionError> {
        if self.task.lock().unwrap_or_else(|p| p.into_inner()).is_some() {
            warn!("Server has already been started");
            return Ok(());
        }

        let channel = self.inner.manager.channel(self.inner.setup()).await?;
        let deliveries =
            self.inner
                .consume(&channel)
                .await
                .map_err(|source| ConnectionError::Consume {
                    queue: self.inner.topology.queue().to_owned(),
                    source,
                })?;

        let mut task = self.task.lock().unwrap_or_else(|p| p.into_inner());
        if task.is_some() {
            warn!("Server has already been started");
            return Ok(());
        }

        *task = Some(tokio::spawn(self.inner.clone().serve(
            self.shutdown.subscribe(),
            Some((channel, deliveries)),
        )));

        info!("Consuming requests");
        Ok(())
    }

    /// Stops consuming, waits for in-flight requests to be settled and closes the link
    #[instrument(skip(self))]
    pub async fn stop(&self) {
        self.shutdown.send_replace(true);

        let task = self.task.lock().unwrap_or_else(|p| p.into_inner()).take();
        if let Some(task) = task {
            if let Err(error) = task.await {
                error!(%error, "Request consumer terminated abnormally");
            }
        }

        self.inner.manager.stop().await;
        info!("Server stopped");
    }
}

async fn shutdown_requested(mut shutdown: watch::Receiver<bool>) {
    while !*shutdown.borrow() {
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_owned()
    }
}

impl<B: Broker + 'static, P: RequestProcessor> Inner<B, P> {
    fn setup(&self) -> impl Fn(ChannelOf<B>) -> BoxFuture<'static, EmptyResult> + Send + Sync {
        let topology = self.topology.clone();
        let prefetch = self.options.concurrency;

        move |channel| {
            let topology = topology.clone();

            async move {
                topology.declare_requests(&channel).await?;
                channel.set_prefetch(prefetch).await
            }
            .boxed()
        }
    }

    /// Waits for the given duration, returns `false` if a shutdown has been requested meanwhile
    async fn pause(&self, shutdown: &watch::Receiver<bool>) -> bool {
        tokio::select! {
            _ = sleep(self.manager.policy().delay()) => true,
            _ = shutdown_requested(shutdown.clone()) => false,
        }
    }

    async fn consume(
        &self,
        channel: &ChannelOf<B>,
    ) -> Result<DeliveryStream<DeliveryOf<B>>, BoxedError> {
        let tag = format!("{}-{}", self.options.consumer_tag, Uuid::new_v4());
        channel
            .consume(self.topology.queue(), ConsumeOptions::manual_ack(tag))
            .await
    }

    /// Processes deliveries until shutdown, re-subscribing whenever the request stream ends
    ///
    /// The first subscription is established by [`RpcServer::start`] and handed in as `initial`.
    async fn serve(
        self: Arc<Self>,
        shutdown: watch::Receiver<bool>,
        mut initial: Option<(ChannelOf<B>, DeliveryStream<DeliveryOf<B>>)>,
    ) {
        let concurrency = usize::from(self.options.concurrency.max(1));

        loop {
            if *shutdown.borrow() {
                break;
            }

            let (channel, deliveries) = match initial.take() {
                Some(subscription) => subscription,
                None => {
                    let acquired = tokio::select! {
                        result = self.manager.channel(self.setup()) => result,
                        _ = shutdown_requested(shutdown.clone()) => break,
                    };

                    let channel = match acquired {
                        Ok(channel) => channel,
                        Err(ConnectionError::Closed) => break,
                        Err(error) => {
                            error!(%error, "Unable to re-establish broker link");

                            if self.pause(&shutdown).await {
                                continue;
                            } else {
                                break;
                            }
                        }
                    };

                    match self.consume(&channel).await {
                        Ok(deliveries) => (channel, deliveries),
                        Err(error) => {
                            warn!(%error, "Unable to consume request queue");

                            if self.pause(&shutdown).await {
                                continue;
                            } else {
                                break;
                            }
                        }
                    }
                }
            };

            let this = &*self;
            let channel = &channel;
            deliveries
                .take_until(shutdown_requested(shutdown.clone()))
                .for_each_concurrent(concurrency, |delivery| async move {
                    match delivery {
                        Ok(delivery) => this.handle(channel, delivery).await,
                        Err(error) => warn!(%error, "Failed to receive request"),
                    }
                })
                .await;

            if *shutdown.borrow() {
                break;
            }

            warn!("Request stream ended, resuming consumption");
        }

        debug!("Request consumer terminated");
    }

    #[instrument(
        skip(self, channel, delivery),
        fields(routing_key = %delivery.routing_key(), correlation_id, reply_to)
    )]
    async fn handle(&self, channel: &ChannelOf<B>, delivery: DeliveryOf<B>) {
        let properties = delivery.properties().clone();
        let span = Span::current();

        if let Some(correlation_id) = &properties.correlation_id {
            span.record("correlation_id", &correlation_id.as_str());
        }

        let reply_to = match properties.reply_to {
            Some(reply_to) => {
                span.record("reply_to", &reply_to.as_str());
                reply_to
            }
            None => {
                warn!("Dropping request without reply destination");
                settle(delivery.ack().await);
                return;
            }
        };

        let (reply, decodable) = match delivery.parse_payload::<P::Request>() {
            Ok(request) => (self.process(request).await, true),
            Err(error) => {
                warn!(%error, "Rejecting undecodable request");
                let causes = BlackboxError::from_boxed(error).context("unable to decode request");
                (Err(RemoteError::protocol(causes)), false)
            }
        };

        match encode(reply) {
            Ok(envelope) => {
                let mut envelope = envelope.with_expiration(self.topology.response_ttl());
                if let Some(correlation_id) = properties.correlation_id {
                    envelope = envelope.with_correlation_id(correlation_id);
                }

                let published = channel
                    .publish(
                        &self.topology.reply_exchange(),
                        &self.topology.reply_routing_key(&reply_to),
                        envelope,
                        false,
                    )
                    .await;

                match published {
                    Ok(()) => debug!("Published response"),
                    Err(error) => warn!(%error, "Failed to publish response"),
                }
            }
            Err(error) => error!(%error, "Unable to encode response"),
        }

        if decodable {
            settle(delivery.ack().await);
        } else {
            settle(delivery.nack(false).await);
        }
    }

    async fn process(&self, request: P::Request) -> Result<Envelope, RemoteError> {
        let outcome = AssertUnwindSafe(self.processor.process(request))
            .catch_unwind()
            .await;

        match outcome {
            Ok(Ok(response)) => json_envelope(&response).map_err(|error| {
                RemoteError::handler(
                    BlackboxError::from_boxed(error).context("unable to encode response"),
                )
            }),
            Ok(Err(error)) => {
                warn!(%error, "Request processing failed");
                Err(RemoteError::handler(BlackboxError::from_boxed(error)))
            }
            Err(panic) => {
                let message = panic_message(&*panic);
                error!(%message, "Request processor panicked");
                Err(RemoteError::handler(
                    BlackboxError::from_message(message).context("request processor panicked"),
                ))
            }
        }
    }
}

fn encode(reply: Result<Envelope, RemoteError>) -> Result<Envelope, serde_json::Error> {
    match reply {
        Ok(envelope) => Ok(envelope),
        Err(remote) => Ok(Envelope::new(serde_json::to_vec(&remote)?).with_content_type(ERROR_CONTENT_TYPE)),
    }
}

fn settle(result: EmptyResult) {
    if let Err(error) = result {
        warn!(%error, "Failed to settle request");
    }
}
