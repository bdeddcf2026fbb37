use async_trait::async_trait;
use courier::library::communication::broker::{
    Broker, BrokerChannel, BrokerConnection, ConsumeOptions, Envelope, PublishError,
    QueueDescriptor, RawDelivery,
};
use courier::library::communication::connection::ConnectionState;
use courier::library::communication::implementation::memory::{MemoryBroker, MemoryChannel};
use courier::library::communication::request::{
    RemoteErrorKind, RequestProcessor, RpcClient, RpcError, RpcServer, ServerOptions,
    ERROR_CONTENT_TYPE,
};
use courier::library::communication::topology::{pattern_matches, Topology};
use courier::library::helpers::RetryPolicy;
use courier::library::BoxedError;
use courier::module::serve::AcknowledgingProcessor;
use futures::future::join_all;
use futures::StreamExt;
use pretty_assertions::assert_eq;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::{sleep, timeout};

const WAIT: Duration = Duration::from_secs(5);

fn policy() -> RetryPolicy {
    RetryPolicy::new(5, Duration::from_millis(10))
}

fn server_options() -> ServerOptions {
    ServerOptions {
        policy: policy(),
        ..Default::default()
    }
}

async fn serve<P: RequestProcessor>(
    broker: &MemoryBroker,
    topology: Topology,
    processor: P,
) -> RpcServer<MemoryBroker, P> {
    let server = RpcServer::new(broker.clone(), topology, processor, server_options());
    server.start().await.unwrap();
    server
}

async fn client(broker: &MemoryBroker, topology: Topology) -> RpcClient<MemoryBroker> {
    let client = RpcClient::new(broker.clone(), topology, policy());
    client.connect().await.unwrap();
    client
}

async fn raw_channel(broker: &MemoryBroker) -> MemoryChannel {
    let connection = broker.connect().await.unwrap();
    let channel = connection.channel().await.unwrap();
    // Channels keep working for as long as the connection lives
    std::mem::forget(connection);
    channel
}

async fn eventually(mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + WAIT;
    while !condition() {
        assert!(Instant::now() < deadline, "condition not met in time");
        sleep(Duration::from_millis(10)).await;
    }
}

/// Uppercases text, fails or panics on request
struct Shouter;

#[async_trait]
impl RequestProcessor for Shouter {
    type Request = String;
    type Response = String;

    async fn process(&self, request: String) -> Result<String, BoxedError> {
        match request.as_str() {
            "fail" => Err("database unavailable".into()),
            "panic" => panic!("boom"),
            _ => Ok(request.to_uppercase()),
        }
    }
}

/// Counts requests and answers with its own name
struct Counter {
    name: &'static str,
    seen: Arc<AtomicUsize>,
}

#[async_trait]
impl RequestProcessor for Counter {
    type Request = Value;
    type Response = &'static str;

    async fn process(&self, _: Value) -> Result<&'static str, BoxedError> {
        self.seen.fetch_add(1, Ordering::SeqCst);
        Ok(self.name)
    }
}

fn counter(name: &'static str) -> (Counter, Arc<AtomicUsize>) {
    let seen = Arc::new(AtomicUsize::new(0));
    let counter = Counter {
        name,
        seen: seen.clone(),
    };

    (counter, seen)
}

#[tokio::test]
async fn answer_ping_over_direct_exchange() {
    let broker = MemoryBroker::new();
    let topology = Topology::direct("data_requests_queue");
    let server = serve(&broker, topology.clone(), AcknowledgingProcessor).await;
    let client = client(&broker, topology).await;

    let started = Instant::now();
    let response: Value = client
        .publish("ping", "data_requests_queue", WAIT)
        .await
        .unwrap();

    assert_eq!(response, json!({"response": "ok", "processed": true}));
    assert!(started.elapsed() < WAIT);
    assert_eq!(client.pending_requests(), 0);

    client.stop().await;
    server.stop().await;
}

#[tokio::test]
async fn time_out_without_consumer() {
    let broker = MemoryBroker::new();
    let topology = Topology::direct("data_requests_queue");
    topology
        .declare_requests(&raw_channel(&broker).await)
        .await
        .unwrap();
    let client = client(&broker, topology).await;

    let window = Duration::from_millis(200);
    let started = Instant::now();
    let result = client
        .publish::<_, Value>("ping", "data_requests_queue", window)
        .await;
    let elapsed = started.elapsed();

    assert!(matches!(result, Err(RpcError::Timeout(t)) if t == window));
    assert!(elapsed >= window);
    assert!(elapsed < window + Duration::from_secs(1));
    assert_eq!(client.pending_requests(), 0);
}

#[tokio::test]
async fn fail_fast_on_unroutable_requests() {
    let broker = MemoryBroker::new();
    let topology = Topology::direct("data_requests_queue");
    let server = serve(&broker, topology.clone(), AcknowledgingProcessor).await;
    let client = client(&broker, topology).await;

    let started = Instant::now();
    let result = client.publish::<_, Value>("ping", "nobody_listens", WAIT).await;

    assert!(matches!(
        result,
        Err(RpcError::Publish(PublishError::Unroutable { .. }))
    ));
    assert!(started.elapsed() < Duration::from_secs(1));
    assert_eq!(client.pending_requests(), 0);

    server.stop().await;
}

#[tokio::test]
async fn broadcast_requests_to_every_fanout_queue() {
    let broker = MemoryBroker::new();
    let (first, first_seen) = counter("first");
    let (second, second_seen) = counter("second");

    let first = serve(&broker, Topology::fanout().with_queue("first_requests"), first).await;
    let second = serve(&broker, Topology::fanout().with_queue("second_requests"), second).await;
    let client = client(&broker, Topology::fanout()).await;

    let response: String = client
        .publish(&json!({"job": 1}), "some.ignored.key", WAIT)
        .await
        .unwrap();

    assert!(response == "first" || response == "second");
    eventually(|| {
        first_seen.load(Ordering::SeqCst) == 1 && second_seen.load(Ordering::SeqCst) == 1
    })
    .await;

    first.stop().await;
    second.stop().await;
}

#[tokio::test]
async fn route_topic_requests_by_pattern() {
    let broker = MemoryBroker::new();
    let topology = Topology::topic("request.*").unwrap();
    let (processor, seen) = counter("topic");
    let server = serve(&broker, topology.clone(), processor).await;
    let client = client(&broker, topology.clone()).await;

    let response: String = client.publish(&json!({}), "request.data", WAIT).await.unwrap();
    assert_eq!(response, "topic");

    let unmatched = client.publish::<_, String>(&json!({}), "other.data", WAIT).await;
    assert!(matches!(
        unmatched,
        Err(RpcError::Publish(PublishError::Unroutable { .. }))
    ));

    let reply_key = topology.reply_routing_key(&client.reply_queue().unwrap());
    assert!(reply_key.starts_with("response."));
    assert!(!pattern_matches("request.*", &reply_key));

    // Responses must never loop back into the request queue
    sleep(Duration::from_millis(50)).await;
    assert_eq!(seen.load(Ordering::SeqCst), 1);
    assert_eq!(broker.queue_depth(topology.queue()), Some(0));

    server.stop().await;
}

#[tokio::test]
async fn reject_echoing_topic_patterns() {
    assert!(Topology::topic("#").is_err());
    assert!(Topology::topic("*.data").is_err());
    assert!(Topology::topic("response.#").is_err());
}

#[tokio::test]
async fn process_queued_requests_after_reconnecting() {
    let broker = MemoryBroker::new();
    let topology = Topology::direct("data_requests_queue");
    let channel = raw_channel(&broker).await;
    topology.declare_requests(&channel).await.unwrap();

    let replies = channel
        .declare_queue(&QueueDescriptor::exclusive())
        .await
        .unwrap();
    channel
        .bind_queue(&replies, topology.exchange(), &replies)
        .await
        .unwrap();

    for id in 0..3 {
        let envelope = Envelope::json(serde_json::to_vec(&format!("request {}", id)).unwrap())
            .with_correlation_id(id.to_string())
            .with_reply_to(replies.clone());
        channel
            .publish(topology.exchange(), "data_requests_queue", envelope, true)
            .await
            .unwrap();
    }
    assert_eq!(broker.queue_depth(topology.queue()), Some(3));

    broker.fail_next_connects(2);
    let attempts = broker.connection_attempts();
    let server = serve(&broker, topology.clone(), Shouter).await;
    assert_eq!(broker.connection_attempts() - attempts, 3);

    let mut responses: Vec<String> = channel
        .consume(&replies, ConsumeOptions::auto_ack("raw"))
        .await
        .unwrap()
        .take(3)
        .map(|delivery| {
            let delivery = delivery.unwrap();
            serde_json::from_slice(delivery.payload()).unwrap()
        })
        .collect()
        .await;
    responses.sort();

    assert_eq!(responses, vec!["REQUEST 0", "REQUEST 1", "REQUEST 2"]);
    eventually(|| broker.queue_depth(topology.queue()) == Some(0)).await;

    server.stop().await;
}

#[tokio::test]
async fn resume_after_severed_link() {
    let broker = MemoryBroker::new();
    let topology = Topology::direct("data_requests_queue");
    let server = serve(&broker, topology.clone(), Shouter).await;
    let client = client(&broker, topology).await;

    let before: String = client.publish("hello", "data_requests_queue", WAIT).await.unwrap();
    assert_eq!(before, "HELLO");

    broker.sever_connections();

    let after: String = client.publish("again", "data_requests_queue", WAIT).await.unwrap();
    assert_eq!(after, "AGAIN");
    assert_eq!(client.state(), ConnectionState::Connected);

    client.stop().await;
    server.stop().await;
}

#[tokio::test]
async fn give_up_connecting_after_max_attempts() {
    let broker = MemoryBroker::new();
    broker.fail_next_connects(10);

    let client = RpcClient::new(
        broker.clone(),
        Topology::direct("data_requests_queue"),
        RetryPolicy::new(3, Duration::from_millis(1)),
    );

    assert!(client.connect().await.is_err());
    assert_eq!(broker.connection_attempts(), 3);
}

#[tokio::test]
async fn clean_up_after_stop() {
    let broker = MemoryBroker::new();
    let topology = Topology::direct("data_requests_queue");
    topology
        .declare_requests(&raw_channel(&broker).await)
        .await
        .unwrap();
    let client = Arc::new(client(&broker, topology).await);

    let waiting = {
        let client = client.clone();
        tokio::spawn(async move {
            client
                .publish::<_, Value>("ping", "data_requests_queue", Duration::from_secs(30))
                .await
        })
    };
    eventually(|| client.pending_requests() == 1).await;

    client.stop().await;

    let outcome = timeout(WAIT, waiting).await.unwrap().unwrap();
    assert!(matches!(outcome, Err(RpcError::Cancelled)));
    assert_eq!(client.pending_requests(), 0);
    assert_eq!(client.state(), ConnectionState::Closed);

    let refused = client.publish::<_, Value>("ping", "data_requests_queue", WAIT).await;
    assert!(refused.is_err());
}

#[tokio::test]
async fn report_handler_failures() {
    let broker = MemoryBroker::new();
    let topology = Topology::direct("data_requests_queue");
    let server = serve(&broker, topology.clone(), Shouter).await;
    let client = client(&broker, topology.clone()).await;

    match client.publish::<_, String>("fail", "data_requests_queue", WAIT).await {
        Err(RpcError::Remote(remote)) => {
            assert_eq!(remote.kind, RemoteErrorKind::Handler);
            assert_eq!(remote.causes.causes().to_vec(), vec!["database unavailable".to_owned()]);
        }
        other => panic!("unexpected outcome {:?}", other),
    }

    match client.publish::<_, String>("panic", "data_requests_queue", WAIT).await {
        Err(RpcError::Remote(remote)) => {
            assert_eq!(remote.kind, RemoteErrorKind::Handler);
            assert!(remote.causes.causes().iter().any(|cause| cause == "boom"));
        }
        other => panic!("unexpected outcome {:?}", other),
    }

    // The server keeps serving after failures
    let response: String = client.publish("still there", "data_requests_queue", WAIT).await.unwrap();
    assert_eq!(response, "STILL THERE");

    // Unsettled requests would return to the queue once the server lets go of them
    server.stop().await;
    assert_eq!(broker.queue_depth(topology.queue()), Some(0));
    assert_eq!(broker.queue_depth(&topology.dead_letter_queue()), Some(0));
}

#[tokio::test]
async fn acknowledge_failed_requests_before_shutdown() {
    let broker = MemoryBroker::new();
    let topology = Topology::direct("data_requests_queue");
    let server = serve(&broker, topology.clone(), Shouter).await;
    let client = client(&broker, topology.clone()).await;

    let outcomes = join_all(
        ["fail", "panic"]
            .iter()
            .map(|payload| client.publish::<_, String>(*payload, "data_requests_queue", WAIT)),
    )
    .await;
    assert!(outcomes
        .iter()
        .all(|outcome| matches!(outcome, Err(RpcError::Remote(_)))));

    server.stop().await;
    client.stop().await;

    assert_eq!(broker.queue_depth(topology.queue()), Some(0));
    assert_eq!(broker.queue_depth(&topology.dead_letter_queue()), Some(0));
    assert_eq!(broker.consumer_count(topology.queue()), Some(0));
}

#[tokio::test]
async fn dead_letter_malformed_requests() {
    let broker = MemoryBroker::new();
    let topology = Topology::direct("data_requests_queue");
    let server = serve(&broker, topology.clone(), Shouter).await;
    let client = client(&broker, topology.clone()).await;

    match client
        .publish::<_, String>(&json!({"not": "a string"}), "data_requests_queue", WAIT)
        .await
    {
        Err(RpcError::Remote(remote)) => assert_eq!(remote.kind, RemoteErrorKind::Protocol),
        other => panic!("unexpected outcome {:?}", other),
    }

    eventually(|| broker.queue_depth(&topology.dead_letter_queue()) == Some(1)).await;

    server.stop().await;
}

#[tokio::test]
async fn answer_raw_garbage_with_error_response() {
    let broker = MemoryBroker::new();
    let topology = Topology::direct("data_requests_queue");
    let server = serve(&broker, topology.clone(), Shouter).await;

    let channel = raw_channel(&broker).await;
    let replies = channel
        .declare_queue(&QueueDescriptor::exclusive())
        .await
        .unwrap();
    channel
        .bind_queue(&replies, topology.exchange(), &replies)
        .await
        .unwrap();
    let mut responses = channel
        .consume(&replies, ConsumeOptions::auto_ack("raw"))
        .await
        .unwrap();

    let envelope = Envelope::json(b"{not json".to_vec())
        .with_correlation_id("garbage")
        .with_reply_to(replies.clone());
    channel
        .publish(topology.exchange(), "data_requests_queue", envelope, true)
        .await
        .unwrap();

    let response = timeout(WAIT, responses.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    let properties = response.properties();
    assert_eq!(properties.content_type.as_deref(), Some(ERROR_CONTENT_TYPE));
    assert_eq!(properties.correlation_id.as_deref(), Some("garbage"));

    let body: Value = serde_json::from_slice(response.payload()).unwrap();
    assert_eq!(body["kind"], json!("protocol"));
    eventually(|| broker.queue_depth(&topology.dead_letter_queue()) == Some(1)).await;

    server.stop().await;
}

#[tokio::test]
async fn acknowledge_requests_without_reply_destination() {
    let broker = MemoryBroker::new();
    let topology = Topology::direct("data_requests_queue");
    let (processor, seen) = counter("silent");
    let server = serve(&broker, topology.clone(), processor).await;

    let channel = raw_channel(&broker).await;
    let envelope = Envelope::json(b"\"orphan\"".to_vec()).with_correlation_id("orphan");
    channel
        .publish(topology.exchange(), "data_requests_queue", envelope, true)
        .await
        .unwrap();

    eventually(|| broker.queue_depth(topology.queue()) == Some(0)).await;
    sleep(Duration::from_millis(50)).await;

    assert_eq!(seen.load(Ordering::SeqCst), 0);
    assert_eq!(broker.queue_depth(topology.queue()), Some(0));
    assert_eq!(broker.queue_depth(&topology.dead_letter_queue()), Some(0));

    server.stop().await;
}

#[tokio::test]
async fn demultiplex_concurrent_calls() {
    let broker = MemoryBroker::new();
    let topology = Topology::direct("data_requests_queue");
    let server = serve(&broker, topology.clone(), Shouter).await;
    let client = client(&broker, topology).await;

    let calls = (0..50).map(|i| {
        let client = &client;
        async move {
            let request = format!("call {}", i);
            let response: String = client
                .publish(&request, "data_requests_queue", WAIT)
                .await
                .unwrap();
            (request, response)
        }
    });

    for (request, response) in join_all(calls).await {
        assert_eq!(response, request.to_uppercase());
    }
    assert_eq!(client.pending_requests(), 0);

    client.stop().await;
    server.stop().await;
}

#[tokio::test]
async fn close_link_when_server_stops() {
    let broker = MemoryBroker::new();
    let server = serve(
        &broker,
        Topology::direct("data_requests_queue"),
        AcknowledgingProcessor,
    )
    .await;
    assert_eq!(server.state(), ConnectionState::Connected);
    assert_eq!(broker.consumer_count("data_requests_queue"), Some(1));

    server.stop().await;

    assert_eq!(server.state(), ConnectionState::Closed);
    assert_eq!(broker.open_connections(), 0);
    assert_eq!(broker.consumer_count("data_requests_queue"), Some(0));
    assert!(broker.has_queue("data_requests_queue"));
}
