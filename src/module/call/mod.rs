//! Sends a single request and prints the response

mod options;

pub use options::Options;

use crate::harness::{Heart, Module, ModuleTerminationReason};
use crate::library::communication::broker::Broker;
use crate::library::communication::request::RpcClient;
use crate::library::BoxedError;
use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, info};

/// Module implementation
pub struct Call<B: Broker + 'static> {
    options: Options,
    broker: Option<B>,
    client: Option<RpcClient<B>>,
    response: Option<Value>,
}

impl<B: Broker + 'static> Call<B> {
    /// Creates a new instance from raw parts
    pub fn new(options: Options, broker: B) -> Self {
        Self {
            options,
            broker: Some(broker),
            client: None,
            response: None,
        }
    }

    /// Response received by the last run
    pub fn response(&self) -> Option<&Value> {
        self.response.as_ref()
    }

    fn payload(&self) -> Value {
        serde_json::from_str(&self.options.payload)
            .unwrap_or_else(|_| Value::String(self.options.payload.clone()))
    }
}

#[async_trait]
impl<B: Broker + 'static> Module for Call<B> {
    async fn run(&mut self) -> Result<Option<Heart>, BoxedError> {
        let topology = self.options.topology.topology()?;
        let broker = self.broker.take().ok_or("call has already been made")?;
        let payload = self.payload();
        let client = self
            .client
            .insert(RpcClient::new(broker, topology, self.options.broker.retry_policy()));

        client.connect().await?;

        debug!(%payload, routing_key = %self.options.routing_key, "Sending request");

        let response: Value = client
            .publish(&payload, &self.options.routing_key, self.options.timeout)
            .await?;

        info!("Received response");
        println!("{}", serde_json::to_string_pretty(&response)?);
        self.response = Some(response);

        Ok(None)
    }

    async fn post_shutdown(&mut self, _: &ModuleTerminationReason) {
        if let Some(client) = self.client.take() {
            client.stop().await;
        }
    }
}

#[cfg(test)]
mod does {
    use super::*;
    use crate::library::communication::implementation::memory::MemoryBroker;
    use crate::module::serve::{self, Serve};
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use structopt::StructOpt;

    #[tokio::test]
    async fn print_response_of_serving_module() {
        let broker = MemoryBroker::new();

        let serve_options = serve::Options::from_iter_safe(&["serve"]).unwrap();
        let mut server = Serve::new(serve_options, broker.clone());
        server.pre_startup().await.unwrap();
        let _heart = server.run().await.unwrap();

        let call_options = Options::from_iter_safe(&["call", "ping", "--timeout", "5"]).unwrap();
        let mut call = Call::new(call_options, broker.clone());
        assert!(call.run().await.unwrap().is_none());

        assert_eq!(
            call.response(),
            Some(&json!({"response": "ok", "processed": true}))
        );

        call.post_shutdown(&ModuleTerminationReason::ExitedNormally)
            .await;
        server
            .post_shutdown(&ModuleTerminationReason::ExitedNormally)
            .await;
        assert_eq!(broker.open_connections(), 0);
    }

    #[tokio::test]
    async fn send_plain_text_as_json_string() {
        let options = Options::from_iter_safe(&["call", "hello world"]).unwrap();
        let call = Call::new(options, MemoryBroker::new());

        assert_eq!(call.payload(), json!("hello world"));
    }

    #[tokio::test]
    async fn send_json_payload_verbatim() {
        let options = Options::from_iter_safe(&["call", r#"{"id":1}"#]).unwrap();
        let call = Call::new(options, MemoryBroker::new());

        assert_eq!(call.payload(), json!({"id": 1}));
    }
}
