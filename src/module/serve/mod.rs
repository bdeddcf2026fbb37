//! Answers requests arriving on the configured topology until the process is terminated

mod options;
mod processor;

pub use options::Options;
pub use processor::{Acknowledgement, AcknowledgingProcessor};

use crate::harness::{Heart, Module, ModuleTerminationReason};
use crate::library::communication::broker::Broker;
use crate::library::communication::request::{RpcServer, ServerOptions};
use crate::library::{BoxedError, EmptyResult};
use async_trait::async_trait;
use tracing::info;

/// Module implementation
pub struct Serve<B: Broker + 'static> {
    options: Options,
    broker: Option<B>,
    server: Option<RpcServer<B, AcknowledgingProcessor>>,
}

impl<B: Broker + 'static> Serve<B> {
    /// Creates a new instance from raw parts
    pub fn new(options: Options, broker: B) -> Self {
        Self {
            options,
            broker: Some(broker),
            server: None,
        }
    }

    fn server_options(&self) -> ServerOptions {
        ServerOptions {
            concurrency: self.options.concurrency,
            consumer_tag: self.options.consumer_tag.clone(),
            policy: self.options.broker.retry_policy(),
        }
    }
}

#[async_trait]
impl<B: Broker + 'static> Module for Serve<B> {
    async fn pre_startup(&mut self) -> EmptyResult {
        let topology = self.options.topology.topology()?;
        let broker = self.broker.take().ok_or("server has already been set up")?;

        info!(exchange = topology.exchange(), queue = topology.queue(), "Setting up server");
        let server_options = self.server_options();
        self.server = Some(RpcServer::new(
            broker,
            topology,
            AcknowledgingProcessor,
            server_options,
        ));

        Ok(())
    }

    async fn run(&mut self) -> Result<Option<Heart>, BoxedError> {
        let server = self.server.as_ref().ok_or("server has not been set up")?;
        server.start().await?;

        Ok(Some(Heart::without_heart_stone()))
    }

    async fn post_shutdown(&mut self, _: &ModuleTerminationReason) {
        if let Some(server) = self.server.take() {
            server.stop().await;
        }
    }
}
