use crate::library::communication::request::RequestProcessor;
use crate::library::BoxedError;
use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use tracing::{info, instrument};

/// Response sent by the [`AcknowledgingProcessor`]
#[derive(Debug, Serialize, PartialEq, Eq)]
pub struct Acknowledgement {
    /// Always `"ok"`
    pub response: &'static str,
    /// Always `true`
    pub processed: bool,
}

impl Default for Acknowledgement {
    fn default() -> Self {
        Self {
            response: "ok",
            processed: true,
        }
    }
}

/// Processor which logs every request and confirms it with an [`Acknowledgement`]
#[derive(Debug, Default, Clone, Copy)]
pub struct AcknowledgingProcessor;

#[async_trait]
impl RequestProcessor for AcknowledgingProcessor {
    type Request = Value;
    type Response = Acknowledgement;

    #[instrument(skip(self, request))]
    async fn process(&self, request: Self::Request) -> Result<Self::Response, BoxedError> {
        info!(%request, "Processing request");
        Ok(Acknowledgement::default())
    }
}
