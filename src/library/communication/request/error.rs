use super::super::broker::PublishError;
use super::super::connection::ConnectionError;
use super::super::BlackboxError;
use super::CorrelationId;
use crate::library::BoxedError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Content type of responses carrying a [`RemoteError`]
pub const ERROR_CONTENT_TYPE: &str = "application/vnd.courier.error+json";

/// Category of failure reported by the responding side
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RemoteErrorKind {
    /// The request processor returned an error or panicked
    Handler,
    /// The request could not be decoded
    Protocol,
}

impl fmt::Display for RemoteErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RemoteErrorKind::Handler => write!(f, "handler"),
            RemoteErrorKind::Protocol => write!(f, "protocol"),
        }
    }
}

/// Structured error sent back instead of a response
#[derive(Error, Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[error("{kind} failure on the responding side")]
pub struct RemoteError {
    /// What went wrong
    pub kind: RemoteErrorKind,
    /// Flattened error chain of the responding side
    #[source]
    pub causes: BlackboxError,
}

impl RemoteError {
    /// Failure of the request processor
    pub fn handler(causes: BlackboxError) -> Self {
        Self {
            kind: RemoteErrorKind::Handler,
            causes,
        }
    }

    /// Undecodable request
    pub fn protocol(causes: BlackboxError) -> Self {
        Self {
            kind: RemoteErrorKind::Protocol,
            causes,
        }
    }
}

/// Errors that may occur while performing a remote procedure call
#[derive(Error, Debug)]
pub enum RpcError {
    /// The broker link could not be acquired
    #[error("broker connection unavailable")]
    Connection(#[from] ConnectionError),
    /// The request could not be published
    #[error("unable to publish request")]
    Publish(#[from] PublishError),
    /// The request payload could not be serialized
    #[error("unable to encode request")]
    Encode(#[source] BoxedError),
    /// No response arrived in time
    #[error("no response received within {0:?}")]
    Timeout(Duration),
    /// The client has been stopped while the call was outstanding
    #[error("request has been cancelled")]
    Cancelled,
    /// The response could not be decoded
    #[error("malformed response")]
    Protocol(#[source] BoxedError),
    /// The responding side reported a failure
    #[error("remote call failed")]
    Remote(#[from] RemoteError),
    /// Another request with the same correlation id is still outstanding
    #[error("correlation id '{0}' is already in use")]
    DuplicateCorrelation(CorrelationId),
}
