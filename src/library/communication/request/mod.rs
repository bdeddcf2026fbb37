//! Request/response on top of one-way messaging
//!
//! The requesting side is an [`RpcClient`], the responding side an [`RpcServer`] driving a
//! [`RequestProcessor`]. Responses are paired with their requests by a [`CorrelationId`]: the client
//! keeps a waiter per id in [`PendingRequests`] and a [`ResponseDispatcher`] resolves it as soon as the
//! response arrives on the private reply queue of the client.

mod correlation;
mod dispatcher;
mod error;
mod pending;
mod requestor;
mod responder;

pub use correlation::CorrelationId;
pub use dispatcher::ResponseDispatcher;
pub use error::{RemoteError, RemoteErrorKind, RpcError, ERROR_CONTENT_TYPE};
pub use pending::{PendingRequests, Waiter};
pub use requestor::RpcClient;
pub use responder::{RequestProcessor, RpcServer, ServerOptions};
