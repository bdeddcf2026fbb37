//! Structures to realise request and response on top of a publish/subscribe message broker
//!
//! Brokers only move messages in one direction: a publisher hands a message to an exchange
//! which forwards it to zero or more bound queues. This module layers a request-response
//! pattern on top of that primitive.
//!
//! On the requesting side, an [`RpcClient`](request::RpcClient) tags every request with a fresh
//! [`CorrelationId`](request::CorrelationId) and the name of a private reply queue, registers a waiter
//! and suspends the caller until the [`ResponseDispatcher`](request::ResponseDispatcher) resolves it
//! or the timeout elapses.
//!
//! On the responding side, an [`RpcServer`](request::RpcServer) consumes requests, hands them to a
//! [`RequestProcessor`](request::RequestProcessor) and routes the result back to the reply destination
//! embedded in the request.
//!
//! How messages are addressed depends on the [`DeliveryMode`](topology::DeliveryMode) which is captured
//! in a [`Topology`](topology::Topology). The link to the broker is owned by a
//! [`ConnectionManager`](connection::ConnectionManager) that repairs it when it drops.
//! Brokers themselves are abstracted by the traits in [`broker`] with concrete implementations
//! living in [`implementation`].

mod error;

pub mod broker;
pub mod connection;
pub mod implementation;
pub mod request;
pub mod topology;

pub use error::BlackboxError;
