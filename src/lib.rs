//! This library crate contains everything needed to run request/reply RPC on top of a publish/subscribe message broker.
//!
//! Submodules have been introduced to split responsibilities. They form a chain of dependencies from the
//! low-level [`library`] (broker abstraction, topology, correlation and the RPC client/server), through
//! the executable [`harness`], up to the high-level [`modules`](module) driven by the `courier` binary.

#![deny(missing_docs)]

pub mod harness;
pub mod library;
pub mod module;
