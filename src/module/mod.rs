//! Runnable modules each bundling a client or server with a unified configuration

pub mod options;

pub mod call;
pub mod serve;
