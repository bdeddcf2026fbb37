use crate::library::helpers::parse_seconds;
use crate::module::options::{BrokerOptions, TopologyOptions};
use std::time::Duration;
use structopt::StructOpt;

/// Options for the call module
#[derive(Debug, StructOpt)]
pub struct Options {
    /// Request payload, sent as JSON if it parses as such and as a JSON string otherwise
    #[structopt(default_value = "ping")]
    pub payload: String,

    /// Routing key the request is published with, ignored in fanout mode
    #[structopt(long, env = "RPC_ROUTING_KEY", default_value = "data_requests_queue")]
    pub routing_key: String,

    /// Seconds to wait for a response
    #[structopt(long, env = "RPC_TIMEOUT", default_value = "5", parse(try_from_str = parse_seconds), value_name = "seconds")]
    pub timeout: Duration,

    #[allow(missing_docs)]
    #[structopt(flatten)]
    pub broker: BrokerOptions,

    #[allow(missing_docs)]
    #[structopt(flatten)]
    pub topology: TopologyOptions,
}
