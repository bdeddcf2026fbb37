use crate::module::options::{BrokerOptions, TopologyOptions};
use structopt::StructOpt;

/// Options for the serve module
#[derive(Debug, StructOpt)]
pub struct Options {
    /// Number of requests processed at once, also used as broker prefetch
    #[structopt(long, env, default_value = "10")]
    pub concurrency: u16,

    /// Prefix of the consumer tag shown in the broker management interface
    #[structopt(long, env, default_value = "courier-server")]
    pub consumer_tag: String,

    #[allow(missing_docs)]
    #[structopt(flatten)]
    pub broker: BrokerOptions,

    #[allow(missing_docs)]
    #[structopt(flatten)]
    pub topology: TopologyOptions,
}
