//! Various options usable by modules
//!
//! The structs in this module allow other modules to flatten them into
//! their own options struct. This allows for a unified yet non-cluttered
//! option set.

use crate::library::communication::topology::{
    DeliveryMode, Topology, TopologyError, DIRECT_EXCHANGE, FANOUT_EXCHANGE, TOPIC_EXCHANGE,
};
use crate::library::helpers::{parse_seconds, RetryPolicy};
#[cfg(feature = "amqp")]
use lapin::uri::{AMQPAuthority, AMQPUri, AMQPUserInfo};
use std::str::FromStr;
use std::time::Duration;
use structopt::StructOpt;
use thiserror::Error;

/// Options for connecting to the message broker
#[derive(Debug, StructOpt)]
pub struct BrokerOptions {
    /// Username used to authenticate with the broker
    #[structopt(long = "rmq-user", env = "RMQ_USER", default_value = "rmq_user")]
    pub user: String,

    /// Password used to authenticate with the broker
    #[structopt(
        long = "rmq-password",
        env = "RMQ_PASSWORD",
        default_value = "rmq_pass",
        hide_env_values = true
    )]
    pub password: String,

    /// Hostname or IP address of the broker
    #[structopt(long = "rmq-host", env = "RMQ_HOST", default_value = "localhost")]
    pub host: String,

    /// Port of the broker
    #[structopt(long = "rmq-port", env = "RMQ_PORT", default_value = "5672")]
    pub port: u16,

    /// Virtual host to operate in
    #[structopt(long = "rmq-vhost", env = "RMQ_VHOST", default_value = "/")]
    pub vhost: String,

    /// Base delay in seconds between connection attempts, grows linearly with each failure
    #[structopt(
        long = "rmq-reconnect-delay",
        env = "RMQ_RECONNECT_DELAY",
        default_value = "5",
        parse(try_from_str = parse_seconds),
        value_name = "seconds"
    )]
    pub reconnect_delay: Duration,

    /// Number of consecutive connection attempts before giving up
    #[structopt(
        long = "rmq-max-reconnect-attempts",
        env = "RMQ_MAX_RECONNECT_ATTEMPTS",
        default_value = "10"
    )]
    pub max_reconnect_attempts: u32,
}

impl BrokerOptions {
    /// Address of the configured broker and virtual host
    ///
    /// Every component is carried verbatim, so credentials and vhosts may contain characters that are
    /// reserved in URIs.
    #[cfg(feature = "amqp")]
    pub fn amqp_uri(&self) -> AMQPUri {
        AMQPUri {
            authority: AMQPAuthority {
                userinfo: AMQPUserInfo {
                    username: self.user.clone(),
                    password: self.password.clone(),
                },
                host: self.host.clone(),
                port: self.port,
            },
            vhost: self.vhost.clone(),
            ..Default::default()
        }
    }

    /// Policy applied when (re-)establishing the broker link
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_reconnect_attempts, self.reconnect_delay)
    }
}

/// Name of a delivery mode as given on the command line
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModeName {
    /// Exact routing key match
    Direct,
    /// Broadcast to every bound queue
    Fanout,
    /// Pattern based routing
    Topic,
}

/// Raised when an unknown delivery mode is requested
#[derive(Error, Debug, PartialEq, Eq)]
#[error("unknown delivery mode '{0}', expected one of direct, fanout or topic")]
pub struct UnknownModeError(String);

impl FromStr for ModeName {
    type Err = UnknownModeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "direct" => Ok(ModeName::Direct),
            "fanout" => Ok(ModeName::Fanout),
            "topic" => Ok(ModeName::Topic),
            _ => Err(UnknownModeError(s.to_owned())),
        }
    }
}

/// Options describing how requests are routed
#[derive(Debug, StructOpt)]
pub struct TopologyOptions {
    /// Delivery mode of requests (direct, fanout or topic)
    #[structopt(long, env = "RPC_MODE", default_value = "direct")]
    pub mode: ModeName,

    /// Exchange requests are published to, defaults to the exchange of the selected mode
    #[structopt(long, env = "RPC_EXCHANGE")]
    pub exchange: Option<String>,

    /// Durable queue requests are consumed from
    #[structopt(long, env = "RPC_QUEUE", default_value = "data_requests_queue")]
    pub queue: String,

    /// Routing key the request queue is bound with in direct mode
    #[structopt(long, env = "RPC_BINDING_KEY", default_value = "data_requests_queue")]
    pub binding_key: String,

    /// Pattern the request queue is bound with in topic mode
    #[structopt(long, env = "RPC_PATTERN", default_value = "request.*")]
    pub pattern: String,
}

impl TopologyOptions {
    /// Builds the topology described by these options
    pub fn topology(&self) -> Result<Topology, TopologyError> {
        let (mode, default_exchange) = match self.mode {
            ModeName::Direct => (
                DeliveryMode::Direct {
                    routing_key: self.binding_key.clone(),
                },
                DIRECT_EXCHANGE,
            ),
            ModeName::Fanout => (DeliveryMode::Fanout, FANOUT_EXCHANGE),
            ModeName::Topic => (
                DeliveryMode::Topic {
                    pattern: self.pattern.clone(),
                },
                TOPIC_EXCHANGE,
            ),
        };

        let exchange = self.exchange.as_deref().unwrap_or(default_exchange);

        Ok(Topology::new(mode)?
            .with_exchange(exchange)
            .with_queue(self.queue.clone()))
    }
}

#[cfg(test)]
mod does {
    use super::*;
    use crate::library::communication::topology::REQUEST_QUEUE;
    use pretty_assertions::assert_eq;

    #[derive(Debug, StructOpt)]
    struct Wrapper {
        #[structopt(flatten)]
        broker: BrokerOptions,
        #[structopt(flatten)]
        topology: TopologyOptions,
    }

    fn parse(args: &[&str]) -> Wrapper {
        let mut all = vec!["courier"];
        all.extend_from_slice(args);
        Wrapper::from_iter_safe(all).unwrap()
    }

    #[cfg(feature = "amqp")]
    #[test]
    fn carry_reserved_characters_into_broker_address() {
        let options = parse(&[
            "--rmq-user",
            "svc@ops",
            "--rmq-password",
            "p@ss/w:rd#1",
            "--rmq-host",
            "broker.internal",
            "--rmq-port",
            "5673",
            "--rmq-vhost",
            "/",
        ]);

        let uri = options.broker.amqp_uri();

        assert_eq!(uri.authority.userinfo.username, "svc@ops");
        assert_eq!(uri.authority.userinfo.password, "p@ss/w:rd#1");
        assert_eq!(uri.authority.host, "broker.internal");
        assert_eq!(uri.authority.port, 5673);
        assert_eq!(uri.vhost, "/");
    }

    #[test]
    fn derive_retry_policy() {
        let options = parse(&[
            "--rmq-reconnect-delay",
            "2",
            "--rmq-max-reconnect-attempts",
            "3",
        ]);

        let policy = options.broker.retry_policy();

        assert_eq!(policy.max_attempts(), 3);
        assert_eq!(policy.delay(), Duration::from_secs(2));
    }

    #[test]
    fn build_direct_topology() {
        let options = parse(&["--mode", "direct", "--binding-key", "jobs"]);

        let topology = options.topology.topology().unwrap();

        assert_eq!(
            topology.mode(),
            &DeliveryMode::Direct {
                routing_key: "jobs".into()
            }
        );
        assert_eq!(topology.exchange(), DIRECT_EXCHANGE);
        assert_eq!(topology.queue(), REQUEST_QUEUE);
    }

    #[test]
    fn override_exchange() {
        let options = parse(&["--mode", "fanout", "--exchange", "broadcast"]);

        let topology = options.topology.topology().unwrap();

        assert_eq!(topology.mode(), &DeliveryMode::Fanout);
        assert_eq!(topology.exchange(), "broadcast");
    }

    #[test]
    fn reject_echoing_topic_pattern() {
        let options = parse(&["--mode", "topic", "--pattern", "#"]);

        assert_eq!(
            options.topology.topology(),
            Err(TopologyError::EchoingPattern("#".into()))
        );
    }

    #[test]
    fn reject_unknown_mode() {
        assert_eq!(
            "broadcast".parse::<ModeName>(),
            Err(UnknownModeError("broadcast".into()))
        );
    }
}
