use std::time::Duration;

use clap::{Args, Parser, Subcommand};

use crate::{connection::ConnectOptions, message::QueueType};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Assert a queue and deliver messages to it.
    Publish(PublishArgs),
    /// Assert a queue and print every message the broker routes to it.
    Consume(ConsumeArgs),
}

#[derive(Args, Debug, Clone)]
pub struct BrokerArgs {
    /// Address of the message broker.
    #[arg(long, default_value = "127.0.0.1:5000")]
    pub broker: String,

    /// Give up connecting after this many seconds. 0 waits indefinitely.
    #[arg(long, default_value_t = 5)]
    pub connect_timeout_secs: u64,
}

impl BrokerArgs {
    pub fn connect_options(&self) -> ConnectOptions {
        ConnectOptions {
            connect_timeout: (self.connect_timeout_secs > 0)
                .then(|| Duration::from_secs(self.connect_timeout_secs)),
            ..ConnectOptions::default()
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct QueueArgs {
    /// Queue (route) name.
    #[arg(long)]
    pub queue: String,

    /// Routing model: P2P or PUBSUB.
    #[arg(long, default_value = "P2P")]
    pub queue_type: QueueType,

    /// Ask the broker to persist the queue.
    #[arg(long)]
    pub durable: bool,
}

#[derive(Args, Debug, Clone)]
pub struct PublishArgs {
    #[command(flatten)]
    pub broker: BrokerArgs,

    #[command(flatten)]
    pub queue: QueueArgs,

    /// Messages to deliver. Reads one message per stdin line when omitted.
    pub messages: Vec<String>,
}

#[derive(Args, Debug, Clone)]
pub struct ConsumeArgs {
    #[command(flatten)]
    pub broker: BrokerArgs,

    #[command(flatten)]
    pub queue: QueueArgs,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn publish_parses_flags_and_messages() {
        let cli = Cli::try_parse_from([
            "broker-channels",
            "publish",
            "--broker",
            "10.0.0.1:7000",
            "--queue",
            "orders",
            "--queue-type",
            "pubsub",
            "--durable",
            "one",
            "two",
        ])
        .expect("valid publish invocation");

        let Command::Publish(args) = cli.command else {
            panic!("expected publish");
        };
        assert_eq!(args.broker.broker, "10.0.0.1:7000");
        assert_eq!(args.queue.queue_type, QueueType::PubSub);
        assert!(args.queue.durable);
        assert_eq!(args.messages, vec!["one", "two"]);
    }

    #[test]
    fn unknown_queue_type_is_rejected() {
        let result = Cli::try_parse_from([
            "broker-channels",
            "consume",
            "--queue",
            "orders",
            "--queue-type",
            "fanout",
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn zero_timeout_means_no_deadline() {
        let args = BrokerArgs {
            broker: "127.0.0.1:5000".into(),
            connect_timeout_secs: 0,
        };
        assert_eq!(args.connect_options().connect_timeout, None);

        let args = BrokerArgs {
            connect_timeout_secs: 3,
            ..args
        };
        assert_eq!(
            args.connect_options().connect_timeout,
            Some(Duration::from_secs(3))
        );
    }
}
