use anyhow::{Context, Result};
use tokio::{
    io::{self, AsyncBufReadExt, AsyncWriteExt, BufReader},
    select,
};
use tracing::{info, warn};

use crate::{
    channel::{Channel, ChannelHandler},
    cli::{BrokerArgs, ConsumeArgs, PublishArgs},
    connection::{self, Connection},
};

pub async fn publish(args: PublishArgs) -> Result<()> {
    let connection = establish_connection(&args.broker).await?;
    let mut channel = connection.create_channel().await?;

    let queue = channel
        .assert_queue(&args.queue.queue, args.queue.queue_type, args.queue.durable)
        .await
        .with_context(|| format!("failed to assert queue {}", args.queue.queue))?;

    let delivered = if args.messages.is_empty() {
        deliver_stdin_lines(&channel, &queue, &args).await?
    } else {
        for message in &args.messages {
            deliver(&channel, &queue, &args, message).await?;
        }
        args.messages.len()
    };

    info!(%queue, delivered, "finished publishing");
    channel.close_channel().await?;
    Ok(())
}

pub async fn consume(args: ConsumeArgs) -> Result<()> {
    let connection = establish_connection(&args.broker).await?;
    let mut channel = connection.create_channel().await?;

    let queue = channel
        .assert_queue(&args.queue.queue, args.queue.queue_type, args.queue.durable)
        .await
        .with_context(|| format!("failed to assert queue {}", args.queue.queue))?;
    let mut subscription = channel
        .consume(&queue, args.queue.queue_type, args.queue.durable)
        .await
        .with_context(|| format!("failed to consume from {queue}"))?;

    loop {
        select! {
            envelope = subscription.recv() => {
                match envelope {
                    Some(envelope) => write_stdout(&String::from_utf8_lossy(&envelope.body)).await?,
                    None => {
                        write_stdout("*** broker closed the connection").await?;
                        break;
                    }
                }
            }
            ctrl_c = tokio::signal::ctrl_c() => {
                if let Err(error) = ctrl_c {
                    warn!(?error, "ctrl-c handler failed");
                }
                break;
            }
        }
    }

    shutdown_channel(channel).await;
    Ok(())
}

async fn establish_connection(args: &BrokerArgs) -> Result<Connection> {
    let options = args.connect_options();
    connection::connect_with(&args.broker, &options, async {
        if let Err(error) = tokio::signal::ctrl_c().await {
            warn!(?error, "failed to install ctrl-c handler");
        }
    })
    .await
    .with_context(|| format!("failed to connect to {}", args.broker))
}

async fn deliver_stdin_lines(channel: &Channel, queue: &str, args: &PublishArgs) -> Result<usize> {
    let mut stdin = BufReader::new(io::stdin()).lines();
    let mut delivered = 0;

    while let Some(line) = stdin.next_line().await? {
        let text = line.trim_end();
        if text.is_empty() {
            continue;
        }
        deliver(channel, queue, args, text).await?;
        delivered += 1;
    }

    Ok(delivered)
}

async fn deliver(channel: &Channel, queue: &str, args: &PublishArgs, message: &str) -> Result<()> {
    channel
        .deliver_message(queue, message.as_bytes(), args.queue.queue_type)
        .await
        .with_context(|| format!("failed to deliver message to {queue}"))
}

async fn shutdown_channel(channel: Channel) {
    if channel.connection().is_closed() {
        return;
    }
    if let Err(error) = channel.close_channel().await {
        warn!(?error, "failed to close channel cleanly");
    }
}

async fn write_stdout(line: &str) -> io::Result<()> {
    let mut stdout = io::stdout();
    stdout.write_all(line.as_bytes()).await?;
    stdout.write_all(b"\n").await?;
    stdout.flush().await
}
