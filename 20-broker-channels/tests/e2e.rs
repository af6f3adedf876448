use std::{path::Path, process::Stdio, time::Duration};

use anyhow::{Context, Result, anyhow};
use broker_channels::{
    QueueType,
    message::{ConsumeRequest, Envelope, Frame, QueueDeclaration, read_frame, write_frame},
};
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    net::{TcpListener, TcpStream},
    process::{Child, ChildStdout, Command},
    time::timeout,
};

const READ_TIMEOUT: Duration = Duration::from_secs(5);

#[tokio::test]
async fn publish_asserts_then_delivers() -> Result<()> {
    let binary = assert_cmd::cargo::cargo_bin!("broker-channels");
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?.to_string();

    let mut child = Command::new(&binary)
        .args(["publish", "--broker", addr.as_str(), "--queue", "orders", "--durable"])
        .args(["first order", "second order"])
        .env("RUST_LOG", "warn")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .context("failed to spawn publisher")?;

    let mut broker = accept(&listener).await?;

    assert_eq!(
        next_frame(&mut broker).await?,
        Some(Frame::Queue(QueueDeclaration {
            name: "orders".into(),
            queue_type: QueueType::PointToPoint,
            durable: true,
        }))
    );
    for body in ["first order", "second order"] {
        assert_eq!(
            next_frame(&mut broker).await?,
            Some(Frame::Envelope(Envelope {
                route: "orders".into(),
                queue_type: QueueType::PointToPoint,
                body: body.as_bytes().to_vec(),
            }))
        );
    }

    // Closing its only channel makes the publisher hang up.
    assert_eq!(next_frame(&mut broker).await?, None);
    ensure_success(&mut child, "publisher").await
}

#[tokio::test]
async fn consume_prints_routed_bodies() -> Result<()> {
    let binary = assert_cmd::cargo::cargo_bin!("broker-channels");
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?.to_string();

    let (mut child, mut stdout) = spawn_consumer(&binary, &addr).await?;
    let mut broker = accept(&listener).await?;

    assert!(matches!(
        next_frame(&mut broker).await?,
        Some(Frame::Queue(QueueDeclaration { ref name, .. })) if name == "alerts"
    ));
    assert_eq!(
        next_frame(&mut broker).await?,
        Some(Frame::Consume(ConsumeRequest {
            route: "alerts".into(),
            queue_type: QueueType::PubSub,
            durable: false,
        }))
    );

    write_frame(
        broker.get_mut(),
        &Frame::Envelope(Envelope {
            route: "alerts".into(),
            queue_type: QueueType::PubSub,
            body: b"disk almost full".to_vec(),
        }),
    )
    .await?;

    assert_eq!(read_line(&mut stdout).await?, "disk almost full");

    drop(broker);
    assert_eq!(read_line(&mut stdout).await?, "*** broker closed the connection");
    ensure_success(&mut child, "consumer").await
}

#[tokio::test]
async fn unreachable_broker_fails_the_command() -> Result<()> {
    let binary = assert_cmd::cargo::cargo_bin!("broker-channels");
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?.to_string();
    drop(listener);

    let status = Command::new(&binary)
        .args(["publish", "--broker", addr.as_str(), "--queue", "orders", "never sent"])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await?;

    assert!(!status.success());
    Ok(())
}

async fn spawn_consumer(binary: &Path, addr: &str) -> Result<(Child, BufReader<ChildStdout>)> {
    let mut child = Command::new(binary)
        .args(["consume", "--broker", addr, "--queue", "alerts", "--queue-type", "PUBSUB"])
        .env("RUST_LOG", "warn")
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .spawn()
        .context("failed to spawn consumer")?;

    let stdout = child
        .stdout
        .take()
        .context("consumer stdout missing after spawn")?;
    Ok((child, BufReader::new(stdout)))
}

async fn accept(listener: &TcpListener) -> Result<BufReader<TcpStream>> {
    let (stream, _) = timeout(READ_TIMEOUT, listener.accept())
        .await
        .context("client never connected")??;
    Ok(BufReader::new(stream))
}

async fn next_frame(broker: &mut BufReader<TcpStream>) -> Result<Option<Frame>> {
    let frame = timeout(READ_TIMEOUT, read_frame::<_, Frame>(broker))
        .await
        .context("timed out waiting for a frame")??;
    Ok(frame)
}

async fn read_line(reader: &mut BufReader<ChildStdout>) -> Result<String> {
    let mut line = String::new();
    let bytes = timeout(READ_TIMEOUT, reader.read_line(&mut line))
        .await
        .context("timed out waiting for consumer output")??;
    if bytes == 0 {
        return Err(anyhow!("consumer stdout closed"));
    }
    Ok(line.trim_end_matches(['\r', '\n']).to_string())
}

async fn ensure_success(child: &mut Child, name: &str) -> Result<()> {
    let status = timeout(READ_TIMEOUT, child.wait())
        .await
        .with_context(|| format!("{name} did not exit"))?
        .with_context(|| format!("failed to await {name} process"))?;
    if !status.success() {
        return Err(anyhow!("{name} exited with status {status}"));
    }
    Ok(())
}
