//! Connection bootstrap and the shared transport every channel writes through.

use std::{
    future::{self, Future},
    net::SocketAddr,
    sync::{
        Arc, Weak,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use tokio::{
    io::{AsyncWriteExt, BufReader},
    net::{
        TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    select,
    sync::{Mutex, oneshot},
    task::JoinHandle,
};
use tracing::{debug, error, info, warn};

use crate::{
    channel::Channel,
    error::{ChannelError, Result},
    message::{self, Frame},
    registry::{StreamId, StreamRegistry},
};

/// Inbound envelopes buffered per consuming stream before the reader starts dropping.
pub const DEFAULT_INBOUND_CAPACITY: usize = 64;

#[derive(Debug, Clone)]
pub struct ConnectOptions {
    /// Give up on the dial after this long. `None` waits for the OS to decide.
    pub connect_timeout: Option<Duration>,
    pub inbound_capacity: usize,
    /// Refuse `create_channel` once this many streams are open. `None` means no cap.
    pub max_streams: Option<usize>,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            connect_timeout: None,
            inbound_capacity: DEFAULT_INBOUND_CAPACITY,
            max_streams: None,
        }
    }
}

/// Dial the broker once with default options and no way to cancel.
pub async fn connect(address: &str) -> Result<Connection> {
    connect_with(address, &ConnectOptions::default(), future::pending()).await
}

/// Dial the broker once.
///
/// The dial runs on its own task and reports back through a single oneshot, so the
/// outcome is decided exactly once. Resolving `cancel` or hitting the configured
/// deadline aborts the dial.
pub async fn connect_with<F>(address: &str, options: &ConnectOptions, cancel: F) -> Result<Connection>
where
    F: Future<Output = ()> + Send,
{
    establish(address, options, cancel, TcpStream::connect(address.to_string())).await
}

async fn establish<F, D>(address: &str, options: &ConnectOptions, cancel: F, dial: D) -> Result<Connection>
where
    F: Future<Output = ()> + Send,
    D: Future<Output = std::io::Result<TcpStream>> + Send + 'static,
{
    let (outcome_tx, outcome_rx) = oneshot::channel();
    let dial = tokio::spawn(async move {
        let _ = outcome_tx.send(dial.await);
    });

    let deadline = async {
        match options.connect_timeout {
            Some(timeout) => tokio::time::sleep(timeout).await,
            None => future::pending().await,
        }
    };
    tokio::pin!(cancel);
    tokio::pin!(deadline);

    let outcome = select! {
        biased;
        _ = &mut cancel => {
            dial.abort();
            return Err(ChannelError::DialCancelled { address: address.to_string() });
        }
        _ = &mut deadline => {
            dial.abort();
            return Err(ChannelError::DialTimeout {
                address: address.to_string(),
                timeout: options.connect_timeout.unwrap_or_default(),
            });
        }
        outcome = outcome_rx => outcome,
    };

    let stream = match outcome {
        Ok(Ok(stream)) => stream,
        Ok(Err(source)) => {
            return Err(ChannelError::Dial {
                address: address.to_string(),
                source,
            });
        }
        Err(_) => {
            return Err(ChannelError::Dial {
                address: address.to_string(),
                source: std::io::Error::other("dial task ended without reporting"),
            });
        }
    };

    let connection = Connection::from_stream(address, stream, options)?;
    info!(peer = %connection.peer_addr(), "connected to message broker");
    Ok(connection)
}

struct Shared {
    peer: SocketAddr,
    writer: Mutex<Option<OwnedWriteHalf>>,
    closed: AtomicBool,
    registry: StreamRegistry,
    inbound_capacity: usize,
    reader: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl Drop for Shared {
    fn drop(&mut self) {
        let reader = match self.reader.get_mut() {
            Ok(reader) => reader.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(reader) = reader {
            reader.abort();
        }
    }
}

/// Handle to the one physical broker connection.
///
/// Clones share the same socket, writer lock and stream registry.
#[derive(Clone)]
pub struct Connection {
    shared: Arc<Shared>,
}

impl Connection {
    fn from_stream(address: &str, stream: TcpStream, options: &ConnectOptions) -> Result<Self> {
        let peer = stream.peer_addr().map_err(|source| ChannelError::Dial {
            address: address.to_string(),
            source,
        })?;
        let (reader, writer) = stream.into_split();

        let connection = Self::from_parts(peer, writer, options);
        let shared = &connection.shared;
        let handle = tokio::spawn(run_reader(BufReader::new(reader), Arc::downgrade(shared)));
        match shared.reader.lock() {
            Ok(mut slot) => *slot = Some(handle),
            Err(poisoned) => *poisoned.into_inner() = Some(handle),
        }

        Ok(connection)
    }

    /// A connection over `writer` with no reader task attached yet.
    fn from_parts(peer: SocketAddr, writer: OwnedWriteHalf, options: &ConnectOptions) -> Self {
        Self {
            shared: Arc::new(Shared {
                peer,
                writer: Mutex::new(Some(writer)),
                closed: AtomicBool::new(false),
                registry: StreamRegistry::with_max_streams(options.max_streams),
                inbound_capacity: options.inbound_capacity,
                reader: std::sync::Mutex::new(None),
            }),
        }
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.shared.peer
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    pub fn registry(&self) -> &StreamRegistry {
        &self.shared.registry
    }

    pub(crate) fn inbound_capacity(&self) -> usize {
        self.shared.inbound_capacity
    }

    /// Open a new logical stream on this connection.
    ///
    /// Fails with `TooManyStreams` when the connection is at its configured cap.
    pub async fn create_channel(&self) -> Result<Channel> {
        if self.is_closed() {
            return Err(ChannelError::ConnectionClosed);
        }

        let stream_id = loop {
            let candidate = StreamId::generate();
            if self.shared.registry.try_insert(&candidate).await? {
                break candidate;
            }
            warn!(stream = %candidate, "stream id collision, generating another");
        };

        debug!(stream = %stream_id, "channel created");
        Ok(Channel::new(stream_id, self.clone()))
    }

    /// Encode and write one frame under the writer lock.
    pub(crate) async fn send_frame(&self, frame: &Frame) -> Result<()> {
        let encoded = message::encode_frame(frame).inspect_err(|err| {
            error!(error = %err, "unable to encode frame");
        })?;

        if self.is_closed() {
            return Err(ChannelError::ConnectionClosed);
        }

        let mut guard = self.shared.writer.lock().await;
        let Some(writer) = guard.as_mut() else {
            return Err(ChannelError::ConnectionClosed);
        };

        match message::write_encoded(writer, &encoded).await {
            Ok(()) => Ok(()),
            Err(err) => {
                let err = ChannelError::from_write(err);
                if err.is_connection_closed() {
                    error!(peer = %self.shared.peer, "connection was closed");
                    self.mark_closed();
                } else {
                    error!(error = %err, "unable to write to message broker");
                }
                Err(err)
            }
        }
    }

    /// Called when a stream leaves the registry. The last one out closes the transport.
    pub(crate) async fn release_stream(&self, id: &StreamId) -> Result<()> {
        let remaining = self
            .shared
            .registry
            .remove(id)
            .await
            .ok_or_else(|| ChannelError::UnknownStream(id.to_string()))?;

        debug!(stream = %id, remaining, "channel closed");
        if remaining == 0 {
            self.shutdown_transport().await;
        }
        Ok(())
    }

    /// Shut the transport down and forget every stream.
    pub async fn close(&self) {
        self.shutdown_transport().await;
        self.shared.registry.clear().await;
    }

    async fn shutdown_transport(&self) {
        self.mark_closed();

        let writer = self.shared.writer.lock().await.take();
        if let Some(mut writer) = writer {
            if let Err(error) = writer.shutdown().await {
                debug!(?error, "failed to shut down broker writer cleanly");
            }
            info!(peer = %self.shared.peer, "closed connection to message broker");
        }

        let reader = match self.shared.reader.lock() {
            Ok(mut slot) => slot.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(reader) = reader {
            reader.abort();
        }
        self.shared.registry.close_subscriptions().await;
    }

    fn mark_closed(&self) {
        self.shared.closed.store(true, Ordering::Release);
    }
}

async fn run_reader(mut reader: BufReader<OwnedReadHalf>, shared: Weak<Shared>) {
    loop {
        let next = message::read_frame::<_, Frame>(&mut reader).await;
        let Some(state) = shared.upgrade() else {
            return;
        };

        match next {
            Ok(Some(Frame::Envelope(envelope))) => {
                let route = envelope.route.clone();
                let delivered = state.registry.dispatch(envelope).await;
                debug!(%route, delivered, "dispatched inbound message");
            }
            Ok(Some(other)) => {
                debug!(kind = other.kind(), "ignoring inbound frame");
            }
            Ok(None) => {
                info!(peer = %state.peer, "message broker closed the connection");
                break;
            }
            Err(err) if err.kind() == std::io::ErrorKind::InvalidData => {
                warn!(error = %err, "skipping malformed frame from broker");
            }
            Err(err) => {
                warn!(error = %err, "failed to read from message broker");
                break;
            }
        }
    }

    if let Some(state) = shared.upgrade() {
        state.closed.store(true, Ordering::Release);
        state.registry.close_subscriptions().await;
    }
}
