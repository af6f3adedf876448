use std::future::Future;

use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::{
    connection::Connection,
    error::{ChannelError, Result},
    message::{ConsumeRequest, Envelope, Frame, QueueDeclaration, QueueType},
    registry::StreamId,
};

/// What a logical stream can do against the broker.
pub trait ChannelHandler {
    /// Declare `name` on the broker and bind this channel to it.
    ///
    /// The returned name is confirmed locally: the broker does not acknowledge it, the
    /// socket only accepted the bytes.
    fn assert_queue(
        &mut self,
        name: &str,
        queue_type: QueueType,
        durable: bool,
    ) -> impl Future<Output = Result<String>> + Send;

    /// Publish `body` to `route`. Fire-and-forget.
    fn deliver_message(
        &self,
        route: &str,
        body: &[u8],
        queue_type: QueueType,
    ) -> impl Future<Output = Result<()>> + Send;

    /// Start receiving messages published on `route`.
    fn consume(
        &mut self,
        route: &str,
        queue_type: QueueType,
        durable: bool,
    ) -> impl Future<Output = Result<Subscription>> + Send;

    /// Remove the channel from its connection. The last channel closes the transport.
    fn close_channel(self) -> impl Future<Output = Result<()>> + Send;
}

/// A logical stream multiplexed over a shared [`Connection`].
pub struct Channel {
    stream_id: StreamId,
    bound_to: Option<String>,
    connection: Connection,
}

impl Channel {
    pub(crate) fn new(stream_id: StreamId, connection: Connection) -> Self {
        Self {
            stream_id,
            bound_to: None,
            connection,
        }
    }

    pub fn stream_id(&self) -> &StreamId {
        &self.stream_id
    }

    /// Queue this channel was bound to by its last successful assertion.
    pub fn bound_to(&self) -> Option<&str> {
        self.bound_to.as_deref()
    }

    pub fn connection(&self) -> &Connection {
        &self.connection
    }
}

impl ChannelHandler for Channel {
    async fn assert_queue(
        &mut self,
        name: &str,
        queue_type: QueueType,
        durable: bool,
    ) -> Result<String> {
        let frame = Frame::Queue(QueueDeclaration {
            name: name.to_string(),
            queue_type,
            durable,
        });
        self.connection.send_frame(&frame).await?;

        self.connection.registry().bind(&self.stream_id, name).await;
        self.bound_to = Some(name.to_string());
        info!(stream = %self.stream_id, queue = name, %queue_type, durable, "queue asserted");
        Ok(name.to_string())
    }

    async fn deliver_message(&self, route: &str, body: &[u8], queue_type: QueueType) -> Result<()> {
        debug!(stream = %self.stream_id, route, bytes = body.len(), "delivering message");
        let frame = Frame::Envelope(Envelope {
            route: route.to_string(),
            queue_type,
            body: body.to_vec(),
        });
        self.connection.send_frame(&frame).await
    }

    async fn consume(
        &mut self,
        route: &str,
        queue_type: QueueType,
        durable: bool,
    ) -> Result<Subscription> {
        let registry = self.connection.registry();
        let receiver = registry
            .subscribe(&self.stream_id, route, self.connection.inbound_capacity())
            .await
            .ok_or_else(|| ChannelError::UnknownStream(self.stream_id.to_string()))?;

        let frame = Frame::Consume(ConsumeRequest {
            route: route.to_string(),
            queue_type,
            durable,
        });
        if let Err(err) = self.connection.send_frame(&frame).await {
            registry.unsubscribe(&self.stream_id).await;
            return Err(err);
        }

        info!(stream = %self.stream_id, route, %queue_type, "consuming");
        Ok(Subscription {
            stream_id: self.stream_id.clone(),
            route: route.to_string(),
            receiver,
        })
    }

    async fn close_channel(self) -> Result<()> {
        self.connection.release_stream(&self.stream_id).await
    }
}

/// Inbound side of a [`ChannelHandler::consume`] call.
pub struct Subscription {
    stream_id: StreamId,
    route: String,
    receiver: mpsc::Receiver<Envelope>,
}

impl Subscription {
    pub fn stream_id(&self) -> &StreamId {
        &self.stream_id
    }

    pub fn route(&self) -> &str {
        &self.route
    }

    /// Next envelope for this route, or `None` once the channel or connection closed.
    pub async fn recv(&mut self) -> Option<Envelope> {
        self.receiver.recv().await
    }
}
