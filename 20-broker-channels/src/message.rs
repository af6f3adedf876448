use std::{fmt, io, str::FromStr};

use serde::{Deserialize, Serialize, de::DeserializeOwned};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{ChannelError, Result};

const LINE_ENDINGS: &[char] = &['\n', '\r'];

/// Routing model requested for a queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum QueueType {
    /// Point to point: each message goes to a single consumer.
    #[serde(rename = "P2P")]
    PointToPoint,
    /// Broadcast to every subscribed consumer.
    #[serde(rename = "PUBSUB")]
    PubSub,
}

impl QueueType {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueType::PointToPoint => "P2P",
            QueueType::PubSub => "PUBSUB",
        }
    }
}

impl fmt::Display for QueueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for QueueType {
    type Err = ChannelError;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_ascii_uppercase().as_str() {
            "P2P" => Ok(QueueType::PointToPoint),
            "PUBSUB" => Ok(QueueType::PubSub),
            _ => Err(ChannelError::UnknownQueueType(value.to_string())),
        }
    }
}

/// Asks the broker to create (or confirm) a queue.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "PascalCase")]
pub struct QueueDeclaration {
    pub name: String,
    #[serde(rename = "Type")]
    pub queue_type: QueueType,
    pub durable: bool,
}

/// A message body addressed to a route.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "PascalCase")]
pub struct Envelope {
    pub route: String,
    #[serde(rename = "Type")]
    pub queue_type: QueueType,
    #[serde(with = "body_encoding")]
    pub body: Vec<u8>,
}

/// Subscribes the connection to messages published on a route.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "PascalCase")]
pub struct ConsumeRequest {
    pub route: String,
    #[serde(rename = "Type")]
    pub queue_type: QueueType,
    pub durable: bool,
}

/// Every object that travels on the wire, discriminated by `MessageType`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "MessageType")]
pub enum Frame {
    Queue(QueueDeclaration),
    #[serde(rename = "EPMessage")]
    Envelope(Envelope),
    Consume(ConsumeRequest),
}

impl Frame {
    pub fn kind(&self) -> &'static str {
        match self {
            Frame::Queue(_) => "Queue",
            Frame::Envelope(_) => "EPMessage",
            Frame::Consume(_) => "Consume",
        }
    }
}

/// Encode a frame as one line of compact JSON, newline included.
pub fn encode_frame(frame: &Frame) -> Result<Vec<u8>> {
    let mut encoded = serde_json::to_vec(frame).map_err(|source| ChannelError::Serialization {
        kind: frame.kind(),
        source,
    })?;
    encoded.push(b'\n');
    Ok(encoded)
}

/// Write an already encoded frame and flush it.
pub async fn write_encoded<W>(writer: &mut W, encoded: &[u8]) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(encoded).await?;
    writer.flush().await
}

pub async fn write_frame<W>(writer: &mut W, frame: &Frame) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let encoded = encode_frame(frame)?;
    write_encoded(writer, &encoded)
        .await
        .map_err(ChannelError::from_write)
}

/// Read the next newline-delimited JSON value, skipping blank lines.
///
/// Returns `Ok(None)` at end of stream. A line that fails to decode surfaces as
/// `io::ErrorKind::InvalidData`; the line is consumed, so the caller may keep reading.
pub async fn read_frame<R, T>(reader: &mut R) -> io::Result<Option<T>>
where
    R: AsyncBufRead + Unpin,
    T: DeserializeOwned,
{
    let mut line = String::new();
    loop {
        line.clear();
        let bytes = reader.read_line(&mut line).await?;
        if bytes == 0 {
            return Ok(None);
        }

        let trimmed = line.trim_end_matches(LINE_ENDINGS);
        if trimmed.is_empty() {
            continue;
        }

        let parsed = serde_json::from_str(trimmed).map_err(to_io_error)?;
        return Ok(Some(parsed));
    }
}

fn to_io_error(err: serde_json::Error) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, err)
}

/// Bodies travel as standard base64 strings.
mod body_encoding {
    use base64::{Engine, engine::general_purpose::STANDARD};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(body: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&STANDARD.encode(body))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let encoded = Option::<String>::deserialize(deserializer)?;
        match encoded {
            Some(encoded) => STANDARD.decode(encoded).map_err(serde::de::Error::custom),
            None => Ok(Vec::new()),
        }
    }
}
