//! Client-side transport for a JSON message broker.
//!
//! One TCP connection to the broker is shared by any number of logical channels.
//! Each module focuses on a concrete responsibility:
//!
//! - [`connection`] dials the broker once (with optional deadline and cancellation),
//!   owns the single writer and runs the reader that feeds consumers.
//! - [`registry`] tracks the streams open on a connection.
//! - [`channel`] is the per-stream handle: assert queues, deliver, consume, close.
//! - [`message`] is the newline-delimited JSON frame codec.
//! - [`cli`] and [`client`] back the `broker-channels` binary.

pub mod channel;
pub mod cli;
pub mod client;
pub mod connection;
pub mod error;
pub mod message;
pub mod registry;

pub use channel::{Channel, ChannelHandler, Subscription};
pub use connection::{ConnectOptions, Connection, connect, connect_with};
pub use error::{ChannelError, Result};
pub use message::{Envelope, QueueType};
pub use registry::{StreamId, StreamRegistry};
