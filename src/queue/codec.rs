//! Event types and per-interface message codecs.
//!
//! A queue is typed by its message enum `M`. Every interface registered on
//! the queue carries a [`MessageCodec`] that turns packets addressed to that
//! interface back into `M` values, keyed by the numeric event id.

use crate::address::IfcAddr;
use crate::protocol::ProtocolError;
use std::fmt;
use thiserror::Error;

/// Errors raised by message codecs.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("event id {0} is not handled by this codec")]
    UnknownEvent(u32),

    #[error("message cannot be sent over the bus: {0}")]
    NotTransmissible(String),
}

/// A message that can be carried in a mailbox.
pub trait Message: Clone + Send + fmt::Debug + 'static {
    /// Numeric event id, used as the packet event id.
    fn event_id(&self) -> u32;
}

/// Encoder/decoder capability supplied when an interface is registered.
pub trait MessageCodec<M>: Send + Sync + 'static {
    /// Serialize the body of `message`.
    fn encode(&self, message: &M) -> Result<Vec<u8>, CodecError>;

    /// Decode a payload received with `event_id`.
    fn decode(&self, event_id: u32, payload: &[u8]) -> Result<M, CodecError>;
}

/// A message together with its routing information.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Event<M> {
    /// Event id.
    pub id: u32,
    /// Originating interface.
    pub sender: IfcAddr,
    /// Receiving interface on this queue (loopback for self-messages and
    /// timers).
    pub receiver: IfcAddr,
    /// Decoded message.
    pub body: M,
}

impl<M: Message> Event<M> {
    /// Wrap a message addressed to the loopback address.
    pub fn local(body: M) -> Self {
        Self {
            id: body.event_id(),
            sender: IfcAddr::LOOPBACK,
            receiver: IfcAddr::LOOPBACK,
            body,
        }
    }
}

// ============================================================================
// Raw messages
// ============================================================================

/// An uninterpreted event: id plus payload bytes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RawMessage {
    pub id: u32,
    pub payload: Vec<u8>,
}

impl RawMessage {
    pub fn new(id: u32, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            id,
            payload: payload.into(),
        }
    }
}

impl Message for RawMessage {
    fn event_id(&self) -> u32 {
        self.id
    }
}

/// Pass-through codec for [`RawMessage`].
#[derive(Clone, Copy, Debug, Default)]
pub struct RawCodec;

impl MessageCodec<RawMessage> for RawCodec {
    fn encode(&self, message: &RawMessage) -> Result<Vec<u8>, CodecError> {
        Ok(message.payload.clone())
    }

    fn decode(&self, event_id: u32, payload: &[u8]) -> Result<RawMessage, CodecError> {
        Ok(RawMessage::new(event_id, payload))
    }
}
