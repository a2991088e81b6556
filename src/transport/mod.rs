//! Transport Layer Abstractions
//!
//! A transport is the byte pipe underneath a [`Port`](crate::port::Port).
//! It moves whole packets to the peer and reports link events back through
//! a [`PortLink`]. The port owns the handshake and routing semantics; a
//! transport only knows how to connect, frame and carry packets.

pub mod pipe;
#[cfg(test)]
pub(crate) mod recorder;
pub mod tcp;

use crate::packet::Packet;
use crate::port::PortLink;
use async_trait::async_trait;
use std::fmt;
use thiserror::Error;

// ============================================================================
// Errors
// ============================================================================

/// Errors related to transport operations.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport not started")]
    NotStarted,

    #[error("transport already started")]
    AlreadyStarted,

    #[error("transport failed to start: {0}")]
    StartFailed(String),

    #[error("send failed: {0}")]
    SendFailed(String),

    #[error("packet too large: max {max}, got {got}")]
    PacketTooLarge { max: usize, got: usize },

    #[error("invalid transport address: {0}")]
    InvalidAddress(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

// ============================================================================
// Transport State
// ============================================================================

/// Transport lifecycle state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransportState {
    /// Created but not started.
    Configured,
    /// Carrying packets.
    Up,
    /// Stopped, or the peer went away.
    Down,
}

impl TransportState {
    /// Check if the transport is operational.
    pub fn is_operational(&self) -> bool {
        matches!(self, TransportState::Up)
    }

    /// Check if the transport can be started.
    pub fn can_start(&self) -> bool {
        matches!(self, TransportState::Configured)
    }
}

impl fmt::Display for TransportState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TransportState::Configured => "configured",
            TransportState::Up => "up",
            TransportState::Down => "down",
        };
        write!(f, "{}", s)
    }
}

// ============================================================================
// Port Transport Trait
// ============================================================================

/// Packet carrier underneath a port.
///
/// Callbacks on the [`PortLink`] given to `start` must be made from a
/// single I/O context, one at a time: `connected` once the link is usable,
/// `received_packet` for every inbound packet, and `disconnected` when the
/// peer goes away.
#[async_trait]
pub trait PortTransport: Send + Sync + 'static {
    /// Short description for logs.
    fn describe(&self) -> String;

    /// Start carrying packets, reporting link events to `link`.
    async fn start(&self, link: PortLink) -> Result<(), TransportError>;

    /// Stop the transport. Never reports `disconnected` for a local stop.
    async fn stop(&self);

    /// Queue a packet for the peer.
    fn transmit(&self, packet: Packet) -> Result<(), TransportError>;
}
