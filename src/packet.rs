//! Packet Envelope
//!
//! The unit of switching between routers and of delivery into mailboxes.
//! A packet is built once and then moved from owner to owner; `Clone`
//! produces an independent deep copy of the payload.

use crate::address::IfcAddr;
use std::fmt;

/// First type code of the reserved out-of-band range.
pub const OUT_OF_BAND_BASE: u8 = 0xF0;

/// Packet type tag.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PacketType {
    /// Point-to-point event.
    Unicast,
    /// Request to join the sender into the receiver's multicast group.
    MulticastJoin,
    /// Request to remove the sender from the receiver's multicast group.
    MulticastLeave,
    /// Event fanned out to the multicast group of the receiver address.
    Multicast,
    /// The sender address has died.
    DeathNotification,
    /// Address assignment during the port handshake.
    DhcpOffer,
    /// Transport-private signaling (never routed).
    OutOfBand(u8),
}

impl PacketType {
    /// Try to convert from a wire byte.
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            0x01 => Some(PacketType::Unicast),
            0x02 => Some(PacketType::MulticastJoin),
            0x03 => Some(PacketType::MulticastLeave),
            0x04 => Some(PacketType::Multicast),
            0x05 => Some(PacketType::DeathNotification),
            0x06 => Some(PacketType::DhcpOffer),
            b if b >= OUT_OF_BAND_BASE => Some(PacketType::OutOfBand(b)),
            _ => None,
        }
    }

    /// Convert to a wire byte.
    pub fn to_byte(self) -> u8 {
        match self {
            PacketType::Unicast => 0x01,
            PacketType::MulticastJoin => 0x02,
            PacketType::MulticastLeave => 0x03,
            PacketType::Multicast => 0x04,
            PacketType::DeathNotification => 0x05,
            PacketType::DhcpOffer => 0x06,
            PacketType::OutOfBand(b) => b,
        }
    }

    /// Control types handled hop-by-hop rather than forwarded verbatim.
    pub fn is_hop_control(self) -> bool {
        matches!(
            self,
            PacketType::MulticastJoin
                | PacketType::MulticastLeave
                | PacketType::DeathNotification
        )
    }
}

impl fmt::Display for PacketType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PacketType::Unicast => write!(f, "unicast"),
            PacketType::MulticastJoin => write!(f, "multicast_join"),
            PacketType::MulticastLeave => write!(f, "multicast_leave"),
            PacketType::Multicast => write!(f, "multicast"),
            PacketType::DeathNotification => write!(f, "death_notification"),
            PacketType::DhcpOffer => write!(f, "dhcp_offer"),
            PacketType::OutOfBand(b) => write!(f, "oob:{:02x}", b),
        }
    }
}

/// A routed packet.
#[derive(Clone, PartialEq, Eq)]
pub struct Packet {
    packet_type: PacketType,
    sender: IfcAddr,
    receiver: IfcAddr,
    event_id: u32,
    payload: Vec<u8>,
}

impl Packet {
    /// Create a packet, taking ownership of the payload.
    pub fn new(
        packet_type: PacketType,
        sender: IfcAddr,
        receiver: IfcAddr,
        event_id: u32,
        payload: Vec<u8>,
    ) -> Self {
        debug_assert!(payload.len() <= u32::MAX as usize);
        Self {
            packet_type,
            sender,
            receiver,
            event_id,
            payload,
        }
    }

    /// Create a payload-less control packet.
    pub fn control(packet_type: PacketType, sender: IfcAddr, receiver: IfcAddr) -> Self {
        Self::new(packet_type, sender, receiver, 0, Vec::new())
    }

    /// Create a packet from an encoded event.
    pub fn from_event(
        multicast: bool,
        sender: IfcAddr,
        receiver: IfcAddr,
        event_id: u32,
        payload: Vec<u8>,
    ) -> Self {
        let packet_type = if multicast {
            PacketType::Multicast
        } else {
            PacketType::Unicast
        };
        Self::new(packet_type, sender, receiver, event_id, payload)
    }

    pub fn packet_type(&self) -> PacketType {
        self.packet_type
    }

    pub fn sender(&self) -> IfcAddr {
        self.sender
    }

    pub fn receiver(&self) -> IfcAddr {
        self.receiver
    }

    pub fn event_id(&self) -> u32 {
        self.event_id
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Consume the packet, returning its payload.
    pub fn into_payload(self) -> Vec<u8> {
        self.payload
    }

    pub fn payload_len(&self) -> usize {
        self.payload.len()
    }

    pub fn set_sender(&mut self, sender: IfcAddr) {
        self.sender = sender;
    }

    pub fn set_receiver(&mut self, receiver: IfcAddr) {
        self.receiver = receiver;
    }
}

impl fmt::Debug for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Packet")
            .field("type", &self.packet_type)
            .field("sender", &format_args!("{}", self.sender))
            .field("receiver", &format_args!("{}", self.receiver))
            .field("event_id", &self.event_id)
            .field("payload", &hex::encode(&self.payload))
            .finish()
    }
}
