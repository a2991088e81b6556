//! Byte-Stream Frame Format
//!
//! Every packet carried over a byte-stream transport is prefixed by a fixed
//! 32-byte header. All integers are big-endian.
//!
//! ```text
//! [msg_len:4][event_id:4][sender:8][receiver:8][type:1][pad:7][payload:msg_len]
//! ```

use super::ProtocolError;
use crate::address::IfcAddr;
use crate::packet::{Packet, PacketType};

/// Size of the frame header.
pub const FRAME_HEADER_SIZE: usize = 32;

/// Largest payload a frame may announce.
pub const MAX_PAYLOAD: usize = 16 * 1024 * 1024;

/// Parsed frame header.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FrameHeader {
    pub msg_len: u32,
    pub event_id: u32,
    pub sender: IfcAddr,
    pub receiver: IfcAddr,
    pub packet_type: PacketType,
}

impl FrameHeader {
    /// Build the header describing `packet`.
    pub fn for_packet(packet: &Packet) -> Self {
        Self {
            msg_len: packet.payload_len() as u32,
            event_id: packet.event_id(),
            sender: packet.sender(),
            receiver: packet.receiver(),
            packet_type: packet.packet_type(),
        }
    }

    /// Encode to the fixed header layout.
    pub fn encode(&self) -> [u8; FRAME_HEADER_SIZE] {
        let mut buf = [0u8; FRAME_HEADER_SIZE];
        buf[0..4].copy_from_slice(&self.msg_len.to_be_bytes());
        buf[4..8].copy_from_slice(&self.event_id.to_be_bytes());
        buf[8..16].copy_from_slice(&self.sender.to_be_bytes());
        buf[16..24].copy_from_slice(&self.receiver.to_be_bytes());
        buf[24] = self.packet_type.to_byte();
        buf
    }

    /// Parse a header from the start of `data`.
    pub fn parse(data: &[u8]) -> Result<Self, ProtocolError> {
        if data.len() < FRAME_HEADER_SIZE {
            return Err(ProtocolError::MessageTooShort {
                expected: FRAME_HEADER_SIZE,
                got: data.len(),
            });
        }

        let msg_len = u32::from_be_bytes([data[0], data[1], data[2], data[3]]);
        if msg_len as usize > MAX_PAYLOAD {
            return Err(ProtocolError::MessageTooLong {
                max: MAX_PAYLOAD,
                got: msg_len as usize,
            });
        }
        let event_id = u32::from_be_bytes([data[4], data[5], data[6], data[7]]);
        let mut addr = [0u8; 8];
        addr.copy_from_slice(&data[8..16]);
        let sender = IfcAddr::from_be_bytes(addr);
        addr.copy_from_slice(&data[16..24]);
        let receiver = IfcAddr::from_be_bytes(addr);
        let packet_type =
            PacketType::from_byte(data[24]).ok_or(ProtocolError::InvalidPacketType(data[24]))?;

        Ok(Self {
            msg_len,
            event_id,
            sender,
            receiver,
            packet_type,
        })
    }
}

/// Encode a packet as a complete frame.
///
/// The payload must not exceed [`MAX_PAYLOAD`]; the receiving side rejects
/// larger frames.
pub fn encode_frame(packet: &Packet) -> Vec<u8> {
    let header = FrameHeader::for_packet(packet);
    let mut out = Vec::with_capacity(FRAME_HEADER_SIZE + packet.payload_len());
    out.extend_from_slice(&header.encode());
    out.extend_from_slice(packet.payload());
    out
}

/// Decode exactly one complete frame.
pub fn decode_frame(data: &[u8]) -> Result<Packet, ProtocolError> {
    let header = FrameHeader::parse(data)?;
    let expected = FRAME_HEADER_SIZE + header.msg_len as usize;
    if data.len() != expected {
        return Err(ProtocolError::SizeMismatch {
            expected,
            got: data.len(),
        });
    }
    Ok(Packet::new(
        header.packet_type,
        header.sender,
        header.receiver,
        header.event_id,
        data[FRAME_HEADER_SIZE..].to_vec(),
    ))
}

/// Incremental deframer for a byte stream.
///
/// Bytes are appended as they arrive; complete packets are popped in order.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: Vec<u8>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append received bytes.
    pub fn extend(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Number of buffered bytes not yet consumed.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Pop the next complete packet, if one is buffered.
    ///
    /// A header error is fatal for the stream; the caller must drop the
    /// connection.
    pub fn next_packet(&mut self) -> Result<Option<Packet>, ProtocolError> {
        if self.buf.len() < FRAME_HEADER_SIZE {
            return Ok(None);
        }
        let header = FrameHeader::parse(&self.buf)?;
        let total = FRAME_HEADER_SIZE + header.msg_len as usize;
        if self.buf.len() < total {
            return Ok(None);
        }
        let payload = self.buf[FRAME_HEADER_SIZE..total].to_vec();
        self.buf.drain(..total);
        Ok(Some(Packet::new(
            header.packet_type,
            header.sender,
            header.receiver,
            header.event_id,
            payload,
        )))
    }
}
