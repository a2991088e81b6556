//! DHCP-OFFER: address assignment sent by the accepting side of a port.
//!
//! ```text
//! [version:4 = 1][prefix_len:1][pad:3][address:8][name_server:8]
//! ```
//!
//! The prefix must leave at least one host bit, and the offered network
//! address must have no bits set past the prefix.

use super::ProtocolError;
use crate::address::{HOST_ADDR_BITS, IfcAddr, network_mask};

/// Current offer format version.
pub const DHCP_OFFER_VERSION: u32 = 1;

/// Encoded size of an offer.
pub const DHCP_OFFER_SIZE: usize = 24;

/// Address lease offered to a downstream peer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DhcpOffer {
    pub version: u32,
    /// Prefix length of the delegated network.
    pub prefix_len: u8,
    /// Network address delegated to the peer.
    pub address: IfcAddr,
    /// Global address of the offering router's name server.
    pub name_server: IfcAddr,
}

impl DhcpOffer {
    pub fn new(prefix_len: u8, address: IfcAddr, name_server: IfcAddr) -> Self {
        Self {
            version: DHCP_OFFER_VERSION,
            prefix_len,
            address,
            name_server,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(DHCP_OFFER_SIZE);
        buf.extend_from_slice(&self.version.to_be_bytes());
        buf.push(self.prefix_len);
        buf.extend_from_slice(&[0u8; 3]);
        buf.extend_from_slice(&self.address.to_be_bytes());
        buf.extend_from_slice(&self.name_server.to_be_bytes());
        buf
    }

    pub fn decode(payload: &[u8]) -> Result<Self, ProtocolError> {
        if payload.len() != DHCP_OFFER_SIZE {
            return Err(ProtocolError::SizeMismatch {
                expected: DHCP_OFFER_SIZE,
                got: payload.len(),
            });
        }
        let version = u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]);
        if version != DHCP_OFFER_VERSION {
            return Err(ProtocolError::UnsupportedVersion(version));
        }
        let prefix_len = payload[4];
        if prefix_len as u32 >= HOST_ADDR_BITS {
            return Err(ProtocolError::InvalidPrefixLength(prefix_len));
        }
        let mut addr = [0u8; 8];
        addr.copy_from_slice(&payload[8..16]);
        let address = IfcAddr::from_be_bytes(addr);
        if address.as_u64() & !network_mask(prefix_len) != 0 {
            return Err(ProtocolError::Malformed(format!(
                "offered network {} has bits past /{}",
                address, prefix_len
            )));
        }
        addr.copy_from_slice(&payload[16..24]);
        let name_server = IfcAddr::from_be_bytes(addr);

        Ok(Self {
            version,
            prefix_len,
            address,
            name_server,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_offer_encode_decode() {
        let offer = DhcpOffer::new(
            8,
            IfcAddr::new(0x0100_0000_0000_0000),
            IfcAddr::new(0x0000_0000_0100_0001),
        );
        let bytes = offer.encode();
        assert_eq!(bytes.len(), DHCP_OFFER_SIZE);
        assert_eq!(&bytes[0..4], &[0, 0, 0, 1]);
        assert_eq!(bytes[4], 8);
        assert_eq!(DhcpOffer::decode(&bytes).unwrap(), offer);
    }

    #[test]
    fn test_offer_wrong_size() {
        assert_eq!(
            DhcpOffer::decode(&[0u8; 20]).unwrap_err(),
            ProtocolError::SizeMismatch {
                expected: DHCP_OFFER_SIZE,
                got: 20
            }
        );
    }

    #[test]
    fn test_offer_prefix_out_of_range() {
        for prefix_len in [HOST_ADDR_BITS as u8, 64, 250] {
            let bytes = DhcpOffer::new(prefix_len, IfcAddr::new(1 << 56), IfcAddr::new(2)).encode();
            assert_eq!(
                DhcpOffer::decode(&bytes).unwrap_err(),
                ProtocolError::InvalidPrefixLength(prefix_len)
            );
        }
        let longest = DhcpOffer::new(
            HOST_ADDR_BITS as u8 - 1,
            IfcAddr::new(1 << 56),
            IfcAddr::new(2),
        );
        assert_eq!(DhcpOffer::decode(&longest.encode()).unwrap(), longest);
    }

    #[test]
    fn test_offer_address_outside_prefix() {
        // Interface bits set.
        let bytes = DhcpOffer::new(8, IfcAddr::new((1 << 56) | 3), IfcAddr::new(2)).encode();
        assert!(matches!(
            DhcpOffer::decode(&bytes),
            Err(ProtocolError::Malformed(_))
        ));
        // Host bits past the prefix.
        let bytes = DhcpOffer::new(8, IfcAddr::new((1 << 56) | (1 << 40)), IfcAddr::new(2)).encode();
        assert!(matches!(
            DhcpOffer::decode(&bytes),
            Err(ProtocolError::Malformed(_))
        ));
    }

    #[test]
    fn test_offer_wrong_version() {
        let mut bytes = DhcpOffer::new(8, IfcAddr::new(1), IfcAddr::new(2)).encode();
        bytes[3] = 2;
        assert_eq!(
            DhcpOffer::decode(&bytes).unwrap_err(),
            ProtocolError::UnsupportedVersion(2)
        );
    }
}
