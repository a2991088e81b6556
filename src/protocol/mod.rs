//! Wire Protocols
//!
//! Byte layouts exchanged between routers:
//!
//! - **Frame**: the fixed header that delimits packets on byte-stream
//!   transports.
//! - **DHCP-OFFER**: address assignment sent by the accepting side of a port
//!   right after the link comes up.
//! - **Naming**: the request/reply protocol spoken with name servers.
//!
//! Application payloads are opaque here; they are produced and consumed by
//! the per-interface message codecs.

mod error;
mod frame;
mod naming;
mod offer;

pub use error::ProtocolError;
pub use frame::{
    decode_frame, encode_frame, FrameDecoder, FrameHeader, FRAME_HEADER_SIZE, MAX_PAYLOAD,
};
pub use naming::{
    NsCodec, NsMessage, DEREGISTER_NAME_REQ, MAX_NAME_LEN, NAME_REGISTERED_IND, QUERY_NAME_REPLY,
    QUERY_NAME_REQ, QUIT, REDIRECT_REPLY, REGISTER_NAME_REPLY, REGISTER_NAME_REQ,
};
pub use offer::{DhcpOffer, DHCP_OFFER_SIZE, DHCP_OFFER_VERSION};
