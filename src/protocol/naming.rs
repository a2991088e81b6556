//! Name server protocol messages.
//!
//! All names are UTF-8 and encoded with a 2-byte big-endian length prefix.
//!
//! | Event                 | Payload                                        |
//! |-----------------------|------------------------------------------------|
//! | `QUIT`                | (empty)                                        |
//! | `REGISTER_NAME_REQ`   | `[name][address:8][is_ns:1]`                   |
//! | `REGISTER_NAME_REPLY` | `[ok:1][domain]`                               |
//! | `DEREGISTER_NAME_REQ` | `[name]`                                       |
//! | `QUERY_NAME_REQ`      | `[name]`                                       |
//! | `QUERY_NAME_REPLY`    | `[found:1][address:8][is_ns:1]`                |
//! | `REDIRECT_REPLY`      | `[address:8]`                                  |
//! | `NAME_REGISTERED_IND` | (empty)                                        |

use super::ProtocolError;
use crate::address::IfcAddr;
use crate::queue::{CodecError, Message, MessageCodec};

pub const QUIT: u32 = 0x4e53_0000;
pub const REGISTER_NAME_REQ: u32 = 0x4e53_0001;
pub const REGISTER_NAME_REPLY: u32 = 0x4e53_0002;
pub const DEREGISTER_NAME_REQ: u32 = 0x4e53_0003;
pub const QUERY_NAME_REQ: u32 = 0x4e53_0004;
pub const QUERY_NAME_REPLY: u32 = 0x4e53_0005;
pub const REDIRECT_REPLY: u32 = 0x4e53_0006;
pub const NAME_REGISTERED_IND: u32 = 0x4e53_0007;

/// Longest name accepted on the wire.
pub const MAX_NAME_LEN: usize = 1024;

/// Name server protocol message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum NsMessage {
    /// Stop the name server; on the client side, the server went away.
    Quit,
    RegisterNameReq {
        name: String,
        address: IfcAddr,
        is_name_server: bool,
    },
    RegisterNameReply {
        ok: bool,
        /// Domain path of the replying server ("" for the root).
        domain: String,
    },
    DeregisterNameReq {
        name: String,
    },
    QueryNameReq {
        name: String,
    },
    QueryNameReply {
        /// `Some((address, is_name_server))` when the name resolved.
        result: Option<(IfcAddr, bool)>,
    },
    RedirectReply {
        name_server: IfcAddr,
    },
    NameRegisteredInd,
}

impl Message for NsMessage {
    fn event_id(&self) -> u32 {
        match self {
            NsMessage::Quit => QUIT,
            NsMessage::RegisterNameReq { .. } => REGISTER_NAME_REQ,
            NsMessage::RegisterNameReply { .. } => REGISTER_NAME_REPLY,
            NsMessage::DeregisterNameReq { .. } => DEREGISTER_NAME_REQ,
            NsMessage::QueryNameReq { .. } => QUERY_NAME_REQ,
            NsMessage::QueryNameReply { .. } => QUERY_NAME_REPLY,
            NsMessage::RedirectReply { .. } => REDIRECT_REPLY,
            NsMessage::NameRegisteredInd => NAME_REGISTERED_IND,
        }
    }
}

/// Codec for [`NsMessage`].
#[derive(Clone, Copy, Debug, Default)]
pub struct NsCodec;

fn put_name(buf: &mut Vec<u8>, name: &str) -> Result<(), ProtocolError> {
    if name.len() > MAX_NAME_LEN {
        return Err(ProtocolError::MessageTooLong {
            max: MAX_NAME_LEN,
            got: name.len(),
        });
    }
    buf.extend_from_slice(&(name.len() as u16).to_be_bytes());
    buf.extend_from_slice(name.as_bytes());
    Ok(())
}

/// Reads fields front-to-back, failing on truncation.
struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], ProtocolError> {
        if self.data.len() - self.pos < n {
            return Err(ProtocolError::MessageTooShort {
                expected: self.pos + n,
                got: self.data.len(),
            });
        }
        let slice = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8, ProtocolError> {
        Ok(self.take(1)?[0])
    }

    fn flag(&mut self) -> Result<bool, ProtocolError> {
        Ok(self.u8()? != 0)
    }

    fn addr(&mut self) -> Result<IfcAddr, ProtocolError> {
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(self.take(8)?);
        Ok(IfcAddr::from_be_bytes(bytes))
    }

    fn name(&mut self) -> Result<String, ProtocolError> {
        let len_bytes = self.take(2)?;
        let len = u16::from_be_bytes([len_bytes[0], len_bytes[1]]) as usize;
        let raw = self.take(len)?;
        String::from_utf8(raw.to_vec())
            .map_err(|e| ProtocolError::Malformed(format!("name is not UTF-8: {}", e)))
    }

    fn finish(&self) -> Result<(), ProtocolError> {
        if self.pos != self.data.len() {
            return Err(ProtocolError::SizeMismatch {
                expected: self.pos,
                got: self.data.len(),
            });
        }
        Ok(())
    }
}

impl MessageCodec<NsMessage> for NsCodec {
    fn encode(&self, message: &NsMessage) -> Result<Vec<u8>, CodecError> {
        let mut buf = Vec::new();
        match message {
            NsMessage::Quit | NsMessage::NameRegisteredInd => {}
            NsMessage::RegisterNameReq {
                name,
                address,
                is_name_server,
            } => {
                put_name(&mut buf, name)?;
                buf.extend_from_slice(&address.to_be_bytes());
                buf.push(u8::from(*is_name_server));
            }
            NsMessage::RegisterNameReply { ok, domain } => {
                buf.push(u8::from(*ok));
                put_name(&mut buf, domain)?;
            }
            NsMessage::DeregisterNameReq { name } | NsMessage::QueryNameReq { name } => {
                put_name(&mut buf, name)?;
            }
            NsMessage::QueryNameReply { result } => {
                let (address, is_ns) = result.unwrap_or((IfcAddr::LOOPBACK, false));
                buf.push(u8::from(result.is_some()));
                buf.extend_from_slice(&address.to_be_bytes());
                buf.push(u8::from(is_ns));
            }
            NsMessage::RedirectReply { name_server } => {
                buf.extend_from_slice(&name_server.to_be_bytes());
            }
        }
        Ok(buf)
    }

    fn decode(&self, event_id: u32, payload: &[u8]) -> Result<NsMessage, CodecError> {
        let mut r = Reader::new(payload);
        let message = match event_id {
            QUIT => NsMessage::Quit,
            NAME_REGISTERED_IND => NsMessage::NameRegisteredInd,
            REGISTER_NAME_REQ => NsMessage::RegisterNameReq {
                name: r.name()?,
                address: r.addr()?,
                is_name_server: r.flag()?,
            },
            REGISTER_NAME_REPLY => NsMessage::RegisterNameReply {
                ok: r.flag()?,
                domain: r.name()?,
            },
            DEREGISTER_NAME_REQ => NsMessage::DeregisterNameReq { name: r.name()? },
            QUERY_NAME_REQ => NsMessage::QueryNameReq { name: r.name()? },
            QUERY_NAME_REPLY => {
                let found = r.flag()?;
                let address = r.addr()?;
                let is_ns = r.flag()?;
                NsMessage::QueryNameReply {
                    result: found.then_some((address, is_ns)),
                }
            }
            REDIRECT_REPLY => NsMessage::RedirectReply {
                name_server: r.addr()?,
            },
            other => return Err(CodecError::UnknownEvent(other)),
        };
        r.finish()?;
        Ok(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(msg: NsMessage) -> NsMessage {
        let bytes = NsCodec.encode(&msg).unwrap();
        NsCodec.decode(msg.event_id(), &bytes).unwrap()
    }

    #[test]
    fn test_register_request() {
        let msg = NsMessage::RegisterNameReq {
            name: "sensor".into(),
            address: IfcAddr::new(0x0100_0000_0100_0004),
            is_name_server: false,
        };
        assert_eq!(roundtrip(msg.clone()), msg);
    }

    #[test]
    fn test_query_reply_not_found() {
        let msg = NsMessage::QueryNameReply { result: None };
        assert_eq!(roundtrip(msg.clone()), msg);
        let bytes = NsCodec.encode(&msg).unwrap();
        assert_eq!(bytes.len(), 10);
    }

    #[test]
    fn test_truncated_payload() {
        let bytes = NsCodec
            .encode(&NsMessage::QueryNameReq {
                name: "abcdef".into(),
            })
            .unwrap();
        let err = NsCodec.decode(QUERY_NAME_REQ, &bytes[..4]).unwrap_err();
        assert!(matches!(
            err,
            CodecError::Protocol(ProtocolError::MessageTooShort { .. })
        ));
    }

    #[test]
    fn test_trailing_bytes_rejected() {
        let mut bytes = NsCodec
            .encode(&NsMessage::RedirectReply {
                name_server: IfcAddr::new(9),
            })
            .unwrap();
        bytes.push(0);
        assert!(NsCodec.decode(REDIRECT_REPLY, &bytes).is_err());
    }

    #[test]
    fn test_unknown_event() {
        assert!(matches!(
            NsCodec.decode(0x1234, &[]),
            Err(CodecError::UnknownEvent(0x1234))
        ));
    }

    #[test]
    fn test_name_too_long() {
        let msg = NsMessage::QueryNameReq {
            name: "x".repeat(MAX_NAME_LEN + 1),
        };
        assert!(NsCodec.encode(&msg).is_err());
    }
}
