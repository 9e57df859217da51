//! Request and response bodies
//!
//! Ids, addresses and the header length are copied in native byte order.
//! UDP ports in PROXY, ACCESS and STOPPROXY bodies are big-endian; the
//! deployed client binaries read them that way, so the asymmetry stays.

use std::net::Ipv4Addr;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::codes::{ErrorCode, FuncCode};
use crate::framing::Frame;
use crate::guid::Guid;
use crate::header::{PacketHeader, HEADER_LEN};
use crate::ProtocolError;

/// Session identifier assigned at login
pub type SessionId = u32;
/// Relay channel identifier
pub type ChannelId = u32;

/// Client → server requests
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Heartbeat,
    Login {
        guid: Guid,
        /// Raw bytes as sent, echoed back untouched in ACCESS
        private_addr: [u8; 4],
    },
    Proxy {
        src_id: SessionId,
        dst_id: SessionId,
        game_id: String,
    },
    GetPeers {
        requester_id: SessionId,
    },
}

/// Server → client responses and pushes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    Login {
        err: ErrorCode,
        id: SessionId,
    },
    Proxy {
        err: ErrorCode,
        channel_id: ChannelId,
        relay_addr: Ipv4Addr,
        relay_port: u16,
    },
    Access {
        src_id: SessionId,
        channel_id: ChannelId,
        relay_addr: Ipv4Addr,
        relay_port: u16,
        private_addr: [u8; 4],
    },
    StopProxy {
        channel_id: ChannelId,
        relay_addr: Ipv4Addr,
        relay_port: u16,
    },
    /// Opaque peer table, see [`crate::peers`]
    Peers(Bytes),
}

fn need(what: &'static str, body: &[u8], n: usize) -> Result<(), ProtocolError> {
    if body.len() < n {
        return Err(ProtocolError::Truncated {
            what,
            need: n,
            have: body.len(),
        });
    }
    Ok(())
}

fn finish(mut header: PacketHeader, body: BytesMut) -> Bytes {
    header.body_len = body.len() as u16;
    let mut out = BytesMut::with_capacity(HEADER_LEN + body.len());
    out.extend_from_slice(&header.to_bytes());
    out.extend_from_slice(&body);
    out.freeze()
}

fn get_addr(buf: &mut &[u8]) -> Ipv4Addr {
    Ipv4Addr::from(buf.get_u32_ne())
}

fn get_raw4(buf: &mut &[u8]) -> [u8; 4] {
    let mut raw = [0u8; 4];
    buf.copy_to_slice(&mut raw);
    raw
}

/// Single length byte followed by that many bytes
fn get_short_bytes<'a>(
    what: &'static str,
    buf: &mut &'a [u8],
    full: &[u8],
) -> Result<&'a [u8], ProtocolError> {
    need(what, buf, 1)?;
    let len = buf.get_u8() as usize;
    if buf.remaining() < len {
        return Err(ProtocolError::Truncated {
            what,
            need: full.len() - buf.remaining() + len,
            have: full.len(),
        });
    }
    let (bytes, rest) = buf.split_at(len);
    *buf = rest;
    Ok(bytes)
}

/// Display-only text field; bad UTF-8 is replaced
fn get_short_string(
    what: &'static str,
    buf: &mut &[u8],
    full: &[u8],
) -> Result<String, ProtocolError> {
    get_short_bytes(what, buf, full).map(|b| String::from_utf8_lossy(b).into_owned())
}

fn put_short_bytes(body: &mut BytesMut, bytes: &[u8]) {
    let bytes = &bytes[..bytes.len().min(u8::MAX as usize)];
    body.put_u8(bytes.len() as u8);
    body.extend_from_slice(bytes);
}

impl Request {
    /// Decode the body of a validated frame
    pub fn decode(frame: &Frame) -> Result<Self, ProtocolError> {
        let func = FuncCode::try_from(frame.header.func)?;
        let full = &frame.body[..];
        let mut buf = full;

        match func {
            FuncCode::Heartbeat => Ok(Request::Heartbeat),
            FuncCode::Login => {
                let guid = Guid::from(get_short_bytes("LOGIN guid", &mut buf, full)?);
                need("LOGIN private address", buf, 4)?;
                let private_addr = get_raw4(&mut buf);
                Ok(Request::Login { guid, private_addr })
            }
            FuncCode::Proxy => {
                need("PROXY ids", buf, 8)?;
                let src_id = buf.get_u32_ne();
                let dst_id = buf.get_u32_ne();
                let game_id = get_short_string("PROXY game id", &mut buf, full)?;
                Ok(Request::Proxy {
                    src_id,
                    dst_id,
                    game_id,
                })
            }
            FuncCode::GetProxies => {
                need("GETPROXIES requester id", buf, 4)?;
                Ok(Request::GetPeers {
                    requester_id: buf.get_u32_ne(),
                })
            }
            FuncCode::Access | FuncCode::StopProxy => Err(ProtocolError::NotARequest(func)),
        }
    }

    pub fn func(&self) -> FuncCode {
        match self {
            Request::Heartbeat => FuncCode::Heartbeat,
            Request::Login { .. } => FuncCode::Login,
            Request::Proxy { .. } => FuncCode::Proxy,
            Request::GetPeers { .. } => FuncCode::GetProxies,
        }
    }

    /// Encode with a fresh header; used by clients and tests
    pub fn encode(&self) -> Bytes {
        let mut body = BytesMut::new();
        match self {
            Request::Heartbeat => {}
            Request::Login { guid, private_addr } => {
                put_short_bytes(&mut body, guid.as_bytes());
                body.extend_from_slice(private_addr);
            }
            Request::Proxy {
                src_id,
                dst_id,
                game_id,
            } => {
                body.put_u32_ne(*src_id);
                body.put_u32_ne(*dst_id);
                put_short_bytes(&mut body, game_id.as_bytes());
            }
            Request::GetPeers { requester_id } => body.put_u32_ne(*requester_id),
        }
        finish(PacketHeader::new(self.func()), body)
    }
}

impl Response {
    pub fn func(&self) -> FuncCode {
        match self {
            Response::Login { .. } => FuncCode::Login,
            Response::Proxy { .. } => FuncCode::Proxy,
            Response::Access { .. } => FuncCode::Access,
            Response::StopProxy { .. } => FuncCode::StopProxy,
            Response::Peers(_) => FuncCode::GetProxies,
        }
    }

    /// Encode onto a copy of `header`, filling in function code and body length
    pub fn encode(&self, header: PacketHeader) -> Bytes {
        let mut body = BytesMut::new();
        match self {
            Response::Login { err, id } => {
                body.put_u8(*err as u8);
                body.put_u32_ne(*id);
            }
            Response::Proxy {
                err,
                channel_id,
                relay_addr,
                relay_port,
            } => {
                body.put_u8(*err as u8);
                body.put_u32_ne(*channel_id);
                body.put_u32_ne(u32::from(*relay_addr));
                body.put_u16(*relay_port);
            }
            Response::Access {
                src_id,
                channel_id,
                relay_addr,
                relay_port,
                private_addr,
            } => {
                body.put_u32_ne(*src_id);
                body.put_u32_ne(*channel_id);
                body.put_u32_ne(u32::from(*relay_addr));
                body.put_u16(*relay_port);
                body.extend_from_slice(private_addr);
            }
            Response::StopProxy {
                channel_id,
                relay_addr,
                relay_port,
            } => {
                body.put_u32_ne(*channel_id);
                body.put_u32_ne(u32::from(*relay_addr));
                body.put_u16(*relay_port);
            }
            Response::Peers(table) => body.extend_from_slice(table),
        }
        finish(header.with_func(self.func()), body)
    }

    /// Decode a server frame; used by clients and tests
    pub fn decode(frame: &Frame) -> Result<Self, ProtocolError> {
        let func = FuncCode::try_from(frame.header.func)?;
        let mut buf = &frame.body[..];

        match func {
            FuncCode::Login => {
                need("LOGIN resp", buf, 5)?;
                Ok(Response::Login {
                    err: ErrorCode::from(buf.get_u8()),
                    id: buf.get_u32_ne(),
                })
            }
            FuncCode::Proxy => {
                need("PROXY resp", buf, 11)?;
                Ok(Response::Proxy {
                    err: ErrorCode::from(buf.get_u8()),
                    channel_id: buf.get_u32_ne(),
                    relay_addr: get_addr(&mut buf),
                    relay_port: buf.get_u16(),
                })
            }
            FuncCode::Access => {
                need("ACCESS notify", buf, 18)?;
                Ok(Response::Access {
                    src_id: buf.get_u32_ne(),
                    channel_id: buf.get_u32_ne(),
                    relay_addr: get_addr(&mut buf),
                    relay_port: buf.get_u16(),
                    private_addr: get_raw4(&mut buf),
                })
            }
            FuncCode::StopProxy => {
                need("STOPPROXY notify", buf, 10)?;
                Ok(Response::StopProxy {
                    channel_id: buf.get_u32_ne(),
                    relay_addr: get_addr(&mut buf),
                    relay_port: buf.get_u16(),
                })
            }
            FuncCode::GetProxies => Ok(Response::Peers(frame.body.clone())),
            FuncCode::Heartbeat => Err(ProtocolError::UnknownFunction(func as u8)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::framing::decode_frame;

    fn frame_of(wire: Bytes) -> Frame {
        let mut buf = BytesMut::from(&wire[..]);
        decode_frame(&mut buf).unwrap().unwrap()
    }

    #[test]
    fn test_login_request_layout() {
        let wire = Request::Login {
            guid: Guid::from("alice"),
            private_addr: [192, 168, 1, 7],
        }
        .encode();
        assert_eq!(wire.len(), HEADER_LEN + 1 + 5 + 4);
        assert_eq!(&wire[HEADER_LEN..], b"\x05alice\xc0\xa8\x01\x07");

        let decoded = Request::decode(&frame_of(wire)).unwrap();
        assert_eq!(
            decoded,
            Request::Login {
                guid: Guid::from("alice"),
                private_addr: [192, 168, 1, 7],
            }
        );
    }

    #[test]
    fn test_login_guid_keeps_raw_bytes() {
        let mut header = PacketHeader::new(FuncCode::Login);
        let body = Bytes::from_static(b"\x02\xfe\xff\x0a\x00\x00\x01");
        header.body_len = body.len() as u16;
        let decoded = Request::decode(&Frame { header, body }).unwrap();
        let Request::Login { guid, private_addr } = decoded else {
            panic!("expected LOGIN");
        };
        assert_eq!(guid.as_bytes(), &[0xFE, 0xFF]);
        assert_eq!(private_addr, [10, 0, 0, 1]);
    }

    #[test]
    fn test_truncated_login_fails() {
        let mut header = PacketHeader::new(FuncCode::Login);
        // guid claims 10 bytes, only 3 present
        let body = Bytes::from_static(b"\x0aabc");
        header.body_len = body.len() as u16;
        let err = Request::decode(&Frame { header, body }).unwrap_err();
        assert!(matches!(err, ProtocolError::Truncated { need: 11, have: 4, .. }));

        // guid complete, private address missing
        let body = Bytes::from_static(b"\x01a\x01\x02");
        header.body_len = body.len() as u16;
        assert!(Request::decode(&Frame { header, body }).is_err());
    }

    #[test]
    fn test_proxy_request_needs_fixed_prefix() {
        let mut header = PacketHeader::new(FuncCode::Proxy);
        let body = Bytes::from_static(&[1, 2, 3, 4, 5, 6, 7, 8]);
        header.body_len = 8;
        assert!(Request::decode(&Frame { header, body }).is_err());

        let wire = Request::Proxy {
            src_id: 1000,
            dst_id: 1001,
            game_id: "g".to_string(),
        }
        .encode();
        let decoded = Request::decode(&frame_of(wire)).unwrap();
        assert!(matches!(decoded, Request::Proxy { src_id: 1000, dst_id: 1001, .. }));
    }

    #[test]
    fn test_ports_are_network_order() {
        let wire = Response::StopProxy {
            channel_id: 7,
            relay_addr: Ipv4Addr::new(10, 0, 0, 1),
            relay_port: 0x1234,
        }
        .encode(PacketHeader::new(FuncCode::StopProxy));

        let body = &wire[HEADER_LEN..];
        assert_eq!(body.len(), 10);
        assert_eq!(&body[0..4], &7u32.to_ne_bytes());
        assert_eq!(&body[4..8], &u32::from(Ipv4Addr::new(10, 0, 0, 1)).to_ne_bytes());
        assert_eq!(&body[8..10], &[0x12, 0x34]);
    }

    #[test]
    fn test_response_reuses_request_header() {
        let mut request_header = PacketHeader::new(FuncCode::Proxy);
        request_header.key_index = 9;
        request_header.svr_version = crate::header::SVR_VERSION_ENCRYPTED;

        let wire = Response::Access {
            src_id: 1000,
            channel_id: 1,
            relay_addr: Ipv4Addr::LOCALHOST,
            relay_port: 40000,
            private_addr: [1, 2, 3, 4],
        }
        .encode(request_header);

        let frame = frame_of(wire);
        assert_eq!(frame.header.func, FuncCode::Access as u8);
        assert_eq!(frame.header.key_index, 9);
        assert!(frame.header.is_encrypted());
        assert_eq!(frame.header.body_len, 18);
        assert_eq!(
            Response::decode(&frame).unwrap(),
            Response::Access {
                src_id: 1000,
                channel_id: 1,
                relay_addr: Ipv4Addr::LOCALHOST,
                relay_port: 40000,
                private_addr: [1, 2, 3, 4],
            }
        );
    }

    #[test]
    fn test_push_frames_are_not_requests() {
        let wire = Response::StopProxy {
            channel_id: 1,
            relay_addr: Ipv4Addr::LOCALHOST,
            relay_port: 1,
        }
        .encode(PacketHeader::new(FuncCode::StopProxy));
        assert_eq!(
            Request::decode(&frame_of(wire)),
            Err(ProtocolError::NotARequest(FuncCode::StopProxy))
        );
    }
}
