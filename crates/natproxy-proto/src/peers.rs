//! Peer table carried in GETPROXIES responses
//!
//! `count(1)` followed by `count` entries of `[id(4)][addr(4)]`, both native
//! byte order.

use std::net::Ipv4Addr;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::message::SessionId;
use crate::ProtocolError;

/// Upper bound on entries; the count is a single byte
pub const MAX_PEERS: usize = u8::MAX as usize;

const ENTRY_LEN: usize = 8;

/// One discoverable session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerEntry {
    pub id: SessionId,
    pub addr: Ipv4Addr,
}

/// Serialize up to [`MAX_PEERS`] entries; the rest are dropped.
pub fn encode_peer_table<'a, I>(entries: I) -> Bytes
where
    I: IntoIterator<Item = &'a PeerEntry>,
{
    let mut body = BytesMut::with_capacity(1 + MAX_PEERS * ENTRY_LEN);
    body.put_u8(0);
    let mut count = 0usize;
    for entry in entries.into_iter().take(MAX_PEERS) {
        body.put_u32_ne(entry.id);
        body.put_u32_ne(u32::from(entry.addr));
        count += 1;
    }
    body[0] = count as u8;
    body.freeze()
}

/// An empty table: a single zero count byte
pub fn empty_peer_table() -> Bytes {
    Bytes::from_static(&[0])
}

pub fn decode_peer_table(table: &[u8]) -> Result<Vec<PeerEntry>, ProtocolError> {
    let mut buf = table;
    if buf.is_empty() {
        return Err(ProtocolError::Truncated {
            what: "peer table",
            need: 1,
            have: 0,
        });
    }
    let count = buf.get_u8() as usize;
    let need = 1 + count * ENTRY_LEN;
    if table.len() < need {
        return Err(ProtocolError::Truncated {
            what: "peer table",
            need,
            have: table.len(),
        });
    }

    let mut out = Vec::with_capacity(count);
    for _ in 0..count {
        let id = buf.get_u32_ne();
        let addr = Ipv4Addr::from(buf.get_u32_ne());
        out.push(PeerEntry { id, addr });
    }
    Ok(out)
}
