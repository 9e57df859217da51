//! Streaming frame decoder with header resynchronization.

use bytes::{Buf, Bytes, BytesMut};

use crate::header::{PacketHeader, HEADER_LEN};
use crate::ProtocolError;

/// Bytes dropped from the stream when a header fails validation
pub const RESYNC_SKIP: usize = 2;

/// One complete control frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub header: PacketHeader,
    pub body: Bytes,
}

impl Frame {
    /// Raw wire bytes, for hex dumps
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_LEN + self.body.len());
        out.extend_from_slice(&self.header.to_bytes());
        out.extend_from_slice(&self.body);
        out
    }
}

/// Pull one frame out of `buf`.
///
/// Returns `Ok(None)` when more bytes are needed; nothing is consumed in that
/// case. A header with bad magic or server version consumes exactly
/// [`RESYNC_SKIP`] bytes and returns [`ProtocolError::BadHeader`]; the caller
/// logs it and calls again.
pub fn decode_frame(buf: &mut BytesMut) -> Result<Option<Frame>, ProtocolError> {
    if buf.len() < HEADER_LEN {
        return Ok(None);
    }

    let mut raw = [0u8; HEADER_LEN];
    raw.copy_from_slice(&buf[..HEADER_LEN]);
    let header = PacketHeader::from_bytes(&raw);

    if !header.is_valid() {
        buf.advance(RESYNC_SKIP);
        return Err(ProtocolError::BadHeader {
            magic1: header.magic1,
            magic2: header.magic2,
            svr_version: header.svr_version,
        });
    }

    if buf.len() < header.frame_len() {
        return Ok(None);
    }

    buf.advance(HEADER_LEN);
    let body = buf.split_to(header.body_len as usize).freeze();
    Ok(Some(Frame { header, body }))
}
