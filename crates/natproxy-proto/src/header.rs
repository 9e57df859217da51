//! Fixed 8-byte packet header

use crate::codes::FuncCode;

/// Header length on the wire
pub const HEADER_LEN: usize = 8;

/// First magic byte
pub const MAGIC1: u8 = 0xDD;
/// Second magic byte
pub const MAGIC2: u8 = 0x05;

/// Server version byte announcing an encrypted payload
pub const SVR_VERSION_ENCRYPTED: u8 = 0x02;
/// Server version byte announcing a plain payload
pub const SVR_VERSION_PLAIN: u8 = 0x04;

/// Protocol version written into server-originated headers
pub const PROTO_VERSION: u8 = 0x01;

/// Packet header
///
/// Layout: `magic1 magic2 proto_version svr_version func key_index body_len(2)`.
/// `body_len` travels in native byte order, as the deployed clients expect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    pub magic1: u8,
    pub magic2: u8,
    pub proto_version: u8,
    pub svr_version: u8,
    pub func: u8,
    pub key_index: u8,
    pub body_len: u16,
}

impl PacketHeader {
    /// Fresh header for a server-originated push
    pub fn new(func: FuncCode) -> Self {
        Self {
            magic1: MAGIC1,
            magic2: MAGIC2,
            proto_version: PROTO_VERSION,
            svr_version: SVR_VERSION_PLAIN,
            func: func as u8,
            key_index: 0,
            body_len: 0,
        }
    }

    pub fn from_bytes(b: &[u8; HEADER_LEN]) -> Self {
        Self {
            magic1: b[0],
            magic2: b[1],
            proto_version: b[2],
            svr_version: b[3],
            func: b[4],
            key_index: b[5],
            body_len: u16::from_ne_bytes([b[6], b[7]]),
        }
    }

    pub fn to_bytes(&self) -> [u8; HEADER_LEN] {
        let len = self.body_len.to_ne_bytes();
        [
            self.magic1,
            self.magic2,
            self.proto_version,
            self.svr_version,
            self.func,
            self.key_index,
            len[0],
            len[1],
        ]
    }

    /// Magic bytes match and the server version is one of the two accepted values
    pub fn is_valid(&self) -> bool {
        self.magic1 == MAGIC1
            && self.magic2 == MAGIC2
            && (self.svr_version == SVR_VERSION_ENCRYPTED || self.svr_version == SVR_VERSION_PLAIN)
    }

    pub fn is_encrypted(&self) -> bool {
        self.svr_version == SVR_VERSION_ENCRYPTED
    }

    /// Same header with another function code
    pub fn with_func(mut self, func: FuncCode) -> Self {
        self.func = func as u8;
        self
    }

    /// Total frame length: header plus body
    pub fn frame_len(&self) -> usize {
        HEADER_LEN + self.body_len as usize
    }
}
