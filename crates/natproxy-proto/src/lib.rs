//! natproxy-proto: binary control-channel protocol for the natproxy relay
//!
//! Every control message is an 8-byte [`PacketHeader`] followed by a body of
//! `body_len` bytes. This crate only encodes and decodes; it never touches a
//! socket.

pub mod codes;
pub mod framing;
pub mod guid;
pub mod header;
pub mod message;
pub mod peers;

pub use codes::{ErrorCode, FuncCode};
pub use framing::{decode_frame, Frame};
pub use guid::Guid;
pub use header::{PacketHeader, HEADER_LEN};
pub use message::{ChannelId, Request, Response, SessionId};
pub use peers::{decode_peer_table, empty_peer_table, encode_peer_table, PeerEntry, MAX_PEERS};

use thiserror::Error;

/// Protocol error
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Bad header: magic {magic1:#04x} {magic2:#04x}, server version {svr_version:#04x}")]
    BadHeader {
        magic1: u8,
        magic2: u8,
        svr_version: u8,
    },

    #[error("Truncated {what}: need {need} bytes, have {have}")]
    Truncated {
        what: &'static str,
        need: usize,
        have: usize,
    },

    #[error("Unknown function code {0:#04x}")]
    UnknownFunction(u8),

    #[error("Function {0:?} is not a request")]
    NotARequest(FuncCode),
}
