//! Minimal async control-protocol client
//!
//! Speaks the same framing as a game client. Used by the integration tests
//! and handy for poking a live relay.

use std::io;
use std::net::SocketAddr;

use bytes::BytesMut;
use natproxy_proto::{decode_frame, Guid, Request, Response};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

pub struct ControlClient {
    stream: TcpStream,
    buf: BytesMut,
}

fn invalid(e: natproxy_proto::ProtocolError) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, e)
}

impl ControlClient {
    pub async fn connect(addr: SocketAddr) -> io::Result<Self> {
        Ok(Self::from_stream(TcpStream::connect(addr).await?))
    }

    pub fn from_stream(stream: TcpStream) -> Self {
        Self {
            stream,
            buf: BytesMut::with_capacity(1024),
        }
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.stream.local_addr()
    }

    pub async fn send(&mut self, request: &Request) -> io::Result<()> {
        self.stream.write_all(&request.encode()).await
    }

    /// Write arbitrary bytes, framed or not
    pub async fn send_raw(&mut self, data: &[u8]) -> io::Result<()> {
        self.stream.write_all(data).await
    }

    /// Next response or push. Fails with `UnexpectedEof` once the relay
    /// closes the connection.
    pub async fn recv(&mut self) -> io::Result<Response> {
        loop {
            if let Some(frame) = decode_frame(&mut self.buf).map_err(invalid)? {
                return Response::decode(&frame).map_err(invalid);
            }
            if self.stream.read_buf(&mut self.buf).await? == 0 {
                return Err(io::ErrorKind::UnexpectedEof.into());
            }
        }
    }

    pub async fn login(
        &mut self,
        guid: impl Into<Guid>,
        private_addr: [u8; 4],
    ) -> io::Result<Response> {
        self.send(&Request::Login {
            guid: guid.into(),
            private_addr,
        })
        .await?;
        self.recv().await
    }
}
