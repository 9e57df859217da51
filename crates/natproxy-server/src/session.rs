//! Control session: one TCP connection from a game client
//!
//! A session reads frames in arrival order on its own context and answers on
//! the same header it was asked with. Pushes to *other* sessions (ACCESS,
//! STOPPROXY) go through their outbound queues, so no handler ever writes to
//! a socket it does not own.

use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use natproxy_proto::{
    decode_frame, empty_peer_table, ChannelId, ErrorCode, Frame, FuncCode, Guid, PacketHeader,
    ProtocolError, Request, Response, SessionId,
};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, watch};
use tokio::task::AbortHandle;
use tracing::{debug, error, info, trace, warn};

use crate::channel::{wire_ipv4, RelayChannel, Side};
use crate::config::SessionType;
use crate::manager::SessionManager;
use crate::registry::Registry;

/// Id of a session that has not logged in
pub const NO_ID: SessionId = 0;

const READ_CHUNK: usize = 4096;

/// Admin view of a session
#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    pub id: SessionId,
    pub guid: String,
    pub peer_addr: SocketAddr,
    pub session_type: SessionType,
    pub logged_in: bool,
    pub src_channels: usize,
    pub dst_channels: usize,
    pub age_secs: u64,
}

pub struct Session {
    serial: u64,
    id: AtomicU32,
    guid: Mutex<Guid>,
    private_addr: Mutex<[u8; 4]>,
    session_type: SessionType,
    logged_in: AtomicBool,
    running: AtomicBool,
    peer_addr: SocketAddr,
    local_addr: SocketAddr,
    context: Handle,
    outbound: mpsc::UnboundedSender<Bytes>,
    login_timer: Mutex<Option<AbortHandle>>,
    /// Channels this session requested; the session owns them
    src_channels: Registry<ChannelId, Arc<RelayChannel>>,
    /// Channels targeting this session
    dst_channels: Registry<ChannelId, Weak<RelayChannel>>,
    shutdown: watch::Sender<bool>,
    manager: Arc<SessionManager>,
    created_at: Instant,
}

impl Session {
    /// Take over an accepted control connection.
    ///
    /// Must be called from inside the runtime that will drive the session;
    /// that runtime becomes the session's context.
    pub fn start(
        stream: TcpStream,
        session_type: SessionType,
        manager: Arc<SessionManager>,
    ) -> io::Result<Arc<Self>> {
        let peer_addr = stream.peer_addr()?;
        let local_addr = stream.local_addr()?;
        if let Err(e) = stream.set_nodelay(true) {
            debug!(%peer_addr, "Failed to set TCP_NODELAY: {}", e);
        }

        let (reader, writer) = stream.into_split();
        let (outbound, rx) = mpsc::unbounded_channel();
        let (shutdown, _) = watch::channel(false);

        let session = Arc::new(Self {
            serial: manager.next_serial(),
            id: AtomicU32::new(NO_ID),
            guid: Mutex::new(Guid::default()),
            private_addr: Mutex::new([0; 4]),
            session_type,
            logged_in: AtomicBool::new(false),
            running: AtomicBool::new(true),
            peer_addr,
            local_addr,
            context: Handle::current(),
            outbound,
            login_timer: Mutex::new(None),
            src_channels: Registry::new(),
            dst_channels: Registry::new(),
            shutdown,
            created_at: Instant::now(),
            manager,
        });

        session.manager.attach(&session);
        info!(
            serial = session.serial,
            peer = %peer_addr,
            local = %local_addr,
            session_type = %session_type,
            "Session accepted"
        );

        tokio::spawn(write_loop(writer, rx, session.shutdown.subscribe(), peer_addr));
        session.arm_login_timer(session.manager.config().login_timeout);
        tokio::spawn(session.clone().read_loop(reader));

        Ok(session)
    }

    /// Idempotent. Stops every channel the session takes part in and
    /// deregisters it from the manager.
    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::AcqRel) {
            return;
        }
        info!(session_id = self.id(), peer = %self.peer_addr, "Session closing");

        if let Some(timer) = self.login_timer.lock().take() {
            timer.abort();
        }
        self.shutdown.send_replace(true);

        for channel in self.src_channels.take_all() {
            self.manager.forget_channel(channel.id());
            channel.stop();
        }
        for channel in self.dst_channels.take_all() {
            if let Some(channel) = channel.upgrade() {
                channel.stop();
            }
        }

        self.manager.close_session(self);
        self.manager.detach(self);
    }

    pub fn id(&self) -> SessionId {
        self.id.load(Ordering::Acquire)
    }

    pub fn serial(&self) -> u64 {
        self.serial
    }

    pub fn guid(&self) -> Guid {
        self.guid.lock().clone()
    }

    pub fn private_addr(&self) -> [u8; 4] {
        *self.private_addr.lock()
    }

    pub fn session_type(&self) -> SessionType {
        self.session_type
    }

    pub fn is_logged_in(&self) -> bool {
        self.logged_in.load(Ordering::Acquire)
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn context(&self) -> &Handle {
        &self.context
    }

    pub fn src_channel_count(&self) -> usize {
        self.src_channels.len()
    }

    pub fn dst_channel_count(&self) -> usize {
        self.dst_channels.len()
    }

    pub fn summary(&self) -> SessionSummary {
        SessionSummary {
            id: self.id(),
            guid: self.guid().to_string(),
            peer_addr: self.peer_addr,
            session_type: self.session_type,
            logged_in: self.is_logged_in(),
            src_channels: self.src_channels.len(),
            dst_channels: self.dst_channels.len(),
            age_secs: self.created_at.elapsed().as_secs(),
        }
    }

    /// Clear the logged-in flag, returning whether it was set
    pub(crate) fn clear_login(&self) -> bool {
        self.logged_in.swap(false, Ordering::AcqRel)
    }

    pub(crate) fn register_src_channel(&self, channel: &Arc<RelayChannel>) -> bool {
        if !self.src_channels.insert(channel.id(), channel.clone()) {
            return false;
        }
        if !self.is_running() {
            self.src_channels.remove(&channel.id());
            return false;
        }
        true
    }

    pub(crate) fn register_dst_channel(&self, channel: &Arc<RelayChannel>) -> bool {
        if !self.dst_channels.insert(channel.id(), Arc::downgrade(channel)) {
            return false;
        }
        if !self.is_running() {
            self.dst_channels.remove(&channel.id());
            return false;
        }
        true
    }

    pub(crate) fn unregister_src_channel(&self, id: ChannelId) {
        self.src_channels.remove(&id);
    }

    /// Drop a channel this session requested and tell the client
    pub(crate) fn close_src_channel(&self, id: ChannelId, relay: SocketAddr) {
        if self.src_channels.remove(&id).is_some() {
            self.manager.forget_channel(id);
            self.notify_stop(id, relay);
        }
    }

    /// Drop a channel targeting this session and tell the client
    pub(crate) fn close_dst_channel(&self, id: ChannelId, relay: SocketAddr) {
        if self.dst_channels.remove(&id).is_some() {
            self.notify_stop(id, relay);
        }
    }

    fn notify_stop(&self, id: ChannelId, relay: SocketAddr) {
        if !self.is_running() {
            return;
        }
        debug!(session_id = self.id(), channel_id = id, %relay, "Sending STOPPROXY");
        self.push(
            Response::StopProxy {
                channel_id: id,
                relay_addr: wire_ipv4(relay.ip()),
                relay_port: relay.port(),
            },
            PacketHeader::new(FuncCode::StopProxy),
        );
    }

    /// Queue a frame for the writer
    fn push(&self, response: Response, header: PacketHeader) {
        let frame = response.encode(header);
        trace!(
            session_id = self.id(),
            func = response.func().name(),
            data = %hex::encode(&frame),
            "Send"
        );
        if self.outbound.send(frame).is_err() {
            debug!(session_id = self.id(), "Writer gone, frame dropped");
        }
    }

    fn arm_login_timer(self: &Arc<Self>, timeout: Duration) {
        let weak = Arc::downgrade(self);
        let task = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(session) = weak.upgrade() {
                if !session.is_logged_in() {
                    warn!(peer = %session.peer_addr, "Login timeout");
                    session.stop();
                }
            }
        });
        *self.login_timer.lock() = Some(task.abort_handle());
    }

    async fn read_loop(self: Arc<Self>, mut reader: OwnedReadHalf) {
        let mut shutdown = self.shutdown.subscribe();
        let mut buf = BytesMut::with_capacity(READ_CHUNK);

        'read: loop {
            loop {
                match decode_frame(&mut buf) {
                    Ok(Some(frame)) => self.dispatch(frame),
                    Ok(None) => break,
                    Err(e) => {
                        warn!(session_id = self.id(), peer = %self.peer_addr, "{}", e);
                        self.manager.metrics().record_resync();
                    }
                }
                if !self.is_running() {
                    break 'read;
                }
            }

            buf.reserve(READ_CHUNK);
            let read = tokio::select! {
                res = reader.read_buf(&mut buf) => res,
                _ = shutdown.wait_for(|stopped| *stopped) => break,
            };
            match read {
                Ok(0) => {
                    debug!(session_id = self.id(), peer = %self.peer_addr, "Peer closed connection");
                    break;
                }
                Ok(_) => {}
                Err(e) => {
                    error!(session_id = self.id(), peer = %self.peer_addr, "Read error: {}", e);
                    break;
                }
            }
        }

        self.stop();
    }

    fn dispatch(self: &Arc<Self>, frame: Frame) {
        trace!(
            session_id = self.id(),
            data = %hex::encode(frame.to_bytes()),
            "Recv"
        );
        let header = frame.header;

        match Request::decode(&frame) {
            Ok(Request::Heartbeat) => trace!(session_id = self.id(), "Heartbeat"),
            Ok(Request::Login { guid, private_addr }) => self.on_login(header, guid, private_addr),
            Ok(Request::Proxy {
                src_id,
                dst_id,
                game_id,
            }) => self.on_proxy(header, src_id, dst_id, &game_id),
            Ok(Request::GetPeers { requester_id }) => self.on_get_peers(header, requester_id),
            Err(e @ ProtocolError::Truncated { .. }) => {
                warn!(session_id = self.id(), "Malformed request: {}", e);
                self.reject_malformed(header);
            }
            Err(e) => debug!(session_id = self.id(), "Ignored frame: {}", e),
        }
    }

    fn reject_malformed(&self, header: PacketHeader) {
        match FuncCode::try_from(header.func) {
            Ok(FuncCode::Login) => self.push(
                Response::Login {
                    err: ErrorCode::Failed,
                    id: self.id(),
                },
                header,
            ),
            Ok(FuncCode::Proxy) => self.push(proxy_failure(ErrorCode::Failed), header),
            _ => {}
        }
    }

    fn on_login(self: &Arc<Self>, header: PacketHeader, guid: Guid, private_addr: [u8; 4]) {
        if self.is_logged_in() {
            warn!(session_id = self.id(), %guid, "Repeat login");
            self.push(
                Response::Login {
                    err: ErrorCode::RepeatLogin,
                    id: self.id(),
                },
                header,
            );
            return;
        }

        match self.manager.on_session_login(self, &guid) {
            Ok(id) => {
                self.id.store(id, Ordering::Release);
                *self.guid.lock() = guid.clone();
                *self.private_addr.lock() = private_addr;
                self.logged_in.store(true, Ordering::Release);
                if let Some(timer) = self.login_timer.lock().take() {
                    timer.abort();
                }

                info!(
                    session_id = id,
                    %guid,
                    peer = %self.peer_addr,
                    private = %Ipv4Addr::from(private_addr),
                    "Login success"
                );
                self.push(
                    Response::Login {
                        err: ErrorCode::Success,
                        id,
                    },
                    header,
                );

                // lost a race with stop(): undo the registration it missed
                if !self.is_running() {
                    self.manager.close_session(self);
                }
            }
            Err(e) => {
                warn!(%guid, peer = %self.peer_addr, "Login failed: {}", e);
                self.push(
                    Response::Login {
                        err: e.code(),
                        id: self.id(),
                    },
                    header,
                );
            }
        }
    }

    fn on_proxy(
        self: &Arc<Self>,
        header: PacketHeader,
        src_id: SessionId,
        dst_id: SessionId,
        game_id: &str,
    ) {
        if !self.session_type.may_originate() {
            warn!(session_id = self.id(), dst_id, "PROXY from a server-only session");
            self.push(proxy_failure(ErrorCode::Forbidden), header);
            return;
        }
        if !self.is_logged_in() {
            warn!(peer = %self.peer_addr, dst_id, "PROXY before login");
            self.push(proxy_failure(ErrorCode::NotLoggedIn), header);
            return;
        }
        if src_id != self.id() {
            debug!(session_id = self.id(), claimed = src_id, "PROXY source id ignored");
        }
        info!(session_id = self.id(), dst_id, %game_id, "Proxy request");

        match self.manager.create_channel(self, dst_id) {
            Ok((channel, dst)) => {
                channel.start();

                let dst_relay = channel.endpoint(Side::Dst);
                dst.push(
                    Response::Access {
                        src_id: self.id(),
                        channel_id: channel.id(),
                        relay_addr: wire_ipv4(dst_relay.ip()),
                        relay_port: dst_relay.port(),
                        private_addr: self.private_addr(),
                    },
                    header,
                );

                let src_relay = channel.endpoint(Side::Src);
                self.push(
                    Response::Proxy {
                        err: ErrorCode::Success,
                        channel_id: channel.id(),
                        relay_addr: wire_ipv4(src_relay.ip()),
                        relay_port: src_relay.port(),
                    },
                    header,
                );
            }
            Err(e) => {
                warn!(session_id = self.id(), dst_id, "Proxy failed: {}", e);
                self.push(proxy_failure(e.code()), header);
            }
        }
    }

    fn on_get_peers(&self, header: PacketHeader, requester_id: SessionId) {
        let table = if self.session_type.may_originate() {
            self.manager.get_all_sessions()
        } else {
            empty_peer_table()
        };
        debug!(
            session_id = self.id(),
            requester_id,
            peers = table.first().copied().unwrap_or(0),
            "Peer list"
        );
        self.push(Response::Peers(table), header);
    }
}

fn proxy_failure(err: ErrorCode) -> Response {
    Response::Proxy {
        err,
        channel_id: 0,
        relay_addr: Ipv4Addr::UNSPECIFIED,
        relay_port: 0,
    }
}

/// Drain the outbound queue in order. Frames queued before shutdown are still
/// written; write errors are logged and the next frame is tried.
async fn write_loop(
    mut writer: OwnedWriteHalf,
    mut rx: mpsc::UnboundedReceiver<Bytes>,
    mut shutdown: watch::Receiver<bool>,
    peer: SocketAddr,
) {
    loop {
        let frame = tokio::select! {
            biased;
            frame = rx.recv() => frame,
            _ = shutdown.wait_for(|stopped| *stopped) => None,
        };
        let Some(frame) = frame else {
            break;
        };
        if let Err(e) = writer.write_all(&frame).await {
            error!(%peer, "Write error: {}", e);
        }
    }

    if let Err(e) = writer.shutdown().await {
        trace!(%peer, "Write shutdown: {}", e);
    }
}
