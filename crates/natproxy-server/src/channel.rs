//! Relay channel: a pair of UDP sockets bridging two control sessions
//!
//! Each End faces one peer. The End's task first runs the auth exchange,
//! which learns the peer's real UDP source port, and then relays everything
//! it receives out of the *other* End's socket. Nothing is forwarded until
//! both Ends are open.
//!
//! ```text
//!  requester ──udp──> src End ──(dst socket)──> destination    (upload)
//!  requester <──────(src socket)── dst End <──udp── destination (download)
//! ```

use std::fmt;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use natproxy_proto::message::{ChannelId, SessionId};
use parking_lot::Mutex;
use serde::Serialize;
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tracing::{debug, error, info, trace, warn};

use crate::metrics::RelayMetrics;
use crate::session::Session;
use crate::stats::{StatsReport, StatsWindow, TrafficSnapshot};

/// Datagrams this short are keepalives once relaying
pub const KEEPALIVE_MAX: usize = 2;

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("Failed to bind UDP socket on {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        source: io::Error,
    },
    #[error("Session {0} is gone")]
    SessionGone(SessionId),
    #[error("Session {session} refused channel {channel}")]
    Registration {
        channel: ChannelId,
        session: SessionId,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    /// Faces the session that sent PROXY
    Src,
    /// Faces the PROXY destination
    Dst,
}

impl Side {
    pub fn other(self) -> Side {
        match self {
            Side::Src => Side::Dst,
            Side::Dst => Side::Src,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Side::Src => "src",
            Side::Dst => "dst",
        }
    }
}

/// Decides whether an auth datagram opens an End
pub trait AuthPolicy: Send + Sync + fmt::Debug {
    fn accept(&self, side: Side, datagram: &[u8]) -> bool;
}

/// Any datagram whose first byte is non-zero
#[derive(Debug, Default, Clone, Copy)]
pub struct NonZeroFirstByte;

impl AuthPolicy for NonZeroFirstByte {
    fn accept(&self, _side: Side, datagram: &[u8]) -> bool {
        datagram.first().is_some_and(|b| *b != 0)
    }
}

#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// Receive buffer size per End
    pub mtu: usize,
    /// Stop the channel once either End is silent this long
    pub port_expired: Option<Duration>,
    /// Stats log interval
    pub display_interval: Option<Duration>,
    /// How often the idle watchdog polls
    pub idle_check_interval: Duration,
    pub auth: Arc<dyn AuthPolicy>,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            mtu: 2048,
            port_expired: Some(Duration::from_secs(120)),
            display_interval: Some(Duration::from_secs(60)),
            idle_check_interval: Duration::from_secs(10),
            auth: Arc::new(NonZeroFirstByte),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ChannelState {
    Initialized,
    AuthPending,
    Running,
    Stopped,
}

/// IPv4 form of an address for the wire; v4-mapped v6 is unwrapped
pub fn wire_ipv4(ip: IpAddr) -> Ipv4Addr {
    match ip {
        IpAddr::V4(v4) => v4,
        IpAddr::V6(v6) => v6.to_ipv4_mapped().unwrap_or(Ipv4Addr::UNSPECIFIED),
    }
}

fn is_socket_closed(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::NotConnected | io::ErrorKind::BrokenPipe | io::ErrorKind::ConnectionAborted
    )
}

struct End {
    side: Side,
    context: Handle,
    socket: Mutex<Option<Arc<UdpSocket>>>,
    local: SocketAddr,
    remote: Mutex<SocketAddr>,
    opened: AtomicBool,
    /// Milliseconds since channel creation
    last_activity_ms: AtomicU64,
    session: Weak<Session>,
    session_id: SessionId,
}

impl End {
    /// Bind next to the session's control socket, on the session's context.
    /// The remote starts as the session's TCP peer IP with port 0.
    fn bind(side: Side, session: &Arc<Session>) -> Result<Self, ChannelError> {
        let addr = SocketAddr::new(session.local_addr().ip(), 0);
        let bind_err = |source| ChannelError::Bind { addr, source };

        let std_socket = std::net::UdpSocket::bind(addr).map_err(bind_err)?;
        std_socket.set_nonblocking(true).map_err(bind_err)?;

        let context = session.context().clone();
        let socket = {
            let _guard = context.enter();
            UdpSocket::from_std(std_socket).map_err(bind_err)?
        };
        let local = socket.local_addr().map_err(bind_err)?;

        Ok(Self {
            side,
            context,
            socket: Mutex::new(Some(Arc::new(socket))),
            local,
            remote: Mutex::new(SocketAddr::new(session.peer_addr().ip(), 0)),
            opened: AtomicBool::new(false),
            last_activity_ms: AtomicU64::new(0),
            session: Arc::downgrade(session),
            session_id: session.id(),
        })
    }

    fn socket(&self) -> Option<Arc<UdpSocket>> {
        self.socket.lock().clone()
    }

    fn remote(&self) -> SocketAddr {
        *self.remote.lock()
    }

    fn is_opened(&self) -> bool {
        self.opened.load(Ordering::Acquire)
    }
}

enum Recv {
    Data(usize, SocketAddr),
    Retry,
    Closed,
}

/// Admin view of a channel
#[derive(Debug, Clone, Serialize)]
pub struct ChannelSummary {
    pub id: ChannelId,
    pub state: ChannelState,
    pub src_session: SessionId,
    pub dst_session: SessionId,
    pub src_relay: SocketAddr,
    pub dst_relay: SocketAddr,
    pub src_remote: SocketAddr,
    pub dst_remote: SocketAddr,
    pub traffic: TrafficSnapshot,
    pub age_secs: u64,
}

pub struct RelayChannel {
    id: ChannelId,
    config: ChannelConfig,
    src: End,
    dst: End,
    started: AtomicBool,
    stopped: AtomicBool,
    up_bytes: AtomicU64,
    up_packets: AtomicU64,
    down_bytes: AtomicU64,
    down_packets: AtomicU64,
    created_at: Instant,
    stats: Mutex<StatsWindow>,
    last_report: Mutex<Option<StatsReport>>,
    shutdown: watch::Sender<bool>,
    metrics: Arc<RelayMetrics>,
}

impl RelayChannel {
    /// Bind both Ends. The channel is not yet known to either session.
    pub fn new(
        id: ChannelId,
        config: ChannelConfig,
        metrics: Arc<RelayMetrics>,
        src: &Arc<Session>,
        dst: &Arc<Session>,
    ) -> Result<Arc<Self>, ChannelError> {
        let src_end = End::bind(Side::Src, src)?;
        let dst_end = End::bind(Side::Dst, dst)?;
        let (shutdown, _) = watch::channel(false);
        let created_at = Instant::now();

        info!(
            channel_id = id,
            src_id = src_end.session_id,
            dst_id = dst_end.session_id,
            src_relay = %src_end.local,
            dst_relay = %dst_end.local,
            "Channel created"
        );
        metrics.channel_opened();

        Ok(Arc::new(Self {
            id,
            config,
            src: src_end,
            dst: dst_end,
            started: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            up_bytes: AtomicU64::new(0),
            up_packets: AtomicU64::new(0),
            down_bytes: AtomicU64::new(0),
            down_packets: AtomicU64::new(0),
            created_at,
            stats: Mutex::new(StatsWindow::new(TrafficSnapshot::default(), created_at)),
            last_report: Mutex::new(None),
            shutdown,
            metrics,
        }))
    }

    /// Register with both sessions. A failed registration is rolled back
    /// before returning; the caller still owns stopping the channel.
    pub fn init(self: &Arc<Self>) -> Result<(), ChannelError> {
        let src = self
            .src
            .session
            .upgrade()
            .ok_or(ChannelError::SessionGone(self.src.session_id))?;
        let dst = self
            .dst
            .session
            .upgrade()
            .ok_or(ChannelError::SessionGone(self.dst.session_id))?;

        if !src.register_src_channel(self) {
            return Err(ChannelError::Registration {
                channel: self.id,
                session: src.id(),
            });
        }
        if !dst.register_dst_channel(self) {
            src.unregister_src_channel(self.id);
            return Err(ChannelError::Registration {
                channel: self.id,
                session: dst.id(),
            });
        }
        Ok(())
    }

    /// Launch both End tasks, the idle watchdog and the stats reporter
    pub fn start(self: &Arc<Self>) {
        if self.stopped.load(Ordering::Acquire) || self.started.swap(true, Ordering::AcqRel) {
            return;
        }

        for side in [Side::Src, Side::Dst] {
            let end = self.end(side);
            let Some(socket) = end.socket() else {
                return;
            };
            let this = self.clone();
            end.context.spawn(async move { this.run_end(side, socket).await });
        }

        if let Some(expiry) = self.config.port_expired {
            let this = self.clone();
            self.src.context.spawn(async move { this.watch_idle(expiry).await });
        }

        if let Some(interval) = self.config.display_interval {
            let this = self.clone();
            self.src.context.spawn(async move { this.display_stats(interval).await });
        }
    }

    /// Idempotent. Closes both sockets and tells both sessions.
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }

        self.shutdown.send_replace(true);
        self.src.socket.lock().take();
        self.dst.socket.lock().take();

        if let Some(src) = self.src.session.upgrade() {
            src.close_src_channel(self.id, self.src.local);
        }
        if let Some(dst) = self.dst.session.upgrade() {
            dst.close_dst_channel(self.id, self.dst.local);
        }

        let lifetime = self.created_at.elapsed();
        self.metrics.channel_closed(lifetime);
        info!(
            channel_id = self.id,
            lifetime = ?lifetime,
            totals = %self.traffic(),
            "Channel closed"
        );
    }

    pub fn id(&self) -> ChannelId {
        self.id
    }

    pub fn state(&self) -> ChannelState {
        if self.stopped.load(Ordering::Acquire) {
            ChannelState::Stopped
        } else if !self.started.load(Ordering::Acquire) {
            ChannelState::Initialized
        } else if self.src.is_opened() && self.dst.is_opened() {
            ChannelState::Running
        } else {
            ChannelState::AuthPending
        }
    }

    /// Local relay address of one End
    pub fn endpoint(&self, side: Side) -> SocketAddr {
        self.end(side).local
    }

    /// Learned peer address of one End
    pub fn remote(&self, side: Side) -> SocketAddr {
        self.end(side).remote()
    }

    pub fn is_opened(&self, side: Side) -> bool {
        self.end(side).is_opened()
    }

    pub fn session_id(&self, side: Side) -> SessionId {
        self.end(side).session_id
    }

    pub fn traffic(&self) -> TrafficSnapshot {
        TrafficSnapshot {
            up_bytes: self.up_bytes.load(Ordering::Relaxed),
            up_packets: self.up_packets.load(Ordering::Relaxed),
            down_bytes: self.down_bytes.load(Ordering::Relaxed),
            down_packets: self.down_packets.load(Ordering::Relaxed),
        }
    }

    /// Most recent stats tick that saw traffic
    pub fn last_stats(&self) -> Option<StatsReport> {
        *self.last_report.lock()
    }

    pub fn summary(&self) -> ChannelSummary {
        ChannelSummary {
            id: self.id,
            state: self.state(),
            src_session: self.src.session_id,
            dst_session: self.dst.session_id,
            src_relay: self.src.local,
            dst_relay: self.dst.local,
            src_remote: self.src.remote(),
            dst_remote: self.dst.remote(),
            traffic: self.traffic(),
            age_secs: self.created_at.elapsed().as_secs(),
        }
    }

    fn end(&self, side: Side) -> &End {
        match side {
            Side::Src => &self.src,
            Side::Dst => &self.dst,
        }
    }

    fn elapsed_ms(&self) -> u64 {
        self.created_at.elapsed().as_millis() as u64
    }

    fn touch(&self, end: &End) {
        end.last_activity_ms
            .store(self.elapsed_ms(), Ordering::Relaxed);
    }

    fn count(&self, side: Side, bytes: usize) {
        match side {
            Side::Src => {
                self.up_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
                self.up_packets.fetch_add(1, Ordering::Relaxed);
                self.metrics.record_upload(bytes);
            }
            Side::Dst => {
                self.down_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
                self.down_packets.fetch_add(1, Ordering::Relaxed);
                self.metrics.record_download(bytes);
            }
        }
    }

    fn on_io_error(&self, side: Side, op: &'static str, e: io::Error) -> Recv {
        if is_socket_closed(&e) {
            error!(channel_id = self.id, side = side.name(), "{} failed, socket closed: {}", op, e);
            self.stop();
            Recv::Closed
        } else {
            warn!(channel_id = self.id, side = side.name(), "{} error: {}", op, e);
            Recv::Retry
        }
    }

    async fn recv(
        &self,
        side: Side,
        socket: &UdpSocket,
        buf: &mut [u8],
        shutdown: &mut watch::Receiver<bool>,
    ) -> Recv {
        tokio::select! {
            res = socket.recv_from(buf) => match res {
                Ok((n, from)) => Recv::Data(n, from),
                Err(e) => self.on_io_error(side, "read", e),
            },
            _ = shutdown.wait_for(|stopped| *stopped) => Recv::Closed,
        }
    }

    async fn run_end(self: Arc<Self>, side: Side, socket: Arc<UdpSocket>) {
        let mut shutdown = self.shutdown.subscribe();
        let mut buf = vec![0u8; self.config.mtu];

        if self.authenticate(side, &socket, &mut buf, &mut shutdown).await {
            self.relay(side, &socket, &mut buf, &mut shutdown).await;
        }
        debug!(channel_id = self.id, side = side.name(), "End task finished");
    }

    /// Echo auth datagrams until one is accepted. Rejected ones are echoed
    /// zeroed. The src End additionally waits for the dst End to open.
    /// Any source may authenticate; the accepted sender's IP is pinned
    /// for the relay phase.
    async fn authenticate(
        &self,
        side: Side,
        socket: &UdpSocket,
        buf: &mut [u8],
        shutdown: &mut watch::Receiver<bool>,
    ) -> bool {
        let end = self.end(side);
        trace!(channel_id = self.id, side = side.name(), "Waiting for auth");

        loop {
            let (n, from) = match self.recv(side, socket, buf, shutdown).await {
                Recv::Data(n, from) => (n, from),
                Recv::Retry => continue,
                Recv::Closed => return false,
            };
            self.touch(end);
            if n == 0 {
                continue;
            }

            let data = &mut buf[..n];
            trace!(
                channel_id = self.id,
                side = side.name(),
                %from,
                data = %hex::encode(&*data),
                "Auth datagram"
            );

            let accepted = self.config.auth.accept(side, data)
                && (side == Side::Dst || self.dst.is_opened());
            if accepted {
                *end.remote.lock() = from;
                end.opened.store(true, Ordering::Release);
            } else {
                data.fill(0);
            }

            if let Err(e) = socket.send_to(data, from).await {
                if let Recv::Closed = self.on_io_error(side, "auth echo", e) {
                    return false;
                }
            }

            if accepted {
                info!(channel_id = self.id, side = side.name(), remote = %from, "End opened");
                return true;
            }
        }
    }

    async fn relay(
        &self,
        side: Side,
        socket: &UdpSocket,
        buf: &mut [u8],
        shutdown: &mut watch::Receiver<bool>,
    ) {
        let end = self.end(side);
        let peer = self.end(side.other());

        loop {
            let (n, from) = match self.recv(side, socket, buf, shutdown).await {
                Recv::Data(n, from) => (n, from),
                Recv::Retry => continue,
                Recv::Closed => return,
            };

            let learned = end.remote();
            if from != learned {
                if from.ip() != learned.ip() {
                    trace!(channel_id = self.id, side = side.name(), %from, "Foreign datagram dropped");
                    self.metrics.record_drop();
                    continue;
                }
                info!(
                    channel_id = self.id,
                    side = side.name(),
                    old = %learned,
                    new = %from,
                    "Peer port changed"
                );
                *end.remote.lock() = from;
            }
            self.touch(end);

            if n <= KEEPALIVE_MAX {
                continue;
            }
            if !peer.is_opened() {
                self.metrics.record_drop();
                continue;
            }
            let Some(out) = peer.socket() else {
                return;
            };

            match out.send_to(&buf[..n], peer.remote()).await {
                Ok(sent) => {
                    self.count(side, sent);
                    trace!(channel_id = self.id, side = side.name(), bytes = sent, "Relayed");
                }
                Err(e) => {
                    if let Recv::Closed = self.on_io_error(side, "forward", e) {
                        return;
                    }
                }
            }
        }
    }

    async fn watch_idle(self: Arc<Self>, expiry: Duration) {
        let mut shutdown = self.shutdown.subscribe();
        let mut ticker = tokio::time::interval(self.config.idle_check_interval);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.wait_for(|stopped| *stopped) => return,
            }

            let now = self.elapsed_ms();
            for end in [&self.src, &self.dst] {
                let last = end.last_activity_ms.load(Ordering::Relaxed);
                let idle = Duration::from_millis(now.saturating_sub(last));
                if idle > expiry {
                    warn!(
                        channel_id = self.id,
                        side = end.side.name(),
                        idle = ?idle,
                        "Port expired"
                    );
                    self.stop();
                    return;
                }
            }
        }
    }

    async fn display_stats(self: Arc<Self>, interval: Duration) {
        let mut shutdown = self.shutdown.subscribe();
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.wait_for(|stopped| *stopped) => return,
            }

            let now = self.traffic();
            let report = self.stats.lock().advance(now, Instant::now());
            if let Some(report) = report {
                info!(
                    channel_id = self.id,
                    rate = %report.rate,
                    total = %now,
                    age = ?self.created_at.elapsed(),
                    "Channel stats"
                );
                *self.last_report.lock() = Some(report);
            }
        }
    }
}
