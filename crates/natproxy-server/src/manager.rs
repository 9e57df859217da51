//! Session manager: id allocation, guid uniqueness, channel creation
//!
//! Everything here is safe to call from any reactor context. Sessions and
//! channels are held weakly; a session owns the channels it requested.

use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::Bytes;
use natproxy_proto::{ChannelId, ErrorCode, Guid, SessionId};
use thiserror::Error;
use tracing::{debug, info};

use crate::channel::{wire_ipv4, ChannelConfig, ChannelError, ChannelSummary, RelayChannel};
use crate::directory::{SessionDirectory, SessionInfo};
use crate::metrics::RelayMetrics;
use crate::registry::{GuidSet, Registry};
use crate::session::{Session, SessionSummary};

pub const FIRST_SESSION_ID: SessionId = 1000;
pub const FIRST_CHANNEL_ID: ChannelId = 1;

#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Sessions that have not logged in by then are closed
    pub login_timeout: Duration,
    /// Connected sessions cap, 0 = unlimited
    pub max_sessions: usize,
    /// Open channels cap, 0 = unlimited
    pub max_channels: usize,
    pub channel: ChannelConfig,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            login_timeout: Duration::from_secs(30),
            max_sessions: 0,
            max_channels: 0,
            channel: ChannelConfig::default(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ManagerError {
    #[error("Guid {0} is already logged in")]
    DuplicateGuid(Guid),
    #[error("Session id {0} is already registered")]
    IdTaken(SessionId),
    #[error("Session {0} not found")]
    NotFound(SessionId),
    #[error("Session cannot proxy to itself")]
    SelfProxy,
    #[error("Channel limit of {0} reached")]
    ChannelLimit(usize),
    #[error(transparent)]
    Channel(#[from] ChannelError),
}

impl ManagerError {
    /// Result code reported to the client
    pub fn code(&self) -> ErrorCode {
        match self {
            ManagerError::NotFound(_) => ErrorCode::NotFound,
            ManagerError::SelfProxy => ErrorCode::Forbidden,
            ManagerError::ChannelLimit(_) => ErrorCode::Unavailable,
            ManagerError::DuplicateGuid(_)
            | ManagerError::IdTaken(_)
            | ManagerError::Channel(_) => ErrorCode::Failed,
        }
    }
}

pub struct SessionManager {
    config: ManagerConfig,
    /// Discoverable logged-in sessions by id
    sessions: Registry<SessionId, Weak<Session>>,
    guids: GuidSet,
    /// Every connected session by serial, logged in or not
    live: Registry<u64, Weak<Session>>,
    channels: Registry<ChannelId, Weak<RelayChannel>>,
    directory: SessionDirectory,
    metrics: Arc<RelayMetrics>,
    next_session_id: AtomicU32,
    next_channel_id: AtomicU32,
    next_serial: AtomicU64,
    connections: AtomicUsize,
    /// Channel slots held, one per `channels` entry plus in-flight creations
    channel_slots: AtomicUsize,
}

impl SessionManager {
    pub fn new(
        config: ManagerConfig,
        directory: SessionDirectory,
        metrics: Arc<RelayMetrics>,
    ) -> Self {
        Self {
            config,
            sessions: Registry::new(),
            guids: GuidSet::new(),
            live: Registry::new(),
            channels: Registry::new(),
            directory,
            metrics,
            next_session_id: AtomicU32::new(FIRST_SESSION_ID),
            next_channel_id: AtomicU32::new(FIRST_CHANNEL_ID),
            next_serial: AtomicU64::new(1),
            connections: AtomicUsize::new(0),
            channel_slots: AtomicUsize::new(0),
        }
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    pub fn metrics(&self) -> &Arc<RelayMetrics> {
        &self.metrics
    }

    pub fn directory(&self) -> &SessionDirectory {
        &self.directory
    }

    /// Reserve a connection slot. False, and the connection should be
    /// dropped, once `max_sessions` are connected.
    pub fn try_register_connection(&self) -> bool {
        let max = self.config.max_sessions;
        let reserved = self
            .connections
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (max == 0 || n < max).then_some(n + 1)
            })
            .is_ok();
        if !reserved {
            self.metrics.connection_rejected();
        }
        reserved
    }

    pub fn release_connection(&self) {
        let _ = self
            .connections
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
    }

    pub fn connection_count(&self) -> usize {
        self.connections.load(Ordering::Acquire)
    }

    /// True while another connection would be accepted
    pub fn has_capacity(&self) -> bool {
        self.config.max_sessions == 0 || self.connection_count() < self.config.max_sessions
    }

    pub(crate) fn next_serial(&self) -> u64 {
        self.next_serial.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn attach(&self, session: &Arc<Session>) {
        self.live.insert(session.serial(), Arc::downgrade(session));
        self.metrics.session_opened();
    }

    /// Final bookkeeping for a stopped session; releases its connection slot
    pub(crate) fn detach(&self, session: &Session) {
        if self.live.remove(&session.serial()).is_some() {
            self.release_connection();
            self.metrics.session_closed();
        }
    }

    /// Reserve the guid and allocate an id. Discoverable sessions also go
    /// into the id map and the directory. Nothing is left behind on failure.
    pub fn on_session_login(
        &self,
        session: &Arc<Session>,
        guid: &Guid,
    ) -> Result<SessionId, ManagerError> {
        if !self.guids.reserve(guid) {
            self.metrics.login_failed();
            return Err(ManagerError::DuplicateGuid(guid.clone()));
        }

        let id = self.next_session_id.fetch_add(1, Ordering::Relaxed);
        if session.session_type().is_discoverable() {
            if !self.sessions.insert(id, Arc::downgrade(session)) {
                self.guids.release(guid);
                self.metrics.login_failed();
                return Err(ManagerError::IdTaken(id));
            }
            self.directory.add(SessionInfo {
                id,
                addr: wire_ipv4(session.peer_addr().ip()),
                guid: guid.clone(),
            });
        }

        self.metrics.login_succeeded();
        Ok(id)
    }

    /// Undo a login. Safe to call more than once and for sessions that
    /// never logged in.
    pub fn close_session(&self, session: &Session) {
        if !session.clear_login() {
            return;
        }

        let id = session.id();
        let guid = session.guid();
        self.guids.release(&guid);
        if session.session_type().is_discoverable() {
            self.sessions.remove(&id);
            self.directory.del(id);
        }
        info!(session_id = id, %guid, "Session deregistered");
    }

    /// Create, bind and register a channel from `src` to session `dst_id`.
    /// The caller starts it.
    pub fn create_channel(
        &self,
        src: &Arc<Session>,
        dst_id: SessionId,
    ) -> Result<(Arc<RelayChannel>, Arc<Session>), ManagerError> {
        let max = self.config.max_channels;
        let reserved = self
            .channel_slots
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (max == 0 || n < max).then_some(n + 1)
            })
            .is_ok();
        if !reserved {
            return Err(ManagerError::ChannelLimit(max));
        }

        let (channel, dst) = match self.bind_channel(src, dst_id) {
            Ok(pair) => pair,
            Err(e) => {
                self.release_channel_slot();
                return Err(e);
            }
        };

        let id = channel.id();
        if !self.channels.insert(id, Arc::downgrade(&channel)) {
            self.release_channel_slot();
            channel.stop();
            return Err(ManagerError::Channel(ChannelError::Registration {
                channel: id,
                session: src.id(),
            }));
        }
        if let Err(e) = channel.init() {
            self.forget_channel(id);
            channel.stop();
            return Err(e.into());
        }

        Ok((channel, dst))
    }

    fn bind_channel(
        &self,
        src: &Arc<Session>,
        dst_id: SessionId,
    ) -> Result<(Arc<RelayChannel>, Arc<Session>), ManagerError> {
        let dst = self
            .sessions
            .get(&dst_id)
            .and_then(|weak| weak.upgrade())
            .filter(|s| s.is_running())
            .ok_or(ManagerError::NotFound(dst_id))?;
        if Arc::ptr_eq(&dst, src) {
            return Err(ManagerError::SelfProxy);
        }

        let id = self.next_channel_id.fetch_add(1, Ordering::Relaxed);
        let channel = RelayChannel::new(
            id,
            self.config.channel.clone(),
            self.metrics.clone(),
            src,
            &dst,
        )?;
        Ok((channel, dst))
    }

    fn release_channel_slot(&self) {
        let _ = self
            .channel_slots
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
    }

    /// Drop a channel from the registry and give back its slot
    pub fn forget_channel(&self, id: ChannelId) {
        if self.channels.remove(&id).is_some() {
            self.release_channel_slot();
            debug!(channel_id = id, "Channel forgotten");
        }
    }

    /// Serialized GETPROXIES table
    pub fn get_all_sessions(&self) -> Bytes {
        self.directory.output()
    }

    pub fn session_count(&self) -> usize {
        self.live.len()
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    fn live_sessions(&self) -> Vec<Arc<Session>> {
        self.live.values().into_iter().filter_map(|w| w.upgrade()).collect()
    }

    pub fn list_sessions(&self) -> Vec<SessionSummary> {
        let mut list: Vec<_> = self.live_sessions().iter().map(|s| s.summary()).collect();
        list.sort_by_key(|s| s.id);
        list
    }

    pub fn list_channels(&self) -> Vec<ChannelSummary> {
        let mut list: Vec<_> = self
            .channels
            .values()
            .into_iter()
            .filter_map(|w| w.upgrade())
            .map(|c| c.summary())
            .collect();
        list.sort_by_key(|c| c.id);
        list
    }

    /// Stop a logged-in session by id. Returns false if there is none.
    pub fn close_session_by_id(&self, id: SessionId) -> bool {
        let Some(session) = self
            .live_sessions()
            .into_iter()
            .find(|s| s.is_logged_in() && s.id() == id)
        else {
            return false;
        };
        info!(session_id = id, "Session closed by admin");
        session.stop();
        true
    }

    pub fn close_channel_by_id(&self, id: ChannelId) -> bool {
        let Some(channel) = self.channels.get(&id).and_then(|w| w.upgrade()) else {
            return false;
        };
        info!(channel_id = id, "Channel closed by admin");
        channel.stop();
        true
    }

    /// Stop every connected session
    pub fn stop_all(&self) {
        let sessions = self.live_sessions();
        info!(count = sessions.len(), "Stopping all sessions");
        for session in sessions {
            session.stop();
        }
    }
}
