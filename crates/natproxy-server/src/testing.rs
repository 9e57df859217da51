//! Test rig: a manager with an in-memory directory and loopback sessions

use std::net::Ipv4Addr;
use std::sync::Arc;

use natproxy_proto::ChannelId;
use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::runtime::Handle;

use crate::channel::{ChannelConfig, RelayChannel};
use crate::client::ControlClient;
use crate::config::SessionType;
use crate::directory::{MemoryDirectoryStore, SessionDirectory};
use crate::manager::{ManagerConfig, SessionManager};
use crate::metrics::RelayMetrics;
use crate::session::Session;

pub(crate) struct TestRig {
    pub manager: Arc<SessionManager>,
    pub metrics: Arc<RelayMetrics>,
    listener: TcpListener,
    /// Control connections whose client side the test does not hold
    parked: Mutex<Vec<ControlClient>>,
}

impl TestRig {
    pub async fn new() -> Self {
        Self::with_channel_config(ChannelConfig {
            display_interval: None,
            ..ChannelConfig::default()
        })
        .await
    }

    pub async fn with_channel_config(channel: ChannelConfig) -> Self {
        Self::with_config(ManagerConfig {
            channel,
            ..ManagerConfig::default()
        })
        .await
    }

    pub async fn with_config(config: ManagerConfig) -> Self {
        let metrics = Arc::new(RelayMetrics::new().unwrap());
        let directory =
            SessionDirectory::spawn(Arc::new(MemoryDirectoryStore::new()), &Handle::current());
        let manager = Arc::new(SessionManager::new(config, directory, metrics.clone()));
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
        Self {
            manager,
            metrics,
            listener,
            parked: Mutex::new(Vec::new()),
        }
    }

    /// Open a loopback control connection and start a session on it
    pub async fn connect(&self, session_type: SessionType) -> (Arc<Session>, ControlClient) {
        let addr = self.listener.local_addr().unwrap();
        let (client, accepted) = tokio::join!(TcpStream::connect(addr), self.listener.accept());
        let (server, _) = accepted.unwrap();

        assert!(self.manager.try_register_connection());
        let session = Session::start(server, session_type, self.manager.clone()).unwrap();
        (session, ControlClient::from_stream(client.unwrap()))
    }

    /// Like [`connect`](Self::connect), keeping the client side open
    /// for the rig's lifetime
    pub async fn connect_parked(&self, session_type: SessionType) -> Arc<Session> {
        let (session, client) = self.connect(session_type).await;
        self.parked.lock().push(client);
        session
    }
}

pub(crate) async fn udp_client(ip: Ipv4Addr) -> UdpSocket {
    UdpSocket::bind((ip, 0)).await.unwrap()
}

/// Two sessions joined by an initialized, not yet started channel, plus a
/// UDP client for each side
pub(crate) async fn channel_between(
    rig: &TestRig,
    id: ChannelId,
) -> (Arc<RelayChannel>, UdpSocket, UdpSocket) {
    let src = rig.connect_parked(SessionType::Either).await;
    let dst = rig.connect_parked(SessionType::Either).await;

    let channel = RelayChannel::new(
        id,
        rig.manager.config().channel.clone(),
        rig.metrics.clone(),
        &src,
        &dst,
    )
    .unwrap();
    channel.init().unwrap();

    (
        channel,
        udp_client(Ipv4Addr::LOCALHOST).await,
        udp_client(Ipv4Addr::LOCALHOST).await,
    )
}
