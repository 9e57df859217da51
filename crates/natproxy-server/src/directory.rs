//! Session directory: the persisted list of discoverable sessions
//!
//! `add`/`del` are fire-and-forget. A single background task applies them in
//! order, rebuilds the GETPROXIES snapshot, then writes through to the
//! backing [`DirectoryStore`]. Store failures are logged and never hold back
//! the snapshot.

use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;
use natproxy_proto::message::SessionId;
use natproxy_proto::Guid;
use natproxy_proto::peers::{empty_peer_table, encode_peer_table, PeerEntry};
use parking_lot::RwLock;
use thiserror::Error;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum DirectoryError {
    #[error("Store error: {0}")]
    Store(String),
    #[error("Directory worker is gone")]
    Closed,
}

/// One directory record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    pub id: SessionId,
    pub addr: Ipv4Addr,
    pub guid: Guid,
}

/// Backing key/value store
#[async_trait::async_trait]
pub trait DirectoryStore: Send + Sync {
    async fn put(&self, info: &SessionInfo) -> Result<(), DirectoryError>;

    async fn remove(&self, info: &SessionInfo) -> Result<(), DirectoryError>;
}

/// In-process store, keyed by guid
#[derive(Default)]
pub struct MemoryDirectoryStore {
    entries: DashMap<Guid, SessionInfo>,
}

impl MemoryDirectoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, guid: &Guid) -> Option<SessionInfo> {
        self.entries.get(guid).map(|e| e.value().clone())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait::async_trait]
impl DirectoryStore for MemoryDirectoryStore {
    async fn put(&self, info: &SessionInfo) -> Result<(), DirectoryError> {
        self.entries.insert(info.guid.clone(), info.clone());
        Ok(())
    }

    async fn remove(&self, info: &SessionInfo) -> Result<(), DirectoryError> {
        self.entries.remove(&info.guid);
        Ok(())
    }
}

/// Redis-backed store: hash `SESSION:<guid>` with fields `ID`, `ADDR`, `GUID`
#[cfg(feature = "redis")]
pub struct RedisDirectoryStore {
    conn: redis::aio::MultiplexedConnection,
}

#[cfg(feature = "redis")]
impl RedisDirectoryStore {
    pub async fn connect(redis_url: &str) -> Result<Self, DirectoryError> {
        let client =
            redis::Client::open(redis_url).map_err(|e| DirectoryError::Store(e.to_string()))?;
        let conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| DirectoryError::Store(e.to_string()))?;
        Ok(Self { conn })
    }

    /// Raw guid bytes after the prefix, matching the `GUID` field
    fn key(guid: &Guid) -> Vec<u8> {
        let mut key = b"SESSION:".to_vec();
        key.extend_from_slice(guid.as_bytes());
        key
    }
}

#[cfg(feature = "redis")]
#[async_trait::async_trait]
impl DirectoryStore for RedisDirectoryStore {
    async fn put(&self, info: &SessionInfo) -> Result<(), DirectoryError> {
        let mut conn = self.conn.clone();
        redis::cmd("HSET")
            .arg(Self::key(&info.guid))
            .arg("ID")
            .arg(info.id)
            .arg("ADDR")
            .arg(info.addr.to_string())
            .arg("GUID")
            .arg(info.guid.as_bytes())
            .query_async::<_, ()>(&mut conn)
            .await
            .map_err(|e| DirectoryError::Store(e.to_string()))
    }

    async fn remove(&self, info: &SessionInfo) -> Result<(), DirectoryError> {
        let mut conn = self.conn.clone();
        redis::cmd("DEL")
            .arg(Self::key(&info.guid))
            .query_async::<_, ()>(&mut conn)
            .await
            .map_err(|e| DirectoryError::Store(e.to_string()))
    }
}

enum DirectoryOp {
    Add(SessionInfo),
    Del(SessionId),
    Sync(oneshot::Sender<()>),
}

/// Handle to the directory worker
pub struct SessionDirectory {
    ops: mpsc::UnboundedSender<DirectoryOp>,
    snapshot: Arc<RwLock<Bytes>>,
    entries: Arc<AtomicUsize>,
}

impl SessionDirectory {
    /// Start the worker on `context`
    pub fn spawn(store: Arc<dyn DirectoryStore>, context: &Handle) -> Self {
        let (ops, rx) = mpsc::unbounded_channel();
        let snapshot = Arc::new(RwLock::new(empty_peer_table()));
        let entries = Arc::new(AtomicUsize::new(0));

        context.spawn(worker(rx, store, snapshot.clone(), entries.clone()));

        Self {
            ops,
            snapshot,
            entries,
        }
    }

    pub fn add(&self, info: SessionInfo) {
        if self.ops.send(DirectoryOp::Add(info)).is_err() {
            warn!("Directory worker gone, add dropped");
        }
    }

    pub fn del(&self, id: SessionId) {
        if self.ops.send(DirectoryOp::Del(id)).is_err() {
            warn!(session_id = id, "Directory worker gone, delete dropped");
        }
    }

    /// Latest serialized peer table
    pub fn output(&self) -> Bytes {
        self.snapshot.read().clone()
    }

    /// Entries in the latest snapshot table
    pub fn len(&self) -> usize {
        self.entries.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Wait until every operation queued before this call has been applied
    pub async fn sync(&self) -> Result<(), DirectoryError> {
        let (tx, rx) = oneshot::channel();
        self.ops
            .send(DirectoryOp::Sync(tx))
            .map_err(|_| DirectoryError::Closed)?;
        rx.await.map_err(|_| DirectoryError::Closed)
    }
}

async fn worker(
    mut rx: mpsc::UnboundedReceiver<DirectoryOp>,
    store: Arc<dyn DirectoryStore>,
    snapshot: Arc<RwLock<Bytes>>,
    entries: Arc<AtomicUsize>,
) {
    let mut table: BTreeMap<SessionId, SessionInfo> = BTreeMap::new();

    while let Some(op) = rx.recv().await {
        match op {
            DirectoryOp::Add(info) => {
                debug!(session_id = info.id, guid = %info.guid, "Directory add");
                table.insert(info.id, info.clone());
                publish(&table, &snapshot, &entries);
                if let Err(e) = store.put(&info).await {
                    warn!(session_id = info.id, "Directory store put failed: {}", e);
                }
            }
            DirectoryOp::Del(id) => {
                let Some(info) = table.remove(&id) else {
                    debug!(session_id = id, "Directory delete of unknown id");
                    continue;
                };
                debug!(session_id = id, guid = %info.guid, "Directory del");
                publish(&table, &snapshot, &entries);
                if let Err(e) = store.remove(&info).await {
                    warn!(session_id = id, "Directory store remove failed: {}", e);
                }
            }
            DirectoryOp::Sync(done) => {
                let _ = done.send(());
            }
        }
    }

    debug!("Directory worker exiting");
}

fn publish(
    table: &BTreeMap<SessionId, SessionInfo>,
    snapshot: &RwLock<Bytes>,
    entries: &AtomicUsize,
) {
    let peers: Vec<PeerEntry> = table
        .values()
        .map(|info| PeerEntry {
            id: info.id,
            addr: info.addr,
        })
        .collect();
    let encoded = encode_peer_table(&peers);
    entries.store(encoded[0] as usize, Ordering::Relaxed);
    *snapshot.write() = encoded;
}

#[cfg(test)]
mod tests {
    use super::*;
    use natproxy_proto::peers::decode_peer_table;

    fn info(id: SessionId, guid: &str) -> SessionInfo {
        SessionInfo {
            id,
            addr: Ipv4Addr::new(198, 51, 100, (id % 250) as u8),
            guid: Guid::from(guid),
        }
    }

    struct FailingStore;

    #[async_trait::async_trait]
    impl DirectoryStore for FailingStore {
        async fn put(&self, _info: &SessionInfo) -> Result<(), DirectoryError> {
            Err(DirectoryError::Store("unreachable".into()))
        }

        async fn remove(&self, _info: &SessionInfo) -> Result<(), DirectoryError> {
            Err(DirectoryError::Store("unreachable".into()))
        }
    }

    #[tokio::test]
    async fn test_add_then_delete() {
        let store = Arc::new(MemoryDirectoryStore::new());
        let dir = SessionDirectory::spawn(store.clone(), &Handle::current());
        assert_eq!(&dir.output()[..], &[0]);

        dir.add(info(1001, "bob"));
        dir.add(info(1000, "alice"));
        dir.sync().await.unwrap();

        let peers = decode_peer_table(&dir.output()).unwrap();
        assert_eq!(peers.iter().map(|p| p.id).collect::<Vec<_>>(), vec![1000, 1001]);
        assert_eq!(dir.len(), 2);
        assert_eq!(store.get(&Guid::from("alice")).unwrap().id, 1000);

        dir.del(1000);
        dir.del(4242);
        dir.sync().await.unwrap();

        let peers = decode_peer_table(&dir.output()).unwrap();
        assert_eq!(peers.len(), 1);
        assert_eq!(peers[0].id, 1001);
        assert!(store.get(&Guid::from("alice")).is_none());
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_store_keys_on_raw_guid_bytes() {
        let store = Arc::new(MemoryDirectoryStore::new());
        let dir = SessionDirectory::spawn(store.clone(), &Handle::current());
        let fe = Guid::from(vec![0xFE]);
        let ff = Guid::from(vec![0xFF]);
        for (id, guid) in [(1000, &fe), (1001, &ff)] {
            dir.add(SessionInfo {
                id,
                addr: Ipv4Addr::LOCALHOST,
                guid: guid.clone(),
            });
        }
        dir.sync().await.unwrap();

        assert_eq!(store.len(), 2);
        assert_eq!(store.get(&fe).unwrap().id, 1000);
        assert_eq!(store.get(&ff).unwrap().id, 1001);
    }

    #[tokio::test]
    async fn test_store_failure_does_not_block_snapshot() {
        let dir = SessionDirectory::spawn(Arc::new(FailingStore), &Handle::current());
        dir.add(info(1000, "alice"));
        dir.sync().await.unwrap();
        assert_eq!(dir.len(), 1);
    }

    #[tokio::test]
    async fn test_snapshot_capped() {
        let dir = SessionDirectory::spawn(Arc::new(MemoryDirectoryStore::new()), &Handle::current());
        for i in 0..300 {
            dir.add(info(1000 + i, &format!("peer-{i}")));
        }
        dir.sync().await.unwrap();
        let table = dir.output();
        assert_eq!(table[0], 255);
        assert_eq!(dir.len(), 255);
    }
}
