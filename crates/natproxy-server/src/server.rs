//! Relay server bootstrap: listeners, HTTP side door, signal handling

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::net::{TcpListener, TcpStream};
use tokio::runtime::Handle;
use tracing::{error, info, warn};

use crate::config::{ServerConfig, SessionType};
use crate::directory::{DirectoryStore, MemoryDirectoryStore, SessionDirectory};
use crate::http::{self, HttpState};
use crate::manager::SessionManager;
use crate::metrics::RelayMetrics;
use crate::reactor::{ReactorPool, Scheduler};
use crate::session::Session;

const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);
/// Time given to session writers to flush STOPPROXY pushes on shutdown
const DRAIN_GRACE: Duration = Duration::from_millis(200);

pub struct RelayServer {
    config: ServerConfig,
    pool: ReactorPool,
    manager: Arc<SessionManager>,
    metrics: Arc<RelayMetrics>,
}

impl RelayServer {
    pub fn new(config: ServerConfig) -> Result<Self> {
        let pool = ReactorPool::new(config.worker_threads).context("Failed to build reactor pool")?;
        let metrics = Arc::new(RelayMetrics::new()?);

        let store = pool.block_on(open_store(&config))?;
        let directory = SessionDirectory::spawn(store, &pool.next());
        let manager = Arc::new(SessionManager::new(
            config.manager_config(),
            directory,
            metrics.clone(),
        ));

        Ok(Self {
            config,
            pool,
            manager,
            metrics,
        })
    }

    pub fn manager(&self) -> &Arc<SessionManager> {
        &self.manager
    }

    /// Bind everything and block until SIGINT/SIGTERM
    pub fn run(&self) -> Result<()> {
        let scheduler: Arc<dyn Scheduler> = self.pool.scheduler();

        for listener in &self.config.listeners {
            let context = self.pool.next();
            let tcp = bind_tcp(&context, listener.addr)?;
            info!(addr = %listener.addr, session_type = %listener.session_type, "Control listener up");
            context.spawn(serve_listener(
                tcp,
                listener.session_type,
                self.manager.clone(),
                scheduler.clone(),
            ));
        }

        if let Some(addr) = self.config.http_addr {
            let context = self.pool.next();
            let tcp = bind_tcp(&context, addr)?;
            let app = http::router(
                HttpState {
                    manager: self.manager.clone(),
                    metrics: self.metrics.clone(),
                },
                self.config.admin_token.clone(),
            );
            info!(%addr, "HTTP server for health/metrics listening");
            context.spawn(async move {
                if let Err(e) = axum::serve(tcp, app).await {
                    error!("HTTP server error: {}", e);
                }
            });
        }

        let stop = self.pool.stop_handle();
        let manager = self.manager.clone();
        self.pool.next().spawn(async move {
            shutdown_signal().await;
            manager.stop_all();
            tokio::time::sleep(DRAIN_GRACE).await;
            stop.stop();
        });

        self.pool.run()?;
        self.manager.stop_all();
        info!("Relay server stopped");
        Ok(())
    }
}

fn bind_tcp(context: &Handle, addr: SocketAddr) -> Result<TcpListener> {
    let std_listener = std::net::TcpListener::bind(addr)
        .with_context(|| format!("Failed to bind {}", addr))?;
    std_listener.set_nonblocking(true)?;
    let _guard = context.enter();
    Ok(TcpListener::from_std(std_listener)?)
}

#[cfg(feature = "redis")]
async fn open_store(config: &ServerConfig) -> Result<Arc<dyn DirectoryStore>> {
    let Some(url) = &config.redis_url else {
        return Ok(Arc::new(MemoryDirectoryStore::new()));
    };
    let store = crate::directory::RedisDirectoryStore::connect(url)
        .await
        .with_context(|| format!("Failed to connect to {}", url))?;
    info!("Session directory backed by Redis");
    Ok(Arc::new(store))
}

#[cfg(not(feature = "redis"))]
async fn open_store(config: &ServerConfig) -> Result<Arc<dyn DirectoryStore>> {
    if config.redis_url.is_some() {
        warn!("redis_url is set but the redis feature is disabled, using in-memory directory");
    }
    Ok(Arc::new(MemoryDirectoryStore::new()))
}

/// Accept control connections forever, starting each session on the next
/// context from `scheduler`.
pub async fn serve_listener(
    listener: TcpListener,
    session_type: SessionType,
    manager: Arc<SessionManager>,
    scheduler: Arc<dyn Scheduler>,
) {
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                error!("Accept error: {}", e);
                tokio::time::sleep(ACCEPT_BACKOFF).await;
                continue;
            }
        };

        if !manager.try_register_connection() {
            warn!(
                %peer,
                max_sessions = manager.config().max_sessions,
                "Session limit reached, connection dropped"
            );
            continue;
        }

        let std_stream = match stream.into_std() {
            Ok(s) => s,
            Err(e) => {
                error!(%peer, "Failed to detach accepted socket: {}", e);
                manager.release_connection();
                continue;
            }
        };

        let manager = manager.clone();
        scheduler.next().spawn(async move {
            let started = TcpStream::from_std(std_stream)
                .and_then(|stream| Session::start(stream, session_type, manager.clone()));
            if let Err(e) = started {
                error!(%peer, "Failed to start session: {}", e);
                manager.release_connection();
            }
        });
    }
}

async fn shutdown_signal() {
    #[cfg(unix)]
    let mut sigterm = {
        use tokio::signal::unix::{signal, SignalKind};
        signal(SignalKind::terminate()).ok()
    };

    tokio::select! {
        _ = async {
            #[cfg(unix)]
            {
                match sigterm.as_mut() {
                    Some(sigterm) => {
                        sigterm.recv().await;
                    }
                    None => std::future::pending::<()>().await,
                }
            }
            #[cfg(not(unix))]
            {
                std::future::pending::<()>().await;
            }
        } => {
            info!("Received SIGTERM, starting graceful shutdown");
        }
        res = tokio::signal::ctrl_c() => {
            if let Err(e) = res {
                error!("Failed to listen for SIGINT: {}", e);
                std::future::pending::<()>().await;
            }
            info!("Received SIGINT, starting graceful shutdown");
        }
    }
}
