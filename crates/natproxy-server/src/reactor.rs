//! Fixed pool of single-threaded reactors
//!
//! Each context is a `current_thread` tokio runtime driven by its own OS
//! thread. Objects are assigned to a context round-robin and issue all of
//! their I/O there. A panicking task is torn down alone; its context and
//! every other task on it keep running.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

use thiserror::Error;
use tokio::runtime::{Builder, Handle, Runtime};
use tokio::sync::watch;
use tracing::{debug, error, info};

#[derive(Debug, Error)]
pub enum ReactorError {
    #[error("Worker count must be > 0")]
    NoWorkers,
    #[error("Failed to build reactor {index}: {source}")]
    Build {
        index: usize,
        source: std::io::Error,
    },
    #[error("Failed to spawn reactor thread {index}: {source}")]
    Spawn {
        index: usize,
        source: std::io::Error,
    },
}

/// Hands out the context the next object should live on
pub trait Scheduler: Send + Sync {
    fn next(&self) -> Handle;
}

/// Round-robin over the pool's context handles
///
/// Holds only handles, so tasks may keep it alive without keeping the
/// runtimes themselves alive.
pub struct ContextRing {
    handles: Vec<Handle>,
    cursor: AtomicUsize,
}

impl ContextRing {
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }
}

impl Scheduler for ContextRing {
    fn next(&self) -> Handle {
        let i = self.cursor.fetch_add(1, Ordering::Relaxed) % self.handles.len();
        self.handles[i].clone()
    }
}

/// Scheduler that keeps everything on one existing runtime
pub struct SingleContext(Handle);

impl SingleContext {
    pub fn new(handle: Handle) -> Self {
        Self(handle)
    }

    /// Must be called from inside a runtime
    pub fn current() -> Self {
        Self(Handle::current())
    }
}

impl Scheduler for SingleContext {
    fn next(&self) -> Handle {
        self.0.clone()
    }
}

/// Clonable stop trigger for a [`ReactorPool`]
#[derive(Clone)]
pub struct StopHandle {
    active: Arc<AtomicBool>,
    shutdown: Arc<watch::Sender<bool>>,
}

impl StopHandle {
    /// Idempotent; the first caller flips the pool to inactive
    pub fn stop(&self) {
        if self.active.swap(false, Ordering::AcqRel) {
            info!("Stopping reactor pool");
            self.shutdown.send_replace(true);
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }
}

pub struct ReactorPool {
    runtimes: Vec<Runtime>,
    ring: Arc<ContextRing>,
    stop: StopHandle,
}

impl ReactorPool {
    pub fn new(workers: usize) -> Result<Self, ReactorError> {
        if workers == 0 {
            return Err(ReactorError::NoWorkers);
        }

        let mut runtimes = Vec::with_capacity(workers);
        for index in 0..workers {
            let runtime = Builder::new_current_thread()
                .enable_all()
                .thread_name(format!("natproxy-io-{index}"))
                .build()
                .map_err(|source| ReactorError::Build { index, source })?;
            runtimes.push(runtime);
        }

        let handles = runtimes.iter().map(|rt| rt.handle().clone()).collect();
        let (shutdown, _) = watch::channel(false);

        Ok(Self {
            runtimes,
            ring: Arc::new(ContextRing {
                handles,
                cursor: AtomicUsize::new(0),
            }),
            stop: StopHandle {
                active: Arc::new(AtomicBool::new(true)),
                shutdown: Arc::new(shutdown),
            },
        })
    }

    pub fn size(&self) -> usize {
        self.runtimes.len()
    }

    pub fn scheduler(&self) -> Arc<ContextRing> {
        self.ring.clone()
    }

    /// Next context, round-robin
    pub fn next(&self) -> Handle {
        self.ring.next()
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    pub fn stop(&self) {
        self.stop.stop();
    }

    /// Drive a future on the first context from the calling thread.
    /// Only valid while [`run`](Self::run) is not driving the pool.
    pub fn block_on<F: std::future::Future>(&self, fut: F) -> F::Output {
        self.runtimes[0].block_on(fut)
    }

    /// Block the calling thread until [`stop`](Self::stop) is called.
    /// One OS thread per context.
    pub fn run(&self) -> Result<(), ReactorError> {
        info!(workers = self.runtimes.len(), "Reactor pool running");

        thread::scope(|scope| {
            let mut threads = Vec::with_capacity(self.runtimes.len());
            for (index, runtime) in self.runtimes.iter().enumerate() {
                let stop = self.stop.clone();
                let spawned = thread::Builder::new()
                    .name(format!("natproxy-reactor-{index}"))
                    .spawn_scoped(scope, move || drive(index, runtime, stop));
                match spawned {
                    Ok(t) => threads.push(t),
                    Err(source) => {
                        self.stop();
                        return Err(ReactorError::Spawn { index, source });
                    }
                }
            }

            for (index, t) in threads.into_iter().enumerate() {
                if t.join().is_err() {
                    error!(reactor = index, "Reactor thread panicked");
                }
            }
            Ok(())
        })?;

        info!("Reactor pool stopped");
        Ok(())
    }
}

fn drive(index: usize, runtime: &Runtime, stop: StopHandle) {
    let mut shutdown = stop.shutdown.subscribe();
    runtime.block_on(async {
        let _ = shutdown.wait_for(|stopped| *stopped).await;
    });
    debug!(reactor = index, "Reactor drained");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::time::Duration;

    #[test]
    fn test_zero_workers_rejected() {
        assert!(matches!(ReactorPool::new(0), Err(ReactorError::NoWorkers)));
    }

    #[test]
    fn test_round_robin_spreads_tasks() {
        let pool = ReactorPool::new(2).unwrap();
        assert_eq!(pool.scheduler().len(), 2);
        let (tx, rx) = mpsc::channel();

        for _ in 0..4 {
            let tx = tx.clone();
            pool.next().spawn(async move {
                tokio::time::sleep(Duration::from_millis(10)).await;
                let _ = tx.send(thread::current().name().map(str::to_string));
            });
        }

        let stop = pool.stop_handle();
        let stopper = thread::spawn(move || {
            let names: Vec<_> = (0..4)
                .map(|_| rx.recv_timeout(Duration::from_secs(5)).unwrap().unwrap())
                .collect();
            stop.stop();
            stop.stop();
            names
        });

        pool.run().unwrap();
        let names = stopper.join().unwrap();
        let on_first = names.iter().filter(|n| *n == "natproxy-reactor-0").count();
        let on_second = names.iter().filter(|n| *n == "natproxy-reactor-1").count();
        assert_eq!((on_first, on_second), (2, 2));
        assert!(!pool.stop_handle().is_active());
    }

    #[test]
    fn test_panicking_task_leaves_context_running() {
        let pool = ReactorPool::new(1).unwrap();
        let (tx, rx) = mpsc::channel();

        let context = pool.next();
        let crashed = context.spawn(async { panic!("session handler bug") });
        let survivor_tx = tx.clone();
        context.spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            let _ = survivor_tx.send("survivor");
        });
        context.spawn(async move {
            let _ = tx.send(if crashed.await.is_err() { "contained" } else { "missed" });
        });

        let stop = pool.stop_handle();
        let stopper = thread::spawn(move || {
            let mut seen: Vec<_> = (0..2)
                .map(|_| rx.recv_timeout(Duration::from_secs(5)).unwrap())
                .collect();
            stop.stop();
            seen.sort();
            seen
        });

        pool.run().unwrap();
        assert_eq!(stopper.join().unwrap(), vec!["contained", "survivor"]);
    }

    #[test]
    fn test_block_on_before_run() {
        let pool = ReactorPool::new(1).unwrap();
        let value = pool.block_on(async {
            tokio::task::yield_now().await;
            7
        });
        assert_eq!(value, 7);
    }

    #[test]
    fn test_stop_before_run_returns() {
        let pool = ReactorPool::new(1).unwrap();
        pool.stop();
        pool.run().unwrap();
    }
}
