//! The pool façade: spawns the dispatcher and worker threads and exposes
//! the public operations.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::thread::JoinHandle;

use bytes::Bytes;
use tracing::info;

use crate::config::Config;
use crate::conn::Conn;
use crate::dispatcher;
use crate::error::Error;
use crate::handler::PoolEvents;
use crate::worker::{Core, WorkerRef};

/// Shared pool state reachable from every thread and connection.
pub(crate) struct PoolCore {
    pub(crate) cfg: Config,
    pub(crate) handler: Box<dyn PoolEvents>,
    disp: OnceLock<WorkerRef>,
    /// Threads eligible for connection servicing: the workers, or just the
    /// dispatcher when `num_workers == 0`.
    selectable: OnceLock<Vec<WorkerRef>>,
    closed: AtomicBool,
}

impl PoolCore {
    pub(crate) fn disp_ref(&self) -> Option<&WorkerRef> {
        self.disp.get()
    }

    /// Least-loaded worker, lowest index winning ties. Deterministic for a
    /// fixed sequence of accepts and connects.
    pub(crate) fn select_worker(&self) -> WorkerRef {
        self.selectable
            .get()
            .expect("pool threads are running")
            .iter()
            .min_by_key(|w| w.load.load(Ordering::Relaxed))
            .expect("at least one selectable thread")
            .clone()
    }
}

/// Snapshot of pool occupancy.
#[derive(Debug, Clone)]
pub struct PoolStats {
    /// Connections currently registered with the dispatcher.
    pub connections: usize,
    /// Fed-connection count per selectable thread.
    pub worker_loads: Vec<usize>,
}

/// A connection pool.
///
/// One dispatcher thread owns socket lifecycle and the registry; worker
/// threads own established sockets' I/O. Dropping the pool shuts it down.
pub struct ConnPool {
    core: Arc<PoolCore>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl ConnPool {
    /// Spawn the pool threads. Panics if the OS refuses reactor or thread
    /// resources, mirroring thread-spawn conventions elsewhere.
    pub fn new(cfg: Config, handler: impl PoolEvents) -> ConnPool {
        let num_workers = cfg.num_workers;
        let core = Arc::new(PoolCore {
            cfg,
            handler: Box::new(handler),
            disp: OnceLock::new(),
            selectable: OnceLock::new(),
            closed: AtomicBool::new(false),
        });

        let mut threads = Vec::with_capacity(num_workers + 1);

        let (dref, handle) = spawn_loop("tidepool-dispatcher".into(), true, &core);
        threads.push(handle);
        let _ = core.disp.set(dref.clone());

        let mut workers = Vec::with_capacity(num_workers);
        for i in 0..num_workers {
            let (wref, handle) = spawn_loop(format!("tidepool-worker-{i}"), false, &core);
            threads.push(handle);
            workers.push(wref);
        }
        let selectable = if workers.is_empty() {
            vec![dref]
        } else {
            workers
        };
        let _ = core.selectable.set(selectable);

        ConnPool {
            core,
            threads: Mutex::new(threads),
        }
    }

    fn disp(&self) -> Result<&WorkerRef, Error> {
        if self.core.closed.load(Ordering::Acquire) {
            return Err(Error::PoolClosed);
        }
        self.core.disp_ref().ok_or(Error::PoolClosed)
    }

    /// Bind and listen for inbound connections. Synchronous; a repeated
    /// call replaces the previous listener.
    pub fn listen(&self, addr: SocketAddr) -> Result<(), Error> {
        let pool = self.core.clone();
        self.disp()?
            .tcall
            .call(move |core| dispatcher::listen_inner(core, &pool, addr))
            .ok_or(Error::PoolClosed)?
    }

    /// The listener's bound address, once [`listen`](Self::listen) has
    /// succeeded. Useful with port 0 binds.
    pub fn listen_addr(&self) -> Option<SocketAddr> {
        self.disp()
            .ok()?
            .tcall
            .call(|core| core.disp.as_ref().and_then(|d| d.listen_addr()))
            .flatten()
    }

    /// Begin an outbound connection. Socket and setup failures are
    /// synchronous; timeout and refusal surface later through
    /// `on_teardown` with a terminal `Connect` status.
    pub fn connect(&self, addr: SocketAddr) -> Result<Arc<Conn>, Error> {
        let pool = self.core.clone();
        self.disp()?
            .tcall
            .call(move |core| dispatcher::connect_inner(core, &pool, addr))
            .ok_or(Error::PoolClosed)?
    }

    /// Tear a connection down and wait for destruction to complete. Must
    /// not be called from inside pool callbacks; use
    /// [`terminate_async`](Self::terminate_async) there.
    pub fn terminate(&self, conn: &Arc<Conn>) {
        let Ok(disp) = self.disp() else { return };
        let conn = conn.clone();
        let pool = self.core.clone();
        let _ = disp
            .tcall
            .call(move |core| conn.disp_terminate(core, &pool));
    }

    /// Tear a connection down asynchronously; safe from any context.
    pub fn terminate_async(&self, conn: &Arc<Conn>) {
        let Ok(disp) = self.disp() else { return };
        let conn = conn.clone();
        let pool = self.core.clone();
        disp.tcall
            .async_call(move |core| conn.disp_terminate(core, &pool));
    }

    /// Enqueue bytes on a connection's send buffer.
    pub fn send(&self, conn: &Arc<Conn>, data: impl Into<Bytes>) -> Result<(), Error> {
        conn.send(data)
    }

    /// Occupancy snapshot.
    pub fn stats(&self) -> PoolStats {
        let connections = self
            .disp()
            .ok()
            .and_then(|d| {
                d.tcall
                    .call(|core| core.disp.as_ref().map(|d| d.by_fd.len()).unwrap_or(0))
            })
            .unwrap_or(0);
        let worker_loads = self
            .core
            .selectable
            .get()
            .map(|ws| ws.iter().map(|w| w.load.load(Ordering::Relaxed)).collect())
            .unwrap_or_default();
        PoolStats {
            connections,
            worker_loads,
        }
    }

    /// Terminate every connection, stop all threads, and join them.
    /// Idempotent; also runs on drop.
    pub fn shutdown(&self) {
        if self.core.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(disp) = self.core.disp_ref() {
            let pool = self.core.clone();
            let _ = disp.tcall.call(move |core| {
                dispatcher::close_listener(core);
                let conns: Vec<Arc<Conn>> = core
                    .disp
                    .as_ref()
                    .map(|d| d.by_fd.values().cloned().collect())
                    .unwrap_or_default();
                for conn in conns {
                    conn.disp_terminate(core, &pool);
                }
            });
        }
        if let Some(ws) = self.core.selectable.get() {
            for w in ws {
                if !w.is_dispatcher {
                    w.tcall.async_call(|core| core.shutdown = true);
                }
            }
        }
        if let Some(disp) = self.core.disp_ref() {
            disp.tcall.async_call(|core| core.shutdown = true);
        }
        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.threads.lock().unwrap());
        for handle in handles {
            let _ = handle.join();
        }
        info!("pool shut down");
    }
}

impl Drop for ConnPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn spawn_loop(
    name: String,
    is_dispatcher: bool,
    core: &Arc<PoolCore>,
) -> (WorkerRef, JoinHandle<()>) {
    let (mut c, wref) =
        Core::new(is_dispatcher, Arc::downgrade(core)).expect("failed to create reactor");
    let handle = std::thread::Builder::new()
        .name(name)
        .spawn(move || c.run())
        .expect("failed to spawn pool thread");
    (wref, handle)
}
