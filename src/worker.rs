//! Per-thread reactor core.
//!
//! Every pool thread (the dispatcher and each worker) runs one [`Core`]:
//! a `mio::Poll`, a slab of registrations, a connect-deadline heap
//! (dispatcher only), and a task mailbox kicked by a `mio::Waker`. Cross
//! thread state changes travel exclusively through [`TCall`]: workers post
//! asynchronously toward the dispatcher, the dispatcher may call into a
//! worker synchronously (the `stop` handoff). Workers never block on the
//! dispatcher, so that handoff cannot deadlock.

use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;

use crossbeam_channel::{Receiver, Sender};
use mio::{Events, Interest, Poll, Token, Waker};
use slab::Slab;
use tracing::error;

use crate::conn::{self, Conn, ConnMode, Phase};
use crate::dispatcher::{self, DispState};
use crate::pool::PoolCore;

pub(crate) const WAKER: Token = Token(usize::MAX);
const RW: Interest = Interest::READABLE.add(Interest::WRITABLE);

/// What a reactor token points at.
pub(crate) enum Registration {
    /// The dispatcher's listen socket.
    Listener,
    /// An active connect awaiting its completion probe (dispatcher only).
    Connect(Weak<Conn>),
    /// An established connection serviced by this thread.
    Io(Weak<Conn>),
}

/// A pending connect deadline. Min-heap by deadline; stale entries are
/// filtered at fire time by checking the connection is still connecting.
pub(crate) struct TimerSlot {
    pub(crate) deadline: Instant,
    pub(crate) conn: Weak<Conn>,
}

impl Eq for TimerSlot {}

impl PartialEq for TimerSlot {
    fn eq(&self, other: &Self) -> bool {
        self.deadline.eq(&other.deadline)
    }
}

impl Ord for TimerSlot {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        other.deadline.cmp(&self.deadline)
    }
}

impl PartialOrd for TimerSlot {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

pub(crate) type Task = Box<dyn FnOnce(&mut Core) + Send>;

/// Handle for posting work onto a core's thread.
#[derive(Clone)]
pub(crate) struct TCall {
    tx: Sender<Task>,
    waker: Arc<Waker>,
}

impl TCall {
    /// Post a task; it runs on the target thread's next loop iteration.
    pub(crate) fn async_call(&self, f: impl FnOnce(&mut Core) + Send + 'static) {
        if self.tx.send(Box::new(f)).is_ok() {
            let _ = self.waker.wake();
        }
    }

    /// Post a task and block until it has run, returning its result.
    /// `None` when the target thread is gone. Never call toward a thread
    /// that may be blocked on this one.
    pub(crate) fn call<R: Send + 'static>(
        &self,
        f: impl FnOnce(&mut Core) -> R + Send + 'static,
    ) -> Option<R> {
        let (done_tx, done_rx) = crossbeam_channel::bounded(1);
        self.async_call(move |core| {
            let _ = done_tx.send(f(core));
        });
        done_rx.recv().ok()
    }
}

/// Identity of a pool thread: its mailbox, fed-connection count, and role.
#[derive(Clone)]
pub(crate) struct WorkerRef {
    pub(crate) tcall: TCall,
    pub(crate) load: Arc<AtomicUsize>,
    pub(crate) is_dispatcher: bool,
}

/// Reactor state owned by one pool thread.
pub(crate) struct Core {
    pub(crate) poll: Poll,
    pub(crate) regs: Slab<Registration>,
    pub(crate) timers: BinaryHeap<TimerSlot>,
    tasks: Receiver<Task>,
    pub(crate) shutdown: bool,
    pub(crate) is_dispatcher: bool,
    pub(crate) disp: Option<DispState>,
    pool: Weak<PoolCore>,
}

impl Core {
    pub(crate) fn new(is_dispatcher: bool, pool: Weak<PoolCore>) -> io::Result<(Core, WorkerRef)> {
        let poll = Poll::new()?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER)?);
        let (tx, rx) = crossbeam_channel::unbounded();
        let core = Core {
            poll,
            regs: Slab::new(),
            timers: BinaryHeap::new(),
            tasks: rx,
            shutdown: false,
            is_dispatcher,
            disp: is_dispatcher.then(DispState::new),
            pool,
        };
        let wref = WorkerRef {
            tcall: TCall { tx, waker },
            load: Arc::new(AtomicUsize::new(0)),
            is_dispatcher,
        };
        Ok((core, wref))
    }

    /// Run the reactor. Blocks the current thread until shutdown.
    pub(crate) fn run(&mut self) {
        let mut events = Events::with_capacity(1024);
        let mut ready = Vec::with_capacity(1024);
        while !self.shutdown {
            let timeout = self
                .timers
                .peek()
                .map(|t| t.deadline.saturating_duration_since(Instant::now()));
            if let Err(e) = self.poll.poll(&mut events, timeout) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                error!("reactor poll failed: {}", e);
                break;
            }
            let Some(pool) = self.pool.upgrade() else { break };

            ready.clear();
            ready.extend(events.iter().map(|e| {
                (
                    e.token(),
                    e.is_readable() || e.is_read_closed(),
                    e.is_writable(),
                    e.is_error(),
                )
            }));
            for &(token, readable, writable, errored) in &ready {
                if token == WAKER {
                    continue;
                }
                self.dispatch(&pool, token, readable, writable, errored);
            }

            self.fire_timers(&pool);
            self.drain_tasks();
        }
    }

    fn dispatch(
        &mut self,
        pool: &Arc<PoolCore>,
        token: Token,
        readable: bool,
        writable: bool,
        errored: bool,
    ) {
        match self.regs.get(token.0) {
            Some(Registration::Listener) => dispatcher::accept_ready(self, pool),
            Some(Registration::Connect(weak)) => {
                let weak = weak.clone();
                dispatcher::connect_probe(self, pool, weak);
            }
            Some(Registration::Io(weak)) => {
                let weak = weak.clone();
                conn::handle_io(self, pool, weak, readable, writable, errored);
            }
            None => {}
        }
    }

    fn fire_timers(&mut self, pool: &Arc<PoolCore>) {
        let now = Instant::now();
        while let Some(top) = self.timers.peek() {
            if top.deadline > now {
                break;
            }
            let slot = self.timers.pop().unwrap();
            dispatcher::connect_timeout(self, pool, slot.conn);
        }
    }

    fn drain_tasks(&mut self) {
        loop {
            let task = match self.tasks.try_recv() {
                Ok(t) => t,
                Err(_) => break,
            };
            task(self);
            if self.shutdown {
                break;
            }
        }
    }
}

/// Assign a connection to a worker and begin servicing its socket there.
pub(crate) fn feed(pool: &Arc<PoolCore>, conn: &Arc<Conn>, w: &WorkerRef) {
    w.load.fetch_add(1, Ordering::Relaxed);
    *conn.worker.lock().unwrap() = Some(w.clone());
    let weak = Arc::downgrade(conn);
    let pool = pool.clone();
    w.tcall.async_call(move |core| feed_conn(core, &pool, &weak));
}

fn feed_conn(core: &mut Core, pool: &Arc<PoolCore>, weak: &Weak<Conn>) {
    let Some(conn) = weak.upgrade() else { return };
    if conn.mode() == ConnMode::Dead {
        return;
    }

    #[cfg(feature = "tls")]
    let tls_enabled = pool.cfg.tls.is_some();
    #[cfg(not(feature = "tls"))]
    let tls_enabled = false;

    {
        let mut st = conn.io.lock().unwrap();

        #[cfg(feature = "tls")]
        if let Some(ctx) = &pool.cfg.tls {
            let buffer_limit = pool.cfg.seg_buff_size.max(1 << 14) * 4;
            let session = match conn.mode() {
                ConnMode::Active => {
                    crate::tls::TlsSession::client(ctx, conn.peer_addr().ip(), buffer_limit)
                }
                _ => crate::tls::TlsSession::server(ctx, buffer_limit),
            };
            match session {
                Ok(s) => {
                    st.tls = Some(s);
                    st.phase = Phase::Handshake;
                }
                Err(e) => {
                    drop(st);
                    error!("{} tls session setup failed: {}", conn, e);
                    conn.set_terminal(e);
                    conn.worker_terminate(core, pool);
                    return;
                }
            }
        }
        if !tls_enabled {
            st.phase = Phase::Stream;
        }

        let Some(sock) = st.sock.as_mut() else {
            return;
        };
        let entry = core.regs.vacant_entry();
        let token = Token(entry.key());
        match core.poll.registry().register(sock, token, RW) {
            Ok(()) => {
                entry.insert(Registration::Io(weak.clone()));
                st.token = Some(token);
                st.interest = Some(RW);
            }
            Err(e) => {
                drop(st);
                error!("{} reactor registration failed: {}", conn, e);
                conn.worker_terminate(core, pool);
                return;
            }
        }
    }

    // wake this worker when the send buffer goes non-empty
    let w = conn.worker.lock().unwrap().clone();
    if let Some(w) = w {
        let weak = weak.clone();
        conn.send_buffer().reg_handler(move || {
            let weak = weak.clone();
            w.tcall.async_call(move |core| {
                if let Some(c) = weak.upgrade() {
                    c.arm_send(core);
                }
            });
        });
    }

    if !tls_enabled {
        pool.handler.on_ready(&conn, true);
    }
}
