//! Per-connection state machine and I/O steps.
//!
//! A connection is created by the dispatcher (actively via `connect`,
//! passively via `accept`), pinned by its own strong self-reference while it
//! is live in the pool, and serviced by exactly one worker once fed. The
//! worker owns all reads and writes on the socket; the dispatcher owns
//! creation and close. Terminations from either side reconcile into a single
//! `del_conn` on the dispatcher.

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};

use bytes::Bytes;
use mio::net::TcpStream;
use mio::{Interest, Token};
use tracing::{debug, info};

use crate::buffer::SegBuffer;
use crate::dispatcher;
use crate::error::Error;
use crate::pool::PoolCore;
use crate::worker::{Core, WorkerRef};

#[cfg(feature = "tls")]
use crate::tls::{HandshakeStatus, TlsSession};
#[cfg(feature = "tls")]
use rustls::pki_types::CertificateDer;

const RW: Interest = Interest::READABLE.add(Interest::WRITABLE);

/// Connection direction / liveness.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnMode {
    /// We dialed the peer.
    Active = 0,
    /// The peer dialed us.
    Passive = 1,
    /// Terminal.
    Dead = 2,
}

impl ConnMode {
    fn from_u8(v: u8) -> ConnMode {
        match v {
            0 => ConnMode::Active,
            1 => ConnMode::Passive,
            _ => ConnMode::Dead,
        }
    }
}

/// I/O phase; selects which callbacks a readiness event runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Phase {
    /// Active connect issued, completion probe pending (dispatcher-owned).
    Connecting,
    /// TLS handshake in progress on the worker.
    #[cfg(feature = "tls")]
    Handshake,
    /// Established; data callbacks run.
    Stream,
}

/// Socket-side state, locked by the owning thread for a callback's duration.
pub(crate) struct ConnIo {
    pub(crate) sock: Option<TcpStream>,
    #[cfg(feature = "tls")]
    pub(crate) tls: Option<TlsSession>,
    pub(crate) phase: Phase,
    pub(crate) token: Option<Token>,
    pub(crate) interest: Option<Interest>,
}

/// A pooled connection.
pub struct Conn {
    addr: SocketAddr,
    fd: AtomicI32,
    mode: AtomicU8,
    seg_buff_size: usize,
    ready_send: AtomicBool,
    send_buffer: SegBuffer,
    recv_buffer: SegBuffer,
    #[cfg(feature = "tls")]
    peer_cert: OnceLock<CertificateDer<'static>>,
    terminal: OnceLock<Error>,
    pub(crate) io: Mutex<ConnIo>,
    pub(crate) worker: Mutex<Option<WorkerRef>>,
    self_ref: Mutex<Option<Arc<Conn>>>,
}

impl Conn {
    pub(crate) fn new(
        pool: &Arc<PoolCore>,
        mode: ConnMode,
        addr: SocketAddr,
        sock: TcpStream,
    ) -> Arc<Conn> {
        use std::os::fd::AsRawFd;
        let fd = sock.as_raw_fd();
        let phase = match mode {
            ConnMode::Active => Phase::Connecting,
            _ => Phase::Stream,
        };
        let conn = Arc::new(Conn {
            addr,
            fd: AtomicI32::new(fd),
            mode: AtomicU8::new(mode as u8),
            seg_buff_size: pool.cfg.seg_buff_size,
            ready_send: AtomicBool::new(false),
            send_buffer: SegBuffer::with_capacity(pool.cfg.queue_capacity),
            recv_buffer: SegBuffer::new(),
            #[cfg(feature = "tls")]
            peer_cert: OnceLock::new(),
            terminal: OnceLock::new(),
            io: Mutex::new(ConnIo {
                sock: Some(sock),
                #[cfg(feature = "tls")]
                tls: None,
                phase,
                token: None,
                interest: None,
            }),
            worker: Mutex::new(None),
            self_ref: Mutex::new(None),
        });
        *conn.self_ref.lock().unwrap() = Some(conn.clone());
        conn
    }

    pub fn mode(&self) -> ConnMode {
        ConnMode::from_u8(self.mode.load(Ordering::Acquire))
    }

    fn set_mode(&self, mode: ConnMode) {
        self.mode.store(mode as u8, Ordering::Release);
    }

    /// Peer address.
    pub fn peer_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Raw file descriptor; `-1` once closed.
    pub fn fd(&self) -> i32 {
        self.fd.load(Ordering::Acquire)
    }

    pub(crate) fn set_fd(&self, fd: i32) {
        self.fd.store(fd, Ordering::Release);
    }

    /// Whether the socket is known writable with a drained send buffer.
    /// A fast-path hint for the higher layer; enqueuing is always safe.
    pub fn ready_send(&self) -> bool {
        self.ready_send.load(Ordering::Relaxed)
    }

    /// Enqueue bytes for transmission. Fails with [`Error::QueueFull`] when
    /// the capacity bound would be exceeded and [`Error::ConnClosed`] on a
    /// dead connection. Segments flush in FIFO order.
    pub fn send(&self, data: impl Into<Bytes>) -> Result<(), Error> {
        if self.mode() == ConnMode::Dead {
            return Err(Error::ConnClosed);
        }
        self.send_buffer.push(data.into()).map_err(|_| Error::QueueFull)
    }

    /// Remove and return the next received segment; empty when none remain.
    pub fn pop_recv(&self) -> Bytes {
        self.recv_buffer.move_pop()
    }

    /// Bytes currently buffered on the receive side.
    pub fn recv_queued(&self) -> usize {
        self.recv_buffer.len_bytes()
    }

    /// Bytes currently buffered on the send side.
    pub fn send_queued(&self) -> usize {
        self.send_buffer.len_bytes()
    }

    pub(crate) fn send_buffer(&self) -> &SegBuffer {
        &self.send_buffer
    }

    /// The peer's certificate, populated once a TLS handshake completed.
    #[cfg(feature = "tls")]
    pub fn peer_cert(&self) -> Option<&CertificateDer<'static>> {
        self.peer_cert.get()
    }

    /// SHA-256 fingerprint of the peer's certificate DER.
    #[cfg(feature = "tls")]
    pub fn peer_fingerprint(&self) -> Option<[u8; 32]> {
        self.peer_cert.get().map(crate::tls::fingerprint)
    }

    /// Terminal status recorded before teardown, where one was meaningful
    /// (connect timeout or refusal, fatal TLS failure).
    pub fn terminal_error(&self) -> Option<&Error> {
        self.terminal.get()
    }

    pub(crate) fn set_terminal(&self, e: Error) {
        let _ = self.terminal.set(e);
    }

    /// The pinning strong self-reference; `None` once released at teardown.
    pub(crate) fn pinned(&self) -> Option<Arc<Conn>> {
        self.self_ref.lock().unwrap().clone()
    }

    pub(crate) fn release_self(&self) {
        self.self_ref.lock().unwrap().take();
    }

    fn set_interest_locked(&self, st: &mut ConnIo, core: &mut Core, interest: Interest) {
        if st.interest == Some(interest) {
            return;
        }
        if let (Some(sock), Some(tok)) = (st.sock.as_mut(), st.token)
            && core.poll.registry().reregister(sock, tok, interest).is_ok()
        {
            st.interest = Some(interest);
        }
    }

    /// Re-arm writable interest after the send buffer went non-empty.
    pub(crate) fn arm_send(&self, core: &mut Core) {
        if self.mode() == ConnMode::Dead {
            return;
        }
        let mut st = self.io.lock().unwrap();
        if st.phase != Phase::Stream {
            return;
        }
        self.set_interest_locked(&mut st, core, RW);
    }

    /// Drain the send buffer to the socket. A short write rewinds the
    /// remainder and waits for the next writable event; a would-block (or a
    /// zero-byte send) rewinds the whole segment.
    pub(crate) fn send_step(self: &Arc<Conn>, core: &mut Core, pool: &Arc<PoolCore>) {
        let mut st = self.io.lock().unwrap();
        #[cfg(feature = "tls")]
        if st.tls.is_some() {
            return self.send_step_tls(st, core, pool);
        }
        let fd = self.fd();
        loop {
            let seg = self.send_buffer.move_pop();
            if seg.is_empty() {
                break;
            }
            let size = seg.len();
            let ret =
                unsafe { libc::send(fd, seg.as_ptr() as *const libc::c_void, size, libc::MSG_NOSIGNAL) };
            debug!("socket sent {} bytes", ret);
            if ret < size as isize {
                if ret < 1 {
                    // nothing went out; restore the whole segment
                    self.send_buffer.rewind(seg);
                    if ret < 0 {
                        let e = io::Error::last_os_error();
                        if e.kind() != io::ErrorKind::WouldBlock {
                            info!("send({}) failure: {}", fd, e);
                            drop(st);
                            self.worker_terminate(core, pool);
                            return;
                        }
                    }
                } else {
                    self.send_buffer.rewind(seg.slice(ret as usize..));
                }
                self.ready_send.store(false, Ordering::Relaxed);
                return;
            }
        }
        // consumed the buffer but the endpoint still seems writable
        self.set_interest_locked(&mut st, core, Interest::READABLE);
        self.ready_send.store(true, Ordering::Relaxed);
    }

    #[cfg(feature = "tls")]
    fn send_step_tls(
        self: &Arc<Conn>,
        mut st: std::sync::MutexGuard<'_, ConnIo>,
        core: &mut Core,
        pool: &Arc<PoolCore>,
    ) {
        enum Outcome {
            Drained { pending_flush: bool },
            Blocked,
            Fatal(io::Error),
        }
        let outcome = {
            let ConnIo {
                sock: Some(sock),
                tls: Some(tls),
                ..
            } = &mut *st
            else {
                return;
            };
            let mut run = || -> Outcome {
                if let Err(e) = tls.flush(sock) {
                    return Outcome::Fatal(e);
                }
                loop {
                    let seg = self.send_buffer.move_pop();
                    if seg.is_empty() {
                        break;
                    }
                    let size = seg.len();
                    match tls.send(sock, &seg) {
                        Ok(n) => {
                            debug!("tls sent {} bytes", n);
                            if n < size {
                                self.send_buffer.rewind(seg.slice(n..));
                                return Outcome::Blocked;
                            }
                        }
                        Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                            self.send_buffer.rewind(seg);
                            return Outcome::Blocked;
                        }
                        Err(e) => return Outcome::Fatal(e),
                    }
                }
                Outcome::Drained {
                    pending_flush: tls.wants_write(),
                }
            };
            run()
        };
        match outcome {
            Outcome::Drained { pending_flush } => {
                self.ready_send.store(true, Ordering::Relaxed);
                if !pending_flush {
                    self.set_interest_locked(&mut st, core, Interest::READABLE);
                }
                // ciphertext still buffered: keep writable armed, flush next event
            }
            Outcome::Blocked => {
                self.ready_send.store(false, Ordering::Relaxed);
            }
            Outcome::Fatal(e) => {
                info!("tls send({}) failure: {}", self.fd(), e);
                drop(st);
                self.worker_terminate(core, pool);
            }
        }
    }

    /// Read into fresh segments while full segments keep coming; push each
    /// into the receive buffer and notify the higher layer.
    pub(crate) fn recv_step(self: &Arc<Conn>, core: &mut Core, pool: &Arc<PoolCore>) {
        let st = self.io.lock().unwrap();
        #[cfg(feature = "tls")]
        if st.tls.is_some() {
            return self.recv_step_tls(st, core, pool);
        }
        let fd = self.fd();
        let seg_size = self.seg_buff_size;
        let mut ret = seg_size;
        while ret == seg_size {
            let mut buf = vec![0u8; seg_size];
            let n = unsafe { libc::recv(fd, buf.as_mut_ptr() as *mut libc::c_void, seg_size, 0) };
            if n < 0 {
                let e = io::Error::last_os_error();
                if e.kind() == io::ErrorKind::WouldBlock {
                    break;
                }
                // connection error or half-open connection
                info!("recv({}) failure: {}", fd, e);
                drop(st);
                self.worker_terminate(core, pool);
                return;
            }
            if n == 0 {
                drop(st);
                self.worker_terminate(core, pool);
                return;
            }
            debug!("socket read {} bytes", n);
            buf.truncate(n as usize);
            let _ = self.recv_buffer.push(Bytes::from(buf));
            ret = n as usize;
        }
        drop(st);
        pool.handler.on_read(self);
    }

    #[cfg(feature = "tls")]
    fn recv_step_tls(
        self: &Arc<Conn>,
        mut st: std::sync::MutexGuard<'_, ConnIo>,
        core: &mut Core,
        pool: &Arc<PoolCore>,
    ) {
        enum Outcome {
            Ok { wants_write: bool },
            PeerClosed,
            Fatal(io::Error),
        }
        let seg_size = self.seg_buff_size;
        let outcome = {
            let ConnIo {
                sock: Some(sock),
                tls: Some(tls),
                ..
            } = &mut *st
            else {
                return;
            };
            let mut run = || -> Outcome {
                // Drain until WouldBlock: a short plaintext read can leave
                // ciphertext in the socket, and the edge will not re-fire
                // for bytes that were already readable.
                loop {
                    let mut buf = vec![0u8; seg_size];
                    match tls.recv(sock, &mut buf) {
                        Ok(0) => return Outcome::PeerClosed,
                        Ok(n) => {
                            debug!("tls read {} bytes", n);
                            buf.truncate(n);
                            let _ = self.recv_buffer.push(Bytes::from(buf));
                        }
                        Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                        Err(e) => return Outcome::Fatal(e),
                    }
                }
                Outcome::Ok {
                    wants_write: tls.wants_write(),
                }
            };
            run()
        };
        match outcome {
            Outcome::Ok { wants_write } => {
                if wants_write {
                    // session produced handshake bytes (tickets, key updates)
                    self.set_interest_locked(&mut st, core, RW);
                }
                drop(st);
                pool.handler.on_read(self);
            }
            Outcome::PeerClosed => {
                drop(st);
                self.worker_terminate(core, pool);
            }
            Outcome::Fatal(e) => {
                info!("tls recv({}) failure: {}", self.fd(), e);
                drop(st);
                self.worker_terminate(core, pool);
            }
        }
    }

    /// Step the TLS handshake. On completion: capture the peer certificate,
    /// switch to stream phase, signal readiness, and immediately run one
    /// send and one recv step: data already buffered inside the session
    /// would otherwise wait for an edge that never re-fires.
    #[cfg(feature = "tls")]
    pub(crate) fn tls_handshake_step(self: &Arc<Conn>, core: &mut Core, pool: &Arc<PoolCore>) {
        let mut st = self.io.lock().unwrap();
        let result = {
            let ConnIo {
                sock: Some(sock),
                tls: Some(tls),
                ..
            } = &mut *st
            else {
                return;
            };
            tls.handshake(sock)
        };
        match result {
            Ok(HandshakeStatus::Done) => {
                st.phase = Phase::Stream;
                match st.tls.as_ref().and_then(|t| t.peer_certificate()) {
                    Some(cert) => {
                        let _ = self.peer_cert.set(cert);
                    }
                    None => {
                        drop(st);
                        info!("{} completed handshake without a peer certificate", self);
                        self.set_terminal(Error::TlsGeneric("no peer certificate".into()));
                        self.worker_terminate(core, pool);
                        return;
                    }
                }
                self.set_interest_locked(&mut st, core, RW);
                drop(st);
                debug!("tls handshake complete for {}", self);
                pool.handler.on_ready(self, true);
                self.send_step(core, pool);
                if self.mode() != ConnMode::Dead {
                    self.recv_step(core, pool);
                }
            }
            Ok(HandshakeStatus::WantRead) => {
                debug!("tls handshake read");
                self.set_interest_locked(&mut st, core, Interest::READABLE);
            }
            Ok(HandshakeStatus::WantWrite) => {
                debug!("tls handshake write");
                self.set_interest_locked(&mut st, core, Interest::WRITABLE);
            }
            Err(e) => {
                drop(st);
                info!("tls handshake failure on {}: {}", self, e);
                self.set_terminal(e);
                self.worker_terminate(core, pool);
            }
        }
    }

    /// Quiesce this connection on its owning thread: deregister from the
    /// reactor, unfeed from the worker, detach the send notifier, and mark
    /// Dead. Idempotent.
    pub(crate) fn stop(&self, core: &mut Core) {
        if self.mode() == ConnMode::Dead {
            return;
        }
        {
            let mut st = self.io.lock().unwrap();
            if let Some(tok) = st.token.take() {
                if core.regs.contains(tok.0) {
                    core.regs.remove(tok.0);
                }
                if let Some(sock) = st.sock.as_mut() {
                    let _ = core.poll.registry().deregister(sock);
                }
            }
            st.interest = None;
        }
        if let Some(w) = self.worker.lock().unwrap().take() {
            w.load.fetch_sub(1, Ordering::Relaxed);
        }
        self.send_buffer.unreg_handler();
        self.set_mode(ConnMode::Dead);
    }

    /// Termination originating on the owning worker (I/O error, peer close).
    /// Stops locally, then routes destruction to the dispatcher.
    pub(crate) fn worker_terminate(self: &Arc<Conn>, core: &mut Core, pool: &Arc<PoolCore>) {
        let Some(conn) = self.pinned() else { return };
        conn.stop(core);
        if core.is_dispatcher {
            dispatcher::del_conn(core, pool, &conn);
        } else if let Some(disp) = pool.disp_ref() {
            let pool = pool.clone();
            disp.tcall
                .async_call(move |dcore| dispatcher::del_conn(dcore, &pool, &conn));
        }
    }

    /// Termination originating on the dispatcher (explicit teardown, connect
    /// failure). Synchronously quiesces the owning worker, then destroys.
    pub(crate) fn disp_terminate(self: &Arc<Conn>, core: &mut Core, pool: &Arc<PoolCore>) {
        debug_assert!(core.is_dispatcher);
        let Some(conn) = self.pinned() else { return };
        let wref = conn.worker.lock().unwrap().clone();
        match wref {
            Some(w) if !w.is_dispatcher => {
                let c = conn.clone();
                let _ = w.tcall.call(move |wcore| c.stop(wcore));
            }
            _ => conn.stop(core),
        }
        dispatcher::del_conn(core, pool, &conn);
    }
}

/// Per-event entry point for an established connection.
pub(crate) fn handle_io(
    core: &mut Core,
    pool: &Arc<PoolCore>,
    weak: Weak<Conn>,
    readable: bool,
    writable: bool,
    error: bool,
) {
    let Some(conn) = weak.upgrade() else { return };
    if conn.mode() == ConnMode::Dead {
        return;
    }
    if error {
        conn.worker_terminate(core, pool);
        return;
    }
    let phase = conn.io.lock().unwrap().phase;
    match phase {
        Phase::Connecting => {}
        #[cfg(feature = "tls")]
        Phase::Handshake => {
            if readable {
                // the handshake may drive a write step off a read event
                conn.ready_send.store(true, Ordering::Relaxed);
            }
            conn.tls_handshake_step(core, pool);
        }
        Phase::Stream => {
            if readable {
                conn.recv_step(core, pool);
            }
            if conn.mode() == ConnMode::Dead {
                return;
            }
            if writable {
                conn.send_step(core, pool);
            }
        }
    }
}

impl fmt::Display for Conn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mode = match self.mode() {
            ConnMode::Active => "active",
            ConnMode::Passive => "passive",
            ConnMode::Dead => "dead",
        };
        write!(f, "<conn fd={} addr={} mode={}>", self.fd(), self.addr, mode)
    }
}

impl fmt::Debug for Conn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}
