//! Dispatcher-side operations: the listen socket, outbound connect attempts
//! with their completion probes and deadlines, the fd→connection registry,
//! and connection destruction. Only the dispatcher thread touches any of
//! this; `del_conn` is the single place a connection fd is closed.

use std::io;
use std::net::SocketAddr;
use std::os::fd::RawFd;
use std::sync::{Arc, Weak};
use std::time::Instant;

use ahash::AHashMap;
use mio::net::{TcpListener, TcpStream};
use mio::{Interest, Token};
use socket2::{Domain, Protocol, Socket, Type};
use tracing::{error, info};

use crate::conn::{Conn, ConnMode, Phase};
use crate::error::Error;
use crate::pool::PoolCore;
use crate::worker::{self, Core, Registration, TimerSlot};

/// State owned exclusively by the dispatcher thread.
pub(crate) struct DispState {
    listener: Option<TcpListener>,
    listener_token: Option<Token>,
    pub(crate) by_fd: AHashMap<RawFd, Arc<Conn>>,
}

impl DispState {
    pub(crate) fn new() -> DispState {
        DispState {
            listener: None,
            listener_token: None,
            by_fd: AHashMap::new(),
        }
    }

    pub(crate) fn listen_addr(&self) -> Option<SocketAddr> {
        self.listener.as_ref().and_then(|l| l.local_addr().ok())
    }
}

fn ipv4_socket() -> io::Result<Socket> {
    Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))
}

/// Bind and listen. A repeated call resets the previous listener.
pub(crate) fn listen_inner(
    core: &mut Core,
    pool: &Arc<PoolCore>,
    addr: SocketAddr,
) -> Result<(), Error> {
    if !addr.is_ipv4() {
        return Err(Error::Listen(io::Error::from_raw_os_error(
            libc::EAFNOSUPPORT,
        )));
    }

    // reset the previous listen()
    if let Some(disp) = core.disp.as_mut()
        && let Some(mut old) = disp.listener.take()
    {
        let _ = core.poll.registry().deregister(&mut old);
        if let Some(tok) = disp.listener_token.take()
            && core.regs.contains(tok.0)
        {
            core.regs.remove(tok.0);
        }
    }

    let sock = ipv4_socket().map_err(Error::Listen)?;
    sock.set_reuse_address(true).map_err(Error::Listen)?;
    sock.set_nonblocking(true).map_err(Error::Listen)?;
    sock.bind(&addr.into()).map_err(Error::Listen)?;
    sock.listen(pool.cfg.max_listen_backlog).map_err(Error::Listen)?;

    let mut listener = TcpListener::from_std(sock.into());
    let token = Token(core.regs.insert(Registration::Listener));
    if let Err(e) = core
        .poll
        .registry()
        .register(&mut listener, token, Interest::READABLE)
    {
        core.regs.remove(token.0);
        return Err(Error::Listen(e));
    }

    let disp = core.disp.as_mut().expect("listen on dispatcher");
    disp.listener = Some(listener);
    disp.listener_token = Some(token);
    info!("listening on {}", addr);
    Ok(())
}

/// Stop accepting: deregister and drop the listen socket, if any.
pub(crate) fn close_listener(core: &mut Core) {
    let Some(disp) = core.disp.as_mut() else { return };
    if let Some(mut old) = disp.listener.take() {
        let _ = core.poll.registry().deregister(&mut old);
        if let Some(tok) = disp.listener_token.take()
            && core.regs.contains(tok.0)
        {
            core.regs.remove(tok.0);
        }
    }
}

/// Accept everything pending. An isolated accept failure is logged and does
/// not tear down the listen socket.
pub(crate) fn accept_ready(core: &mut Core, pool: &Arc<PoolCore>) {
    loop {
        let accepted = {
            let Some(listener) = core.disp.as_ref().and_then(|d| d.listener.as_ref()) else {
                return;
            };
            listener.accept()
        };
        match accepted {
            Ok((stream, addr)) => {
                if let Err(e) = stream.set_nodelay(true) {
                    error!("{}", Error::Accept(e));
                    continue;
                }
                let conn = Conn::new(pool, ConnMode::Passive, addr, stream);
                core.disp
                    .as_mut()
                    .expect("accept on dispatcher")
                    .by_fd
                    .insert(conn.fd(), conn.clone());
                info!("accepted {}", conn);
                let w = pool.select_worker();
                pool.handler.on_setup(&conn);
                worker::feed(pool, &conn, &w);
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
            Err(e) => {
                let fd_invalid = matches!(
                    e.raw_os_error(),
                    Some(libc::EBADF) | Some(libc::EINVAL) | Some(libc::ENOTSOCK)
                );
                error!("{}", Error::Accept(e));
                if fd_invalid {
                    // a broken listen fd would re-fire error readiness on
                    // every poll; only closing it breaks the cycle
                    close_listener(core);
                }
                break;
            }
        }
    }
}

/// Start a non-blocking connect. Setup failures surface synchronously;
/// completion (or failure) is decided later by the probe or the deadline.
pub(crate) fn connect_inner(
    core: &mut Core,
    pool: &Arc<PoolCore>,
    addr: SocketAddr,
) -> Result<Arc<Conn>, Error> {
    if !addr.is_ipv4() {
        return Err(Error::Connect(io::Error::from_raw_os_error(
            libc::EAFNOSUPPORT,
        )));
    }
    let sock = ipv4_socket().map_err(Error::Connect)?;
    sock.set_nodelay(true).map_err(Error::Connect)?;
    sock.set_nonblocking(true).map_err(Error::Connect)?;
    match sock.connect(&addr.into()) {
        Ok(()) => {}
        Err(e)
            if e.raw_os_error() == Some(libc::EINPROGRESS)
                || e.kind() == io::ErrorKind::WouldBlock => {}
        Err(e) => {
            info!("cannot connect to {}: {}", addr, e);
            return Err(Error::Connect(e));
        }
    }

    let stream = TcpStream::from_std(sock.into());
    let conn = Conn::new(pool, ConnMode::Active, addr, stream);
    {
        let mut st = conn.io.lock().unwrap();
        let entry = core.regs.vacant_entry();
        let token = Token(entry.key());
        let sock = st.sock.as_mut().expect("fresh connection has a socket");
        match core
            .poll
            .registry()
            .register(sock, token, Interest::WRITABLE)
        {
            Ok(()) => {
                entry.insert(Registration::Connect(Arc::downgrade(&conn)));
                st.token = Some(token);
                st.interest = Some(Interest::WRITABLE);
            }
            Err(e) => {
                st.sock.take();
                drop(st);
                conn.release_self();
                return Err(Error::Connect(e));
            }
        }
    }
    core.timers.push(TimerSlot {
        deadline: Instant::now() + pool.cfg.conn_server_timeout,
        conn: Arc::downgrade(&conn),
    });
    core.disp
        .as_mut()
        .expect("connect on dispatcher")
        .by_fd
        .insert(conn.fd(), conn.clone());
    info!("created {}", conn);
    Ok(conn)
}

/// The connect-attempt event fired: validate with a zero-byte
/// `send(MSG_NOSIGNAL)` probe. Success hands the connection to a worker;
/// anything else tears it down.
pub(crate) fn connect_probe(core: &mut Core, pool: &Arc<PoolCore>, weak: Weak<Conn>) {
    let Some(conn) = weak.upgrade() else { return };
    if conn.pinned().is_none() || conn.mode() == ConnMode::Dead {
        return;
    }
    let fd = conn.fd();
    let probed = unsafe { libc::send(fd, std::ptr::null(), 0, libc::MSG_NOSIGNAL) };
    if probed == 0 {
        {
            let mut st = conn.io.lock().unwrap();
            if let Some(tok) = st.token.take() {
                if core.regs.contains(tok.0) {
                    core.regs.remove(tok.0);
                }
                if let Some(sock) = st.sock.as_mut() {
                    let _ = core.poll.registry().deregister(sock);
                }
            }
            st.interest = None;
            // leave Connecting before the deadline check can see us again
            st.phase = Phase::Stream;
        }
        info!("connected to remote {}", conn);
        let w = pool.select_worker();
        pool.handler.on_setup(&conn);
        worker::feed(pool, &conn, &w);
    } else {
        let e = io::Error::last_os_error();
        info!("connect to {} failed: {}", conn.peer_addr(), e);
        conn.set_terminal(Error::Connect(e));
        conn.disp_terminate(core, pool);
    }
}

/// A connect deadline fired. Stale entries (probe already succeeded, or the
/// connection is gone) are ignored.
pub(crate) fn connect_timeout(core: &mut Core, pool: &Arc<PoolCore>, weak: Weak<Conn>) {
    let Some(conn) = weak.upgrade() else { return };
    if conn.mode() == ConnMode::Dead {
        return;
    }
    if conn.io.lock().unwrap().phase != Phase::Connecting {
        return;
    }
    info!("{} connect timeout", conn);
    conn.set_terminal(Error::Connect(io::Error::from_raw_os_error(
        libc::ETIMEDOUT,
    )));
    conn.disp_terminate(core, pool);
}

/// Destroy a connection: remove it from the registry, notify the higher
/// layer, break the self-cycle, close the fd. Keyed by fd, so a second call
/// after the fd was cleared is a no-op; terminations from both sides
/// reconcile here.
pub(crate) fn del_conn(core: &mut Core, pool: &Arc<PoolCore>, conn: &Arc<Conn>) {
    let fd = conn.fd();
    if fd < 0 {
        return;
    }
    let Some(disp) = core.disp.as_mut() else { return };
    let Some(found) = disp.by_fd.remove(&fd) else {
        return;
    };
    debug_assert!(Arc::ptr_eq(&found, conn));
    info!("terminated {}", found);
    pool.handler.on_teardown(&found);
    pool.handler.on_ready(&found, false);
    found.release_self();
    let sock = found.io.lock().unwrap().sock.take();
    drop(sock); // closes the fd
    found.set_fd(-1);
}
