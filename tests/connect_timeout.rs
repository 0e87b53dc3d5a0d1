//! Asynchronous connect failures: deadline expiry and refusal both end in
//! a teardown carrying a `Connect` terminal status.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender};
use tidepool::{Config, Conn, ConnMode, ConnPool, ErrorKind, PoolEvents};

struct Watcher {
    setups: AtomicUsize,
    teardowns: AtomicUsize,
    events: Sender<()>,
}

impl Watcher {
    fn new() -> (Arc<Watcher>, Receiver<()>) {
        let (tx, rx) = crossbeam_channel::unbounded();
        (
            Arc::new(Watcher {
                setups: AtomicUsize::new(0),
                teardowns: AtomicUsize::new(0),
                events: tx,
            }),
            rx,
        )
    }
}

struct Handler {
    st: Arc<Watcher>,
}

impl PoolEvents for Handler {
    fn on_setup(&self, _conn: &Arc<Conn>) {
        self.st.setups.fetch_add(1, Ordering::SeqCst);
        let _ = self.st.events.send(());
    }

    fn on_teardown(&self, _conn: &Arc<Conn>) {
        self.st.teardowns.fetch_add(1, Ordering::SeqCst);
        let _ = self.st.events.send(());
    }
}

fn wait_for(rx: &Receiver<()>, timeout: Duration, pred: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if pred() {
            return true;
        }
        let _ = rx.recv_timeout(Duration::from_millis(50));
    }
    pred()
}

#[test]
fn connect_deadline_expires_into_teardown() {
    let (st, rx) = Watcher::new();
    let mut cfg = Config::default();
    cfg.conn_server_timeout = Duration::from_millis(500);
    let pool = ConnPool::new(cfg, Handler { st: st.clone() });

    // RFC 5737 TEST-NET-1: never routable, so the SYN goes unanswered
    let conn = match pool.connect("192.0.2.1:1".parse().unwrap()) {
        Ok(conn) => conn,
        Err(e) => {
            // some sandboxes reject the route synchronously; still Connect
            assert_eq!(e.kind(), ErrorKind::Connect);
            return;
        }
    };

    assert!(
        wait_for(&rx, Duration::from_secs(5), || {
            st.teardowns.load(Ordering::SeqCst) == 1
        }),
        "no teardown after deadline"
    );
    assert_eq!(conn.mode(), ConnMode::Dead);
    assert_eq!(conn.fd(), -1);
    assert_eq!(
        conn.terminal_error().map(|e| e.kind()),
        Some(ErrorKind::Connect)
    );
    // the attempt never completed, so no setup was observed
    assert_eq!(st.setups.load(Ordering::SeqCst), 0);
    assert_eq!(pool.stats().connections, 0);

    pool.shutdown();
}

#[test]
fn connect_refused_ends_in_teardown() {
    // bind then drop to find a port that actively refuses
    let port = {
        let l = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        l.local_addr().unwrap().port()
    };

    let (st, rx) = Watcher::new();
    let pool = ConnPool::new(Config::default(), Handler { st: st.clone() });

    let conn = match pool.connect(format!("127.0.0.1:{port}").parse().unwrap()) {
        Ok(conn) => conn,
        Err(e) => {
            assert_eq!(e.kind(), ErrorKind::Connect);
            return;
        }
    };

    assert!(
        wait_for(&rx, Duration::from_secs(5), || {
            st.teardowns.load(Ordering::SeqCst) == 1
        }),
        "refused connect produced no teardown"
    );
    assert_eq!(conn.mode(), ConnMode::Dead);
    assert_eq!(
        conn.terminal_error().map(|e| e.kind()),
        Some(ErrorKind::Connect)
    );

    pool.shutdown();
}

#[test]
fn ipv6_targets_are_rejected() {
    let (st, _rx) = Watcher::new();
    let pool = ConnPool::new(Config::default(), Handler { st });

    let err = pool.listen("[::1]:0".parse().unwrap()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Listen);

    let err = pool.connect("[::1]:1".parse().unwrap()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Connect);

    pool.shutdown();
}
