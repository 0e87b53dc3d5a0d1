//! End-to-end plaintext scenarios: echo, ordered bulk delivery across
//! partial writes, backpressure at the queue bound, and termination
//! semantics.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};
use std::time::{Duration, Instant};

use bytes::Bytes;
use crossbeam_channel::{Receiver, Sender};
use tidepool::{Config, Conn, ConnPool, PoolEvents};

struct State {
    setups: AtomicUsize,
    teardowns: AtomicUsize,
    torn_down: AtomicBool,
    read_after_teardown: AtomicBool,
    data: Mutex<Vec<u8>>,
    events: Sender<()>,
}

impl State {
    fn new() -> (Arc<State>, Receiver<()>) {
        let (tx, rx) = crossbeam_channel::unbounded();
        (
            Arc::new(State {
                setups: AtomicUsize::new(0),
                teardowns: AtomicUsize::new(0),
                torn_down: AtomicBool::new(false),
                read_after_teardown: AtomicBool::new(false),
                data: Mutex::new(Vec::new()),
                events: tx,
            }),
            rx,
        )
    }

    fn note_setup(&self) {
        self.setups.fetch_add(1, Ordering::SeqCst);
        let _ = self.events.send(());
    }

    fn note_teardown(&self) {
        self.teardowns.fetch_add(1, Ordering::SeqCst);
        self.torn_down.store(true, Ordering::SeqCst);
        let _ = self.events.send(());
    }
}

/// Wait for `pred` to become true, nudged along by handler events.
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

/// Echoes everything back.
struct Echo {
    st: Arc<State>,
}

impl PoolEvents for Echo {
    fn on_setup(&self, _conn: &Arc<Conn>) {
        self.st.note_setup();
    }

    fn on_read(&self, conn: &Arc<Conn>) {
        loop {
            let seg = conn.pop_recv();
            if seg.is_empty() {
                break;
            }
            let _ = conn.send(seg);
        }
    }

    fn on_teardown(&self, _conn: &Arc<Conn>) {
        self.st.note_teardown();
    }
}

/// Accumulates received bytes.
struct Collector {
    st: Arc<State>,
}

impl PoolEvents for Collector {
    fn on_setup(&self, _conn: &Arc<Conn>) {
        self.st.note_setup();
    }

    fn on_read(&self, conn: &Arc<Conn>) {
        if self.st.torn_down.load(Ordering::SeqCst) {
            self.st.read_after_teardown.store(true, Ordering::SeqCst);
        }
        loop {
            let seg = conn.pop_recv();
            if seg.is_empty() {
                break;
            }
            self.st.data.lock().unwrap().extend_from_slice(&seg);
        }
        let _ = self.st.events.send(());
    }

    fn on_teardown(&self, _conn: &Arc<Conn>) {
        self.st.note_teardown();
    }
}

#[test]
fn echo_roundtrip_with_small_segments() {
    let (server_st, server_rx) = State::new();
    let (client_st, client_rx) = State::new();

    let mut server_cfg = Config::default();
    server_cfg.seg_buff_size = 4; // force the recv loop to iterate
    let server = ConnPool::new(server_cfg, Echo { st: server_st.clone() });
    server.listen("127.0.0.1:0".parse().unwrap()).unwrap();
    let addr = server.listen_addr().unwrap();

    let client = ConnPool::new(Config::default(), Collector { st: client_st.clone() });
    let conn = client.connect(addr).unwrap();
    conn.send(&b"hello"[..]).unwrap();

    assert!(
        wait_for(&client_rx, Duration::from_secs(5), || {
            client_st.data.lock().unwrap().as_slice() == b"hello"
        }),
        "echo did not arrive: got {:?}",
        client_st.data.lock().unwrap()
    );

    client.terminate(&conn);
    assert!(wait_for(&client_rx, Duration::from_secs(5), || {
        client_st.teardowns.load(Ordering::SeqCst) == 1
    }));
    // the peer observes the close
    assert!(wait_for(&server_rx, Duration::from_secs(5), || {
        server_st.teardowns.load(Ordering::SeqCst) == 1
    }));

    client.shutdown();
    server.shutdown();

    assert_eq!(
        client_st.setups.load(Ordering::SeqCst),
        client_st.teardowns.load(Ordering::SeqCst)
    );
    assert_eq!(
        server_st.setups.load(Ordering::SeqCst),
        server_st.teardowns.load(Ordering::SeqCst)
    );
    assert_eq!(conn.fd(), -1);
}

#[test]
fn bulk_one_byte_segments_arrive_in_order() {
    let (server_st, server_rx) = State::new();
    let (client_st, _client_rx) = State::new();

    let server = ConnPool::new(Config::default(), Collector { st: server_st.clone() });
    server.listen("127.0.0.1:0".parse().unwrap()).unwrap();
    let addr = server.listen_addr().unwrap();

    let client = ConnPool::new(Config::default(), Echo { st: client_st.clone() });
    let conn = client.connect(addr).unwrap();

    let payload: Vec<u8> = (0..100_000usize).map(|i| (i % 251) as u8).collect();
    for &b in &payload {
        loop {
            match conn.send(Bytes::copy_from_slice(&[b])) {
                Ok(()) => break,
                Err(tidepool::Error::QueueFull) => std::thread::sleep(Duration::from_millis(1)),
                Err(e) => panic!("send failed: {e}"),
            }
        }
    }

    assert!(
        wait_for(&server_rx, Duration::from_secs(30), || {
            server_st.data.lock().unwrap().len() == payload.len()
        }),
        "received {} of {} bytes",
        server_st.data.lock().unwrap().len(),
        payload.len()
    );
    assert_eq!(*server_st.data.lock().unwrap(), payload);

    client.shutdown();
    server.shutdown();
}

/// Blocks its worker inside `on_read` until released, so enqueues are
/// guaranteed to race ahead of the drain.
struct Blocker {
    entered: Sender<()>,
    gate: Receiver<()>,
}

impl PoolEvents for Blocker {
    fn on_read(&self, conn: &Arc<Conn>) {
        let _ = conn.pop_recv();
        let _ = self.entered.send(());
        let _ = self.gate.recv_timeout(Duration::from_secs(10));
    }
}

#[test]
fn send_queue_enforces_capacity() {
    use std::io::Write;

    let (entered_tx, entered_rx) = crossbeam_channel::unbounded();
    let (gate_tx, gate_rx) = crossbeam_channel::unbounded();

    let peer = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = peer.local_addr().unwrap();

    let mut cfg = Config::default();
    cfg.queue_capacity = 1024;
    let pool = ConnPool::new(
        cfg,
        Blocker {
            entered: entered_tx,
            gate: gate_rx,
        },
    );
    let conn = pool.connect(addr).unwrap();

    // stall the worker inside on_read
    let (mut peer_stream, _) = peer.accept().unwrap();
    peer_stream.write_all(b"x").unwrap();
    entered_rx
        .recv_timeout(Duration::from_secs(5))
        .expect("worker entered on_read");

    // the bound holds while nothing drains
    conn.send(Bytes::from(vec![0u8; 1024])).unwrap();
    assert!(matches!(
        conn.send(&b"y"[..]),
        Err(tidepool::Error::QueueFull)
    ));
    assert!(conn.send_queued() <= 1024);

    // a single segment larger than the bound never fits
    assert!(matches!(
        conn.send(Bytes::from(vec![0u8; 2048])),
        Err(tidepool::Error::QueueFull)
    ));

    drop(gate_tx); // release the worker
    pool.terminate(&conn);
    pool.shutdown();
}

/// Terminates its own connection from inside `on_read`.
struct SelfTerminator {
    st: Arc<State>,
    pool: Arc<OnceLock<Weak<ConnPool>>>,
}

impl PoolEvents for SelfTerminator {
    fn on_setup(&self, _conn: &Arc<Conn>) {
        self.st.note_setup();
    }

    fn on_read(&self, conn: &Arc<Conn>) {
        if self.st.torn_down.load(Ordering::SeqCst) {
            self.st.read_after_teardown.store(true, Ordering::SeqCst);
        }
        let _ = conn.pop_recv();
        if let Some(pool) = self.pool.get().and_then(Weak::upgrade) {
            // racing duplicate teardown requests must collapse into one
            pool.terminate_async(conn);
            pool.terminate_async(conn);
        }
        let _ = self.st.events.send(());
    }

    fn on_teardown(&self, _conn: &Arc<Conn>) {
        self.st.note_teardown();
    }
}

#[test]
fn duplicate_terminations_fire_one_teardown() {
    let (server_st, _server_rx) = State::new();
    let (client_st, client_rx) = State::new();

    let server = ConnPool::new(Config::default(), Echo { st: server_st.clone() });
    server.listen("127.0.0.1:0".parse().unwrap()).unwrap();
    let addr = server.listen_addr().unwrap();

    let pool_slot = Arc::new(OnceLock::new());
    let client = Arc::new(ConnPool::new(
        Config::default(),
        SelfTerminator {
            st: client_st.clone(),
            pool: pool_slot.clone(),
        },
    ));
    let _ = pool_slot.set(Arc::downgrade(&client));

    let conn = client.connect(addr).unwrap();
    assert!(wait_for(&client_rx, Duration::from_secs(5), || {
        client.stats().connections == 1
    }));

    conn.send(&b"ping"[..]).unwrap();
    // the echo triggers on_read, which issues two async terminations;
    // pile a dispatcher-side one on top
    assert!(wait_for(&client_rx, Duration::from_secs(5), || {
        client_st.torn_down.load(Ordering::SeqCst)
    }));
    client.terminate(&conn);

    std::thread::sleep(Duration::from_millis(200));
    assert_eq!(client_st.teardowns.load(Ordering::SeqCst), 1);
    assert_eq!(conn.mode(), tidepool::ConnMode::Dead);
    assert_eq!(conn.fd(), -1);
    assert_eq!(client.stats().connections, 0);
    assert!(!client_st.read_after_teardown.load(Ordering::SeqCst));

    client.shutdown();
    server.shutdown();
}
