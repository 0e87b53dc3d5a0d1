use std::sync::Arc;
use std::time::Duration;

use tidepool::{Config, Conn, ConnPool, PoolEvents};

/// Connects to an echo server, sends one line, prints the echoed response.
struct ConnectHandler {
    done: crossbeam_channel::Sender<String>,
}

impl PoolEvents for ConnectHandler {
    fn on_setup(&self, conn: &Arc<Conn>) {
        eprintln!("connected: {conn}");
        if let Err(e) = conn.send(&b"Hello from tidepool!\n"[..]) {
            eprintln!("send error: {e}");
        }
    }

    fn on_read(&self, conn: &Arc<Conn>) {
        let mut text = Vec::new();
        loop {
            let seg = conn.pop_recv();
            if seg.is_empty() {
                break;
            }
            text.extend_from_slice(&seg);
        }
        let _ = self.done.send(String::from_utf8_lossy(&text).into_owned());
    }

    fn on_teardown(&self, conn: &Arc<Conn>) {
        eprintln!("closed: {conn}");
    }
}

fn main() {
    // Needs a running echo server, e.g.:  cargo run --example echo_server
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let target = std::env::var("TARGET").unwrap_or_else(|_| "127.0.0.1:7878".to_string());
    let (done_tx, done_rx) = crossbeam_channel::bounded(1);

    let pool = ConnPool::new(Config::default(), ConnectHandler { done: done_tx });
    let conn = pool
        .connect(target.parse().expect("invalid TARGET address"))
        .expect("connect failed");

    match done_rx.recv_timeout(Duration::from_secs(5)) {
        Ok(echoed) => eprintln!("received: {}", echoed.trim()),
        Err(_) => eprintln!("no echo within 5s"),
    }

    pool.terminate(&conn);
    pool.shutdown();
}
