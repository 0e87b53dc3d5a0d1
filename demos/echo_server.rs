use std::sync::Arc;

use tidepool::{Config, Conn, ConnPool, PoolEvents};

/// Echoes every received segment back to the sender.
struct EchoHandler;

impl PoolEvents for EchoHandler {
    fn on_setup(&self, conn: &Arc<Conn>) {
        eprintln!("connection up: {conn}");
    }

    fn on_read(&self, conn: &Arc<Conn>) {
        loop {
            let seg = conn.pop_recv();
            if seg.is_empty() {
                break;
            }
            if let Err(e) = conn.send(seg) {
                eprintln!("echo send error on {conn}: {e}");
                break;
            }
        }
    }

    fn on_teardown(&self, conn: &Arc<Conn>) {
        eprintln!("connection down: {conn}");
    }
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let bind_addr = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "127.0.0.1:7878".to_string());

    let mut config = Config::default();
    config.num_workers = 2;

    let pool = ConnPool::new(config, EchoHandler);
    pool.listen(bind_addr.parse().expect("invalid bind address"))
        .expect("failed to listen");

    eprintln!("echo server listening on {bind_addr}");
    eprintln!("test with: nc {}", bind_addr.replace(':', " "));

    loop {
        std::thread::park();
    }
}
