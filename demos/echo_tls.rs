use std::sync::Arc;
use std::time::Duration;

use tidepool::{Config, Conn, ConnPool, PoolEvents, TlsContext};

/// Mutual-TLS echo between two pools in one process. Each side gets its own
/// self-signed certificate; after the handshake both report the peer's
/// certificate fingerprint.
struct Echo;

impl PoolEvents for Echo {
    fn on_read(&self, conn: &Arc<Conn>) {
        loop {
            let seg = conn.pop_recv();
            if seg.is_empty() {
                break;
            }
            let _ = conn.send(seg);
        }
    }

    fn on_ready(&self, conn: &Arc<Conn>, ready: bool) {
        if ready && let Some(fp) = conn.peer_fingerprint() {
            eprintln!("server: {conn} peer fingerprint {}", hex(&fp));
        }
    }
}

struct Client {
    done: crossbeam_channel::Sender<String>,
}

impl PoolEvents for Client {
    fn on_ready(&self, conn: &Arc<Conn>, ready: bool) {
        if !ready {
            return;
        }
        if let Some(fp) = conn.peer_fingerprint() {
            eprintln!("client: {conn} peer fingerprint {}", hex(&fp));
        }
        let _ = conn.send(&b"over tls\n"[..]);
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
}

fn self_signed() -> TlsContext {
    let ck = rcgen::generate_simple_self_signed(vec!["localhost".into(), "127.0.0.1".into()])
        .expect("cert generation");
    TlsContext::from_der(ck.cert.der().as_ref().to_vec(), ck.key_pair.serialize_der())
        .expect("tls context")
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let addr: std::net::SocketAddr = "127.0.0.1:7879".parse().unwrap();

    let mut server_cfg = Config::default();
    server_cfg.tls = Some(self_signed());
    let server = ConnPool::new(server_cfg, Echo);
    server.listen(addr).expect("listen failed");

    let (done_tx, done_rx) = crossbeam_channel::bounded(1);
    let mut client_cfg = Config::default();
    client_cfg.tls = Some(self_signed());
    let client = ConnPool::new(client_cfg, Client { done: done_tx });
    let conn = client.connect(addr).expect("connect failed");

    match done_rx.recv_timeout(Duration::from_secs(5)) {
        Ok(echoed) => eprintln!("echoed back: {}", echoed.trim()),
        Err(_) => eprintln!("no echo within 5s"),
    }

    client.terminate(&conn);
    client.shutdown();
    server.shutdown();
}
