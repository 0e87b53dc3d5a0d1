use std::time::Duration;

#[cfg(feature = "tls")]
use crate::tls::TlsContext;

/// Configuration for a connection pool.
#[derive(Clone)]
pub struct Config {
    /// Maximum bytes buffered in a connection's send queue. Enqueues beyond
    /// this bound fail with `QueueFull`. 0 = unbounded.
    pub queue_capacity: usize,
    /// Preferred read/write segment size in bytes.
    pub seg_buff_size: usize,
    /// TCP listen backlog.
    pub max_listen_backlog: i32,
    /// Deadline for an outbound TCP connect to complete.
    pub conn_server_timeout: Duration,
    /// Number of I/O worker threads. 0 = the dispatcher thread services
    /// connection I/O itself (single-threaded cooperative mode).
    pub num_workers: usize,
    /// Optional TLS context. When set, every new connection (accepted and
    /// outbound) is wrapped in a TLS session.
    #[cfg(feature = "tls")]
    pub tls: Option<TlsContext>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            queue_capacity: 1 << 20,
            seg_buff_size: 4096,
            max_listen_backlog: 1024,
            conn_server_timeout: Duration::from_secs(2),
            num_workers: 1,
            #[cfg(feature = "tls")]
            tls: None,
        }
    }
}
