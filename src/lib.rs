pub mod buffer;
pub mod config;
pub mod conn;
pub mod dispatcher;
pub mod error;
pub mod handler;
pub mod hash;
pub mod pool;
#[cfg(feature = "tls")]
pub mod tls;
pub mod worker;

// Public API re-exports
pub use buffer::SegBuffer;
pub use config::Config;
pub use conn::{Conn, ConnMode};
pub use error::{Error, ErrorKind};
pub use handler::PoolEvents;
pub use pool::{ConnPool, PoolStats};
#[cfg(feature = "tls")]
pub use tls::{HandshakeStatus, TlsContext};
