use std::io;

/// Errors surfaced at the pool boundary.
///
/// Setup failures (`Accept`, `Listen`, `Connect`) carry the originating
/// errno as their `io::Error` source. Per-connection I/O failures are never
/// returned from pool calls; they become terminations observable through
/// [`PoolEvents::on_teardown`](crate::handler::PoolEvents::on_teardown) and
/// [`Conn::terminal_error`](crate::conn::Conn::terminal_error).
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("accept failed: {0}")]
    Accept(#[source] io::Error),
    #[error("listen failed: {0}")]
    Listen(#[source] io::Error),
    #[error("connect failed: {0}")]
    Connect(#[source] io::Error),
    #[error("failed to load certificate into TLS context: {0}")]
    TlsLoadCert(String),
    #[error("failed to load private key into TLS context: {0}")]
    TlsLoadKey(String),
    #[error("invalid private key material: {0}")]
    TlsKey(String),
    #[error("invalid X.509 material: {0}")]
    TlsX509(String),
    #[error("tls failure: {0}")]
    TlsGeneric(String),
    #[error("send queue full")]
    QueueFull,
    #[error("connection is closed")]
    ConnClosed,
    #[error("pool is shut down")]
    PoolClosed,
}

/// Flat error classification, independent of payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Accept,
    Listen,
    Connect,
    TlsLoadCert,
    TlsLoadKey,
    TlsKey,
    TlsX509,
    TlsGeneric,
    QueueFull,
    ConnClosed,
    PoolClosed,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Accept(_) => ErrorKind::Accept,
            Error::Listen(_) => ErrorKind::Listen,
            Error::Connect(_) => ErrorKind::Connect,
            Error::TlsLoadCert(_) => ErrorKind::TlsLoadCert,
            Error::TlsLoadKey(_) => ErrorKind::TlsLoadKey,
            Error::TlsKey(_) => ErrorKind::TlsKey,
            Error::TlsX509(_) => ErrorKind::TlsX509,
            Error::TlsGeneric(_) => ErrorKind::TlsGeneric,
            Error::QueueFull => ErrorKind::QueueFull,
            Error::ConnClosed => ErrorKind::ConnClosed,
            Error::PoolClosed => ErrorKind::PoolClosed,
        }
    }
}
