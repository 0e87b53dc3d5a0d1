use std::sync::Arc;

use crate::conn::Conn;

/// Hooks through which the higher layer observes the pool.
///
/// Callbacks fire on pool threads (`on_setup`/`on_teardown` on the
/// dispatcher, `on_read`/`on_ready` on the owning worker) and must not
/// block. Implementations use interior mutability for any state they keep.
/// The synchronous pool operations (`listen`, `connect`, `terminate`,
/// `stats`) wait on the dispatcher and must not be called from inside a
/// callback; use [`ConnPool::terminate_async`] there and defer anything
/// else to another thread.
///
/// [`ConnPool::terminate_async`]: crate::pool::ConnPool::terminate_async
pub trait PoolEvents: Send + Sync + 'static {
    /// A connection was accepted or completed its TCP connect and is about
    /// to be handed to a worker.
    fn on_setup(&self, conn: &Arc<Conn>) {
        let _ = conn;
    }

    /// Bytes were appended to the connection's receive buffer; drain it with
    /// [`Conn::pop_recv`](crate::conn::Conn::pop_recv).
    fn on_read(&self, conn: &Arc<Conn>) {
        let _ = conn;
    }

    /// The connection is being destroyed. Fires exactly once per registered
    /// connection; inspect [`Conn::terminal_error`](crate::conn::Conn::terminal_error)
    /// for the cause where one was recorded.
    fn on_teardown(&self, conn: &Arc<Conn>) {
        let _ = conn;
    }

    /// Readiness signal: `true` once the connection can carry application
    /// data (for TLS, after the handshake; for plaintext, at feed time),
    /// `false` at teardown.
    fn on_ready(&self, conn: &Arc<Conn>, ready: bool) {
        let _ = (conn, ready);
    }
}
