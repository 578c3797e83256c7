//! [`Muxer`]: a point-to-point session that can open outgoing streams (client
//! role) and accept incoming ones (server role) over a single underlying
//! byte-stream connection, with cumulative traffic accounting. [`AtomicMuxer`]
//! wraps one behind a handle whose backing session can be hot-swapped on
//! reconnection.

#[macro_use]
extern crate tracing;

mod atomic;
mod counting;
mod error;
mod yamux_session;

use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

pub use atomic::AtomicMuxer;
pub use error::MuxError;
pub use yamux_session::{dial, accept, MuxProtocol};

/// A single virtual stream within a [`Muxer`] session: full-duplex,
/// independently closable, with its own read/write deadlines left to the
/// caller (apply them with `tokio::time::timeout`).
pub trait MuxStream: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> MuxStream for T {}

pub type BoxedStream = Box<dyn MuxStream>;

/// Abstraction over a multiplexed session. Two concrete implementations are
/// expected in this family (a "smux"-style and a "yamux"-style); this crate
/// ships a yamux-backed one behind [`MuxProtocol`], selected by configuration,
/// with every consumer coded against this trait so a second backend is a
/// matter of adding another implementation, not a design change.
#[async_trait]
pub trait Muxer: Send + Sync {
    /// Opens a new outgoing stream, client role on the session. Fails with
    /// [`MuxError::Timeout`] if `deadline` elapses first, or
    /// [`MuxError::ClosedSession`] if the session is gone.
    async fn open(&self, deadline: Duration) -> Result<BoxedStream, MuxError>;

    /// Accepts the next incoming stream, server role on the session.
    async fn accept(&self) -> Result<BoxedStream, MuxError>;

    /// Idempotent. After this returns, every current/future `open`/`accept`
    /// fails with [`MuxError::ClosedSession`].
    fn close(&self);

    fn is_closed(&self) -> bool;

    fn local_addr(&self) -> SocketAddr;

    fn remote_addr(&self) -> SocketAddr;

    /// E.g. `"yamux"`. Used for traffic-audit / connection-history bookkeeping.
    fn protocol(&self) -> &'static str;

    /// Cumulative `(rx, tx)` totals, monotonically non-decreasing while the
    /// session is alive. Single-writer (this implementation), safe to read
    /// concurrently.
    fn transferred(&self) -> (u64, u64);
}
