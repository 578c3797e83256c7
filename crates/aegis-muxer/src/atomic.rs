use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::error::MuxError;
use crate::{BoxedStream, Muxer};

/// A [`Muxer`] facade whose backing session can be hot-swapped on reconnect
/// while every consumer keeps holding the same handle.
///
/// Reads ([`AtomicMuxer::load`], and every `Muxer` method below) never see a
/// torn state: a call either observes the pre-swap session or the post-swap
/// one in full. Calls already in flight against the pre-swap session may fail
/// with [`MuxError::ClosedSession`] once it is torn down; callers retry by
/// issuing a fresh call, which picks up the new session automatically.
pub struct AtomicMuxer {
    current: RwLock<Arc<dyn Muxer>>,
}

impl AtomicMuxer {
    #[must_use]
    pub fn new(initial: Arc<dyn Muxer>) -> Self {
        Self {
            current: RwLock::new(initial),
        }
    }

    /// Returns the currently active session.
    #[must_use]
    pub fn load(&self) -> Arc<dyn Muxer> {
        Arc::clone(&self.current.read())
    }

    /// Atomically installs `new` as the active session and returns the one it
    /// replaced. Exactly-once: concurrent swaps serialize on the write lock.
    pub fn swap(&self, new: Arc<dyn Muxer>) -> Arc<dyn Muxer> {
        let mut guard = self.current.write();
        std::mem::replace(&mut *guard, new)
    }
}

#[async_trait]
impl Muxer for AtomicMuxer {
    async fn open(&self, deadline: Duration) -> Result<BoxedStream, MuxError> {
        self.load().open(deadline).await
    }

    async fn accept(&self) -> Result<BoxedStream, MuxError> {
        self.load().accept().await
    }

    fn close(&self) {
        self.load().close();
    }

    fn is_closed(&self) -> bool {
        self.load().is_closed()
    }

    fn local_addr(&self) -> SocketAddr {
        self.load().local_addr()
    }

    fn remote_addr(&self) -> SocketAddr {
        self.load().remote_addr()
    }

    fn protocol(&self) -> &'static str {
        self.load().protocol()
    }

    fn transferred(&self) -> (u64, u64) {
        self.load().transferred()
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Barrier;

    /// A trivial in-memory `Muxer` for exercising swap semantics without a
    /// real transport.
    struct FakeMuxer {
        tag: &'static str,
        opens: AtomicUsize,
    }

    #[async_trait]
    impl Muxer for FakeMuxer {
        async fn open(&self, _deadline: Duration) -> Result<BoxedStream, MuxError> {
            self.opens.fetch_add(1, Ordering::SeqCst);
            let (a, _b) = tokio::io::duplex(8);
            Ok(Box::new(a))
        }

        async fn accept(&self) -> Result<BoxedStream, MuxError> {
            Err(MuxError::ClosedSession)
        }

        fn close(&self) {}

        fn is_closed(&self) -> bool {
            false
        }

        fn local_addr(&self) -> SocketAddr {
            "127.0.0.1:0".parse().unwrap()
        }

        fn remote_addr(&self) -> SocketAddr {
            "127.0.0.1:0".parse().unwrap()
        }

        fn protocol(&self) -> &'static str {
            self.tag
        }

        fn transferred(&self) -> (u64, u64) {
            (0, 0)
        }
    }

    #[tokio::test]
    async fn swap_is_observed_by_subsequent_calls() {
        let first: Arc<dyn Muxer> = Arc::new(FakeMuxer {
            tag: "first",
            opens: AtomicUsize::new(0),
        });
        let second: Arc<dyn Muxer> = Arc::new(FakeMuxer {
            tag: "second",
            opens: AtomicUsize::new(0),
        });

        let atomic = AtomicMuxer::new(first);
        assert_eq!(atomic.protocol(), "first");

        atomic.swap(second);
        assert_eq!(atomic.protocol(), "second");
    }

    #[tokio::test]
    async fn concurrent_opens_never_observe_a_torn_state() {
        let first: Arc<dyn Muxer> = Arc::new(FakeMuxer {
            tag: "first",
            opens: AtomicUsize::new(0),
        });
        let atomic = Arc::new(AtomicMuxer::new(first));

        let barrier = Arc::new(Barrier::new(5));
        let mut handles = Vec::new();
        for _ in 0..4 {
            let atomic = Arc::clone(&atomic);
            let barrier = Arc::clone(&barrier);
            handles.push(tokio::spawn(async move {
                barrier.wait().await;
                for _ in 0..50 {
                    let tag = atomic.protocol();
                    assert!(tag == "first" || tag == "second");
                    let _ = atomic.open(Duration::from_millis(50)).await;
                }
            }));
        }

        let writer_atomic = Arc::clone(&atomic);
        let writer_barrier = Arc::clone(&barrier);
        handles.push(tokio::spawn(async move {
            writer_barrier.wait().await;
            let second: Arc<dyn Muxer> = Arc::new(FakeMuxer {
                tag: "second",
                opens: AtomicUsize::new(0),
            });
            writer_atomic.swap(second);
        }));

        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(atomic.protocol(), "second");
    }
}
