//! Periodic traffic reporting. Grounded on
//! `application/crontab/transmit_metrics.go`: on a fixed tick, read the
//! current session's cumulative counters and hand the delta since the last
//! tick to the backing store, rather than the raw cumulative totals.

use std::sync::Arc;
use std::time::Duration;

use aegis_muxer::{AtomicMuxer, Muxer};
use aegis_task::ShutdownSignal;

use crate::storage::BrokerStore;

/// Runs until `shutdown` fires, reporting the traffic delta on the live
/// upstream session every `interval`. A session swap mid-interval (the
/// client reconnecting) resets the baseline to the new session's counters,
/// since a fresh [`Muxer`] always starts at `(0, 0)`.
pub async fn run(muxer: Arc<AtomicMuxer>, store: Arc<dyn BrokerStore>, interval: Duration, mut shutdown: ShutdownSignal) {
    let mut last = muxer.transferred();
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let current = muxer.transferred();
                let (rx, tx) = delta(last, current);
                last = current;

                if rx == 0 && tx == 0 {
                    continue;
                }
                if let Err(error) = store.record_traffic(rx, tx).await {
                    error!(%error, "failed to persist traffic report");
                }
            }
            () = shutdown.wait() => {
                info!("periodic reporting shutting down");
                return;
            }
        }
    }
}

/// `current` is expected to be `>= last` component-wise, except right after
/// a session swap, where the new session's counters can be lower than the
/// old one's. Treat that as a reset rather than underflowing.
fn delta(last: (u64, u64), current: (u64, u64)) -> (u64, u64) {
    (current.0.saturating_sub(last.0), current.1.saturating_sub(last.1))
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use crate::storage::memory::MemoryBrokerStore;
    use aegis_muxer::MuxError;
    use async_trait::async_trait;
    use std::net::SocketAddr;
    use std::sync::atomic::{AtomicU64, Ordering};

    #[test]
    fn delta_is_the_difference_since_the_last_tick() {
        assert_eq!(delta((10, 20), (15, 45)), (5, 25));
    }

    #[test]
    fn delta_treats_a_lower_current_as_a_reset_rather_than_underflow() {
        assert_eq!(delta((100, 100), (3, 7)), (0, 0));
    }

    struct CountingMuxer {
        rx: AtomicU64,
        tx: AtomicU64,
    }

    #[async_trait]
    impl Muxer for CountingMuxer {
        async fn open(&self, _deadline: Duration) -> Result<aegis_muxer::BoxedStream, MuxError> {
            Err(MuxError::ClosedSession)
        }
        async fn accept(&self) -> Result<aegis_muxer::BoxedStream, MuxError> {
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
            "counting"
        }
        fn transferred(&self) -> (u64, u64) {
            (self.rx.load(Ordering::SeqCst), self.tx.load(Ordering::SeqCst))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn reports_accumulate_across_ticks() {
        let inner = Arc::new(CountingMuxer {
            rx: AtomicU64::new(0),
            tx: AtomicU64::new(0),
        });
        let muxer = Arc::new(AtomicMuxer::new(inner.clone()));
        let store = Arc::new(MemoryBrokerStore::new());
        let (handle, shutdown) = aegis_task::ShutdownHandle::new();

        let task = tokio::spawn(run(Arc::clone(&muxer), store.clone(), Duration::from_secs(1), shutdown));

        inner.rx.store(100, Ordering::SeqCst);
        inner.tx.store(40, Ordering::SeqCst);
        tokio::time::advance(Duration::from_secs(1)).await;
        tokio::task::yield_now().await;

        inner.rx.store(150, Ordering::SeqCst);
        inner.tx.store(55, Ordering::SeqCst);
        tokio::time::advance(Duration::from_secs(1)).await;
        tokio::task::yield_now().await;

        handle.signal();
        task.await.unwrap();

        assert_eq!(store.totals(), (150, 55));
    }
}
