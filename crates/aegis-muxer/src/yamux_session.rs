use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt as _;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_util::compat::{FuturesAsyncReadCompatExt, TokioAsyncReadCompatExt};

use aegis_task::ChildTask;

use crate::counting::CountingStream;
use crate::error::MuxError;
use crate::{BoxedStream, Muxer};

/// Concrete multiplex implementations selectable by configuration. Only
/// `Yamux` is implemented today; the variant exists so a second backend can
/// be added without touching any `Muxer` consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MuxProtocol {
    Yamux,
}

impl MuxProtocol {
    #[must_use]
    pub fn tag(self) -> &'static str {
        match self {
            MuxProtocol::Yamux => "yamux",
        }
    }
}

/// Builds a client-role (dialing) session over an already-connected byte
/// stream.
pub fn dial<IO>(io: IO, protocol: MuxProtocol, local_addr: SocketAddr, remote_addr: SocketAddr) -> Arc<dyn Muxer>
where
    IO: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    match protocol {
        MuxProtocol::Yamux => YamuxMuxer::new(io, yamux::Mode::Client, local_addr, remote_addr),
    }
}

/// Builds a server-role (accepting) session over an already-accepted byte
/// stream.
pub fn accept<IO>(io: IO, protocol: MuxProtocol, local_addr: SocketAddr, remote_addr: SocketAddr) -> Arc<dyn Muxer>
where
    IO: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    match protocol {
        MuxProtocol::Yamux => YamuxMuxer::new(io, yamux::Mode::Server, local_addr, remote_addr),
    }
}

struct YamuxMuxer {
    control: Mutex<yamux::Control>,
    inbound_rx: tokio::sync::Mutex<mpsc::Receiver<yamux::Stream>>,
    local_addr: SocketAddr,
    remote_addr: SocketAddr,
    rx_bytes: Arc<AtomicU64>,
    tx_bytes: Arc<AtomicU64>,
    closed: Arc<AtomicBool>,
    _driver: ChildTask<()>,
}

impl YamuxMuxer {
    fn new<IO>(io: IO, mode: yamux::Mode, local_addr: SocketAddr, remote_addr: SocketAddr) -> Arc<dyn Muxer>
    where
        IO: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let config = yamux::Config::default();
        let connection = yamux::Connection::new(io.compat(), config, mode);
        let control = connection.control();
        let mut connection = Box::pin(yamux::into_stream(connection));

        let (inbound_tx, inbound_rx) = mpsc::channel(32);
        let closed = Arc::new(AtomicBool::new(false));
        let closed_for_driver = Arc::clone(&closed);

        // The `Connection` must be polled continuously for `Control` to make
        // progress (opening streams) and for inbound streams to surface; this
        // task is that driver, and doubles as the inbound-stream source.
        let driver = ChildTask::spawn(async move {
            loop {
                match connection.next().await {
                    Some(Ok(stream)) => {
                        if inbound_tx.send(stream).await.is_err() {
                            break;
                        }
                    }
                    Some(Err(error)) => {
                        debug!(%error, "yamux connection driver exiting on error");
                        break;
                    }
                    None => break,
                }
            }
            closed_for_driver.store(true, Ordering::Release);
        });

        Arc::new(Self {
            control: Mutex::new(control),
            inbound_rx: tokio::sync::Mutex::new(inbound_rx),
            local_addr,
            remote_addr,
            rx_bytes: Arc::new(AtomicU64::new(0)),
            tx_bytes: Arc::new(AtomicU64::new(0)),
            closed,
            _driver: driver,
        })
    }

    fn wrap(&self, stream: yamux::Stream) -> BoxedStream {
        Box::new(CountingStream::new(
            stream.compat(),
            Arc::clone(&self.rx_bytes),
            Arc::clone(&self.tx_bytes),
        ))
    }
}

#[async_trait]
impl Muxer for YamuxMuxer {
    async fn open(&self, deadline: Duration) -> Result<BoxedStream, MuxError> {
        if self.is_closed() {
            return Err(MuxError::ClosedSession);
        }

        let opened = tokio::time::timeout(deadline, async {
            let mut control = self.control.lock().clone();
            control.open_stream().await
        })
        .await
        .map_err(|_| MuxError::Timeout)?;

        match opened {
            Ok(stream) => Ok(self.wrap(stream)),
            Err(_) => Err(MuxError::ClosedSession),
        }
    }

    async fn accept(&self) -> Result<BoxedStream, MuxError> {
        let mut guard = self.inbound_rx.lock().await;
        match guard.recv().await {
            Some(stream) => Ok(self.wrap(stream)),
            None => Err(MuxError::ClosedSession),
        }
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let mut control = self.control.lock().clone();
        tokio::spawn(async move {
            let _ = control.close().await;
        });
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    fn protocol(&self) -> &'static str {
        MuxProtocol::Yamux.tag()
    }

    fn transferred(&self) -> (u64, u64) {
        (
            self.rx_bytes.load(Ordering::Relaxed),
            self.tx_bytes.load(Ordering::Relaxed),
        )
    }
}
