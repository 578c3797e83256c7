//! Serves an [`axum::Router`] over every stream a [`Muxer`] accepts,
//! treating each one as a fresh HTTP/1.1 connection. Used both for the
//! server-to-broker tunnel (the server dials in and expects an HTTP
//! response) and the broker-to-agent tunnel (same shape, opposite roles).
//!
//! Grounded on the teacher's named-pipe transport server, which wraps each
//! accepted pipe connection the same way with `hyper_util`'s `auto::Builder`
//! instead of spinning up a full `hyper::Server` over a custom listener.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use aegis_muxer::Muxer;
use aegis_task::ShutdownSignal;
use axum::extract::ConnectInfo;
use axum::Router;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as ConnBuilder;
use tower::Service;

const RECONNECT_RETRY_DELAY: Duration = Duration::from_millis(500);

/// Like [`serve`], but for a muxer whose live session can be swapped out
/// from under it, e.g. [`aegis_muxer::AtomicMuxer`] wrapping the upstream
/// tunnel: an `accept` failure retries after a short delay instead of
/// ending the loop, so a reconnect swapping in a fresh session is picked up
/// here without `main` having to notice and re-spawn this task. A session
/// that is never going to come back (real shutdown) is still handled,
/// since the retry delay races `shutdown.wait()`.
pub async fn serve_reconnecting(muxer: Arc<dyn Muxer>, router: Router, mut shutdown: ShutdownSignal) {
    loop {
        tokio::select! {
            accepted = muxer.accept() => {
                match accepted {
                    Ok(stream) => {
                        let router = router.clone();
                        let remote_addr = muxer.remote_addr();
                        tokio::spawn(serve_one(stream, router, remote_addr));
                    }
                    Err(error) => {
                        debug!(%error, "mux accept failed, retrying in case a reconnect is in flight");
                        let mut retry_shutdown = shutdown.clone();
                        tokio::select! {
                            () = tokio::time::sleep(RECONNECT_RETRY_DELAY) => {}
                            () = retry_shutdown.wait() => return,
                        }
                    }
                }
            }
            () = shutdown.wait() => return,
        }
    }
}

/// Serves `session` until it closes for good, then returns. Appropriate for
/// a session with no reconnect concept of its own, such as one accepted
/// agent connection: once it closes, this loop's job is done.
pub async fn serve(session: Arc<dyn Muxer>, router: Router, mut shutdown: ShutdownSignal) {
    let remote_addr = session.remote_addr();
    loop {
        tokio::select! {
            accepted = session.accept() => {
                match accepted {
                    Ok(stream) => {
                        let router = router.clone();
                        tokio::spawn(serve_one(stream, router, remote_addr));
                    }
                    Err(error) => {
                        debug!(%error, "mux session closed, stopping HTTP server loop");
                        return;
                    }
                }
            }
            () = shutdown.wait() => return,
        }
    }
}

async fn serve_one(stream: aegis_muxer::BoxedStream, router: Router, remote_addr: SocketAddr) {
    let io = TokioIo::new(stream);
    let service = hyper::service::service_fn(move |mut request| {
        request.extensions_mut().insert(ConnectInfo(remote_addr));
        let mut router = router.clone();
        async move { router.call(request).await }
    });

    if let Err(error) = ConnBuilder::new(TokioExecutor::new())
        .serve_connection_with_upgrades(io, service)
        .await
    {
        debug!(%error, "mux-bound HTTP connection ended with an error");
    }
}
