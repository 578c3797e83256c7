//! Public inbound transports: a TLS/TCP listener and a QUIC listener, both
//! ultimately handing [`AgentAcceptor`] a byte-stream to build a
//! [`Muxer`] session over. Grounded on the teacher's `build_server_config`
//! (certificate resolver wiring) for the TLS side; the QUIC side follows
//! quinn's own public API directly since nothing in this family of repos
//! exercises it (see `DESIGN.md`).

use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use aegis_cert::CertificateSource;
use aegis_muxer::MuxProtocol;
use aegis_task::ShutdownSignal;
use axum::Router;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpListener;

use crate::agent_acceptor::AgentAcceptor;

pub async fn run_tls(
    addr: SocketAddr,
    cert_source: Arc<CertificateSource>,
    acceptor: Arc<AgentAcceptor>,
    router: Router,
    mut shutdown: ShutdownSignal,
) -> std::io::Result<()> {
    let server_config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_cert_resolver(cert_source);
    let tls_acceptor = tokio_rustls::TlsAcceptor::from(Arc::new(server_config));

    let listener = TcpListener::bind(addr).await?;
    info!(%addr, "public TLS listener ready");

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, remote_addr) = match accepted {
                    Ok(pair) => pair,
                    Err(error) => {
                        warn!(%error, "TLS accept failed");
                        continue;
                    }
                };
                let local_addr = match stream.local_addr() {
                    Ok(addr) => addr,
                    Err(_) => addr,
                };
                let tls_acceptor = tls_acceptor.clone();
                let acceptor = Arc::clone(&acceptor);
                let router = router.clone();
                let shutdown = shutdown.clone();
                tokio::spawn(async move {
                    let tls_stream = match tls_acceptor.accept(stream).await {
                        Ok(stream) => stream,
                        Err(error) => {
                            warn!(%error, %remote_addr, "TLS handshake failed");
                            return;
                        }
                    };
                    let session = aegis_muxer::accept(tls_stream, MuxProtocol::Yamux, local_addr, remote_addr);
                    acceptor.accept_session(session, router, shutdown).await;
                });
            }
            () = shutdown.wait() => {
                info!("public TLS listener shutting down");
                return Ok(());
            }
        }
    }
}

pub async fn run_quic(
    addr: SocketAddr,
    cert_source: Arc<CertificateSource>,
    acceptor: Arc<AgentAcceptor>,
    router: Router,
    mut shutdown: ShutdownSignal,
) -> anyhow::Result<()> {
    let mut crypto = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_cert_resolver(cert_source);
    crypto.alpn_protocols = vec![b"aegis".to_vec()];

    let quic_crypto = quinn::crypto::rustls::QuicServerConfig::try_from(crypto)?;
    let server_config = quinn::ServerConfig::with_crypto(Arc::new(quic_crypto));
    let endpoint = quinn::Endpoint::server(server_config, addr)?;
    info!(%addr, "public QUIC listener ready");

    loop {
        tokio::select! {
            incoming = endpoint.accept() => {
                let Some(incoming) = incoming else {
                    info!("QUIC endpoint closed");
                    return Ok(());
                };
                let acceptor = Arc::clone(&acceptor);
                let router = router.clone();
                let shutdown = shutdown.clone();
                tokio::spawn(async move {
                    let connection = match incoming.await {
                        Ok(connection) => connection,
                        Err(error) => {
                            warn!(%error, "QUIC handshake failed");
                            return;
                        }
                    };
                    let remote_addr = connection.remote_address();

                    let (send, recv) = match connection.accept_bi().await {
                        Ok(streams) => streams,
                        Err(error) => {
                            warn!(%error, %remote_addr, "QUIC failed to accept the signaling stream");
                            return;
                        }
                    };
                    let shim = QuicBiStream { send, recv };
                    let session = aegis_muxer::accept(shim, MuxProtocol::Yamux, addr, remote_addr);
                    acceptor.accept_session(session, router, shutdown).await;
                });
            }
            () = shutdown.wait() => {
                info!("public QUIC listener shutting down");
                endpoint.close(quinn::VarInt::from_u32(0), b"shutdown");
                return Ok(());
            }
        }
    }
}

/// A single QUIC bidirectional stream treated as one full-duplex byte
/// connection, so a [`Muxer`](aegis_muxer::Muxer) can be layered on top of
/// it exactly as it would over a TLS/TCP socket. QUIC already multiplexes
/// streams on its own, but CORE is coded uniformly against `Muxer`
/// regardless of the underlying transport, so the first stream the peer
/// opens becomes this connection's sole byte-stream.
struct QuicBiStream {
    send: quinn::SendStream,
    recv: quinn::RecvStream,
}

impl AsyncRead for QuicBiStream {
    fn poll_read(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.recv).poll_read(cx, buf)
    }
}

impl AsyncWrite for QuicBiStream {
    fn poll_write(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.send).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.send).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.send).poll_shutdown(cx)
    }
}
