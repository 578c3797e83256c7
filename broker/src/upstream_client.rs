//! Outbound reconnecting tunnel client towards the central server. Builds a
//! handshake request from process metadata, dials through the configured
//! addresses with backoff, and keeps one [`AtomicMuxer`] swapped to the
//! live session for the lifetime of the process.
//!
//! Grounded on the upstream dial/handshake/reconnect loop of the original
//! broker client: try each address, handshake over a transient signaling
//! stream, become the live session on success, back off and retry on
//! failure.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use aegis_muxer::{AtomicMuxer, MuxError, MuxProtocol, Muxer};
use aegis_task::ShutdownSignal;
use aegis_tunnel_proto::{read_frame, write_frame, AuthConfig, AuthRequest, AuthResponse, FramingError};
use tokio::net::TcpStream;

use crate::backoff;
use crate::config::ConfHandle;

const DIAL_TIMEOUT: Duration = Duration::from_secs(10);
const POLL_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("dial timed out")]
    Timeout,
    #[error(transparent)]
    Mux(#[from] MuxError),
    #[error(transparent)]
    Framing(#[from] FramingError),
    #[error("server rejected handshake ({code}): {message}")]
    Rejected { code: u16, message: String },
    #[error("shutting down")]
    ShuttingDown,
}

pub struct ConnectOutcome {
    pub muxer: Arc<AtomicMuxer>,
    pub config: Option<AuthConfig>,
}

pub struct UpstreamClient {
    conf: ConfHandle,
    shutdown: ShutdownSignal,
}

impl UpstreamClient {
    #[must_use]
    pub fn new(conf: ConfHandle, shutdown: ShutdownSignal) -> Self {
        Self { conf, shutdown }
    }

    /// Blocks (with backoff, observing shutdown) until the first successful
    /// connection, then wraps it in a fresh [`AtomicMuxer`].
    pub async fn connect(&self) -> Result<ConnectOutcome, ClientError> {
        let (session, config) = self.dial_until_success(0).await?;
        Ok(ConnectOutcome {
            muxer: Arc::new(AtomicMuxer::new(session)),
            config,
        })
    }

    /// Runs until shutdown, swapping a fresh session into `muxer` every time
    /// the current one reports closed.
    pub async fn run_reconnect_loop(&self, muxer: Arc<AtomicMuxer>) {
        let mut attempts = 0u32;
        loop {
            if self.shutdown.clone().is_shutting_down() {
                return;
            }

            if !muxer.is_closed() {
                tokio::time::sleep(POLL_INTERVAL).await;
                continue;
            }

            warn!("upstream session lost, reconnecting");
            match self.dial_until_success(attempts).await {
                Ok((session, _config)) => {
                    muxer.swap(session);
                    attempts = 0;
                    info!("reconnected to upstream server");
                }
                Err(ClientError::ShuttingDown) => return,
                Err(error) => {
                    error!(%error, "reconnect loop exiting on unexpected error");
                    return;
                }
            }
        }
    }

    async fn dial_until_success(&self, mut attempts: u32) -> Result<(Arc<dyn Muxer>, Option<AuthConfig>), ClientError> {
        loop {
            let addresses = self.conf.get().upstream_addresses.clone();
            for address in &addresses {
                if self.shutdown.clone().is_shutting_down() {
                    return Err(ClientError::ShuttingDown);
                }

                match self.try_address(address).await {
                    Ok(outcome) => return Ok(outcome),
                    Err(error) => {
                        attempts += 1;
                        warn!(address, attempts, %error, "upstream dial attempt failed");
                    }
                }
            }

            let delay = backoff::next_delay(attempts);
            let mut shutdown = self.shutdown.clone();
            tokio::select! {
                () = tokio::time::sleep(delay) => {}
                () = shutdown.wait() => return Err(ClientError::ShuttingDown),
            }
        }
    }

    async fn try_address(&self, address: &str) -> Result<(Arc<dyn Muxer>, Option<AuthConfig>), ClientError> {
        let stream = tokio::time::timeout(DIAL_TIMEOUT, TcpStream::connect(address))
            .await
            .map_err(|_| ClientError::Timeout)??;
        let local_addr = stream.local_addr()?;
        let remote_addr = stream.peer_addr()?;

        let session = aegis_muxer::dial(stream, MuxProtocol::Yamux, local_addr, remote_addr);

        match self.handshake(&session, local_addr).await {
            Ok(config) => Ok((session, config)),
            Err(error) => {
                session.close();
                Err(error)
            }
        }
    }

    async fn handshake(&self, session: &Arc<dyn Muxer>, local_addr: SocketAddr) -> Result<Option<AuthConfig>, ClientError> {
        let mut signaling = session.open(DIAL_TIMEOUT).await?;
        let request = build_auth_request(&self.conf.get().upstream_secret, local_addr);

        tokio::time::timeout(DIAL_TIMEOUT, write_frame(&mut signaling, &request))
            .await
            .map_err(|_| ClientError::Timeout)??;

        let response: AuthResponse = tokio::time::timeout(DIAL_TIMEOUT, read_frame(&mut signaling))
            .await
            .map_err(|_| ClientError::Timeout)??;

        if !response.is_success() {
            return Err(ClientError::Rejected {
                code: response.code,
                message: response.message.unwrap_or_default(),
            });
        }

        Ok(response.config)
    }
}

fn build_auth_request(secret: &str, local_addr: SocketAddr) -> AuthRequest {
    AuthRequest {
        secret: secret.to_owned(),
        semver: env!("CARGO_PKG_VERSION").to_owned(),
        inet: local_addr.ip().to_string(),
        goos: std::env::consts::OS.to_owned(),
        goarch: std::env::consts::ARCH.to_owned(),
        pid: std::process::id(),
        args: std::env::args().collect(),
        hostname: hostname_or_unknown(),
        workdir: std::env::current_dir()
            .map(|p| p.display().to_string())
            .unwrap_or_default(),
        executable: std::env::current_exe()
            .map(|p| p.display().to_string())
            .unwrap_or_default(),
        machine_id: None,
        username: None,
        uid: None,
    }
}

fn hostname_or_unknown() -> String {
    hostname::get()
        .ok()
        .and_then(|name| name.into_string().ok())
        .unwrap_or_else(|| "unknown".to_owned())
}
