//! [`HostMatchDialer`]: a `net.Dialer`-style connector whose `address` is
//! inspected before ever touching the network. A host of
//! [`aegis_tunnel_proto::SERVER_HOST`] routes over the broker's own session
//! towards the central server; a host under the hub's agent domain routes
//! over that agent's session; anything else falls through to a direct TCP
//! connect.

#[macro_use]
extern crate tracing;

use std::sync::Arc;
use std::time::Duration;

use aegis_muxer::{BoxedStream, MuxError, Muxer};
use aegis_peer_hub::PeerHub;
use aegis_tunnel_proto::SERVER_HOST;
use tokio::net::TcpStream;

#[derive(Debug, thiserror::Error)]
pub enum DialError {
    #[error("address `{0}` is not a valid host:port pair")]
    InvalidAddress(String),
    #[error("no route to server host")]
    NoRouteToServer,
    #[error("no route to agent host `{0}`")]
    NoRouteToAgent(String),
    #[error(transparent)]
    Mux(#[from] MuxError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Routes outgoing `host:port` dials across three targets: the server
/// session, an agent session looked up by synthetic hostname, or a direct
/// TCP connect for anything that matches neither.
pub struct HostMatchDialer {
    server: Arc<dyn Muxer>,
    hub: Arc<PeerHub>,
    open_deadline: Duration,
}

impl HostMatchDialer {
    #[must_use]
    pub fn new(server: Arc<dyn Muxer>, hub: Arc<PeerHub>) -> Self {
        Self {
            server,
            hub,
            open_deadline: Duration::from_secs(10),
        }
    }

    #[must_use]
    pub fn with_open_deadline(mut self, deadline: Duration) -> Self {
        self.open_deadline = deadline;
        self
    }

    pub async fn dial(&self, address: &str) -> Result<BoxedStream, DialError> {
        let host = split_host(address)?;

        if host == SERVER_HOST {
            return self.dial_server().await;
        }

        if host.ends_with(self.hub.domain()) {
            return self.dial_agent(host).await;
        }

        self.dial_direct(address).await
    }

    async fn dial_server(&self) -> Result<BoxedStream, DialError> {
        if self.server.is_closed() {
            return Err(DialError::NoRouteToServer);
        }
        let stream = self.server.open(self.open_deadline).await?;
        Ok(stream)
    }

    async fn dial_agent(&self, host: &str) -> Result<BoxedStream, DialError> {
        let peer = self
            .hub
            .get(host)
            .ok_or_else(|| DialError::NoRouteToAgent(host.to_owned()))?;
        let stream = peer.muxer().open(self.open_deadline).await?;
        Ok(stream)
    }

    async fn dial_direct(&self, address: &str) -> Result<BoxedStream, DialError> {
        debug!(address, "dialing direct TCP, no synthetic host matched");
        let stream = TcpStream::connect(address).await?;
        Ok(Box::new(stream))
    }
}

fn split_host(address: &str) -> Result<&str, DialError> {
    address
        .rsplit_once(':')
        .map(|(host, _port)| host)
        .ok_or_else(|| DialError::InvalidAddress(address.to_owned()))
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use aegis_peer_hub::{Peer, PeerInfo};
    use aegis_tunnel_proto::AGENT_HOST_SUFFIX;
    use async_trait::async_trait;
    use std::net::SocketAddr;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingMuxer {
        opens: AtomicUsize,
        closed: bool,
    }

    #[async_trait]
    impl Muxer for CountingMuxer {
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
            self.closed
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
            (0, 0)
        }
    }

    fn dialer() -> (HostMatchDialer, Arc<PeerHub>) {
        let server: Arc<dyn Muxer> = Arc::new(CountingMuxer {
            opens: AtomicUsize::new(0),
            closed: false,
        });
        let hub = Arc::new(PeerHub::new(AGENT_HOST_SUFFIX));
        (HostMatchDialer::new(server, Arc::clone(&hub)), hub)
    }

    #[tokio::test]
    async fn routes_server_host_to_server_session() {
        let (dialer, _hub) = dialer();
        let address = format!("{SERVER_HOST}:443");
        assert!(dialer.dial(&address).await.is_ok());
    }

    #[tokio::test]
    async fn routes_known_agent_host_to_its_session() {
        let (dialer, hub) = dialer();
        let id = aegis_peer_hub::AgentId::from_hex("deadbeef").unwrap();
        let muxer: Arc<dyn Muxer> = Arc::new(CountingMuxer {
            opens: AtomicUsize::new(0),
            closed: false,
        });
        hub.put(Peer::new(id.clone(), PeerInfo::default(), muxer));

        let address = format!("{}:443", id.hostname(AGENT_HOST_SUFFIX));
        assert!(dialer.dial(&address).await.is_ok());
    }

    #[tokio::test]
    async fn unknown_agent_host_is_no_route() {
        let (dialer, _hub) = dialer();
        let address = format!("cafebabe.{AGENT_HOST_SUFFIX}:443");
        let err = dialer.dial(&address).await.unwrap_err();
        assert!(matches!(err, DialError::NoRouteToAgent(_)));
    }

    #[tokio::test]
    async fn closed_server_session_is_no_route() {
        let server: Arc<dyn Muxer> = Arc::new(CountingMuxer {
            opens: AtomicUsize::new(0),
            closed: true,
        });
        let hub = Arc::new(PeerHub::new(AGENT_HOST_SUFFIX));
        let dialer = HostMatchDialer::new(server, hub);
        let address = format!("{SERVER_HOST}:443");
        let err = dialer.dial(&address).await.unwrap_err();
        assert!(matches!(err, DialError::NoRouteToServer));
    }

    #[test]
    fn invalid_address_is_rejected() {
        assert!(split_host("no-port-here").is_err());
    }
}
