//! Inbound tunnel server: authenticates a freshly-accepted agent session,
//! registers it in the [`PeerHub`], and serves HTTP over it for the rest of
//! its lifetime.
//!
//! Grounded on `channel/serverd/server.go`'s `agentServer`: `AcceptMUX` drives
//! `authentication` → `serveHTTP` → `disconnection`, with duplicate-online
//! rejected both against the store (already marked online) and against the
//! hub (already present), and traffic persisted rx/tx-swapped on the way out.

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use aegis_muxer::{MuxError, Muxer};
use aegis_peer_hub::{Peer, PeerHub, PeerInfo};
use aegis_task::ShutdownSignal;
use aegis_tunnel_proto::{agent_status, read_frame, write_frame, AuthRequest, AuthResponse, FramingError, ValidationError};
use axum::Router;

use crate::storage::{AgentStore, ConnectionHistory, OfflineSnapshot, OnlineSnapshot, StorageError};

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, thiserror::Error)]
pub enum AcceptError {
    #[error(transparent)]
    Mux(#[from] MuxError),
    #[error(transparent)]
    Framing(#[from] FramingError),
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("agent already online")]
    AlreadyOnline,
    #[error("agent already present in the hub")]
    AlreadyInHub,
    #[error("handshake timed out")]
    Timeout,
}

pub struct AgentAcceptor {
    hub: Arc<PeerHub>,
    store: Arc<dyn AgentStore>,
    secret: String,
}

impl AgentAcceptor {
    #[must_use]
    pub fn new(hub: Arc<PeerHub>, store: Arc<dyn AgentStore>, secret: impl Into<String>) -> Self {
        Self {
            hub,
            store,
            secret: secret.into(),
        }
    }

    /// Drives one agent session end to end: authenticate, register, serve
    /// HTTP over it until it closes, then unregister and persist the final
    /// traffic snapshot. Never returns an error for a session that reached
    /// the hub; callers only need to log the result.
    pub async fn accept_session(&self, session: Arc<dyn Muxer>, router: Router, shutdown: ShutdownSignal) {
        let connected_at = SystemTime::now();

        let peer = match self.authenticate(Arc::clone(&session)).await {
            Ok(peer) => peer,
            Err(error) => {
                warn!(%error, remote = %session.remote_addr(), "agent handshake rejected");
                session.close();
                return;
            }
        };

        info!(id = %peer.id(), hostname = peer.info().hostname.as_deref().unwrap_or(""), "agent online");

        crate::mux_http::serve(Arc::clone(&session), router, shutdown).await;

        self.disconnect(&peer, connected_at).await;
    }

    async fn authenticate(&self, session: Arc<dyn Muxer>) -> Result<Arc<Peer>, AcceptError> {
        let mut signaling = tokio::time::timeout(HANDSHAKE_TIMEOUT, session.accept())
            .await
            .map_err(|_| AcceptError::Timeout)??;

        let request: AuthRequest = tokio::time::timeout(HANDSHAKE_TIMEOUT, read_frame(&mut signaling))
            .await
            .map_err(|_| AcceptError::Timeout)??;

        if let Err(error) = self.validate(&request) {
            if let Err(write_error) = respond(&mut signaling, AuthResponse::error(agent_status::VALIDATION, error.to_string())).await
            {
                warn!(%write_error, "failed to deliver validation error response");
            }
            return Err(error);
        }

        let machine_id = request.machine_id.clone().unwrap_or_default();
        let record = self.store.find_or_create(&machine_id).await?;
        if record.online {
            if let Err(write_error) = respond(&mut signaling, AuthResponse::error(agent_status::CONFLICT, "duplicate")).await {
                warn!(%write_error, "failed to deliver duplicate-online error response");
            }
            return Err(AcceptError::AlreadyOnline);
        }

        let info = PeerInfo {
            machine_id: machine_id.clone(),
            os: Some(request.goos.clone()),
            arch: Some(request.goarch.clone()),
            hostname: Some(request.hostname.clone()),
            external_ip: Some(request.inet.clone()),
            semver: Some(request.semver.clone()),
        };
        let peer = Peer::new(record.id.clone(), info, Arc::clone(&session));

        if !self.hub.put(peer) {
            if let Err(write_error) = respond(&mut signaling, AuthResponse::error(agent_status::CONFLICT, "duplicate")).await {
                warn!(%write_error, "failed to deliver duplicate-in-hub error response");
            }
            return Err(AcceptError::AlreadyInHub);
        }
        // `put` takes the peer by value; fetch the `Arc` the hub now owns so
        // later steps (serving HTTP, disconnect bookkeeping) share it.
        let peer = self.hub.get_by_id(&record.id).ok_or(AcceptError::AlreadyInHub)?;

        // Mirrors `responseAccepted` in the original: a write failure here
        // evicts the peer we just registered and aborts, same as any other
        // rejection, rather than leaving a hub entry the agent never learned
        // it owns.
        if let Err(write_error) = respond(&mut signaling, AuthResponse::ok(agent_status::ACCEPTED)).await {
            warn!(%write_error, id = %record.id, "failed to deliver accepted response, evicting peer");
            self.hub.del_by_id(&record.id);
            let _ = respond(&mut signaling, AuthResponse::error(agent_status::CONFLICT, write_error.to_string())).await;
            return Err(AcceptError::Framing(write_error));
        }

        if !self
            .store
            .mark_online(
                &record.id,
                OnlineSnapshot {
                    hostname: request.hostname,
                    goos: request.goos,
                    goarch: request.goarch,
                    connected_at: SystemTime::now(),
                },
            )
            .await?
        {
            self.hub.del_by_id(&record.id);
            if let Err(write_error) =
                respond(&mut signaling, AuthResponse::error(agent_status::CONFLICT, "failed to persist online state")).await
            {
                warn!(%write_error, id = %record.id, "failed to deliver online-persist-failure error response");
            }
            return Err(AcceptError::Storage(StorageError::NotFound));
        }

        Ok(peer)
    }

    fn validate(&self, request: &AuthRequest) -> Result<(), AcceptError> {
        request.validate_agent()?;
        if request.secret != self.secret {
            return Err(AcceptError::Validation(ValidationError::MissingField("secret")));
        }
        Ok(())
    }

    async fn disconnect(&self, peer: &Arc<Peer>, connected_at: SystemTime) {
        let disconnected_at = SystemTime::now();
        let (tx, rx) = peer.muxer().transferred();

        self.hub.del_by_id(peer.id());

        // Traffic-perspective convention: persist the agent's view, which is
        // the broker-side counters swapped.
        let result = self
            .store
            .mark_offline(
                peer.id(),
                OfflineSnapshot {
                    receive_bytes: tx,
                    transmit_bytes: rx,
                    disconnected_at,
                },
            )
            .await;
        if let Err(error) = result {
            error!(%error, id = %peer.id(), "failed to persist agent offline state");
        }

        let history = ConnectionHistory {
            machine_id: peer.info().machine_id.clone(),
            connected_at,
            disconnected_at: Some(disconnected_at),
        };
        if let Err(error) = self.store.append_history(history).await {
            error!(%error, id = %peer.id(), "failed to append connection history");
        }

        info!(id = %peer.id(), "agent offline");
    }
}

/// Best-effort handshake response write. Returns the inner [`FramingError`]
/// on a genuine write failure, and synthesizes an I/O timeout error if the
/// write itself never completes, so callers can treat "timed out" and
/// "refused" identically: evict the just-registered peer and abort.
async fn respond(signaling: &mut aegis_muxer::BoxedStream, response: AuthResponse) -> Result<(), FramingError> {
    match tokio::time::timeout(HANDSHAKE_TIMEOUT, write_frame(signaling, &response)).await {
        Ok(result) => result,
        Err(_) => Err(FramingError::Io(std::io::Error::new(
            std::io::ErrorKind::TimedOut,
            "timed out writing handshake response",
        ))),
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use crate::storage::memory::MemoryAgentStore;
    use aegis_tunnel_proto::AGENT_HOST_SUFFIX;
    use async_trait::async_trait;
    use std::net::SocketAddr;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tokio::io::DuplexStream;

    struct PairMuxer {
        inbound: tokio::sync::Mutex<Option<DuplexStream>>,
        closed: AtomicBool,
    }

    #[async_trait]
    impl Muxer for PairMuxer {
        async fn open(&self, _deadline: Duration) -> Result<aegis_muxer::BoxedStream, MuxError> {
            Err(MuxError::ClosedSession)
        }
        async fn accept(&self) -> Result<aegis_muxer::BoxedStream, MuxError> {
            match self.inbound.lock().await.take() {
                Some(stream) => Ok(Box::new(stream)),
                None => Err(MuxError::ClosedSession),
            }
        }
        fn close(&self) {
            self.closed.store(true, Ordering::SeqCst);
        }
        fn is_closed(&self) -> bool {
            self.closed.load(Ordering::SeqCst)
        }
        fn local_addr(&self) -> SocketAddr {
            "127.0.0.1:0".parse().unwrap()
        }
        fn remote_addr(&self) -> SocketAddr {
            "127.0.0.1:0".parse().unwrap()
        }
        fn protocol(&self) -> &'static str {
            "pair"
        }
        fn transferred(&self) -> (u64, u64) {
            (0, 0)
        }
    }

    fn sample_request(machine_id: &str, secret: &str) -> AuthRequest {
        AuthRequest {
            secret: secret.to_owned(),
            semver: "1.0.0".to_owned(),
            inet: "10.0.0.5".to_owned(),
            goos: "linux".to_owned(),
            goarch: "amd64".to_owned(),
            pid: 99,
            args: vec!["agent".to_owned()],
            hostname: "agent-host".to_owned(),
            workdir: "/".to_owned(),
            executable: "/usr/bin/agent".to_owned(),
            machine_id: Some(machine_id.to_owned()),
            username: None,
            uid: None,
        }
    }

    #[tokio::test]
    async fn successful_handshake_registers_peer_and_marks_online() {
        let hub = Arc::new(PeerHub::new(AGENT_HOST_SUFFIX));
        let store = Arc::new(MemoryAgentStore::new());
        let acceptor = AgentAcceptor::new(Arc::clone(&hub), store.clone(), "s3cret");

        let (mut local, remote) = tokio::io::duplex(4096);
        let session: Arc<dyn Muxer> = Arc::new(PairMuxer {
            inbound: tokio::sync::Mutex::new(Some(remote)),
            closed: AtomicBool::new(false),
        });

        let request = sample_request("M1", "s3cret");
        write_frame(&mut local, &request).await.unwrap();

        let peer = acceptor.authenticate(session).await.unwrap();
        assert_eq!(hub.len(), 1);
        assert_eq!(peer.info().machine_id, "M1");

        let response: AuthResponse = read_frame(&mut local).await.unwrap();
        assert!(response.is_success());

        let record = store.find_or_create("M1").await.unwrap();
        assert!(record.online);
    }

    #[tokio::test]
    async fn wrong_secret_is_rejected() {
        let hub = Arc::new(PeerHub::new(AGENT_HOST_SUFFIX));
        let store = Arc::new(MemoryAgentStore::new());
        let acceptor = AgentAcceptor::new(Arc::clone(&hub), store, "s3cret");

        let (mut local, remote) = tokio::io::duplex(4096);
        let session: Arc<dyn Muxer> = Arc::new(PairMuxer {
            inbound: tokio::sync::Mutex::new(Some(remote)),
            closed: AtomicBool::new(false),
        });

        let request = sample_request("M1", "wrong");
        write_frame(&mut local, &request).await.unwrap();

        let error = acceptor.authenticate(session).await.unwrap_err();
        assert!(matches!(error, AcceptError::Validation(_)));
        assert!(hub.is_empty());
    }

    #[tokio::test]
    async fn duplicate_online_agent_is_rejected() {
        let hub = Arc::new(PeerHub::new(AGENT_HOST_SUFFIX));
        let store = Arc::new(MemoryAgentStore::new());
        let acceptor = AgentAcceptor::new(Arc::clone(&hub), store.clone(), "s3cret");

        let existing = store.find_or_create("M1").await.unwrap();
        store
            .mark_online(
                &existing.id,
                OnlineSnapshot {
                    hostname: "agent-host".to_owned(),
                    goos: "linux".to_owned(),
                    goarch: "amd64".to_owned(),
                    connected_at: SystemTime::now(),
                },
            )
            .await
            .unwrap();

        let (mut local, remote) = tokio::io::duplex(4096);
        let session: Arc<dyn Muxer> = Arc::new(PairMuxer {
            inbound: tokio::sync::Mutex::new(Some(remote)),
            closed: AtomicBool::new(false),
        });

        let request = sample_request("M1", "s3cret");
        write_frame(&mut local, &request).await.unwrap();

        let error = acceptor.authenticate(session).await.unwrap_err();
        assert!(matches!(error, AcceptError::AlreadyOnline));
        assert!(hub.is_empty());

        let response: AuthResponse = read_frame(&mut local).await.unwrap();
        assert_eq!(response.code, agent_status::CONFLICT);
    }

    /// A dropped peer makes the accepted-response write fail, mirroring a
    /// connection that dies right as `responseAccepted` is sent. The peer
    /// must not be left registered in the hub.
    #[tokio::test]
    async fn accepted_write_failure_evicts_the_peer_from_the_hub() {
        let hub = Arc::new(PeerHub::new(AGENT_HOST_SUFFIX));
        let store = Arc::new(MemoryAgentStore::new());
        let acceptor = AgentAcceptor::new(Arc::clone(&hub), store, "s3cret");

        let (mut local, remote) = tokio::io::duplex(4096);
        let session: Arc<dyn Muxer> = Arc::new(PairMuxer {
            inbound: tokio::sync::Mutex::new(Some(remote)),
            closed: AtomicBool::new(false),
        });

        let request = sample_request("M1", "s3cret");
        write_frame(&mut local, &request).await.unwrap();
        drop(local);

        let error = acceptor.authenticate(session).await.unwrap_err();
        assert!(matches!(error, AcceptError::Framing(_)));
        assert!(hub.is_empty());
    }

    struct RejectOnlineStore {
        inner: MemoryAgentStore,
    }

    #[async_trait]
    impl AgentStore for RejectOnlineStore {
        async fn find_or_create(&self, machine_id: &str) -> Result<crate::storage::AgentRecord, StorageError> {
            self.inner.find_or_create(machine_id).await
        }
        async fn mark_online(&self, _id: &aegis_peer_hub::AgentId, _snapshot: OnlineSnapshot) -> Result<bool, StorageError> {
            Ok(false)
        }
        async fn mark_offline(&self, id: &aegis_peer_hub::AgentId, snapshot: OfflineSnapshot) -> Result<(), StorageError> {
            self.inner.mark_offline(id, snapshot).await
        }
        async fn append_history(&self, record: ConnectionHistory) -> Result<(), StorageError> {
            self.inner.append_history(record).await
        }
    }

    #[tokio::test]
    async fn online_persist_failure_evicts_peer_and_sends_conflict() {
        let hub = Arc::new(PeerHub::new(AGENT_HOST_SUFFIX));
        let store: Arc<dyn AgentStore> = Arc::new(RejectOnlineStore {
            inner: MemoryAgentStore::new(),
        });
        let acceptor = AgentAcceptor::new(Arc::clone(&hub), store, "s3cret");

        let (mut local, remote) = tokio::io::duplex(4096);
        let session: Arc<dyn Muxer> = Arc::new(PairMuxer {
            inbound: tokio::sync::Mutex::new(Some(remote)),
            closed: AtomicBool::new(false),
        });

        let request = sample_request("M1", "s3cret");
        write_frame(&mut local, &request).await.unwrap();

        let error = acceptor.authenticate(session).await.unwrap_err();
        assert!(matches!(error, AcceptError::Storage(StorageError::NotFound)));
        assert!(hub.is_empty());

        let accepted: AuthResponse = read_frame(&mut local).await.unwrap();
        assert!(accepted.is_success());
        let conflict: AuthResponse = read_frame(&mut local).await.unwrap();
        assert_eq!(conflict.code, agent_status::CONFLICT);
    }
}
