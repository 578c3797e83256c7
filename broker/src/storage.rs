//! Persistence seam between the link-layer core and whatever database a
//! deployment actually uses. CORE never depends on a concrete store, only on
//! [`AgentStore`], [`BrokerStore`] and [`CertificateStore`]; [`memory`]
//! supplies a reference implementation used by tests and as a starting point
//! for a real adapter.

use std::time::SystemTime;

use aegis_peer_hub::AgentId;
use async_trait::async_trait;

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("record not found")]
    NotFound,
    #[error("backend error: {0}")]
    Backend(String),
}

#[derive(Debug, Clone)]
pub struct AgentRecord {
    /// The identity a backing store assigns a machine_id the first time it
    /// is seen (a Mongo `ObjectID` in the original); stable for the life of
    /// the record and used as the [`AgentId`] the hub indexes by.
    pub id: AgentId,
    pub machine_id: String,
    pub online: bool,
    pub connected_at: Option<SystemTime>,
    pub disconnected_at: Option<SystemTime>,
    pub receive_bytes: u64,
    pub transmit_bytes: u64,
    pub hostname: String,
    pub goos: String,
    pub goarch: String,
}

impl AgentRecord {
    fn new(machine_id: impl Into<String>, id: AgentId) -> Self {
        Self {
            id,
            machine_id: machine_id.into(),
            online: false,
            connected_at: None,
            disconnected_at: None,
            receive_bytes: 0,
            transmit_bytes: 0,
            hostname: String::new(),
            goos: String::new(),
            goarch: String::new(),
        }
    }
}

/// 12 random bytes, the same width as a Mongo `ObjectID`, standing in for
/// whatever identity scheme a real backing store assigns.
fn fresh_identity() -> AgentId {
    let bytes: [u8; 12] = rand::random();
    AgentId::new(bytes.to_vec())
}

/// Traffic and identity captured at the moment an agent transitions online.
/// `receive_bytes`/`transmit_bytes` are from the broker's perspective at
/// swap-in (normally zero for a fresh session).
#[derive(Debug, Clone)]
pub struct OnlineSnapshot {
    pub hostname: String,
    pub goos: String,
    pub goarch: String,
    pub connected_at: SystemTime,
}

/// Traffic captured at the moment an agent disconnects. Per the persisted
/// traffic-perspective convention, `receive_bytes`/`transmit_bytes` here are
/// the *agent's* view: the broker's `tx`/`rx` swapped.
#[derive(Debug, Clone)]
pub struct OfflineSnapshot {
    pub receive_bytes: u64,
    pub transmit_bytes: u64,
    pub disconnected_at: SystemTime,
}

#[derive(Debug, Clone)]
pub struct ConnectionHistory {
    pub machine_id: String,
    pub connected_at: SystemTime,
    pub disconnected_at: Option<SystemTime>,
}

#[derive(Debug, Clone)]
pub struct StoredCertificate {
    pub names: Vec<String>,
    pub public_key_pem: String,
    pub private_key_pem: String,
    pub not_before: SystemTime,
    pub not_after: SystemTime,
}

#[async_trait]
pub trait AgentStore: Send + Sync {
    async fn find_or_create(&self, machine_id: &str) -> Result<AgentRecord, StorageError>;
    /// Returns `false` if no record matched `id` (nothing to update).
    async fn mark_online(&self, id: &AgentId, snapshot: OnlineSnapshot) -> Result<bool, StorageError>;
    async fn mark_offline(&self, id: &AgentId, snapshot: OfflineSnapshot) -> Result<(), StorageError>;
    async fn append_history(&self, record: ConnectionHistory) -> Result<(), StorageError>;
}

#[async_trait]
pub trait BrokerStore: Send + Sync {
    async fn record_traffic(&self, rx: u64, tx: u64) -> Result<(), StorageError>;
}

#[async_trait]
pub trait CertificateStore: Send + Sync {
    async fn enabled_certificates(&self) -> Result<Vec<StoredCertificate>, StorageError>;
}

/// In-memory reference implementations. Not a database: state is lost on
/// restart, and `find_or_create` keys solely on `machine_id` in a `Vec`
/// scanned linearly, which is fine at test scale and wrong at fleet scale.
pub mod memory {
    use super::{
        fresh_identity, AgentId, AgentRecord, AgentStore, BrokerStore, CertificateStore, ConnectionHistory,
        OfflineSnapshot, OnlineSnapshot, StorageError, StoredCertificate,
    };
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::collections::HashMap;

    #[derive(Default)]
    pub struct MemoryAgentStore {
        records: Mutex<HashMap<String, AgentRecord>>,
        by_id: Mutex<HashMap<AgentId, String>>,
        history: Mutex<Vec<ConnectionHistory>>,
    }

    impl MemoryAgentStore {
        #[must_use]
        pub fn new() -> Self {
            Self::default()
        }
    }

    #[async_trait]
    impl AgentStore for MemoryAgentStore {
        async fn find_or_create(&self, machine_id: &str) -> Result<AgentRecord, StorageError> {
            let mut records = self.records.lock();
            if let Some(existing) = records.get(machine_id) {
                return Ok(existing.clone());
            }
            let record = AgentRecord::new(machine_id, fresh_identity());
            self.by_id.lock().insert(record.id.clone(), machine_id.to_owned());
            records.insert(machine_id.to_owned(), record.clone());
            Ok(record)
        }

        async fn mark_online(&self, id: &AgentId, snapshot: OnlineSnapshot) -> Result<bool, StorageError> {
            let Some(machine_id) = self.by_id.lock().get(id).cloned() else {
                return Ok(false);
            };
            let mut records = self.records.lock();
            let Some(record) = records.get_mut(&machine_id) else {
                return Ok(false);
            };
            record.online = true;
            record.connected_at = Some(snapshot.connected_at);
            record.disconnected_at = None;
            record.hostname = snapshot.hostname;
            record.goos = snapshot.goos;
            record.goarch = snapshot.goarch;
            Ok(true)
        }

        async fn mark_offline(&self, id: &AgentId, snapshot: OfflineSnapshot) -> Result<(), StorageError> {
            let Some(machine_id) = self.by_id.lock().get(id).cloned() else {
                return Err(StorageError::NotFound);
            };
            let mut records = self.records.lock();
            let record = records.get_mut(&machine_id).ok_or(StorageError::NotFound)?;
            record.online = false;
            record.disconnected_at = Some(snapshot.disconnected_at);
            record.receive_bytes = snapshot.receive_bytes;
            record.transmit_bytes = snapshot.transmit_bytes;
            Ok(())
        }

        async fn append_history(&self, record: ConnectionHistory) -> Result<(), StorageError> {
            self.history.lock().push(record);
            Ok(())
        }
    }

    #[derive(Default)]
    pub struct MemoryBrokerStore {
        totals: Mutex<(u64, u64)>,
    }

    impl MemoryBrokerStore {
        #[must_use]
        pub fn new() -> Self {
            Self::default()
        }

        #[must_use]
        pub fn totals(&self) -> (u64, u64) {
            *self.totals.lock()
        }
    }

    #[async_trait]
    impl BrokerStore for MemoryBrokerStore {
        async fn record_traffic(&self, rx: u64, tx: u64) -> Result<(), StorageError> {
            let mut totals = self.totals.lock();
            totals.0 = totals.0.saturating_add(rx);
            totals.1 = totals.1.saturating_add(tx);
            Ok(())
        }
    }

    #[derive(Default)]
    pub struct MemoryCertificateStore {
        certificates: Mutex<Vec<StoredCertificate>>,
    }

    impl MemoryCertificateStore {
        #[must_use]
        pub fn new() -> Self {
            Self::default()
        }

        pub fn insert(&self, certificate: StoredCertificate) {
            self.certificates.lock().push(certificate);
        }

        pub fn clear(&self) {
            self.certificates.lock().clear();
        }
    }

    #[async_trait]
    impl CertificateStore for MemoryCertificateStore {
        async fn enabled_certificates(&self) -> Result<Vec<StoredCertificate>, StorageError> {
            Ok(self.certificates.lock().clone())
        }
    }

    #[cfg(test)]
    mod tests {
        #![allow(clippy::unwrap_used)]

        use super::*;
        use std::time::SystemTime;

        #[tokio::test]
        async fn find_or_create_is_idempotent_per_machine_id() {
            let store = MemoryAgentStore::new();
            let first = store.find_or_create("M1").await.unwrap();
            let second = store.find_or_create("M1").await.unwrap();
            assert_eq!(first.machine_id, second.machine_id);
            assert_eq!(first.id, second.id);
        }

        #[tokio::test]
        async fn mark_online_requires_a_known_identity() {
            let store = MemoryAgentStore::new();
            store.find_or_create("M1").await.unwrap();
            let unknown = AgentId::from_hex("deadbeef").unwrap();

            let updated = store
                .mark_online(
                    &unknown,
                    OnlineSnapshot {
                        hostname: "host-a".to_owned(),
                        goos: "linux".to_owned(),
                        goarch: "amd64".to_owned(),
                        connected_at: SystemTime::now(),
                    },
                )
                .await
                .unwrap();
            assert!(!updated, "an identity from no find_or_create call should not match any record");

            let record = store.find_or_create("M2").await.unwrap();
            let updated = store
                .mark_online(
                    &record.id,
                    OnlineSnapshot {
                        hostname: "host-a".to_owned(),
                        goos: "linux".to_owned(),
                        goarch: "amd64".to_owned(),
                        connected_at: SystemTime::now(),
                    },
                )
                .await
                .unwrap();
            assert!(updated);
        }

        #[tokio::test]
        async fn broker_store_accumulates_traffic() {
            let store = MemoryBrokerStore::new();
            store.record_traffic(10, 20).await.unwrap();
            store.record_traffic(5, 1).await.unwrap();
            assert_eq!(store.totals(), (15, 21));
        }
    }
}
