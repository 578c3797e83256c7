//! Loads configured certificates from a [`CertificateStore`] into a
//! [`CertificateSource`], lazily on startup and again on every tick so a
//! certificate added or rotated through the control plane eventually
//! reaches the listeners without a restart.
//!
//! Grounded on the teacher's `devolutions-agent/src/remote_desktop/tls.rs`
//! for the `rustls_pemfile` parsing shape, generalized from one file pair
//! to however many [`StoredCertificate`] entries the store currently has
//! enabled.

use std::io::BufReader;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use aegis_cert::{CertificateSource, ConfiguredCertEntry};
use aegis_task::ShutdownSignal;
use time::OffsetDateTime;

use crate::storage::{CertificateStore, StoredCertificate};

#[derive(Debug, thiserror::Error)]
enum ParseError {
    #[error("no certificate found in PEM")]
    MissingCertificate,
    #[error("no private key found in PEM")]
    MissingPrivateKey,
    #[error("io error reading PEM: {0}")]
    Io(#[from] std::io::Error),
    #[error("no signing scheme supports this key")]
    UnsupportedKey,
}

/// Runs until `shutdown` fires, refreshing `cert_source` from `store` every
/// `interval`. The first load happens immediately so a listener started
/// right after this task never races an empty configured-cert table.
pub async fn run(cert_source: Arc<CertificateSource>, store: Arc<dyn CertificateStore>, interval: Duration, mut shutdown: ShutdownSignal) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        refresh(&cert_source, store.as_ref()).await;

        tokio::select! {
            _ = ticker.tick() => {}
            () = shutdown.wait() => {
                info!("certificate refresh shutting down");
                return;
            }
        }
    }
}

async fn refresh(cert_source: &CertificateSource, store: &(dyn CertificateStore)) {
    let certificates = match store.enabled_certificates().await {
        Ok(certificates) => certificates,
        Err(error) => {
            warn!(%error, "failed to load enabled certificates, keeping the previous configured set");
            return;
        }
    };

    if certificates.is_empty() {
        cert_source.forget_configured();
        return;
    }

    let mut entries = Vec::with_capacity(certificates.len());
    for certificate in certificates {
        match parse_entry(&certificate) {
            Ok(entry) => entries.push(entry),
            Err(error) => warn!(%error, names = ?certificate.names, "skipping unparsable configured certificate"),
        }
    }

    if entries.is_empty() {
        cert_source.forget_configured();
        return;
    }

    cert_source.set_configured(entries);
}

fn parse_entry(certificate: &StoredCertificate) -> Result<ConfiguredCertEntry, ParseError> {
    let chain: Vec<_> = rustls_pemfile::certs(&mut BufReader::new(certificate.public_key_pem.as_bytes()))
        .collect::<Result<_, _>>()?;
    if chain.is_empty() {
        return Err(ParseError::MissingCertificate);
    }

    let key = rustls_pemfile::private_key(&mut BufReader::new(certificate.private_key_pem.as_bytes()))?
        .ok_or(ParseError::MissingPrivateKey)?;

    let signing_key = rustls::crypto::ring::sign::any_supported_type(&key).map_err(|_| ParseError::UnsupportedKey)?;
    let key = rustls::sign::CertifiedKey::new(chain, signing_key);

    Ok(ConfiguredCertEntry {
        names: certificate.names.clone(),
        key: Arc::new(key),
        not_before: system_time_to_offset(certificate.not_before),
        not_after: system_time_to_offset(certificate.not_after),
    })
}

fn system_time_to_offset(time: SystemTime) -> OffsetDateTime {
    OffsetDateTime::from(time)
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use crate::storage::memory::MemoryCertificateStore;
    use std::time::Duration as StdDuration;

    fn self_signed_pem() -> (String, String) {
        let key_pair = rcgen::KeyPair::generate_for(&rcgen::PKCS_ECDSA_P256_SHA256).unwrap();
        let params = rcgen::CertificateParams::new(vec!["example.test".to_owned()]).unwrap();
        let cert = params.self_signed(&key_pair).unwrap();
        (cert.pem(), key_pair.serialize_pem())
    }

    #[tokio::test]
    async fn refresh_populates_the_source_from_the_store() {
        let (public_key_pem, private_key_pem) = self_signed_pem();
        let store = Arc::new(MemoryCertificateStore::new());
        store.insert(StoredCertificate {
            names: vec!["example.test".to_owned()],
            public_key_pem,
            private_key_pem,
            not_before: SystemTime::now() - StdDuration::from_secs(3600),
            not_after: SystemTime::now() + StdDuration::from_secs(3600),
        });

        let cert_source = CertificateSource::new();
        refresh(&cert_source, store.as_ref()).await;

        assert!(cert_source.has_configured("example.test"));
    }

    #[tokio::test]
    async fn refresh_forgets_configured_certs_once_the_store_is_empty() {
        let (public_key_pem, private_key_pem) = self_signed_pem();
        let store = Arc::new(MemoryCertificateStore::new());
        store.insert(StoredCertificate {
            names: vec!["example.test".to_owned()],
            public_key_pem,
            private_key_pem,
            not_before: SystemTime::now() - StdDuration::from_secs(3600),
            not_after: SystemTime::now() + StdDuration::from_secs(3600),
        });

        let cert_source = CertificateSource::new();
        refresh(&cert_source, store.as_ref()).await;
        assert!(cert_source.has_configured("example.test"));

        store.clear();
        refresh(&cert_source, store.as_ref()).await;
        assert!(!cert_source.has_configured("example.test"));
    }
}
