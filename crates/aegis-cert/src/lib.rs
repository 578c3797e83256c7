//! [`CertificateSource`]: a [`rustls::server::ResolvesServerCert`] that
//! serves configured certificates by SNI (falling back to a wildcard match
//! on the first label) and, failing that, a self-signed certificate
//! generated once and cached for the process lifetime.
//!
//! The self-signed fallback exists so the broker's public listener always
//! has *something* to present, even before any certificate has been
//! provisioned through the control plane.

#[macro_use]
extern crate tracing;

use std::collections::HashMap;
use std::fmt;
use std::net::Ipv4Addr;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use rustls_pki_types::{CertificateDer, PrivatePkcs8KeyDer, PrivateKeyDer};
use time::{Duration, OffsetDateTime};

const SELF_SIGNED_CN: &str = "aegis";
const SELF_SIGNED_DNS_SAN: &str = "server.aegis.internal";

#[derive(Debug, thiserror::Error)]
pub enum CertError {
    #[error("certificate generation failed: {0}")]
    Generate(#[from] rcgen::Error),
    #[error("no signing scheme supports this key")]
    UnsupportedKey,
}

struct ConfiguredCert {
    key: Arc<CertifiedKey>,
    not_before: OffsetDateTime,
    not_after: OffsetDateTime,
}

/// An entry to install via [`CertificateSource::set_configured`]: one
/// certified key, indexed under every DNS name and IP address string it
/// covers.
pub struct ConfiguredCertEntry {
    pub names: Vec<String>,
    pub key: Arc<CertifiedKey>,
    pub not_before: OffsetDateTime,
    pub not_after: OffsetDateTime,
}

pub struct CertificateSource {
    configured: RwLock<HashMap<String, Vec<ConfiguredCert>>>,
    self_signed: RwLock<Option<Arc<CertifiedKey>>>,
    generate_lock: Mutex<()>,
}

impl fmt::Debug for CertificateSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CertificateSource")
            .field("configured_names", &self.configured.read().len())
            .finish()
    }
}

impl Default for CertificateSource {
    fn default() -> Self {
        Self::new()
    }
}

impl CertificateSource {
    #[must_use]
    pub fn new() -> Self {
        Self {
            configured: RwLock::new(HashMap::new()),
            self_signed: RwLock::new(None),
            generate_lock: Mutex::new(()),
        }
    }

    /// Replaces the full set of configured certificates. Entries sharing a
    /// name are tried in order, preferring the first one currently valid.
    pub fn set_configured(&self, entries: Vec<ConfiguredCertEntry>) {
        let mut table: HashMap<String, Vec<ConfiguredCert>> = HashMap::new();
        for entry in entries {
            for name in entry.names {
                table.entry(name.to_ascii_lowercase()).or_default().push(ConfiguredCert {
                    key: Arc::clone(&entry.key),
                    not_before: entry.not_before,
                    not_after: entry.not_after,
                });
            }
        }
        *self.configured.write() = table;
    }

    /// Drops every configured certificate; subsequent lookups fall back to
    /// the self-signed certificate until `set_configured` is called again.
    pub fn forget_configured(&self) {
        self.configured.write().clear();
    }

    /// Whether a configured (non-self-signed) certificate currently matches
    /// `server_name`, exact or wildcard. Exposed for callers that refresh
    /// the configured set and want to confirm the refresh took effect.
    #[must_use]
    pub fn has_configured(&self, server_name: &str) -> bool {
        self.lookup_configured(server_name).is_some()
    }

    fn lookup_configured(&self, server_name: &str) -> Option<Arc<CertifiedKey>> {
        let table = self.configured.read();
        let now = OffsetDateTime::now_utc();
        let lower = server_name.to_ascii_lowercase();

        if let Some(key) = pick_valid(&table, &lower, now) {
            return Some(key);
        }

        let mut labels: Vec<&str> = lower.split('.').collect();
        if labels.len() > 1 {
            labels[0] = "*";
            let wildcard = labels.join(".");
            return pick_valid(&table, &wildcard, now);
        }

        None
    }

    /// Returns the cached self-signed certificate, generating it on first
    /// use. Concurrent first callers serialize on `generate_lock`; only one
    /// of them actually calls into `rcgen`.
    fn self_signed_certificate(&self) -> Result<Arc<CertifiedKey>, CertError> {
        if let Some(key) = self.self_signed.read().clone() {
            return Ok(key);
        }

        let _guard = self.generate_lock.lock();
        if let Some(key) = self.self_signed.read().clone() {
            return Ok(key);
        }

        let key = Arc::new(generate_self_signed()?);
        *self.self_signed.write() = Some(Arc::clone(&key));
        Ok(key)
    }
}

fn pick_valid(table: &HashMap<String, Vec<ConfiguredCert>>, name: &str, now: OffsetDateTime) -> Option<Arc<CertifiedKey>> {
    let candidates = table.get(name)?;
    candidates
        .iter()
        .find(|candidate| candidate.not_before <= now && now <= candidate.not_after)
        .or_else(|| candidates.last())
        .map(|candidate| Arc::clone(&candidate.key))
}

fn generate_self_signed() -> Result<CertifiedKey, CertError> {
    let key_pair = rcgen::KeyPair::generate_for(&rcgen::PKCS_ECDSA_P256_SHA256)?;

    let mut params = rcgen::CertificateParams::new(vec![SELF_SIGNED_DNS_SAN.to_owned()])?;
    let mut dn = rcgen::DistinguishedName::new();
    dn.push(rcgen::DnType::CommonName, SELF_SIGNED_CN);
    dn.push(rcgen::DnType::OrganizationName, SELF_SIGNED_CN);
    params.distinguished_name = dn;
    params.not_before = OffsetDateTime::now_utc() - Duration::hours(1);
    params.not_after = OffsetDateTime::now_utc() + Duration::days(365);
    params
        .subject_alt_names
        .push(rcgen::SanType::IpAddress(Ipv4Addr::LOCALHOST.into()));

    let cert = params.self_signed(&key_pair)?;
    let cert_der: CertificateDer<'static> = cert.der().clone();
    let key_der = PrivatePkcs8KeyDer::from(key_pair.serialize_der());

    let signing_key = rustls::crypto::ring::sign::any_ecdsa_type(&PrivateKeyDer::Pkcs8(key_der))
        .map_err(|_| CertError::UnsupportedKey)?;

    Ok(CertifiedKey::new(vec![cert_der], signing_key))
}

impl ResolvesServerCert for CertificateSource {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        if let Some(server_name) = client_hello.server_name() {
            if let Some(key) = self.lookup_configured(server_name) {
                return Some(key);
            }
            debug!(server_name, "no configured certificate matched SNI, falling back to self-signed");
        }

        match self.self_signed_certificate() {
            Ok(key) => Some(key),
            Err(error) => {
                warn!(%error, "failed to generate self-signed fallback certificate");
                None
            }
        }
    }
}
