use std::fmt;
use std::sync::Arc;

/// Stable per-agent identity, opaque to this crate. Typically the hex
/// encoding of a database-assigned object id, but nothing here depends on
/// that; only its bytes and their hex projection matter.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct AgentId(Arc<[u8]>);

impl AgentId {
    #[must_use]
    pub fn new(bytes: impl Into<Arc<[u8]>>) -> Self {
        Self(bytes.into())
    }

    pub fn from_hex(hex_str: &str) -> Result<Self, hex::FromHexError> {
        Ok(Self(hex::decode(hex_str)?.into()))
    }

    #[must_use]
    pub fn to_hex(&self) -> String {
        hex::encode(&self.0)
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// `<hex>.<domain>`, the synthetic hostname this agent is dialed through.
    /// `domain` is ordinarily [`aegis_tunnel_proto::AGENT_HOST_SUFFIX`], kept
    /// as a parameter so a hub can be stood up under a different suffix in
    /// tests without touching the shared constant.
    #[must_use]
    pub fn hostname(&self, domain: &str) -> String {
        format!("{}.{domain}", self.to_hex())
    }
}

impl fmt::Debug for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AgentId({})", self.to_hex())
    }
}

impl fmt::Display for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}
