//! Wire types and framing shared by both ends of a multiplexed tunnel link:
//! the broker acting as client towards the central server, and the broker
//! acting as server towards agents.
//!
//! The signaling stream protocol is "open one stream, write one framed JSON
//! object, read one framed JSON object, close": see [`write_frame`] and
//! [`read_frame`].

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Synthetic hostname used by [`aegis-dialer`](../aegis_dialer) to route to the
/// central-server muxer. Never resolved by DNS.
pub const SERVER_HOST: &str = "server.aegis.internal";

/// Suffix appended to an agent's hex identity to build its synthetic hostname.
pub const AGENT_HOST_SUFFIX: &str = "agent.aegis.internal";

/// Builds the synthetic hostname for an agent identified by `identity_hex`.
#[must_use]
pub fn agent_hostname(identity_hex: &str) -> String {
    format!("{identity_hex}.{AGENT_HOST_SUFFIX}")
}

/// Fields common to both handshake directions, plus the `machine_id`,
/// `username`, and `uid` carried only when an agent authenticates to a
/// broker (`None` on the broker-to-server leg).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthRequest {
    pub secret: String,
    pub semver: String,
    pub inet: String,
    pub goos: String,
    pub goarch: String,
    pub pid: u32,
    pub args: Vec<String>,
    pub hostname: String,
    pub workdir: String,
    pub executable: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub machine_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub uid: Option<u32>,
}

impl AuthRequest {
    /// The validation CORE always performs, regardless of any caller-supplied
    /// validator: a non-empty secret and hostname. Agent requests additionally
    /// require a non-empty `machine_id`.
    pub fn validate_base(&self) -> Result<(), ValidationError> {
        if self.secret.is_empty() {
            return Err(ValidationError::MissingField("secret"));
        }
        if self.hostname.is_empty() {
            return Err(ValidationError::MissingField("hostname"));
        }
        Ok(())
    }

    pub fn validate_agent(&self) -> Result<(), ValidationError> {
        self.validate_base()?;
        match self.machine_id.as_deref() {
            Some(id) if !id.is_empty() => Ok(()),
            _ => Err(ValidationError::MissingField("machine_id")),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ValidationError {
    #[error("missing or empty required field `{0}`")]
    MissingField(&'static str),
}

/// Config payload returned to the broker on a successful broker-to-server
/// handshake only (`None` on the agent-to-broker leg).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    pub uri: String,
}

/// HTTP-style status code semantics: `2xx` is success. `202` is used for the
/// agent-to-broker leg, `200` for the broker-to-server leg.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthResponse {
    pub code: u16,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub config: Option<AuthConfig>,
}

impl AuthResponse {
    #[must_use]
    pub fn ok(code: u16) -> Self {
        Self {
            code,
            message: None,
            config: None,
        }
    }

    #[must_use]
    pub fn ok_with_config(code: u16, config: AuthConfig) -> Self {
        Self {
            code,
            message: None,
            config: Some(config),
        }
    }

    #[must_use]
    pub fn error(code: u16, message: impl Into<String>) -> Self {
        Self {
            code,
            message: Some(message.into()),
            config: None,
        }
    }

    #[must_use]
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.code)
    }
}

/// Well-known response codes for the agent-to-broker leg (§6).
pub mod agent_status {
    pub const ACCEPTED: u16 = 202;
    pub const VALIDATION: u16 = 400;
    pub const CONFLICT: u16 = 409;
    pub const SERVER_ERROR: u16 = 500;
}

const MAX_FRAME_LEN: u32 = 1024 * 1024; // 1 MiB, generous headroom over a JSON auth payload.

#[derive(Debug, thiserror::Error)]
pub enum FramingError {
    #[error("frame of {0} bytes exceeds the {MAX_FRAME_LEN} byte limit")]
    TooLarge(u32),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Writes `value` as a 4-byte big-endian length prefix followed by its JSON
/// encoding. Does not flush; callers decide when to flush/close.
pub async fn write_frame<W, T>(writer: &mut W, value: &T) -> Result<(), FramingError>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let body = serde_json::to_vec(value)?;
    let len = u32::try_from(body.len()).map_err(|_| FramingError::TooLarge(u32::MAX))?;
    if len > MAX_FRAME_LEN {
        return Err(FramingError::TooLarge(len));
    }
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(&body).await?;
    writer.flush().await?;
    Ok(())
}

/// Reads a single length-prefixed JSON frame written by [`write_frame`].
pub async fn read_frame<R, T>(reader: &mut R) -> Result<T, FramingError>
where
    R: AsyncRead + Unpin,
    T: for<'de> Deserialize<'de>,
{
    let mut len_bytes = [0u8; 4];
    reader.read_exact(&mut len_bytes).await?;
    let len = u32::from_be_bytes(len_bytes);
    if len > MAX_FRAME_LEN {
        return Err(FramingError::TooLarge(len));
    }
    let mut body = vec![0u8; len as usize];
    reader.read_exact(&mut body).await?;
    let value = serde_json::from_slice(&body)?;
    Ok(value)
}
