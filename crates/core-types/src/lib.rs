//! Shared identifiers and the error taxonomy used across the Magi gateway
//! crates. Ids are opaque strings on the wire; `SessionId` is structured so
//! the owning page is recoverable without a lookup table.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Unique identifier for a fleet browser.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BrowserId(pub String);

impl BrowserId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for BrowserId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for BrowserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Unique identifier for a page. Doubles as the CDP `targetId`.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PageId(pub String);

impl PageId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for PageId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for PageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Unique identifier for one accepted client WebSocket connection.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(pub String);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

const SESSION_INFIX: &str = "-session-";

/// Identifier for a multiplexed debugger session.
///
/// Wire form is `<pageId>-session-<seq>`, so the owning page can always be
/// recovered from a bare session id even when the routing table has not seen
/// it yet. The struct form is what the core passes around; re-parsing only
/// happens at the protocol boundary.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct SessionId {
    pub page: PageId,
    pub seq: u64,
}

impl SessionId {
    pub fn new(page: PageId, seq: u64) -> Self {
        Self { page, seq }
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{}", self.page.0, SESSION_INFIX, self.seq)
    }
}

impl FromStr for SessionId {
    type Err = GatewayError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let (page, seq) = raw
            .rsplit_once(SESSION_INFIX)
            .ok_or_else(|| GatewayError::ClientProtocol(format!("malformed session id: {raw}")))?;
        let seq = seq
            .parse::<u64>()
            .map_err(|_| GatewayError::ClientProtocol(format!("malformed session id: {raw}")))?;
        Ok(Self {
            page: PageId(page.to_string()),
            seq,
        })
    }
}

impl Serialize for SessionId {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for SessionId {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// JSON-RPC error codes the gateway emits.
pub mod cdp_codes {
    pub const SERVER_ERROR: i64 = -32000;
    pub const SESSION_NOT_FOUND: i64 = -32001;
    pub const METHOD_NOT_FOUND: i64 = -32601;
    pub const INVALID_PARAMS: i64 = -32602;
}

/// Error taxonomy shared by the gateway crates.
#[derive(Clone, Debug, Error)]
pub enum GatewayError {
    #[error("invalid request: {0}")]
    ClientProtocol(String),
    #[error("method not found: {0}")]
    MethodNotFound(String),
    #[error("Target not found: {0}")]
    TargetNotFound(String),
    #[error("Session not found: {0}")]
    SessionNotFound(String),
    #[error("{0}")]
    SurfaceUnavailable(String),
    #[error("operation timed out: {0}")]
    Timeout(String),
    #[error("internal invariant failure: {0}")]
    Internal(String),
}

impl GatewayError {
    /// Numeric CDP error code for an error response frame.
    pub fn cdp_code(&self) -> i64 {
        match self {
            GatewayError::ClientProtocol(_) => cdp_codes::INVALID_PARAMS,
            GatewayError::MethodNotFound(_) => cdp_codes::METHOD_NOT_FOUND,
            GatewayError::SessionNotFound(_) => cdp_codes::SESSION_NOT_FOUND,
            GatewayError::TargetNotFound(_)
            | GatewayError::SurfaceUnavailable(_)
            | GatewayError::Timeout(_)
            | GatewayError::Internal(_) => cdp_codes::SERVER_ERROR,
        }
    }

    pub fn internal(detail: impl Into<String>) -> Self {
        GatewayError::Internal(detail.into())
    }
}

pub type GatewayResult<T> = Result<T, GatewayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_id_round_trips_through_wire_form() {
        let id = SessionId::new(PageId("p1".into()), 7);
        assert_eq!(id.to_string(), "p1-session-7");
        let parsed: SessionId = "p1-session-7".parse().unwrap();
        assert_eq!(parsed, id);
    }

    #[test]
    fn session_id_survives_pages_with_dashes() {
        let id = SessionId::new(PageId("tab-session-x".into()), 3);
        let parsed: SessionId = id.to_string().parse().unwrap();
        assert_eq!(parsed.page.0, "tab-session-x");
        assert_eq!(parsed.seq, 3);
    }

    #[test]
    fn malformed_session_ids_are_rejected() {
        assert!("p1".parse::<SessionId>().is_err());
        assert!("p1-session-".parse::<SessionId>().is_err());
        assert!("p1-session-abc".parse::<SessionId>().is_err());
    }

    #[test]
    fn error_codes_match_taxonomy() {
        assert_eq!(
            GatewayError::MethodNotFound("X.y".into()).cdp_code(),
            cdp_codes::METHOD_NOT_FOUND
        );
        assert_eq!(
            GatewayError::TargetNotFound("p9".into()).cdp_code(),
            cdp_codes::SERVER_ERROR
        );
        assert_eq!(
            GatewayError::Timeout("attach".into()).cdp_code(),
            cdp_codes::SERVER_ERROR
        );
    }
}
