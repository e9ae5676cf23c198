//! Decoding of Patroni member records.
//!
//! Each child of `<scope>/members` holds a JSON document written by Patroni:
//!
//! ```json
//! {"conn_url":"postgres://10.0.0.1:5433/postgres","api_url":"http://10.0.0.1:8009/patroni",
//!  "state":"running","role":"master"}
//! ```
//!
//! Unknown fields are ignored. Both URLs must carry an explicit `host:port`;
//! a scheme's default port is not assumed.

use std::fmt;

use serde::Deserialize;
use thiserror::Error;
use url::Url;

/// Errors produced while decoding a member record.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("malformed member record: {reason}")]
    Malformed { reason: String },

    #[error("cannot parse {field} '{url}': {reason}")]
    InvalidUrl {
        field: &'static str,
        url: String,
        reason: String,
    },

    #[error("{field} '{url}' has no host:port")]
    MissingHostPort { field: &'static str, url: String },
}

impl DecodeError {
    fn invalid_url(field: &'static str, url: &str, reason: impl Into<String>) -> Self {
        Self::InvalidUrl {
            field,
            url: url.to_string(),
            reason: reason.into(),
        }
    }

    fn missing_host_port(field: &'static str, url: &str) -> Self {
        Self::MissingHostPort {
            field,
            url: url.to_string(),
        }
    }
}

/// A network address with an explicit port.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HostPort {
    pub host: String,
    pub port: u16,
}

impl HostPort {
    fn from_url(field: &'static str, raw: &str) -> Result<Self, DecodeError> {
        let url = Url::parse(raw).map_err(|e| DecodeError::invalid_url(field, raw, e.to_string()))?;
        let host = url
            .host_str()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| DecodeError::missing_host_port(field, raw))?;
        let port = url
            .port()
            .or_else(|| written_default_port(&url, raw))
            .ok_or_else(|| DecodeError::missing_host_port(field, raw))?;
        Ok(Self {
            host: host.to_string(),
            port,
        })
    }
}

/// `Url` drops a port equal to the scheme default, so `http://h:80` reports no
/// port. Recover it when the authority spells it out.
fn written_default_port(url: &Url, raw: &str) -> Option<u16> {
    let default = url.port_or_known_default()?;
    let authority = raw.split_once("://")?.1;
    let authority = authority
        .split(['/', '?', '#'])
        .next()
        .unwrap_or(authority);
    let host_port = authority.rsplit_once('@').map_or(authority, |(_, hp)| hp);
    let (_, port) = host_port.rsplit_once(':')?;
    (port.parse::<u16>().ok()? == default).then_some(default)
}

impl fmt::Display for HostPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Run state reported by a member.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MemberState {
    Running,
    /// Any other Patroni state (`stopped`, `starting`, `restarting`, ...).
    Other(String),
}

impl MemberState {
    fn parse(raw: &str) -> Self {
        if raw == "running" {
            Self::Running
        } else {
            Self::Other(raw.to_string())
        }
    }
}

/// Replication role reported by a member.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Primary,
    Replica,
}

impl Role {
    /// Patroni has used both `master` and `primary` for the leader role.
    /// Everything else (`replica`, `standby_leader`, ...) is fronted as a replica.
    fn parse(raw: &str) -> Self {
        match raw {
            "master" | "primary" => Self::Primary,
            _ => Self::Replica,
        }
    }
}

/// Decoded form of one member's value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemberRecord {
    pub connection_address: HostPort,
    pub health_check_address: HostPort,
    pub state: MemberState,
    pub role: Role,
}

#[derive(Debug, Deserialize)]
struct WireRecord {
    conn_url: String,
    api_url: String,
    state: String,
    role: String,
}

/// Decode a raw member payload.
pub fn decode(raw: &[u8]) -> Result<MemberRecord, DecodeError> {
    let wire: WireRecord = serde_json::from_slice(raw).map_err(|e| DecodeError::Malformed {
        reason: e.to_string(),
    })?;

    Ok(MemberRecord {
        connection_address: HostPort::from_url("conn_url", &wire.conn_url)?,
        health_check_address: HostPort::from_url("api_url", &wire.api_url)?,
        state: MemberState::parse(&wire.state),
        role: Role::parse(&wire.role),
    })
}
