use serde::{Deserialize, Serialize};

use crate::xray::outbound::{OutboundSettings, StreamSettings};

pub const PROTOCOL_VLESS: &str = "vless";

/// Tag written on every outbound produced from a subscription entry.
pub const DEFAULT_SERVER_TAG: &str = "vless-reality";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DomainError {
    InvalidPort { port: u32 },
}

impl std::fmt::Display for DomainError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidPort { port } => write!(f, "invalid port: {port}"),
        }
    }
}

impl std::error::Error for DomainError {}

pub fn validate_port(port: u32) -> Result<u16, DomainError> {
    if !(1..=u32::from(u16::MAX)).contains(&port) {
        return Err(DomainError::InvalidPort { port });
    }
    Ok(port as u16)
}

/// Stable identifier of a candidate: `1.2.3.4:443` becomes `1_2_3_4_443`.
pub fn server_id(address: &str, port: u16) -> String {
    let host: String = address
        .chars()
        .map(|c| if c == '.' || c == ':' { '_' } else { c })
        .collect();
    format!("{host}_{port}")
}

/// One upstream the daemon can be pointed at.
///
/// `settings` and `stream_settings` are rendered once at parse time so the switcher never
/// needs the original URI again. Both are optional on disk because older snapshots may
/// carry only the identity fields.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Server {
    pub id: String,
    pub name: String,
    pub address: String,
    pub port: u16,
    pub protocol: String,
    #[serde(default = "default_server_tag")]
    pub tag: String,
    #[serde(default)]
    pub vless_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub settings: Option<OutboundSettings>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream_settings: Option<StreamSettings>,
}

fn default_server_tag() -> String {
    DEFAULT_SERVER_TAG.to_string()
}

impl Server {
    /// Address and port of the first `vnext` entry, if the outbound was rendered.
    pub fn vnext_endpoint(&self) -> Option<(&str, u16)> {
        let vnext = self.settings.as_ref()?.vnext.first()?;
        Some((vnext.address.as_str(), vnext.port))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeErrorKind {
    Timeout,
    Refused,
    Unreachable,
    Cancelled,
    Other,
}

impl ProbeErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Timeout => "timeout",
            Self::Refused => "refused",
            Self::Unreachable => "unreachable",
            Self::Cancelled => "cancelled",
            Self::Other => "other",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeError {
    pub kind: ProbeErrorKind,
    pub message: String,
}

impl ProbeError {
    pub fn new(kind: ProbeErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn from_io(err: &std::io::Error) -> Self {
        let kind = match err.kind() {
            std::io::ErrorKind::ConnectionRefused => ProbeErrorKind::Refused,
            std::io::ErrorKind::TimedOut => ProbeErrorKind::Timeout,
            std::io::ErrorKind::HostUnreachable | std::io::ErrorKind::NetworkUnreachable => {
                ProbeErrorKind::Unreachable
            }
            _ => ProbeErrorKind::Other,
        };
        Self::new(kind, format!("connection failed: {err}"))
    }
}

impl std::fmt::Display for ProbeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.message, self.kind.as_str())
    }
}

impl std::error::Error for ProbeError {}

/// Outcome of one reachability probe. Unavailable results always carry `latency_ms == 0`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PingResult {
    pub server: Server,
    pub available: bool,
    pub latency_ms: u64,
    pub error: Option<ProbeError>,
}

impl PingResult {
    pub fn ok(server: Server, latency_ms: u64) -> Self {
        Self {
            server,
            available: true,
            latency_ms,
            error: None,
        }
    }

    pub fn failed(server: Server, error: ProbeError) -> Self {
        Self {
            server,
            available: false,
            latency_ms: 0,
            error: Some(error),
        }
    }
}
