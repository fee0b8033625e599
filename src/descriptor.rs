//! Parser for `vless://` subscription entries.
//!
//! A descriptor is the validated, sanitized form of one URI. Every string that ends up in the
//! daemon config passes through [`sanitize`] first: the config is consumed by a process we
//! restart, so control characters and shell metacharacters never reach it.

use std::{
    collections::BTreeMap,
    net::{IpAddr, Ipv4Addr},
    sync::LazyLock,
};

use percent_encoding::percent_decode_str;
use regex::Regex;
use url::{Host, Url};

use crate::{
    domain::{DEFAULT_SERVER_TAG, PROTOCOL_VLESS, Server, server_id, validate_port},
    xray::outbound::{
        OutboundSettings, REALITY_SPIDER_X, RealitySettings, StreamSettings, TlsSettings,
        VLESS_ENCRYPTION_NONE, Vnext, VnextUser, WsSettings,
    },
};

pub const VLESS_SCHEME: &str = "vless";
pub const MAX_URI_LEN: usize = 2048;
pub const DEFAULT_PORT: u16 = 443;

const NAME_MAX_CHARS: usize = 256;
const SMALL_FIELD_MAX_CHARS: usize = 32;
const KEY_FIELD_MAX_CHARS: usize = 256;

const HOSTNAME_MAX_LEN: usize = 253;
const HOSTNAME_LABEL_MAX_LEN: usize = 63;

const SHELL_METACHARACTERS: &[char] = &['\\', '$', '`', ';', '&', '|'];

static UUID_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^[0-9a-fA-F]{8}-?[0-9a-fA-F]{4}-?[0-9a-fA-F]{4}-?[0-9a-fA-F]{4}-?[0-9a-fA-F]{12}$",
    )
    .expect("uuid regex")
});

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DescriptorError {
    InvalidInput { reason: String },
    InvalidUuid { uuid: String },
    InvalidAddress { address: String },
    InvalidPort { reason: String },
    InvalidQuery { reason: String },
}

impl std::fmt::Display for DescriptorError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidInput { reason } => write!(f, "invalid input: {reason}"),
            Self::InvalidUuid { uuid } => write!(f, "invalid uuid: {uuid:?}"),
            Self::InvalidAddress { address } => write!(f, "invalid address: {address:?}"),
            Self::InvalidPort { reason } => write!(f, "invalid port: {reason}"),
            Self::InvalidQuery { reason } => write!(f, "invalid query: {reason}"),
        }
    }
}

impl std::error::Error for DescriptorError {}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RealityParams {
    pub server_name: String,
    pub public_key: String,
    pub short_id: String,
    pub fingerprint: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsParams {
    pub server_name: String,
    pub fingerprint: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Security {
    None,
    Reality(RealityParams),
    Tls(TlsParams),
}

impl Security {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Reality(_) => "reality",
            Self::Tls(_) => "tls",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Descriptor {
    pub uuid: String,
    pub address: String,
    pub port: u16,
    /// Value of the `type` query parameter; empty when absent.
    pub transport: String,
    pub security: Security,
    pub flow: String,
    pub ws_path: String,
    pub ws_host: String,
    pub name: String,
}

impl Descriptor {
    pub fn parse(raw: &str) -> Result<Self, DescriptorError> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(DescriptorError::InvalidInput {
                reason: "empty uri".to_string(),
            });
        }
        if raw.len() > MAX_URI_LEN {
            return Err(DescriptorError::InvalidInput {
                reason: format!("uri longer than {MAX_URI_LEN} bytes"),
            });
        }

        let url = Url::parse(raw).map_err(map_url_error)?;
        if url.scheme() != VLESS_SCHEME {
            return Err(DescriptorError::InvalidInput {
                reason: format!("unsupported scheme: {}", url.scheme()),
            });
        }

        let uuid = percent_decode_str(url.username())
            .decode_utf8_lossy()
            .to_string();
        validate_uuid(&uuid)?;

        let address = match url.host() {
            Some(Host::Ipv6(ip)) => ip.to_string(),
            Some(Host::Ipv4(ip)) => ip.to_string(),
            Some(Host::Domain(domain)) => domain.to_string(),
            None => String::new(),
        };
        validate_address(&address)?;

        let port = match url.port() {
            Some(port) => validate_port(u32::from(port)).map_err(|e| {
                DescriptorError::InvalidPort {
                    reason: e.to_string(),
                }
            })?,
            None => DEFAULT_PORT,
        };

        let query = parse_query(url.query().unwrap_or_default())?;
        let param = |key: &str, max_chars: usize| {
            query
                .get(key)
                .map(|v| sanitize(v, max_chars))
                .unwrap_or_default()
        };

        let server_name = param("sni", KEY_FIELD_MAX_CHARS);
        let fingerprint = param("fp", SMALL_FIELD_MAX_CHARS);
        let security = match param("security", SMALL_FIELD_MAX_CHARS).as_str() {
            "" | "none" => Security::None,
            "reality" => Security::Reality(RealityParams {
                server_name,
                public_key: param("pbk", KEY_FIELD_MAX_CHARS),
                short_id: param("sid", SMALL_FIELD_MAX_CHARS),
                fingerprint,
            }),
            "tls" => Security::Tls(TlsParams {
                server_name,
                fingerprint,
            }),
            other => {
                return Err(DescriptorError::InvalidQuery {
                    reason: format!("unsupported security: {other}"),
                });
            }
        };

        let fragment = url.fragment().unwrap_or_default();
        let name = sanitize(
            &percent_decode_str(fragment).decode_utf8_lossy(),
            NAME_MAX_CHARS,
        );
        let name = if name.is_empty() {
            format!("{address}:{port}")
        } else {
            name
        };

        Ok(Self {
            uuid,
            address,
            port,
            transport: param("type", SMALL_FIELD_MAX_CHARS),
            security,
            flow: param("flow", SMALL_FIELD_MAX_CHARS),
            ws_path: param("path", KEY_FIELD_MAX_CHARS),
            ws_host: param("host", KEY_FIELD_MAX_CHARS),
            name,
        })
    }

    pub fn id(&self) -> String {
        server_id(&self.address, self.port)
    }

    pub fn to_outbound_settings(&self) -> OutboundSettings {
        OutboundSettings {
            vnext: vec![Vnext {
                address: self.address.clone(),
                port: self.port,
                users: vec![VnextUser {
                    id: self.uuid.clone(),
                    encryption: VLESS_ENCRYPTION_NONE.to_string(),
                    level: 0,
                    flow: non_empty(&self.flow),
                }],
            }],
        }
    }

    /// `None` for plain outbounds (no `security`, or `security=none`).
    pub fn to_stream_settings(&self) -> Option<StreamSettings> {
        let (reality_settings, tls_settings) = match &self.security {
            Security::None => return None,
            Security::Reality(p) => (
                Some(RealitySettings {
                    spider_x: REALITY_SPIDER_X.to_string(),
                    public_key: non_empty(&p.public_key),
                    server_name: non_empty(&p.server_name),
                    short_id: non_empty(&p.short_id),
                    fingerprint: non_empty(&p.fingerprint),
                }),
                None,
            ),
            Security::Tls(p) => (
                None,
                Some(TlsSettings {
                    server_name: non_empty(&p.server_name),
                    fingerprint: non_empty(&p.fingerprint),
                }),
            ),
        };

        let network = if self.transport.is_empty() {
            "tcp".to_string()
        } else {
            self.transport.clone()
        };

        let ws_settings = (network == "ws"
            && (!self.ws_path.is_empty() || !self.ws_host.is_empty()))
        .then(|| WsSettings {
            path: non_empty(&self.ws_path),
            headers: non_empty(&self.ws_host)
                .map(|host| BTreeMap::from([("Host".to_string(), host)]))
                .unwrap_or_default(),
        });

        Some(StreamSettings {
            network,
            security: self.security.as_str().to_string(),
            reality_settings,
            tls_settings,
            ws_settings,
        })
    }

    /// Renders the candidate the rest of the system works with.
    pub fn to_server(&self, raw_uri: &str) -> Server {
        Server {
            id: self.id(),
            name: self.name.clone(),
            address: self.address.clone(),
            port: self.port,
            protocol: PROTOCOL_VLESS.to_string(),
            tag: DEFAULT_SERVER_TAG.to_string(),
            vless_url: raw_uri.trim().to_string(),
            settings: Some(self.to_outbound_settings()),
            stream_settings: self.to_stream_settings(),
        }
    }
}

/// Drops control characters and shell metacharacters, trims, then caps the length in chars.
pub fn sanitize(value: &str, max_chars: usize) -> String {
    let cleaned: String = value
        .chars()
        .filter(|c| !c.is_control() && !SHELL_METACHARACTERS.contains(c))
        .collect();
    cleaned.trim().chars().take(max_chars).collect()
}

pub fn validate_uuid(uuid: &str) -> Result<(), DescriptorError> {
    let len_ok = uuid.len() == 32 || uuid.len() == 36;
    if !len_ok || !UUID_RE.is_match(uuid) {
        return Err(DescriptorError::InvalidUuid {
            uuid: uuid.chars().take(64).collect(),
        });
    }
    Ok(())
}

pub fn validate_address(address: &str) -> Result<(), DescriptorError> {
    if address.parse::<IpAddr>().is_ok() || is_valid_hostname(address) {
        return Ok(());
    }
    Err(DescriptorError::InvalidAddress {
        address: address.chars().take(HOSTNAME_MAX_LEN + 1).collect(),
    })
}

/// RFC 1123 hostname: dot-separated labels of letters, digits and inner hyphens.
pub fn is_valid_hostname(host: &str) -> bool {
    let host = host.strip_suffix('.').unwrap_or(host);
    if host.is_empty() || host.len() > HOSTNAME_MAX_LEN {
        return false;
    }
    // Dotted-quad lookalikes such as 999.1.1.1 are neither an IP nor a hostname.
    if host.split('.').all(|l| l.bytes().all(|b| b.is_ascii_digit())) {
        return host.parse::<Ipv4Addr>().is_ok();
    }
    host.split('.').all(|label| {
        let bytes = label.as_bytes();
        !bytes.is_empty()
            && bytes.len() <= HOSTNAME_LABEL_MAX_LEN
            && bytes.first() != Some(&b'-')
            && bytes.last() != Some(&b'-')
            && bytes.iter().all(|b| b.is_ascii_alphanumeric() || *b == b'-')
    })
}

fn parse_query(raw: &str) -> Result<BTreeMap<String, String>, DescriptorError> {
    let bytes = raw.as_bytes();
    for (i, b) in bytes.iter().enumerate() {
        if *b != b'%' {
            continue;
        }
        let escape_ok = bytes.len() > i + 2
            && bytes[i + 1].is_ascii_hexdigit()
            && bytes[i + 2].is_ascii_hexdigit();
        if !escape_ok {
            return Err(DescriptorError::InvalidQuery {
                reason: format!("malformed percent-escape at byte {i}"),
            });
        }
    }

    let mut out = BTreeMap::new();
    for (key, value) in url::form_urlencoded::parse(bytes) {
        out.entry(key.into_owned()).or_insert_with(|| value.into_owned());
    }
    Ok(out)
}

fn map_url_error(err: url::ParseError) -> DescriptorError {
    match err {
        url::ParseError::InvalidPort => DescriptorError::InvalidPort {
            reason: "port is not a number in 1..=65535".to_string(),
        },
        url::ParseError::EmptyHost
        | url::ParseError::IdnaError
        | url::ParseError::InvalidIpv4Address
        | url::ParseError::InvalidIpv6Address
        | url::ParseError::InvalidDomainCharacter => DescriptorError::InvalidAddress {
            address: err.to_string(),
        },
        other => DescriptorError::InvalidInput {
            reason: other.to_string(),
        },
    }
}

fn non_empty(value: &str) -> Option<String> {
    (!value.is_empty()).then(|| value.to_string())
}
