use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::domain::Server;

/// Outbound protocols a switch never replaces.
pub const SENTINEL_PROTOCOLS: &[&str] = &["freedom", "blackhole"];

pub fn is_sentinel_protocol(protocol: &str) -> bool {
    SENTINEL_PROTOCOLS.contains(&protocol)
}

#[derive(Debug)]
pub enum ConfigFileError {
    Io(std::io::Error),
    Parse(serde_json::Error),
    Malformed { reason: String },
}

impl std::fmt::Display for ConfigFileError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(e) => write!(f, "read xray config: {e}"),
            Self::Parse(e) => write!(f, "parse xray config: {e}"),
            Self::Malformed { reason } => write!(f, "malformed xray config: {reason}"),
        }
    }
}

impl std::error::Error for ConfigFileError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            Self::Parse(e) => Some(e),
            Self::Malformed { .. } => None,
        }
    }
}

impl From<std::io::Error> for ConfigFileError {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value)
    }
}

impl From<serde_json::Error> for ConfigFileError {
    fn from(value: serde_json::Error) -> Self {
        Self::Parse(value)
    }
}

/// One entry of the daemon's `outbounds` array. Keys this crate does not model (`mux`,
/// `proxySettings`, ...) survive a read-modify-write through `extra`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OutboundEntry {
    #[serde(default)]
    pub tag: String,
    pub protocol: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub settings: Option<Value>,
    #[serde(
        rename = "streamSettings",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub stream_settings: Option<Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl OutboundEntry {
    pub fn from_server(server: &Server) -> Result<Self, ConfigFileError> {
        // Without vnext the daemon would start with a proxy that goes nowhere.
        let Some(settings) = server.settings.as_ref() else {
            return Err(ConfigFileError::Malformed {
                reason: format!("server {} has no rendered outbound settings", server.id),
            });
        };
        let settings = Some(serde_json::to_value(settings)?);
        let stream_settings = server
            .stream_settings
            .as_ref()
            .map(serde_json::to_value)
            .transpose()?;
        Ok(Self {
            tag: server.tag.clone(),
            protocol: server.protocol.clone(),
            settings,
            stream_settings,
            extra: Map::new(),
        })
    }

    pub fn is_sentinel(&self) -> bool {
        is_sentinel_protocol(&self.protocol)
    }

    /// `(address, port)` of `settings.vnext[0]`, when present.
    pub fn vnext_endpoint(&self) -> Option<(&str, u16)> {
        let vnext = self.settings.as_ref()?.get("vnext")?.get(0)?;
        let address = vnext.get("address")?.as_str()?;
        let port = u16::try_from(vnext.get("port")?.as_u64()?).ok()?;
        Some((address, port))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplaceOutcome {
    Replaced { index: usize, previous_tag: String },
    Prepended,
}

/// The daemon's on-disk JSON config. Everything outside `outbounds` is kept verbatim and in
/// its original key order.
#[derive(Debug, Clone, PartialEq)]
pub struct XrayConfigFile {
    root: Map<String, Value>,
}

impl XrayConfigFile {
    pub fn from_slice(bytes: &[u8]) -> Result<Self, ConfigFileError> {
        let value: Value = serde_json::from_slice(bytes)?;
        let Value::Object(root) = value else {
            return Err(ConfigFileError::Malformed {
                reason: "top-level value is not an object".to_string(),
            });
        };
        let file = Self { root };
        // Validate every entry up front so later lookups cannot fail half-way.
        file.outbounds()?;
        Ok(file)
    }

    pub fn read(path: &std::path::Path) -> Result<Self, ConfigFileError> {
        let bytes = std::fs::read(path)?;
        Self::from_slice(&bytes)
    }

    fn outbounds_value(&self) -> Result<&Vec<Value>, ConfigFileError> {
        match self.root.get("outbounds") {
            Some(Value::Array(items)) => Ok(items),
            Some(_) => Err(ConfigFileError::Malformed {
                reason: "\"outbounds\" is not an array".to_string(),
            }),
            None => Err(ConfigFileError::Malformed {
                reason: "missing \"outbounds\"".to_string(),
            }),
        }
    }

    fn outbounds_value_mut(&mut self) -> Result<&mut Vec<Value>, ConfigFileError> {
        match self.root.get_mut("outbounds") {
            Some(Value::Array(items)) => Ok(items),
            _ => Err(ConfigFileError::Malformed {
                reason: "missing or non-array \"outbounds\"".to_string(),
            }),
        }
    }

    pub fn outbounds(&self) -> Result<Vec<OutboundEntry>, ConfigFileError> {
        self.outbounds_value()?
            .iter()
            .enumerate()
            .map(|(i, item)| {
                serde_json::from_value(item.clone()).map_err(|e| ConfigFileError::Malformed {
                    reason: format!("outbounds[{i}]: {e}"),
                })
            })
            .collect()
    }

    /// First outbound that is not `freedom`/`blackhole`.
    pub fn first_proxy_outbound(&self) -> Result<Option<OutboundEntry>, ConfigFileError> {
        Ok(self.outbounds()?.into_iter().find(|o| !o.is_sentinel()))
    }

    /// Overwrites the first non-sentinel outbound in place, or prepends when there is none.
    /// Later proxy outbounds are left untouched.
    pub fn replace_outbound(
        &mut self,
        outbound: &OutboundEntry,
    ) -> Result<ReplaceOutcome, ConfigFileError> {
        if outbound.protocol.is_empty() {
            return Err(ConfigFileError::Malformed {
                reason: "replacement outbound has no protocol".to_string(),
            });
        }
        if outbound.is_sentinel() {
            return Err(ConfigFileError::Malformed {
                reason: format!(
                    "replacement outbound uses sentinel protocol {:?}",
                    outbound.protocol
                ),
            });
        }

        let target = self
            .outbounds()?
            .into_iter()
            .enumerate()
            .find(|(_, o)| !o.is_sentinel())
            .map(|(index, o)| (index, o.tag));
        let value = serde_json::to_value(outbound)?;
        let items = self.outbounds_value_mut()?;

        match target {
            Some((index, previous_tag)) => {
                items[index] = value;
                Ok(ReplaceOutcome::Replaced {
                    index,
                    previous_tag,
                })
            }
            None => {
                items.insert(0, value);
                Ok(ReplaceOutcome::Prepended)
            }
        }
    }

    /// Serialized with 4-space indentation and a trailing newline.
    pub fn to_pretty_bytes(&self) -> Result<Vec<u8>, ConfigFileError> {
        let mut out = Vec::new();
        let formatter = serde_json::ser::PrettyFormatter::with_indent(b"    ");
        let mut ser = serde_json::Serializer::with_formatter(&mut out, formatter);
        self.root.serialize(&mut ser)?;
        out.push(b'\n');
        Ok(out)
    }

    pub fn as_value(&self) -> Value {
        Value::Object(self.root.clone())
    }
}
