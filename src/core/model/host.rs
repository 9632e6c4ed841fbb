//! Hosts, their listeners and TLS material.
use std::{fmt, str::FromStr};

use base64::{Engine, engine::general_purpose::STANDARD};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use subtle::ConstantTimeEq;

use super::{
    error::{ValidationError, ValidationResult, validate_id, validate_required_id},
    location::Location,
};

/// Listener protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Http,
    Https,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Http => f.write_str("http"),
            Protocol::Https => f.write_str("https"),
        }
    }
}

impl FromStr for Protocol {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "http" => Ok(Protocol::Http),
            "https" => Ok(Protocol::Https),
            _ => Err(ValidationError::Unsupported {
                field: "protocol".to_string(),
                value: s.to_string(),
                supported: "http and https".to_string(),
            }),
        }
    }
}

/// Socket family a listener binds on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    Tcp,
    Unix,
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Network::Tcp => f.write_str("tcp"),
            Network::Unix => f.write_str("unix"),
        }
    }
}

impl FromStr for Network {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "tcp" => Ok(Network::Tcp),
            "unix" => Ok(Network::Unix),
            _ => Err(ValidationError::Unsupported {
                field: "network".to_string(),
                value: s.to_string(),
                supported: "tcp and unix".to_string(),
            }),
        }
    }
}

/// Network plus address (`ip:port` or a unix socket path).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Address {
    pub network: Network,
    pub address: String,
}

impl Address {
    pub fn new(network: &str, address: &str) -> ValidationResult<Self> {
        if address.is_empty() {
            return Err(ValidationError::missing("address"));
        }
        Ok(Self {
            network: network.parse()?,
            address: address.to_string(),
        })
    }
}

/// Listening point of a host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Listener {
    #[serde(default)]
    pub id: String,
    pub protocol: Protocol,
    pub address: Address,
}

impl Listener {
    pub fn new(id: &str, protocol: &str, network: &str, address: &str) -> ValidationResult<Self> {
        validate_id("listener id", id)?;
        Ok(Self {
            id: id.to_string(),
            protocol: protocol.parse()?,
            address: Address::new(network, address)?,
        })
    }

    pub(crate) fn validate(&self) -> ValidationResult<()> {
        validate_id("listener id", &self.id)?;
        if self.address.address.is_empty() {
            return Err(ValidationError::missing("address"));
        }
        Ok(())
    }
}

impl fmt::Display for Listener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Listener({}, {}://{})",
            self.protocol, self.address.network, self.address.address
        )
    }
}

/// PEM encoded certificate chain and private key.
///
/// Serialized as base64 strings; comparison runs in constant time.
#[derive(Clone, Serialize, Deserialize)]
#[serde(try_from = "KeyPairDocument")]
pub struct KeyPair {
    #[serde(serialize_with = "to_base64")]
    cert: Vec<u8>,
    #[serde(serialize_with = "to_base64")]
    key: Vec<u8>,
}

#[derive(Deserialize)]
struct KeyPairDocument {
    #[serde(deserialize_with = "from_base64")]
    cert: Vec<u8>,
    #[serde(deserialize_with = "from_base64")]
    key: Vec<u8>,
}

impl TryFrom<KeyPairDocument> for KeyPair {
    type Error = ValidationError;

    fn try_from(doc: KeyPairDocument) -> Result<Self, Self::Error> {
        KeyPair::new(doc.cert, doc.key)
    }
}

fn to_base64<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&STANDARD.encode(bytes))
}

fn from_base64<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
    let encoded = String::deserialize(deserializer)?;
    STANDARD.decode(encoded).map_err(serde::de::Error::custom)
}

impl KeyPair {
    /// Validate that `cert` holds at least one certificate and `key` a private key.
    pub fn new(cert: impl Into<Vec<u8>>, key: impl Into<Vec<u8>>) -> ValidationResult<Self> {
        let cert = cert.into();
        let key = key.into();
        if cert.is_empty() || key.is_empty() {
            return Err(ValidationError::invalid(
                "key_pair",
                "provide non-empty certificate and a private key",
            ));
        }

        let certs = rustls_pemfile::certs(&mut cert.as_slice())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| ValidationError::invalid("key_pair.cert", e.to_string()))?;
        if certs.is_empty() {
            return Err(ValidationError::invalid(
                "key_pair.cert",
                "no PEM certificate found",
            ));
        }

        match rustls_pemfile::private_key(&mut key.as_slice()) {
            Ok(Some(_)) => {}
            Ok(None) => {
                return Err(ValidationError::invalid(
                    "key_pair.key",
                    "no PEM private key found",
                ));
            }
            Err(e) => return Err(ValidationError::invalid("key_pair.key", e.to_string())),
        }

        Ok(Self { cert, key })
    }

    pub fn cert(&self) -> &[u8] {
        &self.cert
    }

    pub fn key(&self) -> &[u8] {
        &self.key
    }
}

impl PartialEq for KeyPair {
    fn eq(&self, other: &Self) -> bool {
        let same = self.cert.as_slice().ct_eq(other.cert.as_slice())
            & self.key.as_slice().ct_eq(other.key.as_slice());
        same.into()
    }
}

impl Eq for KeyPair {}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPair")
            .field("cert_len", &self.cert.len())
            .field("key", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HostOptions {
    /// Serve requests whose Host header matches no other host
    pub default: bool,
}

/// Incoming requests are matched by hostname first, taken from the `Host` header.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Host {
    pub name: String,
    pub locations: Vec<Location>,
    pub key_pair: Option<KeyPair>,
    pub listeners: Vec<Listener>,
    pub options: HostOptions,
}

impl Host {
    pub fn new(name: &str) -> ValidationResult<Self> {
        validate_required_id("hostname", name)?;
        Ok(Self {
            name: name.to_string(),
            locations: Vec::new(),
            key_pair: None,
            listeners: Vec::new(),
            options: HostOptions::default(),
        })
    }

    pub fn with_options(name: &str, options: HostOptions) -> ValidationResult<Self> {
        let mut host = Self::new(name)?;
        host.options = options;
        Ok(host)
    }

    /// Re-check an assembled host before it is written.
    pub fn validate(&self) -> ValidationResult<()> {
        validate_required_id("hostname", &self.name)?;
        let errors: Vec<_> = self
            .listeners
            .iter()
            .filter_map(|l| l.validate().err())
            .collect();
        ValidationError::aggregate(errors)
    }
}

impl fmt::Display for Host {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Host({})", self.name)
    }
}
