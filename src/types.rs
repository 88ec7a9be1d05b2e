use crate::error::{Error, Result};
use chrono::{DateTime, Utc};

#[cfg(feature = "json")]
use serde::Serialize;

/// Token names that all refer to the internal (software) token.
const INTERNAL_TOKEN_NAMES: &[&str] = &["", "internal", "Internal Key Storage Token"];

/// Normalize a security token name. The internal token has several aliases
/// and is represented as `None` everywhere in this crate.
pub fn normalize_token(token: Option<&str>) -> Option<String> {
    match token {
        None => None,
        Some(name) if INTERNAL_TOKEN_NAMES.contains(&name) => None,
        Some(name) => Some(name.to_string()),
    }
}

/// Identifier of a role-bound certificate, e.g. `ca_signing` or
/// `kra_audit_signing`. The part before the first underscore names the
/// owning subsystem, except for the instance-wide `sslserver` and
/// `subsystem` certificates which carry no subsystem prefix.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CertId(String);

impl CertId {
    pub fn new(id: impl Into<String>) -> Result<Self> {
        let id = id.into();
        if id.is_empty() {
            return Err(Error::Format("Empty certificate ID".to_string()));
        }
        Ok(CertId(id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Split into (subsystem, tag).
    pub fn split(&self) -> (Option<&str>, &str) {
        match self.0.as_str() {
            "sslserver" | "subsystem" => (None, &self.0),
            _ => match self.0.split_once('_') {
                Some((subsystem, tag)) => (Some(subsystem), tag),
                None => (None, &self.0),
            },
        }
    }

    pub fn subsystem(&self) -> Option<&str> {
        self.split().0
    }

    pub fn tag(&self) -> &str {
        self.split().1
    }

    /// NSS trust attributes required by this certificate role.
    ///
    /// The CA signing certificate is a trusted CA, the audit signing
    /// certificate a trusted peer. All other roles carry no explicit
    /// trust flags.
    pub fn trust_attributes(&self) -> Option<&'static str> {
        if self.0 == "ca_signing" {
            Some("CT,C,C")
        } else if self.tag() == "audit_signing" {
            Some(",,P")
        } else {
            None
        }
    }
}

impl std::str::FromStr for CertId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        CertId::new(s)
    }
}

impl std::fmt::Display for CertId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// An externally-supplied certificate bound to a security token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExternalCert {
    pub nickname: String,
    pub token: Option<String>,
}

impl ExternalCert {
    pub fn new(nickname: impl Into<String>, token: Option<&str>) -> Self {
        Self {
            nickname: nickname.into(),
            token: normalize_token(token),
        }
    }
}

/// Nickname, token, and tracked serial number of a subsystem certificate,
/// as recorded in the subsystem's persisted configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertRecord {
    pub nickname: String,
    pub token: Option<String>,
    pub serial: Option<String>,
}

/// Version of the embedded servlet container, ordered numerically
/// component by component.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct ContainerVersion(Vec<u32>);

impl ContainerVersion {
    pub fn new(parts: &[u32]) -> Self {
        ContainerVersion(parts.to_vec())
    }
}

impl std::str::FromStr for ContainerVersion {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let parts = s
            .split('.')
            .map(|p| {
                p.parse::<u32>()
                    .map_err(|_| Error::Format(format!("Invalid version: {}", s)))
            })
            .collect::<Result<Vec<u32>>>()?;
        if parts.is_empty() {
            return Err(Error::Format(format!("Invalid version: {}", s)));
        }
        Ok(ContainerVersion(parts))
    }
}

impl std::fmt::Display for ContainerVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let strings: Vec<String> = self.0.iter().map(|p| p.to_string()).collect();
        f.write_str(&strings.join("."))
    }
}

/// Parsed summary of an X.509 certificate.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "json", derive(Serialize))]
pub struct CertInfo {
    pub subject: String,
    pub issuer: String,
    pub serial: String,
    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
}

impl CertInfo {
    pub fn from_pem(data: &[u8]) -> Result<Self> {
        let (_, pem) = x509_parser::pem::parse_x509_pem(data)?;
        let cert = pem.parse_x509()?;

        let not_before = DateTime::from_timestamp(cert.validity().not_before.timestamp(), 0)
            .ok_or_else(|| Error::CertParse("Invalid notBefore timestamp".to_string()))?;
        let not_after = DateTime::from_timestamp(cert.validity().not_after.timestamp(), 0)
            .ok_or_else(|| Error::CertParse("Invalid notAfter timestamp".to_string()))?;

        Ok(CertInfo {
            subject: cert.subject().to_string(),
            issuer: cert.issuer().to_string(),
            serial: cert.serial.to_string(),
            not_before,
            not_after,
        })
    }
}
