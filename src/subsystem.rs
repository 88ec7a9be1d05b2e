//! Subsystems deployed into an instance (ca, kra, ...), each with a
//! persisted `CS.cfg` configuration recording its certificates.

use crate::error::{Error, Result};
use crate::types::{normalize_token, CertRecord};
use std::fs;
use std::path::PathBuf;

#[derive(Debug, Clone)]
pub struct Subsystem {
    pub name: String,
    pub conf_dir: PathBuf,
}

impl Subsystem {
    pub fn new(name: impl Into<String>, conf_dir: PathBuf) -> Self {
        Self {
            name: name.into(),
            conf_dir,
        }
    }

    pub fn cs_conf(&self) -> PathBuf {
        self.conf_dir.join("CS.cfg")
    }

    /// Value of a single configuration key. Lines are `key=value`, `#`
    /// starts a comment, the last matching line wins.
    pub fn config_value(&self, key: &str) -> Result<Option<String>> {
        let text = fs::read_to_string(self.cs_conf())?;
        let mut value = None;

        for line in text.lines() {
            if line.starts_with('#') {
                continue;
            }
            if let Some((k, v)) = line.split_once('=') {
                if k == key {
                    value = Some(v.to_string());
                }
            }
        }

        Ok(value)
    }

    /// The certificate record configured for a cert tag. The configured
    /// nickname and token always take precedence over caller-supplied
    /// values.
    pub fn cert_record(&self, tag: &str) -> Result<CertRecord> {
        let nickname = self
            .config_value(&format!("{}.{}.nickname", self.name, tag))?
            .ok_or_else(|| {
                Error::NotFound(format!(
                    "No {} certificate configured in subsystem {}",
                    tag, self.name
                ))
            })?;

        let token = self.config_value(&format!("{}.{}.tokenname", self.name, tag))?;
        let serial = self.config_value(&format!("{}.{}.serial", self.name, tag))?;

        Ok(CertRecord {
            nickname,
            token: normalize_token(token.as_deref()),
            serial,
        })
    }
}
