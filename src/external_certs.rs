//! Flat-file registry of externally-supplied certificates.
//!
//! Each record occupies two lines, `<index>.nickname=<value>` and
//! `<index>.token=<value>`. The internal token is written as an empty
//! value. Indices are rewritten sequentially from zero on every store.

use crate::error::{Error, Result};
use crate::types::{normalize_token, ExternalCert};
use std::fs;
use std::path::Path;

#[derive(Default)]
struct PartialCert {
    nickname: Option<String>,
    token: Option<String>,
}

/// Parse the contents of an external-certs file.
///
/// Every line must match `<index>.<attribute>=<value>`; the only accepted
/// attributes are `nickname` and `token`. Records are returned in the
/// order their index was first encountered.
pub fn parse_external_certs(text: &str) -> Result<Vec<ExternalCert>> {
    let mut records: Vec<(String, PartialCert)> = Vec::new();

    for line in text.lines() {
        let (key, value) = line
            .split_once('=')
            .ok_or_else(|| Error::Format(format!("Invalid external cert entry: {}", line)))?;

        let (index, attr) = key
            .split_once('.')
            .ok_or_else(|| Error::Format(format!("Invalid external cert entry: {}", line)))?;

        if index.is_empty() || !index.bytes().all(|b| b.is_ascii_digit()) {
            return Err(Error::Format(format!(
                "Invalid external cert index: {}",
                line
            )));
        }

        let pos = match records.iter().position(|(i, _)| i == index) {
            Some(pos) => pos,
            None => {
                records.push((index.to_string(), PartialCert::default()));
                records.len() - 1
            }
        };
        let record = &mut records[pos].1;

        match attr {
            "nickname" => record.nickname = Some(value.to_string()),
            "token" => record.token = Some(value.to_string()),
            _ => {
                return Err(Error::Format(format!(
                    "Unknown external cert attribute: {}",
                    attr
                )))
            }
        }
    }

    records
        .into_iter()
        .map(|(index, record)| {
            let nickname = record.nickname.ok_or_else(|| {
                Error::Format(format!("External cert {} has no nickname", index))
            })?;
            Ok(ExternalCert {
                nickname,
                token: normalize_token(record.token.as_deref()),
            })
        })
        .collect()
}

/// Serialize a list of external certs, re-indexing from zero.
pub fn serialize_external_certs(certs: &[ExternalCert]) -> String {
    let mut out = String::new();
    for (index, cert) in certs.iter().enumerate() {
        out.push_str(&format!("{}.nickname={}\n", index, cert.nickname));
        out.push_str(&format!(
            "{}.token={}\n",
            index,
            cert.token.as_deref().unwrap_or("")
        ));
    }
    out
}

/// Load external certs from a file. A missing file yields an empty list.
pub fn load_external_certs(path: &Path) -> Result<Vec<ExternalCert>> {
    if !path.exists() {
        log::info!("File does not exist: {}", path.display());
        return Ok(Vec::new());
    }

    log::info!("Loading external certs from {}", path.display());
    let text = fs::read_to_string(path)?;
    parse_external_certs(&text)
}

/// Store external certs into a file. An empty list removes the file
/// instead of writing an empty one.
pub fn store_external_certs(path: &Path, certs: &[ExternalCert]) -> Result<()> {
    if certs.is_empty() {
        log::info!("Removing {}", path.display());
        if path.exists() {
            fs::remove_file(path)?;
        }
        return Ok(());
    }

    log::info!("Storing external certs into {}", path.display());
    fs::write(path, serialize_external_certs(certs))?;
    Ok(())
}
