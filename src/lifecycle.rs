//! Certificate lifecycle operations for one instance: request, create,
//! import, delete, verify, and bulk export of external certificates.
//!
//! Multi-step operations are not transactional: a CSR already staged on
//! disk survives a later failure. Scratch directories and module handles
//! are owned values, so they are released on every exit path.

use crate::error::{Error, Result};
use crate::instance::Instance;
use crate::nssdb::{
    CsrSpec, IssueSpec, Pkcs12Import, SecurityModule, SigningBackend, TempCertSpec,
};
use crate::subsystem::Subsystem;
use crate::transport::{CaConnector, RenewalOptions};
use crate::types::{normalize_token, CertId, CertInfo, CertRecord};
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

/// Validity window of a temporary certificate.
pub const TEMP_CERT_VALIDITY_DAYS: u32 = 90;

/// Settings for [`CertManager::create_cert`].
#[derive(Debug, Clone, Default)]
pub struct CreateCertOptions {
    pub cert_id: Option<CertId>,
    /// Serial number of the certificate being renewed or reissued. When
    /// absent it is taken from the subsystem configuration, or failing
    /// that from the certificate currently staged on disk.
    pub serial: Option<String>,
    pub temp_cert: bool,
    pub renew: bool,
    /// Replacing the key material is not supported and fails loudly.
    pub rekey: bool,
    pub output: Option<PathBuf>,
    pub token: Option<String>,
    pub issuer: Option<String>,
    pub ext_conf: Option<PathBuf>,
    pub auth: RenewalOptions,
}

/// Lifecycle manager for the certificates of a single instance.
pub struct CertManager<'a> {
    instance: &'a Instance,
    module: &'a dyn SecurityModule,
    signer: &'a dyn SigningBackend,
}

impl<'a> CertManager<'a> {
    pub fn new(
        instance: &'a Instance,
        module: &'a dyn SecurityModule,
        signer: &'a dyn SigningBackend,
    ) -> Self {
        Self {
            instance,
            module,
            signer,
        }
    }

    /// Generate a signing request for a certificate role, staged to the
    /// instance CSR path. An existing CSR is overwritten.
    pub fn request_cert(
        &self,
        cert_id: &CertId,
        subject_dn: &str,
        token: Option<&str>,
        ext_conf: Option<&Path>,
    ) -> Result<()> {
        log::info!("Generating CSR for {}", cert_id);

        self.signer.request_csr(&CsrSpec {
            token: normalize_token(token),
            subject: subject_dn.to_string(),
            csr_file: self.instance.csr_file(cert_id.as_str()),
            ext_conf: ext_conf.map(Path::to_path_buf),
        })
    }

    /// Create a certificate in one of three modes: permanent (issued
    /// locally from a staged CSR), temporary (short-lived, reusing the
    /// tracked serial, no remote interaction), or renewal (requested from
    /// a remote CA). The flags are validated before any side effect.
    pub fn create_cert(
        &self,
        options: &CreateCertOptions,
        connector: &dyn CaConnector,
    ) -> Result<()> {
        if options.rekey {
            return Err(Error::Config(
                "Rekeying an existing certificate is not supported; request a renewal instead"
                    .to_string(),
            ));
        }
        if options.temp_cert && options.renew {
            return Err(Error::Config(
                "A temporary certificate cannot be a renewal".to_string(),
            ));
        }

        if !options.temp_cert && !options.renew {
            let cert_id = options.cert_id.as_ref().ok_or_else(|| {
                Error::Config("Certificate ID required for local issuance".to_string())
            })?;

            log::info!("Issuing certificate for {}", cert_id);

            return self.signer.issue_cert(&IssueSpec {
                token: normalize_token(options.token.as_deref()),
                csr_file: self.instance.csr_file(cert_id.as_str()),
                cert_file: self.instance.cert_file(cert_id.as_str()),
                issuer: options.issuer.clone(),
                ext_conf: options.ext_conf.clone(),
            });
        }

        // Renewal credentials are resolved before anything touches the
        // filesystem or the network.
        let auth = if options.renew {
            Some(options.auth.resolve()?)
        } else {
            None
        };

        // Locate the target file and the serial of the cert being replaced.
        let (target, serial, subsystem) = match &options.cert_id {
            Some(cert_id) => {
                let target = options
                    .output
                    .clone()
                    .unwrap_or_else(|| self.instance.cert_file(cert_id.as_str()));

                let subsystem = self.resolve_subsystem(cert_id)?;
                let serial = match &options.serial {
                    Some(serial) => serial.clone(),
                    None => {
                        let record = subsystem.cert_record(cert_id.tag())?;
                        self.resolve_serial(&record, cert_id)?
                    }
                };

                (target, serial, Some(subsystem))
            }
            None => {
                if options.temp_cert {
                    return Err(Error::Config(
                        "A temporary certificate requires a certificate ID".to_string(),
                    ));
                }
                let serial = options.serial.clone().ok_or_else(|| {
                    Error::Config("Either a certificate ID or a serial number is required".to_string())
                })?;
                let target = options.output.clone().ok_or_else(|| {
                    Error::Config("Output path required when renewing by serial number".to_string())
                })?;

                (target, serial, None)
            }
        };

        match auth {
            // Temporary certificate; only reachable with a cert ID, so a
            // subsystem was resolved above.
            None => {
                let subsystem = subsystem.ok_or_else(|| {
                    Error::Config("A temporary certificate requires a certificate ID".to_string())
                })?;
                let signing = subsystem.cert_record("signing")?;

                log::info!("Creating temporary certificate with serial {}", serial);

                self.signer.create_temp_cert(&TempCertSpec {
                    signing_nickname: signing.nickname,
                    token: signing.token,
                    serial,
                    validity_days: TEMP_CERT_VALIDITY_DAYS,
                    cert_file: target,
                })
            }

            Some(auth) => {
                let scratch = TempDir::new()?;

                log::debug!("Setting up secure connection to CA");
                let connection = connector.connect(&auth, scratch.path())?;

                let pem = connection.renew(&serial)?;

                log::info!("Storing renewed certificate into {}", target.display());
                fs::write(&target, pem)?;
                Ok(())
            }
        }
    }

    /// Import a certificate file into the security module with the trust
    /// attributes its role requires. Refuses to overwrite an existing
    /// certificate.
    pub fn import_cert(
        &self,
        cert_id: Option<&CertId>,
        cert_file: Option<&Path>,
        token: Option<&str>,
        nickname: Option<&str>,
    ) -> Result<()> {
        let cert_file = match (cert_id, cert_file) {
            (_, Some(file)) => file.to_path_buf(),
            (Some(cert_id), None) => self.instance.cert_file(cert_id.as_str()),
            (None, None) => {
                return Err(Error::Config("Missing certificate ID or file".to_string()))
            }
        };

        if !cert_file.is_file() {
            return Err(Error::NotFound(format!(
                "File does not exist: {}",
                cert_file.display()
            )));
        }

        let mut nickname = nickname.map(str::to_string);
        let mut token = normalize_token(token);

        // A cert tag known to a deployed subsystem resolves to the
        // configured nickname and token, overriding caller values.
        let mut resolved = false;
        if let Some(cert_id) = cert_id {
            let subsystem = match cert_id.subsystem() {
                Some(name) => self.instance.subsystem(name)?,
                None => self.instance.subsystems()?.into_iter().next(),
            };

            if let Some(subsystem) = subsystem {
                match subsystem.cert_record(cert_id.tag()) {
                    Ok(record) => {
                        nickname = Some(record.nickname);
                        token = record.token;
                        resolved = true;
                    }
                    Err(Error::NotFound(_)) => {}
                    Err(e) => return Err(e),
                }
            }

            if !resolved && nickname.is_none() {
                nickname = Some(cert_id.as_str().to_string());
            }
        }

        let nickname =
            nickname.ok_or_else(|| Error::Config("Certificate nickname required".to_string()))?;
        let trust_attributes = cert_id.and_then(CertId::trust_attributes);

        log::debug!("- nickname: {}", nickname);
        log::debug!("- trust flags: {:?}", trust_attributes);

        if self.module.get_cert(&nickname, token.as_deref())?.is_some() {
            return Err(Error::AlreadyExists(format!(
                "Certificate already exists: {}",
                nickname
            )));
        }

        log::info!("Importing certificate {}", nickname);

        self.module
            .add_cert(&nickname, token.as_deref(), &cert_file, trust_attributes)
    }

    /// Remove a subsystem certificate from the security module, and
    /// optionally its private key.
    pub fn delete_cert(&self, cert_id: &CertId, remove_key: bool) -> Result<()> {
        let subsystem = self.resolve_subsystem(cert_id)?;
        let record = subsystem.cert_record(cert_id.tag())?;

        log::debug!(
            "Removing {} certificate of subsystem {} from instance {}",
            cert_id.tag(),
            subsystem.name,
            self.instance.name
        );

        self.module
            .remove_cert(&record.nickname, record.token.as_deref(), remove_key)
    }

    /// Verify a certificate against the security module.
    pub fn verify_cert(&self, cert_data: &[u8]) -> Result<()> {
        self.module.verify_cert(cert_data)
    }

    /// Import a PKCS #12 bundle into every token that holds a registered
    /// external certificate. The scratch password file is staged per cert
    /// and removed unconditionally; the first failure stops the loop, so
    /// remaining certs are not attempted.
    pub fn export_external_certs(
        &self,
        pkcs12_file: &Path,
        pkcs12_password_file: &Path,
        append: bool,
    ) -> Result<()> {
        for cert in self.instance.external_certs() {
            let password = self.instance.token_password(cert.token.as_deref())?;

            let scratch = TempDir::new()?;
            let db_password_file = scratch.path().join("password.txt");
            fs::write(&db_password_file, password)?;

            self.module.import_pkcs12(&Pkcs12Import {
                token: cert.token.clone(),
                pkcs12_file: pkcs12_file.to_path_buf(),
                pkcs12_password_file: pkcs12_password_file.to_path_buf(),
                db_password_file,
                nickname: cert.nickname.clone(),
                append,
            })?;
        }
        Ok(())
    }

    fn resolve_subsystem(&self, cert_id: &CertId) -> Result<Subsystem> {
        let name = match cert_id.subsystem() {
            Some(name) => name.to_string(),
            None => self
                .instance
                .subsystems()?
                .into_iter()
                .next()
                .ok_or_else(|| {
                    Error::NotFound(format!(
                        "No subsystem installed in instance {}",
                        self.instance.name
                    ))
                })?
                .name,
        };

        self.instance
            .subsystem(&name)?
            .ok_or_else(|| Error::NotFound(format!("No such subsystem: {}", name)))
    }

    fn resolve_serial(&self, record: &CertRecord, cert_id: &CertId) -> Result<String> {
        if let Some(serial) = &record.serial {
            return Ok(serial.clone());
        }

        // No tracked serial; read it off the staged certificate.
        let data = fs::read(self.instance.cert_file(cert_id.as_str()))?;
        Ok(CertInfo::from_pem(&data)?.serial)
    }
}
