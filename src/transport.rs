//! Authenticated connections to a remote CA for renewal requests.
//!
//! Authentication is either username/password or a client certificate
//! held in a local client database; exactly one mode must be satisfiable
//! and that decision is made before any file or network activity.

use crate::error::{Error, Result};
use crate::nssdb;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use std::fs;
use std::io::{BufReader, Read, Write};
use std::net::TcpStream;
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub const DEFAULT_SECURE_PORT: u16 = 8443;

/// Caller-supplied renewal authentication settings, as they arrive from
/// the CLI. Resolved into a [`RenewalAuth`] before anything else happens.
#[derive(Debug, Clone, Default)]
pub struct RenewalOptions {
    pub username: Option<String>,
    pub password: Option<String>,
    pub client_nickname: Option<String>,
    pub client_nssdb: Option<PathBuf>,
    pub client_nssdb_password: Option<String>,
    pub client_nssdb_password_file: Option<PathBuf>,
}

/// Password for a client database, inline or in a file.
#[derive(Debug, Clone)]
pub enum DbPassword {
    Value(String),
    File(PathBuf),
}

/// A fully-resolved authentication mode.
#[derive(Debug, Clone)]
pub enum RenewalAuth {
    Password {
        username: String,
        password: String,
    },
    ClientCert {
        nickname: String,
        nssdb: Option<PathBuf>,
        password: DbPassword,
    },
}

impl RenewalOptions {
    /// Pick the authentication mode. Username/password wins when both are
    /// supplied; otherwise a client certificate nickname and a database
    /// password are required.
    pub fn resolve(&self) -> Result<RenewalAuth> {
        if let (Some(username), Some(password)) = (&self.username, &self.password) {
            return Ok(RenewalAuth::Password {
                username: username.clone(),
                password: password.clone(),
            });
        }

        let Some(nickname) = &self.client_nickname else {
            return Err(Error::Config(
                "CA renewal requires either a username and password \
                 or a client certificate nickname"
                    .to_string(),
            ));
        };

        let password = if let Some(value) = &self.client_nssdb_password {
            DbPassword::Value(value.clone())
        } else if let Some(file) = &self.client_nssdb_password_file {
            DbPassword::File(file.clone())
        } else {
            return Err(Error::Config(
                "Client database password required for certificate authentication".to_string(),
            ));
        };

        Ok(RenewalAuth::ClientCert {
            nickname: nickname.clone(),
            nssdb: self.client_nssdb.clone(),
            password,
        })
    }
}

/// An established, authenticated connection to a CA.
pub trait CaConnection {
    /// Request reissuance of the certificate with the given serial number
    /// and return the renewed certificate in PEM form.
    fn renew(&self, serial: &str) -> Result<String>;
}

/// Connection setup against a CA endpoint.
pub trait CaConnector {
    /// Establish a connection using resolved credentials. Client-cert
    /// material is staged under `scratch`, which the caller owns.
    fn connect(&self, auth: &RenewalAuth, scratch: &Path) -> Result<Box<dyn CaConnection>>;
}

/// Connector speaking HTTPS to the CA's REST interface.
pub struct RestConnector {
    host: String,
    port: u16,
    ca_bundle: Option<PathBuf>,
    /// Pre-staged PEM client credentials, used instead of exporting them
    /// from the client database.
    client_files: Option<(PathBuf, PathBuf)>,
    api_version: Option<String>,
}

impl RestConnector {
    pub fn new(host: impl Into<String>, port: u16, ca_bundle: Option<PathBuf>) -> Self {
        Self {
            host: host.into(),
            port,
            ca_bundle,
            client_files: None,
            api_version: None,
        }
    }

    pub fn with_client_files(mut self, cert: PathBuf, key: PathBuf) -> Self {
        self.client_files = Some((cert, key));
        self
    }

    pub fn with_api_version(mut self, api: impl Into<String>) -> Self {
        self.api_version = Some(api.into());
        self
    }

    fn request_path(&self) -> String {
        format!(
            "/ca/{}/certrequests/renewal",
            self.api_version.as_deref().unwrap_or("rest")
        )
    }

    /// Parse `https://host:port` (scheme and port optional).
    pub fn from_url(url: &str, ca_bundle: Option<PathBuf>) -> Result<Self> {
        let rest = url
            .strip_prefix("https://")
            .or_else(|| url.strip_prefix("http://"))
            .unwrap_or(url);
        let rest = rest.split('/').next().unwrap_or(rest);

        let (host, port) = match rest.split_once(':') {
            Some((host, port)) => {
                let port = port
                    .parse::<u16>()
                    .map_err(|_| Error::Config(format!("Invalid port in URL: {}", url)))?;
                (host, port)
            }
            None => (rest, DEFAULT_SECURE_PORT),
        };

        if host.is_empty() {
            return Err(Error::Config(format!("Invalid URL: {}", url)));
        }

        Ok(Self::new(host, port, ca_bundle))
    }

    fn root_config(&self) -> Result<rustls::ConfigBuilder<rustls::ClientConfig, rustls::client::WantsClientCert>> {
        let builder = rustls::ClientConfig::builder();

        match &self.ca_bundle {
            Some(bundle) => {
                let mut roots = rustls::RootCertStore::empty();
                let mut reader = BufReader::new(fs::File::open(bundle)?);
                for cert in rustls_pemfile::certs(&mut reader) {
                    roots.add(cert?)?;
                }
                Ok(builder.with_root_certificates(roots))
            }
            None => {
                log::warn!("No CA bundle configured, server certificate is not verified");
                Ok(builder
                    .dangerous()
                    .with_custom_certificate_verifier(Arc::new(AcceptAnyServerCert)))
            }
        }
    }
}

impl CaConnector for RestConnector {
    fn connect(&self, auth: &RenewalAuth, scratch: &Path) -> Result<Box<dyn CaConnection>> {
        let builder = self.root_config()?;

        let (config, authorization) = match auth {
            RenewalAuth::Password { username, password } => {
                let config = builder.with_no_client_auth();
                let credentials = BASE64.encode(format!("{}:{}", username, password));
                (config, Some(format!("Basic {}", credentials)))
            }
            RenewalAuth::ClientCert {
                nickname,
                nssdb,
                password,
            } => {
                let (certs, key) = match &self.client_files {
                    Some((cert_file, key_file)) => {
                        let mut data = fs::read(cert_file)?;
                        data.extend(fs::read(key_file)?);
                        load_client_material_from(&data, cert_file)?
                    }
                    None => {
                        let nssdb = nssdb.as_deref().ok_or_else(|| {
                            Error::Config(
                                "Client database required for certificate authentication"
                                    .to_string(),
                            )
                        })?;

                        let password_file = match password {
                            DbPassword::File(file) => file.clone(),
                            DbPassword::Value(value) => {
                                let file = scratch.join("password.txt");
                                fs::write(&file, value)?;
                                file
                            }
                        };

                        let client_pem = scratch.join("client.pem");
                        nssdb::export_client_cert(nssdb, &password_file, nickname, &client_pem)?;
                        load_client_material(&client_pem)?
                    }
                };

                let config = builder.with_client_auth_cert(certs, key)?;
                (config, None)
            }
        };

        Ok(Box::new(RestConnection {
            config: Arc::new(config),
            host: self.host.clone(),
            port: self.port,
            path: self.request_path(),
            authorization,
        }))
    }
}

fn load_client_material(
    path: &Path,
) -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)> {
    let data = fs::read(path)?;
    load_client_material_from(&data, path)
}

fn load_client_material_from(
    data: &[u8],
    path: &Path,
) -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)> {
    let mut reader = BufReader::new(data);
    let certs = rustls_pemfile::certs(&mut reader).collect::<std::io::Result<Vec<_>>>()?;
    if certs.is_empty() {
        return Err(Error::CertParse(format!(
            "No certificate in {}",
            path.display()
        )));
    }

    let mut reader = BufReader::new(data);
    let key = rustls_pemfile::private_key(&mut reader)?
        .ok_or_else(|| Error::CertParse(format!("No private key in {}", path.display())))?;

    Ok((certs, key))
}

struct RestConnection {
    config: Arc<rustls::ClientConfig>,
    host: String,
    port: u16,
    path: String,
    authorization: Option<String>,
}

impl CaConnection for RestConnection {
    fn renew(&self, serial: &str) -> Result<String> {
        let server_name = ServerName::try_from(self.host.clone())
            .map_err(|e| Error::Connection(format!("Invalid server name '{}': {}", self.host, e)))?;

        let mut conn = rustls::ClientConnection::new(self.config.clone(), server_name)?;

        let addr = format!("{}:{}", self.host, self.port);
        let mut sock = TcpStream::connect(&addr)
            .map_err(|e| Error::Connection(format!("Failed to connect to {}: {}", addr, e)))?;

        let mut tls = rustls::Stream::new(&mut conn, &mut sock);

        let body = format!("{{\"serial\":\"{}\"}}", serial);
        let mut request = format!(
            "POST {} HTTP/1.1\r\n\
             Host: {}\r\n\
             Content-Type: application/json\r\n\
             Content-Length: {}\r\n\
             Connection: close\r\n",
            self.path,
            self.host,
            body.len()
        );
        if let Some(authorization) = &self.authorization {
            request.push_str(&format!("Authorization: {}\r\n", authorization));
        }
        request.push_str("\r\n");
        request.push_str(&body);

        log::debug!("Renewing certificate {} via {}", serial, addr);

        tls.write_all(request.as_bytes())
            .map_err(|e| Error::Connection(format!("Failed to send request: {}", e)))?;

        let mut response = Vec::new();
        let _ = tls.read_to_end(&mut response);
        let response = String::from_utf8_lossy(&response);

        let status = response.lines().next().unwrap_or("");
        if !status.contains(" 200 ") {
            return Err(Error::Connection(format!(
                "Renewal request failed: {}",
                status
            )));
        }

        extract_pem(&response).ok_or_else(|| {
            Error::Connection("Renewal response contains no certificate".to_string())
        })
    }
}

fn extract_pem(text: &str) -> Option<String> {
    let start = text.find("-----BEGIN CERTIFICATE-----")?;
    let end_marker = "-----END CERTIFICATE-----";
    let end = text.find(end_marker)? + end_marker.len();
    Some(format!("{}\n", &text[start..end]))
}

/// Certificate verifier that accepts any server certificate. Used only
/// when no CA bundle is configured.
#[derive(Debug)]
struct AcceptAnyServerCert;

impl rustls::client::danger::ServerCertVerifier for AcceptAnyServerCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        vec![
            rustls::SignatureScheme::RSA_PKCS1_SHA256,
            rustls::SignatureScheme::RSA_PSS_SHA256,
            rustls::SignatureScheme::ECDSA_NISTP256_SHA256,
            rustls::SignatureScheme::ECDSA_NISTP384_SHA384,
            rustls::SignatureScheme::ED25519,
        ]
    }
}
