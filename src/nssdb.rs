//! Security-module (NSS database) boundary.
//!
//! The traits describe the operations the lifecycle layer needs; the
//! [`NssTools`] adapter implements them by shelling out to the `pki` CLI.
//! Every command line is assembled and executed through one funnel so the
//! argument handling stays in a single, testable place.

use crate::error::{Error, Result};
use crate::instance::Instance;
use crate::types::CertInfo;
use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

/// Parameters for a certificate signing request.
#[derive(Debug, Clone)]
pub struct CsrSpec {
    pub token: Option<String>,
    pub subject: String,
    pub csr_file: PathBuf,
    pub ext_conf: Option<PathBuf>,
}

/// Parameters for issuing a permanent certificate from a staged CSR.
#[derive(Debug, Clone)]
pub struct IssueSpec {
    pub token: Option<String>,
    pub csr_file: PathBuf,
    pub cert_file: PathBuf,
    pub issuer: Option<String>,
    pub ext_conf: Option<PathBuf>,
}

/// Parameters for a short-lived temporary certificate that reuses an
/// existing serial number.
#[derive(Debug, Clone)]
pub struct TempCertSpec {
    pub signing_nickname: String,
    pub token: Option<String>,
    pub serial: String,
    pub validity_days: u32,
    pub cert_file: PathBuf,
}

/// Parameters for importing a PKCS #12 bundle into a token.
#[derive(Debug, Clone)]
pub struct Pkcs12Import {
    pub token: Option<String>,
    pub pkcs12_file: PathBuf,
    pub pkcs12_password_file: PathBuf,
    pub db_password_file: PathBuf,
    pub nickname: String,
    pub append: bool,
}

/// Certificate and key storage operations.
pub trait SecurityModule {
    fn get_cert(&self, nickname: &str, token: Option<&str>) -> Result<Option<CertInfo>>;

    fn add_cert(
        &self,
        nickname: &str,
        token: Option<&str>,
        cert_file: &Path,
        trust_attributes: Option<&str>,
    ) -> Result<()>;

    fn remove_cert(&self, nickname: &str, token: Option<&str>, remove_key: bool) -> Result<()>;

    fn verify_cert(&self, cert_data: &[u8]) -> Result<()>;

    fn import_pkcs12(&self, import: &Pkcs12Import) -> Result<()>;
}

/// Signing operations delegated to the local security module.
pub trait SigningBackend {
    fn request_csr(&self, spec: &CsrSpec) -> Result<()>;

    fn issue_cert(&self, spec: &IssueSpec) -> Result<()>;

    fn create_temp_cert(&self, spec: &TempCertSpec) -> Result<()>;
}

/// Handle on an NSS database, held for the duration of one logical
/// operation. Dropping it removes the private scratch directory used for
/// staged files.
pub struct NssTools {
    nssdb_dir: PathBuf,
    password_conf: PathBuf,
    run_as: Option<String>,
    scratch: TempDir,
}

impl NssTools {
    /// Open the security module of an instance. Commands run as the
    /// instance user.
    pub fn open(instance: &Instance) -> Result<Self> {
        Ok(Self {
            nssdb_dir: instance.nssdb_dir(),
            password_conf: instance.password_conf(),
            run_as: Some(instance.user.clone()),
            scratch: TempDir::new()?,
        })
    }

    /// Open an arbitrary database, e.g. a client database, as the current
    /// user.
    pub fn open_at(nssdb_dir: impl Into<PathBuf>, password_conf: impl Into<PathBuf>) -> Result<Self> {
        Ok(Self {
            nssdb_dir: nssdb_dir.into(),
            password_conf: password_conf.into(),
            run_as: None,
            scratch: TempDir::new()?,
        })
    }

    /// Scratch directory owned by this handle; removed when the handle is
    /// dropped.
    pub fn scratch_dir(&self) -> &Path {
        self.scratch.path()
    }

    fn argv(&self, token: Option<&str>) -> Vec<OsString> {
        let mut argv = Vec::new();

        if let Some(user) = &self.run_as {
            argv.push(OsString::from("runuser"));
            argv.push(OsString::from("-u"));
            argv.push(OsString::from(user));
            argv.push(OsString::from("--"));
        }

        argv.push(OsString::from("pki"));
        argv.push(OsString::from("-d"));
        argv.push(self.nssdb_dir.clone().into_os_string());
        argv.push(OsString::from("-f"));
        argv.push(self.password_conf.clone().into_os_string());

        if let Some(token) = token {
            argv.push(OsString::from("--token"));
            argv.push(OsString::from(token));
        }

        argv
    }
}

impl SecurityModule for NssTools {
    fn get_cert(&self, nickname: &str, token: Option<&str>) -> Result<Option<CertInfo>> {
        let mut argv = self.argv(token);
        argv.push(OsString::from("nss-cert-export"));
        argv.push(OsString::from(nickname));

        match run_capture(argv)? {
            Some(pem) => Ok(Some(CertInfo::from_pem(&pem)?)),
            None => Ok(None),
        }
    }

    fn add_cert(
        &self,
        nickname: &str,
        token: Option<&str>,
        cert_file: &Path,
        trust_attributes: Option<&str>,
    ) -> Result<()> {
        let mut argv = self.argv(token);
        argv.push(OsString::from("nss-cert-import"));
        argv.push(OsString::from("--cert"));
        argv.push(cert_file.as_os_str().to_os_string());
        if let Some(trust) = trust_attributes {
            argv.push(OsString::from("--trust"));
            argv.push(OsString::from(trust));
        }
        argv.push(OsString::from(nickname));

        run(argv)
    }

    fn remove_cert(&self, nickname: &str, token: Option<&str>, remove_key: bool) -> Result<()> {
        let mut argv = self.argv(token);
        argv.push(OsString::from("nss-cert-del"));
        if remove_key {
            argv.push(OsString::from("--remove-key"));
        }
        argv.push(OsString::from(nickname));

        run(argv)
    }

    fn verify_cert(&self, cert_data: &[u8]) -> Result<()> {
        let cert_file = self.scratch.path().join("verify.crt");
        fs::write(&cert_file, cert_data)?;

        let mut argv = self.argv(None);
        argv.push(OsString::from("nss-cert-verify"));
        argv.push(OsString::from("--cert"));
        argv.push(cert_file.into_os_string());

        run(argv)
    }

    fn import_pkcs12(&self, import: &Pkcs12Import) -> Result<()> {
        // PKCS #12 import authenticates with an explicit password file
        // rather than the instance password configuration.
        let mut argv = Vec::new();
        if let Some(user) = &self.run_as {
            argv.push(OsString::from("runuser"));
            argv.push(OsString::from("-u"));
            argv.push(OsString::from(user));
            argv.push(OsString::from("--"));
        }
        argv.push(OsString::from("pki"));
        argv.push(OsString::from("-d"));
        argv.push(self.nssdb_dir.clone().into_os_string());
        argv.push(OsString::from("-C"));
        argv.push(import.db_password_file.clone().into_os_string());
        if let Some(token) = &import.token {
            argv.push(OsString::from("--token"));
            argv.push(OsString::from(token));
        }
        argv.push(OsString::from("pkcs12-cert-import"));
        argv.push(OsString::from("--pkcs12-file"));
        argv.push(import.pkcs12_file.clone().into_os_string());
        argv.push(OsString::from("--pkcs12-password-file"));
        argv.push(import.pkcs12_password_file.clone().into_os_string());
        if import.append {
            argv.push(OsString::from("--append"));
        }
        argv.push(OsString::from(&import.nickname));

        run(argv)
    }
}

impl SigningBackend for NssTools {
    fn request_csr(&self, spec: &CsrSpec) -> Result<()> {
        let mut argv = self.argv(spec.token.as_deref());
        argv.push(OsString::from("nss-cert-request"));
        argv.push(OsString::from("--subject"));
        argv.push(OsString::from(&spec.subject));
        argv.push(OsString::from("--csr"));
        argv.push(spec.csr_file.clone().into_os_string());
        if let Some(ext) = &spec.ext_conf {
            argv.push(OsString::from("--ext"));
            argv.push(ext.clone().into_os_string());
        }

        run(argv)
    }

    fn issue_cert(&self, spec: &IssueSpec) -> Result<()> {
        let mut argv = self.argv(spec.token.as_deref());
        argv.push(OsString::from("nss-cert-issue"));
        argv.push(OsString::from("--csr"));
        argv.push(spec.csr_file.clone().into_os_string());
        argv.push(OsString::from("--cert"));
        argv.push(spec.cert_file.clone().into_os_string());
        if let Some(issuer) = &spec.issuer {
            argv.push(OsString::from("--issuer"));
            argv.push(OsString::from(issuer));
        }
        if let Some(ext) = &spec.ext_conf {
            argv.push(OsString::from("--ext"));
            argv.push(ext.clone().into_os_string());
        }

        run(argv)
    }

    fn create_temp_cert(&self, spec: &TempCertSpec) -> Result<()> {
        let mut argv = self.argv(spec.token.as_deref());
        argv.push(OsString::from("nss-cert-issue"));
        argv.push(OsString::from("--issuer"));
        argv.push(OsString::from(&spec.signing_nickname));
        argv.push(OsString::from("--serial"));
        argv.push(OsString::from(&spec.serial));
        argv.push(OsString::from("--validity-days"));
        argv.push(OsString::from(spec.validity_days.to_string()));
        argv.push(OsString::from("--cert"));
        argv.push(spec.cert_file.clone().into_os_string());

        run(argv)
    }
}

/// Export a client certificate and key from a client database to a PEM
/// file, for use as TLS client credentials.
pub(crate) fn export_client_cert(
    client_db: &Path,
    db_password_file: &Path,
    nickname: &str,
    output: &Path,
) -> Result<()> {
    let argv = vec![
        OsString::from("pki"),
        OsString::from("-d"),
        client_db.as_os_str().to_os_string(),
        OsString::from("-C"),
        db_password_file.as_os_str().to_os_string(),
        OsString::from("client-cert-show"),
        OsString::from(nickname),
        OsString::from("--client-cert"),
        output.as_os_str().to_os_string(),
    ];

    run(argv)
}

fn describe(argv: &[OsString]) -> String {
    argv.iter()
        .map(|a| a.to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join(" ")
}

fn command(mut argv: Vec<OsString>) -> Command {
    // Forward the effective log level to the child tools the same way the
    // CLI surface escalates it.
    if log::log_enabled!(log::Level::Debug) {
        argv.push(OsString::from("--debug"));
    } else if log::log_enabled!(log::Level::Info) {
        argv.push(OsString::from("--verbose"));
    }

    log::debug!("Command: {}", describe(&argv));

    let mut cmd = Command::new(&argv[0]);
    cmd.args(&argv[1..]);
    cmd
}

/// Run a command, mapping a non-zero exit to an error. Never retries.
fn run(argv: Vec<OsString>) -> Result<()> {
    let description = describe(&argv);
    let status = command(argv).status()?;

    if !status.success() {
        return Err(Error::Tool {
            command: description,
            code: status.code().unwrap_or(-1),
        });
    }
    Ok(())
}

/// Run a command and capture stdout. A non-zero exit means the requested
/// object does not exist.
fn run_capture(argv: Vec<OsString>) -> Result<Option<Vec<u8>>> {
    let description = describe(&argv);
    let output = command(argv).output()?;

    if !output.status.success() {
        log::debug!(
            "Command returned {}: {}",
            output.status.code().unwrap_or(-1),
            description
        );
        return Ok(None);
    }
    Ok(Some(output.stdout))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instance::{Instance, Layout};

    fn tools() -> (tempfile::TempDir, NssTools) {
        let dir = tempfile::tempdir().unwrap();
        let layout = Layout::rooted(dir.path());
        let mut instance = Instance::with_layout("pki-tomcat", layout);
        instance.user = "pkisrv".to_string();
        let tools = NssTools::open(&instance).unwrap();
        (dir, tools)
    }

    fn strings(argv: &[OsString]) -> Vec<String> {
        argv.iter()
            .map(|a| a.to_string_lossy().into_owned())
            .collect()
    }

    #[test]
    fn test_argv_runs_as_instance_user() {
        let (_dir, tools) = tools();
        let argv = strings(&tools.argv(None));

        assert_eq!(&argv[..4], &["runuser", "-u", "pkisrv", "--"]);
        assert_eq!(argv[4], "pki");
        assert!(!argv.contains(&"--token".to_string()));
    }

    #[test]
    fn test_argv_token_selection() {
        let (_dir, tools) = tools();
        let argv = strings(&tools.argv(Some("HSM")));

        let pos = argv.iter().position(|a| a == "--token").unwrap();
        assert_eq!(argv[pos + 1], "HSM");
    }

    #[test]
    fn test_open_at_runs_as_current_user() {
        let dir = tempfile::tempdir().unwrap();
        let tools = NssTools::open_at(dir.path().join("nssdb"), dir.path().join("pw.txt")).unwrap();
        let argv = strings(&tools.argv(None));

        assert_eq!(argv[0], "pki");
    }

    #[test]
    fn test_scratch_dir_removed_on_drop() {
        let (_dir, tools) = tools();
        let scratch = tools.scratch_dir().to_path_buf();
        assert!(scratch.exists());

        drop(tools);
        assert!(!scratch.exists());
    }
}
