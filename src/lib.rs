//! pkictl - Lifecycle management for PKI server instances
//!
//! This library manages named, versioned instances of a certificate
//! authority server product running atop a servlet container:
//!
//! - Creating, loading, and removing instances and their on-disk registry
//! - Tracking externally-supplied certificates bound to security tokens
//! - Requesting, creating, importing, deleting, and verifying the
//!   certificates of an instance against its NSS database
//! - Renewing certificates against a remote CA with password or
//!   client-certificate authentication
//! - Migrating AJP connector secrets between container versions
//!
//! The security module and the signing tools are external collaborators
//! behind the [`SecurityModule`] and [`SigningBackend`] traits; the
//! default [`NssTools`] adapter shells out to the `pki` CLI. Concurrent
//! runs against the same instance are not locked out; last writer wins.
//!
//! # Examples
//!
//! ## Deleting a subsystem certificate
//!
//! ```no_run
//! use pkictl::{CertId, CertManager, Instance, NssTools};
//!
//! fn main() -> pkictl::Result<()> {
//!     let mut instance = Instance::new("pki-tomcat");
//!     instance.load()?;
//!
//!     let tools = NssTools::open(&instance)?;
//!     let manager = CertManager::new(&instance, &tools, &tools);
//!
//!     let cert_id: CertId = "ca_audit_signing".parse()?;
//!     manager.delete_cert(&cert_id, false)?;
//!     Ok(())
//! }
//! ```
//!
//! ## Renewing a certificate against the CA
//!
//! ```no_run
//! use pkictl::{CertManager, CreateCertOptions, Instance, NssTools, RenewalOptions, RestConnector};
//!
//! fn main() -> pkictl::Result<()> {
//!     let mut instance = Instance::new("pki-tomcat");
//!     instance.load()?;
//!
//!     let tools = NssTools::open(&instance)?;
//!     let manager = CertManager::new(&instance, &tools, &tools);
//!
//!     let options = CreateCertOptions {
//!         cert_id: Some("sslserver".parse()?),
//!         renew: true,
//!         auth: RenewalOptions {
//!             username: Some("caadmin".to_string()),
//!             password: Some("Secret.123".to_string()),
//!             ..Default::default()
//!         },
//!         ..Default::default()
//!     };
//!
//!     let connector = RestConnector::from_url("https://ca.example.com:8443", None)?;
//!     manager.create_cert(&options, &connector)?;
//!     Ok(())
//! }
//! ```
//!
//! ## Registering an external certificate
//!
//! ```no_run
//! use pkictl::Instance;
//!
//! fn main() -> pkictl::Result<()> {
//!     let mut instance = Instance::new("pki-tomcat");
//!     instance.load()?;
//!
//!     instance.add_external_cert("ldap-cert", Some("HSM"));
//!     instance.store_external_certs()?;
//!     Ok(())
//! }
//! ```

pub mod error;
pub mod external_certs;
pub mod instance;
pub mod lifecycle;
pub mod nssdb;
pub mod server_xml;
pub mod subsystem;
pub mod transport;
pub mod types;

#[cfg(feature = "cli")]
pub mod cli;

pub use error::{Error, Result};

pub use instance::{instances, Instance, Layout};
pub use lifecycle::{CertManager, CreateCertOptions};
pub use nssdb::{NssTools, SecurityModule, SigningBackend};
pub use subsystem::Subsystem;
pub use transport::{CaConnection, CaConnector, RenewalAuth, RenewalOptions, RestConnector};
pub use types::{
    normalize_token, CertId, CertInfo, CertRecord, ContainerVersion, ExternalCert,
};
